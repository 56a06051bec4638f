//! Radio driver seams
//!
//! The backend never talks to a Bluetooth stack directly. A
//! [`BleDriverProvider`] opens one central driver, an optional peripheral
//! driver and the event stream both of them feed.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::BleError;
use crate::protocol::{Advertisement, ScanReport};

// ----------------------------------------------------------------------------
// Driver Events
// ----------------------------------------------------------------------------

/// Radio power as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Unknown,
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

impl PowerState {
    pub fn is_on(self) -> bool {
        self == PowerState::PoweredOn
    }

    /// States that will not change without user action
    pub fn is_terminal(self) -> bool {
        matches!(self, PowerState::Unauthorized | PowerState::Unsupported)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PowerState::Unknown => "unknown",
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Unauthorized => "unauthorized",
            PowerState::Unsupported => "unsupported",
        };
        f.write_str(text)
    }
}

/// Which side of the radio an event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// We scanned and connected out
    Central,
    /// A remote central connected to our GATT server
    Peripheral,
}

/// Native callbacks, normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    PowerChanged { role: Role, state: PowerState },
    Discovered(ScanReport),
    DeviceLost { address: String },
    /// Link torn down by the remote side or the stack
    Disconnected { role: Role, address: String },
    /// Notification received from a peripheral we are connected to
    Notification { address: String, value: Vec<u8> },
    /// A remote central subscribed to our notify characteristic
    Subscribed { address: String },
    Unsubscribed { address: String },
    /// A remote central wrote to our write characteristic
    WriteReceived { address: String, value: Vec<u8> },
    Fault { message: String },
}

pub type DriverEventSender = mpsc::UnboundedSender<DriverEvent>;
pub type DriverEventReceiver = mpsc::UnboundedReceiver<DriverEvent>;

/// Outbound link setup; owns everything it needs so it can run off the radio task
pub type PendingConnect = Pin<Box<dyn Future<Output = Result<(), BleError>> + Send + 'static>>;

// ----------------------------------------------------------------------------
// Driver Traits
// ----------------------------------------------------------------------------

/// Scanning and outbound connections
#[async_trait]
pub trait CentralDriver: Send {
    async fn power_state(&mut self) -> PowerState;

    async fn start_scan(&mut self, service: Uuid, allow_duplicates: bool) -> Result<(), BleError>;

    async fn stop_scan(&mut self) -> Result<(), BleError>;

    /// Connect, discover the service and subscribe to its notify characteristic.
    /// The returned future must not borrow the driver: other radio work goes on
    /// while it runs
    fn connect(&mut self, address: &str, timeout: Duration) -> PendingConnect;

    /// Write without response
    async fn write(&mut self, address: &str, value: &[u8]) -> Result<(), BleError>;

    async fn disconnect(&mut self, address: &str) -> Result<(), BleError>;
}

/// GATT server and advertising
#[async_trait]
pub trait PeripheralDriver: Send {
    async fn power_state(&mut self) -> PowerState;

    /// Replace any running advertisement
    async fn start_advertising(&mut self, advertisement: &Advertisement) -> Result<(), BleError>;

    async fn stop_advertising(&mut self) -> Result<(), BleError>;

    /// Notify one subscribed central
    async fn notify(&mut self, address: &str, value: &[u8]) -> Result<(), BleError>;

    /// Drop every subscriber and unregister the GATT service
    async fn close(&mut self) -> Result<(), BleError>;
}

// ----------------------------------------------------------------------------
// Driver Provider
// ----------------------------------------------------------------------------

/// Drivers for one backend session
pub struct BleDrivers {
    pub central: Box<dyn CentralDriver>,
    pub peripheral: Option<Box<dyn PeripheralDriver>>,
    pub events: DriverEventReceiver,
    /// Identifier of the local device, truncated into advertisements
    pub device_id: String,
}

impl fmt::Debug for BleDrivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleDrivers")
            .field("peripheral", &self.peripheral.is_some())
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Opens radio drivers; implemented by the native stack and the virtual medium
pub trait BleDriverProvider: Send + Sync {
    /// Whether a Bluetooth adapter is present
    fn is_available(&self) -> bool;

    fn supports_peripheral(&self) -> bool;

    /// Open drivers; adapters may finish initializing lazily on first use
    fn open(&self) -> Result<BleDrivers, BleError>;
}
