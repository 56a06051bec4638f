//! Bluetooth Low Energy backend for peerlink
//!
//! Runs the central role (scan, connect, write) and the peripheral role
//! (advertise, accept writes, notify) at the same time and merges both into
//! one peer space keyed by device address.
//!
//! ## Modules
//!
//! - [`config`] - backend configuration
//! - [`protocol`] - service UUIDs and the advertisement payload
//! - [`driver`] - radio driver traits the backend runs on
//! - [`backend`] - the [`TransportBackend`](peerlink_core::TransportBackend) implementation
//!
//! Real drivers (`btleplug` for central, `bluer` for the Linux peripheral)
//! are behind the `native` feature. Without it, drivers come from elsewhere,
//! such as the virtual medium in `peerlink-harness`.

pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod factory;
#[cfg(feature = "native")]
pub mod native;
pub mod protocol;

pub use backend::{ble_capabilities, BleBackend};
pub use config::BleBackendConfig;
pub use driver::{
    BleDriverProvider, BleDrivers, CentralDriver, DriverEvent, DriverEventReceiver,
    DriverEventSender, PendingConnect, PeripheralDriver, PowerState, Role,
};
pub use error::BleError;
pub use factory::BleBackendFactory;
pub use protocol::{
    resolve_display_name, AdvertPayload, Advertisement, ScanReport,
    PEERLINK_NOTIFY_CHARACTERISTIC_UUID, PEERLINK_SERVICE_UUID,
    PEERLINK_WRITE_CHARACTERISTIC_UUID,
};
