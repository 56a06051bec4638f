//! Drivers over the platform Bluetooth stack

mod central;
#[cfg(target_os = "linux")]
mod peripheral;

pub use central::BtleplugCentral;
#[cfg(target_os = "linux")]
pub use peripheral::BluerPeripheral;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::driver::{BleDriverProvider, BleDrivers, PeripheralDriver};
use crate::error::BleError;

/// Opens `btleplug` central drivers and, on Linux, `bluer` peripherals
#[derive(Debug, Clone, Default)]
pub struct NativeDriverProvider {
    device_id: Option<String>,
}

impl NativeDriverProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the id advertised for this device instead of a random one
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

impl BleDriverProvider for NativeDriverProvider {
    fn is_available(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            std::fs::read_dir("/sys/class/bluetooth")
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false)
        }
        #[cfg(not(target_os = "linux"))]
        {
            true
        }
    }

    fn supports_peripheral(&self) -> bool {
        cfg!(target_os = "linux")
    }

    fn open(&self) -> Result<BleDrivers, BleError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let device_id = self
            .device_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string().to_uppercase());

        #[cfg(target_os = "linux")]
        let peripheral: Option<Box<dyn PeripheralDriver>> =
            Some(Box::new(BluerPeripheral::new(events_tx.clone())));
        #[cfg(not(target_os = "linux"))]
        let peripheral: Option<Box<dyn PeripheralDriver>> = None;

        Ok(BleDrivers {
            central: Box::new(BtleplugCentral::new(events_tx)),
            peripheral,
            events,
            device_id,
        })
    }
}
