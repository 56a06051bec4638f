//! Virtual BLE radios
//!
//! A device has one address shared by both roles. Scanners see the
//! advertisements of powered peripherals carrying the scanned service; a
//! central connecting to a peripheral also subscribes to its notify
//! characteristic, which the peripheral observes as `Subscribed`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use peerlink_ble::{
    Advertisement, BleDriverProvider, BleDrivers, BleError, CentralDriver, DriverEvent,
    DriverEventSender, PendingConnect, PeripheralDriver, PowerState, Role, ScanReport,
};
use peerlink_core::BackendKind;

use crate::air::VirtualAir;

// ----------------------------------------------------------------------------
// Medium State
// ----------------------------------------------------------------------------

struct BleDevice {
    events: Option<DriverEventSender>,
    power: PowerState,
    reachable: bool,
    rssi: i16,
    scanning: Option<Uuid>,
    advertisement: Option<Advertisement>,
    /// Peripherals this device is connected to as a central
    central_links: HashSet<String>,
    /// Centrals subscribed to this device's notify characteristic
    subscribers: HashSet<String>,
}

impl BleDevice {
    fn emit(&self, event: DriverEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn report(&self, address: &str) -> Option<ScanReport> {
        let advertisement = self.advertisement.as_ref()?;
        Some(ScanReport {
            address: address.to_string(),
            local_name: Some(advertisement.local_name.clone()),
            service_data: Some(advertisement.service_data.clone()),
            rssi: Some(self.rssi),
        })
    }
}

#[derive(Default)]
pub(crate) struct BleAir {
    devices: HashMap<String, BleDevice>,
}

impl BleAir {
    pub(crate) fn len(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, address: &str) -> Result<&BleDevice, BleError> {
        self.devices
            .get(address)
            .ok_or_else(|| BleError::AdapterNotAvailable(format!("no virtual radio {address}")))
    }

    fn device_mut(&mut self, address: &str) -> Result<&mut BleDevice, BleError> {
        self.devices
            .get_mut(address)
            .ok_or_else(|| BleError::AdapterNotAvailable(format!("no virtual radio {address}")))
    }

    /// Register a device, or re-attach it with a fresh event channel
    fn attach(&mut self, address: &str, events: DriverEventSender) -> PowerState {
        let rssi = -40 - (self.devices.len() as i16 % 40);
        let device = self
            .devices
            .entry(address.to_string())
            .or_insert_with(|| BleDevice {
                events: None,
                power: PowerState::PoweredOn,
                reachable: true,
                rssi,
                scanning: None,
                advertisement: None,
                central_links: HashSet::new(),
                subscribers: HashSet::new(),
            });
        device.events = Some(events);
        device.scanning = None;
        device.advertisement = None;
        device.power
    }

    fn power(&self, address: &str) -> PowerState {
        self.devices
            .get(address)
            .map_or(PowerState::Unsupported, |device| device.power)
    }

    pub(crate) fn set_power(&mut self, address: &str, power: PowerState) {
        let Some(device) = self.devices.get_mut(address) else {
            return;
        };
        device.power = power;
        info!(%address, %power, "Virtual BLE radio power changed");
        if !power.is_on() {
            device.scanning = None;
            device.advertisement = None;
        }
        for role in [Role::Central, Role::Peripheral] {
            device.emit(DriverEvent::PowerChanged { role, state: power });
        }
        if !power.is_on() {
            self.drop_links(address);
        }
    }

    pub(crate) fn set_reachable(&mut self, address: &str, reachable: bool) {
        if let Some(device) = self.devices.get_mut(address) {
            device.reachable = reachable;
        }
    }

    // ------------------------------------------------------------------------
    // Central Role
    // ------------------------------------------------------------------------

    fn start_scan(&mut self, address: &str, service: Uuid) -> Result<(), BleError> {
        let device = self.device_mut(address)?;
        if !device.power.is_on() {
            return Err(BleError::PoweredOff);
        }
        device.scanning = Some(service);
        let reports: Vec<ScanReport> = self
            .devices
            .iter()
            .filter(|(other, device)| {
                other.as_str() != address
                    && device.power.is_on()
                    && device
                        .advertisement
                        .as_ref()
                        .is_some_and(|advert| advert.service_uuid == service)
            })
            .filter_map(|(other, device)| device.report(other))
            .collect();
        let device = self.device(address)?;
        for report in reports {
            device.emit(DriverEvent::Discovered(report));
        }
        Ok(())
    }

    fn stop_scan(&mut self, address: &str) {
        if let Some(device) = self.devices.get_mut(address) {
            device.scanning = None;
        }
    }

    fn connect(&mut self, address: &str, target: &str) -> Result<(), BleError> {
        if !self.device(address)?.power.is_on() {
            return Err(BleError::PoweredOff);
        }
        let peer = self
            .devices
            .get_mut(target)
            .filter(|peer| peer.advertisement.is_some())
            .ok_or_else(|| BleError::DeviceNotFound {
                address: target.to_string(),
            })?;
        if !peer.reachable || !peer.power.is_on() {
            return Err(BleError::ConnectionFailed {
                address: target.to_string(),
                reason: "peripheral did not answer".into(),
            });
        }
        peer.subscribers.insert(address.to_string());
        peer.emit(DriverEvent::Subscribed {
            address: address.to_string(),
        });
        self.device_mut(address)?
            .central_links
            .insert(target.to_string());
        debug!(central = address, peripheral = target, "Virtual BLE link established");
        Ok(())
    }

    fn write(&self, address: &str, target: &str, value: &[u8]) -> Result<(), BleError> {
        if !self.device(address)?.central_links.contains(target) {
            return Err(BleError::NotConnected {
                address: target.to_string(),
            });
        }
        self.device(target)?.emit(DriverEvent::WriteReceived {
            address: address.to_string(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn disconnect(&mut self, address: &str, target: &str) {
        let linked = self
            .devices
            .get_mut(address)
            .is_some_and(|device| device.central_links.remove(target));
        if !linked {
            return;
        }
        if let Some(peer) = self.devices.get_mut(target) {
            peer.subscribers.remove(address);
            peer.emit(DriverEvent::Unsubscribed {
                address: address.to_string(),
            });
        }
    }

    // ------------------------------------------------------------------------
    // Peripheral Role
    // ------------------------------------------------------------------------

    fn start_advertising(&mut self, address: &str, advertisement: &Advertisement) -> Result<(), BleError> {
        let device = self.device_mut(address)?;
        if !device.power.is_on() {
            return Err(BleError::PoweredOff);
        }
        device.advertisement = Some(advertisement.clone());
        let Some(report) = device.report(address) else {
            return Ok(());
        };
        for (other, device) in &self.devices {
            if other != address
                && device.power.is_on()
                && device.scanning == Some(advertisement.service_uuid)
            {
                device.emit(DriverEvent::Discovered(report.clone()));
            }
        }
        Ok(())
    }

    fn stop_advertising(&mut self, address: &str) {
        if let Some(device) = self.devices.get_mut(address) {
            device.advertisement = None;
        }
    }

    fn notify(&self, address: &str, target: &str, value: &[u8]) -> Result<(), BleError> {
        if !self.device(address)?.subscribers.contains(target) {
            return Err(BleError::NotConnected {
                address: target.to_string(),
            });
        }
        self.device(target)?.emit(DriverEvent::Notification {
            address: address.to_string(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Close the GATT server: subscribed centrals see the link drop
    fn close(&mut self, address: &str) {
        let Some(device) = self.devices.get_mut(address) else {
            return;
        };
        device.advertisement = None;
        let subscribers: Vec<String> = device.subscribers.drain().collect();
        for central in subscribers {
            if let Some(peer) = self.devices.get_mut(&central) {
                peer.central_links.remove(address);
                peer.emit(DriverEvent::Disconnected {
                    role: Role::Central,
                    address: address.to_string(),
                });
            }
        }
    }

    /// Tear down both roles' links, telling the other ends
    fn drop_links(&mut self, address: &str) {
        let links: Vec<String> = self
            .devices
            .get_mut(address)
            .map(|device| device.central_links.drain().collect())
            .unwrap_or_default();
        for target in links {
            if let Some(peer) = self.devices.get_mut(&target) {
                peer.subscribers.remove(address);
                peer.emit(DriverEvent::Unsubscribed {
                    address: address.to_string(),
                });
            }
        }
        self.close(address);
    }
}

// ----------------------------------------------------------------------------
// Driver Provider
// ----------------------------------------------------------------------------

/// One simulated BLE adapter
#[derive(Debug, Clone)]
pub struct VirtualBleRadio {
    air: VirtualAir,
    address: String,
    supports_peripheral: bool,
}

impl VirtualBleRadio {
    pub(crate) fn new(air: VirtualAir, address: String) -> Self {
        Self {
            air,
            address,
            supports_peripheral: true,
        }
    }

    /// Simulate an adapter that can only scan and connect
    pub fn central_only(mut self) -> Self {
        self.supports_peripheral = false;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl BleDriverProvider for VirtualBleRadio {
    fn is_available(&self) -> bool {
        self.air.is_available(BackendKind::Ble)
    }

    fn supports_peripheral(&self) -> bool {
        self.supports_peripheral
    }

    fn open(&self) -> Result<BleDrivers, BleError> {
        if !self.is_available() {
            return Err(BleError::AdapterNotAvailable(
                "virtual BLE is switched off".into(),
            ));
        }
        let (tx, events) = mpsc::unbounded_channel();
        let power = self.air.lock().ble.attach(&self.address, tx);
        debug!(address = %self.address, %power, "Virtual BLE radio opened");

        let peripheral: Option<Box<dyn PeripheralDriver>> = if self.supports_peripheral {
            Some(Box::new(VirtualPeripheral {
                air: self.air.clone(),
                address: self.address.clone(),
            }))
        } else {
            None
        };
        Ok(BleDrivers {
            central: Box::new(VirtualCentral {
                air: self.air.clone(),
                address: self.address.clone(),
            }),
            peripheral,
            events,
            device_id: self.address.replace(':', "").to_uppercase(),
        })
    }
}

// ----------------------------------------------------------------------------
// Drivers
// ----------------------------------------------------------------------------

pub struct VirtualCentral {
    air: VirtualAir,
    address: String,
}

#[async_trait]
impl CentralDriver for VirtualCentral {
    async fn power_state(&mut self) -> PowerState {
        self.air.lock().ble.power(&self.address)
    }

    async fn start_scan(&mut self, service: Uuid, _allow_duplicates: bool) -> Result<(), BleError> {
        self.air.lock().ble.start_scan(&self.address, service)
    }

    async fn stop_scan(&mut self) -> Result<(), BleError> {
        self.air.lock().ble.stop_scan(&self.address);
        Ok(())
    }

    fn connect(&mut self, address: &str, timeout: Duration) -> PendingConnect {
        debug!(%address, ?timeout, "Virtual BLE connect");
        let air = self.air.clone();
        let central = self.address.clone();
        let target = address.to_string();
        Box::pin(async move { air.lock().ble.connect(&central, &target) })
    }

    async fn write(&mut self, address: &str, value: &[u8]) -> Result<(), BleError> {
        self.air.lock().ble.write(&self.address, address, value)
    }

    async fn disconnect(&mut self, address: &str) -> Result<(), BleError> {
        self.air.lock().ble.disconnect(&self.address, address);
        Ok(())
    }
}

impl Drop for VirtualCentral {
    fn drop(&mut self) {
        self.air.lock().ble.stop_scan(&self.address);
    }
}

pub struct VirtualPeripheral {
    air: VirtualAir,
    address: String,
}

#[async_trait]
impl PeripheralDriver for VirtualPeripheral {
    async fn power_state(&mut self) -> PowerState {
        self.air.lock().ble.power(&self.address)
    }

    async fn start_advertising(&mut self, advertisement: &Advertisement) -> Result<(), BleError> {
        self.air
            .lock()
            .ble
            .start_advertising(&self.address, advertisement)
    }

    async fn stop_advertising(&mut self) -> Result<(), BleError> {
        self.air.lock().ble.stop_advertising(&self.address);
        Ok(())
    }

    async fn notify(&mut self, address: &str, value: &[u8]) -> Result<(), BleError> {
        self.air.lock().ble.notify(&self.address, address, value)
    }

    async fn close(&mut self) -> Result<(), BleError> {
        self.air.lock().ble.close(&self.address);
        Ok(())
    }
}
