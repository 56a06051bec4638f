//! Central role over `btleplug`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::driver::{
    CentralDriver, DriverEvent, DriverEventSender, PendingConnect, PowerState, Role,
};
use crate::error::BleError;
use crate::protocol::{
    ScanReport, PEERLINK_NOTIFY_CHARACTERISTIC_UUID, PEERLINK_WRITE_CHARACTERISTIC_UUID,
};

type KnownDevices = Arc<RwLock<HashMap<String, Peripheral>>>;
type ConnectedDevices = Arc<RwLock<HashMap<String, ConnectedDevice>>>;

struct ConnectedDevice {
    peripheral: Peripheral,
    write_char: Characteristic,
    notifications: JoinHandle<()>,
}

/// Scans, connects and writes through the first system adapter
pub struct BtleplugCentral {
    events: DriverEventSender,
    adapter: Option<Adapter>,
    known: KnownDevices,
    connected: ConnectedDevices,
    scan_pump: Option<JoinHandle<()>>,
}

impl BtleplugCentral {
    pub fn new(events: DriverEventSender) -> Self {
        Self {
            events,
            adapter: None,
            known: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(RwLock::new(HashMap::new())),
            scan_pump: None,
        }
    }

    async fn initialize_adapter(&mut self) -> Result<Adapter, BleError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let manager = Manager::new()
            .await
            .map_err(|e| BleError::AdapterNotAvailable(format!("BLE manager: {e}")))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| BleError::AdapterNotAvailable(format!("BLE adapters: {e}")))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| BleError::AdapterNotAvailable("no BLE adapters".to_string()))?;

        info!("BLE central adapter initialized");
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }
}

/// Forward advertisement reports and disconnects into the driver stream
async fn pump_scan_events(
    adapter: Adapter,
    service: Uuid,
    allow_duplicates: bool,
    known: KnownDevices,
    events: DriverEventSender,
) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(DriverEvent::Fault {
                message: format!("Failed to get BLE events: {e}"),
            });
            return;
        }
    };

    while let Some(event) = stream.next().await {
        let (id, repeat) = match event {
            CentralEvent::DeviceDiscovered(id) => (id, false),
            CentralEvent::DeviceUpdated(id) => (id, true),
            CentralEvent::DeviceDisconnected(id) => {
                if let Ok(peripheral) = adapter.peripheral(&id).await {
                    let _ = events.send(DriverEvent::Disconnected {
                        role: Role::Central,
                        address: peripheral.address().to_string(),
                    });
                }
                continue;
            }
            _ => continue,
        };
        if repeat && !allow_duplicates {
            continue;
        }

        let Ok(peripheral) = adapter.peripheral(&id).await else {
            continue;
        };
        let Ok(Some(properties)) = peripheral.properties().await else {
            continue;
        };
        let service_data = properties.service_data.get(&service).cloned();
        if service_data.is_none() && !properties.services.contains(&service) {
            continue;
        }

        let address = properties.address.to_string();
        known.write().await.insert(address.clone(), peripheral);
        let report = ScanReport {
            address,
            local_name: properties.local_name,
            service_data,
            rssi: properties.rssi,
        };
        if events.send(DriverEvent::Discovered(report)).is_err() {
            break;
        }
    }
    debug!("BLE scan event stream ended");
}

/// Connect, discover the service and subscribe to notifications
async fn establish_link(
    address: String,
    limit: Duration,
    known: KnownDevices,
    connected: ConnectedDevices,
    events: DriverEventSender,
) -> Result<(), BleError> {
    if connected.read().await.contains_key(&address) {
        return Ok(());
    }
    let peripheral = known
        .read()
        .await
        .get(&address)
        .cloned()
        .ok_or_else(|| BleError::DeviceNotFound {
            address: address.clone(),
        })?;

    match timeout(limit, peripheral.connect()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(BleError::ConnectionFailed {
                address,
                reason: e.to_string(),
            })
        }
        Err(_) => return Err(BleError::ConnectionTimeout { address }),
    }

    if let Err(e) = peripheral.discover_services().await {
        let _ = peripheral.disconnect().await;
        return Err(BleError::ConnectionFailed {
            address,
            reason: format!("service discovery: {e}"),
        });
    }

    let characteristics = peripheral.characteristics();
    let find = |uuid: Uuid| {
        characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| BleError::CharacteristicNotFound {
                characteristic: uuid.to_string(),
            })
    };
    let write_char = find(PEERLINK_WRITE_CHARACTERISTIC_UUID)?;
    let notify_char = find(PEERLINK_NOTIFY_CHARACTERISTIC_UUID)?;

    peripheral
        .subscribe(&notify_char)
        .await
        .map_err(|e| BleError::ConnectionFailed {
            address: address.clone(),
            reason: format!("subscribe: {e}"),
        })?;
    let mut notifications =
        peripheral
            .notifications()
            .await
            .map_err(|e| BleError::ConnectionFailed {
                address: address.clone(),
                reason: format!("notification stream: {e}"),
            })?;

    let source = address.clone();
    let notifications = tokio::spawn(async move {
        while let Some(data) = notifications.next().await {
            if data.uuid != PEERLINK_NOTIFY_CHARACTERISTIC_UUID {
                continue;
            }
            let event = DriverEvent::Notification {
                address: source.clone(),
                value: data.value,
            };
            if events.send(event).is_err() {
                break;
            }
        }
        debug!("Notification handler for {} ended", source);
    });

    info!("Connected to BLE device {}", address);
    connected.write().await.insert(
        address,
        ConnectedDevice {
            peripheral,
            write_char,
            notifications,
        },
    );
    Ok(())
}

#[async_trait]
impl CentralDriver for BtleplugCentral {
    async fn power_state(&mut self) -> PowerState {
        match self.initialize_adapter().await {
            Ok(_) => PowerState::PoweredOn,
            Err(e) => {
                error!("BLE central unavailable: {}", e);
                PowerState::Unsupported
            }
        }
    }

    async fn start_scan(&mut self, service: Uuid, allow_duplicates: bool) -> Result<(), BleError> {
        let adapter = self.initialize_adapter().await?;
        adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(|e| BleError::ScanFailed(e.to_string()))?;

        if let Some(pump) = self.scan_pump.take() {
            pump.abort();
        }
        self.scan_pump = Some(tokio::spawn(pump_scan_events(
            adapter,
            service,
            allow_duplicates,
            self.known.clone(),
            self.events.clone(),
        )));
        info!("Started BLE scanning for {}", service);
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), BleError> {
        if let Some(pump) = self.scan_pump.take() {
            pump.abort();
        }
        if let Some(adapter) = &self.adapter {
            adapter
                .stop_scan()
                .await
                .map_err(|e| BleError::ScanFailed(format!("stop: {e}")))?;
        }
        Ok(())
    }

    fn connect(&mut self, address: &str, limit: Duration) -> PendingConnect {
        Box::pin(establish_link(
            address.to_string(),
            limit,
            self.known.clone(),
            self.connected.clone(),
            self.events.clone(),
        ))
    }

    async fn write(&mut self, address: &str, value: &[u8]) -> Result<(), BleError> {
        let connected = self.connected.read().await;
        let device = connected
            .get(address)
            .ok_or_else(|| BleError::NotConnected {
                address: address.to_string(),
            })?;
        device
            .peripheral
            .write(&device.write_char, value, WriteType::WithoutResponse)
            .await
            .map_err(|e| BleError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&mut self, address: &str) -> Result<(), BleError> {
        let device = self.connected.write().await.remove(address);
        if let Some(device) = device {
            device.notifications.abort();
            device
                .peripheral
                .disconnect()
                .await
                .map_err(|e| BleError::ConnectionFailed {
                    address: address.to_string(),
                    reason: format!("disconnect: {e}"),
                })?;
            info!("Disconnected from BLE device {}", address);
        }
        Ok(())
    }
}
