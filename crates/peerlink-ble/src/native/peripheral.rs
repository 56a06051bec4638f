//! Peripheral role over `bluer` (BlueZ)

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use bluer::adv::{Advertisement as BluerAdvertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod, Service,
};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::driver::{DriverEvent, DriverEventSender, PeripheralDriver, PowerState};
use crate::error::BleError;
use crate::protocol::{
    Advertisement, PEERLINK_NOTIFY_CHARACTERISTIC_UUID, PEERLINK_WRITE_CHARACTERISTIC_UUID,
};

type Notifiers = Arc<Mutex<Vec<CharacteristicNotifier>>>;

/// GATT server and advertiser on the default BlueZ adapter
pub struct BluerPeripheral {
    events: DriverEventSender,
    session: Option<bluer::Session>,
    adapter: Option<bluer::Adapter>,
    application: Option<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
    notifiers: Notifiers,
}

impl BluerPeripheral {
    pub fn new(events: DriverEventSender) -> Self {
        Self {
            events,
            session: None,
            adapter: None,
            application: None,
            advertisement: None,
            notifiers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn initialize(&mut self) -> Result<bluer::Adapter, BleError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let session = bluer::Session::new()
            .await
            .map_err(|e| BleError::AdapterNotAvailable(format!("BlueZ session: {e}")))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| BleError::AdapterNotAvailable(format!("BLE adapter: {e}")))?;

        self.session = Some(session);
        self.adapter = Some(adapter.clone());
        info!("BlueZ adapter initialized for peripheral role");
        Ok(adapter)
    }

    /// Register the write and notify characteristics once per session
    async fn serve_gatt(&mut self, adapter: &bluer::Adapter, service: Uuid) -> Result<(), BleError> {
        if self.application.is_some() {
            return Ok(());
        }

        let writes = self.events.clone();
        let notifiers = self.notifiers.clone();
        let application = Application {
            services: vec![Service {
                uuid: service,
                primary: true,
                characteristics: vec![
                    Characteristic {
                        uuid: PEERLINK_WRITE_CHARACTERISTIC_UUID,
                        write: Some(CharacteristicWrite {
                            write: true,
                            write_without_response: true,
                            method: CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
                                let writes = writes.clone();
                                Box::pin(async move {
                                    let _ = writes.send(DriverEvent::WriteReceived {
                                        address: request.device_address.to_string(),
                                        value,
                                    });
                                    Ok(())
                                })
                            })),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: PEERLINK_NOTIFY_CHARACTERISTIC_UUID,
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                                let notifiers = notifiers.clone();
                                Box::pin(async move {
                                    debug!("Central subscribed to notify characteristic");
                                    notifiers.lock().await.push(notifier);
                                })
                            })),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };

        let handle = adapter
            .serve_gatt_application(application)
            .await
            .map_err(|e| BleError::AdvertisingFailed(format!("GATT registration: {e}")))?;
        self.application = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl PeripheralDriver for BluerPeripheral {
    async fn power_state(&mut self) -> PowerState {
        let adapter = match self.initialize().await {
            Ok(adapter) => adapter,
            Err(_) => return PowerState::Unsupported,
        };
        match adapter.is_powered().await {
            Ok(true) => PowerState::PoweredOn,
            Ok(false) => PowerState::PoweredOff,
            Err(_) => PowerState::Unknown,
        }
    }

    async fn start_advertising(&mut self, advertisement: &Advertisement) -> Result<(), BleError> {
        let adapter = self.initialize().await?;
        self.serve_gatt(&adapter, advertisement.service_uuid).await?;

        // Dropping the handle withdraws the previous advertisement
        self.advertisement = None;

        let mut service_data = BTreeMap::new();
        service_data.insert(advertisement.service_uuid, advertisement.service_data.clone());
        let native = BluerAdvertisement {
            advertisement_type: Type::Peripheral,
            service_uuids: BTreeSet::from([advertisement.service_uuid]),
            service_data,
            local_name: Some(advertisement.local_name.clone()),
            discoverable: Some(true),
            ..Default::default()
        };

        let handle = adapter
            .advertise(native)
            .await
            .map_err(|e| BleError::AdvertisingFailed(e.to_string()))?;
        self.advertisement = Some(handle);
        info!("Started BLE advertising as '{}'", advertisement.local_name);
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<(), BleError> {
        if self.advertisement.take().is_some() {
            info!("Stopped BLE advertising");
        }
        Ok(())
    }

    // TODO: switch the notify characteristic to CharacteristicNotifyMethod::Io so a
    // notification reaches only the addressed central.
    async fn notify(&mut self, address: &str, value: &[u8]) -> Result<(), BleError> {
        let mut notifiers = self.notifiers.lock().await;
        notifiers.retain(|notifier| !notifier.is_stopped());
        if notifiers.is_empty() {
            return Err(BleError::NotConnected {
                address: address.to_string(),
            });
        }
        for notifier in notifiers.iter_mut() {
            notifier
                .notify(value.to_vec())
                .await
                .map_err(|e| BleError::WriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BleError> {
        self.advertisement = None;
        self.notifiers.lock().await.clear();
        self.application = None;
        self.adapter = None;
        self.session = None;
        Ok(())
    }
}
