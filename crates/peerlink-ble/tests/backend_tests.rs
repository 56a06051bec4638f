//! BLE backend behavior over in-memory drivers

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use peerlink_ble::{
    Advertisement, AdvertPayload, BleBackend, BleBackendConfig, BleDrivers, BleError,
    CentralDriver, DriverEvent, DriverEventSender, PendingConnect, PeripheralDriver, PowerState,
    Role, ScanReport,
};
use peerlink_core::channel::{create_backend_event_channel, BackendEventReceiver};
use peerlink_core::{
    Activity, BackendEventKind, BackendEventSink, BackendKind, Generation, LinkState, RawPeerId,
    SendTarget, ServiceId, TransportBackend,
};
use tokio::sync::mpsc;
use uuid::Uuid;

type CallLog = Arc<Mutex<Vec<String>>>;

struct FakeCentral {
    power: PowerState,
    log: CallLog,
    connect_delay: Duration,
}

#[async_trait]
impl CentralDriver for FakeCentral {
    async fn power_state(&mut self) -> PowerState {
        self.power
    }

    async fn start_scan(&mut self, _service: Uuid, _allow_duplicates: bool) -> Result<(), BleError> {
        self.log.lock().unwrap().push("start_scan".into());
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), BleError> {
        self.log.lock().unwrap().push("stop_scan".into());
        Ok(())
    }

    fn connect(&mut self, address: &str, _timeout: Duration) -> PendingConnect {
        let address = address.to_string();
        let log = self.log.clone();
        let delay = self.connect_delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            if address == "unreachable" {
                return Err(BleError::ConnectionTimeout { address });
            }
            log.lock().unwrap().push(format!("connect {address}"));
            Ok(())
        })
    }

    async fn write(&mut self, address: &str, value: &[u8]) -> Result<(), BleError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("write {address} {}", value.len()));
        Ok(())
    }

    async fn disconnect(&mut self, address: &str) -> Result<(), BleError> {
        self.log.lock().unwrap().push(format!("disconnect {address}"));
        Ok(())
    }
}

struct FakePeripheral {
    power: PowerState,
    log: CallLog,
    adverts: Arc<Mutex<Vec<Advertisement>>>,
}

#[async_trait]
impl PeripheralDriver for FakePeripheral {
    async fn power_state(&mut self) -> PowerState {
        self.power
    }

    async fn start_advertising(&mut self, advertisement: &Advertisement) -> Result<(), BleError> {
        self.adverts.lock().unwrap().push(advertisement.clone());
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<(), BleError> {
        self.log.lock().unwrap().push("stop_advertising".into());
        Ok(())
    }

    async fn notify(&mut self, address: &str, value: &[u8]) -> Result<(), BleError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("notify {address} {}", value.len()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BleError> {
        self.log.lock().unwrap().push("close".into());
        Ok(())
    }
}

struct Rig {
    backend: BleBackend,
    events: BackendEventReceiver,
    radio: DriverEventSender,
    log: CallLog,
    adverts: Arc<Mutex<Vec<Advertisement>>>,
}

fn create_rig(power: PowerState) -> Rig {
    create_rig_with_connect_delay(power, Duration::ZERO)
}

fn create_rig_with_connect_delay(power: PowerState, connect_delay: Duration) -> Rig {
    let log: CallLog = Arc::default();
    let adverts = Arc::new(Mutex::new(Vec::new()));
    let (radio, driver_events) = mpsc::unbounded_channel();
    let drivers = BleDrivers {
        central: Box::new(FakeCentral {
            power,
            log: log.clone(),
            connect_delay,
        }),
        peripheral: Some(Box::new(FakePeripheral {
            power,
            log: log.clone(),
            adverts: adverts.clone(),
        })),
        events: driver_events,
        device_id: "A1B2C3D4".into(),
    };
    let (tx, events) = create_backend_event_channel();
    let sink = BackendEventSink::new(BackendKind::Ble, Generation::default(), tx);
    let backend = BleBackend::spawn(BleBackendConfig::testing(), drivers, sink);
    Rig {
        backend,
        events,
        radio,
        log,
        adverts,
    }
}

async fn next_event(events: &mut BackendEventReceiver) -> BackendEventKind {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("timed out waiting for backend event")
        .expect("event channel closed")
        .kind
}

fn service() -> ServiceId {
    ServiceId::new("peerlink-test").unwrap()
}

#[tokio::test]
async fn test_scan_deferred_until_powered_on() {
    let mut rig = create_rig(PowerState::PoweredOff);
    rig.backend.start_discovery(&service()).await.unwrap();

    // A report while the scan is only pending is not forwarded
    rig.radio
        .send(DriverEvent::Discovered(ScanReport {
            address: "AA".into(),
            ..Default::default()
        }))
        .unwrap();
    rig.radio
        .send(DriverEvent::PowerChanged {
            role: Role::Central,
            state: PowerState::PoweredOn,
        })
        .unwrap();

    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::ActivityStarted {
            activity: Activity::Discovery
        }
    );
    assert_eq!(rig.log.lock().unwrap().as_slice(), ["start_scan"]);
}

#[tokio::test]
async fn test_discovered_peers_carry_advertised_name() {
    let mut rig = create_rig(PowerState::PoweredOn);
    rig.backend.start_discovery(&service()).await.unwrap();
    next_event(&mut rig.events).await;

    let payload = AdvertPayload::new("F00D", "Bob", 6, 10).to_bytes().unwrap();
    rig.radio
        .send(DriverEvent::Discovered(ScanReport {
            address: "AA:BB".into(),
            local_name: Some("ignored".into()),
            service_data: Some(payload),
            rssi: Some(-61),
        }))
        .unwrap();

    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::PeerFound {
            peer: RawPeerId::new("AA:BB"),
            display_name: "Bob".into(),
            rssi: Some(-61),
        }
    );
}

#[tokio::test]
async fn test_advertisement_payload() {
    let mut rig = create_rig(PowerState::PoweredOn);
    rig.backend
        .start_advertising("Alexandria Station", &service())
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::ActivityStarted {
            activity: Activity::Advertising
        }
    );

    let adverts = rig.adverts.lock().unwrap();
    assert_eq!(adverts.len(), 1);
    assert_eq!(adverts[0].local_name, "Alexandria Station");
    let payload = AdvertPayload::from_bytes(&adverts[0].service_data).unwrap();
    assert_eq!(payload.id, "A1B2C3");
    assert_eq!(payload.name, "Alexandria");
}

#[tokio::test]
async fn test_incoming_write_connects_before_data() {
    let mut rig = create_rig(PowerState::PoweredOn);
    rig.radio
        .send(DriverEvent::WriteReceived {
            address: "CC".into(),
            value: vec![9, 9],
        })
        .unwrap();

    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::ConnectionStateChanged {
            peer: RawPeerId::new("CC"),
            state: LinkState::Connected,
        }
    );
    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::DataReceived {
            peer: RawPeerId::new("CC"),
            bytes: vec![9, 9],
        }
    );

    // Replies to a peripheral-side link go out as notifications
    rig.backend
        .send(SendTarget::Peer(RawPeerId::new("CC")), vec![1, 2, 3])
        .await
        .unwrap();
    assert!(rig.log.lock().unwrap().contains(&"notify CC 3".to_string()));
}

#[tokio::test]
async fn test_connect_then_write() {
    let mut rig = create_rig(PowerState::PoweredOn);
    rig.backend
        .connect(&RawPeerId::new("DD"), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::ConnectionStateChanged {
            peer: RawPeerId::new("DD"),
            state: LinkState::Connected,
        }
    );

    rig.backend
        .send(SendTarget::Peer(RawPeerId::new("DD")), vec![0; 14])
        .await
        .unwrap();
    assert!(rig.log.lock().unwrap().contains(&"write DD 14".to_string()));

    let too_large = rig
        .backend
        .send(SendTarget::Peer(RawPeerId::new("DD")), vec![0; 15])
        .await;
    assert!(too_large.is_err());

    let unknown = rig
        .backend
        .send(SendTarget::Peer(RawPeerId::new("EE")), vec![1])
        .await;
    assert!(unknown.is_err());
}

#[tokio::test]
async fn test_failed_connect_reports_not_connected() {
    let mut rig = create_rig(PowerState::PoweredOn);
    rig.backend
        .connect(&RawPeerId::new("unreachable"), Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::ConnectionStateChanged {
            peer: RawPeerId::new("unreachable"),
            state: LinkState::NotConnected,
        }
    );
}

#[tokio::test]
async fn test_slow_connect_does_not_stall_peripheral_role() {
    let mut rig = create_rig_with_connect_delay(PowerState::PoweredOn, Duration::from_secs(10));
    rig.backend
        .connect(&RawPeerId::new("CC:CC"), Duration::from_secs(10))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    rig.radio
        .send(DriverEvent::WriteReceived {
            address: "DD:DD".into(),
            value: vec![7],
        })
        .unwrap();

    // Each wait is bounded well below the connect delay
    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::ConnectionStateChanged {
            peer: RawPeerId::new("DD:DD"),
            state: LinkState::Connected,
        }
    );
    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::DataReceived {
            peer: RawPeerId::new("DD:DD"),
            bytes: vec![7],
        }
    );

    // Stop does not wait for the connect either, and abandons it
    tokio::time::timeout(Duration::from_secs(1), rig.backend.stop())
        .await
        .expect("stop waited on the pending connect")
        .unwrap();
    while let Ok(event) = rig.events.try_recv() {
        assert!(
            !matches!(
                &event.kind,
                BackendEventKind::ConnectionStateChanged { peer, .. } if peer.as_str() == "CC:CC"
            ),
            "abandoned connect reported {:?}",
            event.kind
        );
    }
    assert!(!rig.log.lock().unwrap().contains(&"connect CC:CC".to_string()));
}

#[tokio::test]
async fn test_connect_result_arrives_after_other_traffic() {
    let mut rig = create_rig_with_connect_delay(PowerState::PoweredOn, Duration::from_millis(200));
    rig.backend
        .connect(&RawPeerId::new("CC:CC"), Duration::from_secs(1))
        .await
        .unwrap();
    rig.radio
        .send(DriverEvent::Subscribed {
            address: "DD:DD".into(),
        })
        .unwrap();

    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::ConnectionStateChanged {
            peer: RawPeerId::new("DD:DD"),
            state: LinkState::Connected,
        }
    );
    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::ConnectionStateChanged {
            peer: RawPeerId::new("CC:CC"),
            state: LinkState::Connected,
        }
    );

    // The finished link is usable as a central write target
    rig.backend
        .send(SendTarget::Peer(RawPeerId::new("CC:CC")), vec![1, 2])
        .await
        .unwrap();
    assert!(rig.log.lock().unwrap().contains(&"write CC:CC 2".to_string()));
}

#[tokio::test]
async fn test_power_off_stops_scan_and_drops_links() {
    let mut rig = create_rig(PowerState::PoweredOn);
    rig.backend.start_discovery(&service()).await.unwrap();
    next_event(&mut rig.events).await;
    rig.backend
        .connect(&RawPeerId::new("DD"), Duration::from_secs(1))
        .await
        .unwrap();
    next_event(&mut rig.events).await;

    rig.radio
        .send(DriverEvent::PowerChanged {
            role: Role::Central,
            state: PowerState::PoweredOff,
        })
        .unwrap();

    assert!(matches!(
        next_event(&mut rig.events).await,
        BackendEventKind::ActivityStopped {
            activity: Activity::Discovery,
            ..
        }
    ));
    assert_eq!(
        next_event(&mut rig.events).await,
        BackendEventKind::ConnectionStateChanged {
            peer: RawPeerId::new("DD"),
            state: LinkState::NotConnected,
        }
    );
}

#[tokio::test]
async fn test_stop_releases_radio() {
    let mut rig = create_rig(PowerState::PoweredOn);
    rig.backend.start_discovery(&service()).await.unwrap();
    next_event(&mut rig.events).await;
    rig.backend
        .connect(&RawPeerId::new("DD"), Duration::from_secs(1))
        .await
        .unwrap();
    next_event(&mut rig.events).await;

    rig.backend.stop().await.unwrap();
    let log = rig.log.lock().unwrap().clone();
    assert!(log.contains(&"stop_scan".to_string()));
    assert!(log.contains(&"disconnect DD".to_string()));
    assert!(log.contains(&"close".to_string()));

    // Stopping twice is a no-op
    rig.backend.stop().await.unwrap();
}
