//! Mesh and nearby backends over recording platform fakes

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use peerlink_bridge::{
    MeshBackendConfig, MeshBackendFactory, MeshCallbacks, MeshPeerState, MeshPlatform,
    MeshSession, NearbyBackendConfig, NearbyBackendFactory, NearbyCallbacks, NearbyClient,
    NearbyPayload, NearbyPlatform, NearbyStrategy, PendingHandshake,
};
use peerlink_core::channel::{create_backend_event_channel, BackendEventReceiver};
use peerlink_core::{
    Activity, BackendEventKind, BackendEventSink, BackendFactory, Generation, LinkState,
    RawPeerId, SendTarget, ServiceId, SessionParams, TransportBackend, TransportError,
};

type CallLog = Arc<Mutex<Vec<String>>>;

async fn next_event(events: &mut BackendEventReceiver) -> BackendEventKind {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("timed out waiting for backend event")
        .expect("event channel closed")
        .kind
}

fn params(name: &str) -> SessionParams {
    SessionParams {
        local_name: name.into(),
        generation: Generation::default(),
    }
}

// ----------------------------------------------------------------------------
// Mesh
// ----------------------------------------------------------------------------

#[derive(Default, Clone)]
struct RecordingMesh {
    log: CallLog,
    callbacks: Arc<Mutex<Option<MeshCallbacks>>>,
}

struct RecordingSession {
    log: CallLog,
    connected: Vec<String>,
}

impl MeshPlatform for RecordingMesh {
    fn is_available(&self) -> bool {
        true
    }

    fn open_session(
        &self,
        local_name: &str,
        _config: &MeshBackendConfig,
        callbacks: MeshCallbacks,
    ) -> Result<Box<dyn MeshSession>, TransportError> {
        self.log.lock().unwrap().push(format!("open {local_name}"));
        *self.callbacks.lock().unwrap() = Some(callbacks);
        Ok(Box::new(RecordingSession {
            log: self.log.clone(),
            connected: vec!["B".into(), "C".into()],
        }))
    }
}

impl MeshSession for RecordingSession {
    fn start_advertiser(&mut self, service_type: &str) -> Result<(), TransportError> {
        self.log.lock().unwrap().push(format!("advertise {service_type}"));
        Ok(())
    }

    fn stop_advertiser(&mut self) {
        self.log.lock().unwrap().push("stop_advertiser".into());
    }

    fn start_browser(&mut self, service_type: &str) -> Result<(), TransportError> {
        self.log.lock().unwrap().push(format!("browse {service_type}"));
        Ok(())
    }

    fn stop_browser(&mut self) {
        self.log.lock().unwrap().push("stop_browser".into());
    }

    fn invite(&mut self, peer: &str, timeout: Duration) -> Result<(), TransportError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("invite {peer} {}", timeout.as_secs()));
        Ok(())
    }

    fn send(&mut self, peers: &[String], bytes: &[u8]) -> Result<(), TransportError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("send {} {}", peers.join(","), bytes.len()));
        Ok(())
    }

    fn connected_peers(&self) -> Vec<String> {
        self.connected.clone()
    }

    fn disconnect(&mut self) {
        self.log.lock().unwrap().push("disconnect".into());
    }
}

#[tokio::test]
async fn test_mesh_advertise_recreates_advertiser() {
    let platform = RecordingMesh::default();
    let factory = MeshBackendFactory::new(platform.clone(), MeshBackendConfig::default());
    let (tx, mut events) = create_backend_event_channel();
    let sink = BackendEventSink::new(factory.kind(), Generation::default(), tx);
    let mut backend = factory.create(sink, &params("node")).unwrap();
    let service = ServiceId::new("mpconn").unwrap();

    backend.start_advertising("Alice", &service).await.unwrap();
    backend.start_advertising("Alice", &service).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        BackendEventKind::ActivityStarted {
            activity: Activity::Advertising
        }
    );

    let log = platform.log.lock().unwrap().clone();
    assert_eq!(
        log,
        [
            "open Alice",
            "stop_advertiser",
            "advertise mpconn",
            "stop_advertiser",
            "advertise mpconn"
        ]
    );
}

#[tokio::test]
async fn test_mesh_invalid_service_type_rejected() {
    let factory = MeshBackendFactory::new(RecordingMesh::default(), MeshBackendConfig::default());
    let (tx, _events) = create_backend_event_channel();
    let sink = BackendEventSink::new(factory.kind(), Generation::default(), tx);
    let mut backend = factory.create(sink, &params("node")).unwrap();

    let service = ServiceId::new("Not_Valid").unwrap();
    assert!(matches!(
        backend.start_discovery(&service).await,
        Err(TransportError::Unavailable { .. })
    ));
}

#[tokio::test]
async fn test_mesh_invite_and_broadcast() {
    let platform = RecordingMesh::default();
    let factory = MeshBackendFactory::new(platform.clone(), MeshBackendConfig::default());
    let (tx, _events) = create_backend_event_channel();
    let sink = BackendEventSink::new(factory.kind(), Generation::default(), tx);
    let mut backend = factory.create(sink, &params("node")).unwrap();

    backend
        .start_discovery(&ServiceId::new("mpconn").unwrap())
        .await
        .unwrap();
    backend
        .connect(&RawPeerId::new("B"), Duration::from_secs(30))
        .await
        .unwrap();
    backend.send(SendTarget::Broadcast, vec![1, 2]).await.unwrap();
    backend.stop().await.unwrap();

    let log = platform.log.lock().unwrap().clone();
    assert!(log.contains(&"open node".to_string()));
    assert!(log.contains(&"invite B 30".to_string()));
    assert!(log.contains(&"send B,C 2".to_string()));
    assert_eq!(log.last().map(String::as_str), Some("disconnect"));
}

#[tokio::test]
async fn test_mesh_native_states_map_to_links() {
    let platform = RecordingMesh::default();
    let factory = MeshBackendFactory::new(platform.clone(), MeshBackendConfig::default());
    let (tx, mut events) = create_backend_event_channel();
    let sink = BackendEventSink::new(factory.kind(), Generation::default(), tx);
    let mut backend = factory.create(sink, &params("node")).unwrap();
    backend
        .start_discovery(&ServiceId::new("mpconn").unwrap())
        .await
        .unwrap();
    next_event(&mut events).await;

    let callbacks = platform.callbacks.lock().unwrap().clone().unwrap();
    callbacks.state_changed("B", MeshPeerState::Connecting);
    callbacks.data_received("B", vec![7]);

    assert_eq!(
        next_event(&mut events).await,
        BackendEventKind::ConnectionStateChanged {
            peer: RawPeerId::new("B"),
            state: LinkState::Connecting
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        BackendEventKind::DataReceived {
            peer: RawPeerId::new("B"),
            bytes: vec![7]
        }
    );
}

// ----------------------------------------------------------------------------
// Nearby
// ----------------------------------------------------------------------------

#[derive(Default, Clone)]
struct RecordingNearby {
    log: CallLog,
    callbacks: Arc<Mutex<Option<NearbyCallbacks>>>,
    fail_discovery: bool,
    handshake_delay: Duration,
}

struct RecordingClient {
    log: CallLog,
    fail_discovery: bool,
    handshake_delay: Duration,
}

impl NearbyPlatform for RecordingNearby {
    fn is_available(&self) -> bool {
        true
    }

    fn open(&self, callbacks: NearbyCallbacks) -> Result<Box<dyn NearbyClient>, TransportError> {
        *self.callbacks.lock().unwrap() = Some(callbacks);
        Ok(Box::new(RecordingClient {
            log: self.log.clone(),
            fail_discovery: self.fail_discovery,
            handshake_delay: self.handshake_delay,
        }))
    }
}

#[async_trait]
impl NearbyClient for RecordingClient {
    async fn start_advertising(
        &mut self,
        endpoint_name: &str,
        service_id: &str,
        strategy: NearbyStrategy,
    ) -> Result<(), TransportError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("advertise {endpoint_name} {service_id} {strategy}"));
        Ok(())
    }

    async fn stop_advertising(&mut self) {
        self.log.lock().unwrap().push("stop_advertising".into());
    }

    async fn start_discovery(
        &mut self,
        service_id: &str,
        _strategy: NearbyStrategy,
    ) -> Result<(), TransportError> {
        if self.fail_discovery {
            return Err(TransportError::native("STATUS_BLUETOOTH_ERROR"));
        }
        self.log.lock().unwrap().push(format!("discover {service_id}"));
        Ok(())
    }

    async fn stop_discovery(&mut self) {
        self.log.lock().unwrap().push("stop_discovery".into());
    }

    fn request_connection(&mut self, local_name: &str, endpoint_id: &str) -> PendingHandshake {
        self.log
            .lock()
            .unwrap()
            .push(format!("request {local_name} {endpoint_id}"));
        let delay = self.handshake_delay;
        let known = endpoint_id != "gone";
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            if known {
                Ok(())
            } else {
                Err(TransportError::native("STATUS_ENDPOINT_UNKNOWN"))
            }
        })
    }

    fn accept_connection(&mut self, endpoint_id: &str) -> PendingHandshake {
        self.log.lock().unwrap().push(format!("accept {endpoint_id}"));
        let delay = self.handshake_delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(())
        })
    }

    async fn send_payload(
        &mut self,
        endpoint_ids: &[String],
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("payload {} {}", endpoint_ids.join(","), bytes.len()));
        Ok(())
    }

    async fn stop_all_endpoints(&mut self) {
        self.log.lock().unwrap().push("stop_all".into());
    }
}

fn nearby_backend(
    platform: &RecordingNearby,
) -> (Box<dyn TransportBackend>, BackendEventReceiver) {
    let factory = NearbyBackendFactory::new(platform.clone(), NearbyBackendConfig::default());
    let (tx, events) = create_backend_event_channel();
    let sink = BackendEventSink::new(factory.kind(), Generation::default(), tx);
    (factory.create(sink, &params("node")).unwrap(), events)
}

#[tokio::test]
async fn test_nearby_start_results_are_events() {
    let platform = RecordingNearby {
        fail_discovery: true,
        ..Default::default()
    };
    let (mut backend, mut events) = nearby_backend(&platform);
    let service = ServiceId::new("com.example.peerlink").unwrap();

    backend.start_advertising("Alice", &service).await.unwrap();
    backend.start_discovery(&service).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        BackendEventKind::ActivityStarted {
            activity: Activity::Advertising
        }
    );
    assert!(matches!(
        next_event(&mut events).await,
        BackendEventKind::ActivityFailed {
            activity: Activity::Discovery,
            ..
        }
    ));
    assert!(platform
        .log
        .lock()
        .unwrap()
        .contains(&"advertise Alice com.example.peerlink star".to_string()));
}

#[tokio::test]
async fn test_nearby_incoming_connection_is_accepted() {
    let platform = RecordingNearby::default();
    let (_backend, mut events) = nearby_backend(&platform);
    let callbacks = platform.callbacks.lock().unwrap().clone().unwrap();

    callbacks.on_connection_initiated("ep-1", "Bob");
    callbacks.on_connection_result("ep-1", true);
    callbacks.on_payload_received("ep-1", NearbyPayload::File { name: "x".into() });
    callbacks.on_payload_received("ep-1", NearbyPayload::Bytes(vec![4, 2]));

    assert_eq!(
        next_event(&mut events).await,
        BackendEventKind::InvitationReceived {
            peer: RawPeerId::new("ep-1"),
            display_name: "Bob".into()
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        BackendEventKind::ConnectionStateChanged {
            peer: RawPeerId::new("ep-1"),
            state: LinkState::Connected
        }
    );
    // The file payload is skipped
    assert_eq!(
        next_event(&mut events).await,
        BackendEventKind::DataReceived {
            peer: RawPeerId::new("ep-1"),
            bytes: vec![4, 2]
        }
    );
    assert!(platform
        .log
        .lock()
        .unwrap()
        .contains(&"accept ep-1".to_string()));
}

#[tokio::test]
async fn test_nearby_failed_request_reports_not_connected() {
    let platform = RecordingNearby::default();
    let (mut backend, mut events) = nearby_backend(&platform);
    backend
        .connect(&RawPeerId::new("gone"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        BackendEventKind::ConnectionStateChanged {
            peer: RawPeerId::new("gone"),
            state: LinkState::NotConnected
        }
    );
}

#[tokio::test]
async fn test_nearby_broadcast_and_stop() {
    let platform = RecordingNearby::default();
    let (mut backend, mut events) = nearby_backend(&platform);

    let empty = backend.send(SendTarget::Broadcast, vec![1]).await;
    assert!(matches!(empty, Err(TransportError::NotConnected { .. })));

    let callbacks = platform.callbacks.lock().unwrap().clone().unwrap();
    callbacks.on_connection_result("ep-1", true);
    next_event(&mut events).await;

    backend.send(SendTarget::Broadcast, vec![1, 2, 3]).await.unwrap();
    backend.stop().await.unwrap();

    let log = platform.log.lock().unwrap().clone();
    assert!(log.contains(&"payload ep-1 3".to_string()));
    assert!(log.contains(&"stop_all".to_string()));
}

#[tokio::test]
async fn test_nearby_slow_handshake_does_not_stall_callbacks() {
    let platform = RecordingNearby {
        handshake_delay: Duration::from_secs(10),
        ..Default::default()
    };
    let (mut backend, mut events) = nearby_backend(&platform);
    let callbacks = platform.callbacks.lock().unwrap().clone().unwrap();

    backend
        .connect(&RawPeerId::new("ep-slow"), Duration::from_secs(10))
        .await
        .unwrap();
    callbacks.on_connection_initiated("ep-2", "Carol");
    callbacks.on_endpoint_found("ep-3", "Dave");

    // Both arrive long before either handshake resolves
    assert_eq!(
        next_event(&mut events).await,
        BackendEventKind::InvitationReceived {
            peer: RawPeerId::new("ep-2"),
            display_name: "Carol".into()
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        BackendEventKind::PeerFound {
            peer: RawPeerId::new("ep-3"),
            display_name: "Dave".into(),
            rssi: None,
        }
    );

    tokio::time::timeout(Duration::from_secs(1), backend.stop())
        .await
        .expect("stop waited on a pending handshake")
        .unwrap();
    let log = platform.log.lock().unwrap().clone();
    assert!(log.contains(&"request node ep-slow".to_string()));
    assert!(log.contains(&"accept ep-2".to_string()));
    assert!(log.contains(&"stop_all".to_string()));
}
