//! Endpoint-based nearby backend
//!
//! Every client call completes asynchronously, and native callbacks such as
//! connection initiation need a client call in response. A worker task owns
//! the client; backend calls and native callbacks both reach it as messages.
//! Connection handshakes resolve in a join set beside the worker loop so a
//! slow endpoint never delays other callbacks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use peerlink_core::{
    Activity, BackendCapabilities, BackendEventKind, BackendEventSink, BackendFactory,
    BackendKind, LinkState, RawPeerId, SendTarget, ServiceId, SessionParams, TransportBackend,
    TransportError,
};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Connection topology requested from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NearbyStrategy {
    Cluster,
    #[default]
    Star,
    PointToPoint,
}

impl fmt::Display for NearbyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NearbyStrategy::Cluster => write!(f, "cluster"),
            NearbyStrategy::Star => write!(f, "star"),
            NearbyStrategy::PointToPoint => write!(f, "pointToPoint"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NearbyBackendConfig {
    pub strategy: NearbyStrategy,
}

impl Default for NearbyBackendConfig {
    fn default() -> Self {
        Self {
            strategy: NearbyStrategy::Star,
        }
    }
}

impl NearbyBackendConfig {
    pub fn with_strategy(mut self, strategy: NearbyStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

// ----------------------------------------------------------------------------
// Platform Traits
// ----------------------------------------------------------------------------

/// Payload as delivered by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NearbyPayload {
    Bytes(Vec<u8>),
    File { name: String },
    Stream,
}

/// Connection handshake step; owns what it needs so it can run off the worker
pub type PendingHandshake =
    Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'static>>;

/// Client over the native connections API; each call resolves when the
/// platform reports success or failure
#[async_trait]
pub trait NearbyClient: Send {
    async fn start_advertising(
        &mut self,
        endpoint_name: &str,
        service_id: &str,
        strategy: NearbyStrategy,
    ) -> Result<(), TransportError>;

    async fn stop_advertising(&mut self);

    async fn start_discovery(
        &mut self,
        service_id: &str,
        strategy: NearbyStrategy,
    ) -> Result<(), TransportError>;

    async fn stop_discovery(&mut self);

    fn request_connection(&mut self, local_name: &str, endpoint_id: &str) -> PendingHandshake;

    fn accept_connection(&mut self, endpoint_id: &str) -> PendingHandshake;

    async fn send_payload(
        &mut self,
        endpoint_ids: &[String],
        bytes: Vec<u8>,
    ) -> Result<(), TransportError>;

    async fn stop_all_endpoints(&mut self);
}

/// Entry point into the platform framework
pub trait NearbyPlatform: Send + Sync {
    fn is_available(&self) -> bool;

    /// Create a client; native listeners report through `callbacks`
    fn open(&self, callbacks: NearbyCallbacks) -> Result<Box<dyn NearbyClient>, TransportError>;
}

// ----------------------------------------------------------------------------
// Callbacks
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum NativeCallback {
    EndpointFound { endpoint: String, name: String },
    EndpointLost { endpoint: String },
    ConnectionInitiated { endpoint: String, name: String },
    ConnectionResult { endpoint: String, success: bool },
    Disconnected { endpoint: String },
    PayloadReceived { endpoint: String, payload: NearbyPayload },
}

/// Listener side of a nearby client, callable from any native thread
#[derive(Debug, Clone)]
pub struct NearbyCallbacks {
    tx: mpsc::UnboundedSender<NativeCallback>,
}

impl NearbyCallbacks {
    fn post(&self, callback: NativeCallback) {
        if self.tx.send(callback).is_err() {
            debug!("Nearby worker gone, dropping native callback");
        }
    }

    pub fn on_endpoint_found(&self, endpoint: &str, name: &str) {
        self.post(NativeCallback::EndpointFound {
            endpoint: endpoint.to_string(),
            name: name.to_string(),
        });
    }

    pub fn on_endpoint_lost(&self, endpoint: &str) {
        self.post(NativeCallback::EndpointLost {
            endpoint: endpoint.to_string(),
        });
    }

    pub fn on_connection_initiated(&self, endpoint: &str, name: &str) {
        self.post(NativeCallback::ConnectionInitiated {
            endpoint: endpoint.to_string(),
            name: name.to_string(),
        });
    }

    pub fn on_connection_result(&self, endpoint: &str, success: bool) {
        self.post(NativeCallback::ConnectionResult {
            endpoint: endpoint.to_string(),
            success,
        });
    }

    pub fn on_disconnected(&self, endpoint: &str) {
        self.post(NativeCallback::Disconnected {
            endpoint: endpoint.to_string(),
        });
    }

    pub fn on_payload_received(&self, endpoint: &str, payload: NearbyPayload) {
        self.post(NativeCallback::PayloadReceived {
            endpoint: endpoint.to_string(),
            payload,
        });
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum Request {
    Advertise { name: String, service: String },
    Discover { service: String },
    Connect { endpoint: String },
    Send {
        target: SendTarget,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Stop { reply: oneshot::Sender<()> },
}

#[derive(Debug)]
enum Handshake {
    Request { endpoint: String },
    Accept { endpoint: String },
}

type HandshakeOutcome = (Handshake, Result<(), TransportError>);

struct NearbyWorker {
    client: Box<dyn NearbyClient>,
    sink: BackendEventSink,
    strategy: NearbyStrategy,
    local_name: String,
    advertising: bool,
    discovering: bool,
    discovered: HashMap<String, String>,
    connected: HashSet<String>,
    lost_while_connected: HashSet<String>,
    handshakes: JoinSet<HandshakeOutcome>,
}

impl NearbyWorker {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut callbacks: mpsc::UnboundedReceiver<NativeCallback>,
    ) {
        info!(strategy = %self.strategy, "Nearby worker starting");
        loop {
            tokio::select! {
                biased;

                request = requests.recv() => match request {
                    Some(Request::Stop { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },

                // The worker holds no sender, but the client keeps the callbacks alive
                Some(callback) = callbacks.recv() => self.handle_callback(callback).await,

                Some(joined) = self.handshakes.join_next(), if !self.handshakes.is_empty() => {
                    self.finish_handshake(joined);
                }
            }
        }
        info!("Nearby worker stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Advertise { name, service } => {
                if self.advertising {
                    debug!("Restarting nearby advertising");
                    self.client.stop_advertising().await;
                    self.advertising = false;
                }
                match self
                    .client
                    .start_advertising(&name, &service, self.strategy)
                    .await
                {
                    Ok(()) => {
                        self.advertising = true;
                        self.local_name = name;
                        self.sink.activity_started(Activity::Advertising);
                    }
                    Err(e) => {
                        warn!("startAdvertising failed: {}", e);
                        self.sink.activity_failed(Activity::Advertising, e.to_string());
                    }
                }
            }
            Request::Discover { service } => {
                if self.discovering {
                    debug!("Restarting nearby discovery");
                    self.client.stop_discovery().await;
                    self.discovering = false;
                }
                match self.client.start_discovery(&service, self.strategy).await {
                    Ok(()) => {
                        self.discovering = true;
                        self.sink.activity_started(Activity::Discovery);
                    }
                    Err(e) => {
                        warn!("startDiscovery failed: {}", e);
                        self.sink.activity_failed(Activity::Discovery, e.to_string());
                    }
                }
            }
            Request::Connect { endpoint } => {
                let pending = self.client.request_connection(&self.local_name, &endpoint);
                self.handshakes
                    .spawn(async move { (Handshake::Request { endpoint }, pending.await) });
            }
            Request::Send {
                target,
                bytes,
                reply,
            } => {
                let endpoints: Vec<String> = match target {
                    SendTarget::Peer(peer) => vec![peer.as_str().to_string()],
                    SendTarget::Broadcast => self.connected.iter().cloned().collect(),
                };
                let result = if endpoints.is_empty() {
                    Err(TransportError::not_connected("No connected peers"))
                } else {
                    self.client.send_payload(&endpoints, bytes).await
                };
                let _ = reply.send(result);
            }
            Request::Stop { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_callback(&mut self, callback: NativeCallback) {
        match callback {
            NativeCallback::EndpointFound { endpoint, name } => {
                debug!(%endpoint, %name, "Endpoint found");
                self.lost_while_connected.remove(&endpoint);
                self.discovered.insert(endpoint.clone(), name.clone());
                self.sink.peer_found(RawPeerId::new(endpoint), name, None);
            }
            NativeCallback::EndpointLost { endpoint } => {
                self.discovered.remove(&endpoint);
                if self.connected.contains(&endpoint) {
                    debug!(%endpoint, "Connected endpoint lost, deferring until disconnect");
                    self.lost_while_connected.insert(endpoint);
                } else {
                    self.sink.peer_lost(RawPeerId::new(endpoint));
                }
            }
            NativeCallback::ConnectionInitiated { endpoint, name } => {
                // Invitations are auto-accepted; the outcome arrives as a connection result
                info!(%endpoint, %name, "Accepting nearby connection");
                let pending = self.client.accept_connection(&endpoint);
                self.sink.emit(BackendEventKind::InvitationReceived {
                    peer: RawPeerId::new(endpoint.clone()),
                    display_name: name,
                });
                self.handshakes
                    .spawn(async move { (Handshake::Accept { endpoint }, pending.await) });
            }
            NativeCallback::ConnectionResult { endpoint, success } => {
                let state = if success {
                    self.connected.insert(endpoint.clone());
                    LinkState::Connected
                } else {
                    self.connected.remove(&endpoint);
                    LinkState::NotConnected
                };
                self.sink.link_state(RawPeerId::new(endpoint), state);
            }
            NativeCallback::Disconnected { endpoint } => {
                self.connected.remove(&endpoint);
                let lost = self.lost_while_connected.remove(&endpoint);
                self.sink
                    .link_state(RawPeerId::new(endpoint.clone()), LinkState::NotConnected);
                if lost {
                    self.sink.peer_lost(RawPeerId::new(endpoint));
                }
            }
            NativeCallback::PayloadReceived { endpoint, payload } => match payload {
                NearbyPayload::Bytes(bytes) => {
                    self.sink.data(RawPeerId::new(endpoint), bytes);
                }
                other => debug!(%endpoint, ?other, "Ignoring non-bytes payload"),
            },
        }
    }

    fn finish_handshake(&mut self, joined: Result<HandshakeOutcome, JoinError>) {
        let (handshake, error) = match joined {
            Ok((_, Ok(()))) => return,
            Ok((handshake, Err(e))) => (handshake, e),
            Err(e) => {
                warn!("Handshake task ended without a result: {}", e);
                return;
            }
        };
        match handshake {
            Handshake::Request { endpoint } => {
                warn!(%endpoint, "requestConnection failed: {}", error);
                if !self.connected.contains(&endpoint) {
                    self.sink
                        .link_state(RawPeerId::new(endpoint), LinkState::NotConnected);
                }
            }
            Handshake::Accept { endpoint } => {
                warn!(%endpoint, "acceptConnection failed: {}", error);
                self.sink.fault(format!("acceptConnection failed: {error}"));
            }
        }
    }

    async fn shutdown(&mut self) {
        self.handshakes.shutdown().await;
        self.client.stop_all_endpoints().await;
        if self.advertising {
            self.client.stop_advertising().await;
        }
        if self.discovering {
            self.client.stop_discovery().await;
        }
        self.advertising = false;
        self.discovering = false;
        self.connected.clear();
        self.discovered.clear();
        self.lost_while_connected.clear();
    }
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

fn nearby_capabilities() -> BackendCapabilities {
    BackendCapabilities {
        kind: BackendKind::Nearby,
        supports_advertise: true,
        supports_discovery: true,
        supports_broadcast: true,
        auto_accepts_invitations: true,
        scan_requires_location: true,
        discovery_survives_connect: true,
        max_transmission_unit: None,
    }
}

/// [`TransportBackend`] over a [`NearbyPlatform`] client
pub struct NearbyBackend {
    requests: mpsc::UnboundedSender<Request>,
    task: Option<JoinHandle<()>>,
}

impl NearbyBackend {
    /// Open a client and start its worker; must be called within a tokio runtime
    pub fn spawn(
        platform: &dyn NearbyPlatform,
        config: &NearbyBackendConfig,
        sink: BackendEventSink,
        local_name: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let client = platform.open(NearbyCallbacks { tx: callback_tx })?;
        let (requests, request_rx) = mpsc::unbounded_channel();

        let worker = NearbyWorker {
            client,
            sink,
            strategy: config.strategy,
            local_name: local_name.into(),
            advertising: false,
            discovering: false,
            discovered: HashMap::new(),
            connected: HashSet::new(),
            lost_while_connected: HashSet::new(),
            handshakes: JoinSet::new(),
        };
        let task = tokio::spawn(worker.run(request_rx, callback_rx));
        Ok(Self {
            requests,
            task: Some(task),
        })
    }

    fn dispatch(&self, request: Request) -> Result<(), TransportError> {
        self.requests
            .send(request)
            .map_err(|_| TransportError::unavailable("nearby worker is not running"))
    }
}

#[async_trait]
impl TransportBackend for NearbyBackend {
    async fn start_advertising(
        &mut self,
        display_name: &str,
        service: &ServiceId,
    ) -> Result<(), TransportError> {
        self.dispatch(Request::Advertise {
            name: display_name.to_string(),
            service: service.to_string(),
        })
    }

    async fn start_discovery(&mut self, service: &ServiceId) -> Result<(), TransportError> {
        self.dispatch(Request::Discover {
            service: service.to_string(),
        })
    }

    async fn connect(&mut self, peer: &RawPeerId, timeout: Duration) -> Result<(), TransportError> {
        debug!(%peer, ?timeout, "Requesting nearby connection");
        self.dispatch(Request::Connect {
            endpoint: peer.as_str().to_string(),
        })
    }

    async fn send(&mut self, target: SendTarget, bytes: Vec<u8>) -> Result<(), TransportError> {
        let (reply, done) = oneshot::channel();
        self.dispatch(Request::Send {
            target,
            bytes,
            reply,
        })?;
        done.await
            .map_err(|_| TransportError::unavailable("nearby worker is not running"))?
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let (reply, done) = oneshot::channel();
        if self.dispatch(Request::Stop { reply }).is_ok() {
            let _ = done.await;
        }
        let _ = task.await;
        Ok(())
    }

    fn max_transmission_unit(&self) -> Option<usize> {
        None
    }

    fn capabilities(&self) -> BackendCapabilities {
        nearby_capabilities()
    }
}

impl Drop for NearbyBackend {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct NearbyBackendFactory {
    platform: std::sync::Arc<dyn NearbyPlatform>,
    config: NearbyBackendConfig,
}

impl NearbyBackendFactory {
    pub fn new(platform: impl NearbyPlatform + 'static, config: NearbyBackendConfig) -> Self {
        Self {
            platform: std::sync::Arc::new(platform),
            config,
        }
    }

    pub fn with_platform_arc(
        platform: std::sync::Arc<dyn NearbyPlatform>,
        config: NearbyBackendConfig,
    ) -> Self {
        Self { platform, config }
    }
}

impl BackendFactory for NearbyBackendFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Nearby
    }

    fn capabilities(&self) -> BackendCapabilities {
        nearby_capabilities()
    }

    fn is_available(&self) -> bool {
        self.platform.is_available()
    }

    fn create(
        &self,
        sink: BackendEventSink,
        params: &SessionParams,
    ) -> Result<Box<dyn TransportBackend>, TransportError> {
        let backend =
            NearbyBackend::spawn(self.platform.as_ref(), &self.config, sink, &params.local_name)?;
        Ok(Box::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategy_is_star() {
        assert_eq!(NearbyBackendConfig::default().strategy, NearbyStrategy::Star);
        assert_eq!(NearbyStrategy::PointToPoint.to_string(), "pointToPoint");
    }

    #[test]
    fn test_capabilities() {
        let caps = nearby_capabilities();
        assert!(caps.auto_accepts_invitations);
        assert!(caps.scan_requires_location);
        assert_eq!(caps.max_transmission_unit, None);
    }
}
