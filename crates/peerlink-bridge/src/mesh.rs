//! Session-based mesh backend
//!
//! The platform exposes one session per local identity plus advertiser and
//! browser objects that are re-created on every start. Peers are identified
//! by their display name. Invitations from other peers are always accepted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use peerlink_core::{
    Activity, BackendCapabilities, BackendEventKind, BackendEventSink, BackendFactory,
    BackendKind, LinkState, RawPeerId, SendTarget, ServiceId, SessionParams, TransportBackend,
    TransportError,
};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshBackendConfig {
    /// Require encrypted sessions
    pub encryption_required: bool,
}

impl Default for MeshBackendConfig {
    fn default() -> Self {
        Self {
            encryption_required: true,
        }
    }
}

impl MeshBackendConfig {
    pub fn with_encryption_required(mut self, required: bool) -> Self {
        self.encryption_required = required;
        self
    }
}

/// Validate a service id as a mesh service type
///
/// Service types are 1-15 characters of lowercase ASCII letters, digits and
/// hyphens, and may not start or end with a hyphen.
pub fn mesh_service_type(service: &ServiceId) -> Result<String, TransportError> {
    let value = service.as_str();
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if value.is_empty()
        || value.len() > 15
        || !valid_chars
        || value.starts_with('-')
        || value.ends_with('-')
    {
        return Err(TransportError::unavailable(format!(
            "'{value}' is not a valid mesh service type"
        )));
    }
    Ok(value.to_string())
}

// ----------------------------------------------------------------------------
// Platform Traits
// ----------------------------------------------------------------------------

/// Per-peer session state as the platform reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshPeerState {
    Connecting,
    Connected,
    NotConnected,
}

impl From<MeshPeerState> for LinkState {
    fn from(state: MeshPeerState) -> Self {
        match state {
            MeshPeerState::Connecting => LinkState::Connecting,
            MeshPeerState::Connected => LinkState::Connected,
            MeshPeerState::NotConnected => LinkState::NotConnected,
        }
    }
}

/// Entry point into the platform framework
pub trait MeshPlatform: Send + Sync {
    fn is_available(&self) -> bool;

    /// Create a session for `local_name`; native delegates report through `callbacks`
    fn open_session(
        &self,
        local_name: &str,
        config: &MeshBackendConfig,
        callbacks: MeshCallbacks,
    ) -> Result<Box<dyn MeshSession>, TransportError>;
}

/// One native session with its advertiser and browser
pub trait MeshSession: Send {
    /// Create a fresh advertiser and start it
    fn start_advertiser(&mut self, service_type: &str) -> Result<(), TransportError>;

    fn stop_advertiser(&mut self);

    /// Create a fresh browser and start it
    fn start_browser(&mut self, service_type: &str) -> Result<(), TransportError>;

    fn stop_browser(&mut self);

    /// Invite a found peer into the session
    fn invite(&mut self, peer: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Reliable delivery to the listed connected peers
    fn send(&mut self, peers: &[String], bytes: &[u8]) -> Result<(), TransportError>;

    fn connected_peers(&self) -> Vec<String>;

    fn disconnect(&mut self);
}

// ----------------------------------------------------------------------------
// Callbacks
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MeshPeers {
    connected: HashSet<String>,
    /// Peers the browser lost while still connected
    lost_while_connected: HashSet<String>,
}

/// Delegate side of a mesh session, callable from any native thread
#[derive(Debug, Clone)]
pub struct MeshCallbacks {
    sink: BackendEventSink,
    peers: Arc<Mutex<MeshPeers>>,
}

impl MeshCallbacks {
    fn new(sink: BackendEventSink) -> Self {
        Self {
            sink,
            peers: Arc::default(),
        }
    }

    fn peers(&self) -> MutexGuard<'_, MeshPeers> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn found_peer(&self, name: &str) {
        self.peers().lost_while_connected.remove(name);
        self.sink.peer_found(RawPeerId::new(name), name, None);
    }

    /// Loss of a connected peer is held back until its link drops
    pub fn lost_peer(&self, name: &str) {
        let mut peers = self.peers();
        if peers.connected.contains(name) {
            debug!(peer = name, "Connected peer left browser range, deferring loss");
            peers.lost_while_connected.insert(name.to_string());
            return;
        }
        drop(peers);
        self.sink.peer_lost(RawPeerId::new(name));
    }

    /// Incoming invitation; the return value is the accept decision
    pub fn invitation_received(&self, name: &str) -> bool {
        info!(peer = name, "Accepting mesh invitation");
        self.sink.emit(BackendEventKind::InvitationReceived {
            peer: RawPeerId::new(name),
            display_name: name.to_string(),
        });
        true
    }

    pub fn state_changed(&self, name: &str, state: MeshPeerState) {
        let lost = {
            let mut peers = self.peers();
            match state {
                MeshPeerState::Connected => {
                    peers.connected.insert(name.to_string());
                    false
                }
                MeshPeerState::Connecting => false,
                MeshPeerState::NotConnected => {
                    peers.connected.remove(name);
                    peers.lost_while_connected.remove(name)
                }
            }
        };
        self.sink.link_state(RawPeerId::new(name), state.into());
        if lost {
            self.sink.peer_lost(RawPeerId::new(name));
        }
    }

    pub fn data_received(&self, name: &str, bytes: Vec<u8>) {
        self.sink.data(RawPeerId::new(name), bytes);
    }

    /// Resources and streams are outside the payload model
    pub fn resource_received(&self, name: &str, resource: &str) {
        debug!(peer = name, resource, "Ignoring mesh resource transfer");
    }

    pub fn fault(&self, message: impl Into<String>) {
        self.sink.fault(message);
    }
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

fn mesh_capabilities() -> BackendCapabilities {
    BackendCapabilities {
        kind: BackendKind::Mesh,
        supports_advertise: true,
        supports_discovery: true,
        supports_broadcast: true,
        auto_accepts_invitations: true,
        scan_requires_location: false,
        discovery_survives_connect: true,
        max_transmission_unit: None,
    }
}

/// [`TransportBackend`] over a [`MeshPlatform`]
pub struct MeshBackend {
    platform: Arc<dyn MeshPlatform>,
    config: MeshBackendConfig,
    local_name: String,
    callbacks: MeshCallbacks,
    session: Option<Box<dyn MeshSession>>,
}

impl MeshBackend {
    pub fn new(
        platform: Arc<dyn MeshPlatform>,
        config: MeshBackendConfig,
        sink: BackendEventSink,
        local_name: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            config,
            local_name: local_name.into(),
            callbacks: MeshCallbacks::new(sink),
            session: None,
        }
    }

    /// The session identity is fixed when it is opened
    fn ensure_session(&mut self, name: &str) -> Result<&mut Box<dyn MeshSession>, TransportError> {
        if self.session.is_none() {
            info!(name, "Opening mesh session");
            let session = self
                .platform
                .open_session(name, &self.config, self.callbacks.clone())?;
            self.local_name = name.to_string();
            self.session = Some(session);
        } else if name != self.local_name {
            debug!(
                requested = name,
                current = %self.local_name,
                "Mesh session already open under another name"
            );
        }
        self.session
            .as_mut()
            .ok_or_else(|| TransportError::unavailable("mesh session not open"))
    }

    fn session(&mut self) -> Result<&mut Box<dyn MeshSession>, TransportError> {
        self.session
            .as_mut()
            .ok_or_else(|| TransportError::unavailable("mesh session not open"))
    }
}

#[async_trait]
impl TransportBackend for MeshBackend {
    async fn start_advertising(
        &mut self,
        display_name: &str,
        service: &ServiceId,
    ) -> Result<(), TransportError> {
        let service_type = mesh_service_type(service)?;
        let session = self.ensure_session(display_name)?;
        session.stop_advertiser();
        session.start_advertiser(&service_type)?;
        self.callbacks.sink.activity_started(Activity::Advertising);
        Ok(())
    }

    async fn start_discovery(&mut self, service: &ServiceId) -> Result<(), TransportError> {
        let service_type = mesh_service_type(service)?;
        let name = self.local_name.clone();
        let session = self.ensure_session(&name)?;
        session.stop_browser();
        session.start_browser(&service_type)?;
        self.callbacks.sink.activity_started(Activity::Discovery);
        Ok(())
    }

    async fn connect(&mut self, peer: &RawPeerId, timeout: Duration) -> Result<(), TransportError> {
        debug!(%peer, ?timeout, "Inviting mesh peer");
        self.session()?.invite(peer.as_str(), timeout)
    }

    async fn send(&mut self, target: SendTarget, bytes: Vec<u8>) -> Result<(), TransportError> {
        let session = self.session()?;
        let peers = match target {
            SendTarget::Peer(peer) => vec![peer.as_str().to_string()],
            SendTarget::Broadcast => session.connected_peers(),
        };
        if peers.is_empty() {
            return Err(TransportError::not_connected("No connected peers"));
        }
        session.send(&peers, &bytes)
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        if let Some(mut session) = self.session.take() {
            session.stop_advertiser();
            session.stop_browser();
            session.disconnect();
            info!("Mesh session closed");
        }
        Ok(())
    }

    fn max_transmission_unit(&self) -> Option<usize> {
        None
    }

    fn capabilities(&self) -> BackendCapabilities {
        mesh_capabilities()
    }
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct MeshBackendFactory {
    platform: Arc<dyn MeshPlatform>,
    config: MeshBackendConfig,
}

impl MeshBackendFactory {
    pub fn new(platform: impl MeshPlatform + 'static, config: MeshBackendConfig) -> Self {
        Self {
            platform: Arc::new(platform),
            config,
        }
    }

    pub fn with_platform_arc(platform: Arc<dyn MeshPlatform>, config: MeshBackendConfig) -> Self {
        Self { platform, config }
    }
}

impl BackendFactory for MeshBackendFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Mesh
    }

    fn capabilities(&self) -> BackendCapabilities {
        mesh_capabilities()
    }

    fn is_available(&self) -> bool {
        self.platform.is_available()
    }

    fn create(
        &self,
        sink: BackendEventSink,
        params: &SessionParams,
    ) -> Result<Box<dyn TransportBackend>, TransportError> {
        Ok(Box::new(MeshBackend::new(
            self.platform.clone(),
            self.config.clone(),
            sink,
            params.local_name.clone(),
        )))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::channel::create_backend_event_channel;
    use peerlink_core::Generation;

    #[test]
    fn test_service_type_validation() {
        let ok = ServiceId::new("mpconn").unwrap();
        assert_eq!(mesh_service_type(&ok).unwrap(), "mpconn");

        for bad in ["UPPER", "far-too-long-service", "-lead", "under_score"] {
            let service = ServiceId::new(bad).unwrap();
            assert!(mesh_service_type(&service).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn test_lost_connected_peer_is_deferred() {
        let (tx, mut rx) = create_backend_event_channel();
        let callbacks =
            MeshCallbacks::new(BackendEventSink::new(BackendKind::Mesh, Generation::default(), tx));

        callbacks.found_peer("B");
        callbacks.state_changed("B", MeshPeerState::Connected);
        callbacks.lost_peer("B");

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok().map(|e| e.kind)).collect();
        assert_eq!(kinds.len(), 2);
        assert_eq!(kinds[0].name(), "PeerFound");
        assert_eq!(kinds[1].name(), "ConnectionStateChanged");

        callbacks.state_changed("B", MeshPeerState::NotConnected);
        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok().map(|e| e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                BackendEventKind::ConnectionStateChanged {
                    peer: RawPeerId::new("B"),
                    state: LinkState::NotConnected
                },
                BackendEventKind::PeerLost {
                    peer: RawPeerId::new("B")
                },
            ]
        );
    }

    #[test]
    fn test_invitations_are_accepted() {
        let (tx, mut rx) = create_backend_event_channel();
        let callbacks =
            MeshCallbacks::new(BackendEventSink::new(BackendKind::Mesh, Generation::default(), tx));
        assert!(callbacks.invitation_received("C"));
        assert_eq!(
            rx.try_recv().unwrap().kind,
            BackendEventKind::InvitationReceived {
                peer: RawPeerId::new("C"),
                display_name: "C".into()
            }
        );
    }
}
