//! Transport backend contract
//!
//! Every native transport is wrapped in a [`TransportBackend`]. The engine
//! drives backends only through this trait and learns about outcomes only
//! through the [`BackendEventSink`] it hands them at construction.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::trace;

use crate::channel::{BackendEventSender, NonBlockingSend};
use crate::errors::TransportError;
use crate::events::{BackendEvent, BackendEventKind};
use crate::types::{Activity, BackendKind, Generation, LinkState, RawPeerId, ServiceId};

// ----------------------------------------------------------------------------
// Backend Trait
// ----------------------------------------------------------------------------

/// Where a backend should deliver bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    Peer(RawPeerId),
    /// Every currently connected peer
    Broadcast,
}

/// Capability contract for one native transport
///
/// Methods submit work and return promptly; whether an activity actually
/// started or a connection came up is reported later as an event.
#[async_trait]
pub trait TransportBackend: Send {
    /// Begin broadcasting presence; calling again restarts the broadcast
    async fn start_advertising(
        &mut self,
        display_name: &str,
        service: &ServiceId,
    ) -> Result<(), TransportError>;

    /// Begin scanning for peers advertising `service`
    async fn start_discovery(&mut self, service: &ServiceId) -> Result<(), TransportError>;

    /// Request a link to a discovered peer
    async fn connect(&mut self, peer: &RawPeerId, timeout: Duration) -> Result<(), TransportError>;

    /// Queue bytes for delivery
    async fn send(&mut self, target: SendTarget, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Tear down advertising, discovery and every link; a no-op when idle
    async fn stop(&mut self) -> Result<(), TransportError>;

    /// Link-layer write limit, `None` when the transport takes arbitrary sizes
    fn max_transmission_unit(&self) -> Option<usize>;

    fn capabilities(&self) -> BackendCapabilities;
}

// ----------------------------------------------------------------------------
// Backend Capabilities
// ----------------------------------------------------------------------------

/// Static description of a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub kind: BackendKind,
    pub supports_advertise: bool,
    pub supports_discovery: bool,
    /// Native one-call delivery to every connected peer
    pub supports_broadcast: bool,
    /// Incoming invitations are accepted without consulting the consumer
    pub auto_accepts_invitations: bool,
    /// The platform ties scanning to the location permission
    pub scan_requires_location: bool,
    /// Advertising and discovery keep running while connecting and connected
    pub discovery_survives_connect: bool,
    pub max_transmission_unit: Option<usize>,
}

impl BackendCapabilities {
    pub fn supports(&self, activity: Activity) -> bool {
        match activity {
            Activity::Advertising => self.supports_advertise,
            Activity::Discovery => self.supports_discovery,
        }
    }
}

// ----------------------------------------------------------------------------
// Event Sink
// ----------------------------------------------------------------------------

/// Handle a backend uses to report events
///
/// Cloneable and callable from any thread, including native callback threads
/// outside the async runtime. Every event is stamped with the backend kind
/// and the session generation it was created for.
#[derive(Clone)]
pub struct BackendEventSink {
    backend: BackendKind,
    generation: Generation,
    sender: BackendEventSender,
}

impl BackendEventSink {
    pub fn new(backend: BackendKind, generation: Generation, sender: BackendEventSender) -> Self {
        Self {
            backend,
            generation,
            sender,
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Report an event; returns `false` once the engine has gone away
    pub fn emit(&self, kind: BackendEventKind) -> bool {
        trace!(backend = %self.backend, generation = %self.generation, event = kind.name(), "backend event");
        self.sender
            .try_send_now(BackendEvent {
                backend: self.backend,
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    pub fn peer_found(&self, peer: RawPeerId, display_name: impl Into<String>, rssi: Option<i16>) -> bool {
        self.emit(BackendEventKind::PeerFound {
            peer,
            display_name: display_name.into(),
            rssi,
        })
    }

    pub fn peer_lost(&self, peer: RawPeerId) -> bool {
        self.emit(BackendEventKind::PeerLost { peer })
    }

    pub fn link_state(&self, peer: RawPeerId, state: LinkState) -> bool {
        self.emit(BackendEventKind::ConnectionStateChanged { peer, state })
    }

    pub fn data(&self, peer: RawPeerId, bytes: Vec<u8>) -> bool {
        self.emit(BackendEventKind::DataReceived { peer, bytes })
    }

    pub fn fault(&self, message: impl Into<String>) -> bool {
        self.emit(BackendEventKind::TransportFault {
            message: message.into(),
        })
    }

    pub fn activity_started(&self, activity: Activity) -> bool {
        self.emit(BackendEventKind::ActivityStarted { activity })
    }

    pub fn activity_failed(&self, activity: Activity, reason: impl Into<String>) -> bool {
        self.emit(BackendEventKind::ActivityFailed {
            activity,
            reason: reason.into(),
        })
    }

    pub fn activity_stopped(&self, activity: Activity, reason: impl Into<String>) -> bool {
        self.emit(BackendEventKind::ActivityStopped {
            activity,
            reason: reason.into(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl fmt::Debug for BackendEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEventSink")
            .field("backend", &self.backend)
            .field("generation", &self.generation)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Backend Factory
// ----------------------------------------------------------------------------

/// Parameters a backend is created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Local display name used for invitations and connection requests
    pub local_name: String,
    pub generation: Generation,
}

/// Constructs one backend per engine session
pub trait BackendFactory: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> BackendCapabilities;

    /// Whether the native transport exists on this platform right now
    fn is_available(&self) -> bool;

    fn create(
        &self,
        sink: BackendEventSink,
        params: &SessionParams,
    ) -> Result<Box<dyn TransportBackend>, TransportError>;
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
