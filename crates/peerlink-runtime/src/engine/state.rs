//! Engine bookkeeping types

use serde::Serialize;

use peerlink_core::{
    Activity, BackendCapabilities, BackendKind, ConnectionState, FrameUnit, Generation, PeerId,
    PeerRecord, TransitionRecord, TransportBackend,
};

use crate::bus::BusStats;

// ----------------------------------------------------------------------------
// Active Session
// ----------------------------------------------------------------------------

/// The one backend owned by the current session
pub(crate) struct Session {
    pub backend: Box<dyn TransportBackend>,
    pub capabilities: BackendCapabilities,
    /// Payload unit when the link is MTU-bounded; unframed links bypass the codec
    pub framing: Option<FrameUnit>,
}

impl Session {
    pub fn kind(&self) -> BackendKind {
        self.capabilities.kind
    }
}

/// Transition awaiting a backend confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InFlight {
    Activity { activity: Activity },
    Connect { peer: PeerId },
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub commands_processed: u64,
    pub commands_queued: u64,
    pub commands_dropped: u64,
    pub backend_events: u64,
    pub stale_events_dropped: u64,
    pub frames_sent: u64,
    pub messages_delivered: u64,
    pub inbound_dropped: u64,
    pub errors_reported: u64,
    pub sessions_started: u64,
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state: ConnectionState,
    pub advertising: bool,
    pub discovering: bool,
    pub backend: Option<BackendKind>,
    pub generation: Generation,
    pub peers: Vec<PeerRecord>,
    pub queued_commands: usize,
    pub pending_transfers: usize,
    pub history: Vec<TransitionRecord>,
    pub stats: EngineStats,
    pub bus: BusStats,
}
