//! peerlink core
//!
//! Transport-independent building blocks of the peerlink proximity engine: the
//! peer data model, the channel schema shared by the engine and its backends,
//! the backend capability contract, the permission gate, the peer registry,
//! the payload codec used for MTU-bounded links and the pure lifecycle state.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod codec;
pub mod config;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod permission;
pub mod registry;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use codec::{FrameHeader, FrameUnit, OutboundFrame, PayloadCodec, HEADER_LEN};
pub use config::{ChannelConfig, CodecConfig, EngineConfig, PeerlinkConfig};
pub use errors::{ErrorKind, PeerlinkError, Result, TransportError};
pub use events::{AppEvent, BackendEvent, BackendEventKind, Command, Recipient};
pub use lifecycle::{
    ConnectionState, LifecycleEvent, LifecycleState, StateTransition, StateTransitionError,
    TransitionRecord,
};
pub use permission::{
    CapabilityReport, GrantAll, PermissionGate, PermissionStatus, StaticPermissionGate,
};
pub use registry::{Observation, PeerRecord, PeerRegistry};
pub use transport::{
    BackendCapabilities, BackendEventSink, BackendFactory, SendTarget, SessionParams,
    TransportBackend,
};
pub use types::{
    Activity, BackendKind, Generation, LinkState, PeerId, RawPeerId, ServiceId, Timestamp,
};
