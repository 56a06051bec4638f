//! peerlink runtime
//!
//! Hosts the connection lifecycle engine:
//! - `LifecycleEngine`: the single actor task owning state, registry, codec and backend
//! - `EventBus`: ordered single-consumer delivery of normalized events
//! - `RuntimeBuilder` / `PeerlinkHandle`: how a consumer starts and drives the engine

pub mod builder;
pub mod bus;
pub mod engine;

pub use builder::{PeerlinkHandle, RuntimeBuilder};
pub use bus::{BusStats, EventBus, EventStream};
pub use engine::{EngineSnapshot, EngineStats};

// Re-export core types for convenience
pub use peerlink_core::{
    Activity, AppEvent, BackendFactory, BackendKind, ConnectionState, ErrorKind, LinkState,
    PeerId, PeerlinkConfig, PeerlinkError, Recipient, Result, ServiceId,
};
