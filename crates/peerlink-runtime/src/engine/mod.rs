//! Connection lifecycle engine
//!
//! Contains the engine actor split into focused modules:
//! - `task`: the actor struct, its select loop, stop and teardown
//! - `commands`: consumer command handlers
//! - `events`: backend event handlers
//! - `state`: session bookkeeping, statistics and snapshots

mod commands;
mod events;
mod state;
mod task;

pub use state::{EngineSnapshot, EngineStats};
pub(crate) use task::{Control, LifecycleEngine};
