//! peerlink test harness
//!
//! Lets the engine and its backends run without radios:
//! - [`VirtualAir`]: an in-memory medium shared by any number of simulated
//!   devices. It hands out mesh platforms, nearby platforms and BLE driver
//!   providers, so the real backends run unchanged on top of it.
//! - [`ScriptedBackendFactory`]: a backend that records every call and lets a
//!   test inject events by hand, for exercising engine rules in isolation.

pub mod air;
pub mod ble;
pub mod mesh;
pub mod nearby;
pub mod scripted;

pub use air::VirtualAir;
pub use ble::{VirtualBleRadio, VirtualCentral, VirtualPeripheral};
pub use mesh::{VirtualMeshPlatform, VirtualMeshSession};
pub use nearby::{VirtualNearbyClient, VirtualNearbyPlatform};
pub use scripted::{BackendCall, ScriptedBackend, ScriptedBackendFactory, ScriptedHandle};
