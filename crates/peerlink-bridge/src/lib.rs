//! Bridges to platform peer-to-peer frameworks
//!
//! Neither framework has a Rust binding, so each backend is written against a
//! small platform trait that the embedding application implements over its
//! native SDK:
//!
//! - [`mesh`] - session-based framework: a local session object, a
//!   re-creatable advertiser and browser, invitations and reliable sends
//! - [`nearby`] - endpoint-based framework: asynchronous start results,
//!   connection requests and byte payloads
//!
//! Native callbacks may arrive on any thread; both backends funnel them into
//! the engine's event sink.

pub mod mesh;
pub mod nearby;

pub use mesh::{
    mesh_service_type, MeshBackend, MeshBackendConfig, MeshBackendFactory, MeshCallbacks,
    MeshPeerState, MeshPlatform, MeshSession,
};
pub use nearby::{
    NearbyBackend, NearbyBackendConfig, NearbyBackendFactory, NearbyCallbacks, NearbyClient,
    NearbyPayload, NearbyPlatform, NearbyStrategy, PendingHandshake,
};
