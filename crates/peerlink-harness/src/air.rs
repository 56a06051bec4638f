//! Shared virtual medium
//!
//! Every simulated device registers in one [`AirState`] behind a single lock.
//! Native callbacks fire while the lock is held; the backends' callback
//! paths only enqueue, so they never re-enter the medium.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use peerlink_ble::PowerState;
use peerlink_core::BackendKind;

use crate::ble::{BleAir, VirtualBleRadio};
use crate::mesh::{MeshAir, VirtualMeshPlatform};
use crate::nearby::{NearbyAir, VirtualNearbyPlatform};

#[derive(Default)]
pub(crate) struct AirState {
    unavailable: HashSet<BackendKind>,
    pub(crate) mesh: MeshAir,
    pub(crate) nearby: NearbyAir,
    pub(crate) ble: BleAir,
}

/// In-memory radio medium; clones share the same air
#[derive(Clone, Default)]
pub struct VirtualAir {
    state: Arc<Mutex<AirState>>,
}

impl VirtualAir {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Platform Handles
    // ------------------------------------------------------------------------

    /// Mesh framework entry point for one simulated device
    pub fn mesh_platform(&self) -> VirtualMeshPlatform {
        VirtualMeshPlatform::new(self.clone())
    }

    /// Nearby connections entry point for one simulated device
    pub fn nearby_platform(&self) -> VirtualNearbyPlatform {
        VirtualNearbyPlatform::new(self.clone())
    }

    /// BLE radio with a fixed device address
    pub fn ble_radio(&self, address: impl Into<String>) -> VirtualBleRadio {
        VirtualBleRadio::new(self.clone(), address.into())
    }

    // ------------------------------------------------------------------------
    // Fault Injection
    // ------------------------------------------------------------------------

    /// Make a whole transport family appear absent or present
    pub fn set_available(&self, kind: BackendKind, available: bool) {
        let mut state = self.lock();
        if available {
            state.unavailable.remove(&kind);
        } else {
            state.unavailable.insert(kind);
        }
        debug!(backend = %kind, available, "Virtual transport availability changed");
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        !self.lock().unavailable.contains(&kind)
    }

    /// Toggle both radio roles of one BLE device
    pub fn set_ble_power(&self, address: &str, power: PowerState) {
        self.lock().ble.set_power(address, power);
    }

    /// Refuse or allow incoming BLE connections to a device
    pub fn set_ble_reachable(&self, address: &str, reachable: bool) {
        self.lock().ble.set_reachable(address, reachable);
    }

    /// A mesh peer walks out of range: browsers lose it and its links drop
    pub fn mesh_peer_vanished(&self, name: &str) {
        self.lock().mesh.vanish(name);
    }

    /// A nearby endpoint walks out of range
    pub fn nearby_endpoint_vanished(&self, endpoint: &str) {
        self.lock().nearby.vanish(endpoint);
    }
}

impl std::fmt::Debug for VirtualAir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("VirtualAir")
            .field("unavailable", &state.unavailable)
            .field("mesh_nodes", &state.mesh.len())
            .field("nearby_endpoints", &state.nearby.len())
            .field("ble_devices", &state.ble.len())
            .finish()
    }
}
