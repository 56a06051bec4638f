//! Virtual mesh framework
//!
//! Sessions are identified by their display name, exactly like the native
//! framework. Browsers see advertisers of the same service type; an
//! invitation is always accepted on behalf of the invitee, after its
//! delegate has been told about it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, info};

use peerlink_bridge::{MeshBackendConfig, MeshCallbacks, MeshPeerState, MeshPlatform, MeshSession};
use peerlink_core::{BackendKind, TransportError};

use crate::air::VirtualAir;

// ----------------------------------------------------------------------------
// Medium State
// ----------------------------------------------------------------------------

struct MeshNode {
    name: String,
    callbacks: MeshCallbacks,
    advertising: Option<String>,
    browsing: Option<String>,
    connected: HashSet<u64>,
}

#[derive(Default)]
pub(crate) struct MeshAir {
    nodes: HashMap<u64, MeshNode>,
    next_id: u64,
}

impl MeshAir {
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, id: u64) -> Result<&MeshNode, TransportError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| TransportError::unavailable("mesh session closed"))
    }

    fn join(&mut self, name: &str, callbacks: MeshCallbacks) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.nodes.insert(
            id,
            MeshNode {
                name: name.to_string(),
                callbacks,
                advertising: None,
                browsing: None,
                connected: HashSet::new(),
            },
        );
        id
    }

    fn leave(&mut self, id: u64) {
        self.withdraw(id);
        self.disconnect_all(id);
        self.nodes.remove(&id);
    }

    fn advertise(&mut self, id: u64, service_type: &str) -> Result<(), TransportError> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| TransportError::unavailable("mesh session closed"))?;
        node.advertising = Some(service_type.to_string());
        let name = node.name.clone();
        for (other_id, other) in &self.nodes {
            if *other_id != id && other.browsing.as_deref() == Some(service_type) {
                other.callbacks.found_peer(&name);
            }
        }
        Ok(())
    }

    fn withdraw(&mut self, id: u64) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let Some(service_type) = node.advertising.take() else {
            return;
        };
        let name = node.name.clone();
        for (other_id, other) in &self.nodes {
            if *other_id != id && other.browsing.as_deref() == Some(service_type.as_str()) {
                other.callbacks.lost_peer(&name);
            }
        }
    }

    fn browse(&mut self, id: u64, service_type: Option<&str>) -> Result<(), TransportError> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| TransportError::unavailable("mesh session closed"))?;
        node.browsing = service_type.map(str::to_string);
        let Some(service_type) = service_type else {
            return Ok(());
        };
        let callbacks = node.callbacks.clone();
        let visible: Vec<String> = self
            .nodes
            .iter()
            .filter(|(other_id, other)| {
                **other_id != id && other.advertising.as_deref() == Some(service_type)
            })
            .map(|(_, other)| other.name.clone())
            .collect();
        for name in visible {
            callbacks.found_peer(&name);
        }
        Ok(())
    }

    fn invite(&mut self, id: u64, peer: &str) -> Result<(), TransportError> {
        let target = self
            .nodes
            .iter()
            .find(|(other_id, other)| {
                **other_id != id && other.name == peer && other.advertising.is_some()
            })
            .map(|(other_id, _)| *other_id)
            .ok_or_else(|| TransportError::PeerNotFound {
                peer: peer.to_string(),
            })?;

        let node = self.node(id)?;
        let name = node.name.clone();
        let callbacks = node.callbacks.clone();
        if node.connected.contains(&target) {
            callbacks.state_changed(peer, MeshPeerState::Connected);
            return Ok(());
        }
        let target_callbacks = self.node(target)?.callbacks.clone();

        callbacks.state_changed(peer, MeshPeerState::Connecting);
        if !target_callbacks.invitation_received(&name) {
            callbacks.state_changed(peer, MeshPeerState::NotConnected);
            return Ok(());
        }
        target_callbacks.state_changed(&name, MeshPeerState::Connecting);

        if let Some(node) = self.nodes.get_mut(&id) {
            node.connected.insert(target);
        }
        if let Some(other) = self.nodes.get_mut(&target) {
            other.connected.insert(id);
        }
        debug!(from = %name, to = peer, "Virtual mesh link established");
        target_callbacks.state_changed(&name, MeshPeerState::Connected);
        callbacks.state_changed(peer, MeshPeerState::Connected);
        Ok(())
    }

    fn deliver(&self, id: u64, peers: &[String], bytes: &[u8]) -> Result<(), TransportError> {
        let node = self.node(id)?;
        let mut targets = Vec::with_capacity(peers.len());
        for peer in peers {
            let target = node
                .connected
                .iter()
                .filter_map(|other| self.nodes.get(other))
                .find(|other| other.name == *peer)
                .ok_or_else(|| TransportError::not_connected(peer.clone()))?;
            targets.push(target.callbacks.clone());
        }
        for callbacks in targets {
            callbacks.data_received(&node.name, bytes.to_vec());
        }
        Ok(())
    }

    fn connected_names(&self, id: u64) -> Vec<String> {
        let Some(node) = self.nodes.get(&id) else {
            return Vec::new();
        };
        node.connected
            .iter()
            .filter_map(|other| self.nodes.get(other))
            .map(|other| other.name.clone())
            .collect()
    }

    /// Drop every link of `id`, telling both ends
    fn disconnect_all(&mut self, id: u64) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let peers: Vec<u64> = node.connected.drain().collect();
        let name = node.name.clone();
        let callbacks = node.callbacks.clone();
        for other_id in peers {
            if let Some(other) = self.nodes.get_mut(&other_id) {
                other.connected.remove(&id);
                other.callbacks.state_changed(&name, MeshPeerState::NotConnected);
                callbacks.state_changed(&other.name, MeshPeerState::NotConnected);
            }
        }
    }

    pub(crate) fn vanish(&mut self, name: &str) {
        let ids: Vec<u64> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.name == name)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            info!(peer = name, "Virtual mesh peer out of range");
            self.withdraw(id);
            if let Some(node) = self.nodes.get_mut(&id) {
                node.browsing = None;
            }
            self.disconnect_all(id);
        }
    }
}

// ----------------------------------------------------------------------------
// Platform & Session
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VirtualMeshPlatform {
    air: VirtualAir,
}

impl VirtualMeshPlatform {
    pub(crate) fn new(air: VirtualAir) -> Self {
        Self { air }
    }
}

impl MeshPlatform for VirtualMeshPlatform {
    fn is_available(&self) -> bool {
        self.air.is_available(BackendKind::Mesh)
    }

    fn open_session(
        &self,
        local_name: &str,
        config: &MeshBackendConfig,
        callbacks: MeshCallbacks,
    ) -> Result<Box<dyn MeshSession>, TransportError> {
        if !self.is_available() {
            return Err(TransportError::unavailable("virtual mesh is switched off"));
        }
        let id = self.air.lock().mesh.join(local_name, callbacks);
        debug!(
            name = local_name,
            encryption = config.encryption_required,
            id,
            "Virtual mesh session opened"
        );
        Ok(Box::new(VirtualMeshSession {
            air: self.air.clone(),
            id,
        }))
    }
}

/// Session handle; dropping it leaves the air
pub struct VirtualMeshSession {
    air: VirtualAir,
    id: u64,
}

impl MeshSession for VirtualMeshSession {
    fn start_advertiser(&mut self, service_type: &str) -> Result<(), TransportError> {
        self.air.lock().mesh.advertise(self.id, service_type)
    }

    fn stop_advertiser(&mut self) {
        self.air.lock().mesh.withdraw(self.id);
    }

    fn start_browser(&mut self, service_type: &str) -> Result<(), TransportError> {
        self.air.lock().mesh.browse(self.id, Some(service_type))
    }

    fn stop_browser(&mut self) {
        let _ = self.air.lock().mesh.browse(self.id, None);
    }

    fn invite(&mut self, peer: &str, timeout: Duration) -> Result<(), TransportError> {
        debug!(peer, ?timeout, "Virtual mesh invite");
        self.air.lock().mesh.invite(self.id, peer)
    }

    fn send(&mut self, peers: &[String], bytes: &[u8]) -> Result<(), TransportError> {
        self.air.lock().mesh.deliver(self.id, peers, bytes)
    }

    fn connected_peers(&self) -> Vec<String> {
        self.air.lock().mesh.connected_names(self.id)
    }

    fn disconnect(&mut self) {
        self.air.lock().mesh.disconnect_all(self.id);
    }
}

impl Drop for VirtualMeshSession {
    fn drop(&mut self) {
        self.air.lock().mesh.leave(self.id);
    }
}
