//! Virtual nearby connections service
//!
//! Each client gets an endpoint id (`ep-1`, `ep-2`, ...). A connection
//! request raises "initiated" on both sides and comes up only once both
//! sides have accepted it, mirroring the two-sided handshake of the native
//! service.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tracing::{debug, info};

use peerlink_bridge::{
    NearbyCallbacks, NearbyClient, NearbyPayload, NearbyPlatform, NearbyStrategy, PendingHandshake,
};
use peerlink_core::{BackendKind, TransportError};

use crate::air::VirtualAir;

// ----------------------------------------------------------------------------
// Medium State
// ----------------------------------------------------------------------------

struct Endpoint {
    name: String,
    callbacks: NearbyCallbacks,
    advertising: Option<String>,
    discovering: Option<String>,
    /// Endpoints with an initiated, not yet completed, connection
    pending: HashSet<String>,
    accepted: HashSet<String>,
    connected: HashSet<String>,
}

#[derive(Default)]
pub(crate) struct NearbyAir {
    endpoints: HashMap<String, Endpoint>,
    next_id: u64,
}

impl NearbyAir {
    pub(crate) fn len(&self) -> usize {
        self.endpoints.len()
    }

    fn endpoint(&self, id: &str) -> Result<&Endpoint, TransportError> {
        self.endpoints
            .get(id)
            .ok_or_else(|| TransportError::unavailable("nearby client closed"))
    }

    fn endpoint_mut(&mut self, id: &str) -> Result<&mut Endpoint, TransportError> {
        self.endpoints
            .get_mut(id)
            .ok_or_else(|| TransportError::unavailable("nearby client closed"))
    }

    fn join(&mut self, callbacks: NearbyCallbacks) -> String {
        self.next_id += 1;
        let id = format!("ep-{}", self.next_id);
        self.endpoints.insert(
            id.clone(),
            Endpoint {
                name: String::new(),
                callbacks,
                advertising: None,
                discovering: None,
                pending: HashSet::new(),
                accepted: HashSet::new(),
                connected: HashSet::new(),
            },
        );
        id
    }

    fn leave(&mut self, id: &str) {
        self.stop_advertising(id);
        self.disconnect_all(id);
        self.endpoints.remove(id);
    }

    fn start_advertising(&mut self, id: &str, name: &str, service: &str) -> Result<(), TransportError> {
        let endpoint = self.endpoint_mut(id)?;
        endpoint.name = name.to_string();
        endpoint.advertising = Some(service.to_string());
        for (other_id, other) in &self.endpoints {
            if other_id != id && other.discovering.as_deref() == Some(service) {
                other.callbacks.on_endpoint_found(id, name);
            }
        }
        Ok(())
    }

    fn stop_advertising(&mut self, id: &str) {
        let Some(service) = self
            .endpoints
            .get_mut(id)
            .and_then(|endpoint| endpoint.advertising.take())
        else {
            return;
        };
        for (other_id, other) in &self.endpoints {
            if other_id != id && other.discovering.as_deref() == Some(service.as_str()) {
                other.callbacks.on_endpoint_lost(id);
            }
        }
    }

    fn start_discovery(&mut self, id: &str, service: &str) -> Result<(), TransportError> {
        let endpoint = self.endpoint_mut(id)?;
        endpoint.discovering = Some(service.to_string());
        let callbacks = endpoint.callbacks.clone();
        let visible: Vec<(String, String)> = self
            .endpoints
            .iter()
            .filter(|(other_id, other)| {
                other_id.as_str() != id && other.advertising.as_deref() == Some(service)
            })
            .map(|(other_id, other)| (other_id.clone(), other.name.clone()))
            .collect();
        for (other_id, name) in visible {
            callbacks.on_endpoint_found(&other_id, &name);
        }
        Ok(())
    }

    fn stop_discovery(&mut self, id: &str) {
        if let Some(endpoint) = self.endpoints.get_mut(id) {
            endpoint.discovering = None;
        }
    }

    fn request_connection(
        &mut self,
        id: &str,
        local_name: &str,
        target: &str,
    ) -> Result<(), TransportError> {
        let target_name = match self.endpoints.get(target) {
            Some(other) if target != id && other.advertising.is_some() => other.name.clone(),
            _ => {
                return Err(TransportError::PeerNotFound {
                    peer: target.to_string(),
                })
            }
        };

        let endpoint = self.endpoint_mut(id)?;
        if endpoint.name.is_empty() {
            endpoint.name = local_name.to_string();
        }
        endpoint.pending.insert(target.to_string());
        let callbacks = endpoint.callbacks.clone();

        let other = self.endpoint_mut(target)?;
        other.pending.insert(id.to_string());
        other.callbacks.on_connection_initiated(id, local_name);
        callbacks.on_connection_initiated(target, &target_name);
        Ok(())
    }

    fn accept_connection(&mut self, id: &str, target: &str) -> Result<(), TransportError> {
        let endpoint = self.endpoint_mut(id)?;
        if !endpoint.pending.contains(target) {
            return Err(TransportError::PeerNotFound {
                peer: target.to_string(),
            });
        }
        endpoint.accepted.insert(target.to_string());

        let both = self
            .endpoints
            .get(target)
            .is_some_and(|other| other.accepted.contains(id));
        if !both {
            return Ok(());
        }

        for (this, that) in [(id, target), (target, id)] {
            if let Some(endpoint) = self.endpoints.get_mut(this) {
                endpoint.pending.remove(that);
                endpoint.accepted.remove(that);
                endpoint.connected.insert(that.to_string());
                endpoint.callbacks.on_connection_result(that, true);
            }
        }
        debug!(a = id, b = target, "Virtual nearby connection established");
        Ok(())
    }

    fn send_payload(&self, id: &str, targets: &[String], bytes: &[u8]) -> Result<(), TransportError> {
        let endpoint = self.endpoint(id)?;
        let mut recipients = Vec::with_capacity(targets.len());
        for target in targets {
            let other = self
                .endpoints
                .get(target)
                .filter(|_| endpoint.connected.contains(target))
                .ok_or_else(|| TransportError::not_connected(target.clone()))?;
            recipients.push(other.callbacks.clone());
        }
        for callbacks in recipients {
            callbacks.on_payload_received(id, NearbyPayload::Bytes(bytes.to_vec()));
        }
        Ok(())
    }

    fn disconnect_all(&mut self, id: &str) {
        let Some(endpoint) = self.endpoints.get_mut(id) else {
            return;
        };
        let peers: Vec<String> = endpoint.connected.drain().collect();
        endpoint.pending.clear();
        endpoint.accepted.clear();
        let callbacks = endpoint.callbacks.clone();
        for other_id in peers {
            if let Some(other) = self.endpoints.get_mut(&other_id) {
                other.connected.remove(id);
                other.callbacks.on_disconnected(id);
            }
            callbacks.on_disconnected(&other_id);
        }
    }

    pub(crate) fn vanish(&mut self, id: &str) {
        info!(endpoint = id, "Virtual nearby endpoint out of range");
        self.stop_advertising(id);
        self.stop_discovery(id);
        self.disconnect_all(id);
    }
}

// ----------------------------------------------------------------------------
// Platform & Client
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VirtualNearbyPlatform {
    air: VirtualAir,
}

impl VirtualNearbyPlatform {
    pub(crate) fn new(air: VirtualAir) -> Self {
        Self { air }
    }
}

impl NearbyPlatform for VirtualNearbyPlatform {
    fn is_available(&self) -> bool {
        self.air.is_available(BackendKind::Nearby)
    }

    fn open(&self, callbacks: NearbyCallbacks) -> Result<Box<dyn NearbyClient>, TransportError> {
        if !self.is_available() {
            return Err(TransportError::unavailable("virtual nearby service is switched off"));
        }
        let endpoint = self.air.lock().nearby.join(callbacks);
        debug!(%endpoint, "Virtual nearby client opened");
        Ok(Box::new(VirtualNearbyClient {
            air: self.air.clone(),
            endpoint,
        }))
    }
}

/// Client bound to one endpoint id; dropping it leaves the air
pub struct VirtualNearbyClient {
    air: VirtualAir,
    endpoint: String,
}

impl VirtualNearbyClient {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl NearbyClient for VirtualNearbyClient {
    async fn start_advertising(
        &mut self,
        endpoint_name: &str,
        service_id: &str,
        strategy: NearbyStrategy,
    ) -> Result<(), TransportError> {
        debug!(endpoint = %self.endpoint, %strategy, "Virtual nearby advertising");
        self.air
            .lock()
            .nearby
            .start_advertising(&self.endpoint, endpoint_name, service_id)
    }

    async fn stop_advertising(&mut self) {
        self.air.lock().nearby.stop_advertising(&self.endpoint);
    }

    async fn start_discovery(
        &mut self,
        service_id: &str,
        _strategy: NearbyStrategy,
    ) -> Result<(), TransportError> {
        self.air
            .lock()
            .nearby
            .start_discovery(&self.endpoint, service_id)
    }

    async fn stop_discovery(&mut self) {
        self.air.lock().nearby.stop_discovery(&self.endpoint);
    }

    fn request_connection(&mut self, local_name: &str, endpoint_id: &str) -> PendingHandshake {
        let air = self.air.clone();
        let endpoint = self.endpoint.clone();
        let local_name = local_name.to_string();
        let target = endpoint_id.to_string();
        Box::pin(async move {
            air.lock()
                .nearby
                .request_connection(&endpoint, &local_name, &target)
        })
    }

    fn accept_connection(&mut self, endpoint_id: &str) -> PendingHandshake {
        let air = self.air.clone();
        let endpoint = self.endpoint.clone();
        let target = endpoint_id.to_string();
        Box::pin(async move { air.lock().nearby.accept_connection(&endpoint, &target) })
    }

    async fn send_payload(
        &mut self,
        endpoint_ids: &[String],
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.air
            .lock()
            .nearby
            .send_payload(&self.endpoint, endpoint_ids, &bytes)
    }

    async fn stop_all_endpoints(&mut self) {
        self.air.lock().nearby.disconnect_all(&self.endpoint);
    }
}

impl Drop for VirtualNearbyClient {
    fn drop(&mut self) {
        self.air.lock().nearby.leave(&self.endpoint);
    }
}
