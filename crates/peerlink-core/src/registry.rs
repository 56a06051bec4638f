//! Peer registry
//!
//! Keys peers by `(backend, raw id)` and hands out session-scoped logical ids.
//! Repeated discovery reports of the same peer refresh its record instead of
//! producing a second `peerFound`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::types::{BackendKind, PeerId, RawPeerId, Timestamp};
use crate::{PeerlinkError, Result};

// ----------------------------------------------------------------------------
// Peer Record
// ----------------------------------------------------------------------------

/// What the engine knows about one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub logical_id: PeerId,
    pub raw_id: RawPeerId,
    pub display_name: String,
    pub backend: BackendKind,
    pub discovered_at: Timestamp,
    pub rssi: Option<i16>,
}

/// Outcome of a discovery report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// First sighting in this session
    Found(PeerRecord),
    /// Known peer whose name or signal strength changed
    Updated(PeerRecord),
    /// Known peer, nothing new
    Unchanged(PeerId),
}

type RegistryKey = (BackendKind, RawPeerId);

// ----------------------------------------------------------------------------
// Peer Registry
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PeerRegistry {
    /// Every key seen this session keeps its id, even after loss
    ids: HashMap<RegistryKey, PeerId>,
    records: BTreeMap<PeerId, PeerRecord>,
    next_id: u32,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn id_for(&mut self, backend: BackendKind, raw_id: &RawPeerId) -> PeerId {
        let next_id = &mut self.next_id;
        *self
            .ids
            .entry((backend, raw_id.clone()))
            .or_insert_with(|| {
                *next_id += 1;
                PeerId::new(*next_id)
            })
    }

    /// Record a discovery report
    pub fn observe_found(
        &mut self,
        backend: BackendKind,
        raw_id: &RawPeerId,
        display_name: &str,
        rssi: Option<i16>,
    ) -> Observation {
        let logical_id = self.id_for(backend, raw_id);
        match self.records.get_mut(&logical_id) {
            Some(record) => {
                let renamed = record.display_name != display_name;
                let moved = rssi.is_some() && record.rssi != rssi;
                if !renamed && !moved {
                    return Observation::Unchanged(logical_id);
                }
                if renamed {
                    record.display_name = display_name.to_string();
                }
                if moved {
                    record.rssi = rssi;
                }
                Observation::Updated(record.clone())
            }
            None => {
                let record = PeerRecord {
                    logical_id,
                    raw_id: raw_id.clone(),
                    display_name: display_name.to_string(),
                    backend,
                    discovered_at: Timestamp::now(),
                    rssi,
                };
                self.records.insert(logical_id, record.clone());
                Observation::Found(record)
            }
        }
    }

    /// Register a peer first seen through an inbound invitation or link
    ///
    /// Returns the logical id; an existing record is left as it is.
    pub fn observe_inbound(
        &mut self,
        backend: BackendKind,
        raw_id: &RawPeerId,
        display_name: &str,
    ) -> PeerId {
        let logical_id = self.id_for(backend, raw_id);
        self.records.entry(logical_id).or_insert_with(|| PeerRecord {
            logical_id,
            raw_id: raw_id.clone(),
            display_name: display_name.to_string(),
            backend,
            discovered_at: Timestamp::now(),
            rssi: None,
        });
        logical_id
    }

    /// Remove a peer; `None` if it was not present
    pub fn observe_lost(&mut self, backend: BackendKind, raw_id: &RawPeerId) -> Option<PeerRecord> {
        let logical_id = self.ids.get(&(backend, raw_id.clone()))?;
        self.records.remove(logical_id)
    }

    /// Translate a consumer-facing id into its record
    pub fn resolve(&self, logical_id: PeerId) -> Result<&PeerRecord> {
        self.records
            .get(&logical_id)
            .ok_or(PeerlinkError::UnknownPeer { peer: logical_id })
    }

    /// Logical id of a present peer
    pub fn lookup(&self, backend: BackendKind, raw_id: &RawPeerId) -> Option<PeerId> {
        self.ids
            .get(&(backend, raw_id.clone()))
            .copied()
            .filter(|id| self.records.contains_key(id))
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget everything, including retained ids (session end)
    pub fn clear(&mut self) {
        self.ids.clear();
        self.records.clear();
        self.next_id = 0;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
