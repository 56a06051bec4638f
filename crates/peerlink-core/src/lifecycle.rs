//! Connection lifecycle state
//!
//! The engine tracks a handful of facts (which activities run, which peer is
//! being connected, which peers are connected) and derives the single public
//! [`ConnectionState`] from them. Every fact change goes through
//! [`LifecycleState::apply`], which rejects transitions the engine must never
//! make and returns an audit record for the ones it does.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::types::{Activity, PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Public engine state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "peers", rename_all = "camelCase")]
pub enum ConnectionState {
    Idle,
    Advertising,
    Discovering,
    Connecting(PeerId),
    Connected(BTreeSet<PeerId>),
    Disconnecting,
}

impl ConnectionState {
    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Advertising => "Advertising",
            ConnectionState::Discovering => "Discovering",
            ConnectionState::Connecting(_) => "Connecting",
            ConnectionState::Connected(_) => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ConnectionState::Idle)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting(peer) => write!(f, "Connecting({peer})"),
            ConnectionState::Connected(peers) => {
                let peers: Vec<String> = peers.iter().map(ToString::to_string).collect();
                write!(f, "Connected({})", peers.join(", "))
            }
            other => f.write_str(other.state_name()),
        }
    }
}

// ----------------------------------------------------------------------------
// Lifecycle Events
// ----------------------------------------------------------------------------

/// Fact changes the engine applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    ActivityStarted(Activity),
    ActivityEnded(Activity),
    /// Outbound invite issued, or an inbound invitation auto-accepted
    ConnectRequested(PeerId),
    /// The in-flight connect did not complete
    ConnectFailed(PeerId),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    StopRequested,
    StopCompleted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },
}

/// Audit trail entry for a state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub timestamp: Timestamp,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
}

/// Result of applying a lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub record: TransitionRecord,
}

impl StateTransition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

// ----------------------------------------------------------------------------
// Lifecycle State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleState {
    advertising: bool,
    discovering: bool,
    connecting: Option<PeerId>,
    connected: BTreeSet<PeerId>,
    stopping: bool,
}

impl LifecycleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the public state from the tracked facts
    pub fn current(&self) -> ConnectionState {
        if self.stopping {
            ConnectionState::Disconnecting
        } else if let Some(peer) = self.connecting {
            ConnectionState::Connecting(peer)
        } else if !self.connected.is_empty() {
            ConnectionState::Connected(self.connected.clone())
        } else if self.discovering {
            ConnectionState::Discovering
        } else if self.advertising {
            ConnectionState::Advertising
        } else {
            ConnectionState::Idle
        }
    }

    pub fn is_active(&self, activity: Activity) -> bool {
        match activity {
            Activity::Advertising => self.advertising,
            Activity::Discovery => self.discovering,
        }
    }

    pub fn any_activity(&self) -> bool {
        self.advertising || self.discovering
    }

    pub fn connecting(&self) -> Option<PeerId> {
        self.connecting
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.connected.contains(&peer)
    }

    pub fn connected(&self) -> &BTreeSet<PeerId> {
        &self.connected
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Apply one fact change
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<StateTransition, StateTransitionError> {
        let from = self.current();
        let event_name = format!("{event:?}");

        if self.stopping && event != LifecycleEvent::StopCompleted {
            return Err(StateTransitionError::InvalidTransition {
                from: from.to_string(),
                event: event_name,
            });
        }

        match event {
            LifecycleEvent::ActivityStarted(activity) => self.set_activity(activity, true),
            LifecycleEvent::ActivityEnded(activity) => self.set_activity(activity, false),
            LifecycleEvent::ConnectRequested(peer) => {
                if self.connecting.is_some() || self.connected.contains(&peer) {
                    return Err(StateTransitionError::InvalidTransition {
                        from: from.to_string(),
                        event: event_name,
                    });
                }
                self.connecting = Some(peer);
            }
            LifecycleEvent::ConnectFailed(peer) => {
                if self.connecting != Some(peer) {
                    return Err(StateTransitionError::InvalidTransition {
                        from: from.to_string(),
                        event: event_name,
                    });
                }
                self.connecting = None;
            }
            LifecycleEvent::PeerConnected(peer) => {
                if self.connecting == Some(peer) {
                    self.connecting = None;
                }
                self.connected.insert(peer);
            }
            LifecycleEvent::PeerDisconnected(peer) => {
                if !self.connected.remove(&peer) {
                    return Err(StateTransitionError::InvalidTransition {
                        from: from.to_string(),
                        event: event_name,
                    });
                }
            }
            LifecycleEvent::StopRequested => {
                self.stopping = true;
            }
            LifecycleEvent::StopCompleted => {
                *self = Self::default();
            }
        }

        let to = self.current();
        Ok(StateTransition {
            record: TransitionRecord {
                timestamp: Timestamp::now(),
                from_state: from.to_string(),
                to_state: to.to_string(),
                event: event_name,
            },
            from,
            to,
        })
    }

    fn set_activity(&mut self, activity: Activity, active: bool) {
        match activity {
            Activity::Advertising => self.advertising = active,
            Activity::Discovery => self.discovering = active,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_peer_id(id: u32) -> PeerId {
        PeerId::new(id)
    }

    #[test]
    fn test_initial_state() {
        let state = LifecycleState::new();
        assert_eq!(state.current(), ConnectionState::Idle);
        assert!(!state.any_activity());
    }

    #[test]
    fn test_discovery_takes_precedence_over_advertising() {
        let mut state = LifecycleState::new();
        let t = state
            .apply(LifecycleEvent::ActivityStarted(Activity::Advertising))
            .unwrap();
        assert_eq!(t.to, ConnectionState::Advertising);
        assert_eq!(t.record.from_state, "Idle");
        assert_eq!(t.record.to_state, "Advertising");

        state
            .apply(LifecycleEvent::ActivityStarted(Activity::Discovery))
            .unwrap();
        assert_eq!(state.current(), ConnectionState::Discovering);
    }

    #[test]
    fn test_connection_flow() {
        let peer = create_test_peer_id(1);
        let mut state = LifecycleState::new();
        state
            .apply(LifecycleEvent::ActivityStarted(Activity::Discovery))
            .unwrap();

        let t = state.apply(LifecycleEvent::ConnectRequested(peer)).unwrap();
        assert_eq!(t.to, ConnectionState::Connecting(peer));

        let t = state.apply(LifecycleEvent::PeerConnected(peer)).unwrap();
        assert_eq!(t.to, ConnectionState::Connected(BTreeSet::from([peer])));

        let t = state.apply(LifecycleEvent::PeerDisconnected(peer)).unwrap();
        assert_eq!(t.to, ConnectionState::Discovering);
    }

    #[test]
    fn test_failed_connect_reverts_to_prior_stable_state() {
        let a = create_test_peer_id(1);
        let b = create_test_peer_id(2);
        let mut state = LifecycleState::new();
        state
            .apply(LifecycleEvent::ActivityStarted(Activity::Advertising))
            .unwrap();
        state.apply(LifecycleEvent::ConnectRequested(a)).unwrap();
        state.apply(LifecycleEvent::PeerConnected(a)).unwrap();

        state.apply(LifecycleEvent::ConnectRequested(b)).unwrap();
        let t = state.apply(LifecycleEvent::ConnectFailed(b)).unwrap();
        assert_eq!(t.from, ConnectionState::Connecting(b));
        assert_eq!(t.to, ConnectionState::Connected(BTreeSet::from([a])));
    }

    #[test]
    fn test_idle_when_last_peer_leaves_without_activity() {
        let peer = create_test_peer_id(1);
        let mut state = LifecycleState::new();
        state.apply(LifecycleEvent::PeerConnected(peer)).unwrap();
        let t = state.apply(LifecycleEvent::PeerDisconnected(peer)).unwrap();
        assert_eq!(t.to, ConnectionState::Idle);
    }

    #[test]
    fn test_invalid_transitions() {
        let a = create_test_peer_id(1);
        let b = create_test_peer_id(2);
        let mut state = LifecycleState::new();

        assert!(state.apply(LifecycleEvent::PeerDisconnected(a)).is_err());
        assert!(state.apply(LifecycleEvent::ConnectFailed(a)).is_err());

        state.apply(LifecycleEvent::ConnectRequested(a)).unwrap();
        assert!(state.apply(LifecycleEvent::ConnectRequested(b)).is_err());
        assert_eq!(state.current(), ConnectionState::Connecting(a));
    }

    #[test]
    fn test_stop_from_any_state() {
        let peer = create_test_peer_id(1);
        let mut state = LifecycleState::new();
        state
            .apply(LifecycleEvent::ActivityStarted(Activity::Discovery))
            .unwrap();
        state.apply(LifecycleEvent::PeerConnected(peer)).unwrap();

        let t = state.apply(LifecycleEvent::StopRequested).unwrap();
        assert_eq!(t.to, ConnectionState::Disconnecting);
        assert!(state.is_stopping());
        assert!(state
            .apply(LifecycleEvent::ActivityStarted(Activity::Advertising))
            .is_err());

        let t = state.apply(LifecycleEvent::StopCompleted).unwrap();
        assert_eq!(t.to, ConnectionState::Idle);
        assert!(!state.is_stopping());
        assert_eq!(state, LifecycleState::new());
    }

    #[test]
    fn test_state_serialization() {
        let peers = BTreeSet::from([create_test_peer_id(1), create_test_peer_id(2)]);
        let json = serde_json::to_value(ConnectionState::Connected(peers)).unwrap();
        assert_eq!(json, serde_json::json!({"state": "connected", "peers": [1, 2]}));
        let json = serde_json::to_value(ConnectionState::Idle).unwrap();
        assert_eq!(json, serde_json::json!({"state": "idle"}));
    }
}
