//! Backend event handlers
//!
//! Events are applied strictly in arrival order. Anything stamped with a
//! superseded generation comes from a backend that has already been torn
//! down and is dropped before it can touch state.

use tracing::{debug, info, trace, warn};

use peerlink_core::{
    Activity, AppEvent, BackendEvent, BackendEventKind, LifecycleEvent, LinkState, Observation,
    OutboundFrame, PeerId, PeerlinkError, RawPeerId, TransportError,
};

use super::state::InFlight;
use super::task::LifecycleEngine;

impl LifecycleEngine {
    pub(super) fn handle_backend_event(&mut self, event: BackendEvent) {
        let current_backend = self.session.as_ref().map(|s| s.kind());
        if event.generation != self.generation || current_backend != Some(event.backend) {
            trace!(
                event = event.kind.name(),
                backend = %event.backend,
                generation = %event.generation,
                current = %self.generation,
                "Dropping stale backend event"
            );
            self.stats.stale_events_dropped += 1;
            return;
        }
        self.stats.backend_events += 1;

        match event.kind {
            BackendEventKind::PeerFound {
                peer,
                display_name,
                rssi,
            } => self.on_peer_found(peer, display_name, rssi),
            BackendEventKind::PeerLost { peer } => self.on_peer_lost(peer),
            BackendEventKind::InvitationReceived { peer, display_name } => {
                self.on_invitation(peer, display_name)
            }
            BackendEventKind::ConnectionStateChanged { peer, state } => {
                self.on_link_state(peer, state)
            }
            BackendEventKind::DataReceived { peer, bytes } => self.on_data(peer, bytes),
            BackendEventKind::TransportFault { message } => self.on_fault(message),
            BackendEventKind::ActivityStarted { activity } => self.on_activity_started(activity),
            BackendEventKind::ActivityFailed { activity, reason } => {
                self.on_activity_failed(activity, reason)
            }
            BackendEventKind::ActivityStopped { activity, reason } => {
                self.on_activity_stopped(activity, reason)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------------

    fn on_peer_found(&mut self, raw_id: RawPeerId, display_name: String, rssi: Option<i16>) {
        let Some(kind) = self.session.as_ref().map(|s| s.kind()) else {
            return;
        };
        match self
            .registry
            .observe_found(kind, &raw_id, &display_name, rssi)
        {
            Observation::Found(record) => {
                info!(peer = %record.logical_id, name = %record.display_name, "Peer found");
                self.publish(AppEvent::PeerFound {
                    peer_id: record.logical_id,
                    display_name: record.display_name,
                    rssi: record.rssi,
                });
            }
            Observation::Updated(record) => {
                debug!(peer = %record.logical_id, "Peer metadata updated");
                self.publish(AppEvent::PeerUpdated {
                    peer_id: record.logical_id,
                    display_name: record.display_name,
                    rssi: record.rssi,
                });
            }
            Observation::Unchanged(_) => {}
        }
    }

    fn on_peer_lost(&mut self, raw_id: RawPeerId) {
        let Some(kind) = self.session.as_ref().map(|s| s.kind()) else {
            return;
        };
        let Some(peer) = self.registry.lookup(kind, &raw_id) else {
            trace!(%raw_id, "Loss reported for unknown peer");
            return;
        };

        // A lost peer cannot stay connected
        if self.lifecycle.connecting() == Some(peer) {
            self.fail_connect(peer, "peer was lost".to_string());
        } else if self.lifecycle.is_connected(peer) {
            self.disconnect_peer(peer);
        }

        if self.registry.observe_lost(kind, &raw_id).is_some() {
            info!(%peer, "Peer lost");
            self.publish(AppEvent::PeerLost { peer_id: peer });
        }
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    fn on_invitation(&mut self, raw_id: RawPeerId, display_name: String) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let kind = session.kind();
        let auto_accepts = session.capabilities.auto_accepts_invitations;

        let peer = self.registry.observe_inbound(kind, &raw_id, &display_name);
        info!(%peer, name = %display_name, "Invitation received");
        self.publish(AppEvent::InvitationReceived {
            peer_id: peer,
            display_name,
        });

        if auto_accepts {
            self.begin_inbound_connect(peer);
        }
    }

    /// Enter Connecting for an accepted inbound link when nothing else is in flight
    fn begin_inbound_connect(&mut self, peer: PeerId) {
        if self.lifecycle.is_connected(peer) || self.lifecycle.connecting() == Some(peer) {
            return;
        }
        if self.in_flight.is_none() && self.lifecycle.connecting().is_none() {
            self.apply(LifecycleEvent::ConnectRequested(peer));
            self.in_flight = Some(InFlight::Connect { peer });
        }
        self.publish(AppEvent::ConnectionState {
            peer_id: peer,
            state: LinkState::Connecting,
        });
    }

    fn on_link_state(&mut self, raw_id: RawPeerId, state: LinkState) {
        let Some(kind) = self.session.as_ref().map(|s| s.kind()) else {
            return;
        };
        let peer = match self.registry.lookup(kind, &raw_id) {
            Some(peer) => peer,
            None if state != LinkState::NotConnected => {
                let name = raw_id.to_string();
                self.registry.observe_inbound(kind, &raw_id, &name)
            }
            None => {
                trace!(%raw_id, "Link down for unknown peer");
                return;
            }
        };

        match state {
            LinkState::Connecting => self.begin_inbound_connect(peer),
            LinkState::Connected => {
                if self.lifecycle.is_connected(peer) {
                    return;
                }
                if self.in_flight == Some(InFlight::Connect { peer }) {
                    self.in_flight = None;
                }
                self.apply(LifecycleEvent::PeerConnected(peer));
                info!(%peer, "Peer connected");
                self.publish(AppEvent::ConnectionState {
                    peer_id: peer,
                    state: LinkState::Connected,
                });
            }
            LinkState::NotConnected => {
                if self.lifecycle.connecting() == Some(peer) {
                    self.fail_connect(peer, "connection was not established".to_string());
                } else if self.lifecycle.is_connected(peer) {
                    self.disconnect_peer(peer);
                } else {
                    trace!(%peer, "Link down for peer that was not connected");
                }
            }
        }
    }

    /// Drop a connected peer; any partial inbound transfer is discarded silently
    fn disconnect_peer(&mut self, peer: PeerId) {
        self.apply(LifecycleEvent::PeerDisconnected(peer));
        if self.codec.discard_peer(peer) {
            debug!(%peer, "Discarded partial transfer on disconnect");
        }
        info!(%peer, "Peer disconnected");
        self.publish(AppEvent::ConnectionState {
            peer_id: peer,
            state: LinkState::NotConnected,
        });
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    fn on_data(&mut self, raw_id: RawPeerId, bytes: Vec<u8>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let framing = session.framing;
        let peer = match self.registry.lookup(session.kind(), &raw_id) {
            Some(peer) if self.lifecycle.is_connected(peer) => peer,
            _ => {
                warn!(%raw_id, len = bytes.len(), "Dropping data from peer that is not connected");
                self.stats.inbound_dropped += 1;
                return;
            }
        };

        if framing.is_none() {
            self.deliver(peer, bytes);
            return;
        }

        let completed = OutboundFrame::decode(&bytes)
            .and_then(|frame| self.codec.reassemble(peer, frame));
        match completed {
            Ok(Some(message)) => self.deliver(peer, message),
            Ok(None) => trace!(%peer, "Frame buffered"),
            Err(e) => self.report(e),
        }
    }

    fn deliver(&mut self, peer: PeerId, bytes: Vec<u8>) {
        debug!(%peer, len = bytes.len(), "Message received");
        self.stats.messages_delivered += 1;
        self.publish(AppEvent::DataReceived {
            peer_id: peer,
            bytes,
        });
    }

    // ------------------------------------------------------------------------
    // Activities & Faults
    // ------------------------------------------------------------------------

    /// Clear the in-flight start of `activity`, returning whether there was one
    fn take_activity_in_flight(&mut self, activity: Activity) -> bool {
        if self.in_flight == Some(InFlight::Activity { activity }) {
            self.in_flight = None;
            return true;
        }
        false
    }

    fn on_activity_started(&mut self, activity: Activity) {
        self.take_activity_in_flight(activity);
        if self.lifecycle.is_active(activity) {
            debug!(%activity, "Activity restarted");
            return;
        }
        self.apply(LifecycleEvent::ActivityStarted(activity));
        info!(%activity, "Activity started");
        self.publish(match activity {
            Activity::Advertising => AppEvent::AdvertisingStarted,
            Activity::Discovery => AppEvent::BrowsingStarted,
        });
    }

    /// A failed restart ends the activity too; the backend has already torn
    /// the old one down
    fn on_activity_failed(&mut self, activity: Activity, reason: String) {
        self.take_activity_in_flight(activity);
        if self.lifecycle.is_active(activity) {
            self.apply(LifecycleEvent::ActivityEnded(activity));
        }
        self.report(PeerlinkError::from(TransportError::native(format!(
            "{activity} failed to start: {reason}"
        ))));
    }

    fn on_activity_stopped(&mut self, activity: Activity, reason: String) {
        if self.take_activity_in_flight(activity) {
            self.on_activity_failed(activity, reason);
            return;
        }
        if !self.lifecycle.is_active(activity) {
            return;
        }
        self.apply(LifecycleEvent::ActivityEnded(activity));
        self.report(PeerlinkError::from(TransportError::native(format!(
            "{activity} stopped: {reason}"
        ))));
    }

    /// Steady-state faults are reported only; a fault during a transition fails it
    fn on_fault(&mut self, message: String) {
        match self.in_flight {
            Some(InFlight::Connect { peer }) => self.fail_connect(peer, message),
            Some(InFlight::Activity { activity }) => self.on_activity_failed(activity, message),
            None => self.report(PeerlinkError::from(TransportError::native(message))),
        }
    }
}
