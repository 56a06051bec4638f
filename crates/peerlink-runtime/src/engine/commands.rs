//! Consumer command handlers
//!
//! Errors never cross the command boundary: every failure here ends up as an
//! `error` event and the engine stays in a valid state.

use std::sync::Arc;
use tracing::{debug, info};

use peerlink_core::{
    Activity, AppEvent, BackendEventSink, BackendFactory, Command, FrameUnit, LifecycleEvent,
    LinkState, PeerId, PeerlinkError, RawPeerId, Recipient, Result, SendTarget, ServiceId,
    SessionParams,
};

use super::state::{InFlight, Session};
use super::task::LifecycleEngine;

impl LifecycleEngine {
    pub(super) async fn execute(&mut self, command: Command) {
        debug!(command = command.name(), "Executing command");
        self.stats.commands_processed += 1;
        let result = match command {
            Command::StartAdvertising {
                display_name,
                service,
            } => {
                self.start_activity(Activity::Advertising, Some(display_name), service)
                    .await
            }
            Command::StartDiscovery { service } => {
                self.start_activity(Activity::Discovery, None, service).await
            }
            Command::StartBoth {
                display_name,
                service,
            } => {
                // Discovery waits behind the advertising transition
                self.queue.push_front(Command::StartDiscovery {
                    service: service.clone(),
                });
                self.start_activity(Activity::Advertising, Some(display_name), service)
                    .await
            }
            Command::Invite { peer } => self.invite(peer).await,
            Command::Send { to, bytes } => self.send(to, bytes).await,
        };
        if let Err(e) = result {
            self.report(e);
        }
    }

    // ------------------------------------------------------------------------
    // Advertising & Discovery
    // ------------------------------------------------------------------------

    async fn start_activity(
        &mut self,
        activity: Activity,
        display_name: Option<String>,
        service: ServiceId,
    ) -> Result<()> {
        let capabilities = match &self.session {
            Some(session) => session.capabilities.clone(),
            None => self.select_factory(activity)?.capabilities(),
        };
        if !capabilities.supports(activity) {
            return Err(PeerlinkError::unavailable(format!(
                "{} backend cannot run {}",
                capabilities.kind, activity
            )));
        }
        self.gate
            .query_capabilities()
            .check(activity, capabilities.scan_requires_location)?;

        self.ensure_session(activity)?;

        if self.lifecycle.is_active(activity) {
            info!(%activity, "Restarting {} on request", activity);
        }
        self.in_flight = Some(InFlight::Activity { activity });

        let display_name = display_name.unwrap_or_else(|| self.config.engine.local_name.clone());
        let Some(session) = self.session.as_mut() else {
            self.in_flight = None;
            return Err(PeerlinkError::unavailable("no active session"));
        };
        let result = match activity {
            Activity::Advertising => {
                session
                    .backend
                    .start_advertising(&display_name, &service)
                    .await
            }
            Activity::Discovery => session.backend.start_discovery(&service).await,
        };
        if let Err(e) = result {
            self.in_flight = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// First registered backend that is present and can run `activity`
    fn select_factory(&self, activity: Activity) -> Result<Arc<dyn BackendFactory>> {
        self.factories
            .iter()
            .find(|factory| factory.is_available() && factory.capabilities().supports(activity))
            .cloned()
            .ok_or_else(|| {
                PeerlinkError::unavailable(format!("no available backend supports {activity}"))
            })
    }

    fn ensure_session(&mut self, activity: Activity) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let factory = self.select_factory(activity)?;
        let kind = factory.kind();
        let sink = BackendEventSink::new(kind, self.generation, self.event_tx.clone());
        let params = SessionParams {
            local_name: self.config.engine.local_name.clone(),
            generation: self.generation,
        };
        let backend = factory.create(sink, &params)?;
        let framing = match backend.max_transmission_unit() {
            Some(mtu) => Some(FrameUnit::for_mtu(mtu)?),
            None => None,
        };
        let capabilities = backend.capabilities();
        info!(backend = %kind, generation = %self.generation, ?framing, "Session started");
        self.stats.sessions_started += 1;
        self.session = Some(Session {
            backend,
            capabilities,
            framing,
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Invitations
    // ------------------------------------------------------------------------

    async fn invite(&mut self, peer: PeerId) -> Result<()> {
        let raw_id = self.registry.resolve(peer)?.raw_id.clone();
        if self.lifecycle.is_connected(peer) {
            debug!(%peer, "Already connected, ignoring invite");
            return Ok(());
        }
        if self.session.is_none() {
            return Err(PeerlinkError::unavailable("no active session"));
        }
        if !self.apply(LifecycleEvent::ConnectRequested(peer)) {
            return Err(PeerlinkError::connect_failed(
                peer,
                "another connection is being established",
            ));
        }
        self.in_flight = Some(InFlight::Connect { peer });
        self.publish(AppEvent::InvitationSent { peer_id: peer });
        self.publish(AppEvent::ConnectionState {
            peer_id: peer,
            state: LinkState::Connecting,
        });

        let timeout = self.config.engine.invite_timeout();
        let result = match self.session.as_mut() {
            Some(session) => session.backend.connect(&raw_id, timeout).await,
            None => Ok(()),
        };
        if let Err(e) = result {
            self.fail_connect(peer, e.to_string());
        }
        Ok(())
    }

    /// Revert an in-flight connect and report it once
    pub(super) fn fail_connect(&mut self, peer: PeerId, reason: String) {
        self.apply(LifecycleEvent::ConnectFailed(peer));
        if self.in_flight == Some(InFlight::Connect { peer }) {
            self.in_flight = None;
        }
        self.publish(AppEvent::ConnectionState {
            peer_id: peer,
            state: LinkState::NotConnected,
        });
        self.report(PeerlinkError::connect_failed(peer, reason));
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    async fn send(&mut self, to: Recipient, bytes: Vec<u8>) -> Result<()> {
        let targets: Vec<(PeerId, RawPeerId)> = match to {
            Recipient::Peer(peer) => {
                let record = self.registry.resolve(peer)?;
                if !self.lifecycle.is_connected(peer) {
                    return Err(PeerlinkError::send_failed(format!("{peer} is not connected")));
                }
                vec![(peer, record.raw_id.clone())]
            }
            Recipient::Broadcast => self
                .lifecycle
                .connected()
                .iter()
                .filter_map(|peer| {
                    self.registry
                        .resolve(*peer)
                        .ok()
                        .map(|record| (*peer, record.raw_id.clone()))
                })
                .collect(),
        };
        if targets.is_empty() {
            return Err(PeerlinkError::send_failed("No connected peers"));
        }
        let Some(session) = self.session.as_mut() else {
            return Err(PeerlinkError::send_failed("No connected peers"));
        };

        match session.framing {
            None if to == Recipient::Broadcast && session.capabilities.supports_broadcast => {
                session
                    .backend
                    .send(SendTarget::Broadcast, bytes)
                    .await
                    .map_err(|e| PeerlinkError::send_failed(e.to_string()))?;
                self.stats.frames_sent += 1;
            }
            None => {
                for (_, raw_id) in &targets {
                    session
                        .backend
                        .send(SendTarget::Peer(raw_id.clone()), bytes.clone())
                        .await
                        .map_err(|e| PeerlinkError::send_failed(e.to_string()))?;
                    self.stats.frames_sent += 1;
                }
            }
            Some(unit) => {
                for (peer, raw_id) in &targets {
                    let frames = self.codec.fragment(*peer, &bytes, unit)?;
                    for frame in frames {
                        session
                            .backend
                            .send(SendTarget::Peer(raw_id.clone()), frame.encode()?)
                            .await
                            .map_err(|e| PeerlinkError::send_failed(e.to_string()))?;
                        self.stats.frames_sent += 1;
                    }
                }
            }
        }
        Ok(())
    }
}
