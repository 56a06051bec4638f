//! Lifecycle engine task
//!
//! One actor owns every piece of mutable state: the lifecycle facts, the peer
//! registry, the codec buffers and the active backend. Commands, backend
//! events, control requests and permission changes are all applied here, one
//! at a time.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use peerlink_core::channel::{BackendEventReceiver, BackendEventSender, CommandReceiver};
use peerlink_core::{
    AppEvent, BackendFactory, CapabilityReport, Command, ConnectionState, Generation, LifecycleEvent,
    LifecycleState, PayloadCodec, PeerRegistry, PeerlinkConfig, PeerlinkError, PermissionGate,
    Result, TransitionRecord, TransportError,
};

use super::state::{EngineSnapshot, EngineStats, InFlight, Session};
use crate::bus::EventBus;

// ----------------------------------------------------------------------------
// Control Messages
// ----------------------------------------------------------------------------

/// Requests that bypass the command queue
#[derive(Debug)]
pub(crate) enum Control {
    Stop { ack: oneshot::Sender<()> },
    Snapshot { reply: oneshot::Sender<EngineSnapshot> },
    /// Publish the current permission state to the attached consumer
    ReportPermissions,
    Shutdown,
}

/// Next report from the gate's notifier; `None` once the gate drops it
async fn permission_change(
    permissions: &mut Option<watch::Receiver<CapabilityReport>>,
) -> Option<CapabilityReport> {
    let receiver = permissions.as_mut()?;
    receiver.changed().await.ok()?;
    let report = *receiver.borrow_and_update();
    Some(report)
}

// ----------------------------------------------------------------------------
// Lifecycle Engine
// ----------------------------------------------------------------------------

pub(crate) struct LifecycleEngine {
    pub(super) config: PeerlinkConfig,
    pub(super) gate: Arc<dyn PermissionGate>,
    pub(super) factories: Vec<Arc<dyn BackendFactory>>,
    pub(super) session: Option<Session>,
    pub(super) lifecycle: LifecycleState,
    pub(super) registry: PeerRegistry,
    pub(super) codec: PayloadCodec,
    pub(super) generation: Generation,
    pub(super) in_flight: Option<InFlight>,
    pub(super) queue: VecDeque<Command>,
    pub(super) history: VecDeque<TransitionRecord>,
    pub(super) stats: EngineStats,
    pub(super) bus: EventBus,
    pub(super) state_tx: watch::Sender<ConnectionState>,
    pub(super) event_tx: BackendEventSender,
    command_rx: CommandReceiver,
    control_rx: mpsc::UnboundedReceiver<Control>,
    event_rx: BackendEventReceiver,
    permissions: Option<watch::Receiver<CapabilityReport>>,
}

impl LifecycleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PeerlinkConfig,
        gate: Arc<dyn PermissionGate>,
        factories: Vec<Arc<dyn BackendFactory>>,
        bus: EventBus,
        state_tx: watch::Sender<ConnectionState>,
        command_rx: CommandReceiver,
        control_rx: mpsc::UnboundedReceiver<Control>,
        event_channel: (BackendEventSender, BackendEventReceiver),
    ) -> Self {
        let codec = PayloadCodec::new(config.codec.clone());
        let (event_tx, event_rx) = event_channel;
        let permissions = gate.subscribe();
        Self {
            config,
            gate,
            factories,
            session: None,
            lifecycle: LifecycleState::new(),
            registry: PeerRegistry::new(),
            codec,
            generation: Generation::default(),
            in_flight: None,
            queue: VecDeque::new(),
            history: VecDeque::new(),
            stats: EngineStats::default(),
            bus,
            state_tx,
            event_tx,
            command_rx,
            control_rx,
            event_rx,
            permissions,
        }
    }

    /// Run the engine loop until shutdown or until every handle is gone
    pub async fn run(mut self) -> Result<()> {
        info!(backends = self.factories.len(), "Lifecycle engine starting");

        loop {
            tokio::select! {
                biased;

                control = self.control_rx.recv() => {
                    match control {
                        Some(Control::Stop { ack }) => {
                            self.stop().await;
                            let _ = ack.send(());
                        }
                        Some(Control::Snapshot { reply }) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(Control::ReportPermissions) => {
                            let report = self.gate.query_capabilities();
                            self.publish(AppEvent::permissions(report));
                        }
                        Some(Control::Shutdown) | None => {
                            info!("Shutdown requested");
                            break;
                        }
                    }
                }

                report = permission_change(&mut self.permissions), if self.permissions.is_some() => {
                    match report {
                        Some(report) => {
                            info!(radio = %report.radio, proximity_scan = %report.proximity_scan, "Permissions changed");
                            self.publish(AppEvent::permissions(report));
                        }
                        None => {
                            debug!("Permission gate dropped its notifier");
                            self.permissions = None;
                        }
                    }
                }

                event = self.event_rx.recv() => {
                    // The engine holds a sender itself, so the channel never closes here
                    if let Some(event) = event {
                        self.handle_backend_event(event);
                        self.settle().await;
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            self.submit(command).await;
                            self.settle().await;
                        }
                        None => {
                            info!("Command channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        self.teardown_session().await;
        info!("Lifecycle engine stopped");
        Ok(())
    }

    /// Run a command now, or queue it behind an in-flight transition
    async fn submit(&mut self, command: Command) {
        if let Some(in_flight) = self.in_flight {
            if self.queue.len() >= self.config.engine.max_queued_commands {
                self.stats.commands_dropped += 1;
                self.report(PeerlinkError::from(TransportError::QueueFull {
                    capacity: self.config.engine.max_queued_commands,
                }));
                return;
            }
            debug!(command = command.name(), ?in_flight, "Transition in flight, queueing command");
            self.stats.commands_queued += 1;
            self.queue.push_back(command);
            return;
        }
        self.execute(command).await;
    }

    /// Drain queued commands once stable, then release the backend if idle
    async fn settle(&mut self) {
        while self.in_flight.is_none() {
            let Some(command) = self.queue.pop_front() else {
                break;
            };
            self.execute(command).await;
        }

        if self.session.is_some()
            && self.in_flight.is_none()
            && self.queue.is_empty()
            && self.lifecycle.current().is_idle()
        {
            info!("Nothing left to do, releasing backend");
            self.teardown_session().await;
        }
    }

    // ------------------------------------------------------------------------
    // Stop & Teardown
    // ------------------------------------------------------------------------

    /// Tear everything down from any state and emit exactly one `stopped`
    pub(super) async fn stop(&mut self) {
        let mut dropped = self.queue.len();
        self.queue.clear();
        while self.command_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarding commands issued before stop");
            self.stats.commands_dropped += dropped as u64;
        }

        if self.session.is_some() || !self.lifecycle.current().is_idle() {
            self.apply(LifecycleEvent::StopRequested);
        }
        self.in_flight = None;
        self.teardown_session().await;
        self.apply(LifecycleEvent::StopCompleted);

        self.bus.publish(AppEvent::Stopped);
        info!(generation = %self.generation, "Engine stopped");
    }

    /// Drop the backend and everything scoped to its session
    pub(super) async fn teardown_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let kind = session.kind();
        let grace = self.config.engine.stop_grace();
        match tokio::time::timeout(grace, session.backend.stop()).await {
            Ok(Ok(())) => debug!(backend = %kind, "Backend stopped"),
            Ok(Err(e)) => warn!(backend = %kind, "Backend stop failed: {}", e),
            Err(_) => warn!(backend = %kind, ?grace, "Backend stop timed out, abandoning it"),
        }
        drop(session);

        // Anything still in flight from the old backend is now stale
        self.generation = self.generation.next();
        self.registry.clear();
        self.codec.clear();
        self.in_flight = None;
        if !self.lifecycle.current().is_idle() {
            self.apply(LifecycleEvent::StopCompleted);
        }
    }

    // ------------------------------------------------------------------------
    // Shared Helpers
    // ------------------------------------------------------------------------

    /// Apply a lifecycle fact change, publishing the state if it moved
    pub(super) fn apply(&mut self, event: LifecycleEvent) -> bool {
        match self.lifecycle.apply(event) {
            Ok(transition) => {
                if transition.changed() {
                    info!(
                        from = %transition.from,
                        to = %transition.to,
                        event = %transition.record.event,
                        "State transition"
                    );
                    self.state_tx.send_replace(transition.to.clone());
                    if self.history.len() >= self.config.engine.history_limit {
                        self.history.pop_front();
                    }
                    self.history.push_back(transition.record);
                }
                true
            }
            Err(e) => {
                warn!("Rejected lifecycle event: {}", e);
                false
            }
        }
    }

    pub(super) fn publish(&mut self, event: AppEvent) {
        self.bus.publish(event);
    }

    /// Surface an error to the consumer as an event
    pub(super) fn report(&mut self, err: PeerlinkError) {
        match err.kind() {
            peerlink_core::ErrorKind::TransportFault => error!("{}", err),
            _ => warn!("{}", err),
        }
        self.stats.errors_reported += 1;
        self.bus.publish(AppEvent::error(&err));
    }

    pub(super) fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.lifecycle.current(),
            advertising: self.lifecycle.is_active(peerlink_core::Activity::Advertising),
            discovering: self.lifecycle.is_active(peerlink_core::Activity::Discovery),
            backend: self.session.as_ref().map(Session::kind),
            generation: self.generation,
            peers: self.registry.records().cloned().collect(),
            queued_commands: self.queue.len(),
            pending_transfers: self.codec.pending_count(),
            history: self.history.iter().cloned().collect(),
            stats: self.stats.clone(),
            bus: self.bus.stats(),
        }
    }
}
