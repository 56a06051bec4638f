//! Runtime Builder API
//!
//! Consumers register backend factories and a permission gate, then get a
//! [`PeerlinkHandle`] for issuing commands and reading events.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use peerlink_core::channel::{create_backend_event_channel, create_command_channel, CommandSender};
use peerlink_core::{
    BackendFactory, CapabilityReport, Command, ConnectionState, GrantAll, PeerId, PeerlinkConfig, PeerlinkError,
    PermissionGate, Recipient, Result, ServiceId,
};

use crate::bus::{EventBus, EventStream};
use crate::engine::{Control, EngineSnapshot, LifecycleEngine};

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for a peerlink engine instance
pub struct RuntimeBuilder {
    config: PeerlinkConfig,
    gate: Arc<dyn PermissionGate>,
    factories: Vec<Arc<dyn BackendFactory>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: PeerlinkConfig::default(),
            gate: Arc::new(GrantAll),
            factories: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: PeerlinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Display name used when discovery starts a session before advertising does
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.config.engine.local_name = name.into();
        self
    }

    pub fn with_permission_gate(mut self, gate: impl PermissionGate + 'static) -> Self {
        self.gate = Arc::new(gate);
        self
    }

    /// Register a backend; earlier registrations are preferred
    pub fn with_backend(mut self, factory: impl BackendFactory + 'static) -> Self {
        self.factories.push(Arc::new(factory));
        self
    }

    pub fn with_backend_arc(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Validate configuration and spawn the engine on the current tokio runtime
    pub fn build(self) -> Result<PeerlinkHandle> {
        self.config.validate()?;
        if self.factories.is_empty() {
            return Err(PeerlinkError::config_error("no transport backends registered"));
        }
        let available: Vec<String> = self
            .factories
            .iter()
            .filter(|f| f.is_available())
            .map(|f| f.kind().to_string())
            .collect();
        info!(?available, "Building peerlink runtime");

        let (command_tx, command_rx) = create_command_channel(&self.config.channels);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let bus = EventBus::new();
        let report_permissions = self.config.engine.report_permissions_on_attach;

        let engine = LifecycleEngine::new(
            self.config,
            self.gate.clone(),
            self.factories,
            bus.clone(),
            state_tx,
            command_rx,
            control_rx,
            create_backend_event_channel(),
        );
        let task = tokio::spawn(engine.run());

        Ok(PeerlinkHandle {
            commands: command_tx,
            control: control_tx,
            bus,
            gate: self.gate,
            report_permissions,
            state: state_rx,
            task: Some(task),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Handle to a running engine
///
/// Command methods return once the command is accepted; outcomes arrive as
/// events. They fail only if the engine task is gone.
pub struct PeerlinkHandle {
    commands: CommandSender,
    control: mpsc::UnboundedSender<Control>,
    bus: EventBus,
    gate: Arc<dyn PermissionGate>,
    report_permissions: bool,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<Result<()>>>,
}

impl PeerlinkHandle {
    pub async fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PeerlinkError::channel_error("engine is not running"))
    }

    pub async fn start_advertising(
        &self,
        display_name: impl Into<String>,
        service: &ServiceId,
    ) -> Result<()> {
        self.submit(Command::StartAdvertising {
            display_name: display_name.into(),
            service: service.clone(),
        })
        .await
    }

    pub async fn start_discovery(&self, service: &ServiceId) -> Result<()> {
        self.submit(Command::StartDiscovery {
            service: service.clone(),
        })
        .await
    }

    /// Advertise, then start discovery once advertising is up
    pub async fn start_both(
        &self,
        display_name: impl Into<String>,
        service: &ServiceId,
    ) -> Result<()> {
        self.submit(Command::StartBoth {
            display_name: display_name.into(),
            service: service.clone(),
        })
        .await
    }

    pub async fn invite(&self, peer: PeerId) -> Result<()> {
        self.submit(Command::Invite { peer }).await
    }

    pub async fn send(&self, to: Recipient, bytes: Vec<u8>) -> Result<()> {
        self.submit(Command::Send { to, bytes }).await
    }

    /// Stop everything; resolves once teardown is complete and `stopped` was emitted
    pub async fn stop(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(Control::Stop { ack })
            .map_err(|_| PeerlinkError::channel_error("engine is not running"))?;
        done.await
            .map_err(|_| PeerlinkError::channel_error("engine exited during stop"))
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(Control::Snapshot { reply })
            .map_err(|_| PeerlinkError::channel_error("engine is not running"))?;
        response
            .await
            .map_err(|_| PeerlinkError::channel_error("engine exited before replying"))
    }

    /// Current state as last published by the engine
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Permission state as the gate reports it right now
    pub fn permissions(&self) -> CapabilityReport {
        self.gate.query_capabilities()
    }

    /// Attach as the event consumer, replacing any previous one
    ///
    /// With `report_permissions_on_attach` set, the stream opens with a
    /// `permissionsChanged` event carrying the current state.
    pub fn events(&self) -> EventStream {
        let stream = self.bus.attach();
        if self.report_permissions {
            let _ = self.control.send(Control::ReportPermissions);
        }
        stream
    }

    pub fn detach_events(&self) {
        self.bus.detach();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the engine task and wait for it to exit
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down peerlink runtime");
        let _ = self.control.send(Control::Shutdown);
        match self.task.take() {
            Some(task) => task.await.map_err(|e| {
                PeerlinkError::channel_error(format!("engine task panicked: {e}"))
            })?,
            None => Ok(()),
        }
    }
}
