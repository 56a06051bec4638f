//! Scripted backend
//!
//! A backend with no medium behind it. Every call is recorded, and the test
//! decides what the "platform" reports by pushing events through the handle.
//! With auto-confirm on, activity starts and connects succeed immediately.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use peerlink_core::{
    Activity, BackendCapabilities, BackendEventKind, BackendEventSink, BackendFactory,
    BackendKind, LinkState, RawPeerId, SendTarget, ServiceId, SessionParams, TransportBackend,
    TransportError,
};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const WAIT_LIMIT: Duration = Duration::from_secs(2);

/// One call the engine made into the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    StartAdvertising {
        display_name: String,
        service: ServiceId,
    },
    StartDiscovery {
        service: ServiceId,
    },
    Connect {
        peer: RawPeerId,
    },
    Send {
        target: SendTarget,
        bytes: Vec<u8>,
    },
    Stop,
}

struct ScriptState {
    calls: Vec<BackendCall>,
    /// One sink per created session, oldest first
    sinks: Vec<BackendEventSink>,
    available: bool,
    auto_confirm: bool,
    stop_hangs: bool,
    connect_error: Option<TransportError>,
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Test-side view of a scripted backend; clones share state
#[derive(Clone)]
pub struct ScriptedHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                calls: Vec::new(),
                sinks: Vec::new(),
                available: true,
                auto_confirm: false,
                stop_hangs: false,
                connect_error: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: BackendCall) {
        debug!(?call, "Scripted backend call");
        self.lock().calls.push(call);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, matches: impl Fn(&BackendCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| matches(call)).count()
    }

    /// Number of backends created so far
    pub fn sessions(&self) -> usize {
        self.lock().sinks.len()
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn set_auto_confirm(&self, auto_confirm: bool) {
        self.lock().auto_confirm = auto_confirm;
    }

    /// Make `stop()` never return, as a wedged native stack would
    pub fn set_stop_hangs(&self, hangs: bool) {
        self.lock().stop_hangs = hangs;
    }

    /// Have `connect()` fail synchronously with `error`
    pub fn set_connect_error(&self, error: Option<TransportError>) {
        self.lock().connect_error = error;
    }

    // ------------------------------------------------------------------------
    // Event Injection
    // ------------------------------------------------------------------------

    /// Report through the newest session's sink
    pub fn emit(&self, kind: BackendEventKind) -> bool {
        let sink = self.lock().sinks.last().cloned();
        sink.is_some_and(|sink| sink.emit(kind))
    }

    /// Report through the sink of an earlier session
    pub fn emit_from_session(&self, session: usize, kind: BackendEventKind) -> bool {
        let sink = self.lock().sinks.get(session).cloned();
        sink.is_some_and(|sink| sink.emit(kind))
    }

    pub fn peer_found(&self, raw_id: &str, display_name: &str) -> bool {
        self.emit(BackendEventKind::PeerFound {
            peer: RawPeerId::new(raw_id),
            display_name: display_name.to_string(),
            rssi: None,
        })
    }

    pub fn link_state(&self, raw_id: &str, state: LinkState) -> bool {
        self.emit(BackendEventKind::ConnectionStateChanged {
            peer: RawPeerId::new(raw_id),
            state,
        })
    }

    pub fn data(&self, raw_id: &str, bytes: Vec<u8>) -> bool {
        self.emit(BackendEventKind::DataReceived {
            peer: RawPeerId::new(raw_id),
            bytes,
        })
    }

    // ------------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------------

    /// Wait until at least `count` sessions exist
    pub async fn wait_for_sessions(&self, count: usize) -> bool {
        self.wait_until(|state| state.sinks.len() >= count).await
    }

    /// Wait until a recorded call satisfies `matches`
    pub async fn wait_for_call(&self, matches: impl Fn(&BackendCall) -> bool) -> bool {
        self.wait_until(|state| state.calls.iter().any(&matches)).await
    }

    async fn wait_until(&self, ready: impl Fn(&ScriptState) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            if ready(&self.lock()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl std::fmt::Debug for ScriptedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ScriptedHandle")
            .field("calls", &state.calls.len())
            .field("sessions", &state.sinks.len())
            .field("auto_confirm", &state.auto_confirm)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScriptedBackendFactory {
    capabilities: BackendCapabilities,
    handle: ScriptedHandle,
}

impl ScriptedBackendFactory {
    /// Unframed backend that can advertise and discover
    pub fn new(kind: BackendKind) -> Self {
        Self {
            capabilities: BackendCapabilities {
                kind,
                supports_advertise: true,
                supports_discovery: true,
                supports_broadcast: false,
                auto_accepts_invitations: false,
                scan_requires_location: false,
                discovery_survives_connect: true,
                max_transmission_unit: None,
            },
            handle: ScriptedHandle::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.capabilities.max_transmission_unit = Some(mtu);
        self
    }

    pub fn auto_confirm(self) -> Self {
        self.handle.set_auto_confirm(true);
        self
    }

    pub fn handle(&self) -> ScriptedHandle {
        self.handle.clone()
    }
}

impl BackendFactory for ScriptedBackendFactory {
    fn kind(&self) -> BackendKind {
        self.capabilities.kind
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities.clone()
    }

    fn is_available(&self) -> bool {
        self.handle.lock().available
    }

    fn create(
        &self,
        sink: BackendEventSink,
        params: &SessionParams,
    ) -> Result<Box<dyn TransportBackend>, TransportError> {
        if !self.is_available() {
            return Err(TransportError::unavailable("scripted backend switched off"));
        }
        debug!(generation = %params.generation, "Creating scripted backend");
        self.handle.lock().sinks.push(sink.clone());
        Ok(Box::new(ScriptedBackend {
            handle: self.handle.clone(),
            capabilities: self.capabilities.clone(),
            sink,
        }))
    }
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

pub struct ScriptedBackend {
    handle: ScriptedHandle,
    capabilities: BackendCapabilities,
    sink: BackendEventSink,
}

impl ScriptedBackend {
    fn confirm(&self, activity: Activity) {
        if self.handle.lock().auto_confirm {
            self.sink.activity_started(activity);
        }
    }
}

#[async_trait]
impl TransportBackend for ScriptedBackend {
    async fn start_advertising(
        &mut self,
        display_name: &str,
        service: &ServiceId,
    ) -> Result<(), TransportError> {
        self.handle.record(BackendCall::StartAdvertising {
            display_name: display_name.to_string(),
            service: service.clone(),
        });
        self.confirm(Activity::Advertising);
        Ok(())
    }

    async fn start_discovery(&mut self, service: &ServiceId) -> Result<(), TransportError> {
        self.handle.record(BackendCall::StartDiscovery {
            service: service.clone(),
        });
        self.confirm(Activity::Discovery);
        Ok(())
    }

    async fn connect(&mut self, peer: &RawPeerId, _timeout: Duration) -> Result<(), TransportError> {
        self.handle
            .record(BackendCall::Connect { peer: peer.clone() });
        let (auto_confirm, error) = {
            let state = self.handle.lock();
            (state.auto_confirm, state.connect_error.clone())
        };
        if let Some(error) = error {
            return Err(error);
        }
        if auto_confirm {
            self.sink.link_state(peer.clone(), LinkState::Connected);
        }
        Ok(())
    }

    async fn send(&mut self, target: SendTarget, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.handle.record(BackendCall::Send { target, bytes });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        self.handle.record(BackendCall::Stop);
        let hangs = self.handle.lock().stop_hangs;
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn max_transmission_unit(&self) -> Option<usize> {
        self.capabilities.max_transmission_unit
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities.clone()
    }
}
