//! BLE backend and its radio task
//!
//! Central and peripheral roles run side by side inside one radio task that
//! owns both drivers. Backend calls are forwarded to it over a channel so the
//! engine never waits on a radio operation except for writes. Outbound
//! connects run in a join set beside the loop, so a slow link setup never
//! holds up the peripheral role, scan reports or stop.

use async_trait::async_trait;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use peerlink_core::{
    Activity, BackendCapabilities, BackendEventSink, BackendKind, LinkState, RawPeerId,
    SendTarget, ServiceId, TransportBackend, TransportError,
};

use crate::config::BleBackendConfig;
use crate::driver::{
    BleDrivers, CentralDriver, DriverEvent, DriverEventReceiver, PeripheralDriver, PowerState,
    Role,
};
use crate::error::BleError;
use crate::protocol::{resolve_display_name, AdvertPayload, Advertisement};

/// Capabilities of a BLE backend, with or without the peripheral role
pub fn ble_capabilities(config: &BleBackendConfig, supports_peripheral: bool) -> BackendCapabilities {
    BackendCapabilities {
        kind: BackendKind::Ble,
        supports_advertise: supports_peripheral,
        supports_discovery: true,
        supports_broadcast: false,
        auto_accepts_invitations: false,
        scan_requires_location: true,
        discovery_survives_connect: true,
        max_transmission_unit: Some(config.mtu),
    }
}

// ----------------------------------------------------------------------------
// Radio Commands
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum RadioCommand {
    Advertise {
        display_name: String,
    },
    Discover,
    Connect {
        address: String,
        timeout: Duration,
    },
    Send {
        target: SendTarget,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), BleError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

/// [`TransportBackend`] over a pair of BLE drivers
pub struct BleBackend {
    commands: mpsc::UnboundedSender<RadioCommand>,
    capabilities: BackendCapabilities,
    mtu: usize,
    task: Option<JoinHandle<()>>,
}

impl BleBackend {
    /// Start the radio task; must be called from within a tokio runtime
    pub fn spawn(config: BleBackendConfig, drivers: BleDrivers, sink: BackendEventSink) -> Self {
        let capabilities = ble_capabilities(&config, drivers.peripheral.is_some());
        let mtu = config.mtu;
        let (commands, command_rx) = mpsc::unbounded_channel();

        let radio = RadioTask {
            config,
            sink,
            central: drivers.central,
            peripheral: drivers.peripheral,
            device_id: drivers.device_id,
            central_power: PowerState::Unknown,
            peripheral_power: PowerState::Unknown,
            scan: Slot::Off,
            advert: Slot::Off,
            advertisement: None,
            links: HashMap::new(),
            connecting: JoinSet::new(),
        };
        let task = tokio::spawn(radio.run(command_rx, drivers.events));

        Self {
            commands,
            capabilities,
            mtu,
            task: Some(task),
        }
    }

    fn dispatch(&self, command: RadioCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::from(BleError::RadioClosed))
    }
}

#[async_trait]
impl TransportBackend for BleBackend {
    async fn start_advertising(
        &mut self,
        display_name: &str,
        service: &ServiceId,
    ) -> Result<(), TransportError> {
        if !self.capabilities.supports_advertise {
            return Err(BleError::PeripheralUnsupported.into());
        }
        debug!(%service, "Advertising over BLE");
        self.dispatch(RadioCommand::Advertise {
            display_name: display_name.to_string(),
        })
    }

    async fn start_discovery(&mut self, service: &ServiceId) -> Result<(), TransportError> {
        debug!(%service, "Scanning over BLE");
        self.dispatch(RadioCommand::Discover)
    }

    async fn connect(&mut self, peer: &RawPeerId, timeout: Duration) -> Result<(), TransportError> {
        self.dispatch(RadioCommand::Connect {
            address: peer.as_str().to_string(),
            timeout,
        })
    }

    async fn send(&mut self, target: SendTarget, bytes: Vec<u8>) -> Result<(), TransportError> {
        let (reply, done) = oneshot::channel();
        self.dispatch(RadioCommand::Send {
            target,
            bytes,
            reply,
        })?;
        done.await
            .map_err(|_| TransportError::from(BleError::RadioClosed))?
            .map_err(TransportError::from)
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let (reply, done) = oneshot::channel();
        if self.dispatch(RadioCommand::Stop { reply }).is_ok() {
            let _ = done.await;
        }
        let _ = task.await;
        Ok(())
    }

    fn max_transmission_unit(&self) -> Option<usize> {
        Some(self.mtu)
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities.clone()
    }
}

impl Drop for BleBackend {
    fn drop(&mut self) {
        // Only reached with a live task when stop was abandoned
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Radio Task
// ----------------------------------------------------------------------------

/// Progress of a requested activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Off,
    /// Requested while the radio was not powered on
    Pending,
    Running,
}

struct RadioTask {
    config: BleBackendConfig,
    sink: BackendEventSink,
    central: Box<dyn CentralDriver>,
    peripheral: Option<Box<dyn PeripheralDriver>>,
    device_id: String,
    central_power: PowerState,
    peripheral_power: PowerState,
    scan: Slot,
    advert: Slot,
    advertisement: Option<Advertisement>,
    /// Every live link, keyed by device address
    links: HashMap<String, Role>,
    /// Outbound connects still in progress
    connecting: JoinSet<ConnectOutcome>,
}

type ConnectOutcome = (String, Result<(), BleError>);

impl RadioTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RadioCommand>,
        mut events: DriverEventReceiver,
    ) {
        self.central_power = self.central.power_state().await;
        if let Some(peripheral) = self.peripheral.as_mut() {
            self.peripheral_power = peripheral.power_state().await;
        }
        info!(
            central = %self.central_power,
            peripheral = %self.peripheral_power,
            device = %self.device_id,
            "BLE radio task starting"
        );

        let mut events_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(RadioCommand::Stop { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Backend dropped, shutting radio down");
                        self.shutdown().await;
                        break;
                    }
                },

                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_driver_event(event).await,
                    None => {
                        warn!("Driver event stream closed");
                        events_open = false;
                    }
                },

                Some(joined) = self.connecting.join_next(), if !self.connecting.is_empty() => {
                    self.finish_connect(joined);
                }
            }
        }

        info!("BLE radio task stopped");
    }

    async fn handle_command(&mut self, command: RadioCommand) {
        match command {
            RadioCommand::Advertise { display_name } => self.request_advertising(display_name).await,
            RadioCommand::Discover => self.request_scan().await,
            RadioCommand::Connect { address, timeout } => self.connect(address, timeout),
            RadioCommand::Send {
                target,
                bytes,
                reply,
            } => {
                let result = self.write(target, &bytes).await;
                let _ = reply.send(result);
            }
            // Handled by the run loop
            RadioCommand::Stop { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Activities
    // ------------------------------------------------------------------------

    async fn request_advertising(&mut self, display_name: String) {
        if self.peripheral.is_none() {
            self.sink
                .activity_failed(Activity::Advertising, BleError::PeripheralUnsupported.to_string());
            return;
        }
        let payload = AdvertPayload::new(
            &self.device_id,
            &display_name,
            self.config.advertised_id_len,
            self.config.advertised_name_len,
        );
        let service_data = match payload.to_bytes() {
            Ok(data) => data,
            Err(e) => {
                self.sink.activity_failed(
                    Activity::Advertising,
                    format!("advertise payload encode failed: {e}"),
                );
                return;
            }
        };
        self.advertisement = Some(Advertisement {
            service_uuid: self.config.service_uuid,
            local_name: display_name,
            service_data,
        });

        if self.peripheral_power.is_on() {
            self.begin_advertising().await;
        } else if self.peripheral_power.is_terminal() {
            self.sink.activity_failed(
                Activity::Advertising,
                format!("peripheral radio is {}", self.peripheral_power),
            );
        } else {
            debug!(power = %self.peripheral_power, "Advertising deferred until powered on");
            self.advert = Slot::Pending;
        }
    }

    async fn begin_advertising(&mut self) {
        let (Some(peripheral), Some(advertisement)) =
            (self.peripheral.as_mut(), self.advertisement.as_ref())
        else {
            return;
        };
        match peripheral.start_advertising(advertisement).await {
            Ok(()) => {
                info!(name = %advertisement.local_name, "BLE advertising started");
                self.advert = Slot::Running;
                self.sink.activity_started(Activity::Advertising);
            }
            Err(e) => {
                self.advert = Slot::Off;
                self.sink.activity_failed(Activity::Advertising, e.to_string());
            }
        }
    }

    async fn request_scan(&mut self) {
        if self.central_power.is_on() {
            self.begin_scan().await;
        } else if self.central_power.is_terminal() {
            self.sink.activity_failed(
                Activity::Discovery,
                format!("central radio is {}", self.central_power),
            );
        } else {
            debug!(power = %self.central_power, "Scan deferred until powered on");
            self.scan = Slot::Pending;
        }
    }

    async fn begin_scan(&mut self) {
        match self
            .central
            .start_scan(self.config.service_uuid, self.config.allow_duplicates)
            .await
        {
            Ok(()) => {
                info!("BLE scanning started");
                self.scan = Slot::Running;
                self.sink.activity_started(Activity::Discovery);
            }
            Err(e) => {
                self.scan = Slot::Off;
                self.sink.activity_failed(Activity::Discovery, e.to_string());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    fn connect(&mut self, address: String, timeout: Duration) {
        if self.links.contains_key(&address) {
            self.sink
                .link_state(RawPeerId::new(address), LinkState::Connected);
            return;
        }
        if !self.central_power.is_on() {
            warn!(%address, power = %self.central_power, "Cannot connect, central radio is not on");
            self.sink
                .link_state(RawPeerId::new(address), LinkState::NotConnected);
            return;
        }
        debug!(%address, ?timeout, "Connecting as central");
        let pending = self.central.connect(&address, timeout);
        self.connecting
            .spawn(async move { (address, pending.await) });
    }

    fn finish_connect(&mut self, joined: Result<ConnectOutcome, JoinError>) {
        let (address, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Connect task ended without a result: {}", e);
                return;
            }
        };
        match result {
            Ok(()) => {
                info!(%address, "Connected as central");
                let known = self.links.insert(address.clone(), Role::Central).is_some();
                if !known {
                    self.sink
                        .link_state(RawPeerId::new(address), LinkState::Connected);
                }
            }
            Err(e) => {
                warn!(%address, "Connection failed: {}", e);
                if !self.links.contains_key(&address) {
                    self.sink
                        .link_state(RawPeerId::new(address), LinkState::NotConnected);
                }
            }
        }
    }

    async fn write(&mut self, target: SendTarget, bytes: &[u8]) -> Result<(), BleError> {
        if bytes.len() > self.config.mtu {
            return Err(BleError::WriteTooLarge {
                size: bytes.len(),
                mtu: self.config.mtu,
            });
        }
        let targets: SmallVec<[(String, Role); 4]> = match target {
            SendTarget::Peer(peer) => {
                let role = self
                    .links
                    .get(peer.as_str())
                    .copied()
                    .ok_or_else(|| BleError::NotConnected {
                        address: peer.to_string(),
                    })?;
                smallvec::smallvec![(peer.as_str().to_string(), role)]
            }
            SendTarget::Broadcast => self
                .links
                .iter()
                .map(|(address, role)| (address.clone(), *role))
                .collect(),
        };

        for (address, role) in targets {
            match role {
                Role::Central => self.central.write(&address, bytes).await?,
                Role::Peripheral => match self.peripheral.as_mut() {
                    Some(peripheral) => peripheral.notify(&address, bytes).await?,
                    None => return Err(BleError::PeripheralUnsupported),
                },
            }
            trace!(%address, len = bytes.len(), ?role, "BLE write");
        }
        Ok(())
    }

    /// A remote central showed up on our GATT server
    fn accept_central(&mut self, address: &str) {
        if self.links.contains_key(address) {
            return;
        }
        info!(%address, "Central attached to GATT server");
        self.links.insert(address.to_string(), Role::Peripheral);
        self.sink
            .link_state(RawPeerId::new(address), LinkState::Connected);
    }

    fn drop_link(&mut self, address: &str, role: Role) {
        if self.links.get(address) == Some(&role) {
            self.links.remove(address);
            info!(%address, ?role, "BLE link closed");
            self.sink
                .link_state(RawPeerId::new(address), LinkState::NotConnected);
        }
    }

    fn drop_role(&mut self, role: Role) {
        let addresses: Vec<String> = self
            .links
            .iter()
            .filter(|(_, r)| **r == role)
            .map(|(address, _)| address.clone())
            .collect();
        for address in addresses {
            self.drop_link(&address, role);
        }
    }

    // ------------------------------------------------------------------------
    // Driver Events
    // ------------------------------------------------------------------------

    async fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::PowerChanged { role, state } => self.on_power(role, state).await,
            DriverEvent::Discovered(report) => {
                if self.scan != Slot::Running {
                    trace!(address = %report.address, "Ignoring report while not scanning");
                    return;
                }
                let name = resolve_display_name(&report);
                self.sink
                    .peer_found(RawPeerId::new(report.address), name, report.rssi);
            }
            DriverEvent::DeviceLost { address } => {
                self.sink.peer_lost(RawPeerId::new(address));
            }
            DriverEvent::Disconnected { role, address } => self.drop_link(&address, role),
            DriverEvent::Notification { address, value } => {
                self.sink.data(RawPeerId::new(address), value);
            }
            DriverEvent::Subscribed { address } => self.accept_central(&address),
            DriverEvent::Unsubscribed { address } => self.drop_link(&address, Role::Peripheral),
            DriverEvent::WriteReceived { address, value } => {
                self.accept_central(&address);
                self.sink.data(RawPeerId::new(address), value);
            }
            DriverEvent::Fault { message } => {
                self.sink.fault(message);
            }
        }
    }

    async fn on_power(&mut self, role: Role, state: PowerState) {
        info!(?role, %state, "Radio power changed");
        let (slot, activity) = match role {
            Role::Central => {
                self.central_power = state;
                (self.scan, Activity::Discovery)
            }
            Role::Peripheral => {
                self.peripheral_power = state;
                (self.advert, Activity::Advertising)
            }
        };

        match (slot, state) {
            (Slot::Pending, PowerState::PoweredOn) => match activity {
                Activity::Discovery => self.begin_scan().await,
                Activity::Advertising => self.begin_advertising().await,
            },
            (Slot::Pending, s) if s.is_terminal() => {
                self.set_slot(role, Slot::Off);
                self.sink
                    .activity_failed(activity, format!("radio is {state}"));
            }
            (Slot::Running, s) if !s.is_on() => {
                self.set_slot(role, Slot::Off);
                self.sink
                    .activity_stopped(activity, format!("radio is {state}"));
            }
            _ => {}
        }

        if !state.is_on() {
            self.drop_role(role);
        }
    }

    fn set_slot(&mut self, role: Role, slot: Slot) {
        match role {
            Role::Central => self.scan = slot,
            Role::Peripheral => self.advert = slot,
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    async fn shutdown(&mut self) {
        self.connecting.shutdown().await;
        if self.scan == Slot::Running {
            if let Err(e) = self.central.stop_scan().await {
                debug!("Stopping scan failed: {}", e);
            }
        }
        let central_links: Vec<String> = self
            .links
            .iter()
            .filter(|(_, role)| **role == Role::Central)
            .map(|(address, _)| address.clone())
            .collect();
        for address in central_links {
            if let Err(e) = self.central.disconnect(&address).await {
                debug!(%address, "Disconnect failed: {}", e);
            }
        }
        if let Some(peripheral) = self.peripheral.as_mut() {
            if self.advert == Slot::Running {
                if let Err(e) = peripheral.stop_advertising().await {
                    debug!("Stopping advertising failed: {}", e);
                }
            }
            if let Err(e) = peripheral.close().await {
                debug!("Closing GATT server failed: {}", e);
            }
        }
        self.scan = Slot::Off;
        self.advert = Slot::Off;
        self.advertisement = None;
        self.links.clear();
    }
}
