//! Two-node demo over the virtual BLE medium
//!
//! Alice advertises, Bob discovers her, invites her and sends a payload. Alice
//! checks it arrived intact and echoes it back as a broadcast, then Bob stops
//! and Alice sees the link drop.

use std::time::Duration;

use tracing::info;

use peerlink_ble::BleBackendFactory;
use peerlink_core::{AppEvent, LinkState, PeerId, Recipient, ServiceId, HEADER_LEN};
use peerlink_harness::VirtualAir;
use peerlink_runtime::{EventStream, PeerlinkHandle, RuntimeBuilder};

use crate::config::CliConfig;
use crate::error::{CliError, Result};
use crate::output::{event_line, print_line};

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// What the demo observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoReport {
    pub mtu: usize,
    pub payload_size: usize,
    /// Events seen by Alice and Bob, in order
    pub alice_events: Vec<AppEvent>,
    pub bob_events: Vec<AppEvent>,
}

struct Node {
    name: &'static str,
    handle: PeerlinkHandle,
    events: EventStream,
    seen: Vec<AppEvent>,
    print: bool,
}

impl Node {
    fn create(
        name: &'static str,
        config: &CliConfig,
        air: &VirtualAir,
        address: &str,
        mtu: usize,
        print: bool,
    ) -> Result<Self> {
        let handle = RuntimeBuilder::new()
            .with_config(config.engine_config(Some(name)))
            .with_backend(BleBackendFactory::new(
                config.ble.clone().with_mtu(mtu),
                air.ble_radio(address),
            ))
            .build()?;
        let events = handle.events();
        Ok(Self {
            name,
            handle,
            events,
            seen: Vec::new(),
            print,
        })
    }

    /// Consume events until one matches
    async fn wait_for<T>(
        &mut self,
        step: &str,
        mut matches: impl FnMut(&AppEvent) -> Option<T>,
    ) -> Result<T> {
        let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.next_event())
                .await
                .map_err(|_| {
                    CliError::Demo(format!("{} timed out waiting for {}", self.name, step))
                })?
                .ok_or_else(|| CliError::Demo(format!("{} engine exited", self.name)))?;
            if self.print {
                print_line(&event_line(Some(self.name), &event)?)?;
            }
            let found = matches(&event);
            self.seen.push(event);
            if let Some(value) = found {
                return Ok(value);
            }
        }
    }

    async fn connected(&mut self) -> Result<PeerId> {
        self.wait_for("connection", |event| match event {
            AppEvent::ConnectionState {
                peer_id,
                state: LinkState::Connected,
            } => Some(*peer_id),
            _ => None,
        })
        .await
    }

    async fn received(&mut self) -> Result<(PeerId, Vec<u8>)> {
        self.wait_for("data", |event| match event {
            AppEvent::DataReceived { peer_id, bytes } => Some((*peer_id, bytes.clone())),
            _ => None,
        })
        .await
    }
}

/// Payload of `size` bytes counting up from zero
pub fn demo_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

pub async fn run_demo(
    config: &CliConfig,
    mtu: Option<usize>,
    payload_size: usize,
    print_events: bool,
) -> Result<DemoReport> {
    let mtu = mtu.unwrap_or(config.ble.mtu);
    if mtu <= HEADER_LEN {
        return Err(CliError::Config(format!(
            "mtu must exceed the {HEADER_LEN}-byte frame header"
        )));
    }
    if payload_size == 0 {
        return Err(CliError::Config("payload size must be greater than zero".into()));
    }
    let service: ServiceId = config.service_id()?;
    info!(mtu, payload_size, %service, "Running demo");

    let air = VirtualAir::new();
    let mut alice = Node::create("Alice", config, &air, "AA:01", mtu, print_events)?;
    let mut bob = Node::create("Bob", config, &air, "BB:02", mtu, print_events)?;

    alice.handle.start_advertising("Alice", &service).await?;
    alice
        .wait_for("advertising", |e| (*e == AppEvent::AdvertisingStarted).then_some(()))
        .await?;

    bob.handle.start_discovery(&service).await?;
    let alice_id = bob
        .wait_for("Alice", |event| match event {
            AppEvent::PeerFound {
                peer_id,
                display_name,
                ..
            } if display_name == "Alice" => Some(*peer_id),
            _ => None,
        })
        .await?;

    bob.handle.invite(alice_id).await?;
    bob.connected().await?;
    let bob_id = alice.connected().await?;

    let payload = demo_payload(payload_size);
    bob.handle
        .send(Recipient::Peer(alice_id), payload.clone())
        .await?;
    let (from, bytes) = alice.received().await?;
    if from != bob_id || bytes != payload {
        return Err(CliError::Demo(format!(
            "Alice received {} bytes from {}, expected {} bytes from {}",
            bytes.len(),
            from,
            payload.len(),
            bob_id
        )));
    }

    alice.handle.send(Recipient::Broadcast, bytes).await?;
    let (from, echoed) = bob.received().await?;
    if from != alice_id || echoed != payload {
        return Err(CliError::Demo("echo did not match the payload".into()));
    }

    bob.handle.stop().await?;
    bob.wait_for("stop", |e| (*e == AppEvent::Stopped).then_some(()))
        .await?;
    alice
        .wait_for("disconnect", |event| match event {
            AppEvent::ConnectionState {
                peer_id,
                state: LinkState::NotConnected,
            } if *peer_id == bob_id => Some(()),
            _ => None,
        })
        .await?;

    let report = DemoReport {
        mtu,
        payload_size,
        alice_events: std::mem::take(&mut alice.seen),
        bob_events: std::mem::take(&mut bob.seen),
    };
    alice.handle.shutdown().await?;
    bob.handle.shutdown().await?;
    info!("Demo finished");
    Ok(report)
}
