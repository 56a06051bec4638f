//! Interactive session
//!
//! Reads one command per line from stdin and prints every engine event as a
//! JSON line. Commands:
//!
//! - `advertise` / `discover`
//! - `both`: advertise, then discover once advertising is up
//! - `invite <peer>` where peer is `peer-N` or `N`
//! - `send <peer|*> <hex>`
//! - `stop`, `state`, `permissions`, `quit`
//!
//! On the virtual backend an echo node named `Echo` advertises on the same
//! medium and sends every payload it receives back to the sender.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peerlink_ble::BleBackendFactory;
use peerlink_core::{AppEvent, PeerId, Recipient, ServiceId};
use peerlink_harness::VirtualAir;
use peerlink_runtime::{PeerlinkHandle, RuntimeBuilder};

use crate::cli::SessionBackend;
use crate::config::CliConfig;
use crate::error::{CliError, Result};
use crate::output::{event_line, print_line, rejected_line, state_line};

const ECHO_NAME: &str = "Echo";

// ----------------------------------------------------------------------------
// Line Commands
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Advertise,
    Discover,
    Both,
    Invite(PeerId),
    Send { to: Recipient, bytes: Vec<u8> },
    Stop,
    State,
    Permissions,
    Quit,
}

impl SessionCommand {
    /// Parse one input line; blank lines yield `None`
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let command = match verb {
            "advertise" => SessionCommand::Advertise,
            "discover" => SessionCommand::Discover,
            "both" => SessionCommand::Both,
            "invite" => {
                let peer = words
                    .next()
                    .ok_or_else(|| CliError::InvalidCommand("usage: invite <peer>".into()))?;
                SessionCommand::Invite(peer.parse()?)
            }
            "send" => {
                let (Some(to), Some(hex_bytes)) = (words.next(), words.next()) else {
                    return Err(CliError::InvalidCommand(
                        "usage: send <peer|*> <hex>".into(),
                    ));
                };
                let to = match to {
                    "*" => Recipient::Broadcast,
                    peer => Recipient::Peer(peer.parse()?),
                };
                SessionCommand::Send {
                    to,
                    bytes: hex::decode(hex_bytes)?,
                }
            }
            "stop" => SessionCommand::Stop,
            "state" => SessionCommand::State,
            "permissions" => SessionCommand::Permissions,
            "quit" | "exit" => SessionCommand::Quit,
            other => {
                return Err(CliError::InvalidCommand(format!("unknown command: {other}")));
            }
        };
        if words.next().is_some() {
            return Err(CliError::InvalidCommand(format!(
                "unexpected arguments after {verb}"
            )));
        }
        Ok(Some(command))
    }
}

// ----------------------------------------------------------------------------
// Session Loop
// ----------------------------------------------------------------------------

pub async fn run_session(
    config: &CliConfig,
    backend: SessionBackend,
    name: Option<String>,
) -> Result<()> {
    let service = config.service_id()?;
    let engine_config = config.engine_config(name.as_deref());
    let display_name = engine_config.engine.local_name.clone();

    let mut echo = None;
    let handle = match backend {
        SessionBackend::Virtual => {
            let air = VirtualAir::new();
            let echo_handle = RuntimeBuilder::new()
                .with_config(config.engine_config(Some(ECHO_NAME)))
                .with_backend(BleBackendFactory::new(
                    config.ble.clone(),
                    air.ble_radio("EC:00"),
                ))
                .build()?;
            echo = Some(spawn_echo(echo_handle, service.clone()).await?);

            RuntimeBuilder::new()
                .with_config(engine_config)
                .with_backend(BleBackendFactory::new(
                    config.ble.clone(),
                    air.ble_radio("01:00"),
                ))
                .build()?
        }
        SessionBackend::Ble => RuntimeBuilder::new()
            .with_config(engine_config)
            .with_backend(native_ble_factory(config)?)
            .build()?,
    };
    info!(name = %display_name, ?backend, %service, "Session started");

    let result = drive(&handle, &service, &display_name).await;

    if let Some(echo) = echo {
        echo.abort();
    }
    handle.shutdown().await?;
    info!("Session closed");
    result
}

async fn drive(handle: &PeerlinkHandle, service: &ServiceId, display_name: &str) -> Result<()> {
    let mut events = handle.events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            biased;

            Some(event) = events.next_event() => {
                print_line(&event_line(None, &event)?)?;
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    return Ok(());
                };
                let command = match SessionCommand::parse(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        print_line(&rejected_line(&line, &e.to_string()))?;
                        continue;
                    }
                };
                debug!(?command, "Session command");
                match command {
                    SessionCommand::Advertise => {
                        handle.start_advertising(display_name, service).await?
                    }
                    SessionCommand::Discover => handle.start_discovery(service).await?,
                    SessionCommand::Both => handle.start_both(display_name, service).await?,
                    SessionCommand::Invite(peer) => handle.invite(peer).await?,
                    SessionCommand::Send { to, bytes } => handle.send(to, bytes).await?,
                    SessionCommand::Stop => handle.stop().await?,
                    SessionCommand::State => print_line(&state_line(&handle.state())?)?,
                    SessionCommand::Permissions => {
                        let report = AppEvent::permissions(handle.permissions());
                        print_line(&event_line(None, &report)?)?
                    }
                    SessionCommand::Quit => return Ok(()),
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Backends
// ----------------------------------------------------------------------------

#[cfg(feature = "native")]
fn native_ble_factory(config: &CliConfig) -> Result<BleBackendFactory> {
    Ok(BleBackendFactory::native(config.ble.clone()))
}

#[cfg(not(feature = "native"))]
fn native_ble_factory(_config: &CliConfig) -> Result<BleBackendFactory> {
    Err(CliError::FeatureNotAvailable(
        "the ble backend needs peerlink-cli built with the `native` feature".into(),
    ))
}

/// Advertise as the echo node and bounce every payload back to its sender
async fn spawn_echo(handle: PeerlinkHandle, service: ServiceId) -> Result<JoinHandle<()>> {
    let mut events = handle.events();
    handle.start_advertising(ECHO_NAME, &service).await?;
    Ok(tokio::spawn(async move {
        while let Some(event) = events.next_event().await {
            if let AppEvent::DataReceived { peer_id, bytes } = event {
                if let Err(e) = handle.send(Recipient::Peer(peer_id), bytes).await {
                    warn!("Echo node stopped: {}", e);
                    break;
                }
            }
        }
        let _ = handle.shutdown().await;
    }))
}
