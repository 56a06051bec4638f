//! Channel schema
//!
//! Three message families flow through the engine:
//! - [`Command`]: consumer → engine
//! - [`BackendEvent`]: backend → engine, stamped with backend and generation
//! - [`AppEvent`]: engine → consumer, the normalized event vocabulary

use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::permission::PermissionStatus;
use crate::types::{Activity, BackendKind, Generation, LinkState, PeerId, RawPeerId, ServiceId};

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Destination of an outbound payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Recipient {
    Peer(PeerId),
    Broadcast,
}

/// Commands accepted by the lifecycle engine
///
/// `stop()` is deliberately absent: it travels on its own control path so it
/// can overtake queued commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartAdvertising {
        display_name: String,
        service: ServiceId,
    },
    StartDiscovery {
        service: ServiceId,
    },
    /// Advertise, then discover once advertising has settled
    StartBoth {
        display_name: String,
        service: ServiceId,
    },
    Invite {
        peer: PeerId,
    },
    Send {
        to: Recipient,
        bytes: Vec<u8>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartAdvertising { .. } => "StartAdvertising",
            Command::StartDiscovery { .. } => "StartDiscovery",
            Command::StartBoth { .. } => "StartBoth",
            Command::Invite { .. } => "Invite",
            Command::Send { .. } => "Send",
        }
    }
}

// ----------------------------------------------------------------------------
// Backend Events
// ----------------------------------------------------------------------------

/// Event raised by a transport backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEvent {
    pub backend: BackendKind,
    pub generation: Generation,
    pub kind: BackendEventKind,
}

/// Everything a backend can report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEventKind {
    PeerFound {
        peer: RawPeerId,
        display_name: String,
        rssi: Option<i16>,
    },
    PeerLost {
        peer: RawPeerId,
    },
    /// An incoming invitation; auto-accepting backends have already accepted it
    InvitationReceived {
        peer: RawPeerId,
        display_name: String,
    },
    ConnectionStateChanged {
        peer: RawPeerId,
        state: LinkState,
    },
    DataReceived {
        peer: RawPeerId,
        bytes: Vec<u8>,
    },
    TransportFault {
        message: String,
    },
    ActivityStarted {
        activity: Activity,
    },
    ActivityFailed {
        activity: Activity,
        reason: String,
    },
    /// An activity ended without being asked to, e.g. the radio powered off
    ActivityStopped {
        activity: Activity,
        reason: String,
    },
}

impl BackendEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendEventKind::PeerFound { .. } => "PeerFound",
            BackendEventKind::PeerLost { .. } => "PeerLost",
            BackendEventKind::InvitationReceived { .. } => "InvitationReceived",
            BackendEventKind::ConnectionStateChanged { .. } => "ConnectionStateChanged",
            BackendEventKind::DataReceived { .. } => "DataReceived",
            BackendEventKind::TransportFault { .. } => "TransportFault",
            BackendEventKind::ActivityStarted { .. } => "ActivityStarted",
            BackendEventKind::ActivityFailed { .. } => "ActivityFailed",
            BackendEventKind::ActivityStopped { .. } => "ActivityStopped",
        }
    }
}

// ----------------------------------------------------------------------------
// Application Events
// ----------------------------------------------------------------------------

/// Normalized event delivered to the consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum AppEvent {
    AdvertisingStarted,
    BrowsingStarted,
    #[serde(rename_all = "camelCase")]
    PeerFound {
        peer_id: PeerId,
        display_name: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        rssi: Option<i16>,
    },
    #[serde(rename_all = "camelCase")]
    PeerUpdated {
        peer_id: PeerId,
        display_name: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        rssi: Option<i16>,
    },
    #[serde(rename_all = "camelCase")]
    PeerLost { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    InvitationReceived {
        peer_id: PeerId,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    InvitationSent { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    ConnectionState { peer_id: PeerId, state: LinkState },
    #[serde(rename_all = "camelCase")]
    DataReceived { peer_id: PeerId, bytes: Vec<u8> },
    Stopped,
    Error { message: String, kind: ErrorKind },
    /// Current OS permission state, sent on attach and whenever it changes
    #[serde(rename_all = "camelCase")]
    PermissionsChanged {
        radio: PermissionStatus,
        proximity_scan: PermissionStatus,
    },
}

impl AppEvent {
    pub fn error(err: &crate::PeerlinkError) -> Self {
        AppEvent::Error {
            message: err.to_string(),
            kind: err.kind(),
        }
    }

    pub fn permissions(report: crate::CapabilityReport) -> Self {
        AppEvent::PermissionsChanged {
            radio: report.radio,
            proximity_scan: report.proximity_scan,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AppEvent::AdvertisingStarted => "advertisingStarted",
            AppEvent::BrowsingStarted => "browsingStarted",
            AppEvent::PeerFound { .. } => "peerFound",
            AppEvent::PeerUpdated { .. } => "peerUpdated",
            AppEvent::PeerLost { .. } => "peerLost",
            AppEvent::InvitationReceived { .. } => "invitationReceived",
            AppEvent::InvitationSent { .. } => "invitationSent",
            AppEvent::ConnectionState { .. } => "connectionState",
            AppEvent::DataReceived { .. } => "dataReceived",
            AppEvent::Stopped => "stopped",
            AppEvent::Error { .. } => "error",
            AppEvent::PermissionsChanged { .. } => "permissionsChanged",
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_app_event_wire_shape() {
        let event = AppEvent::PeerFound {
            peer_id: PeerId::new(1),
            display_name: "A".into(),
            rssi: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "peerFound", "peerId": 1, "displayName": "A"})
        );

        let event = AppEvent::ConnectionState {
            peer_id: PeerId::new(4),
            state: LinkState::Connecting,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "connectionState", "peerId": 4, "state": "connecting"})
        );

        assert_eq!(
            serde_json::to_value(&AppEvent::Stopped).unwrap(),
            json!({"event": "stopped"})
        );
    }

    #[test]
    fn test_error_event_carries_kind() {
        let err = crate::PeerlinkError::UnknownPeer {
            peer: PeerId::new(9),
        };
        let value = serde_json::to_value(AppEvent::error(&err)).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["kind"], "unknownPeer");
        assert_eq!(value["message"], "Unknown peer: peer-9");
    }

    #[test]
    fn test_permissions_event_wire_shape() {
        let event = AppEvent::permissions(crate::CapabilityReport {
            radio: PermissionStatus::Granted,
            proximity_scan: PermissionStatus::Denied,
        });
        assert_eq!(event.name(), "permissionsChanged");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "permissionsChanged", "radio": "granted", "proximityScan": "denied"})
        );
    }

    #[test]
    fn test_app_event_parses_back() {
        let parsed: AppEvent =
            serde_json::from_str(r#"{"event":"dataReceived","peerId":2,"bytes":[1,2,3]}"#)
                .unwrap();
        assert_eq!(
            parsed,
            AppEvent::DataReceived {
                peer_id: PeerId::new(2),
                bytes: vec![1, 2, 3]
            }
        );
        assert_eq!(parsed.name(), "dataReceived");
    }
}
