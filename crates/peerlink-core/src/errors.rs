//! Error types for the peerlink engine
//!
//! [`TransportError`] is what a backend reports about its native transport;
//! [`PeerlinkError`] is the engine-level taxonomy surfaced to consumers as
//! `error` events, tagged with an [`ErrorKind`].

use serde::{Deserialize, Serialize};

use crate::types::{Activity, BackendKind, PeerId};

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Errors reported by transport backends
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is not available: {reason}")]
    Unavailable { reason: String },
    #[error("Connection failed to peer {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },
    #[error("Peer {peer} is not connected")]
    NotConnected { peer: String },
    #[error("Peer not found: {peer}")]
    PeerNotFound { peer: String },
    #[error("Send failed: queue full (capacity: {capacity})")]
    QueueFull { capacity: usize },
    #[error("Operation not supported by {backend}: {operation}")]
    Unsupported {
        backend: BackendKind,
        operation: String,
    },
    #[error("Connect to {peer} timed out")]
    Timeout { peer: String },
    #[error("Native transport error: {message}")]
    Native { message: String },
}

impl TransportError {
    pub fn unavailable<T: Into<String>>(reason: T) -> Self {
        TransportError::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn native<T: Into<String>>(message: T) -> Self {
        TransportError::Native {
            message: message.into(),
        }
    }

    pub fn not_connected<T: Into<String>>(peer: T) -> Self {
        TransportError::NotConnected { peer: peer.into() }
    }

    pub fn connection_failed<P: Into<String>, R: Into<String>>(peer: P, reason: R) -> Self {
        TransportError::ConnectionFailed {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported<T: Into<String>>(backend: BackendKind, operation: T) -> Self {
        TransportError::Unsupported {
            backend,
            operation: operation.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Error Kinds
// ----------------------------------------------------------------------------

/// Machine-readable tag carried by `error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    PermissionDenied,
    TransportUnavailable,
    ConnectFailed,
    SendFailed,
    FragmentOrderViolation,
    UnknownPeer,
    PayloadTooLarge,
    MalformedFrame,
    TransportFault,
    Channel,
    Configuration,
}

// ----------------------------------------------------------------------------
// Engine Errors
// ----------------------------------------------------------------------------

/// Engine-level error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum PeerlinkError {
    /// A required capability is not granted
    #[error("Permission denied for {activity}: {capability} is {status}")]
    PermissionDenied {
        activity: Activity,
        capability: String,
        status: String,
    },

    /// No backend usable on this platform or for this operation
    #[error("Transport unavailable: {reason}")]
    TransportUnavailable { reason: String },

    #[error("Connect to {peer} failed: {reason}")]
    ConnectFailed { peer: PeerId, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    /// Inbound frame arrived out of chunk order or duplicated
    #[error("Fragment order violation from {peer}: expected chunk {expected}, got {actual}")]
    FragmentOrderViolation {
        peer: PeerId,
        expected: u32,
        actual: u32,
    },

    #[error("Unknown peer: {peer}")]
    UnknownPeer { peer: PeerId },

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel communication error between engine and handle
    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

pub type Result<T> = core::result::Result<T, PeerlinkError>;

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl PeerlinkError {
    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        PeerlinkError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        PeerlinkError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn send_failed<T: Into<String>>(reason: T) -> Self {
        PeerlinkError::SendFailed {
            reason: reason.into(),
        }
    }

    pub fn connect_failed<T: Into<String>>(peer: PeerId, reason: T) -> Self {
        PeerlinkError::ConnectFailed {
            peer,
            reason: reason.into(),
        }
    }

    pub fn unavailable<T: Into<String>>(reason: T) -> Self {
        PeerlinkError::TransportUnavailable {
            reason: reason.into(),
        }
    }

    pub fn malformed_frame<T: Into<String>>(reason: T) -> Self {
        PeerlinkError::MalformedFrame {
            reason: reason.into(),
        }
    }

    /// Tag used on the consumer-facing `error` event
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerlinkError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            PeerlinkError::TransportUnavailable { .. } => ErrorKind::TransportUnavailable,
            PeerlinkError::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            PeerlinkError::SendFailed { .. } => ErrorKind::SendFailed,
            PeerlinkError::FragmentOrderViolation { .. } => ErrorKind::FragmentOrderViolation,
            PeerlinkError::UnknownPeer { .. } => ErrorKind::UnknownPeer,
            PeerlinkError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            PeerlinkError::MalformedFrame { .. } | PeerlinkError::Serialization(_) => {
                ErrorKind::MalformedFrame
            }
            PeerlinkError::Transport(TransportError::Unavailable { .. }) => {
                ErrorKind::TransportUnavailable
            }
            PeerlinkError::Transport(_) => ErrorKind::TransportFault,
            PeerlinkError::Channel { .. } => ErrorKind::Channel,
            PeerlinkError::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Errors after which the engine task cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(self, PeerlinkError::Channel { .. })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let peer = PeerId::new(1);
        assert_eq!(
            PeerlinkError::UnknownPeer { peer }.kind(),
            ErrorKind::UnknownPeer
        );
        assert_eq!(
            PeerlinkError::from(TransportError::unavailable("radio off")).kind(),
            ErrorKind::TransportUnavailable
        );
        assert_eq!(
            PeerlinkError::from(TransportError::native("gatt 133")).kind(),
            ErrorKind::TransportFault
        );
        assert!(PeerlinkError::channel_error("closed").is_fatal());
        assert!(!PeerlinkError::send_failed("no peers").is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = PeerlinkError::FragmentOrderViolation {
            peer: PeerId::new(2),
            expected: 1,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Fragment order violation from peer-2: expected chunk 1, got 3"
        );
    }
}
