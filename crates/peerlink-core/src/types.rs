//! Core types for the peerlink engine
//!
//! Newtypes for the identifiers that cross the engine boundary. Backends speak
//! in [`RawPeerId`]s (display names, endpoint ids, device addresses); consumers
//! only ever see the session-scoped logical [`PeerId`].

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::PeerlinkError;

// ----------------------------------------------------------------------------
// Peer Identifiers
// ----------------------------------------------------------------------------

/// Session-scoped logical peer identifier handed to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u32);

impl PeerId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerlinkError;

    /// Accepts both the display form (`peer-3`) and the bare number (`3`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("peer-").unwrap_or(s);
        digits
            .parse::<u32>()
            .map(Self)
            .map_err(|_| PeerlinkError::config_error(format!("invalid peer id: {s}")))
    }
}

/// Backend-native peer identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPeerId(String);

impl RawPeerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RawPeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RawPeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RawPeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ----------------------------------------------------------------------------
// Service Identifier
// ----------------------------------------------------------------------------

/// Identifier both sides must agree on to see each other
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a service identifier, rejecting empty or whitespace-bearing values
    pub fn new(value: impl Into<String>) -> crate::Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(PeerlinkError::config_error("service identifier is empty"));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(PeerlinkError::config_error(format!(
                "service identifier contains whitespace: {value:?}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Backend Kinds
// ----------------------------------------------------------------------------

/// The native transport a backend wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    /// Session-based peer-to-peer mesh framework
    Mesh,
    /// Cloud-assisted nearby connections service
    Nearby,
    /// Bluetooth Low Energy GATT
    Ble,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Mesh => write!(f, "mesh"),
            BackendKind::Nearby => write!(f, "nearby"),
            BackendKind::Ble => write!(f, "ble"),
        }
    }
}

/// Presence activity a backend can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Activity {
    Advertising,
    Discovery,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Advertising => write!(f, "advertising"),
            Activity::Discovery => write!(f, "discovery"),
        }
    }
}

/// Per-peer link state as reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    Connecting,
    Connected,
    NotConnected,
}

// ----------------------------------------------------------------------------
// Session Generation
// ----------------------------------------------------------------------------

/// Monotonic session counter used to discard events from torn-down backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Generation(u64);

impl Generation {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Wall-clock milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
