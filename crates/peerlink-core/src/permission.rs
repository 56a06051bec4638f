//! Permission gate
//!
//! The engine asks the gate before it starts advertising or discovery. The
//! host keeps the gate current (typically from its OS permission callbacks);
//! prompting the user is the host's business. Gates that can signal changes
//! let the engine report them as `permissionsChanged` events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::types::Activity;
use crate::{PeerlinkError, Result};

// ----------------------------------------------------------------------------
// Capability Report
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    NotDetermined,
}

impl fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionStatus::Granted => write!(f, "granted"),
            PermissionStatus::Denied => write!(f, "denied"),
            PermissionStatus::NotDetermined => write!(f, "notDetermined"),
        }
    }
}

/// Cached OS permission state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityReport {
    /// Bluetooth / nearby-radio access
    pub radio: PermissionStatus,
    /// Location-tied proximity scanning
    pub proximity_scan: PermissionStatus,
}

impl CapabilityReport {
    pub fn granted() -> Self {
        Self {
            radio: PermissionStatus::Granted,
            proximity_scan: PermissionStatus::Granted,
        }
    }

    pub fn undetermined() -> Self {
        Self {
            radio: PermissionStatus::NotDetermined,
            proximity_scan: PermissionStatus::NotDetermined,
        }
    }

    /// Check the capabilities `activity` needs; anything but `Granted` blocks it
    pub fn check(&self, activity: Activity, scan_requires_location: bool) -> Result<()> {
        if self.radio != PermissionStatus::Granted {
            return Err(PeerlinkError::PermissionDenied {
                activity,
                capability: "radio".into(),
                status: self.radio.to_string(),
            });
        }
        if activity == Activity::Discovery
            && scan_requires_location
            && self.proximity_scan != PermissionStatus::Granted
        {
            return Err(PeerlinkError::PermissionDenied {
                activity,
                capability: "proximityScan".into(),
                status: self.proximity_scan.to_string(),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Permission Gate
// ----------------------------------------------------------------------------

pub trait PermissionGate: Send + Sync {
    /// Must answer from cached state without blocking
    fn query_capabilities(&self) -> CapabilityReport;

    /// Change notifications, for gates whose answer can move while running
    fn subscribe(&self) -> Option<watch::Receiver<CapabilityReport>> {
        None
    }
}

/// Gate that grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantAll;

impl PermissionGate for GrantAll {
    fn query_capabilities(&self) -> CapabilityReport {
        CapabilityReport::granted()
    }
}

/// Host-updated gate; clones share the same state
#[derive(Debug, Clone)]
pub struct StaticPermissionGate {
    report: Arc<watch::Sender<CapabilityReport>>,
}

impl StaticPermissionGate {
    pub fn new(report: CapabilityReport) -> Self {
        let (report, _) = watch::channel(report);
        Self {
            report: Arc::new(report),
        }
    }

    /// Replace the whole report; subscribers hear about it only if it changed
    pub fn set(&self, report: CapabilityReport) {
        self.update(|current| *current = report);
    }

    pub fn set_radio(&self, status: PermissionStatus) {
        self.update(|current| current.radio = status);
    }

    pub fn set_proximity_scan(&self, status: PermissionStatus) {
        self.update(|current| current.proximity_scan = status);
    }

    fn update(&self, change: impl FnOnce(&mut CapabilityReport)) {
        self.report.send_if_modified(|current| {
            let before = *current;
            change(current);
            *current != before
        });
    }
}

impl Default for StaticPermissionGate {
    fn default() -> Self {
        Self::new(CapabilityReport::undetermined())
    }
}

impl PermissionGate for StaticPermissionGate {
    fn query_capabilities(&self) -> CapabilityReport {
        *self.report.borrow()
    }

    fn subscribe(&self) -> Option<watch::Receiver<CapabilityReport>> {
        Some(self.report.subscribe())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertising_needs_radio_only() {
        let report = CapabilityReport {
            radio: PermissionStatus::Granted,
            proximity_scan: PermissionStatus::Denied,
        };
        assert!(report.check(Activity::Advertising, true).is_ok());
        assert!(report.check(Activity::Discovery, false).is_ok());
        assert!(matches!(
            report.check(Activity::Discovery, true),
            Err(PeerlinkError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_not_determined_blocks() {
        let report = CapabilityReport::undetermined();
        let err = report.check(Activity::Advertising, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Permission denied for advertising: radio is notDetermined"
        );
    }

    #[test]
    fn test_static_gate_updates_are_shared() {
        let gate = StaticPermissionGate::default();
        let host_side = gate.clone();
        assert_eq!(gate.query_capabilities().radio, PermissionStatus::NotDetermined);

        host_side.set_radio(PermissionStatus::Granted);
        host_side.set_proximity_scan(PermissionStatus::Granted);
        assert_eq!(gate.query_capabilities(), CapabilityReport::granted());
    }

    #[test]
    fn test_subscribers_see_only_real_changes() {
        let gate = StaticPermissionGate::new(CapabilityReport::granted());
        let mut changes = gate.subscribe().unwrap();
        assert!(GrantAll.subscribe().is_none());

        gate.set_radio(PermissionStatus::Granted);
        assert!(!changes.has_changed().unwrap());

        gate.set_proximity_scan(PermissionStatus::Denied);
        assert!(changes.has_changed().unwrap());
        assert_eq!(
            changes.borrow_and_update().proximity_scan,
            PermissionStatus::Denied
        );
        assert!(!changes.has_changed().unwrap());
    }
}
