//! BLE backend configuration

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::PEERLINK_SERVICE_UUID;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleBackendConfig {
    /// GATT service advertised and scanned for
    pub service_uuid: Uuid,
    /// ATT payload size; every write or notification fits in one unit
    pub mtu: usize,
    /// Forward repeated advertisement reports so rssi stays fresh
    pub allow_duplicates: bool,
    /// Characters of the device id carried in the advertisement
    pub advertised_id_len: usize,
    /// Characters of the display name carried in the advertisement
    pub advertised_name_len: usize,
}

impl Default for BleBackendConfig {
    fn default() -> Self {
        Self {
            service_uuid: PEERLINK_SERVICE_UUID,
            mtu: 185,
            allow_duplicates: true,
            advertised_id_len: 6,
            advertised_name_len: 10,
        }
    }
}

impl BleBackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the negotiated ATT payload size
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuid = uuid;
        self
    }

    /// Enable or disable duplicate advertisement reports
    pub fn with_allow_duplicates(mut self, enabled: bool) -> Self {
        self.allow_duplicates = enabled;
        self
    }

    /// Small MTU that forces fragmentation of short payloads
    pub fn testing() -> Self {
        Self {
            mtu: 14,
            ..Self::default()
        }
    }
}
