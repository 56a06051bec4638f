//! BLE protocol constants and advertisement payloads

use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Peerlink BLE service UUID
pub const PEERLINK_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FEED_0000_1000_8000_00805F9B34FB);

/// Characteristic a central writes to (central to peripheral)
pub const PEERLINK_WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000FEE1_0000_1000_8000_00805F9B34FB);

/// Characteristic a peripheral notifies on (peripheral to central)
pub const PEERLINK_NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000FEE2_0000_1000_8000_00805F9B34FB);

/// Display name used when an advertisement carries none
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

// ----------------------------------------------------------------------------
// Advertisement Payload
// ----------------------------------------------------------------------------

/// Compact identity carried in the service data of an advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertPayload {
    /// Truncated device id
    pub id: String,
    /// Truncated display name
    #[serde(rename = "n")]
    pub name: String,
}

impl AdvertPayload {
    pub fn new(device_id: &str, display_name: &str, id_len: usize, name_len: usize) -> Self {
        Self {
            id: device_id.chars().take(id_len).collect(),
            name: display_name.chars().take(name_len).collect(),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Everything a peripheral broadcasts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub service_uuid: Uuid,
    pub local_name: String,
    pub service_data: Vec<u8>,
}

/// One advertisement report seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanReport {
    pub address: String,
    pub local_name: Option<String>,
    pub service_data: Option<Vec<u8>>,
    pub rssi: Option<i16>,
}

/// Pick the display name for a scanned device
///
/// Service data wins over the advertised local name; a device offering
/// neither is reported as [`UNKNOWN_DEVICE_NAME`].
pub fn resolve_display_name(report: &ScanReport) -> String {
    if let Some(data) = report.service_data.as_deref() {
        match AdvertPayload::from_bytes(data) {
            Ok(payload) if !payload.name.is_empty() => return payload.name,
            Ok(_) => {}
            Err(_) => {
                if let Ok(text) = std::str::from_utf8(data) {
                    if !text.trim().is_empty() {
                        return text.to_string();
                    }
                }
                trace!(address = %report.address, data = %hex::encode(data), "Unparseable service data");
            }
        }
    }
    match report.local_name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => UNKNOWN_DEVICE_NAME.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_uuid_string() {
        assert_eq!(
            PEERLINK_SERVICE_UUID.to_string(),
            "0000feed-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_payload_truncates_and_uses_short_keys() {
        let payload = AdvertPayload::new("A1B2C3D4E5", "Alexander the Great", 6, 10);
        assert_eq!(payload.id, "A1B2C3");
        assert_eq!(payload.name, "Alexander ");

        let json = String::from_utf8(payload.to_bytes().unwrap()).unwrap();
        assert_eq!(json, r#"{"id":"A1B2C3","n":"Alexander "}"#);
    }

    #[test]
    fn test_display_name_prefers_service_data() {
        let report = ScanReport {
            address: "AA".into(),
            local_name: Some("phone".into()),
            service_data: Some(br#"{"id":"abc","n":"Alice"}"#.to_vec()),
            rssi: Some(-50),
        };
        assert_eq!(resolve_display_name(&report), "Alice");
    }

    #[test]
    fn test_display_name_fallbacks() {
        let with_name = ScanReport {
            address: "AA".into(),
            local_name: Some("phone".into()),
            ..Default::default()
        };
        assert_eq!(resolve_display_name(&with_name), "phone");

        let raw_text = ScanReport {
            address: "AA".into(),
            service_data: Some(b"legacy".to_vec()),
            ..Default::default()
        };
        assert_eq!(resolve_display_name(&raw_text), "legacy");

        let bare = ScanReport {
            address: "AA".into(),
            ..Default::default()
        };
        assert_eq!(resolve_display_name(&bare), UNKNOWN_DEVICE_NAME);
    }
}
