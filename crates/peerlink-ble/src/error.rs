//! Error types for the BLE backend

use peerlink_core::{BackendKind, TransportError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors raised by BLE drivers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("BLE adapter not available: {0}")]
    AdapterNotAvailable(String),

    #[error("Radio is not powered on")]
    PoweredOff,

    #[error("Bluetooth use is not authorized")]
    Unauthorized,

    #[error("Peripheral role not supported on this platform")]
    PeripheralUnsupported,

    #[error("Device not discovered: {address}")]
    DeviceNotFound { address: String },

    #[error("Device not connected: {address}")]
    NotConnected { address: String },

    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection to {address} timed out")]
    ConnectionTimeout { address: String },

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Write of {size} bytes exceeds MTU {mtu}")]
    WriteTooLarge { size: usize, mtu: usize },

    #[error("Failed to write to characteristic: {0}")]
    WriteFailed(String),

    #[error("Failed to start advertising: {0}")]
    AdvertisingFailed(String),

    #[error("Failed to start scanning: {0}")]
    ScanFailed(String),

    #[error("Radio task is not running")]
    RadioClosed,
}

impl From<BleError> for TransportError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::AdapterNotAvailable(_) | BleError::PoweredOff | BleError::Unauthorized => {
                TransportError::unavailable(err.to_string())
            }
            BleError::PeripheralUnsupported => TransportError::unsupported(BackendKind::Ble, "advertise"),
            BleError::DeviceNotFound { address } => TransportError::PeerNotFound { peer: address },
            BleError::NotConnected { address } => TransportError::not_connected(address),
            BleError::ConnectionFailed { address, reason } => {
                TransportError::connection_failed(address, reason)
            }
            BleError::ConnectionTimeout { address } => TransportError::Timeout { peer: address },
            other => TransportError::native(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_to_transport_errors() {
        assert!(matches!(
            TransportError::from(BleError::PoweredOff),
            TransportError::Unavailable { .. }
        ));
        assert_eq!(
            TransportError::from(BleError::NotConnected {
                address: "AA:BB".into()
            }),
            TransportError::not_connected("AA:BB")
        );
        assert!(matches!(
            TransportError::from(BleError::WriteFailed("gatt".into())),
            TransportError::Native { .. }
        ));
        assert_eq!(
            TransportError::from(BleError::ConnectionTimeout {
                address: "AA:BB".into()
            })
            .to_string(),
            "Connect to AA:BB timed out"
        );
    }
}
