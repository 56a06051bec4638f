//! Engine configuration
//!
//! All runtime tunables in one place. Every struct has a `Default` plus a few
//! named presets, and [`PeerlinkConfig::validate`] rejects combinations the
//! engine cannot honor.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::{PeerlinkError, Result};

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the engine's channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Buffer size for the command channel (consumer → engine)
    pub command_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 32, // consumer commands are infrequent
        }
    }
}

impl ChannelConfig {
    /// Create configuration for low-memory environments
    pub fn low_memory() -> Self {
        Self {
            command_buffer_size: 8,
        }
    }

    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            command_buffer_size: 100,
        }
    }
}

// ----------------------------------------------------------------------------
// Engine Configuration
// ----------------------------------------------------------------------------

/// Lifecycle engine behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Display name used when a session starts without an explicit one
    pub local_name: String,
    /// Invitation timeout handed to backends that accept one
    pub invite_timeout_secs: u64,
    /// How long `stop()` waits for a backend teardown before abandoning it
    pub stop_grace_ms: u64,
    /// Number of state transitions retained for snapshots
    pub history_limit: usize,
    /// Maximum commands held while a transition is in flight
    pub max_queued_commands: usize,
    /// Send the current permission state to each newly attached consumer
    pub report_permissions_on_attach: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_name: "peerlink".to_string(),
            invite_timeout_secs: 30,
            stop_grace_ms: 2_000,
            history_limit: 64,
            max_queued_commands: 256,
            report_permissions_on_attach: true,
        }
    }
}

impl EngineConfig {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Short timeouts for interactive use
    pub fn low_latency() -> Self {
        Self {
            invite_timeout_secs: 10,
            stop_grace_ms: 500,
            ..Self::default()
        }
    }

    pub fn testing() -> Self {
        Self {
            local_name: "test-node".to_string(),
            invite_timeout_secs: 5,
            stop_grace_ms: 200,
            history_limit: 256,
            max_queued_commands: 256,
            report_permissions_on_attach: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Codec Configuration
// ----------------------------------------------------------------------------

/// Payload codec limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Largest message a peer may declare in a frame header
    pub max_message_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
        }
    }
}

impl CodecConfig {
    pub fn low_memory() -> Self {
        Self {
            max_message_size: 64 * 1024,
        }
    }
}

// ----------------------------------------------------------------------------
// Top-level Configuration
// ----------------------------------------------------------------------------

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerlinkConfig {
    pub channels: ChannelConfig,
    pub engine: EngineConfig,
    pub codec: CodecConfig,
}

impl PeerlinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn testing() -> Self {
        Self {
            channels: ChannelConfig::testing(),
            engine: EngineConfig::testing(),
            codec: CodecConfig::default(),
        }
    }

    pub fn low_latency() -> Self {
        Self {
            engine: EngineConfig::low_latency(),
            ..Self::default()
        }
    }

    pub fn low_memory() -> Self {
        Self {
            channels: ChannelConfig::low_memory(),
            engine: EngineConfig::default(),
            codec: CodecConfig::low_memory(),
        }
    }

    pub fn with_channels(mut self, channels: ChannelConfig) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.channels.command_buffer_size == 0 {
            return Err(PeerlinkError::config_error(
                "command_buffer_size must be greater than zero",
            ));
        }
        if self.engine.local_name.trim().is_empty() {
            return Err(PeerlinkError::config_error("local_name must not be empty"));
        }
        if self.engine.stop_grace_ms == 0 {
            return Err(PeerlinkError::config_error(
                "stop_grace_ms must be greater than zero",
            ));
        }
        if self.engine.max_queued_commands == 0 {
            return Err(PeerlinkError::config_error(
                "max_queued_commands must be greater than zero",
            ));
        }
        if self.codec.max_message_size == 0 || self.codec.max_message_size > u32::MAX as usize {
            return Err(PeerlinkError::config_error(
                "max_message_size must be between 1 and u32::MAX",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(PeerlinkConfig::default().validate().is_ok());
        assert!(PeerlinkConfig::testing().validate().is_ok());
        assert!(PeerlinkConfig::low_latency().validate().is_ok());
        assert!(PeerlinkConfig::low_memory().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = PeerlinkConfig::default();
        config.channels.command_buffer_size = 0;
        assert!(config.validate().is_err());

        let config = PeerlinkConfig::default().with_codec(CodecConfig {
            max_message_size: 0,
        });
        assert!(config.validate().is_err());

        let mut config = PeerlinkConfig::default();
        config.engine.local_name = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let engine = EngineConfig::default();
        assert_eq!(engine.invite_timeout(), Duration::from_secs(30));
        assert_eq!(engine.stop_grace(), Duration::from_secs(2));
    }
}
