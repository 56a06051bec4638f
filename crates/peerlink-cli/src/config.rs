//! CLI configuration
//!
//! One TOML file carries the engine configuration together with the settings
//! of every backend. Missing sections fall back to their defaults:
//!
//! ```toml
//! service = "peerlink"
//!
//! [peerlink.engine]
//! local_name = "Alice"
//!
//! [ble]
//! mtu = 185
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use peerlink_ble::BleBackendConfig;
use peerlink_bridge::{MeshBackendConfig, NearbyBackendConfig};
use peerlink_core::{PeerlinkConfig, ServiceId};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Service id advertised and browsed for
    pub service: String,

    /// Engine configuration
    pub peerlink: PeerlinkConfig,

    pub ble: BleBackendConfig,
    pub mesh: MeshBackendConfig,
    pub nearby: NearbyBackendConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            service: "peerlink".to_string(),
            peerlink: PeerlinkConfig::default(),
            ble: BleBackendConfig::default(),
            mesh: MeshBackendConfig::default(),
            nearby: NearbyBackendConfig::default(),
        }
    }
}

impl CliConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CliConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.peerlink.validate()?;
        self.service_id()?;
        if self.ble.mtu == 0 {
            return Err(CliError::Config("ble.mtu must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn service_id(&self) -> Result<ServiceId> {
        Ok(ServiceId::new(self.service.as_str())?)
    }

    /// Engine configuration with the local name overridden when given
    pub fn engine_config(&self, local_name: Option<&str>) -> PeerlinkConfig {
        let mut config = self.peerlink.clone();
        if let Some(name) = local_name {
            config.engine.local_name = name.to_string();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = CliConfig::from_toml_str(
            r#"
            service = "chat"

            [ble]
            mtu = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.service, "chat");
        assert_eq!(config.ble.mtu, 64);
        assert_eq!(config.peerlink, PeerlinkConfig::default());
        assert_eq!(config.mesh, MeshBackendConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_mtu = CliConfig::from_toml_str("[ble]\nmtu = 0\n");
        assert!(matches!(zero_mtu, Err(CliError::Config(_))));

        let bad_toml = CliConfig::from_toml_str("service = [");
        assert!(matches!(bad_toml, Err(CliError::TomlParsing(_))));
    }

    #[test]
    fn test_local_name_override() {
        let config = CliConfig::default();
        assert_eq!(config.engine_config(Some("Bob")).engine.local_name, "Bob");
        assert_eq!(
            config.engine_config(None).engine.local_name,
            config.peerlink.engine.local_name
        );
    }
}
