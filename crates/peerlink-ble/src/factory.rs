//! BLE backend factory

use std::sync::Arc;
use tracing::debug;

use peerlink_core::{
    BackendCapabilities, BackendEventSink, BackendFactory, BackendKind, SessionParams,
    TransportBackend, TransportError,
};

use crate::backend::{ble_capabilities, BleBackend};
use crate::config::BleBackendConfig;
use crate::driver::BleDriverProvider;

/// Builds a [`BleBackend`] per session from a driver provider
#[derive(Clone)]
pub struct BleBackendFactory {
    config: BleBackendConfig,
    provider: Arc<dyn BleDriverProvider>,
}

impl BleBackendFactory {
    pub fn new(config: BleBackendConfig, provider: impl BleDriverProvider + 'static) -> Self {
        Self {
            config,
            provider: Arc::new(provider),
        }
    }

    pub fn with_provider_arc(config: BleBackendConfig, provider: Arc<dyn BleDriverProvider>) -> Self {
        Self { config, provider }
    }

    /// Factory over the platform Bluetooth stack
    #[cfg(feature = "native")]
    pub fn native(config: BleBackendConfig) -> Self {
        Self::new(config, crate::native::NativeDriverProvider::new())
    }

    pub fn config(&self) -> &BleBackendConfig {
        &self.config
    }
}

impl BackendFactory for BleBackendFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Ble
    }

    fn capabilities(&self) -> BackendCapabilities {
        ble_capabilities(&self.config, self.provider.supports_peripheral())
    }

    fn is_available(&self) -> bool {
        self.provider.is_available()
    }

    fn create(
        &self,
        sink: BackendEventSink,
        params: &SessionParams,
    ) -> Result<Box<dyn TransportBackend>, TransportError> {
        let drivers = self.provider.open()?;
        debug!(local_name = %params.local_name, ?drivers, "Opened BLE drivers");
        Ok(Box::new(BleBackend::spawn(self.config.clone(), drivers, sink)))
    }
}
