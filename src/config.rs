//! Configuration loaded from TOML

use crate::coordinator::CoordinatorConfig;
use crate::effects::SideEffectConfig;
use crate::lock::AccountLock;
use crate::rpc::HttpConnector;
use crate::store::Store;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Node RPC settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Per-request timeout (milliseconds)
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// HTTP connector honoring the configured timeout
    pub fn connector(&self) -> HttpConnector {
        HttpConnector::new(self.timeout())
    }
}

/// Top-level configuration. Every section and key is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedtestConfig {
    pub coordinator: CoordinatorConfig,
    pub side_effects: SideEffectConfig,
    pub rpc: RpcConfig,
}

impl SpeedtestConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| Error::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&raw)?;
        info!("Config loaded from {}", path.display());
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            warn!("Config file not found at '{}', using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Account lock using the configured claim lifetime
    pub fn account_lock(&self, store: Arc<dyn Store>) -> AccountLock {
        AccountLock::from_config(store, &self.coordinator)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.coordinator.max_poll_attempts == 0 {
            return Err(Error::Config(
                "coordinator.max_poll_attempts must be at least 1".to_string(),
            ));
        }
        if self.coordinator.claim_ttl_ms == 0 {
            return Err(Error::Config(
                "coordinator.claim_ttl_ms must be positive".to_string(),
            ));
        }
        if self.side_effects.max_attempts == 0 {
            return Err(Error::Config(
                "side_effects.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
