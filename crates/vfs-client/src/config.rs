//! Client configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default per-call timeout for control calls on the broker and daemons.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 60_000;

/// Default bound on socket connect plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Environment variable overriding `call_timeout_ms`.
pub const CALL_TIMEOUT_ENV: &str = "VFS_CALL_TIMEOUT_MS";

/// Connection layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Address of the broker bus (`unix:path=...` or an absolute path)
    pub broker_address: String,
    pub call_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_address: vfs_protocol::broker_address(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    /// Defaults with environment overrides applied.
    ///
    /// The broker address already honours `VFS_BROKER_ADDRESS` through
    /// [`vfs_protocol::broker_address`].
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = std::env::var(CALL_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            config.call_timeout_ms = ms;
        }
        config
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse client configuration")
    }

    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn with_broker_address(mut self, address: impl Into<String>) -> Self {
        self.broker_address = address.into();
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
