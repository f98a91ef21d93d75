//! SkyRelay Configuration
//!
//! Configuration structures with serde defaults, plus the loader and
//! validator used by the binary.

use crate::error::SkyRelayError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// Constants
// ============================================================================

/// Default relay bind host
pub const DEFAULT_RELAY_HOST: &str = "127.0.0.1";
/// Default relay port
pub const DEFAULT_RELAY_PORT: u16 = 3000;
/// Default order/drone store endpoint
pub const DEFAULT_STORE_ENDPOINT: &str = "http://localhost/api.php";
/// Default per-request timeout for store calls (seconds)
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;
/// Lowest port the relay accepts
pub const MIN_PORT: u16 = 1024;
/// Highest port the relay accepts
pub const MAX_PORT: u16 = 49151;

/// Ports below 1024 are privileged and above 49151 are ephemeral.
pub fn is_valid_port(port: u16) -> bool {
    (MIN_PORT..=MAX_PORT).contains(&port)
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

// ============================================================================
// Main Config
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Real-time relay configuration
    #[serde(default)]
    pub relay: RelayConfig,
    /// Remote order/drone store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

// ============================================================================
// Relay Config
// ============================================================================

/// WebSocket relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bind host
    #[serde(default = "RelayConfig::default_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "RelayConfig::default_port")]
    pub port: u16,
}

impl RelayConfig {
    fn default_host() -> String {
        DEFAULT_RELAY_HOST.to_string()
    }
    fn default_port() -> u16 {
        DEFAULT_RELAY_PORT
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RELAY_HOST.to_string(),
            port: DEFAULT_RELAY_PORT,
        }
    }
}

// ============================================================================
// Store Config
// ============================================================================

/// Remote order/drone store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Endpoint receiving `{type: ...}` JSON requests
    #[serde(default = "StoreConfig::default_endpoint")]
    pub endpoint: String,
    /// Per-request timeout in seconds
    #[serde(default = "StoreConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl StoreConfig {
    fn default_endpoint() -> String {
        DEFAULT_STORE_ENDPOINT.to_string()
    }
    fn default_request_timeout_secs() -> u64 {
        DEFAULT_STORE_TIMEOUT_SECS
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_STORE_ENDPOINT.to_string(),
            request_timeout_secs: DEFAULT_STORE_TIMEOUT_SECS,
        }
    }
}

// ============================================================================
// Config Loading and Validation
// ============================================================================

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&str>) -> Result<Config, SkyRelayError> {
        let config_path = Self::resolve_config_path(path)?;
        Self::load_from(&config_path)
    }

    /// Like [`ConfigLoader::load`], but falls back to built-in defaults when no
    /// file was given and none exists in the default locations.
    pub fn load_or_default(path: Option<&str>) -> Result<Config, SkyRelayError> {
        match Self::load(path) {
            Err(e) if path.is_none() && e.is_config_not_found() => {
                tracing::warn!("No config file found, using built-in defaults");
                Ok(Config::default())
            }
            other => other,
        }
    }

    pub fn load_from(config_path: &Path) -> Result<Config, SkyRelayError> {
        let content = std::fs::read_to_string(config_path)
            .map_err(|e| SkyRelayError::config_parse_error(format!("Failed to read: {}", e)))?;
        let config: Config = serde_yml::from_str(&content)
            .map_err(|e| SkyRelayError::config_parse_error(format!("Failed to parse: {}", e)))?;
        Ok(config)
    }

    /// Resolve configuration file path
    fn resolve_config_path(path: Option<&str>) -> Result<PathBuf, SkyRelayError> {
        if let Some(p) = path {
            return Ok(PathBuf::from(p));
        }

        let default_paths = [
            home_dir().join(".skyrelay/config.yaml"),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("skyrelay.yaml"),
            PathBuf::from("./skyrelay.yaml"),
        ];

        default_paths
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| {
                SkyRelayError::config_not_found(
                    "Config not found. Run `skyrelay config-sample` or create ~/.skyrelay/config.yaml",
                )
            })
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<(), SkyRelayError> {
        if !is_valid_port(config.relay.port) {
            return Err(SkyRelayError::config_invalid(
                "relay.port",
                format!(
                    "Port {} must be between {} and {}",
                    config.relay.port, MIN_PORT, MAX_PORT
                ),
            ));
        }

        if config.store.endpoint.trim().is_empty() {
            return Err(SkyRelayError::config_invalid(
                "store.endpoint",
                "Store endpoint cannot be empty",
            ));
        }

        if config.store.request_timeout_secs == 0 {
            return Err(SkyRelayError::config_invalid(
                "store.request_timeout_secs",
                "Timeout must be at least one second",
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), SkyRelayError> {
        let content = serde_yml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        Config::default()
    }
}
