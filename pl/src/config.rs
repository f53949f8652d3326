//! ProtoLock configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorConfig;
use crate::hub::{DEFAULT_RECONNECT_DELAYS_MS, HubOptions, RetryPolicy, TransportError, websocket_url};
use crate::identity::FileStore;

/// Environment variable overriding `hub.api-base`
pub const API_BASE_ENV: &str = "PROTOLOCK_API_BASE";

/// Main ProtoLock configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Hub connection settings
    pub hub: HubConfig,

    /// Coordinator task settings
    pub coordinator: CoordinatorConfig,

    /// Device identity storage
    pub identity: IdentityConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `./.protolock.yml`, then
    /// `~/.config/protolock/protolock.yml`, then defaults. The API base from
    /// `PROTOLOCK_API_BASE` wins over whatever was loaded.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_chain(config_path)?;
        config.apply_env();
        Ok(config)
    }

    fn load_file_chain(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::default_paths() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Project-local then per-user config locations
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".protolock.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("protolock").join("protolock.yml"));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed; the full [`load`](Self::load) reports them later.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => Self::default_paths(),
        };
        let path = candidates.into_iter().find(|p| p.exists())?;
        let content = fs::read_to_string(path).ok()?;
        serde_yaml::from_str::<Self>(&content).ok()?.log_level
    }

    fn apply_env(&mut self) {
        if let Ok(api_base) = std::env::var(API_BASE_ENV) {
            let api_base = api_base.trim();
            if !api_base.is_empty() {
                tracing::debug!(%api_base, "Config::apply_env: api base from environment");
                self.hub.api_base = api_base.to_string();
            }
        }
    }

    /// Serialize the effective configuration
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }
}

/// Hub connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HubConfig {
    /// HTTP(S) base of the API hosting the hub
    pub api_base: String,

    /// Hub path below the API base
    pub hub_path: String,

    /// Wait before each reconnect attempt; the last value repeats
    pub reconnect_delays_ms: Vec<u64>,

    /// Give up after this many reconnect attempts (unset = never)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,

    /// Keep-alive ping interval
    pub keep_alive_ms: u64,

    /// Server silence that counts as a dropped connection
    pub server_timeout_ms: u64,

    /// Limit for connecting plus handshake
    pub handshake_timeout_ms: u64,

    /// Limit for an invocation's completion
    pub invoke_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:5000".to_string(),
            hub_path: "/hubs/protocol".to_string(),
            reconnect_delays_ms: DEFAULT_RECONNECT_DELAYS_MS.to_vec(),
            max_reconnect_attempts: None,
            keep_alive_ms: 15_000,
            server_timeout_ms: 30_000,
            handshake_timeout_ms: 15_000,
            invoke_timeout_ms: 30_000,
        }
    }
}

impl HubConfig {
    /// WebSocket URL of the hub
    pub fn url(&self) -> Result<String, TransportError> {
        websocket_url(&self.api_base, &self.hub_path)
    }

    pub fn options(&self) -> HubOptions {
        HubOptions {
            retry: RetryPolicy::from_millis(&self.reconnect_delays_ms, self.max_reconnect_attempts),
            keep_alive: Duration::from_millis(self.keep_alive_ms),
            server_timeout: Duration::from_millis(self.server_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            invoke_timeout: Duration::from_millis(self.invoke_timeout_ms),
        }
    }
}

/// Device identity configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IdentityConfig {
    /// Identity store file (defaults under the user's data dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

impl IdentityConfig {
    pub fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(FileStore::default_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.hub.api_base, "http://localhost:5000");
        assert_eq!(config.hub.hub_path, "/hubs/protocol");
        assert_eq!(config.hub.reconnect_delays_ms, vec![0, 2_000, 5_000, 10_000, 30_000]);
        assert_eq!(config.hub.max_reconnect_attempts, None);
        assert!(config.log_level.is_none());
        assert!(config.identity.store_path.is_none());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
hub:
  api-base: https://pumps.example.com
  reconnect-delays-ms: [100, 200]
  max-reconnect-attempts: 4
  invoke-timeout-ms: 1000
coordinator:
  channel-buffer: 16
identity:
  store-path: /tmp/device.json
log-level: debug
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.hub.api_base, "https://pumps.example.com");
        assert_eq!(config.hub.max_reconnect_attempts, Some(4));
        assert_eq!(config.hub.keep_alive_ms, 15_000);
        assert_eq!(config.coordinator.channel_buffer, 16);
        assert_eq!(config.identity.store_path(), PathBuf::from("/tmp/device.json"));
        assert_eq!(config.log_level.as_deref(), Some("debug"));

        let options = config.hub.options();
        assert_eq!(options.retry, RetryPolicy::from_millis(&[100, 200], Some(4)));
        assert_eq!(options.invoke_timeout, Duration::from_secs(1));
        assert_eq!(config.hub.url().unwrap(), "wss://pumps.example.com/hubs/protocol");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("log-level: warn").unwrap();
        assert_eq!(config.hub, HubConfig::default());
        assert_eq!(config.coordinator, CoordinatorConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_explicit_path_and_env_override() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("protolock.yml");
        fs::write(&path, "hub:\n  api-base: http://from-file:5000\nlog-level: trace\n").unwrap();

        // SAFETY: serialized with the other env tests
        unsafe { std::env::remove_var(API_BASE_ENV) };
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.hub.api_base, "http://from-file:5000");

        unsafe { std::env::set_var(API_BASE_ENV, "http://from-env:7000") };
        let config = Config::load(Some(&path)).unwrap();
        unsafe { std::env::remove_var(API_BASE_ENV) };
        assert_eq!(config.hub.api_base, "http://from-env:7000");
        assert_eq!(config.hub.url().unwrap(), "ws://from-env:7000/hubs/protocol");

        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("trace"));
    }

    #[test]
    #[serial]
    fn test_blank_env_is_ignored() {
        unsafe { std::env::set_var(API_BASE_ENV, "  ") };
        let mut config = Config::default();
        config.apply_env();
        unsafe { std::env::remove_var(API_BASE_ENV) };
        assert_eq!(config.hub.api_base, "http://localhost:5000");
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.yml");
        assert!(Config::load(Some(&missing)).is_err());
        assert_eq!(Config::load_log_level(Some(&missing)), None);
    }

    #[test]
    fn test_to_yaml_round_trips() {
        let config = Config::default();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("api-base: http://localhost:5000"));
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
