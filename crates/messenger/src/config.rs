//! Configuration management for the HashHello messenger.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/hashhello/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("reconnect_interval_secs must be between 1 and 3600, got {0}")]
    InvalidReconnectInterval(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("stun server must start with stun: or turn:, got {0}")]
    InvalidStunServer(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the messenger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Where encrypted data is kept.
    pub storage: StorageConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Peer connectivity configuration.
    pub network: NetworkConfig,
}

/// Storage location configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the encrypted store.
    pub data_dir: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Network configuration.
///
/// Read by [`crate::Messenger`] and by transports. The one-shot CLI
/// commands work on storage alone and never start either.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// STUN/TURN servers for a transport that has to traverse NAT.
    ///
    /// Reserved for such a transport: [`crate::MemoryTransport`] routes by
    /// numeric id and ignores this list. Entries are still validated so a
    /// bad file is caught early.
    pub stun_servers: Vec<String>,

    /// Seconds between reconnect sweeps of a running [`crate::Messenger`].
    pub reconnect_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:global.stun.twilio.com:3478".to_string(),
            ],
            reconnect_interval_secs: 5,
        }
    }
}

impl NetworkConfig {
    /// Returns the reconnect interval as a `Duration`.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hashhello")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hashhello")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - HASHHELLO_DATA_DIR: Override the data directory
    /// - HASHHELLO_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("HASHHELLO_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.storage.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(level) = std::env::var("HASHHELLO_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.network.reconnect_interval_secs;
        if !(1..=3600).contains(&interval) {
            return Err(ConfigError::InvalidReconnectInterval(interval));
        }

        for server in &self.network.stun_servers {
            if !server.starts_with("stun:") && !server.starts_with("turn:") {
                return Err(ConfigError::InvalidStunServer(server.clone()));
            }
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// Path of the SQLite database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage.data_dir.join("hashhello.db")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.logging.log_level, "info");
        assert_eq!(config.network.reconnect_interval_secs, 5);
        assert_eq!(config.network.stun_servers.len(), 2);
        assert!(config.storage.data_dir.to_string_lossy().contains("hashhello"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[logging]
log_level = "debug"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.logging.log_level, "debug");
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[storage]
data_dir = "/custom/data"

[logging]
log_level = "trace"

[network]
stun_servers = ["stun:custom.stun:3478"]
reconnect_interval_secs = 30
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.storage.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.logging.log_level, "trace");
        assert_eq!(config.network.stun_servers, vec!["stun:custom.stun:3478"]);
        assert_eq!(config.network.reconnect_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[logging\nlog_level = \"debug\"");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[network]
reconnect_interval_secs = "soon"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.logging.log_level = "warn".to_string();
        original.network.reconnect_interval_secs = 60;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[storage]"));
        assert!(toml.contains("[network]"));
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.storage.data_dir = temp_dir.path().join("data");

        original.save(&config_path).unwrap();
        assert_eq!(Config::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_database_path() {
        let mut config = Config::default();
        config.storage.data_dir = PathBuf::from("/data");
        assert_eq!(config.database_path(), PathBuf::from("/data/hashhello.db"));
    }

    #[test]
    #[serial]
    fn test_env_override_data_dir() {
        std::env::remove_var("HASHHELLO_LOG_LEVEL");
        std::env::set_var("HASHHELLO_DATA_DIR", "/tmp/hashhello-test");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/hashhello-test"));

        std::env::remove_var("HASHHELLO_DATA_DIR");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("HASHHELLO_DATA_DIR");
        std::env::set_var("HASHHELLO_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.log_level, "debug");

        std::env::remove_var("HASHHELLO_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("HASHHELLO_DATA_DIR", "");
        std::env::set_var("HASHHELLO_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("HASHHELLO_DATA_DIR");
        std::env::remove_var("HASHHELLO_LOG_LEVEL");
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_reconnect_interval_bounds() {
        let mut config = Config::default();

        config.network.reconnect_interval_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidReconnectInterval(0))
        );

        config.network.reconnect_interval_secs = 3601;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidReconnectInterval(3601))
        );

        config.network.reconnect_interval_secs = 1;
        assert!(config.validate().is_ok());
        config.network.reconnect_interval_secs = 3600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_stun_server() {
        let mut config = Config::default();
        config.network.stun_servers = vec!["http://example.com".to_string()];
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidStunServer("http://example.com".to_string()))
        );

        config.network.stun_servers.clear();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level_case_insensitive() {
        let mut config = Config::default();
        config.logging.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level_invalid() {
        let mut config = Config::default();
        config.logging.log_level = "warning".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("warning".to_string()))
        );
    }
}
