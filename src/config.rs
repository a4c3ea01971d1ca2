//! Configuration loading and management.
//!
//! Configuration is loaded with the following precedence:
//! 1. Environment variables (`SESSYNC_*`)
//! 2. Config file (`~/.sessync/config.toml`)
//! 3. Defaults

use crate::error::{Error, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration struct.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,

    /// Backend connection configuration.
    pub connection: ConnectionConfig,

    /// Per-session message retention.
    pub pruning: PruningConfig,

    /// Session defaults.
    pub session: SessionConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the sessync home directory.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_sessync_home(),
        }
    }
}

/// Backend connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Websocket URL of the backend.
    pub url: String,

    /// Optional API key sent in the `connect` handshake frame.
    pub api_key: Option<String>,

    /// Interval at which the server pushes heartbeats.
    pub heartbeat_interval_seconds: u64,

    /// First reconnect delay; doubles per failed attempt.
    pub reconnect_base_delay_ms: u64,

    /// Upper bound for the reconnect delay.
    pub reconnect_max_delay_ms: u64,

    /// How long a transport open may take before it counts as failed.
    pub connect_timeout_seconds: u64,

    /// Quiet period before coalesced updates are published.
    pub debounce_ms: u64,
}

impl ConnectionConfig {
    /// Heartbeat interval as a duration.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Debounce window as a duration.
    #[must_use]
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Connect timeout as a duration.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080".to_string(),
            api_key: None,
            heartbeat_interval_seconds: 45,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            connect_timeout_seconds: 10,
            debounce_ms: 100,
        }
    }
}

/// Pruning configuration.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PruningConfig {
    /// Soft cap on stored messages per session.
    pub max_messages_per_session: usize,

    /// Extra messages tolerated above the soft cap before pruning runs.
    pub prune_threshold: usize,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            max_messages_per_session: 50,
            prune_threshold: 10,
        }
    }
}

/// Session defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Working directory announced for new sessions.
    pub default_working_directory: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_working_directory: dirs::home_dir()
                .map_or_else(|| "~".to_string(), |h| h.display().to_string()),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `SESSYNC_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Get the default sessync home directory.
fn default_sessync_home() -> PathBuf {
    dirs::home_dir().map_or_else(|| PathBuf::from(".sessync"), |h| h.join(".sessync"))
}

/// Get the sessync home directory.
///
/// Uses `SESSYNC_HOME` environment variable if set, otherwise `~/.sessync`.
#[must_use]
pub fn get_sessync_home() -> PathBuf {
    env::var("SESSYNC_HOME").map_or_else(|_| default_sessync_home(), PathBuf::from)
}

/// Load configuration with precedence: env vars → file → defaults.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
pub fn load_config() -> Result<Config> {
    let mut config = Config::default();

    let config_path = get_config_path();
    if config_path.exists() {
        let contents = fs::read_to_string(&config_path).map_err(Error::Storage)?;
        config = parse_config(&contents)?;
    }

    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

/// Parse a TOML config document.
///
/// # Errors
///
/// Returns an error if the document is not valid TOML for [`Config`].
pub fn parse_config(contents: &str) -> Result<Config> {
    let config = toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

/// Longest accepted heartbeat interval, one day.
const MAX_HEARTBEAT_SECONDS: u64 = 86_400;

/// Reject values the connection timers cannot work with.
fn validate(config: &Config) -> Result<()> {
    let heartbeat = config.connection.heartbeat_interval_seconds;
    if !(1..=MAX_HEARTBEAT_SECONDS).contains(&heartbeat) {
        return Err(Error::Config(format!(
            "connection.heartbeat_interval_seconds must be between 1 and {MAX_HEARTBEAT_SECONDS}, got {heartbeat}"
        )));
    }
    Ok(())
}

/// Get the path to the config file.
fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("SESSYNC_CONFIG") {
        return PathBuf::from(path);
    }

    get_sessync_home().join("config.toml")
}

/// Apply environment variable overrides to config.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(path) = env::var("SESSYNC_STORAGE_PATH") {
        config.storage.path = PathBuf::from(path);
    } else if let Ok(home) = env::var("SESSYNC_HOME") {
        config.storage.path = PathBuf::from(home);
    }

    if let Ok(url) = env::var("SESSYNC_URL") {
        config.connection.url = url;
    }

    if let Ok(key) = env::var("SESSYNC_API_KEY") {
        config.connection.api_key = Some(key).filter(|k| !k.is_empty());
    }

    if let Ok(val) = env::var("SESSYNC_HEARTBEAT_SECONDS") {
        if let Ok(secs) = val.parse() {
            config.connection.heartbeat_interval_seconds = secs;
        }
    }

    if let Ok(val) = env::var("SESSYNC_MAX_MESSAGES") {
        if let Ok(max) = val.parse() {
            config.pruning.max_messages_per_session = max;
        }
    }

    if let Ok(val) = env::var("SESSYNC_PRUNE_THRESHOLD") {
        if let Ok(threshold) = val.parse() {
            config.pruning.prune_threshold = threshold;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.connection.heartbeat_interval_seconds, 45);
        assert_eq!(config.connection.debounce_ms, 100);
        assert_eq!(config.pruning.max_messages_per_session, 50);
        assert_eq!(config.pruning.prune_threshold, 10);
        assert_eq!(config.logging.level, "info");
        assert!(config.connection.api_key.is_none());
    }

    #[test]
    fn duration_helpers() {
        let config = ConnectionConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(45));
        assert_eq!(config.debounce_window(), Duration::from_millis(100));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn parse_config_toml() {
        let toml = r#"
            [connection]
            url = "ws://backend.local:9000"
            heartbeat_interval_seconds = 30
            api_key = "secret"

            [pruning]
            max_messages_per_session = 200
            prune_threshold = 25

            [logging]
            level = "debug"
        "#;

        let config = parse_config(toml).unwrap();
        assert_eq!(config.connection.url, "ws://backend.local:9000");
        assert_eq!(config.connection.heartbeat_interval_seconds, 30);
        assert_eq!(config.connection.api_key.as_deref(), Some("secret"));
        assert_eq!(config.pruning.max_messages_per_session, 200);
        assert_eq!(config.pruning.prune_threshold, 25);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml = r"
            [pruning]
            max_messages_per_session = 10
        ";

        let config = parse_config(toml).unwrap();
        assert_eq!(config.pruning.max_messages_per_session, 10);
        assert_eq!(config.pruning.prune_threshold, 10); // Default
        assert_eq!(config.connection.reconnect_max_delay_ms, 30_000); // Default
    }

    #[test]
    fn heartbeat_interval_out_of_range_is_rejected() {
        for value in ["0", "86401", "18446744073709551615"] {
            let toml = format!("[connection]\nheartbeat_interval_seconds = {value}\n");
            assert!(
                matches!(parse_config(&toml), Err(Error::Config(_))),
                "accepted heartbeat_interval_seconds = {value}"
            );
        }
        assert!(parse_config("[connection]\nheartbeat_interval_seconds = 86400\n").is_ok());
    }

    #[test]
    fn invalid_config_is_config_error() {
        let result = parse_config("[pruning]\nmax_messages_per_session = \"lots\"");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
