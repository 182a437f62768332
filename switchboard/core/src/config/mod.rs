//! TOML Configuration File Support
//!
//! Centralized configuration loading for the switchboard client, with a TOML
//! file at `~/.config/switchboard/client.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! base_url = "http://localhost:8080"
//! ws_url = "ws://localhost:8080/chat/websocket"
//! send_destination = "/app/chat"
//!
//! [connection]
//! connect_timeout_ms = 5000
//! retry_base_delay_ms = 3000
//! max_retry_attempts = 5
//! event_capacity = 256
//!
//! [responder]
//! username = "agent1"
//! password = "secret"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::SessionConfig;
use crate::connection::{RetryPolicy, DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY};
use crate::messages::DEFAULT_SEND_DESTINATION;
use crate::services::http::DEFAULT_BASE_URL;

/// Default WebSocket endpoint (raw WebSocket under the SockJS mount)
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/chat/websocket";

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// REST base URL
    pub base_url: Option<String>,
    /// WebSocket URL
    pub ws_url: Option<String>,
    /// Destination outbound messages are sent to
    pub send_destination: Option<String>,
}

/// `[connection]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionToml {
    /// Open timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Backoff unit in milliseconds
    pub retry_base_delay_ms: Option<u64>,
    /// Consecutive failures before giving up
    pub max_retry_attempts: Option<u32>,
    /// Transport event queue depth
    pub event_capacity: Option<usize>,
}

/// `[responder]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderToml {
    /// Login name, also the responder's ID
    pub username: Option<String>,
    /// Login password
    pub password: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// Server section
    pub server: ServerToml,
    /// Connection section
    pub connection: ConnectionToml,
    /// Responder section
    pub responder: ResponderToml,
}

/// Resolved client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// REST base URL
    pub base_url: String,
    /// WebSocket URL
    pub ws_url: String,
    /// Destination outbound messages are sent to
    pub send_destination: String,
    /// Open timeout
    pub connect_timeout: Duration,
    /// Backoff unit
    pub retry_base_delay: Duration,
    /// Consecutive failures before giving up
    pub max_retry_attempts: u32,
    /// Transport event queue depth
    pub event_capacity: usize,
    /// Responder login name
    pub username: Option<String>,
    /// Responder password
    pub password: Option<String>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            send_destination: DEFAULT_SEND_DESTINATION.to_string(),
            connect_timeout: Duration::from_secs(5),
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            event_capacity: 256,
            username: None,
            password: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ClientConfig {
    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Responder credentials, if both halves are set
    #[must_use]
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    /// Retry policy
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.retry_base_delay,
            max_attempts: self.max_retry_attempts,
        }
    }

    /// Session runtime settings
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            policy: self.retry_policy(),
            connect_timeout: self.connect_timeout,
            send_destination: self.send_destination.clone(),
            event_capacity: self.event_capacity,
            ..SessionConfig::default()
        }
    }

    /// WebSocket transport settings
    #[cfg(feature = "websocket")]
    #[must_use]
    pub fn websocket_settings(&self) -> crate::transport::WebSocketSettings {
        crate::transport::WebSocketSettings {
            url: self.ws_url.clone(),
            credentials: self.credentials(),
            connect_timeout: self.connect_timeout,
        }
    }

    /// Check values that would make a session unusable
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError("base_url is empty".to_string()));
        }
        if self.ws_url.trim().is_empty() {
            return Err(ConfigError::ValidationError("ws_url is empty".to_string()));
        }
        if self.send_destination.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "send_destination is empty".to_string(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry_base_delay.is_zero() {
            return Err(ConfigError::ValidationError(
                "retry_base_delay_ms must be positive".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchboard/client.toml` or
/// `~/.config/switchboard/client.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("client.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    let mut config = load_file(path)?;
    apply_env_config(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn load_file(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ClientToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
            config.config_file_path = Some(config_path);
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    Ok(config)
}

fn apply_toml_config(config: &mut ClientConfig, toml: &ClientToml) {
    if let Some(ref url) = toml.server.base_url {
        config.base_url = url.clone();
    }
    if let Some(ref url) = toml.server.ws_url {
        config.ws_url = url.clone();
    }
    if let Some(ref destination) = toml.server.send_destination {
        config.send_destination = destination.clone();
    }

    if let Some(ms) = toml.connection.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.connection.retry_base_delay_ms {
        config.retry_base_delay = Duration::from_millis(ms);
    }
    if let Some(attempts) = toml.connection.max_retry_attempts {
        config.max_retry_attempts = attempts;
    }
    if let Some(capacity) = toml.connection.event_capacity {
        config.event_capacity = capacity;
    }

    if toml.responder.username.is_some() {
        config.username = toml.responder.username.clone();
    }
    if toml.responder.password.is_some() {
        config.password = toml.responder.password.clone();
    }
}

/// Apply environment overrides read through `lookup`
fn apply_env_config<F>(config: &mut ClientConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("SWITCHBOARD_BASE_URL") {
        config.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(url) = lookup("SWITCHBOARD_WS_URL") {
        config.ws_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = lookup("SWITCHBOARD_CONNECT_TIMEOUT") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.connect_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(delay) = lookup("SWITCHBOARD_RETRY_BASE_DELAY") {
        if let Ok(ms) = delay.parse::<u64>() {
            config.retry_base_delay = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(attempts) = lookup("SWITCHBOARD_MAX_RETRIES") {
        if let Ok(n) = attempts.parse::<u32>() {
            config.max_retry_attempts = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(username) = lookup("SWITCHBOARD_USERNAME") {
        config.username = Some(username);
        config.source = ConfigSource::Env;
    }
    if let Some(password) = lookup("SWITCHBOARD_PASSWORD") {
        config.password = Some(password);
        config.source = ConfigSource::Env;
    }
}

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// REST base URL override
    pub base_url: Option<String>,
    /// WebSocket URL override
    pub ws_url: Option<String>,
    /// Responder username override
    pub username: Option<String>,
    /// Responder password override
    pub password: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set WebSocket URL override
    #[must_use]
    pub fn with_ws_url(mut self, url: String) -> Self {
        self.ws_url = Some(url);
        self
    }

    /// Set responder credentials override
    #[must_use]
    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ClientConfig) {
        if self.base_url.is_some()
            || self.ws_url.is_some()
            || self.username.is_some()
            || self.password.is_some()
        {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref url) = self.base_url {
            config.base_url = url.clone();
        }
        if let Some(ref url) = self.ws_url {
            config.ws_url = url.clone();
        }
        if let Some(ref username) = self.username {
            config.username = Some(username.clone());
        }
        if let Some(ref password) = self.password {
            config.password = Some(password.clone());
        }
    }
}
