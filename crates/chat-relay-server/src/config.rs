//! Server configuration.
//!
//! Loaded from environment variables with the `CHAT_RELAY` prefix, nested
//! values separated by `__`; a `.env` file is read first when present.
//!
//! - `CHAT_RELAY__SERVER__PORT=3000` -> `server.port = 3000`
//! - `CHAT_RELAY__CLIENT__MODE=bridge` -> `client.mode = bridge`

use std::{net::SocketAddr, time::Duration};

use chat_relay_core::StreamConfig;
use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),
}

/// Semantic configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required configuration missing: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    #[error("Invalid port number")]
    InvalidPort,

    #[error("Heartbeat interval must be positive")]
    InvalidHeartbeat,

    #[error("Invalid request timeout")]
    InvalidTimeout,

    #[error("SQLite storage requires the `sqlite` feature")]
    SqliteUnavailable,
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl AppConfig {
    /// Load `.env` (if present) and then the environment.
    ///
    /// # Errors
    /// Returns `ConfigError` if values cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_source(config::Environment::with_prefix("CHAT_RELAY").separator("__"))
    }

    /// Build from a single `config` source.
    ///
    /// # Errors
    /// Returns `ConfigError` if values cannot be parsed.
    pub fn from_source<S>(source: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// # Errors
    /// Returns the first invalid value found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.server.validate()?;
        self.stream.validate()?;
        self.client.validate()?;
        self.storage.validate()
    }
}

/// `server` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Tracing filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ServerConfig {
    /// # Errors
    /// Returns `InvalidAddress` if host and port do not form a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ValidationError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ValidationError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        self.socket_addr().map(|_| ())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info,chat_relay=debug".to_string()
}

/// `stream` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
}

impl StreamSettings {
    #[must_use]
    pub const fn stream_config(&self) -> StreamConfig {
        StreamConfig::with_heartbeat_interval(Duration::from_secs(self.heartbeat_interval_secs))
    }

    const fn validate(&self) -> Result<(), ValidationError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ValidationError::InvalidHeartbeat);
        }
        Ok(())
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat(),
        }
    }
}

const fn default_heartbeat() -> u64 {
    30
}

/// Which automation client backs the sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    /// In-process simulated platform.
    #[default]
    Loopback,
    /// External sidecar process.
    Bridge,
}

/// `client` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    #[serde(default)]
    pub mode: ClientMode,

    /// Sidecar command line, required in bridge mode.
    pub bridge_command: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Loopback only: log in automatically after this many seconds.
    pub loopback_auto_login_secs: Option<u64>,

    /// Loopback only: answer every outbound message with an inbound copy.
    #[serde(default)]
    pub loopback_echo: bool,
}

impl ClientSettings {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.request_timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }
        let has_command = self
            .bridge_command
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        if self.mode == ClientMode::Bridge && !has_command {
            return Err(ValidationError::MissingRequired("client.bridge_command"));
        }
        Ok(())
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            mode: ClientMode::default(),
            bridge_command: None,
            request_timeout_secs: default_request_timeout(),
            loopback_auto_login_secs: None,
            loopback_echo: false,
        }
    }
}

const fn default_request_timeout() -> u64 {
    30
}

/// Message store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

/// `storage` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_sqlite_url")]
    pub sqlite_url: String,
}

impl StorageSettings {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.backend != StorageBackend::Sqlite {
            return Ok(());
        }
        if !cfg!(feature = "sqlite") {
            return Err(ValidationError::SqliteUnavailable);
        }
        if self.sqlite_url.trim().is_empty() {
            return Err(ValidationError::MissingRequired("storage.sqlite_url"));
        }
        Ok(())
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sqlite_url: default_sqlite_url(),
        }
    }
}

fn default_sqlite_url() -> String {
    "sqlite://chat-relay.db".to_string()
}

#[cfg(test)]
mod tests {
    use config::{File, FileFormat};

    use super::*;

    fn from_toml(toml: &str) -> AppConfig {
        AppConfig::from_source(File::from_str(toml, FileFormat::Toml)).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = from_toml("");
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.log_level, "info,chat_relay=debug");
        assert_eq!(config.stream.heartbeat_interval_secs, 30);
        assert_eq!(config.client.mode, ClientMode::Loopback);
        assert_eq!(config.client.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sections() {
        let config = from_toml(
            r#"
            [server]
            host = "0.0.0.0"
            port = 8080

            [stream]
            heartbeat_interval_secs = 3

            [client]
            mode = "bridge"
            bridge_command = "node bridge.js"
            request_timeout_secs = 10
            "#,
        );
        assert_eq!(
            config.server.socket_addr().unwrap(),
            "0.0.0.0:8080".parse().unwrap()
        );
        assert_eq!(
            config.stream.stream_config().heartbeat_interval,
            Duration::from_secs(3)
        );
        assert_eq!(config.client.mode, ClientMode::Bridge);
        assert_eq!(config.client.bridge_command.as_deref(), Some("node bridge.js"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let config = from_toml("[server]\nport = 0");
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));

        let config = from_toml("[server]\nhost = \"not a host\"");
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidAddress(_))
        ));

        let config = from_toml("[stream]\nheartbeat_interval_secs = 0");
        assert_eq!(config.validate(), Err(ValidationError::InvalidHeartbeat));

        let config = from_toml("[client]\nrequest_timeout_secs = 0");
        assert_eq!(config.validate(), Err(ValidationError::InvalidTimeout));

        let config = from_toml("[client]\nmode = \"bridge\"");
        assert_eq!(
            config.validate(),
            Err(ValidationError::MissingRequired("client.bridge_command"))
        );
    }

    #[test]
    fn test_sqlite_backend_requires_feature() {
        let config = from_toml("[storage]\nbackend = \"sqlite\"");
        if cfg!(feature = "sqlite") {
            assert!(config.validate().is_ok());
        } else {
            assert_eq!(config.validate(), Err(ValidationError::SqliteUnavailable));
        }
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result = AppConfig::from_source(File::from_str(
            "[client]\nmode = \"carrier-pigeon\"",
            FileFormat::Toml,
        ));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
