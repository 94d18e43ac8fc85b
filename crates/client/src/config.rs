// Client configuration file: `~/.diql/client.toml`.
//
// Only connection settings live here. Credentials are supplied at runtime
// and never written to disk.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_URL: &str = "ws://localhost:8080/socket";
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 2_000;

/// Root directory for client state: `~/.diql/`.
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".diql"))
}

/// Path to the client config file: `~/.diql/client.toml`.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("client.toml"))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config could not be serialized: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

// ── Client config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
}

impl ClientConfig {
    /// Load from `~/.diql/client.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        config_path().and_then(|path| Self::load_from(&path).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

// ── Connection ─────────────────────────────────────────────────────

/// Settings of the single command socket of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket endpoint of the query service.
    pub url: String,
    /// Defer connecting until `Transport::open` is called.
    pub lazy: bool,
    /// Re-open the socket after an unexpected close.
    pub reconnect: bool,
    /// Fixed polling interval between reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Queue outbound frames while disconnected instead of dropping them.
    pub enqueue: bool,
    /// WebSocket sub-protocols offered during the handshake.
    pub protocols: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            lazy: false,
            reconnect: true,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            enqueue: true,
            protocols: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// `wss` is required; `ws` is allowed only for loopback hosts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl { url: self.url.clone(), reason };
        let parsed = Url::parse(&self.url).map_err(|error| invalid(error.to_string()))?;
        match parsed.scheme() {
            "wss" => Ok(()),
            "ws" if is_loopback_host(parsed.host_str()) => Ok(()),
            _ => Err(invalid("must use wss (ws is allowed only for localhost)".to_string())),
        }
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reconnect_every_two_seconds_and_enqueue() {
        let config = ConnectionConfig::default();
        assert!(config.reconnect);
        assert!(config.enqueue);
        assert!(!config.lazy);
        assert_eq!(config.reconnect_interval(), Duration::from_secs(2));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [connection]
            url = "wss://query.example.com/socket"
            protocols = ["diql.v1"]
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.connection.url, "wss://query.example.com/socket");
        assert_eq!(config.connection.protocols, vec!["diql.v1".to_string()]);
        assert_eq!(config.connection.reconnect_interval_ms, DEFAULT_RECONNECT_INTERVAL_MS);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("client.toml");
        let mut config = ClientConfig::default();
        config.connection.lazy = true;
        config.connection.reconnect_interval_ms = 500;

        config.save_to(&path).expect("save should succeed");
        let loaded = ClientConfig::load_from(&path).expect("load should succeed");
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "connection = 3").expect("write");

        assert!(matches!(ClientConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn validate_requires_tls_off_loopback() {
        let mut config = ConnectionConfig::default();
        assert!(config.validate().is_ok());

        config.url = "ws://127.0.0.1:9000/socket".to_string();
        assert!(config.validate().is_ok());

        config.url = "wss://query.example.com/socket".to_string();
        assert!(config.validate().is_ok());

        config.url = "ws://query.example.com/socket".to_string();
        let error = config.validate().expect_err("plain ws to remote host should fail");
        assert!(error.to_string().contains("must use wss"));

        config.url = "https://query.example.com".to_string();
        assert!(config.validate().is_err());

        config.url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl { .. })));
    }
}
