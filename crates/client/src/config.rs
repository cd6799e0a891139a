// Client configuration.
//
// Global config lives at `~/.colloquy/config.toml`. Route names are a
// deployment concern: they must match the server's handler mappings, so
// they are configurable with defaults that match the reference server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use colloquy_common::protocol::{DATA_MIME_TYPE, ROUTING_MIME_TYPE};

use crate::transport::ConnectionSetup;

/// Root directory for colloquy global state: `~/.colloquy/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".colloquy"))
}

/// Path to the global config file: `~/.colloquy/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Client configuration with per-deployment overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Chat server endpoint (e.g. `wss://chat.example.com/rsocket`).
    pub endpoint: String,
    /// Route names agreed with the server.
    pub routes: RouteTable,
    /// Transport handshake intervals.
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:7000/rsocket".to_string(),
            routes: RouteTable::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load from `~/.colloquy/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
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

    /// Setup data for the transport handshake, carrying the identity
    /// when one is supplied at connect time.
    pub fn connection_setup(&self, username: Option<&str>) -> ConnectionSetup {
        ConnectionSetup {
            username: username.map(str::to_owned),
            keepalive: Duration::from_millis(self.transport.keepalive_ms),
            lifetime: Duration::from_millis(self.transport.lifetime_ms),
            data_mime_type: DATA_MIME_TYPE.to_string(),
            metadata_mime_type: ROUTING_MIME_TYPE.to_string(),
        }
    }
}

/// Logical route names for the chat operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouteTable {
    pub join: String,
    pub leave: String,
    pub send: String,
    pub stream: String,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            join: "chat.join".to_string(),
            leave: "chat.leave".to_string(),
            send: "chat.send".to_string(),
            stream: "chat.stream".to_string(),
        }
    }
}

/// Keepalive/lifetime intervals sent in the transport setup frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    pub keepalive_ms: u64,
    pub lifetime_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { keepalive_ms: 60_000, lifetime_ms: 180_000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint, "ws://localhost:7000/rsocket");
        assert_eq!(config.routes.join, "chat.join");
        assert_eq!(config.routes.stream, "chat.stream");
        assert_eq!(config.transport.keepalive_ms, 60_000);
        assert_eq!(config.transport.lifetime_ms, 180_000);
    }

    #[test]
    fn connection_setup_carries_identity_and_mime_types() {
        let setup = ClientConfig::default().connection_setup(Some("alice"));
        assert_eq!(setup.username.as_deref(), Some("alice"));
        assert_eq!(setup.keepalive, Duration::from_secs(60));
        assert_eq!(setup.lifetime, Duration::from_secs(180));
        assert_eq!(setup.data_mime_type, "application/json");
        assert_eq!(setup.metadata_mime_type, "message/x.rsocket.routing.v0");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ClientConfig::default();
        config.endpoint = "wss://chat.example.com/rsocket".to_string();
        config.routes.send = "room.send".to_string();
        config.save_to(&path).expect("save");

        let loaded = ClientConfig::load_from(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "endpoint = \"wss://chat.example.com/rsocket\"\n").expect("write");

        let loaded = ClientConfig::load_from(&path).expect("load");
        assert_eq!(loaded.endpoint, "wss://chat.example.com/rsocket");
        assert_eq!(loaded.routes, RouteTable::default());
    }

    #[test]
    fn load_from_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            ClientConfig::load_from(&dir.path().join("absent.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
