//! Configuration loading.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:1234"
//! allow_anonymous = false
//!
//! [storage]
//! backend = "rocksdb"
//! path = "/var/lib/scribe"
//!
//! [auth.tokens]
//! "s3cret" = "alice"
//! ```
//!
//! Every section and field is optional.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::TokenTable;
use crate::doc::{CrdtOptions, DEFAULT_TEXT_NAME};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub documents: DocumentConfig,
    pub awareness: AwarenessConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load from `path`, or fall back to defaults when the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "No config at {}, using defaults",
                    path.as_ref().display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// Listener and per-connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Frames buffered per receiver before a connection is resynced.
    pub broadcast_capacity: usize,
    /// Transport ping interval; a missed pong closes the connection.
    pub heartbeat_interval_ms: u64,
    /// Admit connections without a valid token as anonymous.
    pub allow_anonymous: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_ms: 30_000,
            allow_anonymous: true,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Name of the root text type.
    pub text_name: String,
    /// Compact deleted history. Disable for very large documents.
    pub gc: bool,
    /// Upper bound for a single load or save.
    pub persistence_timeout_ms: u64,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            text_name: DEFAULT_TEXT_NAME.to_string(),
            gc: true,
            persistence_timeout_ms: 10_000,
        }
    }
}

impl DocumentConfig {
    pub fn crdt_options(&self) -> CrdtOptions {
        CrdtOptions {
            text_name: self.text_name.clone(),
            gc: self.gc,
        }
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwarenessConfig {
    /// Remote presence not renewed within this window is dropped.
    pub timeout_ms: u64,
    /// Sweep period.
    pub check_interval_ms: u64,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            check_interval_ms: 3_000,
        }
    }
}

impl AwarenessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// RocksDB directory.
    pub path: PathBuf,
    /// fsync every write.
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("scribe_data"),
            sync_writes: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// token → user id
    pub tokens: HashMap<String, String>,
}

impl AuthConfig {
    pub fn token_table(&self) -> TokenTable {
        TokenTable::new(self.tokens.clone())
    }
}
