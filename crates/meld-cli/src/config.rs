//! Node configuration file.
//!
//! ```toml
//! node_id = "node-a"
//! database = "main"
//! listen = "0.0.0.0:7700"
//! policy = "lww"
//!
//! [storage]
//! backend = "redb"
//! path = "data/node-a.redb"
//!
//! [sync]
//! interval_secs = 10
//! timeout_secs = 60
//!
//! [[peers]]
//! id = "node-b"
//! addr = "10.0.0.2:7700"
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use meld::MergePolicy;
use meld_replica::SyncTaskConfig;
use meld_store::{MemoryStore, RedbStore, ReplicaStore, SqliteStore, StoreError};
use serde::{Deserialize, Serialize};

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's identity. Also names its own time vector row.
    pub node_id: String,

    /// Database name used in URL paths.
    #[serde(default = "default_database")]
    pub database: String,

    /// HTTP listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Merge policy for every item in the database.
    #[serde(default)]
    pub policy: MergePolicy,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    /// Peers to pull from.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Nothing persists across restarts.
    Memory,
    #[default]
    Redb,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Database file. Ignored by the memory backend.
    #[serde(default = "default_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            path: default_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between sync runs per peer.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Deadline for one sync run, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SyncConfig {
    pub fn task_config(&self) -> SyncTaskConfig {
        SyncTaskConfig {
            interval: Duration::from_secs(self.interval_secs),
            timeout: self.timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The peer's node id. Names our cursor row for it.
    pub id: String,
    /// `host:port` or a base URL.
    pub addr: String,
}

// --- Defaults ---

fn default_database() -> String {
    "main".to_string()
}
fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7700))
}
fn default_path() -> PathBuf {
    PathBuf::from("meld.redb")
}
fn default_interval_secs() -> u64 {
    10
}
fn default_timeout_secs() -> u64 {
    60
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        if self.database.is_empty() || self.database.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "database name {:?} must be non-empty and contain no '/'",
                self.database
            )));
        }
        if self.sync.interval_secs == 0 {
            return Err(ConfigError::Invalid("sync.interval_secs must be > 0".into()));
        }
        if self.sync.timeout_secs == 0 {
            return Err(ConfigError::Invalid("sync.timeout_secs must be > 0".into()));
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id.trim().is_empty() || peer.addr.trim().is_empty() {
                return Err(ConfigError::Invalid("peers need a non-empty id and addr".into()));
            }
            if peer.id == self.node_id {
                return Err(ConfigError::Invalid(format!(
                    "peer {:?} has this node's own id",
                    peer.id
                )));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate peer id {:?}", peer.id)));
            }
        }
        Ok(())
    }

    pub fn peer(&self, id: &str) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.id == id)
    }
}

impl StorageConfig {
    /// Open the configured backend.
    pub fn open(&self, policy: MergePolicy) -> Result<Arc<dyn ReplicaStore>, StoreError> {
        let store: Arc<dyn ReplicaStore> = match self.backend {
            Backend::Memory => Arc::new(MemoryStore::new(policy)),
            Backend::Redb => Arc::new(RedbStore::open(&self.path, policy)?),
            Backend::Sqlite => Arc::new(SqliteStore::open(&self.path, policy)?),
        };
        Ok(store)
    }
}

/// Load a `NodeConfig` from a TOML file path.
pub fn load_from_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a TOML string.
pub fn load_from_str(source: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = toml::from_str(source)?;
    config.validate()?;
    Ok(config)
}
