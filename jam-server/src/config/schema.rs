//! Configuration schema structs

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub workers: WorkerConfig,
    pub store: StoreConfig,
}

/// Listening sockets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket listener for browser links
    pub client_addr: String,
    /// Listener for worker startup handshakes
    pub control_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_addr: "127.0.0.1:8080".into(),
            control_addr: "127.0.0.1:8081".into(),
        }
    }
}

/// Auth session lifetime and pruning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Idle time before a token expires (default: 15 minutes)
    pub token_ttl_secs: u64,
    /// Time between prune sweeps
    pub prune_interval_secs: u64,
    /// First sweep is aligned to a multiple of this many seconds
    pub prune_phase_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 15 * 60,
            prune_interval_secs: 120,
            prune_phase_secs: 10,
        }
    }
}

/// Worker provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker binary; defaults to `jam-worker` next to the server binary
    pub worker_bin: Option<PathBuf>,
    /// Interface workers bind on
    pub host: String,
    pub discovery_attempts: u32,
    pub discovery_delay_ms: u64,
    /// How long a spawned worker has to complete its handshake
    pub pending_ttl_secs: u64,
    pub max_depth: usize,
    pub max_width: usize,
    pub default_length_secs: u64,
    pub max_length_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_bin: None,
            host: "127.0.0.1".into(),
            discovery_attempts: 10,
            discovery_delay_ms: 500,
            pending_ttl_secs: 10,
            max_depth: 4,
            max_width: 4,
            default_length_secs: 60 * 60,
            max_length_secs: 4 * 60 * 60,
        }
    }
}

/// Document store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON store file; defaults to `store.json` in the data dir
    pub path: Option<PathBuf>,
    /// Keep documents in memory only
    pub in_memory: bool,
}
