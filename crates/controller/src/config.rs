//! Controller configuration
//!
//! YAML file with one section per subsystem; every field has a default.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP API listen address
    pub addr: String,
    /// Identity used as lock holder and observer id
    pub controller_id: Option<String>,
    pub storage: StorageConfig,
    pub election: ElectionConfig,
    pub failover: FailoverConfig,
    pub multi_detect: MultiDetectConfig,
    pub migration: MigrationConfig,
    pub repository: RepositoryConfig,
    pub node_rpc: NodeRpcConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            controller_id: None,
            storage: StorageConfig::default(),
            election: ElectionConfig::default(),
            failover: FailoverConfig::default(),
            multi_detect: MultiDetectConfig::default(),
            migration: MigrationConfig::default(),
            repository: RepositoryConfig::default(),
            node_rpc: NodeRpcConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to YAML file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.addr.parse::<std::net::SocketAddr>().is_err() {
            return invalid(format!("addr {:?} is not a socket address", self.addr));
        }
        if self.storage.prefix.is_empty()
            || !self.storage.prefix.starts_with('/')
            || self.storage.prefix.ends_with('/')
        {
            return invalid("storage.prefix must start with '/' and not end with '/'".into());
        }
        if self.election.lease_ttl_secs < 2 {
            return invalid("election.lease_ttl_secs must be at least 2".into());
        }
        if self.election.lock_name.is_empty() || self.election.lock_name.contains('/') {
            return invalid("election.lock_name must be a single path segment".into());
        }

        let failover = &self.failover;
        if failover.ping_interval_seconds < 1 {
            return invalid("failover.ping_interval_seconds must be at least 1".into());
        }
        if failover.max_ping_count < 3 {
            return invalid("failover.max_ping_count must be at least 3".into());
        }
        if failover.probe_timeout() >= failover.ping_interval() {
            return invalid("failover.probe_timeout_ms must be below the ping interval".into());
        }

        let detect = &self.multi_detect;
        if detect.window_periods < failover.max_ping_count {
            return invalid("multi_detect.window_periods must be >= failover.max_ping_count".into());
        }
        if detect.quorum.mode == QuorumMode::Fixed && detect.quorum.min_votes < 1 {
            return invalid("multi_detect.quorum.min_votes must be at least 1".into());
        }
        if detect.aggregate_interval_ms == 0 {
            return invalid("multi_detect.aggregate_interval_ms must be positive".into());
        }
        if !detect.key_prefix.starts_with('/') || detect.key_prefix.ends_with('/') {
            return invalid("multi_detect.key_prefix must start with '/' and not end with '/'".into());
        }

        if self.migration.poll_interval_ms == 0 || self.migration.transfer_timeout_secs == 0 {
            return invalid("migration intervals must be positive".into());
        }
        if self.repository.max_cas_retries < 1 {
            return invalid("repository.max_cas_retries must be at least 1".into());
        }
        if self.node_rpc.timeout_ms == 0 {
            return invalid("node_rpc.timeout_ms must be positive".into());
        }
        if self.storage.storage_type == StorageType::Raft && self.storage.raft.snapshot_threshold == 0
        {
            return invalid("storage.raft.snapshot_threshold must be positive".into());
        }
        Ok(())
    }

    /// Configured controller id, or `<host>-<uuid>`
    pub fn resolve_controller_id(&self) -> String {
        match &self.controller_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let host = std::env::var("HOSTNAME")
                    .ok()
                    .filter(|h| !h.is_empty())
                    .unwrap_or_else(|| "controller".to_string());
                format!("{}-{}", host, uuid::Uuid::new_v4())
            }
        }
    }
}

/// Storage backend kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Memory,
    Etcd,
    Zookeeper,
    Raft,
    Consul,
    Sql,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Root key prefix
    pub prefix: String,
    pub etcd: EtcdConfig,
    pub zookeeper: ZookeeperConfig,
    pub raft: RaftStoreConfig,
    pub consul: ConsulConfig,
    pub sql: SqlConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::default(),
            prefix: default_prefix(),
            etcd: EtcdConfig::default(),
            zookeeper: ZookeeperConfig::default(),
            raft: RaftStoreConfig::default(),
            consul: ConsulConfig::default(),
            sql: SqlConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            timeout_ms: 5000,
        }
    }
}

impl EtcdConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZookeeperConfig {
    /// host:port list
    pub addrs: Vec<String>,
}

impl Default for ZookeeperConfig {
    fn default() -> Self {
        Self {
            addrs: vec!["127.0.0.1:2181".to_string()],
        }
    }
}

/// Raft-log backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftStoreConfig {
    pub data_dir: PathBuf,
    /// Log entries between snapshots
    pub snapshot_threshold: u64,
}

impl Default for RaftStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/raft"),
            snapshot_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Agent HTTP address
    pub addr: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:8500".to_string(),
            token: None,
            timeout_ms: 5000,
        }
    }
}

impl ConsulConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    /// PostgreSQL connection url
    pub url: String,
    pub max_connections: u32,
    /// How often expired lock rows are reaped
    pub lock_reap_interval_ms: u64,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/kvrocks_controller".to_string(),
            max_connections: 5,
            lock_reap_interval_ms: 1000,
        }
    }
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    pub lease_ttl_secs: u64,
    pub lock_name: String,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 10,
            lock_name: "controller-leader".to_string(),
        }
    }
}

impl ElectionConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Failure probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub ping_interval_seconds: u64,
    /// Consecutive failed probes before a node is a candidate
    pub max_ping_count: usize,
    pub probe_timeout_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            ping_interval_seconds: 3,
            max_ping_count: 5,
            probe_timeout_ms: 1000,
        }
    }
}

impl FailoverConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuorumMode {
    /// More than half of the observers
    #[default]
    Majority,
    /// At least `min_votes` observers
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    pub mode: QuorumMode,
    pub min_votes: usize,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            mode: QuorumMode::Majority,
            min_votes: 2,
        }
    }
}

/// Multi-observer detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiDetectConfig {
    pub enabled: bool,
    /// Probe results retained per node
    pub window_periods: usize,
    pub quorum: QuorumConfig,
    /// Appended to `storage.prefix`
    pub key_prefix: String,
    pub require_quorum_on_promotion: bool,
    /// Peer observations older than this are ignored
    pub aggregate_interval_ms: u64,
}

impl Default for MultiDetectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_periods: 10,
            quorum: QuorumConfig::default(),
            key_prefix: "/multi_detect".to_string(),
            require_quorum_on_promotion: true,
            aggregate_interval_ms: 5000,
        }
    }
}

impl MultiDetectConfig {
    pub fn aggregate_interval(&self) -> Duration {
        Duration::from_millis(self.aggregate_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub poll_interval_ms: u64,
    pub transfer_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            transfer_timeout_secs: 3600,
        }
    }
}

impl MigrationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub max_cas_retries: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self { max_cas_retries: 8 }
    }
}

/// Data node RPC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRpcConfig {
    /// Per-call timeout
    pub timeout_ms: u64,
}

impl Default for NodeRpcConfig {
    fn default() -> Self {
        Self { timeout_ms: 3000 }
    }
}

impl NodeRpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0:9379".to_string()
}

fn default_prefix() -> String {
    "/kvrocks".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
