//! Metadata store
//!
//! A backend-agnostic, strongly consistent key-value contract with
//! compare-and-swap, hierarchical listing and a lease-based lock. Every
//! backend implements [`MetadataStore`]; which one runs is a static
//! configuration choice (see [`connect`]).

mod consul;
mod etcd;
mod events;
mod memory;
mod raft;
mod sql;
mod state;
mod zookeeper;

pub use consul::ConsulStore;
pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use raft::RaftStore;
pub use sql::SqlStore;
pub use zookeeper::ZookeeperStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{StorageConfig, StorageType};

/// Store error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Current value differs from the expected one
    #[error("compare-and-swap conflict on {0}")]
    Conflict(String),
    /// Lock is held by somebody else
    #[error("lock {name} is held by {holder}")]
    AlreadyHeld { name: String, holder: String },
    /// Lease expired or was taken over
    #[error("lock {0} lost")]
    LockLost(String),
    /// Backend cannot guarantee consistency; state is unknown
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("internal store error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Lock state change observed by [`MetadataStore::watch_lock`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    pub held: bool,
    pub holder: Option<String>,
}

impl LockEvent {
    pub fn held(holder: impl Into<String>) -> Self {
        Self {
            held: true,
            holder: Some(holder.into()),
        }
    }

    pub fn released() -> Self {
        Self {
            held: false,
            holder: None,
        }
    }
}

/// Lazy sequence of lock events
///
/// The first event reports the state at subscription time. The sequence ends
/// (`next` returns `None`) when the store connection goes away; callers
/// restart it with a fresh `watch_lock`.
pub struct LockWatch {
    rx: mpsc::Receiver<LockEvent>,
}

impl LockWatch {
    pub(crate) fn channel() -> (mpsc::Sender<LockEvent>, Self) {
        let (tx, rx) = mpsc::channel(16);
        (tx, Self { rx })
    }

    pub async fn next(&mut self) -> Option<LockEvent> {
        self.rx.recv().await
    }
}

/// Lock record for backends without native leases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    /// Unix millis
    pub expires_at_ms: i64,
    /// Bumped on every acquire/renew; scheduled expiries carry it
    #[serde(default)]
    pub epoch: u64,
}

impl LockRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Metadata store contract
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Backend name, for logs
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Direct children of `prefix` (`prefix/<segment>`), ordered by key
    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Replace the value only if it currently equals `expected`
    ///
    /// `expected = None` means the key must not exist. Fails with
    /// [`StoreError::Conflict`] otherwise.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> StoreResult<()>;

    /// Take the lock for `ttl`; re-acquiring a lock already held by
    /// `holder` extends it
    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()>;

    /// Extend a held lock; [`StoreError::LockLost`] if `holder` no longer owns it
    async fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()>;

    /// Release the lock if `holder` owns it
    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()>;

    async fn watch_lock(&self, name: &str) -> StoreResult<LockWatch>;
}

/// True if `key` is a direct child of `prefix`
pub(crate) fn is_direct_child(prefix: &str, key: &str) -> bool {
    key.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .map_or(false, |rest| !rest.is_empty() && !rest.contains('/'))
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Connect to the configured backend
pub async fn connect(config: &StorageConfig) -> StoreResult<Arc<dyn MetadataStore>> {
    // lock records for backends that keep them as ordinary keys
    let locks = format!("{}/locks", config.prefix);
    let store: Arc<dyn MetadataStore> = match config.storage_type {
        StorageType::Memory => Arc::new(MemoryStore::new()),
        StorageType::Etcd => Arc::new(EtcdStore::connect(&config.etcd, &locks).await?),
        StorageType::Zookeeper => {
            Arc::new(ZookeeperStore::connect(&config.zookeeper, &locks).await?)
        }
        StorageType::Raft => Arc::new(RaftStore::open(&config.raft).await?),
        StorageType::Consul => Arc::new(ConsulStore::new(&config.consul, &locks)?),
        StorageType::Sql => Arc::new(SqlStore::connect(&config.sql).await?),
    };
    info!("Connected to {} metadata store", store.backend());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_direct_child() {
        assert!(is_direct_child("/a/ns", "/a/ns/x"));
        assert!(!is_direct_child("/a/ns", "/a/ns/x/clusters"));
        assert!(!is_direct_child("/a/ns", "/a/nsx"));
        assert!(!is_direct_child("/a/ns", "/a/ns/"));
        assert!(!is_direct_child("/a/ns", "/a/ns"));
    }
}
