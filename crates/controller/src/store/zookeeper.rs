//! ZooKeeper metadata store
//!
//! Keys map to znodes; intermediate znodes are created on demand with empty
//! data and are invisible to `get`/`list`. CAS relies on znode versions.
//! Locks are ephemeral znodes holding a [`LockRecord`], so they vanish with
//! the holder's session and also run out after their ttl.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use zookeeper_client as zk;

use super::{
    now_ms, ttl_ms, LockEvent, LockRecord, LockWatch, MetadataStore, StoreError, StoreResult,
};
use crate::config::ZookeeperConfig;

fn unavailable(context: &str, e: zk::Error) -> StoreError {
    StoreError::Unavailable(format!("zookeeper {}: {}", context, e))
}

fn persistent() -> zk::CreateOptions<'static> {
    zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all())
}

fn ephemeral() -> zk::CreateOptions<'static> {
    zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all())
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

pub struct ZookeeperStore {
    client: zk::Client,
    lock_prefix: String,
}

impl ZookeeperStore {
    pub async fn connect(config: &ZookeeperConfig, lock_prefix: &str) -> StoreResult<Self> {
        let cluster = config.addrs.join(",");
        let client = zk::Client::connect(&cluster)
            .await
            .map_err(|e| unavailable(&format!("connect {}", cluster), e))?;
        Ok(Self {
            client,
            lock_prefix: lock_prefix.to_string(),
        })
    }

    fn lock_path(&self, name: &str) -> String {
        format!("{}/{}", self.lock_prefix, name)
    }

    /// Data and version, treating structural znodes as absent
    async fn read(&self, path: &str) -> StoreResult<Option<(Vec<u8>, i32)>> {
        match self.client.get_data(path).await {
            Ok((data, stat)) => Ok(Some((data, stat.version))),
            Err(zk::Error::NoNode) => Ok(None),
            Err(e) => Err(unavailable("get", e)),
        }
    }

    async fn ensure_parents(&self, path: &str) -> StoreResult<()> {
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        while let Some(parent) = current {
            match self.client.check_stat(parent).await {
                Ok(Some(_)) => break,
                Ok(None) => missing.push(parent),
                Err(e) => return Err(unavailable("stat", e)),
            }
            current = parent_of(parent);
        }
        for parent in missing.into_iter().rev() {
            match self.client.create(parent, &[], &persistent()).await {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(e) => return Err(unavailable("create parent", e)),
            }
        }
        Ok(())
    }

    /// Create `path`, creating missing parents first
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        options: &zk::CreateOptions<'_>,
    ) -> StoreResult<bool> {
        for _ in 0..2 {
            match self.client.create(path, data, options).await {
                Ok(_) => return Ok(true),
                Err(zk::Error::NodeExists) => return Ok(false),
                Err(zk::Error::NoNode) => self.ensure_parents(path).await?,
                Err(e) => return Err(unavailable("create", e)),
            }
        }
        Err(StoreError::Unavailable(format!(
            "zookeeper create {}: parent keeps vanishing",
            path
        )))
    }

    async fn delete_tree(&self, path: &str) -> StoreResult<()> {
        let mut stack = vec![path.to_string()];
        let mut order = Vec::new();
        while let Some(node) = stack.pop() {
            let children = match self.client.list_children(&node).await {
                Ok(children) => children,
                Err(zk::Error::NoNode) => continue,
                Err(e) => return Err(unavailable("list", e)),
            };
            stack.extend(children.into_iter().map(|c| format!("{}/{}", node, c)));
            order.push(node);
        }
        for node in order.into_iter().rev() {
            match self.client.delete(&node, None).await {
                Ok(()) | Err(zk::Error::NoNode) => {}
                Err(e) => return Err(unavailable("delete", e)),
            }
        }
        Ok(())
    }

    async fn read_lock(&self, name: &str) -> StoreResult<Option<(LockRecord, i32)>> {
        match self.read(&self.lock_path(name)).await? {
            Some((data, version)) if !data.is_empty() => {
                let record = serde_json::from_slice(&data)
                    .map_err(|e| StoreError::Codec(format!("lock {}: {}", name, e)))?;
                Ok(Some((record, version)))
            }
            _ => Ok(None),
        }
    }

    fn encode_lock(holder: &str, ttl: Duration) -> StoreResult<Vec<u8>> {
        let record = LockRecord {
            holder: holder.to_string(),
            expires_at_ms: now_ms().saturating_add(ttl_ms(ttl)),
            epoch: 0,
        };
        serde_json::to_vec(&record).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

#[async_trait]
impl MetadataStore for ZookeeperStore {
    fn backend(&self) -> &'static str {
        "zookeeper"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .read(key)
            .await?
            .map(|(data, _)| data)
            .filter(|data| !data.is_empty()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        loop {
            match self.client.set_data(key, value, None).await {
                Ok(_) => return Ok(()),
                Err(zk::Error::NoNode) => {
                    if self.create(key, value, &persistent()).await? {
                        return Ok(());
                    }
                }
                Err(e) => return Err(unavailable("set", e)),
            }
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.delete_tree(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut children = match self.client.list_children(prefix).await {
            Ok(children) => children,
            Err(zk::Error::NoNode) => return Ok(Vec::new()),
            Err(e) => return Err(unavailable("list", e)),
        };
        children.sort();
        let mut result = Vec::with_capacity(children.len());
        for child in children {
            let key = format!("{}/{}", prefix, child);
            // may have been deleted since the listing
            if let Some((data, _)) = self.read(&key).await? {
                if !data.is_empty() {
                    result.push((key, data));
                }
            }
        }
        Ok(result)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> StoreResult<()> {
        let conflict = || StoreError::Conflict(key.to_string());
        let current = self.read(key).await?;
        let version = match (expected, current) {
            (None, None) => {
                return if self.create(key, value, &persistent()).await? {
                    Ok(())
                } else {
                    Err(conflict())
                };
            }
            (None, Some((data, version))) if data.is_empty() => version,
            (Some(expected), Some((data, version))) if data == expected => version,
            _ => return Err(conflict()),
        };
        match self.client.set_data(key, value, Some(version)).await {
            Ok(_) => Ok(()),
            Err(zk::Error::BadVersion) | Err(zk::Error::NoNode) => Err(conflict()),
            Err(e) => Err(unavailable("cas", e)),
        }
    }

    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        let path = self.lock_path(name);
        let data = Self::encode_lock(holder, ttl)?;
        if self.create(&path, &data, &ephemeral()).await? {
            debug!("Acquired zookeeper lock {}", path);
            return Ok(());
        }

        let Some((record, version)) = self.read_lock(name).await? else {
            return Err(StoreError::AlreadyHeld {
                name: name.to_string(),
                holder: "unknown".to_string(),
            });
        };
        if record.holder == holder {
            return self.renew_lock(name, holder, ttl).await;
        }
        if !record.is_expired(now_ms()) {
            return Err(StoreError::AlreadyHeld {
                name: name.to_string(),
                holder: record.holder,
            });
        }

        // stale lock of a live session; take its place
        match self.client.delete(&path, Some(version)).await {
            Ok(()) | Err(zk::Error::NoNode) => {}
            Err(zk::Error::BadVersion) => {
                return Err(StoreError::AlreadyHeld {
                    name: name.to_string(),
                    holder: record.holder,
                })
            }
            Err(e) => return Err(unavailable("delete lock", e)),
        }
        if self.create(&path, &data, &ephemeral()).await? {
            Ok(())
        } else {
            Err(StoreError::AlreadyHeld {
                name: name.to_string(),
                holder: "unknown".to_string(),
            })
        }
    }

    async fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        let lost = || StoreError::LockLost(name.to_string());
        let (record, version) = self.read_lock(name).await?.ok_or_else(lost)?;
        if record.holder != holder || record.is_expired(now_ms()) {
            return Err(lost());
        }
        let data = Self::encode_lock(holder, ttl)?;
        match self
            .client
            .set_data(&self.lock_path(name), &data, Some(version))
            .await
        {
            Ok(_) => Ok(()),
            Err(zk::Error::BadVersion) | Err(zk::Error::NoNode) => Err(lost()),
            Err(e) => Err(unavailable("renew lock", e)),
        }
    }

    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
        let Some((record, version)) = self.read_lock(name).await? else {
            return Ok(());
        };
        if record.holder != holder {
            return Ok(());
        }
        match self.client.delete(&self.lock_path(name), Some(version)).await {
            Ok(()) | Err(zk::Error::NoNode) | Err(zk::Error::BadVersion) => Ok(()),
            Err(e) => Err(unavailable("release lock", e)),
        }
    }

    async fn watch_lock(&self, name: &str) -> StoreResult<LockWatch> {
        let client = self.client.clone();
        let path = self.lock_path(name);
        let (tx, watch) = LockWatch::channel();

        tokio::spawn(async move {
            loop {
                let (stat, watcher) = match client.check_and_watch_stat(&path).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("zookeeper watch on {} ended: {}", path, e);
                        return;
                    }
                };
                let event = match stat {
                    None => LockEvent::released(),
                    Some(_) => match client.get_data(&path).await {
                        Ok((data, _)) => match serde_json::from_slice::<LockRecord>(&data) {
                            Ok(record) if !record.is_expired(now_ms()) => {
                                LockEvent::held(record.holder)
                            }
                            _ => LockEvent::released(),
                        },
                        Err(zk::Error::NoNode) => LockEvent::released(),
                        Err(e) => {
                            warn!("zookeeper watch on {} ended: {}", path, e);
                            return;
                        }
                    },
                };
                if tx.send(event).await.is_err() {
                    return;
                }
                let changed = watcher.changed().await;
                if changed.event_type == zk::EventType::Session {
                    warn!("zookeeper session event on {}: {:?}", path, changed.session_state);
                    return;
                }
            }
        });
        Ok(watch)
    }
}
