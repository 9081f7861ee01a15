//! etcd metadata store
//!
//! Locks are keys bound to an etcd lease; the lease id of every lock this
//! process holds is tracked locally so renew and release act on it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{is_direct_child, LockEvent, LockWatch, MetadataStore, StoreError, StoreResult};
use crate::config::EtcdConfig;

fn unavailable(context: &str, e: etcd_client::Error) -> StoreError {
    StoreError::Unavailable(format!("etcd {}: {}", context, e))
}

fn lease_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

#[derive(Debug, Clone)]
struct HeldLease {
    holder: String,
    lease_id: i64,
}

pub struct EtcdStore {
    client: Client,
    lock_prefix: String,
    leases: Mutex<HashMap<String, HeldLease>>,
}

impl EtcdStore {
    pub async fn connect(config: &EtcdConfig, lock_prefix: &str) -> StoreResult<Self> {
        let mut options = ConnectOptions::new()
            .with_require_leader(true)
            .with_connect_timeout(config.timeout())
            .with_timeout(config.timeout())
            .with_keep_alive(Duration::from_secs(2), Duration::from_secs(2))
            .with_keep_alive_while_idle(true);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(username.clone(), password.clone());
        }
        let client = Client::connect(config.endpoints.clone(), Some(options))
            .await
            .map_err(|e| unavailable(&format!("connect {}", config.endpoints.join(",")), e))?;
        Ok(Self {
            client,
            lock_prefix: lock_prefix.to_string(),
            leases: Mutex::new(HashMap::new()),
        })
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}/{}", self.lock_prefix, name)
    }

    fn held_lease(&self, name: &str, holder: &str) -> Option<i64> {
        self.leases
            .lock()
            .get(name)
            .filter(|l| l.holder == holder)
            .map(|l| l.lease_id)
    }

    /// One keep-alive round trip; false if the lease is gone
    async fn keep_alive(&self, lease_id: i64) -> StoreResult<bool> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| unavailable("keepalive", e))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| unavailable("keepalive", e))?;
        let ack = stream
            .message()
            .await
            .map_err(|e| unavailable("keepalive", e))?;
        Ok(ack.map_or(false, |ack| ack.ttl() > 0))
    }

    /// True if the lock key still carries `holder` under `lease_id`
    async fn owns_key(&self, key: &str, holder: &str, lease_id: i64) -> StoreResult<bool> {
        let mut client = self.client.clone();
        let resp = client
            .get(key, None)
            .await
            .map_err(|e| unavailable("get lock", e))?;
        Ok(resp
            .kvs()
            .first()
            .map_or(false, |kv| kv.lease() == lease_id && kv.value() == holder.as_bytes()))
    }
}

#[async_trait]
impl MetadataStore for EtcdStore {
    fn backend(&self) -> &'static str {
        "etcd"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = client
            .get(key, None)
            .await
            .map_err(|e| unavailable("get", e))?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut client = self.client.clone();
        client
            .put(key, value, None)
            .await
            .map_err(|e| unavailable("put", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut client = self.client.clone();
        client
            .delete(key, None)
            .await
            .map_err(|e| unavailable("delete", e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut client = self.client.clone();
        let resp = client
            .get(format!("{}/", prefix), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| unavailable("list", e))?;
        let mut children: Vec<(String, Vec<u8>)> = resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                let key = kv.key_str().ok()?;
                is_direct_child(prefix, key).then(|| (key.to_string(), kv.value().to_vec()))
            })
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(children)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> StoreResult<()> {
        let compare = match expected {
            None => Compare::version(key, CompareOp::Equal, 0),
            Some(expected) => Compare::value(key, CompareOp::Equal, expected),
        };
        let txn = Txn::new()
            .when([compare])
            .and_then([TxnOp::put(key, value, None)]);
        let mut client = self.client.clone();
        let resp = client
            .txn(txn)
            .await
            .map_err(|e| unavailable("cas", e))?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(StoreError::Conflict(key.to_string()))
        }
    }

    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        if self.held_lease(name, holder).is_some() {
            return self.renew_lock(name, holder, ttl).await;
        }

        let key = self.lock_key(name);
        let mut client = self.client.clone();
        let lease_id = client
            .lease_grant(lease_secs(ttl), None)
            .await
            .map_err(|e| unavailable("grant lease", e))?
            .id();
        let txn = Txn::new()
            .when([Compare::version(key.as_str(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key.as_str(),
                holder,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        let resp = client
            .txn(txn)
            .await
            .map_err(|e| unavailable("acquire lock", e))?;
        if resp.succeeded() {
            self.leases.lock().insert(
                name.to_string(),
                HeldLease {
                    holder: holder.to_string(),
                    lease_id,
                },
            );
            debug!("Acquired etcd lock {} with lease {:x}", key, lease_id);
            return Ok(());
        }
        let _ = client.lease_revoke(lease_id).await;

        let current = client
            .get(key.as_str(), None)
            .await
            .map_err(|e| unavailable("get lock", e))?;
        let Some(kv) = current.kvs().first() else {
            // released between the txn and the read
            return Err(StoreError::AlreadyHeld {
                name: name.to_string(),
                holder: "unknown".to_string(),
            });
        };
        let current_holder = String::from_utf8_lossy(kv.value()).into_owned();
        if current_holder == holder {
            // held by an earlier incarnation of this controller; adopt its lease
            self.leases.lock().insert(
                name.to_string(),
                HeldLease {
                    holder: holder.to_string(),
                    lease_id: kv.lease(),
                },
            );
            return self.renew_lock(name, holder, ttl).await;
        }
        Err(StoreError::AlreadyHeld {
            name: name.to_string(),
            holder: current_holder,
        })
    }

    async fn renew_lock(&self, name: &str, holder: &str, _ttl: Duration) -> StoreResult<()> {
        let lost = || StoreError::LockLost(name.to_string());
        let lease_id = self.held_lease(name, holder).ok_or_else(lost)?;

        let alive = self.keep_alive(lease_id).await?;
        if !alive || !self.owns_key(&self.lock_key(name), holder, lease_id).await? {
            self.leases.lock().remove(name);
            return Err(lost());
        }
        Ok(())
    }

    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
        let key = self.lock_key(name);
        let mut client = self.client.clone();
        let held = {
            let mut leases = self.leases.lock();
            match leases.get(name) {
                Some(l) if l.holder == holder => leases.remove(name),
                _ => None,
            }
        };
        if let Some(lease) = held {
            // revoking the lease deletes the key
            if let Err(e) = client.lease_revoke(lease.lease_id).await {
                warn!("Failed to revoke lease {:x}: {}", lease.lease_id, e);
            } else {
                return Ok(());
            }
        }
        let txn = Txn::new()
            .when([Compare::value(key.as_str(), CompareOp::Equal, holder)])
            .and_then([TxnOp::delete(key.as_str(), None)]);
        client
            .txn(txn)
            .await
            .map_err(|e| unavailable("release lock", e))?;
        Ok(())
    }

    async fn watch_lock(&self, name: &str) -> StoreResult<LockWatch> {
        let key = self.lock_key(name);
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(key.as_str(), None)
            .await
            .map_err(|e| unavailable("watch", e))?;
        let current = client
            .get(key.as_str(), None)
            .await
            .map_err(|e| unavailable("get lock", e))?;
        let initial = match current.kvs().first() {
            Some(kv) => LockEvent::held(String::from_utf8_lossy(kv.value())),
            None => LockEvent::released(),
        };

        let (tx, watch) = LockWatch::channel();
        tokio::spawn(async move {
            // dropping the watcher cancels the etcd watch
            let _watcher = watcher;
            if tx.send(initial).await.is_err() {
                return;
            }
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => return,
                    Err(e) => {
                        warn!("etcd watch on {} ended: {}", key, e);
                        return;
                    }
                };
                for event in resp.events() {
                    let lock_event = match event.event_type() {
                        EventType::Put => match event.kv() {
                            Some(kv) => LockEvent::held(String::from_utf8_lossy(kv.value())),
                            None => continue,
                        },
                        EventType::Delete => LockEvent::released(),
                    };
                    if tx.send(lock_event).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(watch)
    }
}
