//! In-memory metadata store
//!
//! Single-process backend used by tests and standalone deployments. Lock
//! leases expire through a scheduled task so watchers observe releases even
//! when the holder vanishes without calling `release_lock`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::events::LockEventHub;
use super::state::{Command, KvState};
use super::{now_ms, ttl_ms, LockEvent, LockWatch, MetadataStore, StoreError, StoreResult};

struct Inner {
    state: Mutex<KvState>,
    events: LockEventHub,
    available: AtomicBool,
}

impl Inner {
    fn apply(&self, cmd: Command) -> StoreResult<Option<u64>> {
        self.check_available()?;
        let applied = self.state.lock().apply(cmd)?;
        self.events.publish(applied.event);
        Ok(applied.epoch)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".into()))
        }
    }

    fn lock_event(&self, name: &str) -> LockEvent {
        match self.state.lock().lock_holder(name, now_ms()) {
            Some(record) => LockEvent::held(record.holder.clone()),
            None => LockEvent::released(),
        }
    }
}

/// In-memory store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(KvState::default()),
                events: LockEventHub::new(),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate losing (or regaining) the backend
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    fn schedule_expiry(&self, name: &str, epoch: u64, ttl: Duration) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            // wall clock and timer may disagree by a millisecond
            tokio::time::sleep(ttl + Duration::from_millis(5)).await;
            let Some(inner) = inner.upgrade() else { return };
            let cmd = Command::Expire {
                name: name.clone(),
                epoch,
                now_ms: now_ms(),
            };
            let applied = inner.state.lock().apply(cmd);
            if let Ok(applied) = applied {
                if applied.event.is_some() {
                    debug!("Lock {} expired", name);
                }
                inner.events.publish(applied.event);
            }
        });
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.check_available()?;
        Ok(self.inner.state.lock().get(key))
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.inner.apply(Command::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.apply(Command::Delete {
            key: key.to_string(),
        })?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.inner.check_available()?;
        Ok(self.inner.state.lock().list(prefix))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> StoreResult<()> {
        self.inner.apply(Command::Cas {
            key: key.to_string(),
            expected: expected.map(<[u8]>::to_vec),
            value: value.to_vec(),
        })?;
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        let epoch = self.inner.apply(Command::Acquire {
            name: name.to_string(),
            holder: holder.to_string(),
            ttl_ms: ttl_ms(ttl),
            now_ms: now_ms(),
        })?;
        if let Some(epoch) = epoch {
            self.schedule_expiry(name, epoch, ttl);
        }
        Ok(())
    }

    async fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        let epoch = self.inner.apply(Command::Renew {
            name: name.to_string(),
            holder: holder.to_string(),
            ttl_ms: ttl_ms(ttl),
            now_ms: now_ms(),
        })?;
        if let Some(epoch) = epoch {
            self.schedule_expiry(name, epoch, ttl);
        }
        Ok(())
    }

    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
        self.inner.apply(Command::Release {
            name: name.to_string(),
            holder: holder.to_string(),
        })?;
        Ok(())
    }

    async fn watch_lock(&self, name: &str) -> StoreResult<LockWatch> {
        self.inner.check_available()?;
        let inner = Arc::downgrade(&self.inner);
        let lock = name.to_string();
        Ok(self.inner.events.watch(name, move || {
            inner.upgrade().map(|inner| inner.lock_event(&lock))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_kv() {
        let store = MemoryStore::new();
        store.put("/a/x", b"1").await.unwrap();
        store.put("/a/y", b"2").await.unwrap();
        store.put("/a/y/z", b"3").await.unwrap();
        assert_eq!(store.get("/a/x").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.list("/a").await.unwrap().len(), 2);

        store.delete("/a/x").await.unwrap();
        store.delete("/a/x").await.unwrap();
        assert_eq!(store.get("/a/x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("/a").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert!(store.get("/a").await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_sees_expiry() {
        let store = MemoryStore::new();
        let mut watch = store.watch_lock("leader").await.unwrap();
        assert_eq!(watch.next().await, Some(LockEvent::released()));

        store
            .acquire_lock("leader", "a", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(watch.next().await, Some(LockEvent::held("a")));

        let released = tokio::time::timeout(Duration::from_secs(2), watch.next())
            .await
            .unwrap();
        assert_eq!(released, Some(LockEvent::released()));

        assert!(matches!(
            store
                .renew_lock("leader", "a", Duration::from_millis(50))
                .await,
            Err(StoreError::LockLost(_))
        ));
        store
            .acquire_lock("leader", "b", Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_renew_keeps_lock_alive() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(100);
        store.acquire_lock("l", "a", ttl).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            store.renew_lock("l", "a", ttl).await.unwrap();
        }
        assert!(matches!(
            store.acquire_lock("l", "b", ttl).await,
            Err(StoreError::AlreadyHeld { .. })
        ));
    }
}
