//! Topology repository
//!
//! CRUD over namespaces, clusters, shards and nodes. Each cluster is one
//! JSON record; every mutation is read, transform, compare-and-swap, retried
//! a bounded number of times on conflict. The failure detector's probe
//! windows and peer observations live here too.

mod keys;

pub use keys::{leaf, Keys};

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::detector::{Observation, ProbeWindow};
use crate::error::{ControllerError, Result};
use crate::metadata::{validate_name, ClusterInfo, NamespaceInfo, NodeInfo, NodeRole, ShardInfo};
use crate::store::{MetadataStore, StoreError};

/// Topology repository
#[derive(Clone)]
pub struct TopologyRepository {
    store: Arc<dyn MetadataStore>,
    keys: Keys,
    max_retries: usize,
}

impl TopologyRepository {
    pub fn new(store: Arc<dyn MetadataStore>, keys: Keys, max_retries: usize) -> Self {
        Self {
            store,
            keys,
            max_retries: max_retries.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    // ==================== Namespaces ====================

    pub async fn create_namespace(&self, name: &str) -> Result<NamespaceInfo> {
        let info = NamespaceInfo::new(name)?;
        let value = serde_json::to_vec(&info)?;
        match self
            .store
            .compare_and_swap(&self.keys.namespace(name), None, &value)
            .await
        {
            Ok(()) => {
                info!("Created namespace {}", name);
                Ok(info)
            }
            Err(StoreError::Conflict(_)) => {
                Err(ControllerError::AlreadyExists(format!("namespace {}", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.get(&self.keys.namespace(name)).await?.is_some())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        if self.namespace_exists(name).await? {
            Ok(())
        } else {
            Err(ControllerError::not_found(format!("namespace {}", name)))
        }
    }

    /// Delete an empty namespace
    ///
    /// Clusters are listed again after the delete: a `create_cluster` that
    /// raced in puts the namespace record back. `create_cluster` checks the
    /// namespace after its write, so one side always sees the other.
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let key = self.keys.namespace(name);
        let record = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| ControllerError::not_found(format!("namespace {}", name)))?;
        if !self.list_clusters(name).await?.is_empty() {
            return Err(ControllerError::NotEmpty(name.to_string()));
        }
        self.store.delete(&key).await?;
        if !self.list_clusters(name).await?.is_empty() {
            warn!("Cluster created in namespace {} while deleting it, restoring", name);
            match self.store.compare_and_swap(&key, None, &record).await {
                Ok(()) | Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
            return Err(ControllerError::NotEmpty(name.to_string()));
        }
        info!("Deleted namespace {}", name);
        Ok(())
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        let entries = self.store.list(&self.keys.namespaces()).await?;
        Ok(entries.iter().map(|(k, _)| leaf(k).to_string()).collect())
    }

    // ==================== Clusters ====================

    pub async fn create_cluster(
        &self,
        ns: &str,
        name: &str,
        nodes: &[String],
        replicas: usize,
        password: Option<String>,
    ) -> Result<ClusterInfo> {
        let cluster = ClusterInfo::create(name, nodes, replicas, password)?;
        self.ensure_namespace(ns).await?;
        let value = serde_json::to_vec(&cluster)?;
        match self
            .store
            .compare_and_swap(&self.keys.cluster(ns, name), None, &value)
            .await
        {
            Ok(()) => {
                if !self.namespace_exists(ns).await? {
                    warn!("Namespace {} deleted while creating cluster {}, removing it", ns, name);
                    self.store.delete(&self.keys.cluster(ns, name)).await?;
                    return Err(ControllerError::not_found(format!("namespace {}", ns)));
                }
                info!(
                    "Created cluster {}/{} with {} shards",
                    ns,
                    name,
                    cluster.shards.len()
                );
                Ok(cluster)
            }
            Err(StoreError::Conflict(_)) => {
                Err(ControllerError::AlreadyExists(format!("cluster {}/{}", ns, name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_cluster(&self, ns: &str, name: &str) -> Result<(ClusterInfo, Vec<u8>)> {
        let raw = self
            .store
            .get(&self.keys.cluster(ns, name))
            .await?
            .ok_or_else(|| ControllerError::not_found(format!("cluster {}/{}", ns, name)))?;
        let cluster: ClusterInfo = serde_json::from_slice(&raw)?;
        Ok((cluster, raw))
    }

    pub async fn get_cluster(&self, ns: &str, name: &str) -> Result<ClusterInfo> {
        validate_name("cluster", name)?;
        Ok(self.read_cluster(ns, name).await?.0)
    }

    pub async fn list_clusters(&self, ns: &str) -> Result<Vec<String>> {
        let entries = self.store.list(&self.keys.clusters(ns)).await?;
        Ok(entries.iter().map(|(k, _)| leaf(k).to_string()).collect())
    }

    /// Every cluster of every namespace
    pub async fn all_clusters(&self) -> Result<Vec<(String, ClusterInfo)>> {
        let mut result = Vec::new();
        for ns in self.list_namespaces().await? {
            for (_, raw) in self.store.list(&self.keys.clusters(&ns)).await? {
                result.push((ns.clone(), serde_json::from_slice(&raw)?));
            }
        }
        Ok(result)
    }

    pub async fn delete_cluster(&self, ns: &str, name: &str) -> Result<()> {
        self.read_cluster(ns, name).await?;
        self.store.delete(&self.keys.cluster(ns, name)).await?;
        info!("Deleted cluster {}/{}", ns, name);
        Ok(())
    }

    /// Apply `change` to the cluster record under compare-and-swap
    ///
    /// `change` runs on a fresh copy for every attempt and may be called
    /// more than once. If it leaves the record untouched nothing is written
    /// and the version stays put; otherwise the version grows by exactly one.
    pub async fn update_cluster<T, F>(
        &self,
        ns: &str,
        name: &str,
        mut change: F,
    ) -> Result<(T, ClusterInfo)>
    where
        F: FnMut(&mut ClusterInfo) -> Result<T> + Send,
        T: Send,
    {
        let key = self.keys.cluster(ns, name);
        for attempt in 1..=self.max_retries {
            let (current, raw) = self.read_cluster(ns, name).await?;
            let mut updated = current.clone();
            let output = change(&mut updated)?;
            if updated == current {
                return Ok((output, current));
            }
            updated.version = current.version + 1;
            updated.validate()?;

            let value = serde_json::to_vec(&updated)?;
            match self.store.compare_and_swap(&key, Some(&raw), &value).await {
                Ok(()) => return Ok((output, updated)),
                Err(StoreError::Conflict(_)) => {
                    debug!(
                        "Cluster {}/{} changed under attempt {}, retrying",
                        ns, name, attempt
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControllerError::Contention(self.max_retries))
    }

    // ==================== Shards ====================

    /// Append a shard; returns its index
    pub async fn create_shard(
        &self,
        ns: &str,
        cluster: &str,
        nodes: &[String],
        password: Option<String>,
    ) -> Result<usize> {
        let (index, _) = self
            .update_cluster(ns, cluster, |c| c.add_shard(nodes, password.clone()))
            .await?;
        info!("Created shard {} in {}/{}", index, ns, cluster);
        Ok(index)
    }

    pub async fn delete_shard(&self, ns: &str, cluster: &str, index: usize) -> Result<()> {
        self.update_cluster(ns, cluster, |c| c.remove_shard(index).map(|_| ()))
            .await?;
        info!("Deleted shard {} from {}/{}", index, ns, cluster);
        Ok(())
    }

    pub async fn list_shards(&self, ns: &str, cluster: &str) -> Result<Vec<ShardInfo>> {
        Ok(self.read_cluster(ns, cluster).await?.0.shards)
    }

    pub async fn get_shard(&self, ns: &str, cluster: &str, index: usize) -> Result<ShardInfo> {
        let (cluster, _) = self.read_cluster(ns, cluster).await?;
        cluster.shard(index).cloned()
    }

    // ==================== Nodes ====================

    pub async fn create_node(
        &self,
        ns: &str,
        cluster: &str,
        shard: usize,
        addr: &str,
        role: NodeRole,
        password: Option<String>,
    ) -> Result<NodeInfo> {
        let (node, _) = self
            .update_cluster(ns, cluster, |c| {
                c.add_node(shard, addr, role, password.clone())
            })
            .await?;
        info!(
            "Added {} node {} ({}) to shard {} of {}/{}",
            node.role, node.id, node.addr, shard, ns, cluster
        );
        Ok(node)
    }

    pub async fn delete_node(
        &self,
        ns: &str,
        cluster: &str,
        shard: usize,
        node_id: &str,
    ) -> Result<()> {
        self.update_cluster(ns, cluster, |c| c.remove_node(shard, node_id).map(|_| ()))
            .await?;
        info!("Removed node {} from shard {} of {}/{}", node_id, shard, ns, cluster);
        Ok(())
    }

    pub async fn list_nodes(&self, ns: &str, cluster: &str, shard: usize) -> Result<Vec<NodeInfo>> {
        Ok(self.get_shard(ns, cluster, shard).await?.nodes)
    }

    // ==================== Detection records ====================

    pub async fn save_window(
        &self,
        ns: &str,
        cluster: &str,
        node_id: &str,
        window: &ProbeWindow,
    ) -> Result<()> {
        let value = serde_json::to_vec(window)?;
        self.store
            .put(&self.keys.window(ns, cluster, node_id), &value)
            .await?;
        Ok(())
    }

    pub async fn clear_window(&self, ns: &str, cluster: &str, node_id: &str) -> Result<()> {
        self.store
            .delete(&self.keys.window(ns, cluster, node_id))
            .await?;
        Ok(())
    }

    /// Persisted windows of a cluster, keyed by node id
    pub async fn load_windows(&self, ns: &str, cluster: &str) -> Result<Vec<(String, ProbeWindow)>> {
        let entries = self.store.list(&self.keys.windows(ns, cluster)).await?;
        entries
            .into_iter()
            .map(|(key, raw)| -> Result<(String, ProbeWindow)> {
                Ok((leaf(&key).to_string(), serde_json::from_slice(&raw)?))
            })
            .collect()
    }

    pub async fn put_observation(
        &self,
        ns: &str,
        cluster: &str,
        node_id: &str,
        observation: &Observation,
    ) -> Result<()> {
        let value = serde_json::to_vec(observation)?;
        self.store
            .put(
                &self.keys.vote(ns, cluster, node_id, &observation.observer),
                &value,
            )
            .await?;
        Ok(())
    }

    pub async fn list_observations(
        &self,
        ns: &str,
        cluster: &str,
        node_id: &str,
    ) -> Result<Vec<Observation>> {
        let entries = self.store.list(&self.keys.votes(ns, cluster, node_id)).await?;
        entries
            .into_iter()
            .map(|(_, raw)| -> Result<Observation> { Ok(serde_json::from_slice(&raw)?) })
            .collect()
    }

    pub async fn clear_observations(&self, ns: &str, cluster: &str, node_id: &str) -> Result<()> {
        for (key, _) in self.store.list(&self.keys.votes(ns, cluster, node_id)).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::metadata::SlotRange;
    use crate::store::{LockWatch, MemoryStore, StoreResult};

    fn repo() -> TopologyRepository {
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
        TopologyRepository::new(store, Keys::new("/test", "/detect"), 4)
    }

    fn addrs(ports: &[u16]) -> Vec<String> {
        ports.iter().map(|p| format!("127.0.0.1:{}", p)).collect()
    }

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let repo = repo();
        repo.create_namespace("ns1").await.unwrap();
        repo.create_namespace("ns2").await.unwrap();
        assert!(matches!(
            repo.create_namespace("ns1").await,
            Err(ControllerError::AlreadyExists(_))
        ));
        assert!(matches!(
            repo.create_namespace("bad name").await,
            Err(ControllerError::Validation(_))
        ));
        assert_eq!(repo.list_namespaces().await.unwrap(), vec!["ns1", "ns2"]);

        repo.create_cluster("ns1", "c", &addrs(&[7000]), 0, None)
            .await
            .unwrap();
        assert!(matches!(
            repo.delete_namespace("ns1").await,
            Err(ControllerError::NotEmpty(_))
        ));
        repo.delete_cluster("ns1", "c").await.unwrap();
        repo.delete_namespace("ns1").await.unwrap();
        assert!(matches!(
            repo.delete_namespace("ns1").await,
            Err(ControllerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_cluster_requires_namespace() {
        let repo = repo();
        assert!(matches!(
            repo.create_cluster("missing", "c", &addrs(&[7000]), 0, None).await,
            Err(ControllerError::NotFound(_))
        ));
        repo.create_namespace("ns").await.unwrap();
        let cluster = repo
            .create_cluster("ns", "c", &addrs(&[7000, 7001, 7002, 7003]), 1, None)
            .await
            .unwrap();
        assert_eq!(cluster.version, 1);
        assert_eq!(cluster.shards.len(), 2);
        assert!(cluster.is_fully_assigned());
        assert!(matches!(
            repo.create_cluster("ns", "c", &addrs(&[7100]), 0, None).await,
            Err(ControllerError::AlreadyExists(_))
        ));
        assert_eq!(repo.get_cluster("ns", "c").await.unwrap(), cluster);
    }

    #[tokio::test]
    async fn test_mutations_bump_version_once() {
        let repo = repo();
        repo.create_namespace("ns").await.unwrap();
        repo.create_cluster("ns", "c", &addrs(&[7000]), 0, None)
            .await
            .unwrap();

        let index = repo
            .create_shard("ns", "c", &addrs(&[7001, 7002]), None)
            .await
            .unwrap();
        assert_eq!(index, 1);
        let shard = repo.get_shard("ns", "c", 1).await.unwrap();
        assert_eq!(shard.nodes.len(), 2);
        assert!(shard.slot_ranges.is_empty());

        let node = repo
            .create_node("ns", "c", 1, "127.0.0.1:7003", NodeRole::Replica, None)
            .await
            .unwrap();
        assert_eq!(repo.list_nodes("ns", "c", 1).await.unwrap().len(), 3);

        let master = shard.master_id().unwrap().clone();
        assert!(matches!(
            repo.delete_node("ns", "c", 1, &master).await,
            Err(ControllerError::CannotDeleteMaster(_))
        ));
        repo.delete_node("ns", "c", 1, &node.id).await.unwrap();

        assert!(matches!(
            repo.delete_shard("ns", "c", 0).await,
            Err(ControllerError::SlotsStillAssigned(0))
        ));
        repo.delete_shard("ns", "c", 1).await.unwrap();

        // create_shard, create_node, delete_node, delete_shard
        assert_eq!(repo.get_cluster("ns", "c").await.unwrap().version, 5);
    }

    #[tokio::test]
    async fn test_update_without_change_keeps_version() {
        let repo = repo();
        repo.create_namespace("ns").await.unwrap();
        repo.create_cluster("ns", "c", &addrs(&[7000, 7001]), 0, None)
            .await
            .unwrap();
        let range = SlotRange::single(100).unwrap();
        let (changed, cluster) = repo
            .update_cluster("ns", "c", |c| c.commit_migration(0, range))
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(cluster.version, 1);
    }

    /// Store that, once armed, runs an action right after the next write to a key
    #[derive(Default)]
    struct Interleaved {
        inner: MemoryStore,
        armed: parking_lot::Mutex<Option<(String, Interleave)>>,
    }

    enum Interleave {
        Put(String, Vec<u8>),
        Delete(String),
    }

    impl Interleaved {
        fn arm(&self, trigger: String, action: Interleave) {
            *self.armed.lock() = Some((trigger, action));
        }

        async fn after_write(&self, key: &str) -> StoreResult<()> {
            let action = {
                let mut armed = self.armed.lock();
                match armed.as_ref() {
                    Some((trigger, _)) if trigger == key => armed.take().map(|(_, a)| a),
                    _ => None,
                }
            };
            match action {
                Some(Interleave::Put(key, value)) => self.inner.put(&key, &value).await,
                Some(Interleave::Delete(key)) => self.inner.delete(&key).await,
                None => Ok(()),
            }
        }
    }

    #[async_trait::async_trait]
    impl MetadataStore for Interleaved {
        fn backend(&self) -> &'static str {
            "interleaved"
        }
        async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
            self.inner.put(key, value).await?;
            self.after_write(key).await
        }
        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.inner.delete(key).await?;
            self.after_write(key).await
        }
        async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
            self.inner.list(prefix).await
        }
        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&[u8]>,
            value: &[u8],
        ) -> StoreResult<()> {
            self.inner.compare_and_swap(key, expected, value).await?;
            self.after_write(key).await
        }
        async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
            self.inner.acquire_lock(name, holder, ttl).await
        }
        async fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
            self.inner.renew_lock(name, holder, ttl).await
        }
        async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
            self.inner.release_lock(name, holder).await
        }
        async fn watch_lock(&self, name: &str) -> StoreResult<LockWatch> {
            self.inner.watch_lock(name).await
        }
    }

    #[tokio::test]
    async fn test_delete_namespace_loses_to_concurrent_cluster() {
        let keys = Keys::new("/test", "/detect");
        let cluster = ClusterInfo::create("c", &addrs(&[7000]), 0, None).unwrap();
        let store = Arc::new(Interleaved::default());
        let repo = TopologyRepository::new(store.clone(), keys.clone(), 4);
        repo.create_namespace("ns").await.unwrap();
        // a cluster lands right after the namespace record is deleted
        store.arm(
            keys.namespace("ns"),
            Interleave::Put(keys.cluster("ns", "c"), serde_json::to_vec(&cluster).unwrap()),
        );

        assert!(matches!(
            repo.delete_namespace("ns").await,
            Err(ControllerError::NotEmpty(_))
        ));
        assert_eq!(repo.list_namespaces().await.unwrap(), vec!["ns"]);
        assert_eq!(repo.get_cluster("ns", "c").await.unwrap(), cluster);
    }

    #[tokio::test]
    async fn test_create_cluster_loses_to_concurrent_namespace_delete() {
        let keys = Keys::new("/test", "/detect");
        let store = Arc::new(Interleaved::default());
        let repo = TopologyRepository::new(store.clone(), keys.clone(), 4);
        repo.create_namespace("ns").await.unwrap();
        // the namespace goes right after the cluster record is written
        store.arm(keys.cluster("ns", "c"), Interleave::Delete(keys.namespace("ns")));

        assert!(matches!(
            repo.create_cluster("ns", "c", &addrs(&[7000]), 0, None).await,
            Err(ControllerError::NotFound(_))
        ));
        assert!(matches!(
            repo.get_cluster("ns", "c").await,
            Err(ControllerError::NotFound(_))
        ));
        assert!(repo.list_namespaces().await.unwrap().is_empty());
    }

    /// Loses every compare-and-swap against an existing record
    struct AlwaysRacing {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl MetadataStore for AlwaysRacing {
        fn backend(&self) -> &'static str {
            "racing"
        }
        async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
            self.inner.put(key, value).await
        }
        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
            self.inner.list(prefix).await
        }
        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&[u8]>,
            value: &[u8],
        ) -> StoreResult<()> {
            match expected {
                Some(_) => Err(StoreError::Conflict(key.to_string())),
                None => self.inner.compare_and_swap(key, None, value).await,
            }
        }
        async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
            self.inner.acquire_lock(name, holder, ttl).await
        }
        async fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
            self.inner.renew_lock(name, holder, ttl).await
        }
        async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
            self.inner.release_lock(name, holder).await
        }
        async fn watch_lock(&self, name: &str) -> StoreResult<LockWatch> {
            self.inner.watch_lock(name).await
        }
    }

    #[tokio::test]
    async fn test_contention_after_bounded_retries() {
        let store: Arc<dyn MetadataStore> = Arc::new(AlwaysRacing {
            inner: MemoryStore::new(),
        });
        let repo = TopologyRepository::new(store, Keys::new("/test", "/detect"), 3);
        repo.create_namespace("ns").await.unwrap();
        repo.create_cluster("ns", "c", &addrs(&[7000]), 0, None)
            .await
            .unwrap();

        let mut attempts = 0;
        let result = repo
            .update_cluster("ns", "c", |c| {
                attempts += 1;
                c.add_shard(&[], None)
            })
            .await;
        assert_eq!(result.unwrap_err(), ControllerError::Contention(3));
        assert_eq!(attempts, 3);

        let cluster = repo.get_cluster("ns", "c").await.unwrap();
        assert_eq!(cluster.version, 1);
        assert_eq!(cluster.shards.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_hidden() {
        let memory = MemoryStore::new();
        let store: Arc<dyn MetadataStore> = Arc::new(memory.clone());
        let repo = TopologyRepository::new(store, Keys::new("/test", "/detect"), 3);
        repo.create_namespace("ns").await.unwrap();
        memory.set_available(false);
        let err = repo.list_namespaces().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unavailable);
    }
}
