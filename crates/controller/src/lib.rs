//! Controller - control plane for a sharded, replicated key-value cluster
//!
//! Owns the authoritative topology (namespaces, clusters, shards, nodes and
//! slot assignment), detects failed masters, promotes replacements and
//! drives slot migration between shards.
//!
//! # Features
//! - Pluggable metadata stores (memory, etcd, ZooKeeper, raft log, Consul, SQL)
//! - Topology CRUD with optimistic, version-checked updates
//! - Lease-based leader election; only the leader detects and repairs
//! - Quorum-gated failure detection and failover
//! - Crash-safe slot migration
//!
//! # Usage Example
//! ```ignore
//! use controller::{Config, Controller};
//!
//! let controller = Controller::new(Config::default()).await?;
//! controller.start();
//! ```

pub mod api;
pub mod config;
pub mod detector;
pub mod election;
pub mod error;
pub mod failover;
pub mod metadata;
pub mod migration;
pub mod node_client;
pub mod repository;
pub mod store;

pub use config::Config;
pub use error::{ControllerError, ErrorKind, Result};

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use detector::{FailureDetector, HealthTable, Observation};
use election::{LeaderElection, LeaderState};
use failover::{FailoverOrchestrator, FailoverRequest};
use metadata::{ClusterInfo, NamespaceInfo, NodeId, NodeInfo, NodeRole, ShardInfo, SlotRange};
use migration::{AbortOutcome, MigrationOrchestrator, MigrationTicket};
use node_client::{NodeRpc, RespNodeClient};
use repository::{Keys, TopologyRepository};
use store::MetadataStore;

/// Queue depth between the detector and the failover worker
const FAILOVER_QUEUE: usize = 64;

/// Who leads, as seen by this controller
#[derive(Debug, Clone, Serialize)]
pub struct LeaderInfo {
    pub id: String,
    pub state: LeaderState,
    pub leader: Option<String>,
}

/// Control plane instance
pub struct Controller {
    config: Config,
    repo: TopologyRepository,
    election: Arc<LeaderElection>,
    detector: Arc<FailureDetector>,
    failover: Arc<FailoverOrchestrator>,
    migration: Arc<MigrationOrchestrator>,
    shutdown: watch::Sender<bool>,
    election_task: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Tasks that only run while Active
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Validate `config`, connect the configured store and build the controller
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| ControllerError::validation(e.to_string()))?;
        let store = store::connect(&config.storage).await?;
        let rpc: Arc<dyn NodeRpc> = Arc::new(RespNodeClient::new(config.node_rpc.timeout()));
        Ok(Self::with_parts(config, store, rpc))
    }

    /// Build a controller over an existing store and node client
    pub fn with_parts(
        config: Config,
        store: Arc<dyn MetadataStore>,
        rpc: Arc<dyn NodeRpc>,
    ) -> Arc<Self> {
        let id = config.resolve_controller_id();
        let keys = Keys::new(&config.storage.prefix, &config.multi_detect.key_prefix);
        let repo = TopologyRepository::new(store.clone(), keys, config.repository.max_cas_retries);
        let election = Arc::new(LeaderElection::new(
            store,
            config.election.lock_name.clone(),
            id.clone(),
            config.election.lease_ttl(),
        ));
        let health = Arc::new(HealthTable::default());
        let detector = Arc::new(FailureDetector::new(
            repo.clone(),
            rpc.clone(),
            id,
            config.failover.clone(),
            config.multi_detect.clone(),
            health.clone(),
        ));
        let failover = Arc::new(FailoverOrchestrator::new(
            repo.clone(),
            rpc.clone(),
            health,
            election.subscribe(),
        ));
        let migration = Arc::new(MigrationOrchestrator::new(
            repo.clone(),
            rpc,
            config.migration.clone(),
            election.subscribe(),
        ));
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            config,
            repo,
            election,
            detector,
            failover,
            migration,
            shutdown,
            election_task: Mutex::new(None),
            supervisor: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn id(&self) -> &str {
        self.election.id()
    }

    pub fn repository(&self) -> &TopologyRepository {
        &self.repo
    }

    pub fn election(&self) -> &Arc<LeaderElection> {
        &self.election
    }

    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }

    pub fn failover_orchestrator(&self) -> &Arc<FailoverOrchestrator> {
        &self.failover
    }

    pub fn migration_orchestrator(&self) -> &Arc<MigrationOrchestrator> {
        &self.migration
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_active()
    }

    /// Join the election; leader-only work follows the election state
    pub fn start(self: &Arc<Self>) {
        let mut state = self.election.subscribe();
        let election = self.election.clone().start(self.shutdown.subscribe());

        let this = self.clone();
        let supervisor = tokio::spawn(async move {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    LeaderState::Active => this.activate(),
                    LeaderState::Standby => this.deactivate(),
                }
                if state.changed().await.is_err() {
                    this.deactivate();
                    return;
                }
            }
        });
        *self.election_task.lock() = Some(election);
        *self.supervisor.lock() = Some(supervisor);
        info!("Controller {} started", self.id());
    }

    fn activate(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        info!("Starting failure detection and orchestration");
        let (tx, rx) = mpsc::channel(FAILOVER_QUEUE);
        workers.push(self.detector.clone().start(tx));
        workers.push(self.failover.clone().start(self.detector.clone(), rx));

        let migration = self.migration.clone();
        workers.push(tokio::spawn(async move {
            match migration.resume_all().await {
                Ok(0) => {}
                Ok(n) => info!("Settled {} interrupted migrations", n),
                Err(e) => warn!("Failed to recover interrupted migrations: {}", e),
            }
        }));
    }

    fn deactivate(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        info!("Stopping failure detection and orchestration");
        for handle in workers {
            handle.abort();
        }
        self.migration.stop();
    }

    /// Leave the election and stop every task
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let election = self.election_task.lock().take();
        if let Some(handle) = election {
            if let Err(e) = handle.await {
                warn!("Election task failed: {}", e);
            }
        }
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.deactivate();
        info!("Controller {} stopped", self.id());
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(ControllerError::NotLeader)
        }
    }

    pub async fn leader_info(&self) -> Result<LeaderInfo> {
        Ok(LeaderInfo {
            id: self.id().to_string(),
            state: self.election.state(),
            leader: self.election.current_leader().await?,
        })
    }

    // ==================== Namespaces ====================

    pub async fn create_namespace(&self, name: &str) -> Result<NamespaceInfo> {
        self.repo.create_namespace(name).await
    }

    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.repo.delete_namespace(name).await
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.repo.list_namespaces().await
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
        self.repo
            .create_cluster(ns, name, nodes, replicas, password)
            .await
    }

    pub async fn delete_cluster(&self, ns: &str, name: &str) -> Result<()> {
        self.repo.delete_cluster(ns, name).await
    }

    pub async fn list_clusters(&self, ns: &str) -> Result<Vec<String>> {
        self.repo.list_clusters(ns).await
    }

    pub async fn get_cluster(&self, ns: &str, name: &str) -> Result<ClusterInfo> {
        self.repo.get_cluster(ns, name).await
    }

    // ==================== Shards ====================

    pub async fn create_shard(
        &self,
        ns: &str,
        cluster: &str,
        nodes: &[String],
        password: Option<String>,
    ) -> Result<usize> {
        self.repo.create_shard(ns, cluster, nodes, password).await
    }

    pub async fn delete_shard(&self, ns: &str, cluster: &str, index: usize) -> Result<()> {
        self.repo.delete_shard(ns, cluster, index).await
    }

    pub async fn list_shards(&self, ns: &str, cluster: &str) -> Result<Vec<ShardInfo>> {
        self.repo.list_shards(ns, cluster).await
    }

    pub async fn get_shard(&self, ns: &str, cluster: &str, index: usize) -> Result<ShardInfo> {
        self.repo.get_shard(ns, cluster, index).await
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
        self.repo
            .create_node(ns, cluster, shard, addr, role, password)
            .await
    }

    pub async fn delete_node(&self, ns: &str, cluster: &str, shard: usize, node_id: &str) -> Result<()> {
        self.repo.delete_node(ns, cluster, shard, node_id).await
    }

    pub async fn list_nodes(&self, ns: &str, cluster: &str, shard: usize) -> Result<Vec<NodeInfo>> {
        self.repo.list_nodes(ns, cluster, shard).await
    }

    // ==================== Leader-only operations ====================

    pub async fn migrate(
        &self,
        ns: &str,
        cluster: &str,
        target: usize,
        range: SlotRange,
        slot_only: bool,
    ) -> Result<MigrationTicket> {
        self.ensure_leader()?;
        self.migration
            .migrate(ns, cluster, target, range, slot_only)
            .await
    }

    pub async fn abort_migration(&self, ns: &str, cluster: &str, source: usize) -> Result<AbortOutcome> {
        self.ensure_leader()?;
        self.migration.abort_migration(ns, cluster, source).await
    }

    /// Replace the master of `shard`; returns the new master id
    pub async fn failover(
        &self,
        ns: &str,
        cluster: &str,
        shard: usize,
        preferred: Option<NodeId>,
    ) -> Result<NodeId> {
        self.ensure_leader()?;
        self.failover
            .failover(FailoverRequest::manual(ns, cluster, shard, preferred))
            .await
    }

    /// Record a peer detector's verdict on a node
    pub async fn record_observation(
        &self,
        ns: &str,
        cluster: &str,
        node_id: &str,
        observer: &str,
        down: bool,
    ) -> Result<Observation> {
        self.detector
            .record_observation(ns, cluster, node_id, observer, down)
            .await
    }
}
