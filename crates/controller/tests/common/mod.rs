//! Shared fixtures: in-memory store and a scripted node RPC double

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use controller::election::LeaderState;
use controller::failover::FailoverOrchestrator;
use controller::metadata::{ClusterInfo, NodeInfo, SlotRange};
use controller::node_client::{MigrationProgress, NodeRpc, NodeRpcError, NodeRpcResult};
use controller::store::{MemoryStore, MetadataStore};
use controller::{Config, Controller};

/// Node RPC double: every node answers unless marked down
pub struct ScriptedRpc {
    down: Mutex<HashSet<String>>,
    progress: Mutex<MigrationProgress>,
    calls: Mutex<Vec<String>>,
    promote_gate: Mutex<Option<Arc<Notify>>>,
    promote_parked: Notify,
}

impl ScriptedRpc {
    pub fn new() -> Self {
        Self {
            down: Mutex::new(HashSet::new()),
            progress: Mutex::new(MigrationProgress::InProgress),
            calls: Mutex::new(Vec::new()),
            promote_gate: Mutex::new(None),
            promote_parked: Notify::new(),
        }
    }

    /// Park promote calls until the returned gate is notified
    pub fn hold_promotions(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.promote_gate.lock() = Some(gate.clone());
        gate
    }

    /// Resolves once a promote call is parked at the gate
    pub async fn promotion_parked(&self) {
        self.promote_parked.notified().await;
    }

    pub fn set_down(&self, addr: &str, down: bool) {
        let mut set = self.down.lock();
        if down {
            set.insert(addr.to_string());
        } else {
            set.remove(addr);
        }
    }

    pub fn set_progress(&self, progress: MigrationProgress) {
        *self.progress.lock() = progress;
    }

    /// Recorded calls, e.g. `promote 127.0.0.1:7001`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn reach(&self, node: &NodeInfo) -> NodeRpcResult<()> {
        if self.down.lock().contains(&node.addr) {
            Err(NodeRpcError::Timeout(node.addr.clone()))
        } else {
            Ok(())
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl NodeRpc for ScriptedRpc {
    async fn ping(&self, node: &NodeInfo) -> NodeRpcResult<()> {
        self.reach(node)
    }

    async fn promote(&self, node: &NodeInfo) -> NodeRpcResult<()> {
        self.reach(node)?;
        let gate = self.promote_gate.lock().clone();
        if let Some(gate) = gate {
            self.promote_parked.notify_one();
            gate.notified().await;
        }
        self.record(format!("promote {}", node.addr));
        Ok(())
    }

    async fn demote(&self, node: &NodeInfo, master: &NodeInfo) -> NodeRpcResult<()> {
        self.reach(node)?;
        self.record(format!("demote {} {}", node.addr, master.addr));
        Ok(())
    }

    async fn set_topology(&self, node: &NodeInfo, _nodes: &str, version: u64) -> NodeRpcResult<()> {
        self.reach(node)?;
        self.record(format!("topology {} {}", node.addr, version));
        Ok(())
    }

    async fn start_migration(
        &self,
        source: &NodeInfo,
        range: SlotRange,
        target_id: &str,
    ) -> NodeRpcResult<()> {
        self.reach(source)?;
        self.record(format!("migrate {} {} {}", source.addr, range, target_id));
        Ok(())
    }

    async fn migration_status(
        &self,
        source: &NodeInfo,
        _range: SlotRange,
    ) -> NodeRpcResult<MigrationProgress> {
        self.reach(source)?;
        Ok(*self.progress.lock())
    }
}

pub fn addrs(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("127.0.0.1:{}", 7000 + i)).collect()
}

/// Short timings so background work finishes within a test
pub fn test_config(id: &str) -> Config {
    let mut config = Config::default();
    config.controller_id = Some(id.to_string());
    config.election.lease_ttl_secs = 2;
    config.failover.max_ping_count = 3;
    config.failover.ping_interval_seconds = 60;
    config.multi_detect.window_periods = 3;
    config.migration.poll_interval_ms = 20;
    config.migration.transfer_timeout_secs = 5;
    config
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub rpc: Arc<ScriptedRpc>,
    pub controller: Arc<Controller>,
}

impl Fixture {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: Arc<MemoryStore>) -> Self {
        let rpc = Arc::new(ScriptedRpc::new());
        let controller = Controller::with_parts(
            config,
            store.clone() as Arc<dyn MetadataStore>,
            rpc.clone() as Arc<dyn NodeRpc>,
        );
        Self {
            store,
            rpc,
            controller,
        }
    }

    /// Namespace `ns` with cluster `demo` over `nodes` addresses
    pub async fn demo(&self, nodes: usize, replicas: usize) -> ClusterInfo {
        self.controller.create_namespace("ns").await.unwrap();
        self.controller
            .create_cluster("ns", "demo", &addrs(nodes), replicas, None)
            .await
            .unwrap()
    }

    /// Failover orchestrator over this fixture that always sees itself Active
    pub fn active_failover(&self) -> FailoverOrchestrator {
        let (_, leadership) = watch::channel(LeaderState::Active);
        FailoverOrchestrator::new(
            self.controller.repository().clone(),
            self.rpc.clone() as Arc<dyn NodeRpc>,
            self.controller.detector().health().clone(),
            leadership,
        )
    }

    /// Start the controller and wait until it leads
    pub async fn lead(&self) {
        self.controller.start();
        wait_for(|| self.controller.is_leader(), Duration::from_secs(3)).await;
    }
}

/// Poll `condition` until it holds; panics after `limit`
pub async fn wait_for(mut condition: impl FnMut() -> bool, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {:?}",
            limit
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll cluster `ns/demo` until `condition` holds; panics after three seconds
pub async fn demo_until(controller: &Controller, condition: impl Fn(&ClusterInfo) -> bool) -> ClusterInfo {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let cluster = controller.get_cluster("ns", "demo").await.unwrap();
        if condition(&cluster) {
            return cluster;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cluster never reached the expected state: {:?}",
            cluster
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
