//! Health and failure detection
//!
//! Every `ping_interval_seconds` the Active controller probes every node.
//! Master results feed a sliding [`ProbeWindow`]; a master with
//! `max_ping_count` consecutive failed probes is a failure candidate. With
//! multi-observer detection enabled the candidate is escalated only once a
//! quorum of fresh observations agrees it is down. Windows of failing masters
//! are persisted so a new leader resumes where the old one stopped.

mod quorum;
mod window;

pub use quorum::{Observation, QuorumPolicy, Tally};
pub use window::ProbeWindow;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::{FailoverConfig, MultiDetectConfig};
use crate::error::{ControllerError, Result};
use crate::failover::FailoverRequest;
use crate::metadata::{validate_name, NodeId, NodeInfo};
use crate::node_client::NodeRpc;
use crate::repository::TopologyRepository;
use crate::store::now_ms;

/// Latest probe outcome of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeHealth {
    pub reachable: bool,
    pub last_success_ms: Option<i64>,
}

/// Probe outcomes of every node, masters and replicas alike
#[derive(Debug, Default)]
pub struct HealthTable {
    nodes: RwLock<HashMap<NodeId, NodeHealth>>,
}

impl HealthTable {
    pub fn record(&self, node_id: &str, reachable: bool, now_ms: i64) {
        let mut nodes = self.nodes.write();
        let entry = nodes.entry(node_id.to_string()).or_insert(NodeHealth {
            reachable,
            last_success_ms: None,
        });
        entry.reachable = reachable;
        if reachable {
            entry.last_success_ms = Some(now_ms);
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeHealth> {
        self.nodes.read().get(node_id).copied()
    }

    /// Nodes never probed count as healthy
    pub fn is_healthy(&self, node_id: &str) -> bool {
        self.get(node_id).map_or(true, |h| h.reachable)
    }
}

/// (namespace, cluster, node id)
type NodeKey = (String, String, NodeId);

struct ProbeResult {
    namespace: String,
    cluster: String,
    shard: usize,
    node: NodeInfo,
    reachable: bool,
}

pub struct FailureDetector {
    repo: TopologyRepository,
    rpc: Arc<dyn NodeRpc>,
    observer_id: String,
    failover: FailoverConfig,
    detect: MultiDetectConfig,
    policy: QuorumPolicy,
    health: Arc<HealthTable>,
    windows: Mutex<HashMap<NodeKey, ProbeWindow>>,
    /// Candidates handed to the failover orchestrator and not yet released
    escalated: Mutex<HashSet<NodeKey>>,
}

impl FailureDetector {
    pub fn new(
        repo: TopologyRepository,
        rpc: Arc<dyn NodeRpc>,
        observer_id: impl Into<String>,
        failover: FailoverConfig,
        detect: MultiDetectConfig,
        health: Arc<HealthTable>,
    ) -> Self {
        let policy = QuorumPolicy::new(&detect.quorum);
        Self {
            repo,
            rpc,
            observer_id: observer_id.into(),
            failover,
            detect,
            policy,
            health,
            windows: Mutex::new(HashMap::new()),
            escalated: Mutex::new(HashSet::new()),
        }
    }

    pub fn health(&self) -> &Arc<HealthTable> {
        &self.health
    }

    fn capacity(&self) -> usize {
        self.detect.window_periods.max(self.failover.max_ping_count)
    }

    pub fn window(&self, ns: &str, cluster: &str, node_id: &str) -> Option<ProbeWindow> {
        self.windows
            .lock()
            .get(&(ns.to_string(), cluster.to_string(), node_id.to_string()))
            .cloned()
    }

    /// Reload persisted windows; returns how many were found
    pub async fn resume(&self) -> Result<usize> {
        let capacity = self.capacity();
        let mut loaded = HashMap::new();
        for (ns, cluster) in self.repo.all_clusters().await? {
            for (node_id, mut window) in self.repo.load_windows(&ns, &cluster.name).await? {
                window.resize(capacity);
                loaded.insert((ns.clone(), cluster.name.clone(), node_id), window);
            }
        }
        let count = loaded.len();
        *self.windows.lock() = loaded;
        self.escalated.lock().clear();
        if count > 0 {
            info!("Resumed {} pending failure detections", count);
        }
        Ok(count)
    }

    /// Mark an escalated candidate as handled
    ///
    /// After a failed failover the node may be escalated again on a later
    /// round; after a successful one its detection state is dropped.
    pub fn release(&self, ns: &str, cluster: &str, node_id: &str, replaced: bool) {
        let key = (ns.to_string(), cluster.to_string(), node_id.to_string());
        self.escalated.lock().remove(&key);
        if replaced {
            self.windows.lock().remove(&key);
        }
    }

    /// Record a peer's verdict on a node
    pub async fn record_observation(
        &self,
        ns: &str,
        cluster: &str,
        node_id: &str,
        observer: &str,
        down: bool,
    ) -> Result<Observation> {
        validate_name("observer", observer)?;
        let info = self.repo.get_cluster(ns, cluster).await?;
        if info.find_node(node_id).is_none() {
            return Err(ControllerError::not_found(format!("node {}", node_id)));
        }
        let observation = Observation {
            observer: observer.to_string(),
            down,
            observed_at_ms: now_ms(),
        };
        self.repo
            .put_observation(ns, cluster, node_id, &observation)
            .await?;
        debug!(
            "Observer {} reports node {} of {}/{} {}",
            observer,
            node_id,
            ns,
            cluster,
            if down { "down" } else { "up" }
        );
        Ok(observation)
    }

    async fn probe_all(&self) -> Result<Vec<ProbeResult>> {
        let timeout = self.failover.probe_timeout();
        let mut probes = JoinSet::new();
        for (ns, cluster) in self.repo.all_clusters().await? {
            for (index, shard) in cluster.shards.iter().enumerate() {
                for node in &shard.nodes {
                    let rpc = self.rpc.clone();
                    let result = ProbeResult {
                        namespace: ns.clone(),
                        cluster: cluster.name.clone(),
                        shard: index,
                        node: node.clone(),
                        reachable: false,
                    };
                    probes.spawn(async move {
                        let outcome = tokio::time::timeout(timeout, rpc.ping(&result.node)).await;
                        ProbeResult {
                            reachable: matches!(outcome, Ok(Ok(()))),
                            ..result
                        }
                    });
                }
            }
        }

        let mut results = Vec::with_capacity(probes.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }
        Ok(results)
    }

    /// Probe every node once; returns the failovers to start
    pub async fn probe_round(&self) -> Result<Vec<FailoverRequest>> {
        let results = self.probe_all().await?;
        let now = now_ms();
        let capacity = self.capacity();
        let mut seen = HashSet::new();
        let mut requests = Vec::new();

        for result in results {
            self.health.record(&result.node.id, result.reachable, now);
            debug!(
                "Probe {} ({}): {}",
                result.node.id,
                result.node.addr,
                if result.reachable { "ok" } else { "unreachable" }
            );
            if !result.node.is_master() {
                continue;
            }

            let key = (
                result.namespace.clone(),
                result.cluster.clone(),
                result.node.id.clone(),
            );
            seen.insert(key.clone());
            let (before, window) = {
                let mut windows = self.windows.lock();
                let window = windows
                    .entry(key.clone())
                    .or_insert_with(|| ProbeWindow::new(capacity));
                let before = window.consecutive_failures();
                window.record(result.reachable, now);
                (before, window.clone())
            };

            if result.reachable {
                if before > 0 {
                    info!(
                        "Master {} of {}/{} answers again after {} failed probes",
                        result.node.addr, result.namespace, result.cluster, before
                    );
                    self.escalated.lock().remove(&key);
                    self.repo
                        .clear_window(&result.namespace, &result.cluster, &result.node.id)
                        .await?;
                }
                continue;
            }
            self.repo
                .save_window(&result.namespace, &result.cluster, &result.node.id, &window)
                .await?;

            if !window.is_candidate(self.failover.max_ping_count)
                || self.escalated.lock().contains(&key)
            {
                continue;
            }
            if !self.confirmed(&result, now).await? {
                continue;
            }
            self.escalated.lock().insert(key);
            requests.push(FailoverRequest {
                namespace: result.namespace,
                cluster: result.cluster,
                shard: result.shard,
                failed_master: Some(result.node.id),
                preferred: None,
            });
        }

        self.forget_unseen(&seen).await;
        Ok(requests)
    }

    /// Quorum gate for a local failure candidate
    async fn confirmed(&self, result: &ProbeResult, now: i64) -> Result<bool> {
        if !self.detect.enabled {
            warn!(
                "Master {} of {}/{} failed {} consecutive probes",
                result.node.addr, result.namespace, result.cluster, self.failover.max_ping_count
            );
            return Ok(true);
        }

        let own = Observation {
            observer: self.observer_id.clone(),
            down: true,
            observed_at_ms: now,
        };
        self.repo
            .put_observation(&result.namespace, &result.cluster, &result.node.id, &own)
            .await?;
        let peers = self
            .repo
            .list_observations(&result.namespace, &result.cluster, &result.node.id)
            .await?;
        let max_age = i64::try_from(self.detect.aggregate_interval_ms).unwrap_or(i64::MAX);
        let tally = Tally::collect(&self.observer_id, true, &peers, now, max_age);

        if self.policy.reached(tally) {
            warn!(
                "Quorum confirms master {} of {}/{} is down ({}/{} observations)",
                result.node.addr, result.namespace, result.cluster, tally.down, tally.total
            );
            return Ok(true);
        }
        if self.detect.require_quorum_on_promotion {
            info!(
                "Master {} of {}/{} looks down locally, waiting for quorum ({}/{} observations)",
                result.node.addr, result.namespace, result.cluster, tally.down, tally.total
            );
            return Ok(false);
        }
        warn!(
            "Master {} of {}/{} looks down without quorum ({}/{}), escalating anyway",
            result.node.addr, result.namespace, result.cluster, tally.down, tally.total
        );
        Ok(true)
    }

    /// Drop detection state of nodes that are no longer masters
    async fn forget_unseen(&self, seen: &HashSet<NodeKey>) {
        let stale: Vec<NodeKey> = {
            let mut windows = self.windows.lock();
            let stale = windows
                .keys()
                .filter(|k| !seen.contains(*k))
                .cloned()
                .collect::<Vec<_>>();
            for key in &stale {
                windows.remove(key);
            }
            stale
        };
        for (ns, cluster, node_id) in stale {
            self.escalated
                .lock()
                .remove(&(ns.clone(), cluster.clone(), node_id.clone()));
            if let Err(e) = self.repo.clear_window(&ns, &cluster, &node_id).await {
                warn!("Failed to clear probe window of {}: {}", node_id, e);
            }
            if let Err(e) = self.repo.clear_observations(&ns, &cluster, &node_id).await {
                warn!("Failed to clear observations of {}: {}", node_id, e);
            }
        }
    }

    /// Probe periodically, sending confirmed failures to `requests`
    pub fn start(self: Arc<Self>, requests: mpsc::Sender<FailoverRequest>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.resume().await {
                warn!("Failed to resume failure detection state: {}", e);
            }
            let mut ticker = tokio::time::interval(self.failover.ping_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.probe_round().await {
                    Ok(found) => {
                        for request in found {
                            if requests.send(request).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Probe round aborted: {}", e),
                }
            }
        })
    }
}
