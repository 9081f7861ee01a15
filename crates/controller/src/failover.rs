//! Failover orchestration
//!
//! Per shard: `Stable -> Suspect -> Promoting -> Stable`, or `Aborted` on
//! any failure. The role swap is a single cluster CAS, so an aborted
//! failover leaves no partial role change behind. Leadership is checked
//! again before the promotion and inside that CAS; a controller demoted
//! mid-way rolls the promoted node back and reports `LockLost`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::detector::{FailureDetector, HealthTable};
use crate::election::{ensure_active, LeaderState};
use crate::error::{ControllerError, Result};
use crate::metadata::{NodeId, NodeInfo, ShardInfo};
use crate::node_client::{broadcast_topology, NodeRpc};
use crate::repository::TopologyRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverState {
    Stable,
    Suspect,
    Promoting,
    Aborted,
}

impl std::fmt::Display for FailoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverState::Stable => write!(f, "stable"),
            FailoverState::Suspect => write!(f, "suspect"),
            FailoverState::Promoting => write!(f, "promoting"),
            FailoverState::Aborted => write!(f, "aborted"),
        }
    }
}

/// A request to replace a shard master
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverRequest {
    pub namespace: String,
    pub cluster: String,
    pub shard: usize,
    /// Master judged down by the detector; `None` for manual requests
    pub failed_master: Option<NodeId>,
    /// Replica the operator would like promoted
    pub preferred: Option<NodeId>,
}

impl FailoverRequest {
    pub fn manual(
        namespace: impl Into<String>,
        cluster: impl Into<String>,
        shard: usize,
        preferred: Option<NodeId>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            cluster: cluster.into(),
            shard,
            failed_master: None,
            preferred,
        }
    }
}

type ShardKey = (String, String, usize);

/// Best replica to promote: most recent successful probe, then lowest id
///
/// Replicas whose last probe failed are not eligible.
pub fn rank_replicas<'a>(shard: &'a ShardInfo, health: &HealthTable) -> Option<&'a NodeInfo> {
    let mut candidates: Vec<&NodeInfo> = shard
        .replicas()
        .filter(|n| health.is_healthy(&n.id))
        .collect();
    candidates.sort_by(|a, b| {
        let last_a = health.get(&a.id).and_then(|h| h.last_success_ms);
        let last_b = health.get(&b.id).and_then(|h| h.last_success_ms);
        last_b.cmp(&last_a).then_with(|| a.id.cmp(&b.id))
    });
    candidates.first().copied()
}

/// Resets the shard's state when the attempt ends
struct InFlight<'a> {
    states: &'a Mutex<HashMap<ShardKey, FailoverState>>,
    key: ShardKey,
}

impl InFlight<'_> {
    fn set(&self, state: FailoverState) {
        self.states.lock().insert(self.key.clone(), state);
        info!(
            "Failover of {}/{} shard {}: {}",
            self.key.0, self.key.1, self.key.2, state
        );
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.states.lock().remove(&self.key);
    }
}

pub struct FailoverOrchestrator {
    repo: TopologyRepository,
    rpc: Arc<dyn NodeRpc>,
    health: Arc<HealthTable>,
    leadership: watch::Receiver<LeaderState>,
    states: Mutex<HashMap<ShardKey, FailoverState>>,
}

impl FailoverOrchestrator {
    pub fn new(
        repo: TopologyRepository,
        rpc: Arc<dyn NodeRpc>,
        health: Arc<HealthTable>,
        leadership: watch::Receiver<LeaderState>,
    ) -> Self {
        Self {
            repo,
            rpc,
            health,
            leadership,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, ns: &str, cluster: &str, shard: usize) -> FailoverState {
        self.states
            .lock()
            .get(&(ns.to_string(), cluster.to_string(), shard))
            .copied()
            .unwrap_or(FailoverState::Stable)
    }

    fn enter(&self, key: ShardKey) -> Result<InFlight<'_>> {
        let mut states = self.states.lock();
        if states.contains_key(&key) {
            return Err(ControllerError::FailoverInProgress(key.2));
        }
        states.insert(key.clone(), FailoverState::Suspect);
        drop(states);
        info!("Failover of {}/{} shard {}: suspect", key.0, key.1, key.2);
        Ok(InFlight {
            states: &self.states,
            key,
        })
    }

    /// Replace the master of a shard; returns the new master id
    pub async fn failover(&self, request: FailoverRequest) -> Result<NodeId> {
        let key = (
            request.namespace.clone(),
            request.cluster.clone(),
            request.shard,
        );
        let in_flight = self.enter(key)?;
        match self.promote(&request, &in_flight).await {
            Ok(new_master) => {
                in_flight.set(FailoverState::Stable);
                Ok(new_master)
            }
            Err(e) => {
                warn!(
                    "Failover of {}/{} shard {} aborted: {}",
                    request.namespace, request.cluster, request.shard, e
                );
                in_flight.set(FailoverState::Aborted);
                Err(e)
            }
        }
    }

    async fn select_target(&self, shard: &ShardInfo, request: &FailoverRequest) -> Result<NodeInfo> {
        if let Some(preferred) = &request.preferred {
            let node = shard
                .node(preferred)
                .ok_or_else(|| ControllerError::not_found(format!("node {}", preferred)))?;
            if node.is_master() {
                return Err(ControllerError::validation(format!(
                    "node {} is already the master",
                    preferred
                )));
            }
            match self.rpc.ping(node).await {
                Ok(()) => return Ok(node.clone()),
                Err(e) => warn!(
                    "Preferred replica {} is unreachable ({}), picking another",
                    node.addr, e
                ),
            }
        }
        rank_replicas(shard, &self.health)
            .filter(|n| request.preferred.as_deref() != Some(n.id.as_str()))
            .cloned()
            .ok_or(ControllerError::NoEligibleReplica(request.shard))
    }

    async fn promote(&self, request: &FailoverRequest, in_flight: &InFlight<'_>) -> Result<NodeId> {
        let ns = request.namespace.as_str();
        let name = request.cluster.as_str();
        let cluster = self.repo.get_cluster(ns, name).await?;
        let shard = cluster.shard(request.shard)?;
        let old_master = shard
            .master()
            .cloned()
            .ok_or(ControllerError::NoEligibleReplica(request.shard))?;
        if let Some(failed) = &request.failed_master {
            if *failed != old_master.id {
                info!(
                    "Master {} of {}/{} shard {} was already replaced by {}",
                    failed, ns, name, request.shard, old_master.id
                );
                return Ok(old_master.id);
            }
        }

        let target = self.select_target(shard, request).await?;
        ensure_active(&self.leadership)?;
        in_flight.set(FailoverState::Promoting);
        info!(
            "Promoting {} ({}) over {} ({}) in {}/{} shard {}",
            target.id, target.addr, old_master.id, old_master.addr, ns, name, request.shard
        );
        self.rpc.promote(&target).await?;

        // Fence: best effort, the node's own epoch check covers an unreachable master
        if let Err(e) = self.rpc.demote(&old_master, &target).await {
            warn!("Could not step down old master {}: {}", old_master.addr, e);
        }

        let index = request.shard;
        let swap = self
            .repo
            .update_cluster(ns, name, |c| {
                ensure_active(&self.leadership)?;
                let shard = c.shard(index)?;
                if shard.master_id() != Some(&old_master.id) {
                    return Err(ControllerError::Conflict(format!(
                        "master of shard {} changed during failover",
                        index
                    )));
                }
                c.promote(index, &target.id)
            })
            .await;
        let (_, updated) = match swap {
            Ok(result) => result,
            Err(e) => {
                // Roll the node back; the record still names the old master
                if let Err(undo) = self.rpc.demote(&target, &old_master).await {
                    warn!("Could not roll back promotion of {}: {}", target.addr, undo);
                }
                return Err(e);
            }
        };

        info!(
            "Shard {} of {}/{} failed over to {}, version {}",
            index, ns, name, target.id, updated.version
        );
        broadcast_topology(self.rpc.as_ref(), &updated).await;
        Ok(target.id)
    }

    /// Serve detector requests until the channel closes
    ///
    /// Attempts belong to the returned task; aborting it aborts them too.
    pub fn start(
        self: Arc<Self>,
        detector: Arc<FailureDetector>,
        mut requests: mpsc::Receiver<FailoverRequest>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // different shards fail over in parallel
            let mut attempts = JoinSet::new();
            loop {
                tokio::select! {
                    request = requests.recv() => {
                        let Some(request) = request else { break };
                        let orchestrator = self.clone();
                        let detector = detector.clone();
                        attempts.spawn(async move {
                            let result = orchestrator.failover(request.clone()).await;
                            if let Some(failed) = &request.failed_master {
                                detector.release(
                                    &request.namespace,
                                    &request.cluster,
                                    failed,
                                    result.is_ok(),
                                );
                            }
                        });
                    }
                    Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                        if let Err(e) = joined {
                            warn!("Failover task failed: {}", e);
                        }
                    }
                }
            }
            while attempts.join_next().await.is_some() {}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{NodeRole, ShardInfo};

    fn shard(n: usize) -> ShardInfo {
        let nodes = (0..n)
            .map(|i| NodeInfo::new(format!("127.0.0.1:{}", 7000 + i), NodeRole::Replica, None).unwrap())
            .collect();
        ShardInfo::with_nodes(nodes)
    }

    #[test]
    fn test_rank_prefers_most_recent_success() {
        let shard = shard(3);
        let health = HealthTable::default();
        let a = &shard.nodes[1];
        let b = &shard.nodes[2];
        health.record(&a.id, true, 100);
        health.record(&b.id, true, 200);
        assert_eq!(rank_replicas(&shard, &health).unwrap().id, b.id);

        health.record(&b.id, false, 300);
        assert_eq!(rank_replicas(&shard, &health).unwrap().id, a.id);
    }

    #[test]
    fn test_rank_breaks_ties_by_id() {
        let shard = shard(3);
        let health = HealthTable::default();
        let lowest = shard.replicas().map(|n| n.id.clone()).min().unwrap();
        assert_eq!(rank_replicas(&shard, &health).unwrap().id, lowest);
    }

    #[test]
    fn test_rank_without_replicas() {
        assert!(rank_replicas(&shard(1), &HealthTable::default()).is_none());
    }
}
