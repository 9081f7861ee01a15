//! Slot migration orchestration
//!
//! `migrate` marks the source and target shards in one CAS and returns; a
//! background task then drives the data transfer (unless only ownership
//! moves), and finally commits or aborts, again in one CAS each. All
//! in-flight state lives in the cluster record, so a controller that becomes
//! Active later can settle whatever its predecessor left behind.
//!
//! A store outage halts a migration without dropping it: the driving task
//! keeps retrying until the store answers again or leadership is lost.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::election::{ensure_active, LeaderState};
use crate::error::{ControllerError, ErrorKind, Result};
use crate::metadata::{ClusterInfo, NodeInfo, SlotRange};
use crate::node_client::{broadcast_topology, MigrationProgress, NodeRpc};
use crate::repository::TopologyRepository;

/// Result of a successful `migrate` call
#[derive(Debug, Clone, Serialize)]
pub struct MigrationTicket {
    pub source: usize,
    pub target: usize,
    pub range: SlotRange,
    /// Cluster right after the markers were set
    pub cluster: ClusterInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortOutcome {
    /// Markers cleared on the spot
    Aborted,
    /// The driving task will stop at its next step boundary
    Requested,
}

/// How a migration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Commit,
    Abort,
}

/// In-flight migrations are identified by cluster and range; at most one
/// shard can be migrating a given range.
type JobKey = (String, String, SlotRange);

/// Upper bound on the wait between settle attempts
const MAX_SETTLE_BACKOFF: Duration = Duration::from_secs(5);

/// Index of the shard currently migrating `range` out
fn source_of(cluster: &ClusterInfo, range: SlotRange) -> Option<usize> {
    cluster
        .shards
        .iter()
        .position(|s| s.migrating_slot == Some(range))
}

fn masters(cluster: &ClusterInfo, range: SlotRange) -> Option<(NodeInfo, NodeInfo)> {
    let source = cluster.shard(source_of(cluster, range)?).ok()?;
    let target = cluster.shard(source.target_shard_index?).ok()?;
    Some((source.master()?.clone(), target.master()?.clone()))
}

fn retryable(err: &ControllerError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Unavailable | ErrorKind::Contention | ErrorKind::Conflict
    )
}

pub struct MigrationOrchestrator {
    repo: TopologyRepository,
    rpc: Arc<dyn NodeRpc>,
    config: MigrationConfig,
    leadership: watch::Receiver<LeaderState>,
    running: Mutex<HashMap<JobKey, JoinHandle<()>>>,
    aborts: Mutex<HashSet<JobKey>>,
    /// Held while recovering; new migrations wait for it
    recovery: tokio::sync::Mutex<()>,
}

impl MigrationOrchestrator {
    pub fn new(
        repo: TopologyRepository,
        rpc: Arc<dyn NodeRpc>,
        config: MigrationConfig,
        leadership: watch::Receiver<LeaderState>,
    ) -> Self {
        Self {
            repo,
            rpc,
            config,
            leadership,
            running: Mutex::new(HashMap::new()),
            aborts: Mutex::new(HashSet::new()),
            recovery: tokio::sync::Mutex::new(()),
        }
    }

    /// Start moving `range` to shard `target`
    pub async fn migrate(
        self: &Arc<Self>,
        ns: &str,
        cluster: &str,
        target: usize,
        range: SlotRange,
        slot_only: bool,
    ) -> Result<MigrationTicket> {
        let _recovery = self.recovery.lock().await;
        let (source, updated) = self
            .repo
            .update_cluster(ns, cluster, |c| {
                ensure_active(&self.leadership)?;
                c.begin_migration(target, range)
            })
            .await?;
        info!(
            "Migrating slots {} of {}/{} from shard {} to shard {}{}",
            range,
            ns,
            cluster,
            source,
            target,
            if slot_only { " (slot only)" } else { "" }
        );
        self.spawn_job(ns, cluster, range, slot_only);
        Ok(MigrationTicket {
            source,
            target,
            range,
            cluster: updated,
        })
    }

    /// Cancel the migration sourced from shard `source`
    pub async fn abort_migration(
        &self,
        ns: &str,
        cluster: &str,
        source: usize,
    ) -> Result<AbortOutcome> {
        let info = self.repo.get_cluster(ns, cluster).await?;
        let range = info
            .shard(source)?
            .migrating_slot
            .ok_or(ControllerError::NoMigration(source))?;
        let key = (ns.to_string(), cluster.to_string(), range);
        if self.running.lock().contains_key(&key) {
            self.aborts.lock().insert(key);
            info!(
                "Abort of slots {} in {}/{} requested",
                range, ns, cluster
            );
            return Ok(AbortOutcome::Requested);
        }
        self.settle(ns, cluster, range, Settle::Abort).await?;
        Ok(AbortOutcome::Aborted)
    }

    pub fn is_running(&self, ns: &str, cluster: &str, range: SlotRange) -> bool {
        self.running
            .lock()
            .contains_key(&(ns.to_string(), cluster.to_string(), range))
    }

    fn spawn_job(self: &Arc<Self>, ns: &str, cluster: &str, range: SlotRange, slot_only: bool) {
        let key: JobKey = (ns.to_string(), cluster.to_string(), range);
        let mut running = self.running.lock();
        if running.contains_key(&key) {
            return;
        }
        let this = self.clone();
        let job = key.clone();
        // the task unregisters itself, which waits for the insert below
        let handle = tokio::spawn(async move {
            this.drive(&job.0, &job.1, job.2, slot_only).await;
            this.running.lock().remove(&job);
            this.aborts.lock().remove(&job);
        });
        running.insert(key, handle);
    }

    fn abort_requested(&self, ns: &str, cluster: &str, range: SlotRange) -> bool {
        self.aborts
            .lock()
            .contains(&(ns.to_string(), cluster.to_string(), range))
    }

    async fn drive(&self, ns: &str, cluster: &str, range: SlotRange, slot_only: bool) {
        let outcome = if slot_only {
            Settle::Commit
        } else {
            match self.transfer(ns, cluster, range).await {
                Ok(outcome) => outcome,
                Err(ControllerError::LockLost) => {
                    // markers stay; the next Active leader settles them
                    warn!(
                        "Migration of slots {} in {}/{} interrupted: leadership lost",
                        range, ns, cluster
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "Migration of slots {} in {}/{} failed, aborting: {}",
                        range, ns, cluster, e
                    );
                    Settle::Abort
                }
            }
        };
        let outcome = if self.abort_requested(ns, cluster, range) {
            Settle::Abort
        } else {
            outcome
        };
        self.settle_with_retry(ns, cluster, range, outcome).await;
    }

    /// Start the node-side transfer and wait for its verdict
    async fn transfer(&self, ns: &str, cluster: &str, range: SlotRange) -> Result<Settle> {
        if self.abort_requested(ns, cluster, range) {
            return Ok(Settle::Abort);
        }
        let deadline = tokio::time::Instant::now() + self.config.transfer_timeout();
        let Some(info) = self.read_cluster(ns, cluster, range, deadline).await? else {
            return Ok(Settle::Abort);
        };
        let Some((source, target)) = masters(&info, range) else {
            warn!(
                "Migration of slots {} in {}/{} has no source or target master",
                range, ns, cluster
            );
            return Ok(Settle::Abort);
        };
        ensure_active(&self.leadership)?;
        if let Err(e) = self.rpc.start_migration(&source, range, &target.id).await {
            warn!(
                "Source {} refused to migrate slots {}: {}",
                source.addr, range, e
            );
            return Ok(Settle::Abort);
        }
        info!(
            "Transferring slots {} from {} to {}",
            range, source.addr, target.addr
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        loop {
            ticker.tick().await;
            if self.abort_requested(ns, cluster, range) {
                return Ok(Settle::Abort);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Transfer of slots {} timed out", range);
                return Ok(Settle::Abort);
            }
            // the source shard may fail over while data moves
            let info = match self.repo.get_cluster(ns, cluster).await {
                Ok(info) => info,
                Err(e) if retryable(&e) => {
                    warn!("Cannot read {}/{} while moving slots {}: {}", ns, cluster, range, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some((source, _)) = masters(&info, range) else {
                return Ok(Settle::Abort);
            };
            match self.rpc.migration_status(&source, range).await {
                Ok(MigrationProgress::Success) => return Ok(Settle::Commit),
                Ok(MigrationProgress::Failed) => {
                    warn!("Source {} reports transfer of slots {} failed", source.addr, range);
                    return Ok(Settle::Abort);
                }
                Ok(progress) => debug!("Slots {} transfer: {:?}", range, progress),
                Err(e) => debug!("Cannot poll {} for slots {}: {}", source.addr, range, e),
            }
        }
    }

    /// Read the cluster, waiting out store outages until `deadline`
    ///
    /// `None` once the deadline passes.
    async fn read_cluster(
        &self,
        ns: &str,
        cluster: &str,
        range: SlotRange,
        deadline: tokio::time::Instant,
    ) -> Result<Option<ClusterInfo>> {
        loop {
            match self.repo.get_cluster(ns, cluster).await {
                Ok(info) => return Ok(Some(info)),
                Err(e) if retryable(&e) => {
                    if tokio::time::Instant::now() >= deadline {
                        warn!("Store unreachable, giving up on slots {}: {}", range, e);
                        return Ok(None);
                    }
                    warn!("Cannot read {}/{} before moving slots {}: {}", ns, cluster, range, e);
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Settle, retrying store outages and conflicts until the markers are gone
    async fn settle_with_retry(&self, ns: &str, cluster: &str, range: SlotRange, outcome: Settle) {
        let mut delay = self.config.poll_interval();
        loop {
            match self.settle(ns, cluster, range, outcome).await {
                Ok(_) => return,
                Err(e) if retryable(&e) => {
                    warn!("Settling slots {} in {}/{} failed, retrying: {}", range, ns, cluster, e);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_SETTLE_BACKOFF);
                }
                Err(e) => {
                    warn!("Giving up settling slots {} in {}/{}: {}", range, ns, cluster, e);
                    return;
                }
            }
        }
    }

    /// Commit or abort in one CAS; returns false if nothing was in flight
    async fn settle(&self, ns: &str, cluster: &str, range: SlotRange, outcome: Settle) -> Result<bool> {
        let (changed, updated) = self
            .repo
            .update_cluster(ns, cluster, |c| {
                ensure_active(&self.leadership)?;
                match source_of(c, range) {
                    None => Ok(false),
                    Some(source) => match outcome {
                        Settle::Commit => c.commit_migration(source, range),
                        Settle::Abort => c.abort_migration(source, Some(range)),
                    },
                }
            })
            .await?;
        if !changed {
            debug!("Slots {} in {}/{} already settled", range, ns, cluster);
            return Ok(false);
        }
        match outcome {
            Settle::Commit => {
                info!(
                    "Slots {} of {}/{} now owned by shard {:?}, version {}",
                    range,
                    ns,
                    cluster,
                    updated.slot_owner(range.start),
                    updated.version
                );
                broadcast_topology(self.rpc.as_ref(), &updated).await;
            }
            Settle::Abort => info!(
                "Migration of slots {} in {}/{} aborted, version {}",
                range, ns, cluster, updated.version
            ),
        }
        Ok(true)
    }

    /// Settle every persisted migration nobody is driving
    ///
    /// The source master decides: a transfer it reports as successful is
    /// committed, anything else (including no answer) is aborted.
    pub async fn resume_all(&self) -> Result<usize> {
        let _recovery = self.recovery.lock().await;
        let mut settled = 0;
        for (ns, cluster) in self.repo.all_clusters().await? {
            self.clear_orphan_imports(&ns, &cluster).await?;
            for shard in &cluster.shards {
                let Some(range) = shard.migrating_slot else {
                    continue;
                };
                if self.is_running(&ns, &cluster.name, range) {
                    continue;
                }
                let progress = match masters(&cluster, range) {
                    Some((source, _)) => self
                        .rpc
                        .migration_status(&source, range)
                        .await
                        .unwrap_or(MigrationProgress::Idle),
                    None => MigrationProgress::Idle,
                };
                let outcome = if progress == MigrationProgress::Success {
                    Settle::Commit
                } else {
                    Settle::Abort
                };
                info!(
                    "Recovering migration of slots {} in {}/{}: {:?} -> {:?}",
                    range, ns, cluster.name, progress, outcome
                );
                if self.settle(&ns, &cluster.name, range, outcome).await? {
                    settled += 1;
                }
            }
        }
        Ok(settled)
    }

    /// Clear import markers whose source no longer migrates that range
    async fn clear_orphan_imports(&self, ns: &str, cluster: &ClusterInfo) -> Result<()> {
        let orphaned = |c: &ClusterInfo, range: SlotRange| source_of(c, range).is_none();
        let any = cluster
            .shards
            .iter()
            .filter_map(|s| s.importing_slot)
            .any(|r| orphaned(cluster, r));
        if !any {
            return Ok(());
        }
        self.repo
            .update_cluster(ns, &cluster.name, |c| {
                ensure_active(&self.leadership)?;
                let snapshot = c.clone();
                for shard in &mut c.shards {
                    if shard.importing_slot.is_some_and(|r| orphaned(&snapshot, r)) {
                        shard.importing_slot = None;
                    }
                }
                Ok(())
            })
            .await?;
        warn!("Cleared orphaned import markers in {}/{}", ns, cluster.name);
        Ok(())
    }

    /// Drop every driving task (leadership lost)
    pub fn stop(&self) {
        let running: Vec<_> = self.running.lock().drain().collect();
        for (key, handle) in running {
            debug!("Stopping migration of slots {} in {}/{}", key.2, key.0, key.1);
            handle.abort();
        }
        self.aborts.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_of_and_masters() {
        let addrs: Vec<String> = (0..2).map(|i| format!("127.0.0.1:{}", 7000 + i)).collect();
        let mut cluster = ClusterInfo::create("demo", &addrs, 0, None).unwrap();
        let range = SlotRange::single(100).unwrap();
        assert_eq!(source_of(&cluster, range), None);
        assert!(masters(&cluster, range).is_none());

        cluster.begin_migration(1, range).unwrap();
        assert_eq!(source_of(&cluster, range), Some(0));
        let (source, target) = masters(&cluster, range).unwrap();
        assert_eq!(source.addr, "127.0.0.1:7000");
        assert_eq!(target.addr, "127.0.0.1:7001");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(retryable(&ControllerError::Unavailable("x".into())));
        assert!(retryable(&ControllerError::Contention(3)));
        assert!(!retryable(&ControllerError::NotFound("x".into())));
    }
}
