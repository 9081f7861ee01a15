//! Cluster metadata
//!
//! Pure, in-memory transformations of a cluster record. Persisting them
//! (and bumping `version`) is the repository's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::slot::{add_range, remove_range, split_evenly, SlotRange, TOTAL_SLOTS};
use super::{NodeId, NodeInfo, NodeRole, ShardInfo};
use crate::error::{ControllerError, Result};

/// Namespace record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl NamespaceInfo {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name("namespace", &name)?;
        Ok(Self {
            name,
            created_at: Utc::now(),
        })
    }
}

/// Names are non-empty, whitespace free and must not contain `/`
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ControllerError::validation(format!("{} name is empty", what)));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(ControllerError::validation(format!(
            "{} name {:?} contains whitespace or '/'",
            what, name
        )));
    }
    Ok(())
}

/// Cluster metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    /// Incremented on every topology mutation
    pub version: u64,
    pub shards: Vec<ShardInfo>,
}

impl ClusterInfo {
    /// Build a new cluster from a flat node list
    ///
    /// Nodes are grouped into shards of `replicas + 1`; the first node of each
    /// group is the master. The slot space is split evenly across shards.
    pub fn create(
        name: impl Into<String>,
        addrs: &[String],
        replicas: usize,
        password: Option<String>,
    ) -> Result<Self> {
        let name = name.into();
        validate_name("cluster", &name)?;

        let group = replicas + 1;
        if addrs.is_empty() || addrs.len() % group != 0 {
            return Err(ControllerError::validation(format!(
                "{} nodes cannot be split into shards of {} nodes",
                addrs.len(),
                group
            )));
        }
        reject_duplicate_addrs(addrs.iter().map(String::as_str))?;

        let shard_count = addrs.len() / group;
        let mut shards = Vec::with_capacity(shard_count);
        for (chunk, range) in addrs.chunks(group).zip(split_evenly(shard_count)) {
            let nodes = chunk
                .iter()
                .map(|addr| NodeInfo::new(addr.clone(), NodeRole::Replica, password.clone()))
                .collect::<Result<Vec<_>>>()?;
            let mut shard = ShardInfo::with_nodes(nodes);
            shard.slot_ranges = vec![range];
            shards.push(shard);
        }

        Ok(Self {
            name,
            version: 1,
            shards,
        })
    }

    pub fn shard(&self, index: usize) -> Result<&ShardInfo> {
        self.shards
            .get(index)
            .ok_or_else(|| ControllerError::not_found(format!("shard {}", index)))
    }

    pub fn shard_mut(&mut self, index: usize) -> Result<&mut ShardInfo> {
        self.shards
            .get_mut(index)
            .ok_or_else(|| ControllerError::not_found(format!("shard {}", index)))
    }

    /// Locate a node by id
    pub fn find_node(&self, node_id: &str) -> Option<(usize, &NodeInfo)> {
        self.shards
            .iter()
            .enumerate()
            .find_map(|(i, s)| s.node(node_id).map(|n| (i, n)))
    }

    fn contains_addr(&self, addr: &str) -> bool {
        self.shards.iter().flat_map(|s| &s.nodes).any(|n| n.addr == addr)
    }

    /// Index of the shard owning `slot`
    pub fn slot_owner(&self, slot: u32) -> Option<usize> {
        self.shards
            .iter()
            .position(|s| s.slot_ranges.iter().any(|r| r.contains(slot)))
    }

    /// Append an empty shard (no slots); first node becomes master
    pub fn add_shard(&mut self, addrs: &[String], password: Option<String>) -> Result<usize> {
        reject_duplicate_addrs(addrs.iter().map(String::as_str))?;
        if let Some(addr) = addrs.iter().find(|a| self.contains_addr(a)) {
            return Err(ControllerError::AlreadyExists(format!("node {}", addr)));
        }
        let nodes = addrs
            .iter()
            .map(|addr| NodeInfo::new(addr.clone(), NodeRole::Replica, password.clone()))
            .collect::<Result<Vec<_>>>()?;
        self.shards.push(ShardInfo::with_nodes(nodes));
        Ok(self.shards.len() - 1)
    }

    /// Remove a shard, renumbering migration targets of later shards
    pub fn remove_shard(&mut self, index: usize) -> Result<ShardInfo> {
        let shard = self.shard(index)?;
        if !shard.nodes.is_empty() && !shard.slot_ranges.is_empty() {
            return Err(ControllerError::SlotsStillAssigned(index));
        }
        if shard.has_migration() || self.shards.iter().any(|s| s.target_shard_index == Some(index)) {
            return Err(ControllerError::MigrationInProgress(index));
        }

        let removed = self.shards.remove(index);
        for shard in &mut self.shards {
            if let Some(target) = shard.target_shard_index.as_mut() {
                if *target > index {
                    *target -= 1;
                }
            }
        }
        Ok(removed)
    }

    /// Add a node to a shard
    pub fn add_node(
        &mut self,
        shard_index: usize,
        addr: &str,
        role: NodeRole,
        password: Option<String>,
    ) -> Result<NodeInfo> {
        if self.contains_addr(addr) {
            return Err(ControllerError::AlreadyExists(format!("node {}", addr)));
        }
        let shard = self.shard_mut(shard_index)?;
        // A shard without nodes gets a master whatever the caller asked for
        let role = if shard.nodes.is_empty() { NodeRole::Master } else { role };
        if role == NodeRole::Master && shard.master().is_some() {
            return Err(ControllerError::validation(format!(
                "shard {} already has a master",
                shard_index
            )));
        }
        let node = NodeInfo::new(addr, role, password)?;
        shard.nodes.push(node.clone());
        Ok(node)
    }

    /// Remove a node; the master may only go if it is the shard's last node
    pub fn remove_node(&mut self, shard_index: usize, node_id: &str) -> Result<NodeInfo> {
        let shard = self.shard_mut(shard_index)?;
        let pos = shard
            .nodes
            .iter()
            .position(|n| n.id == node_id)
            .ok_or_else(|| ControllerError::not_found(format!("node {}", node_id)))?;
        if shard.nodes[pos].is_master() && shard.nodes.len() > 1 {
            return Err(ControllerError::CannotDeleteMaster(node_id.to_string()));
        }
        Ok(shard.nodes.remove(pos))
    }

    /// Swap roles so `new_master` becomes the shard master
    ///
    /// Returns the id of the demoted master.
    pub fn promote(&mut self, shard_index: usize, new_master: &str) -> Result<NodeId> {
        let shard = self.shard_mut(shard_index)?;
        let candidate = shard
            .node(new_master)
            .ok_or_else(|| ControllerError::not_found(format!("node {}", new_master)))?;
        if candidate.is_master() {
            return Err(ControllerError::validation(format!(
                "node {} is already the master",
                new_master
            )));
        }
        let old_master = shard
            .master_id()
            .cloned()
            .ok_or_else(|| ControllerError::Internal(format!("shard {} has no master", shard_index)))?;

        for node in &mut shard.nodes {
            node.role = if node.id == new_master { NodeRole::Master } else { NodeRole::Replica };
        }
        Ok(old_master)
    }

    /// Mark `range` as moving to `target`; returns the source shard index
    pub fn begin_migration(&mut self, target: usize, range: SlotRange) -> Result<usize> {
        self.shard(target)?;

        let owners: Vec<usize> = self
            .shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.owns_any(&range))
            .map(|(i, _)| i)
            .collect();
        let source = match owners.as_slice() {
            [only] if self.shards[*only].owns(&range) => *only,
            _ => return Err(ControllerError::SlotNotOwned(range.to_string())),
        };
        if source == target {
            return Err(ControllerError::SameShard(source));
        }

        if let Some(migrating) = self.shards[source].migrating_slot {
            return Err(if migrating.overlaps(&range) {
                ControllerError::SlotAlreadyMigrating(range.to_string())
            } else {
                ControllerError::MigrationInProgress(source)
            });
        }
        if let Some(importing) = self.shards[target].importing_slot {
            return Err(if importing.overlaps(&range) {
                ControllerError::SlotAlreadyImporting(range.to_string())
            } else {
                ControllerError::MigrationInProgress(target)
            });
        }

        let src = &mut self.shards[source];
        src.migrating_slot = Some(range);
        src.target_shard_index = Some(target);
        self.shards[target].importing_slot = Some(range);
        Ok(source)
    }

    /// Move ownership of the in-flight range and clear the markers
    ///
    /// Returns `false` (and changes nothing) if `source` no longer has the
    /// expected migration in flight, which makes re-running a completed
    /// commit a no-op.
    pub fn commit_migration(&mut self, source: usize, expected: SlotRange) -> Result<bool> {
        let shard = self.shard(source)?;
        let (range, target) = match (shard.migrating_slot, shard.target_shard_index) {
            (Some(range), Some(target)) if range == expected => (range, target),
            _ => return Ok(false),
        };
        self.shard(target)?;

        let src = &mut self.shards[source];
        remove_range(&mut src.slot_ranges, range);
        src.clear_migration_outbound();

        let dst = &mut self.shards[target];
        add_range(&mut dst.slot_ranges, range);
        if dst.importing_slot == Some(range) {
            dst.importing_slot = None;
        }
        Ok(true)
    }

    /// Clear the markers of an in-flight migration without moving ownership
    ///
    /// With `expected = None` whatever is in flight from `source` is aborted.
    pub fn abort_migration(&mut self, source: usize, expected: Option<SlotRange>) -> Result<bool> {
        let shard = self.shard(source)?;
        let range = match shard.migrating_slot {
            Some(range) if expected.map_or(true, |e| e == range) => range,
            _ => return Ok(false),
        };
        let target = shard.target_shard_index;

        self.shards[source].clear_migration_outbound();
        if let Some(dst) = target.and_then(|t| self.shards.get_mut(t)) {
            if dst.importing_slot == Some(range) {
                dst.importing_slot = None;
            }
        }
        Ok(true)
    }

    /// Check slot disjointness and migration marker sanity
    pub fn validate(&self) -> Result<()> {
        let mut ranges: Vec<(SlotRange, usize)> = self
            .shards
            .iter()
            .enumerate()
            .flat_map(|(i, s)| s.slot_ranges.iter().map(move |r| (*r, i)))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            if pair[0].0.overlaps(&pair[1].0) {
                return Err(ControllerError::Internal(format!(
                    "shards {} and {} both own slots {}",
                    pair[0].1, pair[1].1, pair[1].0
                )));
            }
        }

        for (i, shard) in self.shards.iter().enumerate() {
            if shard.nodes.iter().filter(|n| n.is_master()).count() > 1 {
                return Err(ControllerError::Internal(format!("shard {} has two masters", i)));
            }
            if let Some(target) = shard.target_shard_index {
                if target == i || target >= self.shards.len() {
                    return Err(ControllerError::Internal(format!(
                        "shard {} has invalid migration target {}",
                        i, target
                    )));
                }
            }
        }
        Ok(())
    }

    /// True if every slot is owned by some shard
    pub fn is_fully_assigned(&self) -> bool {
        let total: u32 = self.shards.iter().map(|s| s.slot_count()).sum();
        total == TOTAL_SLOTS && self.validate().is_ok()
    }

    /// Render the topology in the node-side `CLUSTERX SETNODES` format
    pub fn to_nodes_string(&self) -> Result<String> {
        let mut lines = Vec::new();
        for shard in &self.shards {
            let Some(master) = shard.master() else {
                continue;
            };
            let (host, port) = master.host_port()?;
            let mut line = format!("{} {} {} master -", master.id, host, port);
            for range in &shard.slot_ranges {
                line.push(' ');
                line.push_str(&range.to_string());
            }
            lines.push(line);

            for replica in shard.replicas() {
                let (host, port) = replica.host_port()?;
                lines.push(format!("{} {} {} slave {}", replica.id, host, port, master.id));
            }
        }
        Ok(lines.join("\n"))
    }
}

fn reject_duplicate_addrs<'a>(addrs: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for addr in addrs {
        if !seen.insert(addr) {
            return Err(ControllerError::validation(format!("duplicate node {}", addr)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("127.0.0.1:{}", 7000 + i)).collect()
    }

    #[test]
    fn test_create_single_shard() {
        let cluster = ClusterInfo::create("demo", &addrs(2), 1, None).unwrap();
        assert_eq!(cluster.version, 1);
        assert_eq!(cluster.shards.len(), 1);
        assert_eq!(cluster.shards[0].slot_ranges, vec![SlotRange::full()]);
        assert_eq!(cluster.shards[0].nodes.iter().filter(|n| n.is_master()).count(), 1);
        assert!(cluster.is_fully_assigned());
    }

    #[test]
    fn test_create_without_replicas_gives_one_shard_per_node() {
        let cluster = ClusterInfo::create("demo", &addrs(2), 0, None).unwrap();
        assert_eq!(cluster.shards.len(), 2);
        assert_eq!(cluster.shards[0].slot_ranges, vec![SlotRange::new(0, 8191).unwrap()]);
        assert_eq!(cluster.shards[1].slot_ranges, vec![SlotRange::new(8192, 16383).unwrap()]);
        assert!(cluster.is_fully_assigned());
    }

    #[test]
    fn test_create_rejects_bad_grouping() {
        assert!(ClusterInfo::create("demo", &addrs(3), 1, None).is_err());
        assert!(ClusterInfo::create("demo", &[], 0, None).is_err());
        assert!(ClusterInfo::create("de mo", &addrs(1), 0, None).is_err());
        let dup = vec!["127.0.0.1:7000".to_string(), "127.0.0.1:7000".to_string()];
        assert!(ClusterInfo::create("demo", &dup, 0, None).is_err());
    }

    #[test]
    fn test_remove_shard_rules() {
        let mut cluster = ClusterInfo::create("demo", &addrs(2), 0, None).unwrap();
        assert_eq!(cluster.remove_shard(1), Err(ControllerError::SlotsStillAssigned(1)));

        let idx = cluster.add_shard(&["127.0.0.1:8000".to_string()], None).unwrap();
        assert_eq!(idx, 2);
        cluster.remove_shard(2).unwrap();

        // A shard with no nodes goes even if it owns slots
        cluster.shards[1].nodes.clear();
        cluster.remove_shard(1).unwrap();
        assert_eq!(cluster.shards.len(), 1);
    }

    #[test]
    fn test_remove_node_rules() {
        let mut cluster = ClusterInfo::create("demo", &addrs(2), 1, None).unwrap();
        let master = cluster.shards[0].master_id().unwrap().clone();
        let replica = cluster.shards[0].replicas().next().unwrap().id.clone();

        assert_eq!(
            cluster.remove_node(0, &master),
            Err(ControllerError::CannotDeleteMaster(master.clone()))
        );
        cluster.remove_node(0, &replica).unwrap();
        // Now the master is the only node
        cluster.remove_node(0, &master).unwrap();
        assert!(cluster.shards[0].nodes.is_empty());
    }

    #[test]
    fn test_add_node_rejects_second_master() {
        let mut cluster = ClusterInfo::create("demo", &addrs(1), 0, None).unwrap();
        assert!(cluster.add_node(0, "127.0.0.1:9000", NodeRole::Master, None).is_err());
        let node = cluster.add_node(0, "127.0.0.1:9000", NodeRole::Replica, None).unwrap();
        assert_eq!(node.role, NodeRole::Replica);
        assert!(matches!(
            cluster.add_node(0, "127.0.0.1:9000", NodeRole::Replica, None),
            Err(ControllerError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_migration_lifecycle() {
        let mut cluster = ClusterInfo::create("demo", &addrs(2), 0, None).unwrap();
        let range = SlotRange::single(100).unwrap();

        let source = cluster.begin_migration(1, range).unwrap();
        assert_eq!(source, 0);
        assert_eq!(cluster.shards[0].migrating_slot, Some(range));
        assert_eq!(cluster.shards[0].target_shard_index, Some(1));
        assert_eq!(cluster.shards[1].importing_slot, Some(range));

        assert_eq!(
            cluster.begin_migration(1, range),
            Err(ControllerError::SlotAlreadyMigrating("100".into()))
        );

        assert!(cluster.commit_migration(0, range).unwrap());
        assert_eq!(cluster.slot_owner(100), Some(1));
        assert!(!cluster.shards[0].has_migration());
        assert!(!cluster.shards[1].has_migration());
        assert!(cluster.is_fully_assigned());

        // Second commit is a no-op
        let snapshot = cluster.clone();
        assert!(!cluster.commit_migration(0, range).unwrap());
        assert_eq!(cluster, snapshot);
    }

    #[test]
    fn test_begin_migration_preconditions() {
        let mut cluster = ClusterInfo::create("demo", &addrs(2), 0, None).unwrap();
        assert!(matches!(
            cluster.begin_migration(5, SlotRange::single(1).unwrap()),
            Err(ControllerError::NotFound(_))
        ));
        assert_eq!(
            cluster.begin_migration(0, SlotRange::single(1).unwrap()),
            Err(ControllerError::SameShard(0))
        );
        // Range straddling both shards
        assert!(matches!(
            cluster.begin_migration(1, SlotRange::new(8000, 8200).unwrap()),
            Err(ControllerError::SlotNotOwned(_))
        ));
    }

    #[test]
    fn test_abort_keeps_ownership() {
        let mut cluster = ClusterInfo::create("demo", &addrs(2), 0, None).unwrap();
        let range = SlotRange::new(10, 20).unwrap();
        cluster.begin_migration(1, range).unwrap();
        assert!(cluster.abort_migration(0, None).unwrap());
        assert_eq!(cluster.slot_owner(15), Some(0));
        assert!(!cluster.shards[1].has_migration());
        assert!(!cluster.abort_migration(0, None).unwrap());
    }

    #[test]
    fn test_promote_swaps_roles() {
        let mut cluster = ClusterInfo::create("demo", &addrs(2), 1, None).unwrap();
        let master = cluster.shards[0].master_id().unwrap().clone();
        let replica = cluster.shards[0].replicas().next().unwrap().id.clone();

        assert_eq!(cluster.promote(0, &replica).unwrap(), master);
        assert_eq!(cluster.shards[0].master_id(), Some(&replica));
        assert!(cluster.promote(0, &replica).is_err());
        cluster.validate().unwrap();
    }

    #[test]
    fn test_nodes_string() {
        let cluster = ClusterInfo::create("demo", &addrs(2), 1, None).unwrap();
        let master = cluster.shards[0].master().unwrap();
        let text = cluster.to_nodes_string().unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("{} 127.0.0.1 7000 master - 0-16383", master.id));
        assert!(lines[1].ends_with(&format!("slave {}", master.id)));
    }
}
