//! Shard information definitions

use serde::{Deserialize, Serialize};

use super::slot::{ranges_cover, SlotRange};
use super::{NodeId, NodeInfo, NodeRole};

/// Shard
///
/// A shard is identified externally by its position in the cluster's shard
/// list. Migration markers refer to other shards by that index, never by the
/// node currently holding the master role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Nodes, exactly one master at any quiescent instant
    pub nodes: Vec<NodeInfo>,
    /// Disjoint, sorted slot ranges
    pub slot_ranges: Vec<SlotRange>,
    /// Slots currently being moved out
    #[serde(default)]
    pub migrating_slot: Option<SlotRange>,
    /// Slots currently being moved in
    #[serde(default)]
    pub importing_slot: Option<SlotRange>,
    /// Destination shard while an outbound migration is in flight
    #[serde(default)]
    pub target_shard_index: Option<usize>,
}

impl ShardInfo {
    /// Create a shard from node list (first node becomes master)
    pub fn with_nodes(mut nodes: Vec<NodeInfo>) -> Self {
        for (i, node) in nodes.iter_mut().enumerate() {
            node.role = if i == 0 { NodeRole::Master } else { NodeRole::Replica };
        }
        Self {
            nodes,
            ..Default::default()
        }
    }

    pub fn master(&self) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.is_master())
    }

    pub fn replicas(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter().filter(|n| !n.is_master())
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut NodeInfo> {
        self.nodes.iter_mut().find(|n| n.id == node_id)
    }

    pub fn master_id(&self) -> Option<&NodeId> {
        self.master().map(|n| &n.id)
    }

    /// True if the shard takes part in any migration
    pub fn has_migration(&self) -> bool {
        self.migrating_slot.is_some() || self.importing_slot.is_some()
    }

    /// True if the shard owns every slot of `range`
    pub fn owns(&self, range: &SlotRange) -> bool {
        ranges_cover(&self.slot_ranges, range)
    }

    /// True if the shard owns any slot of `range`
    pub fn owns_any(&self, range: &SlotRange) -> bool {
        self.slot_ranges.iter().any(|r| r.overlaps(range))
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_ranges.iter().map(|r| r.len()).sum()
    }

    /// Clear the outbound migration markers
    pub(crate) fn clear_migration_outbound(&mut self) {
        self.migrating_slot = None;
        self.target_shard_index = None;
    }
}
