//! Topology data model
//!
//! Namespaces, clusters, shards, nodes and slot ranges

mod cluster;
mod node;
mod shard;
pub mod slot;

pub use cluster::{validate_name, ClusterInfo, NamespaceInfo};
pub use node::{generate_node_id, split_addr, NodeId, NodeInfo, NodeRole, NODE_ID_LEN};
pub use shard::ShardInfo;
pub use slot::{SlotRange, MAX_SLOT, TOTAL_SLOTS};
