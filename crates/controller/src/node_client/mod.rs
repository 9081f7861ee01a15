//! Database node RPC
//!
//! The core only needs a handful of opaque calls on each node: liveness,
//! role changes, topology push and slot data transfer. [`NodeRpc`] is the
//! seam; [`RespNodeClient`] implements it over RESP.

mod client;
pub mod resp;

pub use client::RespNodeClient;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::metadata::{ClusterInfo, NodeInfo, SlotRange};

/// Node RPC errors
#[derive(Debug, thiserror::Error)]
pub enum NodeRpcError {
    #[error("io error talking to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out talking to {0}")]
    Timeout(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("node {addr} replied with error: {message}")]
    Server { addr: String, message: String },
    #[error("invalid node address: {0}")]
    InvalidAddr(String),
}

pub type NodeRpcResult<T> = std::result::Result<T, NodeRpcError>;

/// Data transfer state reported by a migration source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationProgress {
    /// No transfer of the asked range is known to the node
    Idle,
    InProgress,
    Success,
    Failed,
}

/// Calls the controller issues against database nodes
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Liveness probe
    async fn ping(&self, node: &NodeInfo) -> NodeRpcResult<()>;

    /// Make `node` a master
    async fn promote(&self, node: &NodeInfo) -> NodeRpcResult<()>;

    /// Make `node` replicate from `master`
    async fn demote(&self, node: &NodeInfo, master: &NodeInfo) -> NodeRpcResult<()>;

    /// Push a topology in `CLUSTERX SETNODES` format
    async fn set_topology(&self, node: &NodeInfo, nodes: &str, version: u64) -> NodeRpcResult<()>;

    /// Ask `source` to transfer `range` to the node `target_id`
    async fn start_migration(
        &self,
        source: &NodeInfo,
        range: SlotRange,
        target_id: &str,
    ) -> NodeRpcResult<()>;

    async fn migration_status(
        &self,
        source: &NodeInfo,
        range: SlotRange,
    ) -> NodeRpcResult<MigrationProgress>;
}

/// Push `cluster` to every node, skipping the ones that fail
///
/// Nodes reject versions older than the one they hold, so a late or
/// repeated push is harmless. Returns the number of nodes updated.
pub async fn broadcast_topology(rpc: &dyn NodeRpc, cluster: &ClusterInfo) -> usize {
    let nodes = match cluster.to_nodes_string() {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!("Cannot render topology of {}: {}", cluster.name, e);
            return 0;
        }
    };
    let mut updated = 0;
    for node in cluster.shards.iter().flat_map(|s| &s.nodes) {
        match rpc.set_topology(node, &nodes, cluster.version).await {
            Ok(()) => updated += 1,
            Err(e) => warn!(
                "Failed to push topology v{} of {} to {}: {}",
                cluster.version, cluster.name, node.addr, e
            ),
        }
    }
    debug!(
        "Pushed topology v{} of {} to {} nodes",
        cluster.version, cluster.name, updated
    );
    updated
}
