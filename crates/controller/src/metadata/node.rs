//! Node information definitions

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};

/// Node ID (40 lowercase hex characters)
pub type NodeId = String;

/// Length of a generated node id
pub const NODE_ID_LEN: usize = 40;

/// Node role within its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Replica,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(NodeRole::Master),
            "replica" | "slave" => Ok(NodeRole::Replica),
            other => Err(ControllerError::validation(format!("unknown role {:?}", other))),
        }
    }
}

/// Node information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    /// host:port
    pub addr: String,
    pub role: NodeRole,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl NodeInfo {
    /// Create a node with a freshly generated id
    pub fn new(addr: impl Into<String>, role: NodeRole, password: Option<String>) -> Result<Self> {
        let addr = addr.into();
        split_addr(&addr)?;
        Ok(Self {
            id: generate_node_id(),
            addr,
            role,
            created_at: Utc::now(),
            password: password.filter(|p| !p.is_empty()),
        })
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }

    /// Host and port parts of `addr`
    pub fn host_port(&self) -> Result<(&str, u16)> {
        split_addr(&self.addr)
    }
}

/// Generate a random node id
pub fn generate_node_id() -> NodeId {
    let mut rng = rand::thread_rng();
    (0..NODE_ID_LEN)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// Split `host:port`, validating the port
pub fn split_addr(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ControllerError::validation(format!("address {:?} is not host:port", addr)))?;
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(ControllerError::validation(format!("invalid host in {:?}", addr)));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| ControllerError::validation(format!("invalid port in {:?}", addr)))?;
    Ok((host, port))
}
