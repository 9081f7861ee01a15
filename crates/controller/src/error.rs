//! Controller error types
//!
//! Every error surfaced by the core maps onto one [`ErrorKind`] so callers
//! (and the HTTP layer) can decide whether a retry makes sense.

use crate::node_client::NodeRpcError;
use crate::store::StoreError;

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, rejected before any store mutation
    Validation,
    /// Lost a compare-and-swap race
    Conflict,
    /// Referenced entity is absent
    NotFound,
    /// Store (or leadership) cannot guarantee consistency right now
    Unavailable,
    /// Leadership revoked
    LockLost,
    /// CAS retry budget exhausted; nothing was persisted
    Contention,
    /// Bug or corrupted record
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Unavailable => write!(f, "unavailable"),
            ErrorKind::LockLost => write!(f, "lock_lost"),
            ErrorKind::Contention => write!(f, "contention"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Errors exposed by the controller core
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControllerError {
    #[error("invalid argument: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("namespace {0} still owns clusters")]
    NotEmpty(String),
    #[error("slot {0} is out of range [0, 16383]")]
    SlotOutOfRange(u32),
    #[error("slot range {0} is not owned by exactly one shard")]
    SlotNotOwned(String),
    #[error("shard {0} still owns slots")]
    SlotsStillAssigned(usize),
    #[error("node {0} is the shard master, fail over first")]
    CannotDeleteMaster(String),
    #[error("source and target are the same shard {0}")]
    SameShard(usize),
    #[error("slot {0} is already migrating")]
    SlotAlreadyMigrating(String),
    #[error("slot {0} is already importing")]
    SlotAlreadyImporting(String),
    #[error("shard {0} has a migration in flight")]
    MigrationInProgress(usize),
    #[error("shard {0} has no migration in flight")]
    NoMigration(usize),
    #[error("shard {0} is already failing over")]
    FailoverInProgress(usize),
    #[error("no eligible replica in shard {0}")]
    NoEligibleReplica(usize),
    #[error("node rpc failed: {0}")]
    NodeRpc(String),
    #[error("compare-and-swap conflict: {0}")]
    Conflict(String),
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
    #[error("this controller is not the leader")]
    NotLeader,
    #[error("leadership lost")]
    LockLost,
    #[error("gave up after {0} conflicting attempts")]
    Contention(usize),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        use ControllerError::*;
        match self {
            Validation(_) | NotEmpty(_) | SlotOutOfRange(_) | SlotNotOwned(_)
            | SlotsStillAssigned(_) | CannotDeleteMaster(_) | SameShard(_)
            | NoMigration(_) | NoEligibleReplica(_) => ErrorKind::Validation,
            NotFound(_) => ErrorKind::NotFound,
            AlreadyExists(_) | SlotAlreadyMigrating(_) | SlotAlreadyImporting(_)
            | MigrationInProgress(_) | FailoverInProgress(_) | Conflict(_) => ErrorKind::Conflict,
            Unavailable(_) | NotLeader | NodeRpc(_) => ErrorKind::Unavailable,
            LockLost => ErrorKind::LockLost,
            Contention(_) => ErrorKind::Contention,
            Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        ControllerError::Validation(msg.into())
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        ControllerError::NotFound(what.into())
    }
}

impl From<StoreError> for ControllerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(key) => ControllerError::Conflict(key),
            StoreError::Unavailable(msg) => ControllerError::Unavailable(msg),
            StoreError::LockLost(_) => ControllerError::LockLost,
            StoreError::AlreadyHeld { name, holder } => {
                ControllerError::Conflict(format!("lock {} held by {}", name, holder))
            }
            StoreError::Codec(msg) | StoreError::Internal(msg) => ControllerError::Internal(msg),
        }
    }
}

impl From<NodeRpcError> for ControllerError {
    fn from(err: NodeRpcError) -> Self {
        ControllerError::NodeRpc(err.to_string())
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(err: serde_json::Error) -> Self {
        ControllerError::Internal(format!("corrupted record: {}", err))
    }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
