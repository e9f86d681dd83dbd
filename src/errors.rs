//! Topology Watcher Error Hierarchy
//!
//! Defines the error types surfaced by the lock, watch and discovery layers,
//! categorized by the collaborator that produced them.

use std::time::Duration;

use config::ConfigError;

use crate::topo::Target;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failures reported by (or while talking to) the topology store
    #[error(transparent)]
    Topo(#[from] TopoError),

    /// Topology lock bookkeeping failures
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Fan-out discovery failures
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Settings validation or loading failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Lock payload could not be encoded
    #[error("cannot JSON-marshal node: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopoError {
    /// Node is missing from the store
    #[error("node doesn't exist: {path}")]
    NoNode { path: String },

    /// Node (or lock) is already present and held by someone else
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    /// Remote call exceeded its deadline
    #[error("deadline exceeded: {operation} after {timeout:?}")]
    DeadlineExceeded { operation: String, timeout: Duration },

    /// The store interrupted a watch or a wait
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// The store is unreachable or failed for an unknown reason
    #[error("topology server unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// Resource is already locked by the current scope
    #[error("lock for {kind} {resource} is already held")]
    AlreadyHeld { kind: &'static str, resource: String },

    /// Resource is not locked by the current scope
    #[error("{kind} {resource} is not locked")]
    NotLocked { kind: &'static str, resource: String },

    /// Release called for a lock that was already released
    #[error("trying to unlock {kind} {resource} multiple times")]
    DoubleUnlock { kind: &'static str, resource: String },

    /// Store no longer holds the lock (lease expired or lock stolen)
    #[error("lock at {path} is no longer held")]
    LockLost { path: String },
}

/// Discovery failure recorded after every per-keyspace probe completed.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to fetch {} keyspace(s): {}", .errors.len(), join_errors(.errors))]
    Aggregate {
        /// Targets collected from the keyspaces that did answer
        targets: Vec<Target>,
        errors: Vec<Error>,
    },
}

fn join_errors(errors: &[Error]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl Error {
    pub fn is_no_node(&self) -> bool {
        matches!(self, Error::Topo(TopoError::NoNode { .. }))
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, Error::Topo(TopoError::NodeExists { .. }))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Error::Topo(TopoError::DeadlineExceeded { .. }))
    }

    pub fn is_already_held(&self) -> bool {
        matches!(self, Error::Lock(LockError::AlreadyHeld { .. }))
    }
}

impl TopoError {
    pub fn is_no_node(&self) -> bool {
        matches!(self, TopoError::NoNode { .. })
    }
}
