// src/core/errors.rs

//! Defines the primary error type for the entire daemon.

use crate::core::cluster::admission::JoinError;
use thiserror::Error;

/// The main error enum, representing all possible failures within the
/// daemon. Using `thiserror` allows for clean error definitions and
/// automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum FlockError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Truncated cluster message")]
    TruncatedMessage,

    #[error("Malformed cluster message: {0}")]
    MalformedMessage(String),

    #[error("Protocol version mismatch (peer sent {0})")]
    VersionMismatch(u8),

    // --- Membership errors ---
    /// This node's own join attempt was rejected by the cluster. The
    /// daemon leaves and terminates; the operator restarts it.
    #[error("Join rejected: {0}")]
    JoinRejected(JoinError),

    /// The cluster told this node to retry its join once the cluster is
    /// working. Handled like a rejection: leave and terminate.
    #[error("Join deferred; cluster is not ready for new members")]
    JoinDeferred,

    /// A LEAVE evaluation found this node on the minority side of a
    /// partition. Diverging is worse than halting, so the daemon aborts.
    #[error("Cluster majority lost ({reachable}/{total} members reachable)")]
    MajorityLost { reachable: usize, total: usize },

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Group driver error: {0}")]
    Driver(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for FlockError {
    fn from(e: serde_json::Error) -> Self {
        FlockError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl FlockError {
    /// Whether this error must tear the whole daemon down rather than fail
    /// a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FlockError::JoinRejected(_) | FlockError::JoinDeferred | FlockError::MajorityLost { .. }
        )
    }
}
