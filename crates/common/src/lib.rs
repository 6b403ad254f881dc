//! Shared vocabulary for the Raft workspace: identifiers, the log entry
//! model, cluster membership, runtime configuration, and the canonical
//! error type every other crate returns.

#[cfg(test)]
mod tests;

pub mod config;
pub mod entry;
pub mod membership;

pub use config::Config;
pub use entry::{Entry, EntryPayload};
pub use membership::{Membership, Server, ServerRole};

use std::io;
use thiserror::Error;

/// Unique identifier of a server within a cluster.
/// Zero is reserved and never names a real server.
/// Examples:
/// - `let id: NodeId = 1;`
/// - `let leader_hint: Option<NodeId> = Some(3);`
pub type NodeId = u64;

/// Logical election epoch. Monotonically non-decreasing on every server.
pub type Term = u64;

/// Position in the replicated log. 1-based; index 0 means "before the
/// first entry" and only ever appears as a prev-log reference.
pub type LogIndex = u64;

/// Canonical error type shared across the Raft subsystems.
///
/// Protocol-internal conditions (a stale term, a log-matching conflict)
/// are not errors at this level; they travel inside the RPC result
/// messages and are resolved by the consensus state machine.
#[derive(Error, Debug)]
pub enum RaftError {
    /// This node has no current leader hint to redirect to.
    #[error("no leader currently known")]
    NoLeader,

    /// This node is not the leader. Carries a hint when one is known.
    #[error("not the leader")]
    NotLeader { leader_hint: Option<NodeId> },

    /// The node is closing or closed.
    #[error("raft node is shut down")]
    Shutdown,

    /// A membership change is already in flight.
    #[error("a configuration change is already in progress")]
    Busy,

    /// The request was terminated by shutdown before it completed.
    #[error("request cancelled")]
    Cancelled,

    /// A bounded operation (promotion catch-up, leadership transfer) ran
    /// out of its round budget.
    #[error("operation timed out")]
    Timeout,

    /// Resource exhaustion; the operation failed without mutating state.
    #[error("resource exhausted: {0}")]
    Exhausted(String),

    /// On-disk data failed a checksum or version check.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    /// A disk failure. Latches the node into an unavailable state.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RaftError {
    /// Rebuild an equivalent error for fan-out to multiple waiters.
    ///
    /// `io::Error` is not `Clone`, so a latched disk failure is re-reported
    /// by kind and message rather than by the original value.
    pub fn duplicate(&self) -> RaftError {
        match self {
            RaftError::NoLeader => RaftError::NoLeader,
            RaftError::NotLeader { leader_hint } => RaftError::NotLeader {
                leader_hint: *leader_hint,
            },
            RaftError::Shutdown => RaftError::Shutdown,
            RaftError::Busy => RaftError::Busy,
            RaftError::Cancelled => RaftError::Cancelled,
            RaftError::Timeout => RaftError::Timeout,
            RaftError::Exhausted(s) => RaftError::Exhausted(s.clone()),
            RaftError::Corrupt(s) => RaftError::Corrupt(s.clone()),
            RaftError::Io(e) => RaftError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Result alias that carries a `RaftError`.
pub type RaftResult<T> = Result<T, RaftError>;
