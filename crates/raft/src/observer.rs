//! Observer notifications for leadership and availability changes.

use common::{NodeId, Term};

/// Fired synchronously on the core task when the view of the cluster
/// changes.
#[derive(Clone, Debug, PartialEq)]
pub enum RaftEvent {
    /// A new leader was observed (or leadership was lost: `None`).
    LeaderChanged {
        term: Term,
        leader: Option<NodeId>,
    },
    /// The term advanced.
    TermChanged { term: Term },
    /// A disk failure latched the node; no further progress is made.
    Unavailable { reason: String },
}

/// Registered callback. Kept deliberately small and synchronous; an
/// observer that needs to do real work should hand off to a channel.
pub type Observer = Box<dyn Fn(&RaftEvent) + Send + 'static>;

/// Bound on registered observers.
pub const MAX_OBSERVERS: usize = 8;
