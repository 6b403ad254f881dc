//! Point-in-time view of a node, published on a watch channel.

use common::{LogIndex, Membership, NodeId, Term};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleKind::Follower => write!(f, "follower"),
            RoleKind::Candidate => write!(f, "candidate"),
            RoleKind::Leader => write!(f, "leader"),
        }
    }
}

/// Snapshot of the observable node state. Tests synchronise on this
/// through the handle's watch channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Metrics {
    pub id: NodeId,
    pub term: Term,
    pub role: RoleKind,
    pub leader: Option<NodeId>,
    pub last_log_index: LogIndex,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub snapshot_index: LogIndex,
    pub membership: Membership,
}
