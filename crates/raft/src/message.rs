//! Typed Raft RPC messages.
//!
//! The transport moves these between nodes in request/response pairs;
//! the wire encoding beyond [`crate::codec`]'s framing belongs to the
//! transport implementation.

use common::{Entry, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use storage::SnapshotMeta;

/// Vote solicitation, real or pre-vote probe (§5.2 of the Raft paper;
/// pre-vote per §9.6 of the dissertation).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// A probe that does not bump terms and grants no durable vote.
    pub pre_vote: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResult {
    pub term: Term,
    pub granted: bool,
    pub pre_vote: bool,
}

/// Log replication and heartbeat carrier (§5.3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub leader_commit: LogIndex,
}

/// Where a follower's log diverged, so the leader can skip a whole
/// conflicting term instead of probing index by index.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictHint {
    /// Term of the conflicting entry, `None` when the follower's log is
    /// simply too short.
    pub term: Option<Term>,
    /// First index of that term, or the follower's `last_index + 1`.
    pub index: LogIndex,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    pub term: Term,
    pub success: bool,
    /// Follower's last log index after processing.
    pub last_log_index: LogIndex,
    pub conflict: Option<ConflictHint>,
}

/// One chunk of a streamed snapshot (§7).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub term: Term,
    pub leader: NodeId,
    pub meta: SnapshotMeta,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResult {
    pub term: Term,
    /// Next byte offset the follower expects.
    pub offset: u64,
}

/// Leadership transfer: the target starts an immediate election without
/// waiting out its timer (§3.10 of the dissertation).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeoutNow {
    pub term: Term,
}

/// Every message the cluster exchanges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResult(RequestVoteResult),
    AppendEntries(AppendEntries),
    AppendEntriesResult(AppendEntriesResult),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotResult(InstallSnapshotResult),
    TimeoutNow(TimeoutNow),
}

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResult(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResult(m) => m.term,
            Message::InstallSnapshot(m) => m.term,
            Message::InstallSnapshotResult(m) => m.term,
            Message::TimeoutNow(m) => m.term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => "request_vote",
            Message::RequestVoteResult(_) => "request_vote_result",
            Message::AppendEntries(_) => "append_entries",
            Message::AppendEntriesResult(_) => "append_entries_result",
            Message::InstallSnapshot(_) => "install_snapshot",
            Message::InstallSnapshotResult(_) => "install_snapshot_result",
            Message::TimeoutNow(_) => "timeout_now",
        }
    }
}
