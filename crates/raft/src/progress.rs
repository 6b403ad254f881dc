//! Per-peer replication bookkeeping kept by the leader.

use crate::log::PinId;
use crate::message::ConflictHint;
use common::LogIndex;
use std::collections::VecDeque;
use std::time::Instant;

/// How the leader is currently feeding one peer.
#[derive(Debug)]
pub enum ReplicationState {
    /// Finding where the peer's log matches; one probe at a time.
    Probe,
    /// Streaming entries with a bounded pipeline.
    Replicating,
    /// The peer is too far behind the snapshot; streaming chunks.
    Snapshotting {
        /// Next byte offset to send.
        offset: u64,
        last_included: LogIndex,
        started: Instant,
        /// A chunk is in flight, await its ack.
        inflight: bool,
    },
}

/// One unacknowledged AppendEntries.
#[derive(Debug)]
pub struct InflightAppend {
    /// Index the peer's log ends at if it accepts.
    pub last_index: LogIndex,
    /// Pin keeping the batch range alive in the log store.
    pub pin: Option<PinId>,
}

#[derive(Debug)]
pub struct Progress {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub state: ReplicationState,
    pub inflight: VecDeque<InflightAppend>,
    pub last_contact: Option<Instant>,
}

impl Progress {
    /// Fresh progress for a peer, optimistic per §5.3: probe from the
    /// leader's tail.
    pub fn new(last_log_index: LogIndex) -> Self {
        Self {
            next_index: last_log_index + 1,
            match_index: 0,
            state: ReplicationState::Probe,
            inflight: VecDeque::new(),
            last_contact: None,
        }
    }

    /// The peer accepted entries through `last_index`.
    pub fn on_success(&mut self, last_index: LogIndex) {
        self.match_index = self.match_index.max(last_index);
        self.next_index = self.next_index.max(last_index + 1);
        if matches!(self.state, ReplicationState::Probe) {
            self.state = ReplicationState::Replicating;
        }
    }

    /// The peer rejected on log mismatch; back `next_index` up using its
    /// conflict hint and drop the now-useless pipeline.
    pub fn on_conflict(&mut self, hint: Option<ConflictHint>, follower_last: LogIndex) {
        let fallback = self.next_index.saturating_sub(1).max(1);
        self.next_index = match hint {
            Some(hint) => hint.index.max(1),
            None => (follower_last + 1).min(fallback),
        };
        self.inflight.clear();
        self.state = ReplicationState::Probe;
    }

    /// Whether another AppendEntries may be pipelined now.
    pub fn may_send(&self, max_inflight: usize) -> bool {
        match self.state {
            ReplicationState::Probe => self.inflight.is_empty(),
            ReplicationState::Replicating => self.inflight.len() < max_inflight,
            ReplicationState::Snapshotting { .. } => false,
        }
    }
}
