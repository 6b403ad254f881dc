//! Election timing and vote collection.

use common::NodeId;
use rand::Rng;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Draw a fresh randomised election timeout uniformly from
/// `[base, 2 * base)`.
pub fn random_timeout(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(base_ms..base_ms * 2))
}

/// Ballots received during one pre-vote probe or election.
#[derive(Debug)]
pub struct VoteTally {
    granted: HashSet<NodeId>,
    /// Still in the non-term-bumping probe phase.
    pub pre_vote: bool,
    pub started: Instant,
}

impl VoteTally {
    pub fn new(self_id: NodeId, pre_vote: bool, now: Instant) -> Self {
        let mut granted = HashSet::new();
        granted.insert(self_id);
        Self {
            granted,
            pre_vote,
            started: now,
        }
    }

    pub fn record(&mut self, from: NodeId) {
        self.granted.insert(from);
    }

    pub fn granted(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.granted.iter().copied()
    }
}
