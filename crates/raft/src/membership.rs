//! Cluster configuration as the log sees it.
//!
//! A configuration entry takes effect on every server **at append
//! time**, not at commit; if the entry is later truncated away by
//! conflict resolution, the previous configuration is restored. At most
//! one configuration entry may sit uncommitted.

use common::{LogIndex, Membership};

/// The configuration history still relevant to this node: the base the
/// snapshot vouches for plus every configuration entry in the log.
#[derive(Debug)]
pub struct MembershipState {
    /// `(index, membership)` pairs, ascending; the first is the
    /// committed base, the last is the configuration in force.
    history: Vec<(LogIndex, Membership)>,
}

impl MembershipState {
    pub fn new(base_index: LogIndex, base: Membership) -> Self {
        Self {
            history: vec![(base_index, base)],
        }
    }

    /// The configuration in force.
    pub fn effective(&self) -> &Membership {
        &self.history.last().expect("history never empty").1
    }

    /// Index of the configuration entry in force (0 for the bootstrap
    /// default).
    pub fn effective_index(&self) -> LogIndex {
        self.history.last().expect("history never empty").0
    }

    /// Whether a configuration entry above `commit_index` exists.
    pub fn has_pending(&self, commit_index: LogIndex) -> bool {
        self.effective_index() > commit_index
    }

    /// A configuration entry was appended at `index`.
    pub fn apply(&mut self, index: LogIndex, membership: Membership) {
        debug_assert!(index > self.effective_index());
        self.history.push((index, membership));
    }

    /// Conflict truncation removed entries at and after `from`.
    pub fn rollback(&mut self, from: LogIndex) {
        while self.history.len() > 1 && self.history.last().unwrap().0 >= from {
            self.history.pop();
        }
    }

    /// Commit advanced; configurations at or below it are settled.
    pub fn commit(&mut self, commit_index: LogIndex) {
        while self.history.len() > 1 && self.history[1].0 <= commit_index {
            self.history.remove(0);
        }
    }

    /// Configuration in force at `index` (for snapshot metadata).
    pub fn at(&self, index: LogIndex) -> &Membership {
        let mut found = &self.history[0].1;
        for (entry_index, membership) in &self.history {
            if *entry_index <= index {
                found = membership;
            }
        }
        found
    }

    /// Replace everything with an installed snapshot's configuration.
    pub fn install(&mut self, index: LogIndex, membership: Membership) {
        self.history = vec![(index, membership)];
    }
}
