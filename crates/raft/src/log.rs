//! The in-memory log store: a contiguous window over the durable log.
//!
//! Holds `[offset + 1, last_index]`, where everything at or below the
//! snapshot boundary may already be compacted away. Replication batches
//! in flight pin their range so compaction cannot pull entries out from
//! under them; pins are opaque handles released on acknowledgement.

use common::{Entry, LogIndex, RaftError, RaftResult, Term};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct LogStore {
    /// Index preceding `entries[0]`.
    offset: LogIndex,
    entries: VecDeque<Entry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    pins: Vec<Pin>,
    next_pin: u64,
}

#[derive(Debug)]
struct Pin {
    id: u64,
    from: LogIndex,
    to: LogIndex,
}

/// Opaque handle for a pinned range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinId(u64);

impl LogStore {
    /// Rebuild the store from recovered state. `entries` must be the
    /// contiguous suffix directly after the snapshot boundary.
    pub fn new(snapshot_index: LogIndex, snapshot_term: Term, entries: Vec<Entry>) -> Self {
        if let Some(first) = entries.first() {
            assert_eq!(first.index, snapshot_index + 1, "log suffix must follow snapshot");
        }
        Self {
            offset: snapshot_index,
            entries: entries.into(),
            snapshot_index,
            snapshot_term,
            pins: Vec::new(),
            next_pin: 0,
        }
    }

    pub fn first_index(&self) -> LogIndex {
        self.offset + 1
    }

    pub fn last_index(&self) -> LogIndex {
        self.offset + self.entries.len() as u64
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        if index <= self.offset {
            return None;
        }
        self.entries.get((index - self.offset - 1) as usize)
    }

    /// Term of `index`, answering the snapshot boundary and the
    /// before-the-log sentinel 0 as well.
    pub fn term_of(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Clone out `[from, to]` for a replication batch.
    pub fn range(&self, from: LogIndex, to: LogIndex) -> Vec<Entry> {
        let mut out = Vec::new();
        let mut index = from;
        while index <= to {
            match self.get(index) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
            index += 1;
        }
        out
    }

    /// Append entries continuing the tail. Crossing a term boundary
    /// within one batch is fine; a gap is a caller bug.
    pub fn append(&mut self, entries: &[Entry]) {
        for entry in entries {
            assert_eq!(entry.index, self.last_index() + 1, "log append gap");
            self.entries.push_back(entry.clone());
        }
    }

    /// Drop every entry at or after `from` (conflict resolution).
    pub fn truncate_suffix(&mut self, from: LogIndex) {
        assert!(
            from > self.snapshot_index,
            "cannot truncate into the snapshot"
        );
        while self.last_index() >= from {
            self.entries.pop_back();
        }
    }

    /// Record that a snapshot now covers everything through `index`.
    pub fn note_snapshot(&mut self, index: LogIndex, term: Term) {
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Release entries up to and including `through` after compaction.
    ///
    /// # Errors
    ///
    /// `RaftError::Busy` when a replication batch still pins part of the
    /// range; the caller retries after the batch completes.
    pub fn truncate_prefix(&mut self, through: LogIndex) -> RaftResult<()> {
        assert!(
            through <= self.snapshot_index,
            "compaction may not pass the snapshot"
        );
        if self.pins.iter().any(|p| p.from <= through) {
            return Err(RaftError::Busy);
        }
        while self.offset < through {
            self.entries.pop_front();
            self.offset += 1;
        }
        Ok(())
    }

    /// Pin `[from, to]` against compaction while a batch is in flight.
    pub fn acquire(&mut self, from: LogIndex, to: LogIndex) -> PinId {
        let id = self.next_pin;
        self.next_pin += 1;
        self.pins.push(Pin { id, from, to });
        PinId(id)
    }

    pub fn release(&mut self, pin: PinId) {
        self.pins.retain(|p| p.id != pin.0);
    }

    /// Swap in an installed snapshot, discarding the covered prefix (or
    /// the whole log when it conflicts).
    pub fn install_snapshot(&mut self, index: LogIndex, term: Term) {
        self.pins.clear();
        if self.term_of(index) == Some(term) && index <= self.last_index() {
            // Log agrees with the snapshot; keep the suffix.
            while self.offset < index {
                self.entries.pop_front();
                self.offset += 1;
            }
        } else {
            self.entries.clear();
            self.offset = index;
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }
}
