//! The user state machine interface.
//!
//! Committed entries are handed to the embedder through this trait, on
//! the core task, in index order, exactly once per process lifetime of
//! the node. Snapshot capture and restore round-trip the machine's
//! entire state as opaque bytes.

use common::Entry;

pub trait StateMachine: Send + 'static {
    /// Apply one committed entry. Barrier and configuration entries are
    /// delivered too so the machine can observe indexes if it wants to;
    /// most implementations only act on commands.
    fn apply(&mut self, entry: &Entry);

    /// Serialize the current state for a snapshot.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the current state with a snapshot payload.
    fn restore(&mut self, data: &[u8]);
}

/// State machine that ignores everything. Useful when only the
/// replicated log itself is of interest.
#[derive(Debug, Default)]
pub struct NoopStateMachine;

impl StateMachine for NoopStateMachine {
    fn apply(&mut self, _entry: &Entry) {}

    fn snapshot(&self) -> Vec<u8> {
        Vec::new()
    }

    fn restore(&mut self, _data: &[u8]) {}
}
