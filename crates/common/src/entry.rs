//! The unit of replication: a log entry.

use crate::membership::Membership;
use crate::{LogIndex, Term};
use serde::{Deserialize, Serialize};

/// Payload carried by a log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An opaque application command. The library never inspects the bytes.
    Command(Vec<u8>),
    /// A cluster configuration. Takes effect on each server at append time.
    Membership(Membership),
    /// An empty entry the leader appends on election so entries from
    /// earlier terms become committable.
    Barrier,
}

impl EntryPayload {
    /// Short name used in logs and activity descriptions.
    pub fn kind(&self) -> &'static str {
        match self {
            EntryPayload::Command(_) => "command",
            EntryPayload::Membership(_) => "membership",
            EntryPayload::Barrier => "barrier",
        }
    }
}

/// One unit of the replicated log. Immutable once durably appended.
///
/// Entries at an identical `(term, index)` are byte-identical across
/// servers (the Log Matching property).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: EntryPayload,
}

impl Entry {
    /// Build a command entry.
    pub fn command(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Command(data),
        }
    }

    /// Build a configuration entry.
    pub fn membership(term: Term, index: LogIndex, membership: Membership) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Membership(membership),
        }
    }

    /// Build a barrier entry.
    pub fn barrier(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Barrier,
        }
    }
}
