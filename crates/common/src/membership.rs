//! Cluster membership: the ordered server set and its quorum arithmetic.

use crate::{LogIndex, NodeId, RaftError, RaftResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Role a server plays within a configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    /// Counts toward quorum and may become leader.
    Voter,
    /// Receives replication but does not vote.
    NonVoter,
    /// Idle promotion target; receives no replication until promoted.
    Spare,
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRole::Voter => write!(f, "voter"),
            ServerRole::NonVoter => write!(f, "non-voter"),
            ServerRole::Spare => write!(f, "spare"),
        }
    }
}

/// One server in a configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: NodeId,
    pub address: String,
    pub role: ServerRole,
}

/// An ordered set of servers, unique by id.
///
/// Replicated through configuration log entries; on each server the
/// configuration in force is the one from the latest configuration entry
/// in its log, committed or not.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    servers: Vec<Server>,
}

impl Membership {
    /// Build a configuration, validating id uniqueness.
    ///
    /// # Errors
    ///
    /// Returns `RaftError::Corrupt` if a server id is zero or repeated.
    pub fn new(mut servers: Vec<Server>) -> RaftResult<Self> {
        servers.sort_by_key(|s| s.id);
        for pair in servers.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(RaftError::Corrupt(format!(
                    "duplicate server id {} in configuration",
                    pair[0].id
                )));
            }
        }
        if servers.iter().any(|s| s.id == 0) {
            return Err(RaftError::Corrupt("server id 0 is reserved".into()));
        }
        Ok(Self { servers })
    }

    /// A configuration containing a single voter. Used by bootstrap.
    pub fn single(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            servers: vec![Server {
                id,
                address: address.into(),
                role: ServerRole::Voter,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn get(&self, id: NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Ids of all servers that receive replication (voters and non-voters).
    pub fn replication_targets(&self, except: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.servers
            .iter()
            .filter(move |s| s.id != except && s.role != ServerRole::Spare)
            .map(|s| s.id)
    }

    pub fn voter_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.servers
            .iter()
            .filter(|s| s.role == ServerRole::Voter)
            .map(|s| s.id)
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.get(id).is_some_and(|s| s.role == ServerRole::Voter)
    }

    /// Majority size over the current voters.
    pub fn quorum_size(&self) -> usize {
        self.voter_ids().count() / 2 + 1
    }

    /// Whether the given voter ids form a quorum.
    pub fn has_quorum<I: IntoIterator<Item = NodeId>>(&self, granted: I) -> bool {
        let count = granted
            .into_iter()
            .filter(|id| self.is_voter(*id))
            .count();
        count >= self.quorum_size()
    }

    /// Highest index replicated on a quorum of voters.
    ///
    /// `matched` holds the leader's view of every peer's match index; the
    /// leader itself counts with `own_last_index`.
    pub fn quorum_match_index(
        &self,
        leader: NodeId,
        own_last_index: LogIndex,
        matched: &BTreeMap<NodeId, LogIndex>,
    ) -> LogIndex {
        let mut indexes: Vec<LogIndex> = self
            .voter_ids()
            .map(|id| {
                if id == leader {
                    own_last_index
                } else {
                    matched.get(&id).copied().unwrap_or(0)
                }
            })
            .collect();
        if indexes.is_empty() {
            return 0;
        }
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes[self.quorum_size() - 1]
    }

    /// Return a copy with `server` added.
    ///
    /// # Errors
    ///
    /// Returns `RaftError::Busy` if the id is already present.
    pub fn with_added(&self, server: Server) -> RaftResult<Self> {
        if self.contains(server.id) {
            return Err(RaftError::Busy);
        }
        let mut servers = self.servers.clone();
        servers.push(server);
        Membership::new(servers)
    }

    /// Return a copy with the role of `id` replaced.
    pub fn with_role(&self, id: NodeId, role: ServerRole) -> RaftResult<Self> {
        let mut servers = self.servers.clone();
        let server = servers.iter_mut().find(|s| s.id == id).ok_or_else(|| {
            RaftError::Corrupt(format!("server {id} is not in the configuration"))
        })?;
        server.role = role;
        Ok(Self { servers })
    }

    /// Return a copy with `id` removed.
    pub fn with_removed(&self, id: NodeId) -> RaftResult<Self> {
        if !self.contains(id) {
            return Err(RaftError::Corrupt(format!(
                "server {id} is not in the configuration"
            )));
        }
        let servers = self
            .servers
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();
        Ok(Self { servers })
    }
}
