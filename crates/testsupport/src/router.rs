//! In-memory message routing between in-process Raft nodes.

use async_trait::async_trait;
use common::{NodeId, RaftError, RaftResult};
use raft::message::{
    AppendEntries, AppendEntriesResult, InstallSnapshot, InstallSnapshotResult, RequestVote,
    RequestVoteResult, TimeoutNow,
};
use raft::{Raft, RaftNetwork};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeId, Raft>,
    /// Blocked directed links `(from, to)`.
    cut: HashSet<(NodeId, NodeId)>,
}

/// Shared registry of running nodes plus the partition table.
#[derive(Clone, Default)]
pub struct Router {
    inner: Arc<Mutex<Inner>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a node reachable under its id.
    pub fn register(&self, id: NodeId, raft: Raft) {
        self.inner.lock().unwrap().nodes.insert(id, raft);
    }

    pub fn deregister(&self, id: NodeId) {
        self.inner.lock().unwrap().nodes.remove(&id);
    }

    /// Cut every link to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        let others: Vec<NodeId> = inner.nodes.keys().copied().filter(|n| *n != id).collect();
        for other in others {
            inner.cut.insert((id, other));
            inner.cut.insert((other, id));
        }
    }

    /// Restore every link.
    pub fn heal(&self) {
        self.inner.lock().unwrap().cut.clear();
    }

    /// The outbound transport for one node.
    pub fn network(&self, from: NodeId) -> Arc<NodeNetwork> {
        Arc::new(NodeNetwork {
            router: self.clone(),
            from,
        })
    }

    fn target(&self, from: NodeId, to: NodeId) -> RaftResult<Raft> {
        let inner = self.inner.lock().unwrap();
        if inner.cut.contains(&(from, to)) {
            return Err(RaftError::Io(std::io::Error::other("link cut")));
        }
        inner
            .nodes
            .get(&to)
            .cloned()
            .ok_or_else(|| RaftError::Io(std::io::Error::other("no such node")))
    }
}

/// One node's view of the router.
pub struct NodeNetwork {
    router: Router,
    from: NodeId,
}

#[async_trait]
impl RaftNetwork for NodeNetwork {
    async fn append_entries(
        &self,
        target: NodeId,
        _address: &str,
        req: AppendEntries,
    ) -> RaftResult<AppendEntriesResult> {
        self.router.target(self.from, target)?.append_entries(req).await
    }

    async fn request_vote(
        &self,
        target: NodeId,
        _address: &str,
        req: RequestVote,
    ) -> RaftResult<RequestVoteResult> {
        self.router.target(self.from, target)?.request_vote(req).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        _address: &str,
        req: InstallSnapshot,
    ) -> RaftResult<InstallSnapshotResult> {
        self.router
            .target(self.from, target)?
            .install_snapshot(req)
            .await
    }

    async fn timeout_now(&self, target: NodeId, _address: &str, req: TimeoutNow) -> RaftResult<()> {
        self.router.target(self.from, target)?.timeout_now(req).await
    }
}
