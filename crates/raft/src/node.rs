//! The public handle to a running Raft node.
//!
//! [`Raft`] is a cheap clone over the core task's channel. Client
//! operations resolve once their entry is committed **and applied** on
//! this node; inbound RPC methods are what a transport server calls
//! when a peer's request arrives.

use crate::consensus::{ConsensusModule, RecoveredState};
use crate::core::{RaftCore, RaftMsg};
use crate::log::LogStore;
use crate::message::{
    AppendEntries, AppendEntriesResult, InstallSnapshot, InstallSnapshotResult, RequestVote,
    RequestVoteResult, TimeoutNow,
};
use crate::metrics::Metrics;
use crate::network::RaftNetwork;
use crate::observer::RaftEvent;
use crate::state_machine::StateMachine;
use common::{Config, Entry, LogIndex, Membership, NodeId, RaftError, RaftResult};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use storage::{HardState, Storage};
use tokio::sync::{mpsc, oneshot, watch};

/// Handle to a running node. Clone freely; all clones speak to the same
/// core task.
#[derive(Clone)]
pub struct Raft {
    tx: mpsc::UnboundedSender<RaftMsg>,
    metrics: watch::Receiver<Metrics>,
}

impl Raft {
    /// Initialise a brand-new cluster of one: persist term 1 and the
    /// initial configuration at index 1, then shut the storage down
    /// again. Run exactly once, on the first node only; every other
    /// node starts empty and learns the configuration over the wire.
    ///
    /// # Errors
    ///
    /// `RaftError::Exhausted` when the data directory already carries
    /// state.
    pub async fn bootstrap(
        id: NodeId,
        address: impl Into<String>,
        dir: &Path,
        config: &Config,
    ) -> RaftResult<()> {
        config.validate()?;
        let (mut storage, initial) = Storage::open(dir, config)?;
        if initial.hard_state.term != 0
            || !initial.entries.is_empty()
            || initial.snapshot.is_some()
        {
            return Err(RaftError::Exhausted(
                "data directory is already initialised".into(),
            ));
        }

        storage.metadata.save(&HardState {
            term: 1,
            voted_for: None,
            first_index: 1,
        })?;
        let membership = Membership::single(id, address);
        let entry = Entry::membership(1, 1, membership);
        storage
            .writer
            .append(vec![entry])
            .await
            .map_err(|_| RaftError::Shutdown)??;
        storage.close().await?;
        tracing::info!(id, "bootstrapped new cluster");
        Ok(())
    }

    /// Recover state from `dir` and start the node (it enters follower).
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        id: NodeId,
        dir: &Path,
        config: Config,
        network: Arc<dyn RaftNetwork>,
        mut fsm: Box<dyn StateMachine>,
    ) -> RaftResult<Raft> {
        config.validate()?;
        let (storage, initial) = Storage::open(dir, &config)?;

        let (snapshot_index, snapshot_term, base_membership) = match &initial.snapshot {
            Some(file) => (
                file.meta.last_included_index,
                file.meta.last_included_term,
                (file.meta.last_included_index, file.meta.membership.clone()),
            ),
            None => (0, 0, (0, Membership::default())),
        };
        if let Some(file) = &initial.snapshot {
            let payload = storage.snapshots.read_payload(file)?;
            fsm.restore(&payload);
        }

        let log = LogStore::new(snapshot_index, snapshot_term, initial.entries);
        let consensus = ConsensusModule::new(
            id,
            config.clone(),
            RecoveredState {
                term: initial.hard_state.term,
                voted_for: initial.hard_state.voted_for,
                log,
                base_membership,
            },
            Instant::now(),
        );

        let Storage {
            metadata,
            writer,
            snapshots,
        } = storage;
        let handles = RaftCore::spawn(
            consensus,
            config,
            metadata,
            writer,
            snapshots,
            network,
            fsm,
            snapshot_index,
        );
        tracing::info!(id, "raft node started");
        Ok(Raft {
            tx: handles.tx,
            metrics: handles.metrics,
        })
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RaftMsg) -> RaftResult<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Replicate an opaque command. Resolves with its log index once
    /// committed and applied here.
    pub async fn submit(&self, data: Vec<u8>) -> RaftResult<LogIndex> {
        self.call(|tx| RaftMsg::Submit { data, tx }).await?
    }

    /// Add a server to the cluster as a non-voter.
    pub async fn add_server(&self, id: NodeId, address: impl Into<String>) -> RaftResult<LogIndex> {
        let address = address.into();
        self.call(|tx| RaftMsg::AddServer { id, address, tx }).await?
    }

    /// Promote a caught-up non-voter to voter.
    pub async fn promote_server(&self, id: NodeId) -> RaftResult<LogIndex> {
        self.call(|tx| RaftMsg::PromoteServer { id, tx }).await?
    }

    /// Remove a server from the cluster.
    pub async fn remove_server(&self, id: NodeId) -> RaftResult<LogIndex> {
        self.call(|tx| RaftMsg::RemoveServer { id, tx }).await?
    }

    /// Hand leadership to `target` once it is caught up.
    pub async fn transfer_leadership(&self, target: NodeId) -> RaftResult<()> {
        self.call(|tx| RaftMsg::TransferLeadership { target, tx })
            .await?
    }

    /// Register a watch callback for leader, term, and availability
    /// changes. Bounded; fired synchronously on the core task.
    pub async fn register_observer(
        &self,
        observer: impl Fn(&RaftEvent) + Send + 'static,
    ) -> RaftResult<()> {
        self.call(|tx| RaftMsg::RegisterObserver {
            observer: Box::new(observer),
            tx,
        })
        .await?
    }

    /// Live view of the node's state.
    pub fn metrics(&self) -> watch::Receiver<Metrics> {
        self.metrics.clone()
    }

    /// Stop cooperatively: drain in-flight disk writes, abandon
    /// outbound sends, fail pending client operations with `Cancelled`.
    pub async fn shutdown(&self) -> RaftResult<()> {
        self.call(|tx| RaftMsg::Shutdown { tx }).await
    }

    // ---- inbound RPCs (for transport servers) --------------------------

    pub async fn append_entries(&self, req: AppendEntries) -> RaftResult<AppendEntriesResult> {
        self.call(|tx| RaftMsg::AppendEntries { req, tx }).await
    }

    pub async fn request_vote(&self, req: RequestVote) -> RaftResult<RequestVoteResult> {
        self.call(|tx| RaftMsg::RequestVote { req, tx }).await
    }

    pub async fn install_snapshot(
        &self,
        req: InstallSnapshot,
    ) -> RaftResult<InstallSnapshotResult> {
        self.call(|tx| RaftMsg::InstallSnapshot { req, tx }).await
    }

    pub async fn timeout_now(&self, req: TimeoutNow) -> RaftResult<()> {
        self.tx
            .send(RaftMsg::TimeoutNow { req })
            .map_err(|_| RaftError::Shutdown)
    }
}
