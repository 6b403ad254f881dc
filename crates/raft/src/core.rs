//! The core task: single-owner event loop for one Raft node.
//!
//! All consensus state lives here, mutated only by this task; exclusivity
//! is by task confinement, no locks. The loop multiplexes the API
//! channel, a coarse tick, and ordered disk-write completions. Every
//! operation that touches disk or the network returns immediately; its
//! continuation runs when the corresponding completion event arrives.
//!
//! Ordering rules enforced here:
//! - hard state (term/vote) is flushed before any message that depends
//!   on it leaves the node;
//! - an AppendEntries acknowledgement covering new entries is released
//!   by the persistence pump only after the disk append completes, in
//!   submission order;
//! - per peer, outbound requests are issued sequentially by a dedicated
//!   forwarder task, so responses come back in order.

use crate::consensus::{ConsensusModule, Effects, Outbound};
use crate::message::{
    AppendEntriesResult, InstallSnapshot, InstallSnapshotResult, Message, RequestVote,
    RequestVoteResult, TimeoutNow,
};
use crate::metrics::Metrics;
use crate::network::RaftNetwork;
use crate::observer::{MAX_OBSERVERS, Observer, RaftEvent};
use crate::state_machine::StateMachine;
use common::{Config, LogIndex, NodeId, RaftError, RaftResult, Term};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use storage::{
    HardState, InstallSink, LogWriter, MetadataStore, SnapshotFile, SnapshotStore, WriteCompletion,
};
use tokio::sync::{mpsc, oneshot, watch};

pub(crate) type ClientTx = oneshot::Sender<RaftResult<LogIndex>>;

/// Requests into the core task.
pub(crate) enum RaftMsg {
    AppendEntries {
        req: crate::message::AppendEntries,
        tx: oneshot::Sender<AppendEntriesResult>,
    },
    RequestVote {
        req: RequestVote,
        tx: oneshot::Sender<RequestVoteResult>,
    },
    InstallSnapshot {
        req: InstallSnapshot,
        tx: oneshot::Sender<InstallSnapshotResult>,
    },
    TimeoutNow {
        req: TimeoutNow,
    },
    /// Response that came back from a peer forwarder task.
    PeerResponse {
        peer: NodeId,
        message: Message,
    },
    Submit {
        data: Vec<u8>,
        tx: ClientTx,
    },
    AddServer {
        id: NodeId,
        address: String,
        tx: ClientTx,
    },
    PromoteServer {
        id: NodeId,
        tx: ClientTx,
    },
    RemoveServer {
        id: NodeId,
        tx: ClientTx,
    },
    TransferLeadership {
        target: NodeId,
        tx: oneshot::Sender<RaftResult<()>>,
    },
    RegisterObserver {
        observer: Observer,
        tx: oneshot::Sender<RaftResult<()>>,
    },
    Shutdown {
        tx: oneshot::Sender<()>,
    },
}

/// What to do once a disk write completes.
enum GatedAction {
    None,
    /// Release an AppendEntries acknowledgement.
    Reply {
        tx: oneshot::Sender<AppendEntriesResult>,
        reply: AppendEntriesResult,
    },
}

struct PumpItem {
    /// Own log is durable through here once the write lands.
    last_index: Option<LogIndex>,
    action: GatedAction,
}

struct PumpDone {
    item: PumpItem,
    result: RaftResult<()>,
}

/// Awaits write completions strictly in submission order and posts them
/// back to the core loop.
async fn run_pump(
    mut rx: mpsc::UnboundedReceiver<(WriteCompletion, PumpItem)>,
    tx: mpsc::UnboundedSender<PumpDone>,
) {
    while let Some((completion, item)) = rx.recv().await {
        let result = match completion.await {
            Ok(result) => result,
            Err(_) => Err(RaftError::Shutdown),
        };
        if tx.send(PumpDone { item, result }).is_err() {
            return;
        }
    }
}

pub(crate) struct RaftCore {
    consensus: ConsensusModule,
    config: Config,
    metadata: MetadataStore,
    writer: Option<LogWriter>,
    snapshots: SnapshotStore,
    network: Arc<dyn RaftNetwork>,
    fsm: Box<dyn StateMachine>,
    observers: Vec<Observer>,
    last_applied: LogIndex,
    /// Client completions keyed by log index, with the term the entry
    /// was proposed under.
    waiters: BTreeMap<LogIndex, Vec<(Term, ClientTx)>>,
    pending_promotions: HashMap<NodeId, ClientTx>,
    pending_transfer: Option<oneshot::Sender<RaftResult<()>>>,
    peer_tx: HashMap<NodeId, mpsc::UnboundedSender<(String, Message)>>,
    pump_tx: mpsc::UnboundedSender<(WriteCompletion, PumpItem)>,
    tx_self: mpsc::UnboundedSender<RaftMsg>,
    metrics_tx: watch::Sender<Metrics>,
    /// Inbound snapshot transfer plus the instant of its last chunk.
    install: Option<(InstallSink, Instant)>,
    /// Cached payload of the snapshot being streamed to followers.
    current_snapshot: Option<(SnapshotFile, Arc<Vec<u8>>)>,
    /// Disk failure latch; the node is unavailable once set.
    failed: Option<RaftError>,
}

pub(crate) struct CoreHandles {
    pub tx: mpsc::UnboundedSender<RaftMsg>,
    pub metrics: watch::Receiver<Metrics>,
}

impl RaftCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        consensus: ConsensusModule,
        config: Config,
        metadata: MetadataStore,
        writer: LogWriter,
        snapshots: SnapshotStore,
        network: Arc<dyn RaftNetwork>,
        fsm: Box<dyn StateMachine>,
        last_applied: LogIndex,
    ) -> CoreHandles {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pump_tx, pump_rx) = mpsc::unbounded_channel();
        let (pump_done_tx, pump_done_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_pump(pump_rx, pump_done_tx));

        let metrics = Metrics {
            id: consensus.id(),
            term: consensus.term(),
            role: consensus.role(),
            leader: consensus.leader_hint(),
            last_log_index: consensus.log().last_index(),
            commit_index: consensus.commit_index(),
            last_applied,
            snapshot_index: consensus.log().snapshot_index(),
            membership: consensus.membership().clone(),
        };
        let (metrics_tx, metrics_rx) = watch::channel(metrics);

        let core = RaftCore {
            consensus,
            config,
            metadata,
            writer: Some(writer),
            snapshots,
            network,
            fsm,
            observers: Vec::new(),
            last_applied,
            waiters: BTreeMap::new(),
            pending_promotions: HashMap::new(),
            pending_transfer: None,
            peer_tx: HashMap::new(),
            pump_tx,
            tx_self: tx.clone(),
            metrics_tx,
            install: None,
            current_snapshot: None,
            failed: None,
        };
        tokio::spawn(core.run(rx, pump_done_rx));

        CoreHandles {
            tx,
            metrics: metrics_rx,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<RaftMsg>,
        mut pump_done_rx: mpsc::UnboundedReceiver<PumpDone>,
    ) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                Some(done) = pump_done_rx.recv() => self.on_pump_done(done),

                _ = tick.tick() => {
                    let now = Instant::now();
                    let mut fx = Effects::default();
                    self.consensus.tick(now, &mut fx);
                    self.apply_effects(fx, None);
                    self.check_install_timeout(now);
                }

                msg = rx.recv() => match msg {
                    Some(RaftMsg::Shutdown { tx }) => {
                        self.shutdown().await;
                        let _ = tx.send(());
                        return;
                    }
                    Some(msg) => self.handle_msg(msg),
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
            }
            self.publish_metrics();
        }
    }

    fn handle_msg(&mut self, msg: RaftMsg) {
        let now = Instant::now();
        match msg {
            RaftMsg::AppendEntries { req, tx } => {
                if self.failed.is_some() {
                    // Unavailable nodes go silent; the leader treats the
                    // dropped reply as an unreachable peer.
                    return;
                }
                let mut fx = Effects::default();
                let (reply, gated) = self.consensus.handle_append_entries(&req, now, &mut fx);
                if gated {
                    self.apply_effects(fx, Some(GatedAction::Reply { tx, reply }));
                } else {
                    self.apply_effects(fx, None);
                    let _ = tx.send(reply);
                }
            }
            RaftMsg::RequestVote { req, tx } => {
                if self.failed.is_some() {
                    return;
                }
                let mut fx = Effects::default();
                let reply = self.consensus.handle_request_vote(&req, now, &mut fx);
                // The vote is persisted inside apply_effects, before the
                // reply leaves.
                self.apply_effects(fx, None);
                if self.failed.is_none() {
                    let _ = tx.send(reply);
                }
            }
            RaftMsg::InstallSnapshot { req, tx } => {
                if self.failed.is_some() {
                    return;
                }
                self.handle_install(req, tx, now);
            }
            RaftMsg::TimeoutNow { req } => {
                let mut fx = Effects::default();
                self.consensus.handle_timeout_now(&req, now, &mut fx);
                self.apply_effects(fx, None);
            }
            RaftMsg::PeerResponse { peer, message } => {
                let mut fx = Effects::default();
                match &message {
                    Message::RequestVoteResult(res) => {
                        self.consensus
                            .handle_request_vote_result(peer, res, now, &mut fx);
                    }
                    Message::AppendEntriesResult(res) => {
                        self.consensus
                            .handle_append_entries_result(peer, res, now, &mut fx);
                    }
                    Message::InstallSnapshotResult(res) => {
                        let size = self
                            .current_snapshot
                            .as_ref()
                            .map(|(file, _)| file.meta.size)
                            .unwrap_or(0);
                        self.consensus
                            .handle_install_snapshot_result(peer, res, size, now, &mut fx);
                    }
                    _ => {}
                }
                self.apply_effects(fx, None);
            }
            RaftMsg::Submit { data, tx } => {
                if let Some(err) = self.unavailable() {
                    let _ = tx.send(Err(err));
                    return;
                }
                let mut fx = Effects::default();
                let result = self
                    .consensus
                    .propose(common::EntryPayload::Command(data), now, &mut fx);
                self.settle_proposal(result, tx);
                self.apply_effects(fx, None);
            }
            RaftMsg::AddServer { id, address, tx } => {
                if let Some(err) = self.unavailable() {
                    let _ = tx.send(Err(err));
                    return;
                }
                let mut fx = Effects::default();
                let result = self.consensus.add_server(id, address, now, &mut fx);
                self.settle_proposal(result, tx);
                self.apply_effects(fx, None);
            }
            RaftMsg::RemoveServer { id, tx } => {
                if let Some(err) = self.unavailable() {
                    let _ = tx.send(Err(err));
                    return;
                }
                let mut fx = Effects::default();
                let result = self.consensus.remove_server(id, now, &mut fx);
                self.settle_proposal(result, tx);
                self.apply_effects(fx, None);
            }
            RaftMsg::PromoteServer { id, tx } => {
                if let Some(err) = self.unavailable() {
                    let _ = tx.send(Err(err));
                    return;
                }
                let mut fx = Effects::default();
                match self.consensus.promote_server(id, now, &mut fx) {
                    // Already caught up: the promotion entry is in the log.
                    Ok(Some(index)) => {
                        self.waiters
                            .entry(index)
                            .or_default()
                            .push((self.consensus.term(), tx));
                    }
                    // Catch-up rounds pending.
                    Ok(None) => {
                        self.pending_promotions.insert(id, tx);
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err));
                    }
                }
                self.apply_effects(fx, None);
            }
            RaftMsg::TransferLeadership { target, tx } => {
                if let Some(err) = self.unavailable() {
                    let _ = tx.send(Err(err));
                    return;
                }
                let mut fx = Effects::default();
                match self.consensus.transfer_leadership(target, now, &mut fx) {
                    Ok(()) => self.pending_transfer = Some(tx),
                    Err(err) => {
                        let _ = tx.send(Err(err));
                    }
                }
                self.apply_effects(fx, None);
            }
            RaftMsg::RegisterObserver { observer, tx } => {
                if self.observers.len() >= MAX_OBSERVERS {
                    let _ = tx.send(Err(RaftError::Exhausted(format!(
                        "at most {MAX_OBSERVERS} observers"
                    ))));
                } else {
                    self.observers.push(observer);
                    let _ = tx.send(Ok(()));
                }
            }
            RaftMsg::Shutdown { .. } => unreachable!("handled in the run loop"),
        }
    }

    fn unavailable(&self) -> Option<RaftError> {
        self.failed.as_ref().map(|e| e.duplicate())
    }

    fn settle_proposal(&mut self, result: RaftResult<LogIndex>, tx: ClientTx) {
        match result {
            Ok(index) => {
                self.waiters
                    .entry(index)
                    .or_default()
                    .push((self.consensus.term(), tx));
            }
            Err(err) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    // ---- effect application -------------------------------------------

    fn apply_effects(&mut self, fx: Effects, gated: Option<GatedAction>) {
        if self.failed.is_some() {
            return;
        }

        // 1. Hard state first: nothing below may be observed before the
        //    term and vote are durable.
        if fx.persist_hard_state {
            let hard = HardState {
                term: self.consensus.term(),
                voted_for: self.consensus.voted_for(),
                first_index: self.consensus.log().first_index(),
            };
            if let Err(err) = self.metadata.save(&hard) {
                self.latch(err);
                return;
            }
        }

        // 2. Log mutations, submitted in order; the pump gates dependent
        //    replies on the final completion.
        if let Some(from) = fx.truncate_log_from {
            self.fail_waiters_from(from);
        }
        let mut completion = None;
        if let Some(from) = fx.truncate_log_from {
            if let Some(writer) = &self.writer {
                completion = Some(writer.truncate_suffix(from));
            }
        }
        let mut appended_through = None;
        if !fx.append_entries.is_empty() {
            appended_through = Some(fx.append_entries[fx.append_entries.len() - 1].index);
            if let Some(writer) = &self.writer {
                completion = Some(writer.append(fx.append_entries));
            }
        }
        match (completion, gated) {
            (Some(completion), gated) => {
                let item = PumpItem {
                    last_index: appended_through,
                    action: gated.unwrap_or(GatedAction::None),
                };
                let _ = self.pump_tx.send((completion, item));
            }
            (None, Some(GatedAction::Reply { tx, reply })) => {
                // Nothing was written after all; release immediately.
                let _ = tx.send(reply);
            }
            (None, _) => {}
        }

        // 3. Outbound requests.
        for out in fx.messages {
            self.send_message(out);
        }
        for peer in fx.snapshot_chunks {
            self.send_snapshot_chunk(peer);
        }

        // 4. Storage maintenance.
        if let Some(through) = fx.compact_through {
            self.compact(through);
        }
        if let Some(next_index) = fx.reset_log_to {
            if let Some(writer) = &self.writer {
                // Queued behind everything already submitted.
                let _ = writer.reset(next_index);
            }
            let hard = HardState {
                term: self.consensus.term(),
                voted_for: self.consensus.voted_for(),
                first_index: next_index,
            };
            if let Err(err) = self.metadata.save(&hard) {
                self.latch(err);
                return;
            }
        }

        // 5. Completions for long-running operations.
        if let Some((id, term, index)) = fx.promotion_appended {
            if let Some(tx) = self.pending_promotions.remove(&id) {
                self.waiters.entry(index).or_default().push((term, tx));
            }
        }
        if let Some((id, err)) = fx.promotion_failed {
            if let Some(tx) = self.pending_promotions.remove(&id) {
                let _ = tx.send(Err(err));
            }
        }
        if let Some(result) = fx.transfer_result {
            if let Some(tx) = self.pending_transfer.take() {
                let _ = tx.send(result);
            }
        }
        if fx.stepped_down {
            self.fail_all_waiters(|| RaftError::NotLeader {
                leader_hint: None,
            });
        }

        // 6. Observers.
        for event in &fx.events {
            self.fire_event(event);
        }

        // 7. Apply what just became committed.
        self.apply_committed();
    }

    fn on_pump_done(&mut self, done: PumpDone) {
        match done.result {
            Ok(()) => {
                if let Some(last) = done.item.last_index {
                    let mut fx = Effects::default();
                    self.consensus.on_log_durable(last, Instant::now(), &mut fx);
                    self.apply_effects(fx, None);
                }
                if let GatedAction::Reply { tx, reply } = done.item.action {
                    let _ = tx.send(reply);
                }
            }
            Err(err) => {
                // Dropping the reply sender leaves the leader waiting;
                // it will treat this node as unreachable, which it is.
                self.latch(err);
            }
        }
        self.publish_metrics();
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.consensus.commit_index() {
            let index = self.last_applied + 1;
            let Some(entry) = self.consensus.log().get(index) else {
                break;
            };
            let term = entry.term;
            self.fsm.apply(entry);
            self.last_applied = index;
            if let Some(waiters) = self.waiters.remove(&index) {
                for (expected_term, tx) in waiters {
                    let result = if expected_term == term {
                        Ok(index)
                    } else {
                        Err(RaftError::NotLeader {
                            leader_hint: self.consensus.leader_hint(),
                        })
                    };
                    let _ = tx.send(result);
                }
            }
        }
        self.maybe_take_snapshot();
    }

    fn maybe_take_snapshot(&mut self) {
        let snapshot_index = self.consensus.log().snapshot_index();
        if self.last_applied - snapshot_index < self.config.snapshot_threshold {
            return;
        }
        let index = self.last_applied;
        let Some(term) = self.consensus.log().term_of(index) else {
            return;
        };
        let membership = self.consensus.membership_at(index);
        let data = self.fsm.snapshot();

        match self.snapshots.save(term, index, membership, &data) {
            Ok(file) => {
                self.current_snapshot = Some((file, Arc::new(data)));
                let mut fx = Effects::default();
                self.consensus.on_snapshot_taken(index, term, &mut fx);
                if let Some(through) = fx.compact_through {
                    self.compact(through);
                }
            }
            Err(err) => {
                self.latch(err);
            }
        }
    }

    fn compact(&mut self, through: LogIndex) {
        if let Some(writer) = &self.writer {
            // Completion receiver dropped: compaction is best effort and
            // never blocks the protocol.
            let _ = writer.compact_through(through);
        }
        let hard = HardState {
            term: self.consensus.term(),
            voted_for: self.consensus.voted_for(),
            first_index: self.consensus.log().first_index(),
        };
        if let Err(err) = self.metadata.save(&hard) {
            self.latch(err);
            return;
        }
        if let Err(err) = self
            .snapshots
            .purge_older_than(self.consensus.log().snapshot_index())
        {
            tracing::warn!(%err, "stale snapshot purge failed");
        }
    }

    // ---- outbound ------------------------------------------------------

    fn send_message(&mut self, out: Outbound) {
        let Some(address) = self
            .consensus
            .membership()
            .get(out.to)
            .map(|s| s.address.clone())
        else {
            tracing::debug!(peer = out.to, "dropping message to unknown peer");
            return;
        };
        let sender = self.peer_sender(out.to);
        let _ = sender.send((address, out.message));
    }

    fn peer_sender(&mut self, peer: NodeId) -> &mpsc::UnboundedSender<(String, Message)> {
        if !self.peer_tx.contains_key(&peer) {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_peer_forwarder(
                peer,
                self.network.clone(),
                rx,
                self.tx_self.clone(),
            ));
            self.peer_tx.insert(peer, tx);
        }
        &self.peer_tx[&peer]
    }

    fn send_snapshot_chunk(&mut self, peer: NodeId) {
        let Some((offset, last_included)) = self.consensus.snapshot_transfer(peer) else {
            return;
        };

        // Make sure the cached payload matches the snapshot on disk.
        let reload = match &self.current_snapshot {
            Some((file, _)) => file.meta.last_included_index != last_included,
            None => true,
        };
        if reload {
            match self.snapshots.load_latest() {
                Ok(Some(file)) => match self.snapshots.read_payload(&file) {
                    Ok(payload) => {
                        self.current_snapshot = Some((file, Arc::new(payload)));
                    }
                    Err(err) => {
                        tracing::warn!(%err, "snapshot payload unreadable, transfer stalled");
                        return;
                    }
                },
                Ok(None) => {
                    tracing::warn!(peer, "no snapshot on disk for a pending transfer");
                    return;
                }
                Err(err) => {
                    tracing::warn!(%err, "snapshot lookup failed, transfer stalled");
                    return;
                }
            }
        }
        let (file, payload) = self.current_snapshot.as_ref().expect("cached above");

        let offset = if file.meta.last_included_index != last_included {
            // A newer snapshot superseded the transfer; restart it.
            self.consensus.restart_snapshot_transfer(
                peer,
                file.meta.last_included_index,
                Instant::now(),
            );
            0
        } else {
            offset
        };

        let end = (offset as usize + self.config.snapshot_chunk_size).min(payload.len());
        let data = payload[offset as usize..end].to_vec();
        let done = end == payload.len();
        let message = Message::InstallSnapshot(InstallSnapshot {
            term: self.consensus.term(),
            leader: self.consensus.id(),
            meta: file.meta.clone(),
            offset,
            data,
            done,
        });
        self.consensus.note_chunk_sent(peer);
        self.send_message(Outbound { to: peer, message });
    }

    // ---- inbound snapshot install --------------------------------------

    fn handle_install(
        &mut self,
        req: InstallSnapshot,
        tx: oneshot::Sender<InstallSnapshotResult>,
        now: Instant,
    ) {
        let mut fx = Effects::default();
        if !self.consensus.accept_install(req.term, req.leader, now, &mut fx) {
            self.apply_effects(fx, None);
            let _ = tx.send(InstallSnapshotResult {
                term: self.consensus.term(),
                offset: req.offset,
            });
            return;
        }

        // A transfer restarts whenever chunk zero arrives, or when the
        // metadata stops matching the sink in progress.
        let restart = match &self.install {
            Some((sink, _)) => sink.meta() != &req.meta,
            None => true,
        };
        if restart {
            if let Some((sink, _)) = self.install.take() {
                sink.abort();
            }
            if req.offset != 0 {
                // Ask the leader to start over.
                self.apply_effects(fx, None);
                let _ = tx.send(InstallSnapshotResult {
                    term: self.consensus.term(),
                    offset: 0,
                });
                return;
            }
            match self.snapshots.begin_install(req.meta.clone()) {
                Ok(sink) => self.install = Some((sink, now)),
                Err(err) => {
                    self.latch(err);
                    return;
                }
            }
        }

        let write_outcome = {
            let (sink, last_chunk) = self.install.as_mut().expect("sink exists");
            if sink.received() == req.offset {
                match sink.write_chunk(req.offset, &req.data) {
                    Ok(()) => {
                        *last_chunk = now;
                        Ok(sink.received())
                    }
                    Err(err) => Err(err),
                }
            } else {
                // Duplicate or gap; report where we are so the leader
                // resynchronises.
                Ok(sink.received())
            }
        };
        let received = match write_outcome {
            Ok(received) => received,
            Err(err) => {
                self.latch(err);
                return;
            }
        };

        if req.done && received == req.meta.size {
            let (sink, _) = self.install.take().expect("sink exists");
            match sink.finish() {
                Ok(file) => {
                    match self.snapshots.read_payload(&file) {
                        Ok(payload) => {
                            self.fsm.restore(&payload);
                            self.last_applied = file.meta.last_included_index;
                            self.consensus.install_snapshot_done(&file.meta, &mut fx);
                            self.current_snapshot = Some((file, Arc::new(payload)));
                        }
                        Err(err) => {
                            self.latch(err);
                            return;
                        }
                    }
                }
                Err(RaftError::Corrupt(reason)) => {
                    // Bad transfer: throw it away and let the leader
                    // send a fresh one.
                    tracing::warn!(%reason, "discarding corrupt snapshot transfer");
                    self.apply_effects(fx, None);
                    let _ = tx.send(InstallSnapshotResult {
                        term: self.consensus.term(),
                        offset: 0,
                    });
                    return;
                }
                Err(err) => {
                    self.latch(err);
                    return;
                }
            }
        }

        self.apply_effects(fx, None);
        let _ = tx.send(InstallSnapshotResult {
            term: self.consensus.term(),
            offset: received,
        });
    }

    fn check_install_timeout(&mut self, now: Instant) {
        let timed_out = self
            .install
            .as_ref()
            .is_some_and(|(_, last)| now.duration_since(*last) >= self.config.snapshot_chunk_timeout);
        if timed_out {
            tracing::warn!("inbound snapshot transfer timed out");
            if let Some((sink, _)) = self.install.take() {
                sink.abort();
            }
        }
    }

    // ---- failure and shutdown -----------------------------------------

    fn latch(&mut self, err: RaftError) {
        if self.failed.is_some() {
            return;
        }
        tracing::error!(%err, "node latched unavailable");
        let reason = err.to_string();
        let template = err.duplicate();
        self.failed = Some(err);
        self.fail_all_waiters(move || template.duplicate());
        let event = RaftEvent::Unavailable { reason };
        for observer in &self.observers {
            observer(&event);
        }
    }

    fn fail_waiters_from(&mut self, from: LogIndex) {
        let stale: Vec<LogIndex> = self.waiters.range(from..).map(|(k, _)| *k).collect();
        for index in stale {
            if let Some(waiters) = self.waiters.remove(&index) {
                for (_, tx) in waiters {
                    let _ = tx.send(Err(RaftError::NotLeader {
                        leader_hint: self.consensus.leader_hint(),
                    }));
                }
            }
        }
    }

    fn fail_all_waiters(&mut self, err: impl Fn() -> RaftError) {
        for (_, waiters) in std::mem::take(&mut self.waiters) {
            for (_, tx) in waiters {
                let _ = tx.send(Err(err()));
            }
        }
        for (_, tx) in std::mem::take(&mut self.pending_promotions) {
            let _ = tx.send(Err(err()));
        }
        if let Some(tx) = self.pending_transfer.take() {
            let _ = tx.send(Err(err()));
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!(id = self.consensus.id(), "shutting down");
        self.fail_all_waiters(|| RaftError::Cancelled);
        // Outbound sends are abandoned: dropping the forwarders' queues
        // cancels anything not yet on the wire.
        self.peer_tx.clear();
        if let Some((sink, _)) = self.install.take() {
            sink.abort();
        }
        // In-flight disk writes are awaited, not cancelled.
        if let Some(writer) = self.writer.take() {
            if let Err(err) = writer.close().await {
                tracing::warn!(%err, "disk writer reported an error during close");
            }
        }
    }

    fn fire_event(&self, event: &RaftEvent) {
        tracing::debug!(?event, "raft event");
        for observer in &self.observers {
            observer(event);
        }
    }

    fn publish_metrics(&self) {
        let metrics = Metrics {
            id: self.consensus.id(),
            term: self.consensus.term(),
            role: self.consensus.role(),
            leader: self.consensus.leader_hint(),
            last_log_index: self.consensus.log().last_index(),
            commit_index: self.consensus.commit_index(),
            last_applied: self.last_applied,
            snapshot_index: self.consensus.log().snapshot_index(),
            membership: self.consensus.membership().clone(),
        };
        self.metrics_tx.send_if_modified(|current| {
            if *current == metrics {
                false
            } else {
                *current = metrics;
                true
            }
        });
    }
}

/// Issues one peer's outbound requests sequentially, posting responses
/// back to the core. Sequential issue per peer is what keeps responses
/// ordered the way the pipeline bookkeeping expects.
async fn run_peer_forwarder(
    peer: NodeId,
    network: Arc<dyn RaftNetwork>,
    mut rx: mpsc::UnboundedReceiver<(String, Message)>,
    tx_core: mpsc::UnboundedSender<RaftMsg>,
) {
    while let Some((address, message)) = rx.recv().await {
        let result = match message {
            Message::AppendEntries(req) => network
                .append_entries(peer, &address, req)
                .await
                .map(Message::AppendEntriesResult),
            Message::RequestVote(req) => network
                .request_vote(peer, &address, req)
                .await
                .map(Message::RequestVoteResult),
            Message::InstallSnapshot(req) => network
                .install_snapshot(peer, &address, req)
                .await
                .map(Message::InstallSnapshotResult),
            Message::TimeoutNow(req) => {
                if let Err(err) = network.timeout_now(peer, &address, req).await {
                    tracing::debug!(peer, %err, "timeout-now delivery failed");
                }
                continue;
            }
            _ => continue,
        };
        match result {
            Ok(response) => {
                if tx_core
                    .send(RaftMsg::PeerResponse {
                        peer,
                        message: response,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(peer, %err, "rpc failed");
            }
        }
    }
}
