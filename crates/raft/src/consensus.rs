//! The Raft consensus state machine, free of I/O.
//!
//! Every operation mutates in-memory state and records its required
//! side effects in an [`Effects`] value: metadata to persist, log
//! mutations to make durable, messages to send, events to publish. The
//! core task applies the effects in order, honouring the persistence
//! gates (a reply that acknowledges new entries is held until the
//! corresponding disk write completes).
//!
//! Keeping the module synchronous and deterministic makes the protocol
//! invariants directly testable: feed messages and ticks, observe
//! effects.

use crate::election::{VoteTally, random_timeout};
use crate::log::LogStore;
use crate::membership::MembershipState;
use crate::message::{
    AppendEntries, AppendEntriesResult, ConflictHint, InstallSnapshotResult, Message, RequestVote,
    RequestVoteResult, TimeoutNow,
};
use crate::metrics::RoleKind;
use crate::observer::RaftEvent;
use crate::progress::{InflightAppend, Progress, ReplicationState};
use common::{
    Config, Entry, EntryPayload, LogIndex, Membership, NodeId, RaftError, RaftResult, ServerRole,
    Term,
};
use std::collections::BTreeMap;
use std::time::Instant;
use storage::SnapshotMeta;

/// An outbound message the core must hand to the transport.
#[derive(Debug)]
pub struct Outbound {
    pub to: NodeId,
    pub message: Message,
}

/// Side effects requested by one consensus operation.
#[derive(Debug, Default)]
pub struct Effects {
    /// Term or vote changed; flush metadata before anything else below.
    pub persist_hard_state: bool,
    /// Remove durable entries at and after this index, before appending.
    pub truncate_log_from: Option<LogIndex>,
    /// Entries to append durably (already in the in-memory log).
    pub append_entries: Vec<Entry>,
    /// Send immediately.
    pub messages: Vec<Outbound>,
    /// Peers owed the next snapshot chunk.
    pub snapshot_chunks: Vec<NodeId>,
    /// Drop durable segments fully covered by the snapshot.
    pub compact_through: Option<LogIndex>,
    /// Installed snapshot superseded the log; restart it at this index.
    pub reset_log_to: Option<LogIndex>,
    /// Observer notifications.
    pub events: Vec<RaftEvent>,
    /// A queued promotion finally made it into the log.
    pub promotion_appended: Option<(NodeId, Term, LogIndex)>,
    /// A queued promotion was abandoned.
    pub promotion_failed: Option<(NodeId, RaftError)>,
    /// Outcome for a pending leadership transfer.
    pub transfer_result: Option<RaftResult<()>>,
    /// Leadership was lost; client waiters must be failed over.
    pub stepped_down: bool,
}

impl Effects {
    fn send(&mut self, to: NodeId, message: Message) {
        self.messages.push(Outbound { to, message });
    }
}

/// Catch-up rounds for a pending non-voter promotion.
#[derive(Debug)]
struct CatchUp {
    id: NodeId,
    rounds_left: u32,
    round_start: Instant,
    round_target: LogIndex,
}

#[derive(Debug)]
struct LeaderState {
    progress: BTreeMap<NodeId, Progress>,
    last_heartbeat: Instant,
    last_quorum_check: Instant,
    catch_up: Option<CatchUp>,
    /// Leadership transfer in flight: target and its deadline.
    transfer: Option<(NodeId, Instant)>,
}

#[derive(Debug)]
enum RoleState {
    Follower,
    Candidate { tally: VoteTally },
    Leader(LeaderState),
}

/// Everything recovered from disk that consensus needs at construction.
pub struct RecoveredState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub log: LogStore,
    /// Configuration vouched for by the snapshot (or the default).
    pub base_membership: (LogIndex, Membership),
}

pub struct ConsensusModule {
    id: NodeId,
    config: Config,
    term: Term,
    voted_for: Option<NodeId>,
    log: LogStore,
    membership: MembershipState,
    commit_index: LogIndex,
    /// Own log durably on disk through this index.
    durable_index: LogIndex,
    role: RoleState,
    leader_hint: Option<NodeId>,
    election_deadline: Instant,
    last_leader_contact: Option<Instant>,
}

impl ConsensusModule {
    pub fn new(id: NodeId, config: Config, recovered: RecoveredState, now: Instant) -> Self {
        let RecoveredState {
            mut term,
            mut voted_for,
            log,
            base_membership,
        } = recovered;

        // A log written under a newer term than the metadata proves the
        // vote in that term is irrelevant; adopt the newer term.
        if log.last_term() > term {
            term = log.last_term();
            voted_for = None;
        }

        // Fold configuration entries in the log over the snapshot base.
        let mut membership = MembershipState::new(base_membership.0, base_membership.1);
        for index in log.first_index()..=log.last_index() {
            if let Some(entry) = log.get(index) {
                if let EntryPayload::Membership(m) = &entry.payload {
                    membership.apply(index, m.clone());
                }
            }
        }

        let commit_index = log.snapshot_index();
        let durable_index = log.last_index();
        let timeout = random_timeout(config.election_timeout);

        Self {
            id,
            config,
            term,
            voted_for,
            log,
            membership,
            commit_index,
            durable_index,
            role: RoleState::Follower,
            leader_hint: None,
            election_deadline: now + timeout,
            last_leader_contact: None,
        }
    }

    // ---- accessors ----------------------------------------------------

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn role(&self) -> RoleKind {
        match self.role {
            RoleState::Follower => RoleKind::Follower,
            RoleState::Candidate { .. } => RoleKind::Candidate,
            RoleState::Leader(_) => RoleKind::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, RoleState::Leader(_))
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.leader_hint
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn log(&self) -> &LogStore {
        &self.log
    }

    pub fn membership(&self) -> &Membership {
        self.membership.effective()
    }

    /// Configuration in force at `index`, for snapshot metadata.
    pub fn membership_at(&self, index: LogIndex) -> Membership {
        self.membership.at(index).clone()
    }

    /// Snapshot-transfer offset bookkeeping for one peer, if any.
    pub fn snapshot_transfer(&self, peer: NodeId) -> Option<(u64, LogIndex)> {
        let RoleState::Leader(leader) = &self.role else {
            return None;
        };
        match &leader.progress.get(&peer)?.state {
            ReplicationState::Snapshotting {
                offset,
                last_included,
                ..
            } => Some((*offset, *last_included)),
            _ => None,
        }
    }

    // ---- timers --------------------------------------------------------

    fn reset_election_timer(&mut self, now: Instant) {
        self.election_deadline = now + random_timeout(self.config.election_timeout);
    }

    /// Coarse timer dispatch; call every `tick_interval`.
    pub fn tick(&mut self, now: Instant, fx: &mut Effects) {
        match &mut self.role {
            RoleState::Follower | RoleState::Candidate { .. } => {
                if now >= self.election_deadline {
                    self.start_pre_vote(now, fx);
                }
            }
            RoleState::Leader(_) => self.tick_leader(now, fx),
        }
    }

    // ---- elections -----------------------------------------------------

    fn start_pre_vote(&mut self, now: Instant, fx: &mut Effects) {
        if !self.membership.effective().is_voter(self.id) {
            // Non-voters and removed servers never campaign.
            self.reset_election_timer(now);
            return;
        }
        self.reset_election_timer(now);

        // A single-voter cluster short-circuits: its own ballot is the
        // quorum for both phases.
        let tally = VoteTally::new(self.id, true, now);
        if self.membership.effective().has_quorum(tally.granted()) {
            self.role = RoleState::Candidate { tally };
            self.start_election(now, fx);
            return;
        }

        tracing::debug!(id = self.id, term = self.term, "election timeout, pre-vote probe");
        self.role = RoleState::Candidate { tally };
        let probe = RequestVote {
            term: self.term + 1,
            candidate: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            pre_vote: true,
        };
        for peer in self.voter_peers() {
            fx.send(peer, Message::RequestVote(probe.clone()));
        }
    }

    /// Pre-vote quorum reached (or TimeoutNow): campaign for real.
    fn start_election(&mut self, now: Instant, fx: &mut Effects) {
        self.term += 1;
        self.voted_for = Some(self.id);
        fx.persist_hard_state = true;
        fx.events.push(RaftEvent::TermChanged { term: self.term });
        self.reset_election_timer(now);

        tracing::info!(id = self.id, term = self.term, "starting election");
        let tally = VoteTally::new(self.id, false, now);
        if self.membership.effective().has_quorum(tally.granted()) {
            self.role = RoleState::Candidate { tally };
            self.become_leader(now, fx);
            return;
        }
        self.role = RoleState::Candidate { tally };

        let ballot = RequestVote {
            term: self.term,
            candidate: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            pre_vote: false,
        };
        for peer in self.voter_peers() {
            fx.send(peer, Message::RequestVote(ballot.clone()));
        }
    }

    fn voter_peers(&self) -> Vec<NodeId> {
        self.membership
            .effective()
            .voter_ids()
            .filter(|id| *id != self.id)
            .collect()
    }

    pub fn handle_request_vote(
        &mut self,
        req: &RequestVote,
        now: Instant,
        fx: &mut Effects,
    ) -> RequestVoteResult {
        if req.pre_vote {
            // Probes never mutate term or vote.
            let term_ok = req.term > self.term;
            let log_ok = self.candidate_log_ok(req);
            // A sitting leader's own contact is current by definition.
            let leader_stale = !self.is_leader()
                && match self.last_leader_contact {
                    Some(contact) => now.duration_since(contact) >= self.config.election_timeout,
                    None => true,
                };
            let granted = term_ok && log_ok && leader_stale;
            return RequestVoteResult {
                term: self.term,
                granted,
                pre_vote: true,
            };
        }

        if req.term > self.term {
            self.become_follower(req.term, None, now, fx);
        }
        if req.term < self.term {
            return RequestVoteResult {
                term: self.term,
                granted: false,
                pre_vote: false,
            };
        }

        let log_ok = self.candidate_log_ok(req);
        let vote_free = self.voted_for.is_none() || self.voted_for == Some(req.candidate);
        let granted = log_ok && vote_free && !self.is_leader();
        if granted {
            if self.voted_for != Some(req.candidate) {
                self.voted_for = Some(req.candidate);
                fx.persist_hard_state = true;
            }
            self.reset_election_timer(now);
            tracing::debug!(id = self.id, term = self.term, candidate = req.candidate, "vote granted");
        }
        RequestVoteResult {
            term: self.term,
            granted,
            pre_vote: false,
        }
    }

    /// Candidate's log at least as up to date as ours (§5.4.1).
    fn candidate_log_ok(&self, req: &RequestVote) -> bool {
        req.last_log_term > self.log.last_term()
            || (req.last_log_term == self.log.last_term()
                && req.last_log_index >= self.log.last_index())
    }

    pub fn handle_request_vote_result(
        &mut self,
        from: NodeId,
        res: &RequestVoteResult,
        now: Instant,
        fx: &mut Effects,
    ) {
        if res.term > self.term {
            self.become_follower(res.term, None, now, fx);
            return;
        }
        let RoleState::Candidate { tally } = &mut self.role else {
            return;
        };
        if res.pre_vote != tally.pre_vote || !res.granted {
            return;
        }
        tally.record(from);
        let granted: Vec<NodeId> = tally.granted().collect();
        if !self.membership.effective().has_quorum(granted) {
            return;
        }
        if matches!(&self.role, RoleState::Candidate { tally } if tally.pre_vote) {
            self.start_election(now, fx);
        } else {
            self.become_leader(now, fx);
        }
    }

    pub fn handle_timeout_now(&mut self, msg: &TimeoutNow, now: Instant, fx: &mut Effects) {
        if msg.term < self.term || self.is_leader() {
            return;
        }
        if !self.membership.effective().is_voter(self.id) {
            return;
        }
        tracing::info!(id = self.id, "leadership transfer received, campaigning now");
        // Skip the pre-vote phase: the sitting leader asked for this.
        self.role = RoleState::Candidate {
            tally: VoteTally::new(self.id, false, now),
        };
        self.start_election(now, fx);
    }

    // ---- role transitions ----------------------------------------------

    fn become_follower(
        &mut self,
        term: Term,
        leader: Option<NodeId>,
        now: Instant,
        fx: &mut Effects,
    ) {
        debug_assert!(term >= self.term, "terms never decrease");
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            fx.persist_hard_state = true;
            fx.events.push(RaftEvent::TermChanged { term });
        }
        if self.is_leader() {
            fx.stepped_down = true;
            self.release_leader_state(fx);
        }
        self.role = RoleState::Follower;
        if self.leader_hint != leader {
            self.leader_hint = leader;
            fx.events.push(RaftEvent::LeaderChanged {
                term: self.term,
                leader,
            });
        }
        self.reset_election_timer(now);
    }

    fn release_leader_state(&mut self, fx: &mut Effects) {
        if let RoleState::Leader(leader) = &mut self.role {
            for progress in leader.progress.values_mut() {
                while let Some(inflight) = progress.inflight.pop_front() {
                    if let Some(pin) = inflight.pin {
                        self.log.release(pin);
                    }
                }
            }
            if let Some(catch_up) = leader.catch_up.take() {
                fx.promotion_failed = Some((
                    catch_up.id,
                    RaftError::NotLeader {
                        leader_hint: self.leader_hint,
                    },
                ));
            }
            if leader.transfer.take().is_some() && fx.transfer_result.is_none() {
                fx.transfer_result = Some(Err(RaftError::NotLeader {
                    leader_hint: self.leader_hint,
                }));
            }
        }
    }

    fn become_leader(&mut self, now: Instant, fx: &mut Effects) {
        tracing::info!(id = self.id, term = self.term, "became leader");
        let mut progress = BTreeMap::new();
        for peer in self.replication_peers() {
            progress.insert(peer, Progress::new(self.log.last_index()));
        }
        self.role = RoleState::Leader(LeaderState {
            progress,
            last_heartbeat: now,
            last_quorum_check: now,
            catch_up: None,
            transfer: None,
        });
        self.leader_hint = Some(self.id);
        fx.events.push(RaftEvent::LeaderChanged {
            term: self.term,
            leader: Some(self.id),
        });

        // Barrier entry: commits cannot span terms directly (§5.4.2), so
        // the new leader immediately gives its term something to commit.
        let index = self.log.last_index() + 1;
        let barrier = Entry::barrier(self.term, index);
        self.log.append(std::slice::from_ref(&barrier));
        fx.append_entries.push(barrier);
        self.replicate_all(now, fx);
    }

    fn replication_peers(&self) -> Vec<NodeId> {
        self.membership
            .effective()
            .replication_targets(self.id)
            .collect()
    }

    // ---- log replication: follower side --------------------------------

    /// Returns the reply and whether it must wait for this operation's
    /// disk writes before it may be sent.
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntries,
        now: Instant,
        fx: &mut Effects,
    ) -> (AppendEntriesResult, bool) {
        if req.term < self.term {
            return (
                AppendEntriesResult {
                    term: self.term,
                    success: false,
                    last_log_index: self.log.last_index(),
                    conflict: None,
                },
                false,
            );
        }
        if req.term > self.term || !matches!(self.role, RoleState::Follower) {
            self.become_follower(req.term, Some(req.leader), now, fx);
        }
        if self.leader_hint != Some(req.leader) {
            self.leader_hint = Some(req.leader);
            fx.events.push(RaftEvent::LeaderChanged {
                term: self.term,
                leader: Some(req.leader),
            });
        }
        self.last_leader_contact = Some(now);
        self.reset_election_timer(now);

        // Log matching check at (prev_log_index, prev_log_term).
        if req.prev_log_index > self.log.snapshot_index() {
            match self.log.term_of(req.prev_log_index) {
                Some(term) if term == req.prev_log_term => {}
                Some(term) => {
                    // Conflicting term: hint its first index so the
                    // leader can skip the whole run.
                    let mut first = req.prev_log_index;
                    while first > self.log.first_index()
                        && self.log.term_of(first - 1) == Some(term)
                    {
                        first -= 1;
                    }
                    return (
                        AppendEntriesResult {
                            term: self.term,
                            success: false,
                            last_log_index: self.log.last_index(),
                            conflict: Some(ConflictHint {
                                term: Some(term),
                                index: first,
                            }),
                        },
                        false,
                    );
                }
                None => {
                    return (
                        AppendEntriesResult {
                            term: self.term,
                            success: false,
                            last_log_index: self.log.last_index(),
                            conflict: Some(ConflictHint {
                                term: None,
                                index: self.log.last_index() + 1,
                            }),
                        },
                        false,
                    );
                }
            }
        }

        // Skip entries the snapshot already covers, drop conflicting
        // suffixes, append what is new.
        let mut to_append: Vec<Entry> = Vec::new();
        let mut truncate_from: Option<LogIndex> = None;
        for entry in &req.entries {
            if entry.index <= self.log.snapshot_index() {
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry.clone());
                continue;
            }
            match self.log.term_of(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    truncate_from = Some(entry.index);
                    self.log.truncate_suffix(entry.index);
                    self.membership.rollback(entry.index);
                    self.durable_index = self.durable_index.min(entry.index - 1);
                    to_append.push(entry.clone());
                }
                None => to_append.push(entry.clone()),
            }
        }

        if !to_append.is_empty() {
            self.log.append(&to_append);
            for entry in &to_append {
                if let EntryPayload::Membership(m) = &entry.payload {
                    self.membership.apply(entry.index, m.clone());
                }
            }
        }

        let new_commit = req.leader_commit.min(self.log.last_index());
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.membership.commit(new_commit);
        }

        let reply = AppendEntriesResult {
            term: self.term,
            success: true,
            last_log_index: self.log.last_index(),
            conflict: None,
        };
        if to_append.is_empty() && truncate_from.is_none() {
            (reply, false)
        } else {
            // The acknowledgement promises durability; it may only be
            // sent once the disk write completes.
            fx.truncate_log_from = truncate_from;
            fx.append_entries.extend(to_append);
            (reply, true)
        }
    }

    // ---- log replication: leader side ----------------------------------

    /// Push entries (or a heartbeat) to every peer with pipeline room.
    pub fn replicate_all(&mut self, now: Instant, fx: &mut Effects) {
        for peer in self.replication_peers() {
            self.replicate_peer(peer, now, fx, false);
        }
    }

    fn replicate_peer(&mut self, peer: NodeId, now: Instant, fx: &mut Effects, heartbeat: bool) {
        let last_index = self.log.last_index();
        let snapshot_index = self.log.snapshot_index();
        let max_batch = self.config.max_append_entries;
        let max_inflight = self.config.max_inflight_appends;

        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        let progress = leader
            .progress
            .entry(peer)
            .or_insert_with(|| Progress::new(last_index));

        if let ReplicationState::Snapshotting { .. } = progress.state {
            return;
        }

        // Too far behind the snapshot: fall back to snapshot transfer.
        if progress.next_index <= snapshot_index {
            tracing::info!(
                peer,
                next_index = progress.next_index,
                snapshot_index,
                "peer fell behind the snapshot, switching to install"
            );
            for inflight in progress.inflight.drain(..) {
                if let Some(pin) = inflight.pin {
                    self.log.release(pin);
                }
            }
            progress.state = ReplicationState::Snapshotting {
                offset: 0,
                last_included: snapshot_index,
                started: now,
                inflight: false,
            };
            fx.snapshot_chunks.push(peer);
            return;
        }

        let has_entries = progress.next_index <= last_index;
        if !progress.may_send(max_inflight) {
            return;
        }
        if !has_entries && !heartbeat {
            return;
        }

        let from = progress.next_index;
        let to = last_index.min(from + max_batch - 1);
        let prev_log_index = from - 1;
        let prev_log_term = self
            .log
            .term_of(prev_log_index)
            .expect("prev term available above snapshot");

        let (entries, pin) = if has_entries {
            let batch = self.log.range(from, to);
            let pin = self.log.acquire(from, to);
            (batch, Some(pin))
        } else {
            (Vec::new(), None)
        };
        let sent_last = if entries.is_empty() {
            prev_log_index
        } else {
            entries[entries.len() - 1].index
        };

        fx.send(
            peer,
            Message::AppendEntries(AppendEntries {
                term: self.term,
                leader: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            }),
        );
        progress.inflight.push_back(InflightAppend {
            last_index: sent_last,
            pin,
        });
        if matches!(progress.state, ReplicationState::Replicating) {
            progress.next_index = sent_last + 1;
        }
    }

    pub fn handle_append_entries_result(
        &mut self,
        from: NodeId,
        res: &AppendEntriesResult,
        now: Instant,
        fx: &mut Effects,
    ) {
        if res.term > self.term {
            self.become_follower(res.term, None, now, fx);
            return;
        }
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(progress) = leader.progress.get_mut(&from) else {
            return;
        };
        progress.last_contact = Some(now);

        let acked = progress.inflight.pop_front();
        if let Some(pin) = acked.as_ref().and_then(|a| a.pin) {
            self.log.release(pin);
        }

        if res.success {
            if let Some(acked) = acked {
                let RoleState::Leader(leader) = &mut self.role else {
                    unreachable!()
                };
                let progress = leader.progress.get_mut(&from).unwrap();
                progress.on_success(acked.last_index);
            }
            self.advance_commit(now, fx);
            self.check_catch_up_round(from, now, fx);
            self.maybe_finish_transfer(from, fx);
            self.replicate_peer(from, now, fx, false);
        } else {
            let RoleState::Leader(leader) = &mut self.role else {
                unreachable!()
            };
            let progress = leader.progress.get_mut(&from).unwrap();
            for inflight in progress.inflight.drain(..) {
                if let Some(pin) = inflight.pin {
                    self.log.release(pin);
                }
            }
            let progress = match &mut self.role {
                RoleState::Leader(leader) => leader.progress.get_mut(&from).unwrap(),
                _ => unreachable!(),
            };
            progress.on_conflict(res.conflict, res.last_log_index);
            tracing::debug!(
                peer = from,
                next_index = progress.next_index,
                "follower rejected append, backing up"
            );
            self.replicate_peer(from, now, fx, false);
        }
    }

    /// Quorum commit rule: the highest index of the current term durable
    /// on a majority of voters (§5.4.2).
    fn advance_commit(&mut self, now: Instant, fx: &mut Effects) {
        let RoleState::Leader(leader) = &self.role else {
            return;
        };
        let matched: BTreeMap<NodeId, LogIndex> = leader
            .progress
            .iter()
            .map(|(id, p)| (*id, p.match_index))
            .collect();
        let candidate = self.membership.effective().quorum_match_index(
            self.id,
            self.durable_index,
            &matched,
        );
        if candidate <= self.commit_index {
            return;
        }
        if self.log.term_of(candidate) != Some(self.term) {
            return;
        }
        self.commit_index = candidate;
        self.membership.commit(candidate);
        tracing::debug!(id = self.id, commit = candidate, "commit index advanced");
        self.after_membership_commit(now, fx);
        // Followers learn the new commit index with the next append or
        // heartbeat.
    }

    /// React to a just-committed configuration: a removed leader steps
    /// down, removed peers stop being replicated.
    fn after_membership_commit(&mut self, now: Instant, fx: &mut Effects) {
        let effective = self.membership.effective().clone();
        if !effective.contains(self.id) || !effective.is_voter(self.id) {
            if self.is_leader() {
                tracing::info!(id = self.id, "removed from configuration, stepping down");
                fx.stepped_down = true;
                self.release_leader_state(fx);
                self.role = RoleState::Follower;
                self.leader_hint = None;
                fx.events.push(RaftEvent::LeaderChanged {
                    term: self.term,
                    leader: None,
                });
                self.reset_election_timer(now);
            }
            return;
        }
        if let RoleState::Leader(leader) = &mut self.role {
            let targets: Vec<NodeId> = effective.replication_targets(self.id).collect();
            let gone: Vec<NodeId> = leader
                .progress
                .keys()
                .copied()
                .filter(|id| !targets.contains(id))
                .collect();
            for id in gone {
                if let Some(mut progress) = leader.progress.remove(&id) {
                    for inflight in progress.inflight.drain(..) {
                        if let Some(pin) = inflight.pin {
                            self.log.release(pin);
                        }
                    }
                }
            }
        }
    }

    /// The leader's own disk caught up through `index`.
    pub fn on_log_durable(&mut self, index: LogIndex, now: Instant, fx: &mut Effects) {
        self.durable_index = self.durable_index.max(index);
        if self.is_leader() {
            self.advance_commit(now, fx);
        }
    }

    // ---- leader tick ---------------------------------------------------

    fn tick_leader(&mut self, now: Instant, fx: &mut Effects) {
        let heartbeat_due = {
            let RoleState::Leader(leader) = &mut self.role else {
                return;
            };
            // Stalled peers (no contact for a full election timeout)
            // drop their pipeline and go back to probing.
            let election_timeout = self.config.election_timeout;
            let mut stale_pins = Vec::new();
            for progress in leader.progress.values_mut() {
                let stalled = progress
                    .last_contact
                    .is_none_or(|contact| now.duration_since(contact) >= election_timeout);
                if stalled && !progress.inflight.is_empty() {
                    for inflight in progress.inflight.drain(..) {
                        if let Some(pin) = inflight.pin {
                            stale_pins.push(pin);
                        }
                    }
                    progress.state = ReplicationState::Probe;
                }
                if let ReplicationState::Snapshotting { started, .. } = &progress.state {
                    if now.duration_since(*started) >= self.config.install_snapshot_timeout {
                        tracing::warn!("snapshot transfer timed out, reprobing peer");
                        progress.state = ReplicationState::Probe;
                    }
                }
            }
            for pin in stale_pins {
                self.log.release(pin);
            }

            let RoleState::Leader(leader) = &mut self.role else {
                return;
            };
            let due = now.duration_since(leader.last_heartbeat) >= self.config.heartbeat_interval;
            if due {
                leader.last_heartbeat = now;
            }
            due
        };

        if heartbeat_due {
            for peer in self.replication_peers() {
                self.replicate_peer(peer, now, fx, true);
            }
        }

        self.check_quorum(now, fx);
        self.tick_catch_up(now, fx);
        self.tick_transfer(now, fx);
    }

    /// Step down when a quorum of voters has been silent for a full
    /// election timeout; a partitioned leader must not keep accepting
    /// writes it can never commit.
    fn check_quorum(&mut self, now: Instant, fx: &mut Effects) {
        let effective = self.membership.effective().clone();
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        if now.duration_since(leader.last_quorum_check) < self.config.election_timeout {
            return;
        }
        leader.last_quorum_check = now;

        let election_timeout = self.config.election_timeout;
        let heard: Vec<NodeId> = effective
            .voter_ids()
            .filter(|id| {
                *id == self.id
                    || leader.progress.get(id).is_some_and(|p| {
                        p.last_contact
                            .is_some_and(|c| now.duration_since(c) < election_timeout)
                    })
            })
            .collect();
        if !effective.has_quorum(heard) {
            tracing::warn!(id = self.id, term = self.term, "lost quorum contact, stepping down");
            fx.stepped_down = true;
            self.release_leader_state(fx);
            self.role = RoleState::Follower;
            self.leader_hint = None;
            fx.events.push(RaftEvent::LeaderChanged {
                term: self.term,
                leader: None,
            });
            self.reset_election_timer(now);
        }
    }

    // ---- client operations ---------------------------------------------

    fn not_leader(&self) -> RaftError {
        match self.leader_hint {
            Some(_) if !self.is_leader() => RaftError::NotLeader {
                leader_hint: self.leader_hint,
            },
            _ if !self.is_leader() => RaftError::NoLeader,
            _ => unreachable!("caller checked leadership"),
        }
    }

    /// Append a client command; returns the index it will commit at.
    pub fn propose(
        &mut self,
        payload: EntryPayload,
        now: Instant,
        fx: &mut Effects,
    ) -> RaftResult<LogIndex> {
        if !self.is_leader() {
            return Err(self.not_leader());
        }
        if let RoleState::Leader(leader) = &self.role {
            if leader.transfer.is_some() {
                // Mid-transfer leaders refuse new work so the target can
                // catch up.
                return Err(RaftError::Busy);
            }
        }

        let index = self.log.last_index() + 1;
        if let EntryPayload::Membership(m) = &payload {
            if self.membership.has_pending(self.commit_index) {
                return Err(RaftError::Busy);
            }
            self.membership.apply(index, m.clone());
        }
        let entry = Entry {
            term: self.term,
            index,
            payload,
        };
        self.log.append(std::slice::from_ref(&entry));
        fx.append_entries.push(entry);
        self.replicate_all(now, fx);
        Ok(index)
    }

    /// Add a server to the configuration as a non-voter.
    pub fn add_server(
        &mut self,
        id: NodeId,
        address: String,
        now: Instant,
        fx: &mut Effects,
    ) -> RaftResult<LogIndex> {
        if !self.is_leader() {
            return Err(self.not_leader());
        }
        let next = self.membership.effective().with_added(common::Server {
            id,
            address,
            role: ServerRole::NonVoter,
        })?;
        self.propose(EntryPayload::Membership(next), now, fx)
    }

    /// Remove a server from the configuration.
    pub fn remove_server(&mut self, id: NodeId, now: Instant, fx: &mut Effects) -> RaftResult<LogIndex> {
        if !self.is_leader() {
            return Err(self.not_leader());
        }
        let next = self.membership.effective().with_removed(id)?;
        self.propose(EntryPayload::Membership(next), now, fx)
    }

    /// Begin promoting a non-voter. The promotion entry is appended once
    /// the peer finishes a catch-up round inside one election timeout;
    /// the round budget bounds how long that may take.
    pub fn promote_server(&mut self, id: NodeId, now: Instant, fx: &mut Effects) -> RaftResult<Option<LogIndex>> {
        if !self.is_leader() {
            return Err(self.not_leader());
        }
        if self.membership.has_pending(self.commit_index) {
            return Err(RaftError::Busy);
        }
        match self.membership.effective().get(id).map(|s| s.role) {
            Some(ServerRole::NonVoter) => {}
            Some(ServerRole::Voter) => {
                return Err(RaftError::Exhausted(format!("server {id} is already a voter")))
            }
            Some(ServerRole::Spare) => {
                return Err(RaftError::Exhausted(
                    "spares receive no replication; re-add as a non-voter first".into(),
                ))
            }
            None => {
                return Err(RaftError::Exhausted(format!(
                    "server {id} is not in the configuration"
                )))
            }
        }

        let caught_up = {
            let RoleState::Leader(leader) = &self.role else {
                unreachable!()
            };
            if leader.catch_up.is_some() {
                return Err(RaftError::Busy);
            }
            leader
                .progress
                .get(&id)
                .is_some_and(|p| p.match_index >= self.log.last_index())
        };

        if caught_up {
            let membership = self.membership.effective().with_role(id, ServerRole::Voter)?;
            let index = self.propose(EntryPayload::Membership(membership), now, fx)?;
            return Ok(Some(index));
        }

        let target = self.log.last_index();
        let RoleState::Leader(leader) = &mut self.role else {
            unreachable!()
        };
        leader.catch_up = Some(CatchUp {
            id,
            rounds_left: self.config.max_catch_up_rounds,
            round_start: now,
            round_target: target,
        });
        tracing::info!(peer = id, target, "promotion queued behind catch-up rounds");
        self.replicate_peer(id, now, fx, false);
        Ok(None)
    }

    /// A peer acknowledged entries; see whether that finishes a
    /// promotion catch-up round.
    fn check_catch_up_round(&mut self, from: NodeId, now: Instant, fx: &mut Effects) {
        let last_index = self.log.last_index();
        let election_timeout = self.config.election_timeout;
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(catch_up) = &mut leader.catch_up else {
            return;
        };
        if catch_up.id != from {
            return;
        }
        let matched = leader
            .progress
            .get(&from)
            .map(|p| p.match_index)
            .unwrap_or(0);
        if matched < catch_up.round_target {
            return;
        }

        let elapsed = now.duration_since(catch_up.round_start);
        if elapsed <= election_timeout {
            // Final round finished fast enough: promote.
            leader.catch_up = None;
            let promoted = self
                .membership
                .effective()
                .with_role(from, ServerRole::Voter);
            match promoted.and_then(|m| self.propose(EntryPayload::Membership(m), now, fx)) {
                Ok(index) => {
                    tracing::info!(peer = from, index, "promotion entry appended");
                    fx.promotion_appended = Some((from, self.term, index));
                }
                Err(err) => fx.promotion_failed = Some((from, err)),
            }
            return;
        }

        catch_up.rounds_left = catch_up.rounds_left.saturating_sub(1);
        if catch_up.rounds_left == 0 {
            let id = catch_up.id;
            leader.catch_up = None;
            tracing::warn!(peer = id, "promotion abandoned, catch-up budget exhausted");
            fx.promotion_failed = Some((id, RaftError::Timeout));
            return;
        }
        catch_up.round_start = now;
        catch_up.round_target = last_index;
    }

    fn tick_catch_up(&mut self, now: Instant, fx: &mut Effects) {
        // A round can also die quietly if the peer stops responding;
        // treat a round older than two election timeouts as failed.
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(catch_up) = &mut leader.catch_up else {
            return;
        };
        if now.duration_since(catch_up.round_start) <= self.config.election_timeout * 2 {
            return;
        }
        catch_up.rounds_left = catch_up.rounds_left.saturating_sub(1);
        if catch_up.rounds_left == 0 {
            let id = catch_up.id;
            leader.catch_up = None;
            fx.promotion_failed = Some((id, RaftError::Timeout));
        } else {
            catch_up.round_start = now;
            catch_up.round_target = self.log.last_index();
        }
    }

    /// Hand leadership to `target`: replicate it to parity, then tell it
    /// to campaign immediately.
    pub fn transfer_leadership(&mut self, target: NodeId, now: Instant, fx: &mut Effects) -> RaftResult<()> {
        if !self.is_leader() {
            return Err(self.not_leader());
        }
        if target == self.id {
            return Ok(());
        }
        if !self.membership.effective().is_voter(target) {
            return Err(RaftError::Exhausted(format!("server {target} is not a voter")));
        }
        let last_index = self.log.last_index();
        let deadline = now + self.config.election_timeout;
        let RoleState::Leader(leader) = &mut self.role else {
            unreachable!()
        };
        if leader.transfer.is_some() {
            return Err(RaftError::Busy);
        }
        leader.transfer = Some((target, deadline));

        let ready = leader
            .progress
            .get(&target)
            .is_some_and(|p| p.match_index >= last_index);
        if ready {
            leader.transfer = None;
            fx.transfer_result = Some(Ok(()));
            fx.send(target, Message::TimeoutNow(TimeoutNow { term: self.term }));
        } else {
            self.replicate_peer(target, now, fx, false);
        }
        Ok(())
    }

    fn maybe_finish_transfer(&mut self, from: NodeId, fx: &mut Effects) {
        let last_index = self.log.last_index();
        let term = self.term;
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        let Some((target, _)) = leader.transfer else {
            return;
        };
        if target != from {
            return;
        }
        let ready = leader
            .progress
            .get(&target)
            .is_some_and(|p| p.match_index >= last_index);
        if ready {
            fx.send(target, Message::TimeoutNow(TimeoutNow { term }));
            // The transfer completes when the target wins; resolve the
            // waiter now that the handoff message is out.
            leader.transfer = None;
            fx.transfer_result = Some(Ok(()));
        }
    }

    fn tick_transfer(&mut self, now: Instant, fx: &mut Effects) {
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        if let Some((_, deadline)) = leader.transfer {
            if now >= deadline {
                leader.transfer = None;
                fx.transfer_result = Some(Err(RaftError::Timeout));
            }
        }
    }

    // ---- snapshots -----------------------------------------------------

    /// Validate an inbound InstallSnapshot envelope; `Ok(true)` means
    /// the chunk should be written.
    pub fn accept_install(&mut self, term: Term, leader: NodeId, now: Instant, fx: &mut Effects) -> bool {
        if term < self.term {
            return false;
        }
        if term > self.term || !matches!(self.role, RoleState::Follower) {
            self.become_follower(term, Some(leader), now, fx);
        }
        self.last_leader_contact = Some(now);
        self.reset_election_timer(now);
        true
    }

    /// The terminal chunk landed and the snapshot file is in place:
    /// swap state over to it.
    pub fn install_snapshot_done(&mut self, meta: &SnapshotMeta, fx: &mut Effects) {
        let index = meta.last_included_index;
        let term = meta.last_included_term;
        tracing::info!(id = self.id, index, term, "snapshot installed");

        self.log.install_snapshot(index, term);
        self.membership.install(index, meta.membership.clone());
        self.commit_index = self.commit_index.max(index);
        self.durable_index = index;
        fx.reset_log_to = Some(index + 1);
    }

    /// A snapshot of our own state was persisted at (`index`, `term`).
    /// Compact the log, keeping a trailing window for laggards.
    pub fn on_snapshot_taken(&mut self, index: LogIndex, term: Term, fx: &mut Effects) {
        self.log.note_snapshot(index, term);
        let trailing = self.config.install_snapshot_trailing;
        let through = index.min(self.log.last_index().saturating_sub(trailing));
        if through < self.log.first_index() {
            return;
        }
        match self.log.truncate_prefix(through) {
            Ok(()) => fx.compact_through = Some(through),
            // A replication batch still pins the range; compaction will
            // be retried after the next snapshot.
            Err(_) => tracing::debug!(through, "compaction deferred, range pinned"),
        }
    }

    /// Leader-side: a follower acknowledged a snapshot chunk.
    pub fn handle_install_snapshot_result(
        &mut self,
        from: NodeId,
        res: &InstallSnapshotResult,
        payload_size: u64,
        now: Instant,
        fx: &mut Effects,
    ) {
        if res.term > self.term {
            self.become_follower(res.term, None, now, fx);
            return;
        }
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(progress) = leader.progress.get_mut(&from) else {
            return;
        };
        progress.last_contact = Some(now);
        let ReplicationState::Snapshotting {
            offset,
            last_included,
            inflight,
            ..
        } = &mut progress.state
        else {
            return;
        };
        *inflight = false;
        // The follower's view of the transfer is authoritative: a
        // restarted follower legitimately asks for earlier bytes again.
        *offset = res.offset;

        if *offset >= payload_size {
            // Transfer complete; resume appends past the snapshot.
            let resumed = *last_included + 1;
            progress.match_index = progress.match_index.max(*last_included);
            progress.next_index = resumed;
            progress.state = ReplicationState::Probe;
            tracing::info!(peer = from, next_index = resumed, "snapshot transfer finished");
            self.advance_commit(now, fx);
            self.replicate_peer(from, now, fx, false);
        } else {
            fx.snapshot_chunks.push(from);
        }
    }

    /// A newer snapshot replaced the one a transfer was reading from;
    /// restart the peer's transfer against it.
    pub fn restart_snapshot_transfer(&mut self, peer: NodeId, last_included: LogIndex, now: Instant) {
        if let RoleState::Leader(leader) = &mut self.role {
            if let Some(progress) = leader.progress.get_mut(&peer) {
                progress.state = ReplicationState::Snapshotting {
                    offset: 0,
                    last_included,
                    started: now,
                    inflight: false,
                };
            }
        }
    }

    /// Mark that a chunk send is in flight for `peer`.
    pub fn note_chunk_sent(&mut self, peer: NodeId) {
        if let RoleState::Leader(leader) = &mut self.role {
            if let Some(progress) = leader.progress.get_mut(&peer) {
                if let ReplicationState::Snapshotting { inflight, .. } = &mut progress.state {
                    *inflight = true;
                }
            }
        }
    }
}
