use crate::consensus::{ConsensusModule, Effects, Outbound, RecoveredState};
use crate::log::LogStore;
use crate::message::Message;
use common::{Config, Entry, EntryPayload, Membership, NodeId, RaftError, Server, ServerRole};
use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

mod codec_tests;
mod log_tests;
mod membership_tests;

/// Deterministic in-memory cluster: consensus modules wired directly to
/// each other, with immediate "durability" and optional link cuts.
struct Sim {
    nodes: BTreeMap<NodeId, ConsensusModule>,
    now: Instant,
    /// Blocked directed links.
    cut: HashSet<(NodeId, NodeId)>,
}

fn test_config() -> Config {
    Config::builder()
        .election_timeout(Duration::from_millis(100))
        .heartbeat_interval(Duration::from_millis(10))
        .tick_interval(Duration::from_millis(5))
        .build()
}

fn voters(n: u64) -> Membership {
    Membership::new(
        (1..=n)
            .map(|id| Server {
                id,
                address: format!("node-{id}:7000"),
                role: ServerRole::Voter,
            })
            .collect(),
    )
    .unwrap()
}

impl Sim {
    fn new(n: u64) -> Self {
        let now = Instant::now();
        let membership = voters(n);
        let nodes = (1..=n)
            .map(|id| {
                let module = ConsensusModule::new(
                    id,
                    test_config(),
                    RecoveredState {
                        term: 0,
                        voted_for: None,
                        log: LogStore::new(0, 0, Vec::new()),
                        base_membership: (0, membership.clone()),
                    },
                    now,
                );
                (id, module)
            })
            .collect();
        Self {
            nodes,
            now,
            cut: HashSet::new(),
        }
    }

    fn node(&self, id: NodeId) -> &ConsensusModule {
        &self.nodes[&id]
    }

    fn partition(&mut self, id: NodeId) {
        let others: Vec<NodeId> = self.nodes.keys().copied().filter(|n| *n != id).collect();
        for other in others {
            self.cut.insert((id, other));
            self.cut.insert((other, id));
        }
    }

    fn heal(&mut self) {
        self.cut.clear();
    }

    /// Make whatever a node just appended durable, cascading effects.
    fn settle(&mut self, id: NodeId, fx: Effects, queue: &mut VecDeque<(NodeId, Outbound)>) {
        if let Some(last) = fx.append_entries.last().map(|e| e.index) {
            let mut durable_fx = Effects::default();
            self.nodes
                .get_mut(&id)
                .unwrap()
                .on_log_durable(last, self.now, &mut durable_fx);
            self.settle(id, durable_fx, queue);
        }
        for out in fx.messages {
            queue.push_back((id, out));
        }
    }

    /// Deliver messages until the cluster goes quiet.
    fn drain(&mut self, queue: &mut VecDeque<(NodeId, Outbound)>) {
        let mut steps = 0;
        while let Some((from, out)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 100_000, "message storm, protocol is not quiescing");
            let to = out.to;
            if self.cut.contains(&(from, to)) || !self.nodes.contains_key(&to) {
                continue;
            }
            match out.message {
                Message::RequestVote(req) => {
                    let mut fx = Effects::default();
                    let reply =
                        self.nodes
                            .get_mut(&to)
                            .unwrap()
                            .handle_request_vote(&req, self.now, &mut fx);
                    self.settle(to, fx, queue);
                    if self.cut.contains(&(to, from)) {
                        continue;
                    }
                    let mut fx = Effects::default();
                    self.nodes
                        .get_mut(&from)
                        .unwrap()
                        .handle_request_vote_result(to, &reply, self.now, &mut fx);
                    self.settle(from, fx, queue);
                }
                Message::AppendEntries(req) => {
                    let mut fx = Effects::default();
                    let (reply, _gated) = self
                        .nodes
                        .get_mut(&to)
                        .unwrap()
                        .handle_append_entries(&req, self.now, &mut fx);
                    self.settle(to, fx, queue);
                    if self.cut.contains(&(to, from)) {
                        continue;
                    }
                    let mut fx = Effects::default();
                    self.nodes
                        .get_mut(&from)
                        .unwrap()
                        .handle_append_entries_result(to, &reply, self.now, &mut fx);
                    self.settle(from, fx, queue);
                }
                Message::TimeoutNow(req) => {
                    let mut fx = Effects::default();
                    self.nodes
                        .get_mut(&to)
                        .unwrap()
                        .handle_timeout_now(&req, self.now, &mut fx);
                    self.settle(to, fx, queue);
                }
                // The sim has no disk, so snapshot transfers don't run.
                Message::InstallSnapshot(_) => {}
                other => panic!("unexpected routed message: {}", other.kind()),
            }
        }
    }

    /// Advance time and tick every node, delivering all traffic.
    fn tick_all(&mut self, advance: Duration) {
        self.now += advance;
        let mut queue = VecDeque::new();
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            let mut fx = Effects::default();
            self.nodes.get_mut(&id).unwrap().tick(self.now, &mut fx);
            self.settle(id, fx, &mut queue);
        }
        self.drain(&mut queue);
    }

    /// Force `id`'s election timer to fire, alone.
    fn timeout(&mut self, id: NodeId) {
        self.now += Duration::from_millis(250);
        let mut queue = VecDeque::new();
        let mut fx = Effects::default();
        self.nodes.get_mut(&id).unwrap().tick(self.now, &mut fx);
        self.settle(id, fx, &mut queue);
        self.drain(&mut queue);
    }

    fn leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| n.is_leader())
            .map(|n| n.id())
    }

    fn propose(&mut self, id: NodeId, data: &[u8]) -> common::RaftResult<u64> {
        let mut queue = VecDeque::new();
        let mut fx = Effects::default();
        let result =
            self.nodes
                .get_mut(&id)
                .unwrap()
                .propose(EntryPayload::Command(data.to_vec()), self.now, &mut fx);
        self.settle(id, fx, &mut queue);
        self.drain(&mut queue);
        result
    }

    fn heartbeat(&mut self) {
        self.tick_all(Duration::from_millis(15));
    }

    fn assert_logs_match(&self) {
        let reference: Vec<(u64, u64)> = {
            let first = self.nodes.values().next().unwrap();
            (first.log().first_index()..=first.log().last_index())
                .filter_map(|i| first.log().get(i).map(|e| (e.term, e.index)))
                .collect()
        };
        for node in self.nodes.values() {
            let this: Vec<(u64, u64)> = (node.log().first_index()..=node.log().last_index())
                .filter_map(|i| node.log().get(i).map(|e| (e.term, e.index)))
                .collect();
            assert_eq!(this, reference, "log mismatch on node {}", node.id());
        }
    }
}

#[test]
fn first_timeout_elects_a_leader() {
    let mut sim = Sim::new(3);
    sim.timeout(1);

    assert_eq!(sim.leader(), Some(1));
    for node in sim.nodes.values() {
        assert_eq!(node.term(), 1);
        assert_eq!(node.leader_hint(), Some(1), "node {}", node.id());
    }
    // The new leader appended its barrier entry.
    let leader = sim.node(1);
    assert_eq!(leader.log().last_index(), 1);
    assert!(matches!(
        leader.log().get(1).unwrap().payload,
        EntryPayload::Barrier
    ));
}

#[test]
fn at_most_one_leader_per_term() {
    let mut sim = Sim::new(3);
    sim.timeout(1);
    assert_eq!(sim.leader(), Some(1));
    let first_term = sim.node(1).term();

    // Partition the leader; another node takes over in a higher term.
    sim.partition(1);
    sim.timeout(2);
    assert!(sim.node(2).is_leader());
    assert!(sim.node(2).term() > first_term);

    // The stale leader steps down when the partition heals: check-quorum
    // already demoted it, or the newer term does now.
    sim.heal();
    for _ in 0..30 {
        sim.heartbeat();
    }
    let leaders: Vec<NodeId> = sim
        .nodes
        .values()
        .filter(|n| n.is_leader())
        .map(|n| n.id())
        .collect();
    assert_eq!(leaders.len(), 1);
    let term = sim.node(leaders[0]).term();
    for node in sim.nodes.values() {
        assert_eq!(node.term(), term);
    }
}

#[test]
fn pre_vote_does_not_disturb_a_live_cluster() {
    let mut sim = Sim::new(3);
    sim.timeout(1);
    let term_before = sim.node(1).term();
    sim.heartbeat();

    // A partitioned node 3 would probe with term + 1; hand-deliver that
    // probe while leader contact is fresh everywhere.
    let probe = crate::message::RequestVote {
        term: term_before + 1,
        candidate: 3,
        last_log_index: sim.node(3).log().last_index(),
        last_log_term: sim.node(3).log().last_term(),
        pre_vote: true,
    };
    let now = sim.now;
    for target in [1u64, 2] {
        let mut fx = Effects::default();
        let reply = sim
            .nodes
            .get_mut(&target)
            .unwrap()
            .handle_request_vote(&probe, now, &mut fx);
        assert!(!reply.granted, "node {target} granted a disruptive pre-vote");
        assert!(!fx.persist_hard_state, "pre-vote must not touch hard state");
    }

    assert_eq!(sim.node(1).term(), term_before);
    assert!(sim.node(1).is_leader());
}

#[test]
fn commands_replicate_and_commit() {
    let mut sim = Sim::new(3);
    sim.timeout(1);

    let index = sim.propose(1, b"x=1").unwrap();
    assert_eq!(index, 2); // after the barrier
    // Followers learn the advanced commit index with the next heartbeat.
    sim.heartbeat();

    for node in sim.nodes.values() {
        assert_eq!(node.log().last_index(), 2, "node {}", node.id());
        assert_eq!(node.commit_index(), 2, "node {}", node.id());
        let entry = node.log().get(2).unwrap();
        assert_eq!(entry.payload, EntryPayload::Command(b"x=1".to_vec()));
    }
    sim.assert_logs_match();
}

#[test]
fn single_node_commits_on_its_own_durability() {
    let mut sim = Sim::new(1);
    sim.timeout(1);
    assert!(sim.node(1).is_leader());

    let index = sim.propose(1, b"solo").unwrap();
    assert_eq!(sim.node(1).commit_index(), index);
}

#[test]
fn conflicting_suffix_is_overwritten() {
    let mut sim = Sim::new(3);
    sim.timeout(1);

    // Leader 1 appends an entry it can replicate to no one.
    sim.partition(1);
    let orphan = {
        let mut fx = Effects::default();
        let result = sim.nodes.get_mut(&1).unwrap().propose(
            EntryPayload::Command(b"lost".to_vec()),
            sim.now,
            &mut fx,
        );
        // Messages go nowhere: the node is cut off.
        result.unwrap()
    };
    assert_eq!(sim.node(1).log().last_index(), orphan);

    // A new leader commits a different entry at that index.
    sim.timeout(2);
    assert!(sim.node(2).is_leader());
    sim.propose(2, b"kept").unwrap();

    // Heal: node 1 must discard its orphan and adopt the new suffix.
    sim.heal();
    for _ in 0..30 {
        sim.heartbeat();
    }
    sim.assert_logs_match();
    let node1 = sim.node(1);
    let mut found_kept = false;
    for index in node1.log().first_index()..=node1.log().last_index() {
        let entry = node1.log().get(index).unwrap();
        assert_ne!(
            entry.payload,
            EntryPayload::Command(b"lost".to_vec()),
            "orphaned entry survived"
        );
        if entry.payload == EntryPayload::Command(b"kept".to_vec()) {
            found_kept = true;
        }
    }
    assert!(found_kept);
}

#[test]
fn one_vote_per_term() {
    let mut sim = Sim::new(3);
    // Hand-deliver two competing vote requests for the same term to
    // node 3 and check only the first is granted.
    let req1 = crate::message::RequestVote {
        term: 1,
        candidate: 1,
        last_log_index: 0,
        last_log_term: 0,
        pre_vote: false,
    };
    let req2 = crate::message::RequestVote {
        term: 1,
        candidate: 2,
        last_log_index: 0,
        last_log_term: 0,
        pre_vote: false,
    };
    let now = sim.now;
    let node3 = sim.nodes.get_mut(&3).unwrap();
    let mut fx = Effects::default();
    let first = node3.handle_request_vote(&req1, now, &mut fx);
    assert!(first.granted);
    assert!(fx.persist_hard_state, "vote must be persisted");
    let mut fx = Effects::default();
    let second = node3.handle_request_vote(&req2, now, &mut fx);
    assert!(!second.granted);
    // Repeat from the same candidate is idempotent.
    let mut fx = Effects::default();
    let again = node3.handle_request_vote(&req1, now, &mut fx);
    assert!(again.granted);
}

#[test]
fn stale_candidate_with_short_log_is_refused() {
    let mut sim = Sim::new(3);
    sim.timeout(1);
    sim.propose(1, b"x=1").unwrap();

    // Node 3 has the full log; a candidate with an empty log asks for
    // its vote in a newer term.
    let req = crate::message::RequestVote {
        term: 99,
        candidate: 2,
        last_log_index: 0,
        last_log_term: 0,
        pre_vote: false,
    };
    let now = sim.now;
    let mut fx = Effects::default();
    let reply = sim
        .nodes
        .get_mut(&3)
        .unwrap()
        .handle_request_vote(&req, now, &mut fx);
    assert!(!reply.granted);
    // The term still advances (it never decreases).
    assert_eq!(sim.node(3).term(), 99);
}

#[test]
fn terms_and_commit_are_monotone() {
    let mut sim = Sim::new(3);
    let mut terms: BTreeMap<NodeId, u64> = BTreeMap::new();
    let mut commits: BTreeMap<NodeId, u64> = BTreeMap::new();

    let mut check = |sim: &Sim| {
        for node in sim.nodes.values() {
            let term = terms.entry(node.id()).or_insert(0);
            assert!(node.term() >= *term, "term regressed on {}", node.id());
            *term = node.term();
            let commit = commits.entry(node.id()).or_insert(0);
            assert!(
                node.commit_index() >= *commit,
                "commit regressed on {}",
                node.id()
            );
            *commit = node.commit_index();
        }
    };

    sim.timeout(1);
    check(&sim);
    sim.propose(1, b"a").unwrap();
    check(&sim);
    sim.partition(1);
    sim.timeout(2);
    check(&sim);
    sim.propose(2, b"b").unwrap();
    check(&sim);
    sim.heal();
    for _ in 0..30 {
        sim.heartbeat();
        check(&sim);
    }
}

#[test]
fn add_server_takes_effect_at_append() {
    let mut sim = Sim::new(3);
    sim.timeout(1);

    let next = sim
        .node(1)
        .membership()
        .with_added(Server {
            id: 4,
            address: "node-4:7000".into(),
            role: ServerRole::NonVoter,
        })
        .unwrap();
    let mut queue = VecDeque::new();
    let mut fx = Effects::default();
    let index = sim
        .nodes
        .get_mut(&1)
        .unwrap()
        .propose(EntryPayload::Membership(next), sim.now, &mut fx)
        .unwrap();
    // Effective immediately on the leader, before commit.
    assert!(sim.node(1).membership().contains(4));

    sim.settle(1, fx, &mut queue);
    sim.drain(&mut queue);
    assert!(sim.node(1).commit_index() >= index);
    for id in [2u64, 3] {
        assert!(sim.node(id).membership().contains(4), "node {id}");
        assert!(!sim.node(id).membership().is_voter(4));
    }
}

#[test]
fn second_membership_change_is_rejected_while_pending() {
    let mut sim = Sim::new(3);
    sim.timeout(1);

    // Cut the followers so the first change cannot commit.
    sim.partition(1);
    let first = sim
        .node(1)
        .membership()
        .with_added(Server {
            id: 4,
            address: "node-4:7000".into(),
            role: ServerRole::NonVoter,
        })
        .unwrap();
    let mut fx = Effects::default();
    sim.nodes
        .get_mut(&1)
        .unwrap()
        .propose(EntryPayload::Membership(first), sim.now, &mut fx)
        .unwrap();

    let second = sim
        .node(1)
        .membership()
        .with_added(Server {
            id: 5,
            address: "node-5:7000".into(),
            role: ServerRole::NonVoter,
        })
        .unwrap();
    let mut fx = Effects::default();
    let err = sim
        .nodes
        .get_mut(&1)
        .unwrap()
        .propose(EntryPayload::Membership(second), sim.now, &mut fx)
        .unwrap_err();
    assert!(matches!(err, RaftError::Busy));
}

#[test]
fn removed_leader_steps_down_after_commit() {
    let mut sim = Sim::new(3);
    sim.timeout(1);

    let next = sim.node(1).membership().with_removed(1).unwrap();
    let mut queue = VecDeque::new();
    let mut fx = Effects::default();
    sim.nodes
        .get_mut(&1)
        .unwrap()
        .propose(EntryPayload::Membership(next), sim.now, &mut fx)
        .unwrap();
    sim.settle(1, fx, &mut queue);
    sim.drain(&mut queue);

    assert!(!sim.node(1).is_leader());
    assert!(!sim.node(2).membership().contains(1));
}

#[test]
fn leadership_transfer_hands_off() {
    let mut sim = Sim::new(3);
    sim.timeout(1);
    sim.propose(1, b"x").unwrap();

    let mut queue = VecDeque::new();
    let mut fx = Effects::default();
    sim.nodes
        .get_mut(&1)
        .unwrap()
        .transfer_leadership(2, sim.now, &mut fx)
        .unwrap();
    assert_eq!(fx.transfer_result.as_ref().map(|r| r.is_ok()), Some(true));
    sim.settle(1, fx, &mut queue);
    sim.drain(&mut queue);

    assert!(sim.node(2).is_leader());
    assert!(!sim.node(1).is_leader());
    assert_eq!(sim.node(1).term(), sim.node(2).term());
}

#[test]
fn check_quorum_steps_down_partitioned_leader() {
    let mut sim = Sim::new(3);
    sim.timeout(1);
    assert!(sim.node(1).is_leader());

    sim.partition(1);
    // Two election timeouts pass with no follower contact.
    let mut fx = Effects::default();
    sim.now += Duration::from_millis(500);
    sim.nodes.get_mut(&1).unwrap().tick(sim.now, &mut fx);
    let mut fx2 = Effects::default();
    sim.now += Duration::from_millis(500);
    sim.nodes.get_mut(&1).unwrap().tick(sim.now, &mut fx2);

    assert!(!sim.node(1).is_leader(), "leader without quorum must step down");
    assert!(fx.stepped_down || fx2.stepped_down);
}

#[test]
fn append_at_exactly_the_snapshot_boundary_is_accepted() {
    // A follower restored from a snapshot at index 100 receives an
    // append whose prev position is the snapshot boundary itself.
    let now = Instant::now();
    let mut node = ConsensusModule::new(
        2,
        test_config(),
        RecoveredState {
            term: 7,
            voted_for: None,
            log: LogStore::new(100, 7, Vec::new()),
            base_membership: (100, voters(2)),
        },
        now,
    );

    let req = crate::message::AppendEntries {
        term: 7,
        leader: 1,
        prev_log_index: 100,
        prev_log_term: 7,
        entries: vec![Entry::command(7, 101, b"x".to_vec())],
        leader_commit: 100,
    };
    let mut fx = Effects::default();
    let (reply, gated) = node.handle_append_entries(&req, now, &mut fx);

    assert!(reply.success);
    assert!(gated, "new entries gate the acknowledgement on disk");
    assert_eq!(node.log().first_index(), 101);
    assert_eq!(node.log().last_index(), 101);
    assert_eq!(fx.append_entries.len(), 1);
}

#[test]
fn laggard_beyond_snapshot_gets_a_transfer() {
    let mut sim = Sim::new(3);
    sim.timeout(1);
    for i in 0..10 {
        sim.propose(1, format!("e{i}").as_bytes()).unwrap();
    }

    // Simulate a snapshot + compaction on the leader at the commit
    // point, then a brand-new follower state for node 3.
    {
        let node1 = sim.nodes.get_mut(&1).unwrap();
        let commit = node1.commit_index();
        let term = node1.log().term_of(commit).unwrap();
        let mut fx = Effects::default();
        node1.on_snapshot_taken(commit, term, &mut fx);
    }

    // Replace node 3 with an empty log (fresh server rejoining).
    let membership = voters(3);
    let fresh = ConsensusModule::new(
        3,
        test_config(),
        RecoveredState {
            term: 0,
            voted_for: None,
            log: LogStore::new(0, 0, Vec::new()),
            base_membership: (0, membership),
        },
        sim.now,
    );
    sim.nodes.insert(3, fresh);

    // The next replicated entry is rejected (node 3's log is empty);
    // backing up lands below the snapshot boundary and the leader
    // switches that peer to a snapshot transfer.
    sim.propose(1, b"after-swap").unwrap();

    let transfer = sim.node(1).snapshot_transfer(3);
    assert!(
        transfer.is_some(),
        "leader should fall back to snapshot install for node 3"
    );
}
