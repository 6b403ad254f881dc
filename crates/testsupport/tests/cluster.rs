//! End-to-end cluster scenarios over the full stack: consensus, segment
//! storage, snapshots, and the in-memory router.

use common::{RaftError, ServerRole};
use std::time::Duration;
use testsupport::prelude::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_elects_one_leader() {
    let cluster = TestCluster::bootstrap(3).await.unwrap();

    let leader = cluster
        .wait_for_leader_within(Duration::from_secs(10))
        .await
        .unwrap();

    // All three observe the same leader.
    for node in cluster.nodes.values() {
        let metrics = node.raft.metrics().borrow().clone();
        assert_eq!(metrics.leader, Some(leader));
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn command_applies_exactly_once_on_every_node() {
    let cluster = TestCluster::bootstrap(3).await.unwrap();
    let leader = cluster.leader_handle().await.unwrap();

    let index = leader.submit(b"x=1".to_vec()).await.unwrap();
    cluster
        .wait_for_applied(index, Duration::from_secs(2))
        .await
        .unwrap();

    for (id, node) in &cluster.nodes {
        assert_eq!(
            node.probe.count_of(b"x=1"),
            1,
            "node {id} applied the command a wrong number of times"
        );
        assert!(node.raft.metrics().borrow().last_applied >= index);
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn added_server_joins_as_non_voter() {
    let mut cluster = TestCluster::bootstrap(3).await.unwrap();

    cluster.start_node(4).await.unwrap();
    let leader = cluster.leader_handle().await.unwrap();
    let index = leader.add_server(4, "node-4:7000").await.unwrap();
    cluster
        .wait_for_applied(index, Duration::from_secs(5))
        .await
        .unwrap();

    let membership = leader.metrics().borrow().membership.clone();
    assert_eq!(membership.len(), 4);
    assert_eq!(
        membership.get(4).map(|s| s.role),
        Some(ServerRole::NonVoter)
    );
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn promoted_non_voter_becomes_voter() {
    let mut cluster = TestCluster::bootstrap(3).await.unwrap();

    cluster.start_node(4).await.unwrap();
    let leader = cluster.leader_handle().await.unwrap();
    leader.add_server(4, "node-4:7000").await.unwrap();

    let index = leader.promote_server(4).await.unwrap();
    cluster
        .wait_for_applied(index, Duration::from_secs(5))
        .await
        .unwrap();

    let membership = leader.metrics().borrow().membership.clone();
    assert!(membership.is_voter(4));
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removed_voter_leaves_the_configuration() {
    let cluster = TestCluster::bootstrap(5).await.unwrap();
    let leader_id = cluster.wait_for_leader().await.unwrap();
    let leader = cluster.leader_handle().await.unwrap();

    let victim = (leader_id % 5) + 1;
    let index = leader.remove_server(victim).await.unwrap();

    // The leader applies the removal; remaining voters follow.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let metrics = leader.metrics().borrow().clone();
        if metrics.last_applied >= index {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "removal did not apply in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let membership = leader.metrics().borrow().membership.clone();
    assert_eq!(membership.len(), 4);
    assert!(!membership.contains(victim));
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_survives_restart_with_term_and_log() {
    let mut cluster = TestCluster::bootstrap(1).await.unwrap();
    let leader = cluster.leader_handle().await.unwrap();

    let index = leader.submit(b"persisted".to_vec()).await.unwrap();
    let term_before = leader.metrics().borrow().term;

    cluster.stop_node(1).await.unwrap();
    cluster.start_node(1).await.unwrap();
    cluster.wait_for_leader().await.unwrap();

    let node = cluster.node(1);
    let metrics = node.raft.metrics().borrow().clone();
    assert!(metrics.term >= term_before, "term must never regress");
    assert!(metrics.last_log_index >= index);

    // The command is re-applied from the recovered log.
    cluster
        .wait_for_applied(index, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(cluster.node(1).probe.count_of(b"persisted"), 1);
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submit_to_follower_redirects_with_leader_hint() {
    let cluster = TestCluster::bootstrap(3).await.unwrap();
    let leader_id = cluster.wait_for_leader().await.unwrap();
    let follower_id = cluster
        .nodes
        .keys()
        .copied()
        .find(|id| *id != leader_id)
        .unwrap();

    let err = cluster
        .node(follower_id)
        .raft
        .submit(b"nope".to_vec())
        .await
        .unwrap_err();
    match err {
        RaftError::NotLeader { leader_hint } => assert_eq!(leader_hint, Some(leader_id)),
        other => panic!("expected NotLeader, got {other:?}"),
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leadership_transfers_to_target() {
    let cluster = TestCluster::bootstrap(3).await.unwrap();
    let leader_id = cluster.wait_for_leader().await.unwrap();
    let target = cluster
        .nodes
        .keys()
        .copied()
        .find(|id| *id != leader_id)
        .unwrap();

    let leader = cluster.leader_handle().await.unwrap();
    leader.transfer_leadership(target).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(new_leader) = cluster.wait_for_leader_within(Duration::from_millis(500)).await {
            if new_leader == target {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "leadership did not reach node {target}"
        );
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_catches_up_through_a_snapshot() {
    // Aggressive snapshotting so the log is compacted before the new
    // node arrives.
    let config = common::Config::builder()
        .election_timeout(Duration::from_millis(150))
        .heartbeat_interval(Duration::from_millis(25))
        .tick_interval(Duration::from_millis(5))
        .snapshot_threshold(8)
        .install_snapshot_trailing(2)
        .build();
    let mut cluster = TestCluster::bootstrap_with_config(1, config).await.unwrap();
    let leader = cluster.leader_handle().await.unwrap();

    let mut last = 0;
    for i in 0..40u32 {
        last = leader
            .submit(format!("cmd-{i}").into_bytes())
            .await
            .unwrap();
    }
    // The leader must have snapshotted by now.
    let snapshot_index = leader.metrics().borrow().snapshot_index;
    assert!(snapshot_index > 0, "expected an automatic snapshot");

    cluster.start_node(2).await.unwrap();
    let leader = cluster.leader_handle().await.unwrap();
    leader.add_server(2, "node-2:7000").await.unwrap();

    cluster
        .wait_for_applied(last, Duration::from_secs(10))
        .await
        .unwrap();

    // The late joiner holds the full command history: the snapshot
    // restored the prefix, replication delivered the rest.
    assert_eq!(cluster.node(2).probe.commands().len(), 40);
    cluster.shutdown().await.unwrap();
}
