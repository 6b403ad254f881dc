use crate::membership::{Membership, Server, ServerRole};
use crate::{Config, RaftError};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::time::Duration;

fn voter(id: u64) -> Server {
    Server {
        id,
        address: format!("node-{id}:7000"),
        role: ServerRole::Voter,
    }
}

#[test]
fn membership_rejects_duplicate_ids() {
    let err = Membership::new(vec![voter(1), voter(1)]).unwrap_err();
    assert!(matches!(err, RaftError::Corrupt(_)));
}

#[test]
fn membership_rejects_id_zero() {
    let err = Membership::new(vec![voter(0)]).unwrap_err();
    assert!(matches!(err, RaftError::Corrupt(_)));
}

#[test]
fn quorum_sizes() {
    let one = Membership::single(1, "a:1");
    assert_eq!(one.quorum_size(), 1);

    let three = Membership::new(vec![voter(1), voter(2), voter(3)]).unwrap();
    assert_eq!(three.quorum_size(), 2);

    let five = Membership::new((1..=5).map(voter).collect()).unwrap();
    assert_eq!(five.quorum_size(), 3);
}

#[test]
fn non_voters_do_not_count_toward_quorum() {
    let mut servers: Vec<Server> = (1..=3).map(voter).collect();
    servers.push(Server {
        id: 4,
        address: "node-4:7000".into(),
        role: ServerRole::NonVoter,
    });
    let membership = Membership::new(servers).unwrap();

    assert_eq!(membership.quorum_size(), 2);
    assert!(membership.has_quorum([1, 2]));
    // Votes from a non-voter are discarded.
    assert!(!membership.has_quorum([1, 4]));
}

#[test]
fn quorum_match_index_takes_the_median() {
    let membership = Membership::new((1..=3).map(voter).collect()).unwrap();
    let mut matched = BTreeMap::new();
    matched.insert(2u64, 5u64);
    matched.insert(3u64, 3u64);

    // Leader (id 1) is at 10; sorted desc [10, 5, 3]; quorum of 2 -> 5.
    assert_eq!(membership.quorum_match_index(1, 10, &matched), 5);
}

#[test]
fn single_node_quorum_is_its_own_index() {
    let membership = Membership::single(1, "a:1");
    let matched = BTreeMap::new();
    assert_eq!(membership.quorum_match_index(1, 7, &matched), 7);
}

#[test]
fn add_remove_and_promote() {
    let base = Membership::new(vec![voter(1), voter(2), voter(3)]).unwrap();

    let grown = base
        .with_added(Server {
            id: 4,
            address: "node-4:7000".into(),
            role: ServerRole::NonVoter,
        })
        .unwrap();
    assert_eq!(grown.len(), 4);
    assert!(!grown.is_voter(4));

    let promoted = grown.with_role(4, ServerRole::Voter).unwrap();
    assert!(promoted.is_voter(4));
    assert_eq!(promoted.quorum_size(), 3);

    let shrunk = promoted.with_removed(2).unwrap();
    assert_eq!(shrunk.len(), 3);
    assert!(!shrunk.contains(2));

    // Adding an existing id is a busy-style rejection.
    assert!(matches!(
        base.with_added(voter(2)).unwrap_err(),
        RaftError::Busy
    ));
}

#[test]
fn config_defaults_are_valid() {
    let config = Config::default();
    assert_eq!(config.election_timeout, Duration::from_millis(1000));
    assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
    assert_eq!(config.snapshot_threshold, 1024);
    assert_eq!(config.install_snapshot_trailing, 8192);
    config.validate().unwrap();
}

#[test]
fn config_rejects_inverted_timers() {
    let config = Config::builder()
        .election_timeout(Duration::from_millis(50))
        .heartbeat_interval(Duration::from_millis(100))
        .build();
    assert!(config.validate().is_err());
}
