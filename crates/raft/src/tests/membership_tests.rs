use crate::membership::MembershipState;
use common::Membership;
use pretty_assertions::assert_eq;

fn config(ids: &[u64]) -> Membership {
    Membership::new(
        ids.iter()
            .map(|id| common::Server {
                id: *id,
                address: format!("node-{id}:7000"),
                role: common::ServerRole::Voter,
            })
            .collect(),
    )
    .unwrap()
}

#[test]
fn effective_follows_appends() {
    let mut state = MembershipState::new(0, config(&[1, 2, 3]));
    assert_eq!(state.effective().len(), 3);
    assert!(!state.has_pending(0));

    state.apply(5, config(&[1, 2, 3, 4]));
    assert_eq!(state.effective().len(), 4);
    assert!(state.has_pending(4));
    assert!(!state.has_pending(5));
}

#[test]
fn rollback_restores_previous_configuration() {
    let mut state = MembershipState::new(0, config(&[1, 2, 3]));
    state.apply(5, config(&[1, 2, 3, 4]));

    // The entry at 5 was truncated by conflict resolution.
    state.rollback(5);
    assert_eq!(state.effective().len(), 3);
    assert_eq!(state.effective_index(), 0);
}

#[test]
fn commit_settles_the_base() {
    let mut state = MembershipState::new(0, config(&[1, 2, 3]));
    state.apply(5, config(&[1, 2, 3, 4]));
    state.commit(5);
    assert!(!state.has_pending(5));

    // A rollback below the committed base must be a no-op.
    state.rollback(3);
    assert_eq!(state.effective().len(), 4);
}

#[test]
fn at_answers_historical_configurations() {
    let mut state = MembershipState::new(0, config(&[1, 2, 3]));
    state.apply(5, config(&[1, 2, 3, 4]));
    state.apply(9, config(&[1, 2, 3, 4, 5]));

    assert_eq!(state.at(4).len(), 3);
    assert_eq!(state.at(5).len(), 4);
    assert_eq!(state.at(8).len(), 4);
    assert_eq!(state.at(100).len(), 5);
}

#[test]
fn install_replaces_history() {
    let mut state = MembershipState::new(0, config(&[1, 2, 3]));
    state.apply(5, config(&[1, 2, 3, 4]));
    state.install(20, config(&[7, 8, 9]));
    assert_eq!(state.effective_index(), 20);
    assert!(state.effective().contains(7));
    assert!(!state.effective().contains(1));
}
