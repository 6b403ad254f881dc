use crate::log::LogStore;
use common::{Entry, RaftError};
use pretty_assertions::assert_eq;

fn entries(term: u64, range: std::ops::RangeInclusive<u64>) -> Vec<Entry> {
    range
        .map(|i| Entry::command(term, i, vec![i as u8]))
        .collect()
}

#[test]
fn empty_log_boundaries() {
    let log = LogStore::new(0, 0, Vec::new());
    assert_eq!(log.first_index(), 1);
    assert_eq!(log.last_index(), 0);
    assert_eq!(log.last_term(), 0);
    assert_eq!(log.term_of(0), Some(0));
    assert_eq!(log.term_of(1), None);
    assert!(log.get(1).is_none());
}

#[test]
fn append_and_get() {
    let mut log = LogStore::new(0, 0, Vec::new());
    log.append(&entries(1, 1..=3));
    assert_eq!(log.last_index(), 3);
    assert_eq!(log.get(2).unwrap().index, 2);
    assert_eq!(log.term_of(3), Some(1));

    // Appending across a term boundary is fine.
    log.append(&entries(2, 4..=5));
    assert_eq!(log.last_term(), 2);
    assert_eq!(log.range(2, 4).len(), 3);
}

#[test]
fn log_starting_past_one_after_restore() {
    let log = LogStore::new(100, 7, entries(8, 101..=105));
    assert_eq!(log.first_index(), 101);
    assert_eq!(log.last_index(), 105);
    assert_eq!(log.snapshot_index(), 100);
    // The snapshot boundary answers its term.
    assert_eq!(log.term_of(100), Some(7));
    assert_eq!(log.term_of(99), None);
    assert_eq!(log.term_of(101), Some(8));
}

#[test]
fn truncate_suffix_drops_conflicts() {
    let mut log = LogStore::new(0, 0, Vec::new());
    log.append(&entries(1, 1..=5));
    log.truncate_suffix(3);
    assert_eq!(log.last_index(), 2);
    assert!(log.get(3).is_none());
    // And the tail can be rebuilt under a newer term.
    log.append(&entries(2, 3..=4));
    assert_eq!(log.term_of(3), Some(2));
}

#[test]
fn truncate_prefix_compacts_up_to_snapshot() {
    let mut log = LogStore::new(0, 0, Vec::new());
    log.append(&entries(1, 1..=10));
    log.note_snapshot(8, 1);
    log.truncate_prefix(8).unwrap();
    assert_eq!(log.first_index(), 9);
    assert_eq!(log.last_index(), 10);
    assert_eq!(log.term_of(8), Some(1)); // boundary still answers
    assert!(log.get(8).is_none());
}

#[test]
fn pinned_range_blocks_compaction() {
    let mut log = LogStore::new(0, 0, Vec::new());
    log.append(&entries(1, 1..=10));
    log.note_snapshot(10, 1);

    let pin = log.acquire(4, 6);
    assert!(matches!(log.truncate_prefix(5), Err(RaftError::Busy)));

    // A disjoint prefix may still go.
    log.truncate_prefix(3).unwrap();
    assert_eq!(log.first_index(), 4);

    log.release(pin);
    log.truncate_prefix(10).unwrap();
    assert_eq!(log.first_index(), 11);
    assert!(log.is_empty());
}

#[test]
fn install_snapshot_conflicting_log_is_discarded() {
    let mut log = LogStore::new(0, 0, Vec::new());
    log.append(&entries(1, 1..=5));

    // Snapshot at index 8 term 3: nothing in the log matches.
    log.install_snapshot(8, 3);
    assert!(log.is_empty());
    assert_eq!(log.first_index(), 9);
    assert_eq!(log.last_term(), 3);
    assert_eq!(log.term_of(8), Some(3));
}

#[test]
fn install_snapshot_matching_prefix_keeps_suffix() {
    let mut log = LogStore::new(0, 0, Vec::new());
    log.append(&entries(2, 1..=10));

    // Snapshot covers 1..=6 with the same term: the suffix survives.
    log.install_snapshot(6, 2);
    assert_eq!(log.first_index(), 7);
    assert_eq!(log.last_index(), 10);
}
