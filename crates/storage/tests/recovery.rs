//! End-to-end recovery tests: everything written through the log writer
//! must come back identically after a reopen.

use common::{Config, Entry, Membership};
use storage::{HardState, Storage};
use tempfile::TempDir;

fn config() -> Config {
    // Small segments so rolling is exercised without much data.
    Config::builder().segment_size(64 * 1024).build()
}

fn command(term: u64, index: u64, size: usize) -> Entry {
    Entry::command(term, index, vec![index as u8; size])
}

async fn append_all(storage: &Storage, entries: Vec<Entry>) {
    let completion = storage.writer.append(entries);
    completion.await.expect("writer alive").expect("append ok");
}

#[tokio::test]
async fn log_survives_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let (storage, initial) = Storage::open(dir.path(), &config()).unwrap();
        assert!(initial.entries.is_empty());
        append_all(&storage, vec![command(1, 1, 10), command(1, 2, 10)]).await;
        append_all(&storage, vec![command(2, 3, 10)]).await;
        storage.close().await.unwrap();
    }

    let (storage, initial) = Storage::open(dir.path(), &config()).unwrap();
    assert_eq!(initial.entries.len(), 3);
    assert_eq!(initial.entries[0].index, 1);
    assert_eq!(initial.entries[2].term, 2);
    storage.close().await.unwrap();
}

#[tokio::test]
async fn completions_arrive_in_submission_order() {
    let dir = TempDir::new().unwrap();
    let (storage, _) = Storage::open(dir.path(), &config()).unwrap();

    let completions: Vec<_> = (1..=32)
        .map(|i| storage.writer.append(vec![command(1, i, 128)]))
        .collect();
    for completion in completions {
        completion.await.unwrap().unwrap();
    }
    storage.close().await.unwrap();

    let (_, initial) = Storage::open(dir.path(), &config()).unwrap();
    let indexes: Vec<u64> = initial.entries.iter().map(|e| e.index).collect();
    assert_eq!(indexes, (1..=32).collect::<Vec<u64>>());
}

#[tokio::test]
async fn segments_roll_and_reload() {
    let dir = TempDir::new().unwrap();
    let (storage, _) = Storage::open(dir.path(), &config()).unwrap();

    // Each batch is ~16 KiB; a 64 KiB segment holds only a few.
    for i in 1..=40u64 {
        append_all(&storage, vec![command(1, i, 16 * 1024)]).await;
    }
    storage.close().await.unwrap();

    let closed_segments = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy().into_owned();
            !name.starts_with("open-")
                && !name.starts_with("metadata")
                && name.contains('-')
        })
        .count();
    assert!(closed_segments > 0, "expected at least one rolled segment");

    let (_, initial) = Storage::open(dir.path(), &config()).unwrap();
    assert_eq!(initial.entries.len(), 40);
    assert_eq!(initial.entries.last().unwrap().index, 40);
}

#[tokio::test]
async fn truncate_suffix_discards_conflicting_entries() {
    let dir = TempDir::new().unwrap();

    {
        let (storage, _) = Storage::open(dir.path(), &config()).unwrap();
        append_all(
            &storage,
            (1..=5).map(|i| command(1, i, 16)).collect::<Vec<_>>(),
        )
        .await;
        // Conflict at index 3: drop [3..5], append replacements from a
        // newer term.
        storage.writer.truncate_suffix(3).await.unwrap().unwrap();
        append_all(&storage, vec![command(2, 3, 16), command(2, 4, 16)]).await;
        storage.close().await.unwrap();
    }

    let (_, initial) = Storage::open(dir.path(), &config()).unwrap();
    let got: Vec<(u64, u64)> = initial.entries.iter().map(|e| (e.term, e.index)).collect();
    assert_eq!(got, vec![(1, 1), (1, 2), (2, 3), (2, 4)]);
}

#[tokio::test]
async fn truncate_whole_log_then_rewrite() {
    let dir = TempDir::new().unwrap();

    {
        let (storage, _) = Storage::open(dir.path(), &config()).unwrap();
        append_all(&storage, vec![command(1, 1, 16), command(1, 2, 16)]).await;
        storage.writer.truncate_suffix(1).await.unwrap().unwrap();
        append_all(&storage, vec![command(3, 1, 16)]).await;
        storage.close().await.unwrap();
    }

    let (_, initial) = Storage::open(dir.path(), &config()).unwrap();
    assert_eq!(initial.entries.len(), 1);
    assert_eq!(initial.entries[0].term, 3);
}

#[tokio::test]
async fn compaction_deletes_obsolete_segments() {
    let dir = TempDir::new().unwrap();
    let (storage, _) = Storage::open(dir.path(), &config()).unwrap();

    for i in 1..=40u64 {
        append_all(&storage, vec![command(1, i, 16 * 1024)]).await;
    }

    // Snapshot through 30, then compact.
    storage
        .snapshots
        .save(1, 30, Membership::single(1, "a:1"), b"state")
        .unwrap();
    storage.writer.compact_through(30).await.unwrap().unwrap();
    storage.close().await.unwrap();

    let (_, initial) = Storage::open(dir.path(), &config()).unwrap();
    let snapshot = initial.snapshot.expect("snapshot present");
    assert_eq!(snapshot.meta.last_included_index, 30);
    // The in-memory suffix starts after the snapshot.
    assert!(initial.entries.first().unwrap().index > 30);
    assert_eq!(initial.entries.last().unwrap().index, 40);
}

#[tokio::test]
async fn reset_restarts_log_beyond_installed_snapshot() {
    let dir = TempDir::new().unwrap();

    {
        let (storage, _) = Storage::open(dir.path(), &config()).unwrap();
        append_all(
            &storage,
            (1..=5).map(|i| command(1, i, 16)).collect::<Vec<_>>(),
        )
        .await;

        // An installed snapshot at 100 supersedes the whole log.
        storage
            .snapshots
            .save(4, 100, Membership::single(1, "a:1"), b"installed")
            .unwrap();
        storage.writer.reset(101).await.unwrap().unwrap();
        append_all(&storage, vec![command(4, 101, 16)]).await;
        storage.close().await.unwrap();
    }

    let (_, initial) = Storage::open(dir.path(), &config()).unwrap();
    assert_eq!(
        initial.snapshot.as_ref().unwrap().meta.last_included_index,
        100
    );
    assert_eq!(initial.entries.len(), 1);
    assert_eq!(initial.entries[0].index, 101);
}

#[tokio::test]
async fn hard_state_survives_crash_before_replication() {
    let dir = TempDir::new().unwrap();

    {
        let (mut storage, _) = Storage::open(dir.path(), &config()).unwrap();
        storage
            .metadata
            .save(&HardState {
                term: 9,
                voted_for: Some(1),
                first_index: 1,
            })
            .unwrap();
        // No close: simulate the process dying right here.
        drop(storage);
    }

    let (_, initial) = Storage::open(dir.path(), &config()).unwrap();
    assert_eq!(initial.hard_state.term, 9);
    assert_eq!(initial.hard_state.voted_for, Some(1));
}
