use crate::codec;
use crate::message::*;
use common::{Entry, Membership, RaftError};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use storage::SnapshotMeta;

fn round_trip(message: Message) {
    let frame = codec::encode(&message).unwrap();
    let (decoded, used) = codec::decode(&frame).unwrap();
    assert_eq!(used, frame.len());
    assert_eq!(decoded, message);
}

#[test]
fn every_message_type_round_trips() {
    round_trip(Message::RequestVote(RequestVote {
        term: 3,
        candidate: 1,
        last_log_index: 10,
        last_log_term: 2,
        pre_vote: true,
    }));
    round_trip(Message::RequestVoteResult(RequestVoteResult {
        term: 3,
        granted: true,
        pre_vote: false,
    }));
    round_trip(Message::AppendEntries(AppendEntries {
        term: 5,
        leader: 2,
        prev_log_index: 7,
        prev_log_term: 4,
        entries: vec![
            Entry::command(5, 8, b"x=1".to_vec()),
            Entry::barrier(5, 9),
            Entry::membership(5, 10, Membership::single(1, "a:1")),
        ],
        leader_commit: 7,
    }));
    round_trip(Message::AppendEntriesResult(AppendEntriesResult {
        term: 5,
        success: false,
        last_log_index: 6,
        conflict: Some(ConflictHint {
            term: Some(3),
            index: 4,
        }),
    }));
    round_trip(Message::InstallSnapshot(InstallSnapshot {
        term: 6,
        leader: 2,
        meta: SnapshotMeta {
            last_included_index: 100,
            last_included_term: 5,
            membership: Membership::single(1, "a:1"),
            size: 4,
            checksum: 0xdeadbeef,
        },
        offset: 0,
        data: b"snap".to_vec(),
        done: true,
    }));
    round_trip(Message::InstallSnapshotResult(InstallSnapshotResult {
        term: 6,
        offset: 4,
    }));
    round_trip(Message::TimeoutNow(TimeoutNow { term: 6 }));
}

#[test]
fn decode_rejects_unknown_version() {
    let mut frame = codec::encode(&Message::TimeoutNow(TimeoutNow { term: 1 })).unwrap();
    frame[4] = 9;
    assert!(matches!(
        codec::decode(&frame).unwrap_err(),
        RaftError::Corrupt(_)
    ));
}

#[test]
fn decode_rejects_mismatched_type_byte() {
    let mut frame = codec::encode(&Message::TimeoutNow(TimeoutNow { term: 1 })).unwrap();
    frame[5] = 1; // claims RequestVote
    assert!(codec::decode(&frame).is_err());
}

#[test]
fn decode_rejects_truncated_frames() {
    let frame = codec::encode(&Message::TimeoutNow(TimeoutNow { term: 1 })).unwrap();
    for cut in 0..frame.len() {
        assert!(codec::decode(&frame[..cut]).is_err(), "cut at {cut}");
    }
}

#[test]
fn decode_rejects_absurd_length() {
    let mut frame = codec::encode(&Message::TimeoutNow(TimeoutNow { term: 1 })).unwrap();
    frame[0..4].copy_from_slice(&(u32::MAX).to_le_bytes());
    assert!(codec::decode(&frame).is_err());
}

proptest! {
    #[test]
    fn append_entries_round_trips_arbitrary_payloads(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 0..8),
        term in 1u64..100,
        start in 1u64..1000,
    ) {
        let entries: Vec<Entry> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, data)| Entry::command(term, start + i as u64, data))
            .collect();
        let message = Message::AppendEntries(AppendEntries {
            term,
            leader: 1,
            prev_log_index: start - 1,
            prev_log_term: term - 1,
            entries,
            leader_commit: start,
        });
        let frame = codec::encode(&message).unwrap();
        let (decoded, _) = codec::decode(&frame).unwrap();
        prop_assert_eq!(decoded, message);
    }
}
