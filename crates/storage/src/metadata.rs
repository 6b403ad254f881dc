//! Crash-safe persistence of the server's hard state.
//!
//! Two fixed-size files, `metadata1` and `metadata2`, are written
//! alternately. Each holds one checksummed record with a monotonically
//! increasing version counter. A write always targets the file carrying
//! the older counter, so a torn write can only destroy the older of the
//! two copies; the reader picks the highest-counter record that passes
//! its checksum.

use crate::frame::{bincode_config, decode_record, encode_record};
use common::{LogIndex, NodeId, RaftError, RaftResult, Term};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const METADATA_MAGIC: u32 = 0x524d4554; // "RMET"
const METADATA_PAGE_SIZE: usize = 8192;
const FORMAT_VERSION: u32 = 1;

/// The durable per-server Raft state.
///
/// Must be flushed before any message that depends on it is sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    /// First index still present in the log; advances on compaction.
    pub first_index: LogIndex,
}

#[derive(Serialize, Deserialize)]
struct MetadataRecord {
    format_version: u32,
    counter: u64,
    term: Term,
    voted_for: Option<NodeId>,
    first_index: LogIndex,
}

/// Rotating two-file store for [`HardState`].
#[derive(Debug)]
pub struct MetadataStore {
    paths: [PathBuf; 2],
    /// Slot the next write targets (the one with the older counter).
    next_slot: usize,
    counter: u64,
}

impl MetadataStore {
    /// Open the store, returning the recovered state if either file holds
    /// a valid record.
    ///
    /// # Errors
    ///
    /// Returns `RaftError::Corrupt` when both files exist but neither
    /// passes validation: silently restarting fresh would lose a vote.
    pub fn open(dir: &Path) -> RaftResult<(Self, Option<HardState>)> {
        let paths = [dir.join("metadata1"), dir.join("metadata2")];
        let mut slots: [Option<(u64, HardState)>; 2] = [None, None];
        let mut present = 0;

        for (i, path) in paths.iter().enumerate() {
            if !path.exists() {
                continue;
            }
            present += 1;
            match Self::read_slot(path) {
                Ok(record) => slots[i] = Some(record),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "metadata page unreadable");
                }
            }
        }

        if present > 0 && slots.iter().all(|s| s.is_none()) {
            return Err(RaftError::Corrupt(
                "both metadata files failed validation".into(),
            ));
        }

        let (next_slot, counter, state) = match (&slots[0], &slots[1]) {
            (None, None) => (0, 0, None),
            (Some((c, s)), None) => (1, *c, Some(*s)),
            (None, Some((c, s))) => (0, *c, Some(*s)),
            (Some((c0, s0)), Some((c1, s1))) => {
                if c0 >= c1 {
                    (1, *c0, Some(*s0))
                } else {
                    (0, *c1, Some(*s1))
                }
            }
        };

        Ok((
            Self {
                paths,
                next_slot,
                counter,
            },
            state,
        ))
    }

    fn read_slot(path: &Path) -> RaftResult<(u64, HardState)> {
        let mut file = File::open(path)?;
        let mut page = vec![0u8; METADATA_PAGE_SIZE];
        let mut filled = 0;
        while filled < page.len() {
            let n = file.read(&mut page[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let body = decode_record(METADATA_MAGIC, &page[..filled], "metadata")?;
        let (record, _): (MetadataRecord, _) = bincode::serde::decode_from_slice(
            body,
            bincode_config(),
        )
        .map_err(|e| RaftError::Corrupt(format!("metadata: {e}")))?;
        if record.format_version != FORMAT_VERSION {
            return Err(RaftError::Corrupt(format!(
                "metadata: unsupported format version {}",
                record.format_version
            )));
        }
        Ok((
            record.counter,
            HardState {
                term: record.term,
                voted_for: record.voted_for,
                first_index: record.first_index,
            },
        ))
    }

    /// Durably persist `state`, rotating to the older file.
    ///
    /// The page is written in full and fsynced before this returns, so a
    /// caller may act on the new term or vote immediately after.
    pub fn save(&mut self, state: &HardState) -> RaftResult<()> {
        let record = MetadataRecord {
            format_version: FORMAT_VERSION,
            counter: self.counter + 1,
            term: state.term,
            voted_for: state.voted_for,
            first_index: state.first_index,
        };
        let body = bincode::serde::encode_to_vec(&record, bincode_config())
            .map_err(|e| RaftError::Corrupt(format!("metadata encode: {e}")))?;
        let mut page = encode_record(METADATA_MAGIC, &body);
        if page.len() > METADATA_PAGE_SIZE {
            return Err(RaftError::Exhausted("metadata record exceeds page".into()));
        }
        page.resize(METADATA_PAGE_SIZE, 0);

        let path = &self.paths[self.next_slot];
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&page)?;
        file.sync_all()?;

        self.counter = record.counter;
        self.next_slot ^= 1;
        Ok(())
    }
}
