//! Durable state for a Raft node: metadata pages, segment-based log
//! storage with an asynchronous writer, and snapshots.
//!
//! ## Data directory layout
//!
//! ```text
//! {data_dir}/
//! ├── metadata1              # rotating hard-state pages (8 KiB each)
//! ├── metadata2
//! ├── open-N                 # segment currently being written
//! ├── FIRST-LAST             # finished segments, named by index range
//! ├── snapshot-T-I-CS        # snapshot payload
//! └── snapshot-T-I-CS.meta   # snapshot metadata
//! ```
//!
//! [`Storage::open`] performs crash recovery: it validates the metadata
//! pages, picks the newest readable snapshot, reloads the log suffix
//! from the segment files, and hands the segment tail to the background
//! [`LogWriter`]. The directory is owned exclusively by one process.


pub mod aio;
pub mod frame;
pub mod metadata;
pub mod probe;
pub mod segment;
pub mod snapshot;
pub mod writer;

pub use metadata::{HardState, MetadataStore};
pub use probe::{WriteCapabilities, probe};
pub use snapshot::{InstallSink, SnapshotFile, SnapshotMeta, SnapshotStore};
pub use writer::{LogWriter, WriteCompletion};

use common::{Config, Entry, RaftError, RaftResult};
use std::fs;
use std::path::Path;

/// Everything recovered from disk at startup.
#[derive(Debug)]
pub struct InitialState {
    pub hard_state: HardState,
    pub snapshot: Option<SnapshotFile>,
    /// Log entries after the snapshot boundary, contiguous.
    pub entries: Vec<Entry>,
    pub capabilities: WriteCapabilities,
}

/// The durable half of a Raft node.
pub struct Storage {
    pub metadata: MetadataStore,
    pub writer: LogWriter,
    pub snapshots: SnapshotStore,
}

impl Storage {
    /// Open (or initialize) a data directory and recover its state.
    ///
    /// Must be called within a tokio runtime: the log writer task is
    /// spawned here.
    ///
    /// # Errors
    ///
    /// `RaftError::Corrupt` when metadata, segments, or snapshots fail
    /// validation in a way recovery cannot work around; the node must
    /// refuse to start rather than desert its promises.
    pub fn open(dir: &Path, config: &Config) -> RaftResult<(Self, InitialState)> {
        fs::create_dir_all(dir)?;
        remove_temp_files(dir)?;

        let capabilities = probe::probe(dir);
        let (metadata, recovered) = MetadataStore::open(dir)?;
        let hard_state = recovered.unwrap_or(HardState {
            term: 0,
            voted_for: None,
            first_index: 1,
        });

        let snapshots = SnapshotStore::new(dir);
        let snapshot = snapshots.load_latest()?;
        let snapshot_last = snapshot.as_ref().map(|s| s.meta.last_included_index);

        let mut scan = segment::scan_dir(dir)?;
        let mut entries: Vec<Entry> = Vec::new();
        for seg in &mut scan.closed {
            entries.append(&mut seg.entries);
        }
        for seg in &mut scan.open {
            entries.append(&mut seg.entries);
        }
        entries.sort_by_key(|e| e.index);
        entries.dedup_by_key(|e| e.index);

        for pair in entries.windows(2) {
            if pair[1].index != pair[0].index + 1 {
                return Err(RaftError::Corrupt(format!(
                    "log has a gap between indexes {} and {}",
                    pair[0].index, pair[1].index
                )));
            }
        }

        // Drop whatever the snapshot already covers.
        if let Some(boundary) = snapshot_last {
            entries.retain(|e| e.index > boundary);
        }
        if let Some(first) = entries.first() {
            let expected = snapshot_last.map(|b| b + 1).unwrap_or(1);
            if first.index > expected {
                return Err(RaftError::Corrupt(format!(
                    "log starts at {} but {} was expected",
                    first.index, expected
                )));
            }
        }

        let next_index = entries
            .last()
            .map(|e| e.index + 1)
            .or(snapshot_last.map(|b| b + 1))
            .unwrap_or_else(|| hard_state.first_index.max(1));

        let writer = LogWriter::open(
            dir.to_path_buf(),
            config.segment_size,
            capabilities,
            scan,
            next_index,
        )?;

        tracing::info!(
            term = hard_state.term,
            entries = entries.len(),
            snapshot = ?snapshot_last,
            "storage recovered"
        );

        Ok((
            Self {
                metadata,
                writer,
                snapshots,
            },
            InitialState {
                hard_state,
                snapshot,
                entries,
                capabilities,
            },
        ))
    }

    /// Drain the writer and release every descriptor.
    pub async fn close(self) -> RaftResult<()> {
        self.writer.close().await
    }
}

fn remove_temp_files(dir: &Path) -> RaftResult<()> {
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(".tmp") || name.ends_with(".partial") || name == ".probe" {
            let _ = fs::remove_file(dirent.path());
        }
    }
    Ok(())
}
