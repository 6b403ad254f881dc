//! Snapshot persistence: take, load, purge, and chunked install.
//!
//! A snapshot is a pair of files in the data directory,
//!
//! ```text
//! snapshot-T-I-CS        # opaque state machine payload
//! snapshot-T-I-CS.meta   # checksummed metadata record
//! ```
//!
//! for term `T`, last included index `I`, and a random suffix `CS` so a
//! retaken snapshot at the same position never collides. Both files are
//! written to a temporary name, fsynced, renamed into place (payload
//! first, metadata last, so a visible `.meta` always refers to a
//! complete payload), and the directory is fsynced.

use crate::frame::{bincode_config, decode_record, encode_record};
use common::{LogIndex, Membership, RaftError, RaftResult, Term};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_MAGIC: u32 = 0x52534e50; // "RSNP"

/// What a snapshot covers, persisted beside the payload and carried by
/// InstallSnapshot messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Configuration in force at the snapshot index.
    pub membership: Membership,
    pub size: u64,
    /// CRC32 of the payload bytes.
    pub checksum: u32,
}

/// A snapshot present on disk.
#[derive(Clone, Debug)]
pub struct SnapshotFile {
    pub meta: SnapshotMeta,
    pub path: PathBuf,
}

/// Store managing the snapshot files of one data directory.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Persist a freshly taken snapshot.
    pub fn save(
        &self,
        term: Term,
        index: LogIndex,
        membership: Membership,
        data: &[u8],
    ) -> RaftResult<SnapshotFile> {
        let meta = SnapshotMeta {
            last_included_index: index,
            last_included_term: term,
            membership,
            size: data.len() as u64,
            checksum: crc32fast::hash(data),
        };
        let stem = snapshot_stem(term, index);

        let payload_path = self.dir.join(&stem);
        let temp_payload = self.dir.join(format!("{stem}.tmp"));
        let mut file = File::create(&temp_payload)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_payload, &payload_path)?;

        self.write_meta(&stem, &meta)?;
        crate::segment::sync_dir(&self.dir)?;

        tracing::info!(term, index, size = meta.size, "snapshot persisted");
        Ok(SnapshotFile {
            meta,
            path: payload_path,
        })
    }

    fn write_meta(&self, stem: &str, meta: &SnapshotMeta) -> RaftResult<()> {
        let body = bincode::serde::encode_to_vec(meta, bincode_config())
            .map_err(|e| RaftError::Corrupt(format!("snapshot meta encode: {e}")))?;
        let record = encode_record(SNAPSHOT_MAGIC, &body);

        let meta_path = self.dir.join(format!("{stem}.meta"));
        let temp_meta = self.dir.join(format!("{stem}.meta.tmp"));
        let mut file = File::create(&temp_meta)?;
        file.write_all(&record)?;
        file.sync_all()?;
        fs::rename(&temp_meta, &meta_path)?;
        Ok(())
    }

    /// Find the newest snapshot that passes validation.
    ///
    /// A corrupt newer snapshot is skipped with a warning so an older
    /// valid one can still carry the restart.
    pub fn load_latest(&self) -> RaftResult<Option<SnapshotFile>> {
        let mut candidates: Vec<(LogIndex, Term, String)> = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".meta") else {
                continue;
            };
            if let Some((term, index)) = parse_snapshot_stem(stem) {
                candidates.push((index, term, stem.to_string()));
            }
        }
        candidates.sort();

        while let Some((_, _, stem)) = candidates.pop() {
            match self.load_stem(&stem) {
                Ok(found) => return Ok(Some(found)),
                Err(err) => {
                    tracing::warn!(%stem, %err, "skipping unreadable snapshot");
                }
            }
        }
        Ok(None)
    }

    fn load_stem(&self, stem: &str) -> RaftResult<SnapshotFile> {
        let mut record = Vec::new();
        File::open(self.dir.join(format!("{stem}.meta")))?.read_to_end(&mut record)?;
        let body = decode_record(SNAPSHOT_MAGIC, &record, "snapshot meta")?;
        let (meta, _): (SnapshotMeta, _) = bincode::serde::decode_from_slice(body, bincode_config())
            .map_err(|e| RaftError::Corrupt(format!("snapshot meta: {e}")))?;

        let path = self.dir.join(stem);
        let size = fs::metadata(&path)?.len();
        if size != meta.size {
            return Err(RaftError::Corrupt(format!(
                "snapshot payload is {size} bytes, metadata says {}",
                meta.size
            )));
        }
        Ok(SnapshotFile { meta, path })
    }

    /// Read and checksum a snapshot payload.
    pub fn read_payload(&self, snapshot: &SnapshotFile) -> RaftResult<Vec<u8>> {
        let mut data = Vec::with_capacity(snapshot.meta.size as usize);
        File::open(&snapshot.path)?.read_to_end(&mut data)?;
        if crc32fast::hash(&data) != snapshot.meta.checksum {
            return Err(RaftError::Corrupt(
                "snapshot payload checksum mismatch".into(),
            ));
        }
        Ok(data)
    }

    /// Delete every snapshot older than `index`.
    pub fn purge_older_than(&self, index: LogIndex) -> RaftResult<()> {
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let stem = name.strip_suffix(".meta").unwrap_or(name);
            let Some((_, snap_index)) = parse_snapshot_stem(stem) else {
                continue;
            };
            if snap_index < index {
                let _ = fs::remove_file(dirent.path());
            }
        }
        crate::segment::sync_dir(&self.dir)?;
        Ok(())
    }

    /// Start receiving a streamed snapshot into a temporary file.
    pub fn begin_install(&self, meta: SnapshotMeta) -> RaftResult<InstallSink> {
        let stem = snapshot_stem(meta.last_included_term, meta.last_included_index);
        let temp_path = self.dir.join(format!("{stem}.partial"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        Ok(InstallSink {
            dir: self.dir.clone(),
            stem,
            temp_path,
            file,
            meta,
            received: 0,
        })
    }
}

/// An in-progress inbound snapshot transfer.
pub struct InstallSink {
    dir: PathBuf,
    stem: String,
    temp_path: PathBuf,
    file: File,
    meta: SnapshotMeta,
    received: u64,
}

impl InstallSink {
    pub fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Append one chunk. Chunks must arrive in order without gaps.
    pub fn write_chunk(&mut self, offset: u64, data: &[u8]) -> RaftResult<()> {
        if offset != self.received {
            return Err(RaftError::Corrupt(format!(
                "snapshot chunk at offset {offset}, expected {}",
                self.received
            )));
        }
        self.file.write_all(data)?;
        self.received += data.len() as u64;
        Ok(())
    }

    /// Validate and atomically publish the received snapshot.
    pub fn finish(self) -> RaftResult<SnapshotFile> {
        if self.received != self.meta.size {
            return Err(RaftError::Corrupt(format!(
                "snapshot transfer ended at {} of {} bytes",
                self.received, self.meta.size
            )));
        }
        self.file.sync_all()?;

        let payload_path = self.dir.join(&self.stem);
        fs::rename(&self.temp_path, &payload_path)?;

        let store = SnapshotStore::new(&self.dir);
        let snapshot = SnapshotFile {
            meta: self.meta,
            path: payload_path,
        };
        let data = store.read_payload(&snapshot)?;
        debug_assert_eq!(data.len() as u64, snapshot.meta.size);
        store.write_meta(&self.stem, &snapshot.meta)?;
        crate::segment::sync_dir(&self.dir)?;
        Ok(snapshot)
    }

    /// Drop the partial transfer.
    pub fn abort(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path);
    }
}

fn snapshot_stem(term: Term, index: LogIndex) -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("snapshot-{term}-{index}-{suffix:08x}")
}

fn parse_snapshot_stem(stem: &str) -> Option<(Term, LogIndex)> {
    let rest = stem.strip_prefix("snapshot-")?;
    let mut parts = rest.split('-');
    let term: Term = parts.next()?.parse().ok()?;
    let index: LogIndex = parts.next()?.parse().ok()?;
    let suffix = parts.next()?;
    if parts.next().is_some() || suffix.is_empty() {
        return None;
    }
    // The suffix must look hexadecimal, or the name is not ours.
    suffix
        .chars()
        .all(|c| c.is_ascii_hexdigit())
        .then_some((term, index))
}
