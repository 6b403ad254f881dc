//! Log segment files: naming, batch framing, preallocation, and reload.
//!
//! ## File naming
//!
//! The segment being written is `open-N` with a monotonic sequence number
//! N. When full it is renamed to `FIRST-LAST`, the inclusive range of log
//! indexes it covers.
//!
//! ## Batch frame
//!
//! Entries are written in batches, each padded to the 4096-byte block so
//! every batch starts block-aligned (a requirement of `O_DIRECT`, kept in
//! the buffered mode too so the format is uniform):
//!
//! ```text
//! ┌───────────────────────────────────┐
//! │ Header (32 bytes)                 │
//! │ ├─ magic: u32 (0x52424154 "RBAT") │
//! │ ├─ checksum: u32 (CRC32 payload)  │
//! │ ├─ length: u32 (payload bytes)    │
//! │ ├─ count: u32                     │
//! │ ├─ first_index: u64               │
//! │ └─ reserved: u64                  │
//! ├───────────────────────────────────┤
//! │ Payload (count bincode entries)   │
//! ├───────────────────────────────────┤
//! │ Zero padding to 4096 multiple     │
//! └───────────────────────────────────┘
//! ```
//!
//! A batch whose header or checksum fails validation terminates the scan:
//! batches are durable all-or-nothing, and nothing after a torn batch was
//! ever acknowledged.

use crate::frame::bincode_config;
use common::{Entry, LogIndex, RaftError, RaftResult};
use std::alloc::{self, Layout};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::slice;

pub const BLOCK_SIZE: usize = 4096;
pub const BATCH_HEADER_SIZE: usize = 32;
const BATCH_MAGIC: u32 = 0x52424154;

/// A heap buffer aligned to [`BLOCK_SIZE`], as direct I/O requires.
pub struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
    capacity: usize,
}

// The buffer is plain owned memory; the raw pointer is not shared.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a zeroed buffer of `capacity` bytes, rounded up to a
    /// whole number of blocks.
    pub fn zeroed(capacity: usize) -> Self {
        let capacity = capacity.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        let layout = Layout::from_size_align(capacity.max(BLOCK_SIZE), BLOCK_SIZE)
            .expect("valid aligned layout");
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Self {
            ptr,
            len: 0,
            capacity: layout.size(),
        }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        assert!(self.len + bytes.len() <= self.capacity, "aligned buffer overflow");
        unsafe {
            self.ptr.add(self.len).copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        self.len += bytes.len();
    }

    /// Pad with zeros to the next block boundary (the memory is already
    /// zeroed, only the length moves).
    pub fn pad_to_block(&mut self) {
        self.len = self.len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(self.capacity, BLOCK_SIZE).expect("valid aligned layout");
        unsafe { alloc::dealloc(self.ptr, layout) };
    }
}

/// Location and index range of one batch within a segment file.
#[derive(Clone, Debug)]
pub struct BatchInfo {
    pub offset: u64,
    /// Padded on-disk length.
    pub len: u64,
    pub first_index: LogIndex,
    pub last_index: LogIndex,
}

/// Serialize `entries` into one padded, aligned batch frame.
///
/// # Errors
///
/// Returns `RaftError::Corrupt` only on an encoding failure, which would
/// indicate a broken entry value rather than an I/O problem.
pub fn encode_batch(entries: &[Entry]) -> RaftResult<AlignedBuf> {
    assert!(!entries.is_empty(), "empty batch");

    let mut payload = Vec::new();
    for entry in entries {
        let bytes = bincode::serde::encode_to_vec(entry, bincode_config())
            .map_err(|e| RaftError::Corrupt(format!("entry encode: {e}")))?;
        payload.extend_from_slice(&bytes);
    }

    let mut buf = AlignedBuf::zeroed(BATCH_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&BATCH_MAGIC.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    buf.extend_from_slice(&entries[0].index.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.pad_to_block();
    Ok(buf)
}

/// Decode one batch frame starting at `buf[offset..]`.
///
/// Returns `None` at a zeroed or torn frame (the normal end of a
/// preallocated segment), entries plus the padded frame length otherwise.
fn decode_batch(buf: &[u8], offset: usize) -> Option<(Vec<Entry>, u64)> {
    let header = buf.get(offset..offset + BATCH_HEADER_SIZE)?;
    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != BATCH_MAGIC {
        return None;
    }
    let checksum = u32::from_le_bytes(header[4..8].try_into().unwrap());
    let length = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    let count = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;

    let payload = buf.get(offset + BATCH_HEADER_SIZE..offset + BATCH_HEADER_SIZE + length)?;
    if crc32fast::hash(payload) != checksum {
        return None;
    }

    let mut entries = Vec::with_capacity(count);
    let mut cursor = 0usize;
    for _ in 0..count {
        let (entry, used): (Entry, usize) =
            bincode::serde::decode_from_slice(&payload[cursor..], bincode_config()).ok()?;
        cursor += used;
        entries.push(entry);
    }

    let padded = (BATCH_HEADER_SIZE + length).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    Some((entries, padded as u64))
}

/// A finished segment covering `[first, last]`.
#[derive(Debug)]
pub struct ClosedSegment {
    pub path: PathBuf,
    pub first: LogIndex,
    pub last: LogIndex,
    pub batches: Vec<BatchInfo>,
    /// Populated by [`scan_dir`] for boot recovery; the writer drops it
    /// once it adopts the file.
    pub entries: Vec<Entry>,
}

/// An `open-N` segment found on disk.
#[derive(Debug)]
pub struct OpenSegmentInfo {
    pub path: PathBuf,
    pub seq: u64,
    pub entries: Vec<Entry>,
    pub batches: Vec<BatchInfo>,
    /// Byte offset one past the last valid batch.
    pub next_offset: u64,
}

/// Everything segment-shaped found in a data directory.
#[derive(Debug, Default)]
pub struct SegmentFiles {
    pub closed: Vec<ClosedSegment>,
    pub open: Vec<OpenSegmentInfo>,
}

pub fn open_segment_name(seq: u64) -> String {
    format!("open-{seq}")
}

pub fn closed_segment_name(first: LogIndex, last: LogIndex) -> String {
    format!("{first}-{last}")
}

enum SegmentName {
    Open(u64),
    Closed(LogIndex, LogIndex),
}

fn parse_segment_name(name: &str) -> Option<SegmentName> {
    if let Some(seq) = name.strip_prefix("open-") {
        return seq.parse().ok().map(SegmentName::Open);
    }
    let (first, last) = name.split_once('-')?;
    let first: LogIndex = first.parse().ok()?;
    let last: LogIndex = last.parse().ok()?;
    (first <= last).then_some(SegmentName::Closed(first, last))
}

/// Read every valid batch out of a segment file.
pub fn scan_segment(path: &Path) -> RaftResult<(Vec<Entry>, Vec<BatchInfo>, u64)> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut entries = Vec::new();
    let mut batches = Vec::new();
    let mut offset = 0usize;
    while let Some((batch_entries, padded)) = decode_batch(&buf, offset) {
        if batch_entries.is_empty() {
            break;
        }
        batches.push(BatchInfo {
            offset: offset as u64,
            len: padded,
            first_index: batch_entries[0].index,
            last_index: batch_entries[batch_entries.len() - 1].index,
        });
        entries.extend(batch_entries);
        offset += padded as usize;
    }
    Ok((entries, batches, offset as u64))
}

/// Enumerate and reload the segment files in `dir`.
///
/// Closed segments come back ordered by first index, open segments by
/// sequence number. Contiguity across the whole sequence is the caller's
/// check: only it knows the snapshot boundary.
pub fn scan_dir(dir: &Path) -> RaftResult<SegmentFiles> {
    let mut files = SegmentFiles::default();

    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else { continue };
        let path = dirent.path();

        match parse_segment_name(name) {
            Some(SegmentName::Closed(first, last)) => {
                let (entries, batches, _) = scan_segment(&path)?;
                let got_first = entries.first().map(|e| e.index);
                let got_last = entries.last().map(|e| e.index);
                if got_first != Some(first) || got_last != Some(last) {
                    return Err(RaftError::Corrupt(format!(
                        "segment {name}: content range {got_first:?}..{got_last:?} \
                         does not match its name"
                    )));
                }
                files.closed.push(ClosedSegment {
                    path,
                    first,
                    last,
                    batches,
                    entries,
                });
            }
            Some(SegmentName::Open(seq)) => {
                let (entries, batches, next_offset) = scan_segment(&path)?;
                files.open.push(OpenSegmentInfo {
                    path,
                    seq,
                    entries,
                    batches,
                    next_offset,
                });
            }
            None => {}
        }
    }

    files.closed.sort_by_key(|s| s.first);
    files.open.sort_by_key(|s| s.seq);
    Ok(files)
}

/// Preallocate `len` bytes, extending the file size.
///
/// Uses `fallocate(2)` where available so the extent is really reserved;
/// elsewhere the plain `set_len` extension is the closest equivalent.
#[cfg(target_os = "linux")]
pub fn preallocate(file: &File, len: u64) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    let rc = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, len as libc::off_t) };
    if rc == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        // Filesystems without fallocate support (EOPNOTSUPP) still get
        // the size extension.
        if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
            file.set_len(len)
        } else {
            Err(err)
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn preallocate(file: &File, len: u64) -> std::io::Result<()> {
    file.set_len(len)
}

/// Fsync a directory so renames and file creations within it are durable.
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}
