//! Checksummed record framing shared by metadata pages and snapshot
//! metadata files.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ magic: u32                   │
//! │ checksum: u32 (CRC32 of body)│
//! │ length: u32                  │
//! ├──────────────────────────────┤
//! │ body (bincode)               │
//! └──────────────────────────────┘
//! ```

use common::{RaftError, RaftResult};

/// Byte size of the record prelude.
pub const RECORD_HEADER_SIZE: usize = 12;

/// Serialize `body` behind a checksummed header.
pub fn encode_record(magic: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());
    buf.extend_from_slice(&magic.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Validate the header and return the body slice.
///
/// # Errors
///
/// Returns `RaftError::Corrupt` naming `what` when the magic, length, or
/// checksum does not hold.
pub fn decode_record<'a>(magic: u32, buf: &'a [u8], what: &str) -> RaftResult<&'a [u8]> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(RaftError::Corrupt(format!("{what}: short record")));
    }
    let found_magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if found_magic != magic {
        return Err(RaftError::Corrupt(format!(
            "{what}: bad magic {found_magic:#010x}"
        )));
    }
    let checksum = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let length = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
    let Some(body) = buf[RECORD_HEADER_SIZE..].get(..length) else {
        return Err(RaftError::Corrupt(format!(
            "{what}: length {length} exceeds record"
        )));
    };
    if crc32fast::hash(body) != checksum {
        return Err(RaftError::Corrupt(format!("{what}: checksum mismatch")));
    }
    Ok(body)
}

/// The bincode configuration used for every on-disk structure.
///
/// Little-endian, fixed-width integers, so the layout is stable across
/// platforms and releases.
pub fn bincode_config() -> impl bincode::config::Config {
    bincode::config::legacy()
}
