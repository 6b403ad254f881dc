//! Stable message framing.
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ length: u32 (version + type + body)│
//! │ version: u8 (currently 1)          │
//! │ type: u8                           │
//! ├────────────────────────────────────┤
//! │ body (bincode of the message)      │
//! └────────────────────────────────────┘
//! ```
//!
//! The framing is the only part of the wire format the core promises;
//! what carries the frames (HTTP bodies, raw TCP, anything else) is the
//! transport's business.

use crate::message::Message;
use common::{RaftError, RaftResult};

pub const CODEC_VERSION: u8 = 1;
pub const FRAME_HEADER_SIZE: usize = 6;

/// Upper bound on one frame; a length beyond this is treated as corrupt
/// rather than allocated.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

fn type_byte(message: &Message) -> u8 {
    match message {
        Message::RequestVote(_) => 1,
        Message::RequestVoteResult(_) => 2,
        Message::AppendEntries(_) => 3,
        Message::AppendEntriesResult(_) => 4,
        Message::InstallSnapshot(_) => 5,
        Message::InstallSnapshotResult(_) => 6,
        Message::TimeoutNow(_) => 7,
    }
}

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::legacy()
}

/// Frame one message.
pub fn encode(message: &Message) -> RaftResult<Vec<u8>> {
    let body = bincode::serde::encode_to_vec(message, bincode_config())
        .map_err(|e| RaftError::Corrupt(format!("message encode: {e}")))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&((body.len() + 2) as u32).to_le_bytes());
    frame.push(CODEC_VERSION);
    frame.push(type_byte(message));
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame, returning the message and the bytes consumed.
///
/// # Errors
///
/// `RaftError::Corrupt` on a short buffer, unknown version, over-long
/// frame, or a type byte that disagrees with the decoded variant.
pub fn decode(buf: &[u8]) -> RaftResult<(Message, usize)> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(RaftError::Corrupt("frame: short header".into()));
    }
    let length = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    if length < 2 {
        return Err(RaftError::Corrupt("frame: impossible length".into()));
    }
    if length > MAX_FRAME_SIZE {
        return Err(RaftError::Corrupt(format!("frame: {length} bytes exceeds limit")));
    }
    let version = buf[4];
    if version != CODEC_VERSION {
        return Err(RaftError::Corrupt(format!("frame: unknown version {version}")));
    }
    let declared_type = buf[5];
    let Some(body) = buf[FRAME_HEADER_SIZE..].get(..length - 2) else {
        return Err(RaftError::Corrupt("frame: truncated body".into()));
    };

    let (message, used): (Message, usize) =
        bincode::serde::decode_from_slice(body, bincode_config())
            .map_err(|e| RaftError::Corrupt(format!("frame: {e}")))?;
    if used != body.len() {
        return Err(RaftError::Corrupt("frame: trailing bytes in body".into()));
    }
    if type_byte(&message) != declared_type {
        return Err(RaftError::Corrupt(format!(
            "frame: type byte {declared_type} does not match payload"
        )));
    }
    Ok((message, 4 + length))
}
