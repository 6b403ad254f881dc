//! Runtime configuration for a Raft node.

use crate::{RaftError, RaftResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable parameters for timers, batching, and storage sizing.
///
/// # Example
/// ```
/// use common::Config;
/// use std::time::Duration;
///
/// let config = Config::builder()
///     .election_timeout(Duration::from_millis(500))
///     .heartbeat_interval(Duration::from_millis(50))
///     .snapshot_threshold(2048)
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Base election timeout. The effective timeout is drawn uniformly
    /// from `[election_timeout, 2 * election_timeout)` per election cycle.
    #[builder(default = Duration::from_millis(1000))]
    pub election_timeout: Duration,

    /// Interval between leader heartbeats.
    #[builder(default = Duration::from_millis(100))]
    pub heartbeat_interval: Duration,

    /// Coarse timer granularity of the core loop.
    #[builder(default = Duration::from_millis(20))]
    pub tick_interval: Duration,

    /// Entries applied since the last snapshot before a new one is taken.
    #[builder(default = 1024)]
    pub snapshot_threshold: u64,

    /// Entries kept in the log behind the snapshot index after compaction,
    /// so slightly-lagging followers can be served without a snapshot.
    #[builder(default = 8192)]
    pub install_snapshot_trailing: u64,

    /// Byte size of one InstallSnapshot chunk.
    #[builder(default = 1024 * 1024)]
    pub snapshot_chunk_size: usize,

    /// Abort an in-progress inbound install when no chunk arrives within
    /// this window.
    #[builder(default = Duration::from_secs(10))]
    pub snapshot_chunk_timeout: Duration,

    /// Abort an outbound snapshot transfer to a peer after this long.
    #[builder(default = Duration::from_secs(60))]
    pub install_snapshot_timeout: Duration,

    /// Preallocated byte size of each log segment file.
    #[builder(default = 8 * 1024 * 1024)]
    pub segment_size: u64,

    /// Maximum entries carried by one AppendEntries message.
    #[builder(default = 64)]
    pub max_append_entries: u64,

    /// Maximum unacknowledged AppendEntries in flight per peer.
    #[builder(default = 4)]
    pub max_inflight_appends: usize,

    /// Catch-up rounds granted to a non-voter before a promotion attempt
    /// is abandoned.
    #[builder(default = 10)]
    pub max_catch_up_rounds: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

impl Config {
    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `RaftError::Exhausted` naming the offending parameter.
    pub fn validate(&self) -> RaftResult<()> {
        if self.heartbeat_interval >= self.election_timeout {
            return Err(RaftError::Exhausted(
                "heartbeat_interval must be shorter than election_timeout".into(),
            ));
        }
        if self.tick_interval > self.heartbeat_interval {
            return Err(RaftError::Exhausted(
                "tick_interval must not exceed heartbeat_interval".into(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::Exhausted(
                "max_append_entries must be at least 1".into(),
            ));
        }
        if self.max_inflight_appends == 0 {
            return Err(RaftError::Exhausted(
                "max_inflight_appends must be at least 1".into(),
            ));
        }
        if self.segment_size < 64 * 1024 {
            return Err(RaftError::Exhausted(
                "segment_size must be at least 64 KiB".into(),
            ));
        }
        if self.snapshot_chunk_size == 0 {
            return Err(RaftError::Exhausted(
                "snapshot_chunk_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
