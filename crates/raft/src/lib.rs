//! An embeddable implementation of the Raft consensus protocol:
//! leader election with pre-vote, pipelined log replication, durable
//! segment storage with an asynchronous disk writer, snapshots with
//! chunked install, and single-server membership change.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Raft node                             │
//! │  ┌──────────┐   channel   ┌───────────────────────────────────┐  │
//! │  │  Raft    │────────────▶│            core task              │  │
//! │  │ (handle) │             │  ┌─────────────────────────────┐  │  │
//! │  └──────────┘             │  │  ConsensusModule (sans-I/O) │  │  │
//! │  ┌──────────┐             │  └──────────────┬──────────────┘  │  │
//! │  │ axum RPC │────────────▶│        effects  │                 │  │
//! │  │ server   │             │  ┌──────────────▼──────────────┐  │  │
//! │  └──────────┘             │  │ metadata │ log writer │ FSM │  │  │
//! │                           │  └─────────────────────────────┘  │  │
//! │                           └──────────┬────────────┬───────────┘  │
//! └──────────────────────────────────────┼────────────┼──────────────┘
//!                              RaftNetwork│            │disk (AIO/
//!                              (HTTP out) │            │ worker pool)
//! ```
//!
//! The consensus state machine is synchronous and I/O-free; the core
//! task owns it together with the storage handles and turns its
//! [`consensus::Effects`] into disk submissions, network sends, and
//! user state machine applies. Everything protocol-visible is gated on
//! the persistence events the protocol requires.
//!
//! # Example
//!
//! ```rust,ignore
//! use raft::{HttpNetwork, NoopStateMachine, Raft};
//! use common::Config;
//! use std::sync::Arc;
//!
//! // First node of a new cluster:
//! Raft::bootstrap(1, "10.0.0.1:7001", data_dir, &Config::default()).await?;
//! let node = Raft::start(
//!     1,
//!     data_dir,
//!     Config::default(),
//!     Arc::new(HttpNetwork::new()),
//!     Box::new(NoopStateMachine),
//! )?;
//!
//! let index = node.submit(b"x=1".to_vec()).await?;
//! node.add_server(2, "10.0.0.2:7001").await?;
//! node.promote_server(2).await?;
//! ```

#[cfg(test)]
mod tests;

pub mod codec;
pub mod consensus;
mod core;
pub mod election;
pub mod http_server;
pub mod log;
pub mod membership;
pub mod message;
pub mod metrics;
pub mod network;
pub mod node;
pub mod observer;
pub mod progress;
pub mod state_machine;

pub use common::{
    Config, Entry, EntryPayload, LogIndex, Membership, NodeId, RaftError, RaftResult, Server,
    ServerRole, Term,
};
pub use http_server::{RaftHttpState, ServerHandle, create_router, start_server};
pub use message::{
    AppendEntries, AppendEntriesResult, ConflictHint, InstallSnapshot, InstallSnapshotResult,
    Message, RequestVote, RequestVoteResult, TimeoutNow,
};
pub use metrics::{Metrics, RoleKind};
pub use network::{HttpNetwork, RaftNetwork};
pub use node::Raft;
pub use observer::{RaftEvent, MAX_OBSERVERS};
pub use state_machine::{NoopStateMachine, StateMachine};
