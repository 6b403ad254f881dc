//! Test support for the Raft workspace: an in-process cluster harness
//! with an in-memory message router, so integration tests exercise the
//! full node stack (consensus, storage, snapshots) without sockets.
//!
//! # Example
//!
//! ```no_run
//! use testsupport::prelude::*;
//!
//! #[tokio::test]
//! async fn three_nodes_elect() {
//!     let cluster = TestCluster::bootstrap(3).await.unwrap();
//!     let leader = cluster.wait_for_leader().await.unwrap();
//!     assert!(leader >= 1);
//! }
//! ```

pub mod cluster;
pub mod fsm;
pub mod router;

/// Convenient re-exports for cluster tests.
pub mod prelude {
    pub use crate::cluster::TestCluster;
    pub use crate::fsm::{FsmProbe, TestFsm};
    pub use crate::router::Router;
}

/// Install a compact tracing subscriber for a test run. Safe to call
/// repeatedly; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
