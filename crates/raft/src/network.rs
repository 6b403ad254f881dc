//! The transport seam.
//!
//! The core hands typed messages out and takes typed messages in; how
//! they travel is the transport's concern. [`RaftNetwork`] is the
//! outbound half; the inbound half is whatever server the embedder runs
//! calling the [`crate::Raft`] handle's RPC methods (see
//! [`crate::http_server`] for the shipped axum server).
//!
//! Within one peer the core issues requests sequentially and in order,
//! which is what the replication pipeline's ordered-acknowledgement
//! assumption rests on.

use crate::message::{
    AppendEntries, AppendEntriesResult, InstallSnapshot, InstallSnapshotResult, RequestVote,
    RequestVoteResult, TimeoutNow,
};
use async_trait::async_trait;
use common::{NodeId, RaftError, RaftResult};

/// Outbound RPC transport. `address` comes from the configuration in
/// force, so a moved peer is picked up as soon as the config changes.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    async fn append_entries(
        &self,
        target: NodeId,
        address: &str,
        req: AppendEntries,
    ) -> RaftResult<AppendEntriesResult>;

    async fn request_vote(
        &self,
        target: NodeId,
        address: &str,
        req: RequestVote,
    ) -> RaftResult<RequestVoteResult>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        address: &str,
        req: InstallSnapshot,
    ) -> RaftResult<InstallSnapshotResult>;

    async fn timeout_now(&self, target: NodeId, address: &str, req: TimeoutNow) -> RaftResult<()>;
}

/// HTTP transport: JSON bodies posted to the peer's axum endpoints.
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("default client configuration is valid");
        Self { client }
    }

    async fn post<Req: serde::Serialize, Res: serde::de::DeserializeOwned>(
        &self,
        address: &str,
        path: &str,
        req: &Req,
    ) -> RaftResult<Res> {
        let url = format!("http://{address}{path}");
        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| RaftError::Io(std::io::Error::other(e.to_string())))?;
        if !response.status().is_success() {
            return Err(RaftError::Io(std::io::Error::other(format!(
                "{url}: http status {}",
                response.status()
            ))));
        }
        response
            .json()
            .await
            .map_err(|e| RaftError::Corrupt(format!("{url}: {e}")))
    }
}

impl Default for HttpNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RaftNetwork for HttpNetwork {
    async fn append_entries(
        &self,
        _target: NodeId,
        address: &str,
        req: AppendEntries,
    ) -> RaftResult<AppendEntriesResult> {
        self.post(address, "/raft/append_entries", &req).await
    }

    async fn request_vote(
        &self,
        _target: NodeId,
        address: &str,
        req: RequestVote,
    ) -> RaftResult<RequestVoteResult> {
        self.post(address, "/raft/vote", &req).await
    }

    async fn install_snapshot(
        &self,
        _target: NodeId,
        address: &str,
        req: InstallSnapshot,
    ) -> RaftResult<InstallSnapshotResult> {
        self.post(address, "/raft/install_snapshot", &req).await
    }

    async fn timeout_now(&self, _target: NodeId, address: &str, req: TimeoutNow) -> RaftResult<()> {
        self.post(address, "/raft/timeout_now", &req).await
    }
}
