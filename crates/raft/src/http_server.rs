//! HTTP server for Raft RPC endpoints.
//!
//! Each node runs one of these so peers can reach it:
//! - `POST /raft/append_entries` — log replication and heartbeats
//! - `POST /raft/vote` — pre-vote probes and elections
//! - `POST /raft/install_snapshot` — chunked state transfer
//! - `POST /raft/timeout_now` — leadership transfer
//! - `GET /health` — node metrics summary

use crate::message::{AppendEntries, InstallSnapshot, RequestVote, TimeoutNow};
use crate::node::Raft;
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::{get, post}};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct RaftHttpState {
    pub raft: Raft,
}

impl RaftHttpState {
    pub fn new(raft: Raft) -> Self {
        Self { raft }
    }
}

/// Build the router with every RPC endpoint.
pub fn create_router(state: RaftHttpState) -> Router {
    Router::new()
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/vote", post(handle_vote))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .route("/raft/timeout_now", post(handle_timeout_now))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Bind and serve until the returned handle is shut down.
pub async fn start_server(
    addr: SocketAddr,
    state: RaftHttpState,
) -> Result<ServerHandle, std::io::Error> {
    let router = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        server_handle,
    })
}

/// Handle for a running RPC server.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    server_handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal a graceful shutdown.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the server task to finish.
    pub async fn wait(self) -> Result<(), std::io::Error> {
        match self.server_handle.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(format!("server task panicked: {e}"))),
        }
    }
}

async fn handle_append_entries(
    State(state): State<RaftHttpState>,
    Json(req): Json<AppendEntries>,
) -> impl IntoResponse {
    match state.raft.append_entries(req).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn handle_vote(
    State(state): State<RaftHttpState>,
    Json(req): Json<RequestVote>,
) -> impl IntoResponse {
    match state.raft.request_vote(req).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn handle_install_snapshot(
    State(state): State<RaftHttpState>,
    Json(req): Json<InstallSnapshot>,
) -> impl IntoResponse {
    match state.raft.install_snapshot(req).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn handle_timeout_now(
    State(state): State<RaftHttpState>,
    Json(req): Json<TimeoutNow>,
) -> impl IntoResponse {
    match state.raft.timeout_now(req).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn handle_health(State(state): State<RaftHttpState>) -> impl IntoResponse {
    let metrics = state.raft.metrics().borrow().clone();
    Json(serde_json::json!({
        "id": metrics.id,
        "term": metrics.term,
        "role": metrics.role.to_string(),
        "leader": metrics.leader,
        "last_log_index": metrics.last_log_index,
        "commit_index": metrics.commit_index,
        "last_applied": metrics.last_applied,
        "snapshot_index": metrics.snapshot_index,
        "servers": metrics.membership.len(),
    }))
}
