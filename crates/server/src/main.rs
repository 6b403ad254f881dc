//! Sample Raft node: one process serving the Raft RPC endpoints plus a
//! tiny client API for writes and membership changes.
//!
//! Start a fresh cluster:
//!
//! ```text
//! raft-server --id 1 --data-dir ./n1 --listen 127.0.0.1:7001 --bootstrap
//! ```
//!
//! Add a second node (empty data directory, then ask the leader):
//!
//! ```text
//! raft-server --id 2 --data-dir ./n2 --listen 127.0.0.1:7002
//! curl -X POST 127.0.0.1:7001/cluster/add \
//!      -H 'content-type: application/json' \
//!      -d '{"id": 2, "address": "127.0.0.1:7002"}'
//! curl -X POST 127.0.0.1:7001/cluster/promote -d '{"id": 2}' \
//!      -H 'content-type: application/json'
//! ```

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Json;
use clap::Parser;
use common::{Config, NodeId, RaftError};
use raft::{HttpNetwork, NoopStateMachine, Raft, RaftHttpState};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "raft-server", about = "Replicated log node")]
struct Args {
    /// Unique server id (nonzero).
    #[arg(long)]
    id: NodeId,

    /// Directory for log segments, metadata, and snapshots.
    #[arg(long)]
    data_dir: PathBuf,

    /// Address to listen on, also advertised to peers.
    #[arg(long)]
    listen: SocketAddr,

    /// Initialise a brand-new single-node cluster before starting.
    #[arg(long)]
    bootstrap: bool,

    /// Election timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    election_timeout_ms: u64,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    heartbeat_ms: u64,

    /// Entries applied between automatic snapshots.
    #[arg(long, default_value_t = 1024)]
    snapshot_threshold: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::builder()
        .election_timeout(Duration::from_millis(args.election_timeout_ms))
        .heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
        .snapshot_threshold(args.snapshot_threshold)
        .build();

    if args.bootstrap {
        Raft::bootstrap(args.id, args.listen.to_string(), &args.data_dir, &config)
            .await
            .context("bootstrap failed")?;
    }

    let raft = Raft::start(
        args.id,
        &args.data_dir,
        config,
        Arc::new(HttpNetwork::new()),
        Box::new(NoopStateMachine),
    )
    .context("node start failed")?;

    let rpc = raft::create_router(RaftHttpState::new(raft.clone()));
    let client = axum::Router::new()
        .route("/client/write", post(handle_write))
        .route("/cluster/add", post(handle_add))
        .route("/cluster/promote", post(handle_promote))
        .route("/cluster/remove", post(handle_remove))
        .route("/cluster/transfer", post(handle_transfer))
        .with_state(AppState { raft: raft.clone() });
    let router = rpc.merge(client);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    tracing::info!(id = args.id, listen = %args.listen, "serving");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("ctrl-c received, shutting down");
        })
        .await?;

    raft.shutdown().await.ok();
    Ok(())
}

#[derive(Clone)]
struct AppState {
    raft: Raft,
}

fn error_response(err: RaftError) -> (StatusCode, String) {
    let status = match &err {
        RaftError::NotLeader { .. } | RaftError::NoLeader => StatusCode::MISDIRECTED_REQUEST,
        RaftError::Busy => StatusCode::CONFLICT,
        RaftError::Shutdown | RaftError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

async fn handle_write(State(state): State<AppState>, body: axum::body::Bytes) -> impl IntoResponse {
    match state.raft.submit(body.to_vec()).await {
        Ok(index) => (StatusCode::OK, Json(serde_json::json!({ "index": index }))).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
struct AddRequest {
    id: NodeId,
    address: String,
}

async fn handle_add(
    State(state): State<AppState>,
    Json(req): Json<AddRequest>,
) -> impl IntoResponse {
    match state.raft.add_server(req.id, req.address).await {
        Ok(index) => (StatusCode::OK, Json(serde_json::json!({ "index": index }))).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
struct IdRequest {
    id: NodeId,
}

async fn handle_promote(
    State(state): State<AppState>,
    Json(req): Json<IdRequest>,
) -> impl IntoResponse {
    match state.raft.promote_server(req.id).await {
        Ok(index) => (StatusCode::OK, Json(serde_json::json!({ "index": index }))).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn handle_remove(
    State(state): State<AppState>,
    Json(req): Json<IdRequest>,
) -> impl IntoResponse {
    match state.raft.remove_server(req.id).await {
        Ok(index) => (StatusCode::OK, Json(serde_json::json!({ "index": index }))).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn handle_transfer(
    State(state): State<AppState>,
    Json(req): Json<IdRequest>,
) -> impl IntoResponse {
    match state.raft.transfer_leadership(req.id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}
