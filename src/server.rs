//! HTTP tool server.
//!
//! Exposes the four memory tools as a JSON API for the agent runtime.
//! Every tool endpoint answers `200` with the result envelope — errors are
//! absorbed into `{disabled, error}` fields by the tool surface — so a
//! caller never has to branch on HTTP status for tool failures.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tools/memory_search` | Hybrid search with scoping |
//! | `POST` | `/tools/memory_recall` | Time-bounded recall |
//! | `POST` | `/tools/memory_get` | Read a workspace markdown file |
//! | `POST` | `/tools/actor_lookup` | Actor directory lookup |
//! | `POST` | `/tools/sync` | Trigger a sync (deduplicated) |
//! | `GET`  | `/tools/status` | Index stats |
//! | `GET`  | `/health` | Health check (returns version) |

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::manager::MemoryManager;
use crate::stats;
use crate::tools::{
    AbortFlag, ActorsEnvelope, GetEnvelope, GetRequest, LookupRequest, MemoryTools, RecallRequest,
    SearchEnvelope, SearchRequest,
};

#[derive(Clone)]
struct AppState {
    manager: Arc<MemoryManager>,
    tools: MemoryTools,
}

/// Start the tool server on the configured bind address.
pub async fn run_server(manager: Arc<MemoryManager>) -> anyhow::Result<()> {
    let bind_addr = manager.config().server.bind.clone();
    let state = AppState {
        tools: MemoryTools::new(manager.clone()),
        manager,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tools/memory_search", post(handle_search))
        .route("/tools/memory_recall", post(handle_recall))
        .route("/tools/memory_get", post(handle_get))
        .route("/tools/actor_lookup", post(handle_lookup))
        .route("/tools/sync", post(handle_sync))
        .route("/tools/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(bind = %bind_addr, "memory tool server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Json<SearchEnvelope> {
    Json(state.tools.memory_search(req, &AbortFlag::new()).await)
}

async fn handle_recall(
    State(state): State<AppState>,
    Json(req): Json<RecallRequest>,
) -> Json<SearchEnvelope> {
    Json(state.tools.memory_recall(req, &AbortFlag::new()).await)
}

async fn handle_get(
    State(state): State<AppState>,
    Json(req): Json<GetRequest>,
) -> Json<GetEnvelope> {
    Json(state.tools.memory_get(req, &AbortFlag::new()).await)
}

async fn handle_lookup(
    State(state): State<AppState>,
    Json(req): Json<LookupRequest>,
) -> Json<ActorsEnvelope> {
    Json(state.tools.actor_lookup(req, &AbortFlag::new()).await)
}

#[derive(Serialize)]
struct SyncResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    files_indexed: u64,
    files_removed: u64,
    chunks_written: u64,
}

async fn handle_sync(State(state): State<AppState>) -> Json<SyncResponse> {
    match state.manager.coordinator().sync("http").await {
        Ok(report) => Json(SyncResponse {
            ok: !report.dirty,
            error: None,
            files_indexed: report.files_indexed,
            files_removed: report.files_removed,
            chunks_written: report.chunks_written,
        }),
        Err(e) => Json(SyncResponse {
            ok: false,
            error: Some(e.to_string()),
            files_indexed: 0,
            files_removed: 0,
            chunks_written: 0,
        }),
    }
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    stats: Option<stats::IndexStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    dirty: bool,
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    match stats::collect_stats(state.manager.pool()).await {
        Ok(collected) => Json(StatusResponse {
            stats: Some(collected),
            error: None,
            dirty: state.manager.coordinator().is_dirty(),
        }),
        Err(e) => Json(StatusResponse {
            stats: None,
            error: Some(e.to_string()),
            dirty: true,
        }),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
