//! Branch reconciliation server.
//!
//! Serves the sync wire protocol: `POST /sync/batch` applies a terminal's
//! offline transactions against the branch's authoritative store, and
//! `GET /health` is the lightweight probe the terminals' connectivity
//! monitors poll. It never touches a branch database.

pub mod ledger;
pub mod reconcile;
pub mod store;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::protocol::{SyncBatchRequest, SyncBatchResponse};
use store::BranchRegistry;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub port: u16,
    /// Shared POS API key. `None` disables the check (local development).
    pub api_key: Option<String>,
}

impl ServerConfig {
    /// Read `DATA_DIR`, `PORT`, and `POS_API_KEY` from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = match std::env::var("DATA_DIR") {
            Ok(path) => PathBuf::from(path),
            Err(_) => std::env::current_dir()?.join("branch_sync_data"),
        };
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(8080);
        let api_key = std::env::var("POS_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        Ok(Self {
            data_dir,
            port,
            api_key,
        })
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API key is invalid or expired")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<BranchRegistry>,
    pub api_key: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync/batch", post(sync_batch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Must respond fast and without touching any branch database write path.
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get("X-POS-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided == expected {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Apply one terminal batch. The response array matches the request order;
/// partial success is normal and reported per item.
async fn sync_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SyncBatchRequest>,
) -> Result<Json<SyncBatchResponse>, ApiError> {
    authorize(&state, &headers)?;

    if request.branch_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing branchId".to_string()));
    }
    if request.transactions.is_empty() {
        return Ok(Json(SyncBatchResponse { results: Vec::new() }));
    }

    let branch = state
        .registry
        .open(&request.branch_id)
        .map_err(ApiError::BadRequest)?;

    info!(
        branch_id = %request.branch_id,
        terminal_id = %request.terminal_id,
        transactions = request.transactions.len(),
        "Applying sync batch"
    );

    // SQLite work is blocking; keep it off the async workers.
    let results = tokio::task::spawn_blocking(move || {
        reconcile::apply_batch(&branch, &request.transactions)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("reconciliation task failed: {e}")))?;

    Ok(Json(SyncBatchResponse { results }))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the server until ctrl-c.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let registry = Arc::new(BranchRegistry::new(config.data_dir.join("branches")));
    let state = AppState {
        registry,
        api_key: config.api_key.clone(),
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Reconciliation server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
