//! Health & status API
//!
//! - GET /health          - JSON health summary
//! - GET /healthz         - liveness
//! - GET /readyz          - readiness (both chains have a persisted cursor)
//! - GET /metrics         - Prometheus metrics
//! - GET /status          - transfer counts per state, cursors, uptime
//! - GET /transfers       - transfers by state (`?state=confirmed&limit=50`)
//! - GET /transfers/{id}  - one transfer with its transition history
//! - GET /review          - transfers flagged for operator review

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::{eyre, Result};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::LedgerError;
use crate::ledger::SharedLedger;
use crate::metrics;
use crate::types::{ChainSide, Transfer, TransferId, TransferState, TransitionRecord};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub ledger: SharedLedger,
    pub started: Instant,
}

impl AppState {
    pub fn new(ledger: SharedLedger) -> Self {
        Self {
            ledger,
            started: Instant::now(),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub cursors: BTreeMap<ChainSide, Option<u64>>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub transfers: BTreeMap<TransferState, i64>,
    pub cursors: BTreeMap<ChainSide, Option<u64>>,
    pub needs_review: usize,
}

#[derive(Serialize)]
pub struct TransferDetail {
    pub transfer: Transfer,
    pub history: Vec<TransitionRecord>,
}

#[derive(Debug, Deserialize)]
pub struct TransferQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

/// Handler error rendered as `{"error": ...}`
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        warn!(error = %err, "Status API ledger error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

async fn cursors(ledger: &SharedLedger) -> Result<BTreeMap<ChainSide, Option<u64>>, LedgerError> {
    let mut cursors = BTreeMap::new();
    for side in ChainSide::ALL {
        cursors.insert(side, ledger.last_processed_block(side).await?);
    }
    Ok(cursors)
}

async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        cursors: cursors(&state.ledger).await?,
    }))
}

/// Liveness probe (always OK while the server runs)
async fn liveness() -> &'static str {
    "OK"
}

/// Ready once both chains have a persisted cursor
async fn readiness(State(state): State<AppState>) -> Response {
    match cursors(&state.ledger).await {
        Ok(c) if c.values().all(Option::is_some) => "OK".into_response(),
        Ok(_) => (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY").into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    if let Ok(counts) = state.ledger.count_by_state().await {
        metrics::set_state_counts(&counts);
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let mut transfers: BTreeMap<TransferState, i64> =
        TransferState::ALL.iter().map(|s| (*s, 0)).collect();
    transfers.extend(state.ledger.count_by_state().await?);

    Ok(Json(StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        transfers,
        cursors: cursors(&state.ledger).await?,
        needs_review: state.ledger.list_needing_review().await?.len(),
    }))
}

/// Without `state`, lists every non-terminal transfer
async fn list_transfers(
    State(state): State<AppState>,
    Query(query): Query<TransferQuery>,
) -> Result<Json<Vec<Transfer>>, ApiError> {
    let states: Vec<TransferState> = match query.state.as_deref() {
        Some(raw) => vec![raw
            .parse::<TransferState>()
            .map_err(|_| ApiError::bad_request(format!("unknown state '{}'", raw)))?],
        None => TransferState::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect(),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let mut transfers = Vec::new();
    for s in states {
        transfers.extend(state.ledger.list_by_state(s).await?);
    }
    transfers.truncate(limit);
    Ok(Json(transfers))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TransferDetail>, ApiError> {
    let id: TransferId = id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid transfer id '{}'", id)))?;
    let transfer = state
        .ledger
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("transfer {} not found", id)))?;
    let history = state.ledger.history(&id).await?;
    Ok(Json(TransferDetail { transfer, history }))
}

async fn review(State(state): State<AppState>) -> Result<Json<Vec<Transfer>>, ApiError> {
    Ok(Json(state.ledger.list_needing_review().await?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/transfers", get(list_transfers))
        .route("/transfers/{id}", get(get_transfer))
        .route("/review", get(review))
        .with_state(state)
}

/// Serve on an already bound listener until `cancel` fires
pub async fn serve(listener: TcpListener, state: AppState, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Status API listening");

    metrics::UP.set(1.0);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    metrics::UP.set(0.0);

    info!("Status API stopped");
    Ok(())
}

pub async fn start_server(
    bind_address: &str,
    port: u16,
    state: AppState,
    cancel: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, cancel).await
}
