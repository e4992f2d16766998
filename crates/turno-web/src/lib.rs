//! Axum JSON trigger surface for single-order syncs and backfills.
//!
//! Handlers hand back the reconciler's structured reports as-is: a sync
//! that fails per-item still answers 200 with `ok: false` inside, so
//! callers never have to catch anything.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;
use turno_core::SyncMode;
use turno_storage::LedgerStore;
use turno_sync::{BackfillOrchestrator, BackfillRequest, SyncReconciler};
use uuid::Uuid;

pub const CRATE_NAME: &str = "turno-web";

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<SyncReconciler>,
    pub backfill: Arc<BackfillOrchestrator>,
    pub ledger: Arc<dyn LedgerStore>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sync/orders/{id}", post(sync_order_handler))
        .route("/sync/backfill", post(backfill_handler))
        .route("/sync/log", get(sync_log_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "turno web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn sync_order_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(order_id): AxumPath<Uuid>,
) -> Response {
    let report = state
        .reconciler
        .sync_order(order_id, SyncMode::Realtime)
        .await;
    Json(report).into_response()
}

async fn backfill_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BackfillRequest>,
) -> Response {
    Json(state.backfill.run(request).await).into_response()
}

#[derive(Debug, Deserialize, Default)]
struct SyncLogQuery {
    limit: Option<u32>,
}

async fn sync_log_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncLogQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(50).min(500);
    match state.ledger.list_recent(limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err)),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
