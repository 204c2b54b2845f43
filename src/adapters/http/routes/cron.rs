use axum::{
    Json, Router,
    extract::{Query, State},
    response::IntoResponse,
    routing::post,
};
use serde::{Deserialize, Serialize};

use crate::{adapters::http::app_state::AppState, app_error::AppResult};

/// Entry points for an external scheduler. Each pass is safe to overlap with
/// another instance running the same pass.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/drain", post(drain_webhooks))
        .route("/release-stale", post(release_stale))
        .route("/cycles", post(sweep_cycles))
        .route("/purge", post(purge_webhooks))
}

#[derive(Deserialize)]
struct BatchQuery {
    limit: Option<i64>,
}

async fn drain_webhooks(
    State(app_state): State<AppState>,
    Query(query): Query<BatchQuery>,
) -> AppResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(app_state.config.drain_batch_size).max(1);
    let report = app_state.webhook_queue.drain(limit).await?;
    Ok(Json(report))
}

async fn release_stale(State(app_state): State<AppState>) -> AppResult<impl IntoResponse> {
    let released = app_state.webhook_queue.release_stale().await?;
    Ok(Json(released))
}

async fn sweep_cycles(
    State(app_state): State<AppState>,
    Query(query): Query<BatchQuery>,
) -> AppResult<impl IntoResponse> {
    let limit = query
        .limit
        .unwrap_or(app_state.config.cycle_sweep_batch_size)
        .max(1);
    let report = app_state.subscription_use_cases.sweep_cycles(limit).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct PurgeQuery {
    older_than_days: Option<i64>,
}

#[derive(Serialize)]
struct PurgeResponse {
    purged: u64,
}

async fn purge_webhooks(
    State(app_state): State<AppState>,
    Query(query): Query<PurgeQuery>,
) -> AppResult<impl IntoResponse> {
    let days = query
        .older_than_days
        .unwrap_or(app_state.config.webhook_retention_days)
        .max(0);
    let purged = app_state
        .webhook_queue
        .purge_terminal(chrono::Duration::days(days))
        .await?;
    Ok(Json(PurgeResponse { purged }))
}
