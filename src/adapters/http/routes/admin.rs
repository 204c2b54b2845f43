use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    adapters::http::app_state::AppState, app_error::AppResult,
    domain::entities::payment::Payment,
};

const DEFAULT_FAILED_LIMIT: i64 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/failed", get(list_failed_webhooks))
        .route("/webhooks/{id}", get(get_webhook))
        .route("/webhooks/{id}/replay", post(replay_webhook))
        .route("/payments/{id}/refund", post(refund_payment))
        .route("/shops/{shop}/usage/reset", post(reset_usage))
}

// ============================================================================
// Webhook queue
// ============================================================================

#[derive(Deserialize)]
struct FailedQuery {
    limit: Option<i64>,
}

async fn list_failed_webhooks(
    State(app_state): State<AppState>,
    Query(query): Query<FailedQuery>,
) -> AppResult<impl IntoResponse> {
    let items = app_state
        .webhook_queue
        .list_failed(query.limit.unwrap_or(DEFAULT_FAILED_LIMIT))
        .await?;
    Ok(Json(items))
}

async fn get_webhook(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let item = app_state.webhook_queue.get(id).await?;
    Ok(Json(item))
}

async fn replay_webhook(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let item = app_state.webhook_queue.replay(id).await?;
    Ok(Json(item))
}

// ============================================================================
// Payments & usage
// ============================================================================

#[derive(Serialize)]
struct RefundResponse {
    refunded: Payment,
    compensation: Payment,
}

async fn refund_payment(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let (refunded, compensation) = app_state.subscription_use_cases.refund_payment(id).await?;
    Ok(Json(RefundResponse {
        refunded,
        compensation,
    }))
}

async fn reset_usage(
    State(app_state): State<AppState>,
    Path(shop): Path<String>,
) -> AppResult<StatusCode> {
    app_state.usage_use_cases.reset_usage_counts(&shop).await?;
    Ok(StatusCode::NO_CONTENT)
}
