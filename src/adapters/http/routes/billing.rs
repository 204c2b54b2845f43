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
    adapters::http::app_state::AppState,
    app_error::AppResult,
    domain::entities::{billing_event::BillingEvent, plan::PlanName},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(billing_status))
        .route("/cycle", get(cycle_status))
        .route("/check", post(check_status))
        .route("/subscribe", post(subscribe))
        .route("/subscriptions", get(list_subscriptions))
        .route("/subscriptions/{id}/cancel", post(cancel_subscription))
        .route("/payments", get(list_payments))
        .route("/credits/packages", get(list_credit_packages))
        .route("/credits/purchase", post(purchase_credits))
}

#[derive(Deserialize)]
pub(crate) struct ShopQuery {
    pub shop: String,
}

// ============================================================================
// Subscriptions
// ============================================================================

async fn billing_status(
    State(app_state): State<AppState>,
    Query(query): Query<ShopQuery>,
) -> AppResult<impl IntoResponse> {
    let status = app_state
        .subscription_use_cases
        .billing_status(&query.shop)
        .await?;
    Ok(Json(status))
}

async fn cycle_status(
    State(app_state): State<AppState>,
    Query(query): Query<ShopQuery>,
) -> AppResult<impl IntoResponse> {
    let cycle = app_state
        .subscription_use_cases
        .check_and_manage_cycle(&query.shop)
        .await?;
    Ok(Json(cycle))
}

#[derive(Deserialize)]
struct CheckStatusRequest {
    shop: String,
    plan: PlanName,
    #[serde(default)]
    canceled: bool,
    email: Option<String>,
}

#[derive(Serialize)]
struct CheckStatusResponse {
    event: BillingEvent,
}

async fn check_status(
    State(app_state): State<AppState>,
    Json(payload): Json<CheckStatusRequest>,
) -> AppResult<impl IntoResponse> {
    let event = app_state
        .subscription_use_cases
        .check_subscription_status(
            payload.plan,
            &payload.shop,
            payload.canceled,
            payload.email.as_deref(),
        )
        .await?;
    Ok(Json(CheckStatusResponse { event }))
}

#[derive(Deserialize)]
struct SubscribeRequest {
    shop: String,
    plan: PlanName,
}

async fn subscribe(
    State(app_state): State<AppState>,
    Json(payload): Json<SubscribeRequest>,
) -> AppResult<impl IntoResponse> {
    let return_url = app_state.config.charge_return_url(&payload.shop);
    let checkout = app_state
        .subscription_use_cases
        .start_subscription(&payload.shop, payload.plan, &return_url)
        .await?;
    Ok((StatusCode::CREATED, Json(checkout)))
}

async fn list_subscriptions(
    State(app_state): State<AppState>,
    Query(query): Query<ShopQuery>,
) -> AppResult<impl IntoResponse> {
    let subscriptions = app_state
        .subscription_use_cases
        .list_subscriptions(&query.shop)
        .await?;
    Ok(Json(subscriptions))
}

#[derive(Deserialize)]
struct CancelRequest {
    reason: Option<String>,
    #[serde(default)]
    prorate: bool,
}

async fn cancel_subscription(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> AppResult<impl IntoResponse> {
    let reason = payload.reason.as_deref().unwrap_or("merchant request");
    let subscription = app_state
        .subscription_use_cases
        .cancel(id, reason, payload.prorate)
        .await?;
    Ok(Json(subscription))
}

async fn list_payments(
    State(app_state): State<AppState>,
    Query(query): Query<ShopQuery>,
) -> AppResult<impl IntoResponse> {
    let payments = app_state
        .subscription_use_cases
        .list_payments(&query.shop)
        .await?;
    Ok(Json(payments))
}

// ============================================================================
// Content credits
// ============================================================================

async fn list_credit_packages(State(app_state): State<AppState>) -> AppResult<impl IntoResponse> {
    let packages = app_state.credit_use_cases.list_packages().await?;
    Ok(Json(packages))
}

#[derive(Deserialize)]
struct PurchaseCreditsRequest {
    shop: String,
    package_id: Uuid,
}

async fn purchase_credits(
    State(app_state): State<AppState>,
    Json(payload): Json<PurchaseCreditsRequest>,
) -> AppResult<impl IntoResponse> {
    let return_url = app_state.config.purchase_return_url(&payload.shop);
    let checkout = app_state
        .credit_use_cases
        .purchase_credits(&payload.shop, payload.package_id, &return_url)
        .await?;
    Ok((StatusCode::CREATED, Json(checkout)))
}
