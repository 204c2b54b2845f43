use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    adapters::http::{app_state::AppState, routes::billing::ShopQuery},
    app_error::AppResult,
    domain::entities::usage::{ApiService, UsageState},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{service}", get(usage_state))
        .route("/{service}/check", get(check_limit))
        .route("/{service}/record", post(record_usage))
        .route("/{service}/release", post(release_usage))
}

async fn usage_state(
    State(app_state): State<AppState>,
    Path(service): Path<ApiService>,
    Query(query): Query<ShopQuery>,
) -> AppResult<impl IntoResponse> {
    let state = app_state
        .usage_use_cases
        .get_usage_state(&query.shop, service)
        .await?;
    Ok(Json(state))
}

#[derive(Deserialize)]
struct CheckQuery {
    shop: String,
    #[serde(default = "one")]
    calls: i64,
    #[serde(default)]
    tokens: i64,
}

fn one() -> i64 {
    1
}

#[derive(Serialize)]
struct CheckResponse {
    allowed: bool,
}

async fn check_limit(
    State(app_state): State<AppState>,
    Path(service): Path<ApiService>,
    Query(query): Query<CheckQuery>,
) -> AppResult<impl IntoResponse> {
    let allowed = app_state
        .usage_use_cases
        .check_limit_with_tokens(&query.shop, service, query.calls, query.tokens)
        .await?;
    Ok(Json(CheckResponse { allowed }))
}

#[derive(Deserialize)]
struct UsageRequest {
    shop: String,
    #[serde(default = "one")]
    calls: i64,
    #[serde(default)]
    tokens: i64,
    /// Overrides the shop's stored address for threshold emails.
    email: Option<String>,
}

#[derive(Serialize)]
struct RecordResponse {
    usage: UsageState,
    /// Quota threshold announced by this call, if any.
    notified_threshold: Option<i32>,
}

/// Count a call against every limit. 429 when any limit would break.
async fn record_usage(
    State(app_state): State<AppState>,
    Path(service): Path<ApiService>,
    Json(payload): Json<UsageRequest>,
) -> AppResult<impl IntoResponse> {
    let usage = app_state
        .usage_use_cases
        .record_usage(&payload.shop, service, payload.calls, payload.tokens)
        .await?;

    // The call is already counted; a failed email must not fail it.
    let notified_threshold = match app_state
        .usage_use_cases
        .handle_usage_notification(&usage, &payload.shop, payload.email.as_deref())
        .await
    {
        Ok(threshold) => threshold,
        Err(e) => {
            warn!(shop = %payload.shop, service = %service, error = %e, "Usage notification failed");
            None
        }
    };

    Ok(Json(RecordResponse {
        usage,
        notified_threshold,
    }))
}

async fn release_usage(
    State(app_state): State<AppState>,
    Path(service): Path<ApiService>,
    Json(payload): Json<UsageRequest>,
) -> AppResult<StatusCode> {
    app_state
        .usage_use_cases
        .release_usage(&payload.shop, service, payload.calls, payload.tokens)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum_test::TestServer;
    use serde_json::json;

    use super::*;
    use crate::{
        domain::entities::plan::PlanName,
        test_utils::{TestAppStateBuilder, create_test_plan, create_test_shop},
    };

    const SHOP: &str = "s.myshopify.com";

    fn build_test_router(app_state: AppState) -> Router<()> {
        router().with_state(app_state)
    }

    /// FREE plan allowing `quota` crawl calls per cycle.
    fn builder_with_free_quota(quota: i64) -> TestAppStateBuilder {
        TestAppStateBuilder::new()
            .with_shop(create_test_shop(SHOP, |s| {
                s.email = Some("owner@shop.test".to_string());
            }))
            .with_plan(create_test_plan(PlanName::Free, |p| {
                p.crawl_limits.cycle_quota = quota;
            }))
    }

    #[tokio::test]
    async fn record_counts_usage() {
        let (app_state, h) = builder_with_free_quota(100).build_with_harness();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/crawl/record")
            .json(&json!({"shop": SHOP, "calls": 3}))
            .await;

        response.assert_status(StatusCode::OK);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["usage"]["total_requests"], 3);
        assert_eq!(body["usage"]["remaining_quota"], 97);
        assert!(body["notified_threshold"].is_null());
        assert_eq!(
            h.store
                .usage_counter(SHOP, ApiService::Crawl)
                .unwrap()
                .total_requests,
            3
        );
    }

    #[tokio::test]
    async fn exhausted_quota_returns_429_and_counts_nothing() {
        let (app_state, h) = builder_with_free_quota(2).build_with_harness();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        server
            .post("/crawl/record")
            .json(&json!({"shop": SHOP, "calls": 2}))
            .await
            .assert_status(StatusCode::OK);

        let response = server
            .post("/crawl/record")
            .json(&json!({"shop": SHOP}))
            .await;

        response.assert_status(StatusCode::TOO_MANY_REQUESTS);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["service"], "crawl");
        assert_eq!(
            h.store
                .usage_counter(SHOP, ApiService::Crawl)
                .unwrap()
                .total_requests,
            2
        );
    }

    #[tokio::test]
    async fn crossing_eighty_percent_notifies_once() {
        let (app_state, h) = builder_with_free_quota(10).build_with_harness();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let first = server
            .post("/crawl/record")
            .json(&json!({"shop": SHOP, "calls": 8}))
            .await;
        assert_eq!(first.json::<serde_json::Value>()["notified_threshold"], 80);

        let second = server
            .post("/crawl/record")
            .json(&json!({"shop": SHOP}))
            .await;
        assert!(second.json::<serde_json::Value>()["notified_threshold"].is_null());

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].email, "owner@shop.test");
        assert_eq!(sent[0].threshold, 80);
    }

    #[tokio::test]
    async fn release_gives_budget_back() {
        let (app_state, h) = builder_with_free_quota(100).build_with_harness();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        server
            .post("/crawl/record")
            .json(&json!({"shop": SHOP, "calls": 5}))
            .await
            .assert_status(StatusCode::OK);
        server
            .post("/crawl/release")
            .json(&json!({"shop": SHOP, "calls": 2}))
            .await
            .assert_status(StatusCode::NO_CONTENT);

        assert_eq!(
            h.store
                .usage_counter(SHOP, ApiService::Crawl)
                .unwrap()
                .total_requests,
            3
        );
    }

    #[tokio::test]
    async fn check_is_read_only() {
        let (app_state, h) = builder_with_free_quota(1).build_with_harness();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .get("/crawl/check")
            .add_query_param("shop", SHOP)
            .await;

        response.assert_status(StatusCode::OK);
        assert_eq!(response.json::<serde_json::Value>()["allowed"], true);
        assert!(h.store.usage_counter(SHOP, ApiService::Crawl).is_none());
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let app_state = builder_with_free_quota(10).build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .get("/video")
            .add_query_param("shop", SHOP)
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }
}
