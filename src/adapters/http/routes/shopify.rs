use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::Sha256;
use tracing::info;
use uuid::Uuid;

use crate::{
    adapters::http::app_state::AppState,
    app_error::{AppError, AppResult},
    domain::entities::webhook::WebhookTopic,
};

pub const HMAC_HEADER: &str = "x-shopify-hmac-sha256";
pub const TOPIC_HEADER: &str = "x-shopify-topic";
pub const SHOP_DOMAIN_HEADER: &str = "x-shopify-shop-domain";

const SUBSCRIPTION_GID_PREFIX: &str = "gid://shopify/AppSubscription/";

/// Endpoints Shopify calls directly. Authenticated by the webhook signature
/// or, for the charge callback, by the charge id itself.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks", post(receive_webhook))
        .route("/billing/confirm", get(confirm_charge))
}

// ============================================================================
// Webhooks
// ============================================================================

#[derive(Serialize)]
struct WebhookAck {
    id: Option<Uuid>,
    status: String,
}

/// Verify, validate and enqueue. Processing happens in the drain.
async fn receive_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let signature = header_str(&headers, HMAC_HEADER).ok_or(AppError::Unauthorized)?;
    verify_webhook_hmac(
        &body,
        signature,
        app_state.config.shopify_api_secret.expose_secret(),
    )?;

    let topic = header_str(&headers, TOPIC_HEADER)
        .ok_or_else(|| AppError::InvalidInput("missing X-Shopify-Topic header".into()))?;
    let shop = header_str(&headers, SHOP_DOMAIN_HEADER)
        .ok_or_else(|| AppError::InvalidInput("missing X-Shopify-Shop-Domain header".into()))?;

    // Acknowledge topics we don't handle so Shopify stops redelivering them.
    if WebhookTopic::parse_topic(topic).is_none() {
        info!(topic, shop, "Ignoring webhook for unhandled topic");
        return Ok(Json(WebhookAck {
            id: None,
            status: "ignored".to_string(),
        }));
    }

    let payload: JsonValue = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidInput(format!("webhook body is not JSON: {e}")))?;
    let item = app_state.webhook_queue.enqueue(topic, shop, payload).await?;

    Ok(Json(WebhookAck {
        id: Some(item.id),
        status: item.status.to_string(),
    }))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Checks a base64 HMAC-SHA256 of the raw body in constant time.
pub(crate) fn verify_webhook_hmac(body: &[u8], signature: &str, secret: &str) -> AppResult<()> {
    let expected = BASE64
        .decode(signature)
        .map_err(|_| AppError::Unauthorized)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("webhook HMAC key: {e}")))?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| AppError::Unauthorized)
}

// ============================================================================
// Charge approval callback
// ============================================================================

#[derive(Deserialize)]
struct ConfirmQuery {
    charge_id: String,
    shop: Option<String>,
}

async fn confirm_charge(
    State(app_state): State<AppState>,
    Query(query): Query<ConfirmQuery>,
) -> AppResult<impl IntoResponse> {
    let charge_id = subscription_gid(&query.charge_id);
    let subscription = app_state.subscription_use_cases.confirm(&charge_id).await?;

    if let Some(shop) = query.shop.as_deref() {
        if shop != subscription.shop {
            info!(shop, owner = %subscription.shop, "Charge confirmed from a different shop's return URL");
        }
    }

    Ok(Json(subscription))
}

/// Shopify appends the numeric legacy id to the return URL; subscriptions
/// are stored under the GraphQL id.
fn subscription_gid(charge_id: &str) -> String {
    let charge_id = charge_id.trim();
    if charge_id.starts_with("gid://") {
        charge_id.to_string()
    } else {
        format!("{SUBSCRIPTION_GID_PREFIX}{charge_id}")
    }
}
