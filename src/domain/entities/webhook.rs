use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Shopify webhook topics the engine subscribes to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "webhook_topic", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookTopic {
    AppSubscriptionsUpdate,
    AppPurchasesOneTimeUpdate,
    AppUninstalled,
}

impl WebhookTopic {
    /// Accepts both the GraphQL enum form (`APP_UNINSTALLED`) and the
    /// `X-Shopify-Topic` header form (`app/uninstalled`).
    pub fn parse_topic(s: &str) -> Option<Self> {
        s.trim().to_ascii_uppercase().replace('/', "_").parse().ok()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "webhook_queue_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueItemStatus::Completed | QueueItemStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookQueueItem {
    pub id: Uuid,
    pub topic: WebhookTopic,
    pub shop: String,
    pub payload: JsonValue,
    pub idempotency_key: String,
    pub status: QueueItemStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WebhookQueueItem {
    pub fn parsed_payload(&self) -> Result<WebhookPayload, serde_json::Error> {
        WebhookPayload::parse(self.topic, &self.payload)
    }
}

#[derive(Debug, Clone)]
pub struct NewWebhookQueueItem {
    pub topic: WebhookTopic,
    pub shop: String,
    pub payload: JsonValue,
    pub idempotency_key: String,
}

// ============================================================================
// Payloads
// ============================================================================

/// `app_subscription` object from an `APP_SUBSCRIPTIONS_UPDATE` delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSubscriptionPayload {
    pub admin_graphql_api_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// `app_purchase_one_time` object from an `APP_PURCHASES_ONE_TIME_UPDATE` delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppPurchaseOneTimePayload {
    pub admin_graphql_api_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Shop object from an `APP_UNINSTALLED` delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppUninstalledPayload {
    pub id: i64,
    #[serde(default)]
    pub myshopify_domain: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct SubscriptionEnvelope {
    app_subscription: AppSubscriptionPayload,
}

#[derive(Deserialize)]
struct PurchaseEnvelope {
    app_purchase_one_time: AppPurchaseOneTimePayload,
}

/// A webhook body validated against the shape its topic promises.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookPayload {
    SubscriptionUpdate(AppSubscriptionPayload),
    PurchaseUpdate(AppPurchaseOneTimePayload),
    Uninstalled(AppUninstalledPayload),
}

impl WebhookPayload {
    pub fn parse(topic: WebhookTopic, body: &JsonValue) -> Result<Self, serde_json::Error> {
        Ok(match topic {
            WebhookTopic::AppSubscriptionsUpdate => {
                let env: SubscriptionEnvelope = serde_json::from_value(body.clone())?;
                WebhookPayload::SubscriptionUpdate(env.app_subscription)
            }
            WebhookTopic::AppPurchasesOneTimeUpdate => {
                let env: PurchaseEnvelope = serde_json::from_value(body.clone())?;
                WebhookPayload::PurchaseUpdate(env.app_purchase_one_time)
            }
            WebhookTopic::AppUninstalled => {
                WebhookPayload::Uninstalled(serde_json::from_value(body.clone())?)
            }
        })
    }

    pub fn topic(&self) -> WebhookTopic {
        match self {
            WebhookPayload::SubscriptionUpdate(_) => WebhookTopic::AppSubscriptionsUpdate,
            WebhookPayload::PurchaseUpdate(_) => WebhookTopic::AppPurchasesOneTimeUpdate,
            WebhookPayload::Uninstalled(_) => WebhookTopic::AppUninstalled,
        }
    }

    /// Deduplication key. Shopify redelivers the same body on retry, so
    /// resource id + status + `updated_at` identifies one logical event.
    pub fn idempotency_key(&self) -> String {
        match self {
            WebhookPayload::SubscriptionUpdate(p) => format!(
                "{}:{}:{}",
                p.admin_graphql_api_id,
                p.status.to_ascii_uppercase(),
                p.updated_at.timestamp()
            ),
            WebhookPayload::PurchaseUpdate(p) => format!(
                "{}:{}:{}",
                p.admin_graphql_api_id,
                p.status.to_ascii_uppercase(),
                p.updated_at.timestamp()
            ),
            WebhookPayload::Uninstalled(p) => format!("{}:{}", p.id, p.updated_at.timestamp()),
        }
    }
}
