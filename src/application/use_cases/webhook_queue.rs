use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::use_cases::{shop::validate_shop_domain, webhook_handlers::WebhookTopicHandler},
    domain::entities::webhook::{
        NewWebhookQueueItem, QueueItemStatus, WebhookPayload, WebhookQueueItem, WebhookTopic,
    },
};

const ERROR_MESSAGE_CAP: usize = 1024;

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait WebhookQueueRepo: Send + Sync {
    /// Insert unless a non-failed item with the same (topic, shop, key)
    /// exists. Returns the stored item and whether it was inserted.
    async fn insert_or_get(
        &self,
        new: NewWebhookQueueItem,
        now: DateTime<Utc>,
    ) -> AppResult<(WebhookQueueItem, bool)>;

    /// Move up to `limit` due `pending` items to `processing`, oldest first.
    /// Concurrent callers never claim the same item.
    async fn claim_due(&self, limit: i64, now: DateTime<Utc>) -> AppResult<Vec<WebhookQueueItem>>;

    // The three below count an attempt and only touch rows still held by the
    // claim stamped `claimed_at`. A claim lost to `release_stale` writes nothing.

    async fn mark_completed(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    async fn mark_retry(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> AppResult<bool>;

    async fn mark_failed(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Requeue items locked before `locked_before`, failing those that run
    /// out of attempts.
    async fn release_stale(
        &self,
        locked_before: DateTime<Utc>,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> AppResult<StaleRelease>;

    async fn get(&self, id: Uuid) -> AppResult<Option<WebhookQueueItem>>;

    async fn list_failed(&self, limit: i64) -> AppResult<Vec<WebhookQueueItem>>;

    /// `failed` -> `pending` with zero attempts.
    async fn reset_for_replay(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<WebhookQueueItem>>;

    /// Delete completed/failed items processed before `cutoff`.
    async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;
}

// ============================================================================
// Configuration & Reports
// ============================================================================

/// Exponential backoff between handler attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    /// Zero retries on the next drain pass
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
    pub jitter_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 0,
            max_delay_secs: 3600,
            jitter_secs: 0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next try after `attempts` failed attempts.
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).max(0) as u32;
        let exponential = self
            .base_delay_secs
            .saturating_mul(4i64.saturating_pow(exponent));
        let capped = exponential.min(self.max_delay_secs);
        let jitter = if self.jitter_secs > 0 {
            (rand::random::<u64>() % self.jitter_secs as u64) as i64
        } else {
            0
        };
        Duration::seconds(capped + jitter)
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
    pub max_concurrent_shops: usize,
    /// How long an item may sit in `processing` before it counts as abandoned
    pub stale_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent_shops: 10,
            stale_after: Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExhaustedItem {
    pub id: Uuid,
    pub topic: WebhookTopic,
    pub shop: String,
    pub attempts: i32,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub processed: usize,
    pub retried: usize,
    pub failed: usize,
    pub exhausted: Vec<ExhaustedItem>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StaleRelease {
    pub requeued: u64,
    pub failed: u64,
}

enum ItemOutcome {
    Processed,
    Retried,
    Failed(ExhaustedItem),
    Unrecorded,
}

// ============================================================================
// Use Cases
// ============================================================================

pub struct WebhookQueueUseCases {
    repo: Arc<dyn WebhookQueueRepo>,
    handlers: HashMap<WebhookTopic, Arc<dyn WebhookTopicHandler>>,
    config: QueueConfig,
}

impl WebhookQueueUseCases {
    pub fn new(
        repo: Arc<dyn WebhookQueueRepo>,
        handlers: Vec<Arc<dyn WebhookTopicHandler>>,
        config: QueueConfig,
    ) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.topic(), h)).collect();
        Self {
            repo,
            handlers,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Validate a delivery and store it. Redeliveries of the same logical
    /// event return the existing item.
    #[instrument(skip(self, raw_payload))]
    pub async fn enqueue(
        &self,
        topic: &str,
        shop: &str,
        raw_payload: JsonValue,
    ) -> AppResult<WebhookQueueItem> {
        let topic = WebhookTopic::parse_topic(topic)
            .ok_or_else(|| AppError::InvalidInput(format!("unsupported webhook topic: {topic}")))?;
        validate_shop_domain(shop)?;

        let payload = WebhookPayload::parse(topic, &raw_payload)
            .map_err(|e| AppError::InvalidInput(format!("malformed {topic} payload: {e}")))?;

        let (item, inserted) = self
            .repo
            .insert_or_get(
                NewWebhookQueueItem {
                    topic,
                    shop: shop.to_string(),
                    payload: raw_payload,
                    idempotency_key: payload.idempotency_key(),
                },
                Utc::now(),
            )
            .await?;

        if inserted {
            info!(item_id = %item.id, topic = %topic, shop, "Webhook enqueued");
        } else {
            info!(item_id = %item.id, topic = %topic, shop, status = %item.status, "Duplicate webhook delivery");
        }
        Ok(item)
    }

    /// Claim and process up to `max_items` due items.
    ///
    /// Items of one shop run sequentially in arrival order; different shops
    /// run in parallel up to `max_concurrent_shops`.
    #[instrument(skip(self))]
    pub async fn drain(self: &Arc<Self>, max_items: i64) -> AppResult<DrainReport> {
        let items = self.repo.claim_due(max_items, Utc::now()).await?;
        let mut report = DrainReport {
            claimed: items.len(),
            ..DrainReport::default()
        };
        if items.is_empty() {
            return Ok(report);
        }

        let mut order: Vec<String> = Vec::new();
        let mut by_shop: HashMap<String, Vec<WebhookQueueItem>> = HashMap::new();
        for item in items {
            if !by_shop.contains_key(&item.shop) {
                order.push(item.shop.clone());
            }
            by_shop.entry(item.shop.clone()).or_default().push(item);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_shops.max(1)));
        let mut handles = Vec::with_capacity(order.len());

        for shop in order {
            let Some(mut shop_items) = by_shop.remove(&shop) else {
                continue;
            };
            shop_items.sort_by_key(|i| i.created_at);

            let uc = Arc::clone(self);
            let sem = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return Vec::new();
                };
                let mut outcomes = Vec::with_capacity(shop_items.len());
                for item in &shop_items {
                    outcomes.push(uc.process_item(item).await);
                }
                outcomes
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            ItemOutcome::Processed => report.processed += 1,
                            ItemOutcome::Retried => report.retried += 1,
                            ItemOutcome::Failed(item) => {
                                report.failed += 1;
                                report.exhausted.push(item);
                            }
                            ItemOutcome::Unrecorded => {}
                        }
                    }
                }
                Err(e) => error!(error = %e, "Webhook shop task panicked"),
            }
        }

        info!(
            claimed = report.claimed,
            processed = report.processed,
            retried = report.retried,
            failed = report.failed,
            "Webhook queue drained"
        );
        Ok(report)
    }

    /// Requeue items whose worker died mid-processing.
    #[instrument(skip(self))]
    pub async fn release_stale(&self) -> AppResult<StaleRelease> {
        let now = Utc::now();
        let released = self
            .repo
            .release_stale(now - self.config.stale_after, self.config.retry.max_attempts, now)
            .await?;

        if released.requeued > 0 || released.failed > 0 {
            warn!(
                requeued = released.requeued,
                failed = released.failed,
                "Released stale webhook items"
            );
        }
        if released.failed > 0 {
            error!(
                alert = true,
                count = released.failed,
                "Stale webhook items exhausted their attempts"
            );
        }
        Ok(released)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<WebhookQueueItem> {
        self.repo.get(id).await?.ok_or(AppError::NotFound)
    }

    pub async fn list_failed(&self, limit: i64) -> AppResult<Vec<WebhookQueueItem>> {
        self.repo.list_failed(limit.clamp(1, 500)).await
    }

    /// Give a failed item a fresh set of attempts.
    #[instrument(skip(self))]
    pub async fn replay(&self, id: Uuid) -> AppResult<WebhookQueueItem> {
        let item = self.get(id).await?;
        if item.status != QueueItemStatus::Failed {
            return Err(AppError::InvalidInput(format!(
                "only failed items can be replayed, item is {}",
                item.status
            )));
        }

        let replayed = self
            .repo
            .reset_for_replay(id, Utc::now())
            .await?
            .ok_or_else(|| AppError::InvalidInput("item changed while replaying".into()))?;

        info!(item_id = %id, topic = %replayed.topic, shop = %replayed.shop, "Webhook item replayed");
        Ok(replayed)
    }

    #[instrument(skip(self))]
    pub async fn purge_terminal(&self, older_than: Duration) -> AppResult<u64> {
        let purged = self.repo.purge_terminal(Utc::now() - older_than).await?;
        if purged > 0 {
            info!(purged, "Purged terminal webhook items");
        }
        Ok(purged)
    }

    // ========================================================================
    // Private Helpers
    // ========================================================================

    async fn process_item(&self, item: &WebhookQueueItem) -> ItemOutcome {
        let Some(claimed_at) = item.locked_at else {
            warn!(item_id = %item.id, "Webhook item handed out without a claim, skipped");
            return ItemOutcome::Unrecorded;
        };
        let attempts = item.attempts + 1;

        // Unreadable payloads and unrouted topics will never succeed
        let result = match (item.parsed_payload(), self.handlers.get(&item.topic)) {
            (Ok(payload), Some(handler)) => handler
                .handle(&item.shop, &payload)
                .await
                .map_err(|e| (e, false)),
            (Ok(_), None) => Err((
                AppError::Internal(format!("no handler for {}", item.topic)),
                true,
            )),
            (Err(e), _) => Err((
                AppError::InvalidInput(format!("stored payload unreadable: {e}")),
                true,
            )),
        };

        match result {
            Ok(()) => self.record(
                item,
                self.repo.mark_completed(item.id, claimed_at, Utc::now()).await,
                ItemOutcome::Processed,
            ),
            Err((e, permanent)) => {
                let message = truncate(&e.to_string());

                if permanent || attempts >= self.config.retry.max_attempts {
                    let exhausted = AppError::WebhookProcessing {
                        item_id: item.id,
                        attempts,
                        message: message.clone(),
                    };
                    error!(
                        alert = true,
                        item_id = %item.id,
                        topic = %item.topic,
                        shop = %item.shop,
                        attempts,
                        error = %exhausted,
                        "Webhook item failed permanently"
                    );
                    let outcome = ItemOutcome::Failed(ExhaustedItem {
                        id: item.id,
                        topic: item.topic,
                        shop: item.shop.clone(),
                        attempts,
                        error: message.clone(),
                    });
                    let written = self
                        .repo
                        .mark_failed(item.id, claimed_at, &message, Utc::now())
                        .await;
                    self.record(item, written, outcome)
                } else {
                    let next_attempt_at = Utc::now() + self.config.retry.delay_for(attempts);
                    warn!(
                        item_id = %item.id,
                        topic = %item.topic,
                        shop = %item.shop,
                        attempts,
                        next_attempt_at = %next_attempt_at,
                        error = %e,
                        "Webhook handler failed, will retry"
                    );
                    self.record(
                        item,
                        self.repo
                            .mark_retry(item.id, claimed_at, next_attempt_at, &message)
                            .await,
                        ItemOutcome::Retried,
                    )
                }
            }
        }
    }

    fn record(
        &self,
        item: &WebhookQueueItem,
        written: AppResult<bool>,
        outcome: ItemOutcome,
    ) -> ItemOutcome {
        match written {
            Ok(true) => outcome,
            Ok(false) => {
                warn!(item_id = %item.id, "Webhook item no longer claimed, result dropped");
                ItemOutcome::Unrecorded
            }
            Err(e) => {
                error!(item_id = %item.id, error = %e, "Failed to record webhook outcome");
                ItemOutcome::Unrecorded
            }
        }
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_CAP {
        return message.to_string();
    }
    let mut end = ERROR_MESSAGE_CAP;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
