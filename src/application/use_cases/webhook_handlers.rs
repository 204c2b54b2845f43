use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::cache::BillingCache,
        use_cases::{
            credits::CreditUseCases,
            shop::{SessionRepo, ShopRepo},
            subscription::SubscriptionUseCases,
        },
    },
    domain::entities::webhook::{WebhookPayload, WebhookTopic},
};

/// Side effect of one webhook topic. Must tolerate being run more than once
/// for the same payload.
#[async_trait]
pub trait WebhookTopicHandler: Send + Sync {
    fn topic(&self) -> WebhookTopic;

    async fn handle(&self, shop: &str, payload: &WebhookPayload) -> AppResult<()>;
}

fn unexpected(topic: WebhookTopic, payload: &WebhookPayload) -> AppError {
    AppError::InvalidInput(format!(
        "{topic} handler received a {} payload",
        payload.topic()
    ))
}

// ============================================================================
// APP_SUBSCRIPTIONS_UPDATE
// ============================================================================

pub struct SubscriptionUpdateHandler {
    subscriptions: Arc<SubscriptionUseCases>,
}

impl SubscriptionUpdateHandler {
    pub fn new(subscriptions: Arc<SubscriptionUseCases>) -> Self {
        Self { subscriptions }
    }
}

#[async_trait]
impl WebhookTopicHandler for SubscriptionUpdateHandler {
    fn topic(&self) -> WebhookTopic {
        WebhookTopic::AppSubscriptionsUpdate
    }

    async fn handle(&self, _shop: &str, payload: &WebhookPayload) -> AppResult<()> {
        let WebhookPayload::SubscriptionUpdate(update) = payload else {
            return Err(unexpected(self.topic(), payload));
        };
        self.subscriptions
            .reconcile_provider_status(&update.admin_graphql_api_id, &update.status)
            .await
    }
}

// ============================================================================
// APP_PURCHASES_ONE_TIME_UPDATE
// ============================================================================

pub struct PurchaseUpdateHandler {
    credits: Arc<CreditUseCases>,
}

impl PurchaseUpdateHandler {
    pub fn new(credits: Arc<CreditUseCases>) -> Self {
        Self { credits }
    }
}

#[async_trait]
impl WebhookTopicHandler for PurchaseUpdateHandler {
    fn topic(&self) -> WebhookTopic {
        WebhookTopic::AppPurchasesOneTimeUpdate
    }

    async fn handle(&self, _shop: &str, payload: &WebhookPayload) -> AppResult<()> {
        let WebhookPayload::PurchaseUpdate(update) = payload else {
            return Err(unexpected(self.topic(), payload));
        };
        self.credits
            .handle_purchase_update(&update.admin_graphql_api_id, &update.status)
            .await
    }
}

// ============================================================================
// APP_UNINSTALLED
// ============================================================================

pub struct UninstallHandler {
    sessions: Arc<dyn SessionRepo>,
    shops: Arc<dyn ShopRepo>,
    subscriptions: Arc<SubscriptionUseCases>,
    cache: Arc<dyn BillingCache>,
}

impl UninstallHandler {
    pub fn new(
        sessions: Arc<dyn SessionRepo>,
        shops: Arc<dyn ShopRepo>,
        subscriptions: Arc<SubscriptionUseCases>,
        cache: Arc<dyn BillingCache>,
    ) -> Self {
        Self {
            sessions,
            shops,
            subscriptions,
            cache,
        }
    }
}

#[async_trait]
impl WebhookTopicHandler for UninstallHandler {
    fn topic(&self) -> WebhookTopic {
        WebhookTopic::AppUninstalled
    }

    #[instrument(skip(self, payload))]
    async fn handle(&self, shop: &str, payload: &WebhookPayload) -> AppResult<()> {
        if !matches!(payload, WebhookPayload::Uninstalled(_)) {
            return Err(unexpected(self.topic(), payload));
        }

        let sessions = self.sessions.delete_for_shop(shop).await?;
        if let Err(e) = self.cache.invalidate_shop(shop).await {
            warn!(shop, error = %e, "Billing cache purge failed");
        }
        let cancelled = self.subscriptions.cancel_all_for_shop(shop).await?;
        self.shops.mark_uninstalled(shop, Utc::now()).await?;

        info!(shop, sessions, cancelled, "Shop uninstalled");
        Ok(())
    }
}
