//! Use cases wired against the in-memory store and fakes.

use std::sync::Arc;

use crate::application::use_cases::{
    credits::CreditUseCases,
    shop::ShopUseCases,
    subscription::SubscriptionUseCases,
    usage::UsageUseCases,
    webhook_handlers::{
        PurchaseUpdateHandler, SubscriptionUpdateHandler, UninstallHandler, WebhookTopicHandler,
    },
    webhook_queue::{QueueConfig, WebhookQueueUseCases},
};

use super::{FakeBillingProvider, InMemoryBillingCache, InMemoryBillingStore, RecordingNotifier};

pub struct BillingHarness {
    pub store: Arc<InMemoryBillingStore>,
    pub provider: Arc<FakeBillingProvider>,
    pub cache: Arc<InMemoryBillingCache>,
    pub notifier: Arc<RecordingNotifier>,
    pub shops: Arc<ShopUseCases>,
    pub usage: Arc<UsageUseCases>,
    pub subscriptions: Arc<SubscriptionUseCases>,
    pub credits: Arc<CreditUseCases>,
    pub queue: Arc<WebhookQueueUseCases>,
}

impl BillingHarness {
    pub fn new() -> Self {
        Self::with_provider(FakeBillingProvider::new())
    }

    pub fn with_provider(provider: FakeBillingProvider) -> Self {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = Arc::new(provider);
        let cache = Arc::new(InMemoryBillingCache::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let shops = Arc::new(ShopUseCases::new(store.clone()));
        let usage = Arc::new(UsageUseCases::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            notifier.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionUseCases::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            provider.clone(),
            cache.clone(),
        ));
        let credits = Arc::new(CreditUseCases::new(
            store.clone(),
            store.clone(),
            provider.clone(),
            cache.clone(),
        ));

        let handlers: Vec<Arc<dyn WebhookTopicHandler>> = vec![
            Arc::new(SubscriptionUpdateHandler::new(subscriptions.clone())),
            Arc::new(PurchaseUpdateHandler::new(credits.clone())),
            Arc::new(UninstallHandler::new(
                store.clone(),
                store.clone(),
                subscriptions.clone(),
                cache.clone(),
            )),
        ];
        let queue = Arc::new(WebhookQueueUseCases::new(
            store.clone(),
            handlers,
            QueueConfig::default(),
        ));

        Self {
            store,
            provider,
            cache,
            notifier,
            shops,
            usage,
            subscriptions,
            credits,
            queue,
        }
    }
}
