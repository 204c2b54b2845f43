use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use secrecy::SecretString;
use sha2::Sha256;
use url::Url;

use crate::{
    adapters::http::app_state::AppState,
    application::use_cases::webhook_queue::QueueConfig,
    domain::entities::{credit::CreditPackage, plan::Plan, shop::Shop, subscription::Subscription},
    infra::config::AppConfig,
};

use super::{BillingHarness, FakeBillingProvider};

pub const TEST_SHOPIFY_SECRET: &str = "test-shopify-secret";
pub const TEST_INTERNAL_SECRET: &str = "test-internal-secret";

pub fn test_app_config() -> AppConfig {
    AppConfig {
        bind_addr: ([127, 0, 0, 1], 0).into(),
        database_url: "postgres://localhost/test".to_string(),
        redis_url: "redis://127.0.0.1:6379".to_string(),
        cache_ttl_secs: 60,
        shopify_api_secret: SecretString::new(TEST_SHOPIFY_SECRET.into()),
        shopify_api_version: "2024-10".to_string(),
        shopify_test_charges: true,
        app_url: Url::parse("https://app.test").unwrap(),
        internal_api_secret: SecretString::new(TEST_INTERNAL_SECRET.into()),
        resend_api_key: SecretString::new("re_test".into()),
        email_from: "billing@app.test".to_string(),
        queue: QueueConfig::default(),
        drain_batch_size: 50,
        cycle_sweep_batch_size: 100,
        internal_cron: false,
        drain_interval_secs: 5,
        cycle_sweep_interval_secs: 300,
        webhook_retention_days: 30,
    }
}

/// Base64 HMAC-SHA256 of `body` under the test Shopify secret, as Shopify
/// sends it in X-Shopify-Hmac-Sha256.
pub fn sign_webhook_body(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(TEST_SHOPIFY_SECRET.as_bytes()).unwrap();
    mac.update(body);
    BASE64.encode(mac.finalize().into_bytes())
}

/// Builds an [`AppState`] over the in-memory harness. Seeded rows are visible
/// through `harness.store` after `build`.
pub struct TestAppStateBuilder {
    pub harness: BillingHarness,
    config: AppConfig,
}

impl TestAppStateBuilder {
    pub fn new() -> Self {
        Self {
            harness: BillingHarness::new(),
            config: test_app_config(),
        }
    }

    /// Replaces the harness; call before seeding rows.
    pub fn with_provider(mut self, provider: FakeBillingProvider) -> Self {
        self.harness = BillingHarness::with_provider(provider);
        self
    }

    pub fn with_shop(self, shop: Shop) -> Self {
        self.harness.store.insert_shop(shop);
        self
    }

    pub fn with_plan(self, plan: Plan) -> Self {
        self.harness.store.insert_plan(plan);
        self
    }

    pub fn with_subscription(self, subscription: Subscription) -> Self {
        self.harness.store.insert_subscription(subscription);
        self
    }

    pub fn with_credit_package(self, package: CreditPackage) -> Self {
        self.harness.store.insert_credit_package(package);
        self
    }

    pub fn with_config(mut self, f: impl FnOnce(&mut AppConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn build(self) -> AppState {
        self.build_with_harness().0
    }

    /// Like `build`, but hands the harness back for assertions.
    pub fn build_with_harness(self) -> (AppState, BillingHarness) {
        let h = self.harness;
        let state = AppState {
            config: Arc::new(self.config),
            shop_use_cases: h.shops.clone(),
            subscription_use_cases: h.subscriptions.clone(),
            usage_use_cases: h.usage.clone(),
            credit_use_cases: h.credits.clone(),
            webhook_queue: h.queue.clone(),
        };
        (state, h)
    }
}

impl Default for TestAppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
