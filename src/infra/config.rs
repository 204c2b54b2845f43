use std::net::SocketAddr;

use chrono::Duration;
use env_helpers::{get_env, get_env_default};
use secrecy::SecretString;
use url::Url;

use crate::application::use_cases::webhook_queue::{QueueConfig, RetryPolicy};

pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub redis_url: String,
    /// TTL of read-through billing cache entries.
    pub cache_ttl_secs: u64,
    /// Shopify app secret. Signs webhook bodies (X-Shopify-Hmac-Sha256).
    pub shopify_api_secret: SecretString,
    /// Admin API version used for billing mutations, e.g. "2024-10".
    pub shopify_api_version: String,
    /// Create charges with `test: true` (development stores).
    pub shopify_test_charges: bool,
    /// Public URL of the embedded app; charge return URLs are built on it.
    pub app_url: Url,
    /// Shared secret for cron and admin endpoints (X-Internal-Secret).
    pub internal_api_secret: SecretString,
    pub resend_api_key: SecretString,
    pub email_from: String,
    pub queue: QueueConfig,
    /// Items claimed per drain pass.
    pub drain_batch_size: i64,
    /// Subscriptions advanced per cycle sweep.
    pub cycle_sweep_batch_size: i64,
    /// Run the cron loops inside the server process instead of relying on an
    /// external scheduler hitting the cron endpoints.
    pub internal_cron: bool,
    pub drain_interval_secs: u64,
    pub cycle_sweep_interval_secs: u64,
    pub webhook_retention_days: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let bind_addr: SocketAddr =
            get_env_default("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3001)));
        let database_url: String = get_env("DATABASE_URL");
        let redis_url: String = get_env_default("REDIS_URL", "redis://127.0.0.1:6379".to_string());
        let cache_ttl_secs: u64 = get_env_default("BILLING_CACHE_TTL_SECS", 60);

        let shopify_api_secret = SecretString::new(get_env::<String>("SHOPIFY_API_SECRET").into());
        let shopify_api_version: String =
            get_env_default("SHOPIFY_API_VERSION", "2024-10".to_string());
        let shopify_test_charges: bool = get_env_default("SHOPIFY_TEST_CHARGES", false);
        let app_url: Url = get_env("APP_URL");

        let internal_api_secret =
            SecretString::new(get_env::<String>("INTERNAL_API_SECRET").into());
        let resend_api_key = SecretString::new(get_env::<String>("RESEND_API_KEY").into());
        let email_from: String = get_env("EMAIL_FROM");

        let retry = RetryPolicy {
            max_attempts: get_env_default("WEBHOOK_MAX_ATTEMPTS", 3),
            base_delay_secs: get_env_default("WEBHOOK_RETRY_BASE_DELAY_SECS", 0),
            max_delay_secs: get_env_default("WEBHOOK_RETRY_MAX_DELAY_SECS", 3600),
            jitter_secs: get_env_default("WEBHOOK_RETRY_JITTER_SECS", 0),
        };
        let queue = QueueConfig {
            retry,
            max_concurrent_shops: get_env_default("WEBHOOK_MAX_CONCURRENT_SHOPS", 10),
            stale_after: Duration::seconds(get_env_default("WEBHOOK_STALE_AFTER_SECS", 600)),
        };

        Self {
            bind_addr,
            database_url,
            redis_url,
            cache_ttl_secs,
            shopify_api_secret,
            shopify_api_version,
            shopify_test_charges,
            app_url,
            internal_api_secret,
            resend_api_key,
            email_from,
            queue,
            drain_batch_size: get_env_default("WEBHOOK_DRAIN_BATCH_SIZE", 100),
            cycle_sweep_batch_size: get_env_default("CYCLE_SWEEP_BATCH_SIZE", 100),
            internal_cron: get_env_default("INTERNAL_CRON", false),
            drain_interval_secs: get_env_default("WEBHOOK_DRAIN_INTERVAL_SECS", 60),
            cycle_sweep_interval_secs: get_env_default("CYCLE_SWEEP_INTERVAL_SECS", 3600),
            webhook_retention_days: get_env_default("WEBHOOK_RETENTION_DAYS", 30),
        }
    }

    /// Where Shopify sends the merchant after approving a charge.
    pub fn charge_return_url(&self, shop: &str) -> String {
        let mut url = self.app_url.clone();
        url.set_path("/api/shopify/billing/confirm");
        url.query_pairs_mut().append_pair("shop", shop);
        url.to_string()
    }

    /// One-time purchases settle by webhook, so the merchant just returns to
    /// the app.
    pub fn purchase_return_url(&self, shop: &str) -> String {
        let mut url = self.app_url.clone();
        url.query_pairs_mut().append_pair("shop", shop);
        url.to_string()
    }
}
