use std::fs::File;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    adapters::{email::resend::ResendUsageNotifier, http::app_state::AppState},
    infra::{
        config::AppConfig, http_client::build_client, postgres_persistence,
        redis_cache::RedisBillingCache, shopify_billing_client::ShopifyBillingClient,
    },
    use_cases::{
        credits::CreditUseCases,
        shop::{SessionRepo, ShopUseCases},
        subscription::SubscriptionUseCases,
        usage::UsageUseCases,
        webhook_handlers::{
            PurchaseUpdateHandler, SubscriptionUpdateHandler, UninstallHandler, WebhookTopicHandler,
        },
        webhook_queue::WebhookQueueUseCases,
    },
};

const LOG_FILE: &str = "billing-engine.log";

pub async fn init_app_state() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env();

    let postgres_arc = Arc::new(postgres_persistence(&config.database_url).await?);
    let cache = Arc::new(RedisBillingCache::new(&config.redis_url, config.cache_ttl_secs).await?);
    let http = build_client()?;

    let provider = Arc::new(ShopifyBillingClient::new(
        http.clone(),
        postgres_arc.clone() as Arc<dyn SessionRepo>,
        config.shopify_api_version.clone(),
        config.shopify_test_charges,
    ));
    let notifier = Arc::new(ResendUsageNotifier::new(
        http,
        config.resend_api_key.clone(),
        config.email_from.clone(),
    ));

    let shop_use_cases = Arc::new(ShopUseCases::new(postgres_arc.clone()));
    let usage_use_cases = Arc::new(UsageUseCases::new(
        postgres_arc.clone(),
        postgres_arc.clone(),
        postgres_arc.clone(),
        postgres_arc.clone(),
        notifier,
    ));
    let subscription_use_cases = Arc::new(SubscriptionUseCases::new(
        postgres_arc.clone(),
        postgres_arc.clone(),
        postgres_arc.clone(),
        postgres_arc.clone(),
        provider.clone(),
        cache.clone(),
    ));
    let credit_use_cases = Arc::new(CreditUseCases::new(
        postgres_arc.clone(),
        postgres_arc.clone(),
        provider,
        cache.clone(),
    ));

    let handlers: Vec<Arc<dyn WebhookTopicHandler>> = vec![
        Arc::new(SubscriptionUpdateHandler::new(subscription_use_cases.clone())),
        Arc::new(PurchaseUpdateHandler::new(credit_use_cases.clone())),
        Arc::new(UninstallHandler::new(
            postgres_arc.clone(),
            postgres_arc.clone(),
            subscription_use_cases.clone(),
            cache,
        )),
    ];
    let webhook_queue = Arc::new(WebhookQueueUseCases::new(
        postgres_arc,
        handlers,
        config.queue.clone(),
    ));

    Ok(AppState {
        config: Arc::new(config),
        shop_use_cases,
        subscription_use_cases,
        usage_use_cases,
        credit_use_cases,
        webhook_queue,
    })
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "shop_billing_engine=debug,tower_http=debug".into());

    // Console (pretty logs)
    let console_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .pretty();

    // File (structured JSON logs), skipped when the file can't be created
    let json_layer = match File::create(LOG_FILE) {
        Ok(file) => Some(
            fmt::layer()
                .json()
                .with_writer(file)
                .with_current_span(true)
                .with_span_list(true),
        ),
        Err(e) => {
            eprintln!("cannot create {LOG_FILE}: {e}");
            None
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .try_init()
        .ok();
}
