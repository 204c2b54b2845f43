use std::sync::Arc;

use crate::{
    application::use_cases::{
        credits::CreditUseCases, shop::ShopUseCases, subscription::SubscriptionUseCases,
        usage::UsageUseCases, webhook_queue::WebhookQueueUseCases,
    },
    infra::config::AppConfig,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub shop_use_cases: Arc<ShopUseCases>,
    pub subscription_use_cases: Arc<SubscriptionUseCases>,
    pub usage_use_cases: Arc<UsageUseCases>,
    pub credit_use_cases: Arc<CreditUseCases>,
    pub webhook_queue: Arc<WebhookQueueUseCases>,
}
