use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::{
    app_error::{AppError, AppResult},
    domain::entities::shop::Shop,
};

#[async_trait]
pub trait ShopRepo: Send + Sync {
    async fn get(&self, domain: &str) -> AppResult<Option<Shop>>;

    /// Insert on first install; on reinstall clear `uninstalled_at` and refresh email.
    async fn upsert_installed(&self, domain: &str, email: Option<&str>) -> AppResult<Shop>;

    /// 1-based position of the shop in install order.
    async fn install_rank(&self, domain: &str) -> AppResult<i64>;

    async fn mark_uninstalled(&self, domain: &str, at: DateTime<Utc>) -> AppResult<()>;
}

/// OAuth sessions live elsewhere; the engine only needs to read the offline
/// token and drop sessions on uninstall.
#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn offline_access_token(&self, shop: &str) -> AppResult<Option<String>>;

    async fn delete_for_shop(&self, shop: &str) -> AppResult<u64>;
}

pub fn validate_shop_domain(domain: &str) -> AppResult<()> {
    let valid = domain
        .strip_suffix(".myshopify.com")
        .map(|name| {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "not a myshopify.com domain: {domain}"
        )))
    }
}

#[derive(Clone)]
pub struct ShopUseCases {
    repo: Arc<dyn ShopRepo>,
}

impl ShopUseCases {
    pub fn new(repo: Arc<dyn ShopRepo>) -> Self {
        Self { repo }
    }

    #[instrument(skip(self))]
    pub async fn install(&self, domain: &str, email: Option<&str>) -> AppResult<Shop> {
        validate_shop_domain(domain)?;
        let shop = self.repo.upsert_installed(domain, email).await?;
        info!(shop = %shop.domain, "Shop installed");
        Ok(shop)
    }

    pub async fn get(&self, domain: &str) -> AppResult<Shop> {
        self.repo.get(domain).await?.ok_or(AppError::NotFound)
    }
}
