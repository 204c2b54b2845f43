use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::{
            billing_provider::{BillingProviderPort, OneTimeChargeRequest},
            cache::BillingCache,
        },
        use_cases::shop::ShopRepo,
    },
    domain::entities::{
        credit::{CreditPackage, CreditPurchase, NewCreditPurchase},
        payment_status::PaymentStatus,
    },
};

/// Charge id prefix for purchases paid entirely with store credit.
pub const STORE_CREDIT_CHARGE_PREFIX: &str = "store-credit:";

#[async_trait]
pub trait CreditRepo: Send + Sync {
    async fn get_package(&self, id: Uuid) -> AppResult<Option<CreditPackage>>;

    async fn list_active_packages(&self) -> AppResult<Vec<CreditPackage>>;

    /// Deduct the applied store credit, insert the PENDING purchase and its
    /// PENDING payment. `InvalidInput` if the shop no longer has the credit.
    async fn create_purchase(&self, new: NewCreditPurchase) -> AppResult<CreditPurchase>;

    async fn get_purchase_by_charge_id(&self, charge_id: &str) -> AppResult<Option<CreditPurchase>>;

    /// PENDING -> SUCCEEDED for purchase and payment, granting the credits.
    async fn complete_purchase(&self, id: Uuid, now: DateTime<Utc>)
    -> AppResult<Option<CreditPurchase>>;

    /// PENDING -> FAILED for purchase and payment, returning store credit.
    async fn fail_purchase(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Option<CreditPurchase>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditCheckout {
    pub purchase: CreditPurchase,
    /// `None` when store credit covered the whole price
    pub confirmation_url: Option<String>,
}

#[derive(Clone)]
pub struct CreditUseCases {
    shop_repo: Arc<dyn ShopRepo>,
    credit_repo: Arc<dyn CreditRepo>,
    provider: Arc<dyn BillingProviderPort>,
    cache: Arc<dyn BillingCache>,
}

impl CreditUseCases {
    pub fn new(
        shop_repo: Arc<dyn ShopRepo>,
        credit_repo: Arc<dyn CreditRepo>,
        provider: Arc<dyn BillingProviderPort>,
        cache: Arc<dyn BillingCache>,
    ) -> Self {
        Self {
            shop_repo,
            credit_repo,
            provider,
            cache,
        }
    }

    pub async fn list_packages(&self) -> AppResult<Vec<CreditPackage>> {
        self.credit_repo.list_active_packages().await
    }

    /// Buy a credit package, spending store credit first.
    #[instrument(skip(self))]
    pub async fn purchase_credits(
        &self,
        shop: &str,
        package_id: Uuid,
        return_url: &str,
    ) -> AppResult<CreditCheckout> {
        let shop = self.shop_repo.get(shop).await?.ok_or(AppError::NotFound)?;
        let package = self
            .credit_repo
            .get_package(package_id)
            .await?
            .filter(|p| p.active)
            .ok_or(AppError::NotFound)?;

        let applied = shop.store_credit_cents.clamp(0, package.price_cents);
        let due = package.price_cents - applied;

        let (charge_id, confirmation_url) = if due > 0 {
            let charge = self
                .provider
                .create_one_time_charge(&OneTimeChargeRequest {
                    shop: shop.domain.clone(),
                    name: package.name.clone(),
                    price_cents: due,
                    currency: package.currency.clone(),
                    return_url: return_url.to_string(),
                })
                .await
                .map_err(|e| match e {
                    AppError::BillingProvider(_) => e,
                    other => AppError::BillingProvider(other.to_string()),
                })?;
            (charge.external_id, Some(charge.confirmation_url))
        } else {
            (format!("{STORE_CREDIT_CHARGE_PREFIX}{}", Uuid::new_v4()), None)
        };

        let mut purchase = self
            .credit_repo
            .create_purchase(NewCreditPurchase {
                shop: shop.domain.clone(),
                package_id: package.id,
                shopify_charge_id: charge_id,
                credits: package.credits,
                price_cents: due,
                currency: package.currency.clone(),
                store_credit_applied_cents: applied,
            })
            .await?;

        if confirmation_url.is_none() {
            purchase = self
                .credit_repo
                .complete_purchase(purchase.id, Utc::now())
                .await?
                .ok_or_else(|| AppError::Internal("fresh credit purchase was not pending".into()))?;
        }

        self.invalidate_cache(&shop.domain).await;
        info!(
            shop = %shop.domain,
            purchase_id = %purchase.id,
            credits = purchase.credits,
            price_cents = due,
            store_credit_applied_cents = applied,
            "Credit purchase created"
        );

        Ok(CreditCheckout {
            purchase,
            confirmation_url,
        })
    }

    /// Apply a one-time purchase status reported by Shopify.
    ///
    /// Unknown charges are an error so the webhook is retried. Reports for
    /// purchases that already settled are ignored.
    #[instrument(skip(self))]
    pub async fn handle_purchase_update(
        &self,
        charge_id: &str,
        provider_status: &str,
    ) -> AppResult<()> {
        let purchase = self
            .credit_repo
            .get_purchase_by_charge_id(charge_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let target = PaymentStatus::from_shopify_purchase_status(provider_status);
        if target == PaymentStatus::Pending || target == purchase.status {
            return Ok(());
        }
        if !purchase.status.can_transition_to(target) {
            warn!(
                charge_id,
                purchase_id = %purchase.id,
                current = %purchase.status,
                reported = %target,
                "Ignoring illegal purchase transition"
            );
            return Ok(());
        }

        let now = Utc::now();
        let updated = match target {
            PaymentStatus::Succeeded => self.credit_repo.complete_purchase(purchase.id, now).await?,
            _ => self.credit_repo.fail_purchase(purchase.id, now).await?,
        };

        match updated {
            Some(p) => {
                self.invalidate_cache(&p.shop).await;
                info!(
                    shop = %p.shop,
                    purchase_id = %p.id,
                    status = %p.status,
                    "Credit purchase settled"
                );
            }
            None => warn!(charge_id, "Credit purchase settled concurrently, skipped"),
        }
        Ok(())
    }

    async fn invalidate_cache(&self, shop: &str) {
        if let Err(e) = self.cache.invalidate_shop(shop).await {
            warn!(shop, error = %e, "Billing cache invalidation failed");
        }
    }
}
