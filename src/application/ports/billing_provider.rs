use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    app_error::AppResult,
    domain::entities::plan::{BillingInterval, PlanName},
};

// ============================================================================
// Port Types
// ============================================================================

/// Recurring app charge for one plan.
#[derive(Debug, Clone)]
pub struct RecurringChargeRequest {
    pub shop: String,
    pub plan_name: PlanName,
    pub price_cents: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub return_url: String,
}

#[derive(Debug, Clone)]
pub struct OneTimeChargeRequest {
    pub shop: String,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub return_url: String,
}

/// A charge the merchant still has to approve.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeCreated {
    /// Where to send the merchant to approve the charge
    pub confirmation_url: String,
    /// Provider charge id (`gid://shopify/AppSubscription/...`)
    pub external_id: String,
}

/// Provider view of a charge after cancellation.
#[derive(Debug, Clone)]
pub struct CancelledCharge {
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub price_cents: Option<i64>,
}

// ============================================================================
// Port Trait
// ============================================================================

/// Remote billing API. Implementations report failures as
/// `AppError::BillingProvider`.
#[async_trait]
pub trait BillingProviderPort: Send + Sync {
    async fn create_recurring_charge(
        &self,
        request: &RecurringChargeRequest,
    ) -> AppResult<ChargeCreated>;

    async fn create_one_time_charge(&self, request: &OneTimeChargeRequest)
    -> AppResult<ChargeCreated>;

    async fn cancel_recurring_charge(
        &self,
        shop: &str,
        external_id: &str,
        prorate: bool,
    ) -> AppResult<CancelledCharge>;
}
