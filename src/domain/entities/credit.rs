use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::payment_status::PaymentStatus;

#[derive(Debug, Clone, Serialize)]
pub struct CreditPackage {
    pub id: Uuid,
    pub name: String,
    pub credits: i64,
    pub price_cents: i64,
    pub currency: String,
    pub active: bool,
}

/// One-time credit top-up. Shares the payment lifecycle, never recurs.
#[derive(Debug, Clone, Serialize)]
pub struct CreditPurchase {
    pub id: Uuid,
    pub shop: String,
    pub package_id: Uuid,
    pub shopify_charge_id: String,
    pub credits: i64,
    /// Amount charged after store credit
    pub price_cents: i64,
    pub currency: String,
    pub store_credit_applied_cents: i64,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCreditPurchase {
    pub shop: String,
    pub package_id: Uuid,
    pub shopify_charge_id: String,
    pub credits: i64,
    pub price_cents: i64,
    pub currency: String,
    pub store_credit_applied_cents: i64,
}

impl NewCreditPurchase {
    pub fn into_pending(self, now: DateTime<Utc>) -> CreditPurchase {
        CreditPurchase {
            id: Uuid::new_v4(),
            shop: self.shop,
            package_id: self.package_id,
            shopify_charge_id: self.shopify_charge_id,
            credits: self.credits,
            price_cents: self.price_cents,
            currency: self.currency,
            store_credit_applied_cents: self.store_credit_applied_cents,
            status: PaymentStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}
