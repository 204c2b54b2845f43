use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::payment_status::PaymentStatus;

/// A charge against a subscription or a credit purchase.
///
/// Amounts are never edited after insert. A refund flips the original row to
/// REFUNDED and inserts a SUCCEEDED row with the negated amount and
/// `refund_of` pointing back.
#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub shop: String,
    pub subscription_id: Option<Uuid>,
    pub credit_purchase_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub billing_period_start: Option<DateTime<Utc>>,
    pub billing_period_end: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
    pub refund_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub shop: String,
    pub subscription_id: Option<Uuid>,
    pub credit_purchase_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub billing_period_start: Option<DateTime<Utc>>,
    pub billing_period_end: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
}

impl NewPayment {
    pub fn into_payment(self, now: DateTime<Utc>) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            shop: self.shop,
            subscription_id: self.subscription_id,
            credit_purchase_id: self.credit_purchase_id,
            amount_cents: self.amount_cents,
            currency: self.currency,
            status: self.status,
            billing_period_start: self.billing_period_start,
            billing_period_end: self.billing_period_end,
            transaction_id: self.transaction_id,
            refund_of: None,
            created_at: now,
            updated_at: now,
        }
    }
}
