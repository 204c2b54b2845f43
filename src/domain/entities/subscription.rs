use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    plan::{AppliedDiscount, BillingInterval, PlanName},
    subscription_status::SubscriptionStatus,
};

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub shop: String,
    pub plan_id: Uuid,
    pub plan_name: PlanName,
    pub status: SubscriptionStatus,
    pub shopify_charge_id: String,
    pub cycle_start: Option<DateTime<Utc>>,
    pub cycle_end: Option<DateTime<Utc>>,
    /// Locked-in price; plan edits never change it
    pub price_cents: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub applied_discount: Option<AppliedDiscount>,
    pub cancel_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub proration_credit_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub shop: String,
    pub plan_id: Uuid,
    pub plan_name: PlanName,
    pub shopify_charge_id: String,
    pub price_cents: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub applied_discount: Option<AppliedDiscount>,
}

impl NewSubscription {
    pub fn into_pending(self, now: DateTime<Utc>) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            shop: self.shop,
            plan_id: self.plan_id,
            plan_name: self.plan_name,
            status: SubscriptionStatus::Pending,
            shopify_charge_id: self.shopify_charge_id,
            cycle_start: None,
            cycle_end: None,
            price_cents: self.price_cents,
            currency: self.currency,
            interval: self.interval,
            applied_discount: self.applied_discount,
            cancel_reason: None,
            cancelled_at: None,
            proration_credit_cents: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Where an ACTIVE subscription sits relative to its billing cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleStatus {
    pub is_expired: bool,
    /// Rounded up; zero or negative once the cycle has ended
    pub days_until_expiration: i64,
    pub is_cycle_transition: bool,
    pub current_cycle_start: DateTime<Utc>,
    pub current_cycle_end: DateTime<Utc>,
    pub next_cycle_start: DateTime<Utc>,
    pub next_cycle_end: DateTime<Utc>,
}

/// Cycle bounds after one renewal, plus the discount state that goes with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleAdvance {
    pub expected_cycle_end: DateTime<Utc>,
    pub new_cycle_start: DateTime<Utc>,
    pub new_cycle_end: DateTime<Utc>,
    pub price_cents: i64,
    pub applied_discount: Option<AppliedDiscount>,
}

impl Subscription {
    pub fn cycle_status(&self, now: DateTime<Utc>) -> Option<CycleStatus> {
        let (start, end) = (self.cycle_start?, self.cycle_end?);
        let is_expired = now >= end;
        Some(CycleStatus {
            is_expired,
            days_until_expiration: ceil_days(end - now),
            is_cycle_transition: is_expired && self.status == SubscriptionStatus::Active,
            current_cycle_start: start,
            current_cycle_end: end,
            next_cycle_start: end,
            next_cycle_end: end + self.interval.duration(),
        })
    }

    /// Compute the next cycle. Exactly one interval; a shop that missed
    /// several renewals catches up one sweep at a time.
    pub fn next_cycle(&self, plan_price_cents: i64) -> Option<CycleAdvance> {
        let end = self.cycle_end?;
        let (price_cents, applied_discount) = match self.applied_discount {
            Some(discount) => match discount.remaining_intervals {
                None => (self.price_cents, Some(discount)),
                Some(remaining) if remaining > 1 => (
                    self.price_cents,
                    Some(AppliedDiscount {
                        remaining_intervals: Some(remaining - 1),
                        ..discount
                    }),
                ),
                // Discount used up, back to list price
                Some(_) => (plan_price_cents, None),
            },
            None => (self.price_cents, None),
        };

        Some(CycleAdvance {
            expected_cycle_end: end,
            new_cycle_start: end,
            new_cycle_end: end + self.interval.duration(),
            price_cents,
            applied_discount,
        })
    }

    /// Store-credit owed for the unused share of the current cycle.
    pub fn proration_credit(&self, now: DateTime<Utc>) -> i64 {
        match (self.cycle_start, self.cycle_end) {
            (Some(start), Some(end)) => proration_credit(self.price_cents, start, end, now),
            _ => 0,
        }
    }
}

/// floor(price × max(0, end − now) / (end − start))
pub fn proration_credit(
    price_cents: i64,
    cycle_start: DateTime<Utc>,
    cycle_end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> i64 {
    let total = (cycle_end - cycle_start).num_seconds();
    if total <= 0 || price_cents <= 0 {
        return 0;
    }
    let remaining = (cycle_end - now).num_seconds().clamp(0, total);
    ((price_cents as i128 * remaining as i128) / total as i128) as i64
}

fn ceil_days(d: Duration) -> i64 {
    let secs = d.num_seconds();
    secs.div_euclid(SECS_PER_DAY) + i64::from(secs.rem_euclid(SECS_PER_DAY) > 0)
}
