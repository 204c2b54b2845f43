use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use super::usage::ApiService;

/// Billing tiers offered to merchants.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "plan_name", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum PlanName {
    Free,
    Standard,
    Pro,
    Ultimate,
}

impl PlanName {
    pub fn is_free(&self) -> bool {
        matches!(self, PlanName::Free)
    }
}

/// Shopify `AppPricingInterval` values we sell on.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "billing_interval", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingInterval {
    #[sqlx(rename = "EVERY_30_DAYS")]
    #[serde(rename = "EVERY_30_DAYS")]
    #[strum(serialize = "EVERY_30_DAYS")]
    Every30Days,
    Annual,
}

impl BillingInterval {
    pub fn days(&self) -> i64 {
        match self {
            BillingInterval::Every30Days => 30,
            BillingInterval::Annual => 365,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::days(self.days())
    }
}

/// Rate and quota limits for one metered service.
///
/// `cycle_quota` is counted in tokens for [`ApiService::Ai`] and in calls for
/// [`ApiService::Crawl`]. Token limits are ignored for services that don't
/// consume tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLimits {
    pub requests_per_minute: i64,
    pub requests_per_day: i64,
    pub tokens_per_minute: Option<i64>,
    pub tokens_per_day: Option<i64>,
    pub cycle_quota: i64,
}

/// Promotion terms attached to a plan ("early adopter" pricing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDiscount {
    /// Percentage off the list price, 0..=100
    pub percentage: i32,
    /// Number of billing intervals the discount lasts; `None` means forever
    pub duration_limit_in_intervals: Option<i32>,
    /// Only the first N installed shops qualify
    pub max_shops: Option<i64>,
    /// Only shops flagged as early adopters qualify
    pub early_adopters_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: PlanName,
    pub price_cents: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub ai_limits: ServiceLimits,
    pub crawl_limits: ServiceLimits,
    pub discount: Option<PlanDiscount>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn limits_for(&self, service: ApiService) -> ServiceLimits {
        match service {
            ApiService::Ai => self.ai_limits,
            ApiService::Crawl => self.crawl_limits,
        }
    }
}

/// Discount locked into a subscription at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub percentage: i32,
    /// Intervals left including the current one; `None` means it never runs out
    pub remaining_intervals: Option<i32>,
}

/// What a shop would pay for a plan right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscountMetrics {
    pub final_price_cents: i64,
    pub duration_limit_in_intervals: Option<i32>,
    pub applied_plan_discount: Option<AppliedDiscount>,
}

/// Facts about a shop that decide promotion eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscountEligibility {
    pub early_adopter: bool,
    /// 1-based position of the shop in install order
    pub install_rank: i64,
}

impl PlanDiscount {
    pub fn is_eligible(&self, eligibility: DiscountEligibility) -> bool {
        if self.early_adopters_only {
            return eligibility.early_adopter;
        }
        match self.max_shops {
            Some(max) => eligibility.early_adopter || eligibility.install_rank <= max,
            None => true,
        }
    }
}

/// Apply a plan's promotion terms for a shop. Pure; reads nothing else.
pub fn discount_metrics(plan: &Plan, eligibility: DiscountEligibility) -> DiscountMetrics {
    let discount = plan
        .discount
        .filter(|d| d.percentage > 0 && d.is_eligible(eligibility));

    match discount {
        Some(d) => {
            let percentage = d.percentage.clamp(0, 100) as i64;
            DiscountMetrics {
                final_price_cents: apply_percentage_off(plan.price_cents, percentage),
                duration_limit_in_intervals: d.duration_limit_in_intervals,
                applied_plan_discount: Some(AppliedDiscount {
                    percentage: percentage as i32,
                    remaining_intervals: d.duration_limit_in_intervals,
                }),
            }
        }
        None => DiscountMetrics {
            final_price_cents: plan.price_cents,
            duration_limit_in_intervals: None,
            applied_plan_discount: None,
        },
    }
}

/// Price after a percentage discount, rounded half up to the nearest cent.
pub fn apply_percentage_off(price_cents: i64, percentage: i64) -> i64 {
    (price_cents * (100 - percentage) + 50) / 100
}
