//! Test data factories for creating valid test fixtures.
//!
//! Each factory returns a complete object with sensible defaults. Use the
//! closure parameter to override specific fields as needed.

use chrono::{Duration, Utc};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

use crate::domain::entities::{
    credit::CreditPackage,
    plan::{BillingInterval, Plan, PlanName, ServiceLimits},
    shop::Shop,
    subscription::Subscription,
    subscription_status::SubscriptionStatus,
};

/// Timestamp shared by webhook bodies built below.
pub const TEST_WEBHOOK_UPDATED_AT: &str = "2024-01-01T00:00:00Z";

pub fn create_test_shop(domain: &str, overrides: impl FnOnce(&mut Shop)) -> Shop {
    let mut shop = Shop {
        domain: domain.to_string(),
        email: None,
        early_adopter: false,
        store_credit_cents: 0,
        content_credits: 0,
        installed_at: Utc::now(),
        uninstalled_at: None,
    };
    overrides(&mut shop);
    shop
}

/// Plan with limits generous enough that tests only hit the ones they set.
pub fn create_test_plan(name: PlanName, overrides: impl FnOnce(&mut Plan)) -> Plan {
    let mut plan = Plan {
        id: Uuid::new_v4(),
        name,
        price_cents: if name.is_free() { 0 } else { 2999 },
        currency: "USD".to_string(),
        interval: BillingInterval::Every30Days,
        ai_limits: ServiceLimits {
            requests_per_minute: 60,
            requests_per_day: 10_000,
            tokens_per_minute: Some(100_000),
            tokens_per_day: Some(1_000_000),
            cycle_quota: 1_000_000,
        },
        crawl_limits: ServiceLimits {
            requests_per_minute: 60,
            requests_per_day: 10_000,
            tokens_per_minute: None,
            tokens_per_day: None,
            cycle_quota: 10_000,
        },
        discount: None,
        created_at: Some(Utc::now()),
        updated_at: Some(Utc::now()),
    };
    overrides(&mut plan);
    plan
}

/// ACTIVE subscription one day into its first cycle.
pub fn create_test_subscription(
    shop: &str,
    plan: &Plan,
    overrides: impl FnOnce(&mut Subscription),
) -> Subscription {
    let now = Utc::now();
    let cycle_start = now - Duration::days(1);

    let mut sub = Subscription {
        id: Uuid::new_v4(),
        shop: shop.to_string(),
        plan_id: plan.id,
        plan_name: plan.name,
        status: SubscriptionStatus::Active,
        shopify_charge_id: format!("gid://shopify/AppSubscription/{}", Uuid::new_v4().simple()),
        cycle_start: Some(cycle_start),
        cycle_end: Some(cycle_start + plan.interval.duration()),
        price_cents: plan.price_cents,
        currency: plan.currency.clone(),
        interval: plan.interval,
        applied_discount: None,
        cancel_reason: None,
        cancelled_at: None,
        proration_credit_cents: None,
        created_at: cycle_start,
        updated_at: cycle_start,
    };
    overrides(&mut sub);
    sub
}

pub fn create_test_credit_package(overrides: impl FnOnce(&mut CreditPackage)) -> CreditPackage {
    let mut package = CreditPackage {
        id: Uuid::new_v4(),
        name: "100 content credits".to_string(),
        credits: 100,
        price_cents: 1000,
        currency: "USD".to_string(),
        active: true,
    };
    overrides(&mut package);
    package
}

// ============================================================================
// Webhook Bodies
// ============================================================================

pub fn subscription_update_body(charge_id: &str, status: &str) -> JsonValue {
    json!({
        "app_subscription": {
            "admin_graphql_api_id": charge_id,
            "name": "PRO",
            "status": status,
            "admin_graphql_api_shop_id": "gid://shopify/Shop/548380009",
            "created_at": TEST_WEBHOOK_UPDATED_AT,
            "updated_at": TEST_WEBHOOK_UPDATED_AT,
            "currency": "USD",
            "capped_amount": null
        }
    })
}

pub fn purchase_update_body(charge_id: &str, status: &str) -> JsonValue {
    json!({
        "app_purchase_one_time": {
            "admin_graphql_api_id": charge_id,
            "name": "100 content credits",
            "status": status,
            "admin_graphql_api_shop_id": "gid://shopify/Shop/548380009",
            "created_at": TEST_WEBHOOK_UPDATED_AT,
            "updated_at": TEST_WEBHOOK_UPDATED_AT
        }
    })
}

pub fn uninstall_body(shop_id: i64) -> JsonValue {
    json!({
        "id": shop_id,
        "name": "Test Shop",
        "myshopify_domain": "s.myshopify.com",
        "updated_at": TEST_WEBHOOK_UPDATED_AT
    })
}
