//! Single in-memory store implementing every repository trait.
//!
//! Each trait method runs inside one mutex section, which stands in for the
//! database transaction the Postgres adapter uses.

use std::collections::HashMap;
use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::use_cases::{
        credits::CreditRepo,
        shop::{SessionRepo, ShopRepo},
        subscription::{
            Activation, Cancellation, PaymentRepo, PlanRepo, SUPERSEDED_CANCEL_REASON,
            SubscriptionRepo,
        },
        usage::UsageRepo,
        webhook_queue::{StaleRelease, WebhookQueueRepo},
    },
    domain::entities::{
        credit::{CreditPackage, CreditPurchase, NewCreditPurchase},
        payment::{NewPayment, Payment},
        payment_status::PaymentStatus,
        plan::{Plan, PlanName},
        shop::Shop,
        subscription::{CycleAdvance, NewSubscription, Subscription},
        subscription_status::SubscriptionStatus,
        usage::{ApiService, LimitViolation, UsageCounter, UsageLimits},
        webhook::{NewWebhookQueueItem, QueueItemStatus, WebhookQueueItem},
    },
};

#[derive(Default)]
struct StoreState {
    /// Install order
    shops: Vec<Shop>,
    plans: Vec<Plan>,
    subscriptions: Vec<Subscription>,
    payments: Vec<Payment>,
    packages: Vec<CreditPackage>,
    purchases: Vec<CreditPurchase>,
    queue: Vec<WebhookQueueItem>,
    usage: HashMap<(String, ApiService), UsageCounter>,
    sessions: HashMap<String, String>,
}

impl StoreState {
    fn shop_mut(&mut self, domain: &str) -> AppResult<&mut Shop> {
        self.shops
            .iter_mut()
            .find(|s| s.domain == domain)
            .ok_or(AppError::NotFound)
    }

    fn subscription_mut(&mut self, id: Uuid) -> Option<&mut Subscription> {
        self.subscriptions.iter_mut().find(|s| s.id == id)
    }

    fn queue_item_mut(&mut self, id: Uuid, status: QueueItemStatus) -> Option<&mut WebhookQueueItem> {
        self.queue
            .iter_mut()
            .find(|i| i.id == id && i.status == status)
    }

    fn claimed_item_mut(
        &mut self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
    ) -> Option<&mut WebhookQueueItem> {
        self.queue.iter_mut().find(|i| {
            i.id == id
                && i.status == QueueItemStatus::Processing
                && i.locked_at == Some(claimed_at)
        })
    }
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<StoreState>,
    fail_cycle_advance: AtomicBool,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Seeding & Inspection
    // ========================================================================

    pub fn insert_shop(&self, shop: Shop) -> Shop {
        let mut state = self.state.lock().unwrap();
        state.shops.retain(|s| s.domain != shop.domain);
        state.shops.push(shop.clone());
        shop
    }

    pub fn shop(&self, domain: &str) -> Option<Shop> {
        let state = self.state.lock().unwrap();
        state.shops.iter().find(|s| s.domain == domain).cloned()
    }

    pub fn insert_plan(&self, plan: Plan) -> Plan {
        self.state.lock().unwrap().plans.push(plan.clone());
        plan
    }

    pub fn insert_subscription(&self, sub: Subscription) -> Subscription {
        self.state.lock().unwrap().subscriptions.push(sub.clone());
        sub
    }

    pub fn subscription(&self, id: Uuid) -> Option<Subscription> {
        let state = self.state.lock().unwrap();
        state.subscriptions.iter().find(|s| s.id == id).cloned()
    }

    pub fn subscriptions_snapshot(&self) -> Vec<Subscription> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn payments_snapshot(&self) -> Vec<Payment> {
        self.state.lock().unwrap().payments.clone()
    }

    pub fn insert_credit_package(&self, package: CreditPackage) -> CreditPackage {
        self.state.lock().unwrap().packages.push(package.clone());
        package
    }

    pub fn credit_purchase(&self, id: Uuid) -> Option<CreditPurchase> {
        let state = self.state.lock().unwrap();
        state.purchases.iter().find(|p| p.id == id).cloned()
    }

    pub fn usage_counter(&self, shop: &str, service: ApiService) -> Option<UsageCounter> {
        let state = self.state.lock().unwrap();
        state.usage.get(&(shop.to_string(), service)).cloned()
    }

    pub fn queue_snapshot(&self) -> Vec<WebhookQueueItem> {
        self.state.lock().unwrap().queue.clone()
    }

    pub fn queue_item(&self, id: Uuid) -> Option<WebhookQueueItem> {
        let state = self.state.lock().unwrap();
        state.queue.iter().find(|i| i.id == id).cloned()
    }

    pub fn backdate_lock(&self, id: Uuid, locked_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.queue.iter_mut().find(|i| i.id == id) {
            item.locked_at = Some(locked_at);
        }
    }

    /// Make `advance_cycle` fail as if its transaction rolled back.
    pub fn set_fail_cycle_advance(&self, fail: bool) {
        self.fail_cycle_advance.store(fail, Ordering::SeqCst);
    }

    pub fn insert_session(&self, shop: &str, token: &str) {
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(shop.to_string(), token.to_string());
    }
}

// ============================================================================
// ShopRepo / SessionRepo
// ============================================================================

#[async_trait]
impl ShopRepo for InMemoryBillingStore {
    async fn get(&self, domain: &str) -> AppResult<Option<Shop>> {
        Ok(self.shop(domain))
    }

    async fn upsert_installed(&self, domain: &str, email: Option<&str>) -> AppResult<Shop> {
        let mut state = self.state.lock().unwrap();
        if let Ok(shop) = state.shop_mut(domain) {
            shop.uninstalled_at = None;
            if let Some(email) = email {
                shop.email = Some(email.to_string());
            }
            return Ok(shop.clone());
        }

        let shop = Shop {
            domain: domain.to_string(),
            email: email.map(str::to_string),
            early_adopter: false,
            store_credit_cents: 0,
            content_credits: 0,
            installed_at: Utc::now(),
            uninstalled_at: None,
        };
        state.shops.push(shop.clone());
        Ok(shop)
    }

    async fn install_rank(&self, domain: &str) -> AppResult<i64> {
        let state = self.state.lock().unwrap();
        state
            .shops
            .iter()
            .position(|s| s.domain == domain)
            .map(|i| i as i64 + 1)
            .ok_or(AppError::NotFound)
    }

    async fn mark_uninstalled(&self, domain: &str, at: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        state.shop_mut(domain)?.uninstalled_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl SessionRepo for InMemoryBillingStore {
    async fn offline_access_token(&self, shop: &str) -> AppResult<Option<String>> {
        Ok(self.state.lock().unwrap().sessions.get(shop).cloned())
    }

    async fn delete_for_shop(&self, shop: &str) -> AppResult<u64> {
        let removed = self.state.lock().unwrap().sessions.remove(shop);
        Ok(u64::from(removed.is_some()))
    }
}

// ============================================================================
// PlanRepo
// ============================================================================

#[async_trait]
impl PlanRepo for InMemoryBillingStore {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Plan>> {
        let state = self.state.lock().unwrap();
        Ok(state.plans.iter().find(|p| p.id == id).cloned())
    }

    async fn get_by_name(&self, name: PlanName) -> AppResult<Option<Plan>> {
        let state = self.state.lock().unwrap();
        Ok(state.plans.iter().find(|p| p.name == name).cloned())
    }

    async fn list(&self) -> AppResult<Vec<Plan>> {
        Ok(self.state.lock().unwrap().plans.clone())
    }
}

// ============================================================================
// SubscriptionRepo
// ============================================================================

#[async_trait]
impl SubscriptionRepo for InMemoryBillingStore {
    async fn insert_pending(&self, new: NewSubscription) -> AppResult<Subscription> {
        let mut state = self.state.lock().unwrap();
        if state
            .subscriptions
            .iter()
            .any(|s| s.shopify_charge_id == new.shopify_charge_id)
        {
            return Err(AppError::DuplicateCharge(new.shopify_charge_id));
        }
        let sub = new.into_pending(Utc::now());
        state.subscriptions.push(sub.clone());
        Ok(sub)
    }

    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>> {
        Ok(self.subscription(id))
    }

    async fn get_by_charge_id(&self, charge_id: &str) -> AppResult<Option<Subscription>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .subscriptions
            .iter()
            .find(|s| s.shopify_charge_id == charge_id)
            .cloned())
    }

    async fn get_active_for_shop(&self, shop: &str) -> AppResult<Option<Subscription>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .subscriptions
            .iter()
            .find(|s| s.shop == shop && s.status == SubscriptionStatus::Active)
            .cloned())
    }

    async fn list_for_shop(&self, shop: &str) -> AppResult<Vec<Subscription>> {
        let state = self.state.lock().unwrap();
        let mut subs: Vec<_> = state
            .subscriptions
            .iter()
            .filter(|s| s.shop == shop)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subs)
    }

    async fn activate(&self, id: Uuid, activation: Activation) -> AppResult<Option<Subscription>> {
        let mut state = self.state.lock().unwrap();
        let Some(shop) = state
            .subscriptions
            .iter()
            .find(|s| s.id == id && s.status == SubscriptionStatus::Pending)
            .map(|s| s.shop.clone())
        else {
            return Ok(None);
        };

        let now = activation.now;
        for other in state
            .subscriptions
            .iter_mut()
            .filter(|s| s.shop == shop && s.id != id && s.status == SubscriptionStatus::Active)
        {
            other.status = SubscriptionStatus::Cancelled;
            other.cancel_reason = Some(SUPERSEDED_CANCEL_REASON.to_string());
            other.cancelled_at = Some(now);
            other.updated_at = now;
        }

        let Some(sub) = state.subscription_mut(id) else {
            return Ok(None);
        };
        sub.status = SubscriptionStatus::Active;
        sub.cycle_start = Some(activation.cycle_start);
        sub.cycle_end = Some(activation.cycle_end);
        sub.updated_at = now;
        let activated = sub.clone();

        state
            .payments
            .push(activation.initial_payment.into_payment(now));
        Ok(Some(activated))
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Subscription>> {
        let mut state = self.state.lock().unwrap();
        match state.subscription_mut(id) {
            Some(sub) if sub.status == from => {
                sub.status = to;
                sub.updated_at = now;
                Ok(Some(sub.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cancel(
        &self,
        id: Uuid,
        expected: SubscriptionStatus,
        cancellation: Cancellation,
    ) -> AppResult<Option<Subscription>> {
        let mut state = self.state.lock().unwrap();
        let cancelled = match state.subscription_mut(id) {
            Some(sub) if sub.status == expected => {
                sub.status = SubscriptionStatus::Cancelled;
                sub.cancel_reason = Some(cancellation.reason);
                sub.cancelled_at = Some(cancellation.now);
                sub.proration_credit_cents = Some(cancellation.proration_credit_cents);
                sub.updated_at = cancellation.now;
                sub.clone()
            }
            _ => return Ok(None),
        };

        if cancellation.proration_credit_cents > 0 {
            state.shop_mut(&cancelled.shop)?.store_credit_cents +=
                cancellation.proration_credit_cents;
        }
        Ok(Some(cancelled))
    }

    async fn advance_cycle(
        &self,
        id: Uuid,
        advance: CycleAdvance,
        renewal: NewPayment,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        // A failed transaction leaves the cycle, payments and counters as they were
        if self.fail_cycle_advance.load(Ordering::SeqCst) {
            return Err(AppError::Internal("usage counter reset failed".into()));
        }
        let mut state = self.state.lock().unwrap();
        match state.subscription_mut(id) {
            Some(sub)
                if sub.status == SubscriptionStatus::Active
                    && sub.cycle_end == Some(advance.expected_cycle_end) =>
            {
                sub.cycle_start = Some(advance.new_cycle_start);
                sub.cycle_end = Some(advance.new_cycle_end);
                sub.price_cents = advance.price_cents;
                sub.applied_discount = advance.applied_discount;
                sub.updated_at = now;
            }
            _ => return Ok(false),
        }
        for counter in state.usage.values_mut().filter(|c| c.shop == renewal.shop) {
            counter.reset(now);
        }
        state.payments.push(renewal.into_payment(now));
        Ok(true)
    }

    async fn cancel_all_for_shop(
        &self,
        shop: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for sub in state
            .subscriptions
            .iter_mut()
            .filter(|s| s.shop == shop && !s.status.is_terminal())
        {
            sub.status = SubscriptionStatus::Cancelled;
            sub.cancel_reason = Some(reason.to_string());
            sub.cancelled_at = Some(now);
            sub.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn list_due_for_renewal(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut shops: Vec<String> = Vec::new();
        for sub in state.subscriptions.iter().filter(|s| {
            s.status == SubscriptionStatus::Active && s.cycle_end.is_some_and(|end| end <= now)
        }) {
            if !shops.contains(&sub.shop) {
                shops.push(sub.shop.clone());
            }
        }
        shops.truncate(limit.max(0) as usize);
        Ok(shops)
    }
}

// ============================================================================
// PaymentRepo
// ============================================================================

#[async_trait]
impl PaymentRepo for InMemoryBillingStore {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Payment>> {
        let state = self.state.lock().unwrap();
        Ok(state.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn list_for_subscription(&self, subscription_id: Uuid) -> AppResult<Vec<Payment>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .payments
            .iter()
            .filter(|p| p.subscription_id == Some(subscription_id))
            .cloned()
            .collect())
    }

    async fn list_for_shop(&self, shop: &str) -> AppResult<Vec<Payment>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .payments
            .iter()
            .filter(|p| p.shop == shop)
            .cloned()
            .collect())
    }

    async fn refund(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Option<(Payment, Payment)>> {
        let mut state = self.state.lock().unwrap();
        let Some(original) = state.payments.iter_mut().find(|p| {
            p.id == id && p.status == PaymentStatus::Succeeded && p.refund_of.is_none()
        }) else {
            return Ok(None);
        };
        original.status = PaymentStatus::Refunded;
        original.updated_at = now;
        let original = original.clone();

        let mut compensation = NewPayment {
            shop: original.shop.clone(),
            subscription_id: original.subscription_id,
            credit_purchase_id: original.credit_purchase_id,
            amount_cents: -original.amount_cents,
            currency: original.currency.clone(),
            status: PaymentStatus::Succeeded,
            billing_period_start: original.billing_period_start,
            billing_period_end: original.billing_period_end,
            transaction_id: original.transaction_id.as_ref().map(|t| format!("{t}:refund")),
        }
        .into_payment(now);
        compensation.refund_of = Some(original.id);

        state.payments.push(compensation.clone());
        Ok(Some((original, compensation)))
    }
}

// ============================================================================
// CreditRepo
// ============================================================================

#[async_trait]
impl CreditRepo for InMemoryBillingStore {
    async fn get_package(&self, id: Uuid) -> AppResult<Option<CreditPackage>> {
        let state = self.state.lock().unwrap();
        Ok(state.packages.iter().find(|p| p.id == id).cloned())
    }

    async fn list_active_packages(&self) -> AppResult<Vec<CreditPackage>> {
        let state = self.state.lock().unwrap();
        Ok(state.packages.iter().filter(|p| p.active).cloned().collect())
    }

    async fn create_purchase(&self, new: NewCreditPurchase) -> AppResult<CreditPurchase> {
        let mut state = self.state.lock().unwrap();
        if state
            .purchases
            .iter()
            .any(|p| p.shopify_charge_id == new.shopify_charge_id)
        {
            return Err(AppError::DuplicateCharge(new.shopify_charge_id));
        }

        let shop = state.shop_mut(&new.shop)?;
        if shop.store_credit_cents < new.store_credit_applied_cents {
            return Err(AppError::InvalidInput("store credit balance changed".into()));
        }
        shop.store_credit_cents -= new.store_credit_applied_cents;

        let now = Utc::now();
        let purchase = new.into_pending(now);
        state.payments.push(
            NewPayment {
                shop: purchase.shop.clone(),
                subscription_id: None,
                credit_purchase_id: Some(purchase.id),
                amount_cents: purchase.price_cents,
                currency: purchase.currency.clone(),
                status: PaymentStatus::Pending,
                billing_period_start: None,
                billing_period_end: None,
                transaction_id: None,
            }
            .into_payment(now),
        );
        state.purchases.push(purchase.clone());
        Ok(purchase)
    }

    async fn get_purchase_by_charge_id(&self, charge_id: &str) -> AppResult<Option<CreditPurchase>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .purchases
            .iter()
            .find(|p| p.shopify_charge_id == charge_id)
            .cloned())
    }

    async fn complete_purchase(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<CreditPurchase>> {
        let mut state = self.state.lock().unwrap();
        let Some(purchase) = settle(&mut state, id, PaymentStatus::Succeeded, now) else {
            return Ok(None);
        };
        state.shop_mut(&purchase.shop)?.content_credits += purchase.credits;
        Ok(Some(purchase))
    }

    async fn fail_purchase(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Option<CreditPurchase>> {
        let mut state = self.state.lock().unwrap();
        let Some(purchase) = settle(&mut state, id, PaymentStatus::Failed, now) else {
            return Ok(None);
        };
        state.shop_mut(&purchase.shop)?.store_credit_cents += purchase.store_credit_applied_cents;
        Ok(Some(purchase))
    }
}

fn settle(
    state: &mut StoreState,
    id: Uuid,
    status: PaymentStatus,
    now: DateTime<Utc>,
) -> Option<CreditPurchase> {
    let purchase = state
        .purchases
        .iter_mut()
        .find(|p| p.id == id && p.status == PaymentStatus::Pending)?;
    purchase.status = status;
    purchase.updated_at = now;
    let purchase = purchase.clone();

    for payment in state
        .payments
        .iter_mut()
        .filter(|p| p.credit_purchase_id == Some(id) && p.status == PaymentStatus::Pending)
    {
        payment.status = status;
        payment.updated_at = now;
        if status == PaymentStatus::Succeeded {
            payment.transaction_id = Some(purchase.shopify_charge_id.clone());
        }
    }
    Some(purchase)
}

// ============================================================================
// UsageRepo
// ============================================================================

#[async_trait]
impl UsageRepo for InMemoryBillingStore {
    async fn get(&self, shop: &str, service: ApiService) -> AppResult<Option<UsageCounter>> {
        Ok(self.usage_counter(shop, service))
    }

    async fn try_consume(
        &self,
        shop: &str,
        service: ApiService,
        limits: &UsageLimits,
        calls: i64,
        tokens: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Result<UsageCounter, LimitViolation>> {
        let mut state = self.state.lock().unwrap();
        let counter = state
            .usage
            .entry((shop.to_string(), service))
            .or_insert_with(|| UsageCounter::new(shop, service, now));
        Ok(counter
            .apply(limits, calls, tokens, now)
            .map(|()| counter.clone()))
    }

    async fn release(
        &self,
        shop: &str,
        service: ApiService,
        calls: i64,
        tokens: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Option<UsageCounter>> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .usage
            .get_mut(&(shop.to_string(), service))
            .map(|counter| {
                counter.release(calls, tokens, now);
                counter.clone()
            }))
    }

    async fn reset_shop(&self, shop: &str, now: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for counter in state.usage.values_mut().filter(|c| c.shop == shop) {
            counter.reset(now);
            count += 1;
        }
        Ok(count)
    }

    async fn mark_notified(
        &self,
        shop: &str,
        service: ApiService,
        expected: i32,
        threshold: i32,
    ) -> AppResult<bool> {
        let mut state = self.state.lock().unwrap();
        let counter = state
            .usage
            .entry((shop.to_string(), service))
            .or_insert_with(|| UsageCounter::new(shop, service, Utc::now()));
        if counter.last_notified_threshold != expected {
            return Ok(false);
        }
        counter.last_notified_threshold = threshold;
        Ok(true)
    }
}

// ============================================================================
// WebhookQueueRepo
// ============================================================================

#[async_trait]
impl WebhookQueueRepo for InMemoryBillingStore {
    async fn insert_or_get(
        &self,
        new: NewWebhookQueueItem,
        now: DateTime<Utc>,
    ) -> AppResult<(WebhookQueueItem, bool)> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.queue.iter().find(|i| {
            i.topic == new.topic
                && i.shop == new.shop
                && i.idempotency_key == new.idempotency_key
                && i.status != QueueItemStatus::Failed
        }) {
            return Ok((existing.clone(), false));
        }

        let item = WebhookQueueItem {
            id: Uuid::new_v4(),
            topic: new.topic,
            shop: new.shop,
            payload: new.payload,
            idempotency_key: new.idempotency_key,
            status: QueueItemStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            locked_at: None,
            created_at: now,
            processed_at: None,
            error: None,
        };
        state.queue.push(item.clone());
        Ok((item, true))
    }

    async fn claim_due(&self, limit: i64, now: DateTime<Utc>) -> AppResult<Vec<WebhookQueueItem>> {
        let mut state = self.state.lock().unwrap();
        let mut due: Vec<&mut WebhookQueueItem> = state
            .queue
            .iter_mut()
            .filter(|i| i.status == QueueItemStatus::Pending && i.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|i| i.created_at);

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|item| {
                item.status = QueueItemStatus::Processing;
                item.locked_at = Some(now);
                item.clone()
            })
            .collect())
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(item) = state.claimed_item_mut(id, claimed_at) else {
            return Ok(false);
        };
        item.status = QueueItemStatus::Completed;
        item.attempts += 1;
        item.processed_at = Some(now);
        item.locked_at = None;
        item.error = None;
        Ok(true)
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> AppResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(item) = state.claimed_item_mut(id, claimed_at) else {
            return Ok(false);
        };
        item.status = QueueItemStatus::Pending;
        item.attempts += 1;
        item.next_attempt_at = next_attempt_at;
        item.locked_at = None;
        item.error = Some(error.to_string());
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(item) = state.claimed_item_mut(id, claimed_at) else {
            return Ok(false);
        };
        item.status = QueueItemStatus::Failed;
        item.attempts += 1;
        item.processed_at = Some(now);
        item.locked_at = None;
        item.error = Some(error.to_string());
        Ok(true)
    }

    async fn release_stale(
        &self,
        locked_before: DateTime<Utc>,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> AppResult<StaleRelease> {
        let mut state = self.state.lock().unwrap();
        let mut released = StaleRelease::default();
        for item in state.queue.iter_mut().filter(|i| {
            i.status == QueueItemStatus::Processing
                && i.locked_at.is_some_and(|at| at < locked_before)
        }) {
            item.attempts += 1;
            item.locked_at = None;
            item.error = Some("processing timed out".to_string());
            if item.attempts >= max_attempts {
                item.status = QueueItemStatus::Failed;
                item.processed_at = Some(now);
                released.failed += 1;
            } else {
                item.status = QueueItemStatus::Pending;
                item.next_attempt_at = now;
                released.requeued += 1;
            }
        }
        Ok(released)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<WebhookQueueItem>> {
        Ok(self.queue_item(id))
    }

    async fn list_failed(&self, limit: i64) -> AppResult<Vec<WebhookQueueItem>> {
        let state = self.state.lock().unwrap();
        let mut failed: Vec<_> = state
            .queue
            .iter()
            .filter(|i| i.status == QueueItemStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }

    async fn reset_for_replay(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<WebhookQueueItem>> {
        let mut state = self.state.lock().unwrap();
        let Some(target) = state
            .queue
            .iter()
            .find(|i| i.id == id && i.status == QueueItemStatus::Failed)
            .cloned()
        else {
            return Ok(None);
        };

        if state.queue.iter().any(|i| {
            i.id != id
                && i.topic == target.topic
                && i.shop == target.shop
                && i.idempotency_key == target.idempotency_key
                && i.status != QueueItemStatus::Failed
        }) {
            return Err(AppError::InvalidInput(
                "a newer delivery of this event is already queued".into(),
            ));
        }

        let Some(item) = state.queue_item_mut(id, QueueItemStatus::Failed) else {
            return Ok(None);
        };
        item.status = QueueItemStatus::Pending;
        item.attempts = 0;
        item.next_attempt_at = now;
        item.processed_at = None;
        item.error = None;
        Ok(Some(item.clone()))
    }

    async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.queue.len();
        state.queue.retain(|i| {
            !(i.status.is_terminal() && i.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.queue.len()) as u64)
    }
}
