use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::{
            billing_provider::{BillingProviderPort, RecurringChargeRequest},
            cache::{ACTIVE_SUBSCRIPTION_RESOURCE, BillingCache},
        },
        use_cases::shop::ShopRepo,
    },
    domain::entities::{
        billing_event::BillingEvent,
        payment::{NewPayment, Payment},
        payment_status::PaymentStatus,
        plan::{DiscountEligibility, DiscountMetrics, Plan, PlanName, discount_metrics},
        shop::Shop,
        subscription::{CycleAdvance, CycleStatus, NewSubscription, Subscription},
        subscription_status::SubscriptionStatus,
    },
};

pub const UNINSTALL_CANCEL_REASON: &str = "APP_UNINSTALLED";
pub const SUPERSEDED_CANCEL_REASON: &str = "SUPERSEDED";
pub const PROVIDER_CANCEL_REASON: &str = "CANCELLED_BY_PROVIDER";

// ============================================================================
// Repository Traits
// ============================================================================

#[async_trait]
pub trait PlanRepo: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Plan>>;

    async fn get_by_name(&self, name: PlanName) -> AppResult<Option<Plan>>;

    async fn list(&self) -> AppResult<Vec<Plan>>;
}

/// Write methods are single transactions guarded by compare-and-swap on
/// `status` or `cycle_end`. `None`/`false` means the guard did not match.
#[async_trait]
pub trait SubscriptionRepo: Send + Sync {
    /// Fails with `DuplicateCharge` when the charge id is already used.
    async fn insert_pending(&self, new: NewSubscription) -> AppResult<Subscription>;

    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>>;

    async fn get_by_charge_id(&self, charge_id: &str) -> AppResult<Option<Subscription>>;

    async fn get_active_for_shop(&self, shop: &str) -> AppResult<Option<Subscription>>;

    async fn list_for_shop(&self, shop: &str) -> AppResult<Vec<Subscription>>;

    /// PENDING -> ACTIVE, cancel every other ACTIVE row of the shop, insert
    /// the initial payment.
    async fn activate(&self, id: Uuid, activation: Activation) -> AppResult<Option<Subscription>>;

    async fn transition_status(
        &self,
        id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Subscription>>;

    /// `expected` -> CANCELLED, storing the proration credit on the row and
    /// adding it to the shop's store credit.
    async fn cancel(
        &self,
        id: Uuid,
        expected: SubscriptionStatus,
        cancellation: Cancellation,
    ) -> AppResult<Option<Subscription>>;

    /// Move the cycle forward if `cycle_end` still equals
    /// `advance.expected_cycle_end`, recording the renewal payment and zeroing
    /// the shop's usage counters in the same write.
    async fn advance_cycle(
        &self,
        id: Uuid,
        advance: CycleAdvance,
        renewal: NewPayment,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Every non-terminal subscription of the shop becomes CANCELLED.
    async fn cancel_all_for_shop(
        &self,
        shop: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AppResult<u64>;

    /// Shops whose ACTIVE subscription has `cycle_end <= now`.
    async fn list_due_for_renewal(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<String>>;
}

#[async_trait]
pub trait PaymentRepo: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Payment>>;

    async fn list_for_subscription(&self, subscription_id: Uuid) -> AppResult<Vec<Payment>>;

    async fn list_for_shop(&self, shop: &str) -> AppResult<Vec<Payment>>;

    /// SUCCEEDED -> REFUNDED plus the compensating negative row.
    /// Returns `(original, compensation)`.
    async fn refund(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Option<(Payment, Payment)>>;
}

// ============================================================================
// Inputs & Results
// ============================================================================

#[derive(Debug, Clone)]
pub struct Activation {
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: DateTime<Utc>,
    pub initial_payment: NewPayment,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Cancellation {
    pub reason: String,
    pub proration_credit_cents: i64,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionCheckout {
    pub subscription: Subscription,
    pub confirmation_url: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub advanced: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingStatus {
    pub shop: String,
    pub plan_name: PlanName,
    pub subscription: Option<Subscription>,
    pub cycle: Option<CycleStatus>,
    pub store_credit_cents: i64,
    pub content_credits: i64,
}

// ============================================================================
// Use Cases
// ============================================================================

#[derive(Clone)]
pub struct SubscriptionUseCases {
    shop_repo: Arc<dyn ShopRepo>,
    plan_repo: Arc<dyn PlanRepo>,
    subscription_repo: Arc<dyn SubscriptionRepo>,
    payment_repo: Arc<dyn PaymentRepo>,
    provider: Arc<dyn BillingProviderPort>,
    cache: Arc<dyn BillingCache>,
}

impl SubscriptionUseCases {
    pub fn new(
        shop_repo: Arc<dyn ShopRepo>,
        plan_repo: Arc<dyn PlanRepo>,
        subscription_repo: Arc<dyn SubscriptionRepo>,
        payment_repo: Arc<dyn PaymentRepo>,
        provider: Arc<dyn BillingProviderPort>,
        cache: Arc<dyn BillingCache>,
    ) -> Self {
        Self {
            shop_repo,
            plan_repo,
            subscription_repo,
            payment_repo,
            provider,
            cache,
        }
    }

    // ========================================================================
    // Creation & Activation
    // ========================================================================

    /// Ask the provider for a recurring charge and record it as PENDING.
    #[instrument(skip(self))]
    pub async fn start_subscription(
        &self,
        shop: &str,
        plan_name: PlanName,
        return_url: &str,
    ) -> AppResult<SubscriptionCheckout> {
        if plan_name.is_free() {
            return Err(AppError::InvalidInput(
                "the FREE plan does not need a charge".into(),
            ));
        }

        let shop = self.require_shop(shop).await?;
        let plan = self
            .plan_repo
            .get_by_name(plan_name)
            .await?
            .ok_or(AppError::NotFound)?;
        let metrics = self.calculate_discount_metrics(&plan, &shop).await?;

        let charge = self
            .provider
            .create_recurring_charge(&RecurringChargeRequest {
                shop: shop.domain.clone(),
                plan_name: plan.name,
                price_cents: metrics.final_price_cents,
                currency: plan.currency.clone(),
                interval: plan.interval,
                return_url: return_url.to_string(),
            })
            .await
            .map_err(into_provider_error)?;

        let subscription = self
            .insert_pending(&shop, &plan, &charge.external_id, metrics)
            .await?;

        Ok(SubscriptionCheckout {
            subscription,
            confirmation_url: charge.confirmation_url,
        })
    }

    /// Record a PENDING subscription for a charge the provider already created.
    #[instrument(skip(self, plan), fields(plan = %plan.name))]
    pub async fn create(&self, shop: &str, plan: &Plan, charge_id: &str) -> AppResult<Subscription> {
        let shop = self.require_shop(shop).await?;
        let metrics = self.calculate_discount_metrics(plan, &shop).await?;
        self.insert_pending(&shop, plan, charge_id, metrics).await
    }

    /// PENDING -> ACTIVE on the merchant's approval callback.
    #[instrument(skip(self))]
    pub async fn confirm(&self, charge_id: &str) -> AppResult<Subscription> {
        let sub = self
            .subscription_repo
            .get_by_charge_id(charge_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if sub.status != SubscriptionStatus::Pending {
            return Err(AppError::InvalidTransition {
                from: sub.status,
                to: SubscriptionStatus::Active,
            });
        }

        let now = Utc::now();
        let cycle_end = now + sub.interval.duration();
        let activation = Activation {
            cycle_start: now,
            cycle_end,
            initial_payment: NewPayment {
                shop: sub.shop.clone(),
                subscription_id: Some(sub.id),
                credit_purchase_id: None,
                amount_cents: sub.price_cents,
                currency: sub.currency.clone(),
                status: PaymentStatus::Succeeded,
                billing_period_start: Some(now),
                billing_period_end: Some(cycle_end),
                transaction_id: Some(charge_id.to_string()),
            },
            now,
        };

        let Some(active) = self.subscription_repo.activate(sub.id, activation).await? else {
            // Lost the race against another confirm or a webhook
            let current = self.current_status(sub.id).await?;
            return Err(AppError::InvalidTransition {
                from: current,
                to: SubscriptionStatus::Active,
            });
        };

        self.invalidate_cache(&active.shop).await;
        info!(
            shop = %active.shop,
            subscription_id = %active.id,
            plan = %active.plan_name,
            cycle_end = %cycle_end,
            "Subscription activated"
        );
        Ok(active)
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// ACTIVE/FROZEN -> CANCELLED, optionally crediting the unused share of
    /// the cycle to the shop's store credit.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        reason: &str,
        prorate: bool,
    ) -> AppResult<Subscription> {
        let sub = self
            .subscription_repo
            .get_by_id(subscription_id)
            .await?
            .ok_or(AppError::NotFound)?;
        ensure_cancellable(sub.status)?;

        self.provider
            .cancel_recurring_charge(&sub.shop, &sub.shopify_charge_id, prorate)
            .await
            .map_err(into_provider_error)?;

        let now = Utc::now();
        let credit = if prorate { sub.proration_credit(now) } else { 0 };

        let cancelled = self
            .subscription_repo
            .cancel(
                sub.id,
                sub.status,
                Cancellation {
                    reason: reason.to_string(),
                    proration_credit_cents: credit,
                    now,
                },
            )
            .await?;

        let Some(cancelled) = cancelled else {
            let current = self.current_status(sub.id).await?;
            ensure_cancellable(current)?;
            return Err(AppError::InvalidTransition {
                from: current,
                to: SubscriptionStatus::Cancelled,
            });
        };

        self.invalidate_cache(&cancelled.shop).await;
        info!(
            shop = %cancelled.shop,
            subscription_id = %cancelled.id,
            proration_credit_cents = credit,
            reason,
            "Subscription cancelled"
        );
        Ok(cancelled)
    }

    /// Uninstall cascade. No provider calls: Shopify already dropped the charges.
    #[instrument(skip(self))]
    pub async fn cancel_all_for_shop(&self, shop: &str) -> AppResult<u64> {
        let count = self
            .subscription_repo
            .cancel_all_for_shop(shop, UNINSTALL_CANCEL_REASON, Utc::now())
            .await?;
        self.invalidate_cache(shop).await;
        if count > 0 {
            info!(shop, count, "Cancelled subscriptions for uninstalled shop");
        }
        Ok(count)
    }

    // ========================================================================
    // Billing Cycles
    // ========================================================================

    /// Pure read of where the shop's ACTIVE subscription sits in its cycle.
    pub async fn check_and_manage_cycle(&self, shop: &str) -> AppResult<Option<CycleStatus>> {
        let active = self.subscription_repo.get_active_for_shop(shop).await?;
        Ok(active.and_then(|sub| sub.cycle_status(Utc::now())))
    }

    /// Advance a lapsed cycle by one interval and reset usage.
    ///
    /// Returns `false` when there was nothing to do or another caller
    /// advanced the cycle first.
    #[instrument(skip(self))]
    pub async fn handle_cycle_transition(&self, shop: &str) -> AppResult<bool> {
        let Some(sub) = self.subscription_repo.get_active_for_shop(shop).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        let due = sub
            .cycle_status(now)
            .map(|s| s.is_cycle_transition)
            .unwrap_or(false);
        if !due {
            return Ok(false);
        }

        let plan_price = self
            .plan_repo
            .get_by_id(sub.plan_id)
            .await?
            .map(|p| p.price_cents)
            .unwrap_or(sub.price_cents);

        let Some(advance) = sub.next_cycle(plan_price) else {
            return Ok(false);
        };

        let renewal = NewPayment {
            shop: sub.shop.clone(),
            subscription_id: Some(sub.id),
            credit_purchase_id: None,
            amount_cents: advance.price_cents,
            currency: sub.currency.clone(),
            status: PaymentStatus::Succeeded,
            billing_period_start: Some(advance.new_cycle_start),
            billing_period_end: Some(advance.new_cycle_end),
            transaction_id: Some(format!(
                "{}:{}",
                sub.shopify_charge_id,
                advance.new_cycle_start.timestamp()
            )),
        };

        if !self
            .subscription_repo
            .advance_cycle(sub.id, advance, renewal, now)
            .await?
        {
            info!(shop, subscription_id = %sub.id, "Cycle already advanced");
            return Ok(false);
        }

        self.invalidate_cache(shop).await;

        info!(
            shop,
            subscription_id = %sub.id,
            new_cycle_end = %advance.new_cycle_end,
            price_cents = advance.price_cents,
            "Billing cycle advanced"
        );
        Ok(true)
    }

    /// Cron entry point: advance every lapsed cycle.
    #[instrument(skip(self))]
    pub async fn sweep_cycles(&self, limit: i64) -> AppResult<SweepReport> {
        let shops = self
            .subscription_repo
            .list_due_for_renewal(Utc::now(), limit)
            .await?;

        let mut report = SweepReport {
            due: shops.len(),
            ..SweepReport::default()
        };

        for shop in shops {
            match self.handle_cycle_transition(&shop).await {
                Ok(true) => report.advanced += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(shop = %shop, error = %e, "Cycle transition failed");
                }
            }
        }

        Ok(report)
    }

    // ========================================================================
    // Pricing & Decisions
    // ========================================================================

    pub async fn calculate_discount_metrics(
        &self,
        plan: &Plan,
        shop: &Shop,
    ) -> AppResult<DiscountMetrics> {
        let eligibility = DiscountEligibility {
            early_adopter: shop.early_adopter,
            install_rank: self.shop_repo.install_rank(&shop.domain).await?,
        };
        Ok(discount_metrics(plan, eligibility))
    }

    /// Decide which write the UI should issue next. Never mutates.
    #[instrument(skip(self, email))]
    pub async fn check_subscription_status(
        &self,
        plan_name: PlanName,
        shop: &str,
        canceled: bool,
        email: Option<&str>,
    ) -> AppResult<BillingEvent> {
        let active = self.subscription_repo.get_active_for_shop(shop).await?;

        let event = match (canceled, active) {
            (true, _) => BillingEvent::Cancel,
            (false, Some(sub)) if plan_name.is_free() && !sub.plan_name.is_free() => {
                BillingEvent::Cancel
            }
            (false, Some(sub)) if sub.plan_name == plan_name => BillingEvent::Renew,
            (false, Some(_)) => BillingEvent::Update,
            // No paid plan means the shop is already on FREE
            (false, None) if plan_name.is_free() => BillingEvent::Renew,
            (false, None) => BillingEvent::Subscribe,
        };

        info!(
            shop,
            requested_plan = %plan_name,
            has_email = email.is_some(),
            event = %event,
            "Billing decision"
        );
        Ok(event)
    }

    // ========================================================================
    // Provider Reconciliation
    // ========================================================================

    /// Apply a status Shopify reported for one of our charges.
    ///
    /// Stale or illegal reports are logged and dropped. A missing
    /// subscription is an error so the webhook is retried; the report may
    /// have overtaken our own insert.
    #[instrument(skip(self))]
    pub async fn reconcile_provider_status(
        &self,
        charge_id: &str,
        provider_status: &str,
    ) -> AppResult<()> {
        let Some(target) = SubscriptionStatus::from_provider(provider_status) else {
            info!(charge_id, provider_status, "Ignoring untracked provider status");
            return Ok(());
        };

        let sub = self
            .subscription_repo
            .get_by_charge_id(charge_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if sub.status == target {
            return Ok(());
        }

        if !sub.status.can_transition_to(target) {
            warn!(
                charge_id,
                subscription_id = %sub.id,
                current = %sub.status,
                reported = %target,
                "Ignoring illegal provider transition"
            );
            return Ok(());
        }

        match (sub.status, target) {
            (SubscriptionStatus::Pending, SubscriptionStatus::Active) => {
                match self.confirm(charge_id).await {
                    Ok(_) | Err(AppError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            (from, SubscriptionStatus::Cancelled) => {
                let cancelled = self
                    .subscription_repo
                    .cancel(
                        sub.id,
                        from,
                        Cancellation {
                            reason: PROVIDER_CANCEL_REASON.to_string(),
                            proration_credit_cents: 0,
                            now: Utc::now(),
                        },
                    )
                    .await?;
                self.log_reconciled(&sub, target, cancelled.is_some());
            }
            (from, to) => {
                let updated = self
                    .subscription_repo
                    .transition_status(sub.id, from, to, Utc::now())
                    .await?;
                self.log_reconciled(&sub, target, updated.is_some());
            }
        }

        self.invalidate_cache(&sub.shop).await;
        Ok(())
    }

    // ========================================================================
    // Payments
    // ========================================================================

    /// SUCCEEDED -> REFUNDED with a compensating negative payment.
    #[instrument(skip(self))]
    pub async fn refund_payment(&self, payment_id: Uuid) -> AppResult<(Payment, Payment)> {
        let payment = self
            .payment_repo
            .get_by_id(payment_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if payment.refund_of.is_some() {
            return Err(AppError::InvalidInput(
                "compensating payments cannot be refunded".into(),
            ));
        }

        let Some((original, compensation)) =
            self.payment_repo.refund(payment_id, Utc::now()).await?
        else {
            return Err(AppError::InvalidInput(format!(
                "payment {payment_id} is {}, only SUCCEEDED payments can be refunded",
                self.payment_repo
                    .get_by_id(payment_id)
                    .await?
                    .map(|p| p.status)
                    .unwrap_or(payment.status)
            )));
        };

        self.invalidate_cache(&original.shop).await;
        info!(
            shop = %original.shop,
            payment_id = %original.id,
            amount_cents = original.amount_cents,
            "Payment refunded"
        );
        Ok((original, compensation))
    }

    pub async fn list_payments(&self, shop: &str) -> AppResult<Vec<Payment>> {
        self.payment_repo.list_for_shop(shop).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read-through cached lookup of the shop's ACTIVE subscription.
    pub async fn get_active_subscription(&self, shop: &str) -> AppResult<Option<Subscription>> {
        match self.cache.get(shop, ACTIVE_SUBSCRIPTION_RESOURCE).await {
            Ok(Some(cached)) => match serde_json::from_str(&cached) {
                Ok(sub) => return Ok(sub),
                Err(e) => warn!(shop, error = %e, "Discarding unreadable cache entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(shop, error = %e, "Billing cache read failed"),
        }

        // Taken before the database read; a transition in between makes the
        // write below a no-op
        let generation = match self.cache.generation(shop).await {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!(shop, error = %e, "Billing cache generation read failed");
                None
            }
        };

        let active = self.subscription_repo.get_active_for_shop(shop).await?;
        let Some(generation) = generation else {
            return Ok(active);
        };
        match serde_json::to_string(&active) {
            Ok(json) => match self
                .cache
                .set(shop, ACTIVE_SUBSCRIPTION_RESOURCE, &json, generation)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(shop, "Skipped caching a read that raced a transition"),
                Err(e) => warn!(shop, error = %e, "Billing cache write failed"),
            },
            Err(e) => warn!(shop, error = %e, "Failed to serialize subscription for cache"),
        }
        Ok(active)
    }

    pub async fn billing_status(&self, shop: &str) -> AppResult<BillingStatus> {
        let shop = self.require_shop(shop).await?;
        let subscription = self.get_active_subscription(&shop.domain).await?;
        let now = Utc::now();

        Ok(BillingStatus {
            plan_name: subscription
                .as_ref()
                .map(|s| s.plan_name)
                .unwrap_or(PlanName::Free),
            cycle: subscription.as_ref().and_then(|s| s.cycle_status(now)),
            subscription,
            store_credit_cents: shop.store_credit_cents,
            content_credits: shop.content_credits,
            shop: shop.domain,
        })
    }

    pub async fn list_subscriptions(&self, shop: &str) -> AppResult<Vec<Subscription>> {
        self.subscription_repo.list_for_shop(shop).await
    }

    // ========================================================================
    // Private Helpers
    // ========================================================================

    async fn insert_pending(
        &self,
        shop: &Shop,
        plan: &Plan,
        charge_id: &str,
        metrics: DiscountMetrics,
    ) -> AppResult<Subscription> {
        let sub = self
            .subscription_repo
            .insert_pending(NewSubscription {
                shop: shop.domain.clone(),
                plan_id: plan.id,
                plan_name: plan.name,
                shopify_charge_id: charge_id.to_string(),
                price_cents: metrics.final_price_cents,
                currency: plan.currency.clone(),
                interval: plan.interval,
                applied_discount: metrics.applied_plan_discount,
            })
            .await?;

        info!(
            shop = %sub.shop,
            subscription_id = %sub.id,
            charge_id,
            price_cents = sub.price_cents,
            "Pending subscription created"
        );
        Ok(sub)
    }

    async fn require_shop(&self, shop: &str) -> AppResult<Shop> {
        self.shop_repo.get(shop).await?.ok_or(AppError::NotFound)
    }

    async fn current_status(&self, id: Uuid) -> AppResult<SubscriptionStatus> {
        self.subscription_repo
            .get_by_id(id)
            .await?
            .map(|s| s.status)
            .ok_or(AppError::NotFound)
    }

    async fn invalidate_cache(&self, shop: &str) {
        if let Err(e) = self.cache.invalidate_shop(shop).await {
            warn!(shop, error = %e, "Billing cache invalidation failed");
        }
    }

    fn log_reconciled(&self, sub: &Subscription, target: SubscriptionStatus, applied: bool) {
        if applied {
            info!(
                shop = %sub.shop,
                subscription_id = %sub.id,
                from = %sub.status,
                to = %target,
                "Reconciled provider status"
            );
        } else {
            warn!(
                shop = %sub.shop,
                subscription_id = %sub.id,
                to = %target,
                "Provider status changed concurrently, skipped"
            );
        }
    }
}

fn ensure_cancellable(status: SubscriptionStatus) -> AppResult<()> {
    if status.is_terminal() {
        return Err(AppError::AlreadyTerminated(status));
    }
    if !status.is_cancellable() {
        return Err(AppError::InvalidTransition {
            from: status,
            to: SubscriptionStatus::Cancelled,
        });
    }
    Ok(())
}

fn into_provider_error(err: AppError) -> AppError {
    match err {
        AppError::BillingProvider(_) => err,
        other => AppError::BillingProvider(other.to_string()),
    }
}
