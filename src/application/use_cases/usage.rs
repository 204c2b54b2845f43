use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::notifier::UsageNotifier,
        use_cases::{
            shop::ShopRepo,
            subscription::{PlanRepo, SubscriptionRepo},
        },
    },
    domain::entities::{
        plan::PlanName,
        usage::{ApiService, LimitViolation, UsageCounter, UsageLimits, UsageState, threshold_to_notify},
    },
};

#[async_trait]
pub trait UsageRepo: Send + Sync {
    async fn get(&self, shop: &str, service: ApiService) -> AppResult<Option<UsageCounter>>;

    /// Lock the counter row (creating it if missing), run
    /// [`UsageCounter::apply`] and persist the result. A violation leaves the
    /// row untouched.
    async fn try_consume(
        &self,
        shop: &str,
        service: ApiService,
        limits: &UsageLimits,
        calls: i64,
        tokens: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Result<UsageCounter, LimitViolation>>;

    async fn release(
        &self,
        shop: &str,
        service: ApiService,
        calls: i64,
        tokens: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Option<UsageCounter>>;

    /// Zero every counter of the shop, notification marker included.
    async fn reset_shop(&self, shop: &str, now: DateTime<Utc>) -> AppResult<u64>;

    /// Set `last_notified_threshold` only if it still equals `expected`.
    async fn mark_notified(
        &self,
        shop: &str,
        service: ApiService,
        expected: i32,
        threshold: i32,
    ) -> AppResult<bool>;
}

#[derive(Clone)]
pub struct UsageUseCases {
    usage_repo: Arc<dyn UsageRepo>,
    subscription_repo: Arc<dyn SubscriptionRepo>,
    plan_repo: Arc<dyn PlanRepo>,
    shop_repo: Arc<dyn ShopRepo>,
    notifier: Arc<dyn UsageNotifier>,
}

impl UsageUseCases {
    pub fn new(
        usage_repo: Arc<dyn UsageRepo>,
        subscription_repo: Arc<dyn SubscriptionRepo>,
        plan_repo: Arc<dyn PlanRepo>,
        shop_repo: Arc<dyn ShopRepo>,
        notifier: Arc<dyn UsageNotifier>,
    ) -> Self {
        Self {
            usage_repo,
            subscription_repo,
            plan_repo,
            shop_repo,
            notifier,
        }
    }

    /// Limits of the shop's ACTIVE plan, or the FREE plan's when it has none.
    pub async fn limits_for(&self, shop: &str, service: ApiService) -> AppResult<UsageLimits> {
        if let Some(sub) = self.subscription_repo.get_active_for_shop(shop).await? {
            if let Some(plan) = self.plan_repo.get_by_id(sub.plan_id).await? {
                return Ok(UsageLimits {
                    service,
                    limits: plan.limits_for(service),
                    cycle_resets_at: sub.cycle_end,
                });
            }
            warn!(shop, plan_id = %sub.plan_id, "Active subscription references missing plan");
        }

        let free = self
            .plan_repo
            .get_by_name(PlanName::Free)
            .await?
            .ok_or_else(|| AppError::Internal("FREE plan is not configured".into()))?;

        Ok(UsageLimits {
            service,
            limits: free.limits_for(service),
            cycle_resets_at: None,
        })
    }

    pub async fn check_limit(&self, shop: &str, service: ApiService, calls: i64) -> AppResult<bool> {
        self.check_limit_with_tokens(shop, service, calls, 0).await
    }

    /// Read-only: would this request fit inside every limit right now?
    pub async fn check_limit_with_tokens(
        &self,
        shop: &str,
        service: ApiService,
        calls: i64,
        tokens: i64,
    ) -> AppResult<bool> {
        validate_amounts(calls, tokens)?;
        let limits = self.limits_for(shop, service).await?;
        let now = Utc::now();
        let counter = self
            .usage_repo
            .get(shop, service)
            .await?
            .unwrap_or_else(|| UsageCounter::new(shop, service, now));

        Ok(counter.check(&limits, calls, tokens, now).is_ok())
    }

    /// Atomic check-and-increment. Nothing is counted when a limit would break.
    #[instrument(skip(self))]
    pub async fn record_usage(
        &self,
        shop: &str,
        service: ApiService,
        calls: i64,
        tokens: i64,
    ) -> AppResult<UsageState> {
        validate_amounts(calls, tokens)?;
        let limits = self.limits_for(shop, service).await?;
        let now = Utc::now();

        match self
            .usage_repo
            .try_consume(shop, service, &limits, calls, tokens, now)
            .await?
        {
            Ok(counter) => Ok(counter.state(&limits, now)),
            Err(violation) => {
                info!(
                    shop,
                    service = %service,
                    limit = %violation.kind,
                    limit_value = violation.limit,
                    remaining = violation.remaining,
                    "Usage rejected"
                );
                Err(AppError::rate_limited(service, violation))
            }
        }
    }

    /// Compensating rollback for a counted call whose downstream work failed.
    #[instrument(skip(self))]
    pub async fn release_usage(
        &self,
        shop: &str,
        service: ApiService,
        calls: i64,
        tokens: i64,
    ) -> AppResult<()> {
        validate_amounts(calls, tokens)?;
        if self
            .usage_repo
            .release(shop, service, calls, tokens, Utc::now())
            .await?
            .is_none()
        {
            warn!(shop, service = %service, "Release for a shop with no usage counter");
        }
        Ok(())
    }

    /// Count the call, run it, and give the budget back if it fails.
    pub async fn metered<T, F, Fut>(
        &self,
        shop: &str,
        service: ApiService,
        calls: i64,
        tokens: i64,
        call: F,
    ) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.record_usage(shop, service, calls, tokens).await?;

        match call().await {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Err(release_err) = self.release_usage(shop, service, calls, tokens).await {
                    warn!(shop, error = %release_err, "Failed to release usage after downstream error");
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn reset_usage_counts(&self, shop: &str) -> AppResult<()> {
        let rows = self.usage_repo.reset_shop(shop, Utc::now()).await?;
        info!(shop, rows, "Usage counters reset");
        Ok(())
    }

    pub async fn get_usage_state(&self, shop: &str, service: ApiService) -> AppResult<UsageState> {
        let limits = self.limits_for(shop, service).await?;
        let now = Utc::now();
        let counter = self
            .usage_repo
            .get(shop, service)
            .await?
            .unwrap_or_else(|| UsageCounter::new(shop, service, now));
        Ok(counter.state(&limits, now))
    }

    /// Email the merchant when usage crosses 80% or 100% of the cycle quota.
    ///
    /// The marker is claimed before sending, so concurrent callers notify at
    /// most once per threshold. Returns the threshold that was announced.
    #[instrument(skip(self, usage_state, email), fields(service = %usage_state.service))]
    pub async fn handle_usage_notification(
        &self,
        usage_state: &UsageState,
        shop: &str,
        email: Option<&str>,
    ) -> AppResult<Option<i32>> {
        let service = usage_state.service;
        let last = self
            .usage_repo
            .get(shop, service)
            .await?
            .map(|c| c.last_notified_threshold)
            .unwrap_or(0);

        let Some(threshold) = threshold_to_notify(usage_state.percentage_used, last) else {
            return Ok(None);
        };

        let email = match email {
            Some(email) => Some(email.to_string()),
            None => self.shop_repo.get(shop).await?.and_then(|s| s.email),
        };
        let Some(email) = email else {
            info!(shop, threshold, "No email on file, skipping usage notification");
            return Ok(None);
        };

        if !self
            .usage_repo
            .mark_notified(shop, service, last, threshold)
            .await?
        {
            return Ok(None);
        }

        if let Err(e) = self.notifier.notify(shop, &email, service, threshold).await {
            warn!(shop, threshold, error = %e, "Usage notification failed");
            return Ok(None);
        }

        info!(shop, threshold, "Usage notification sent");
        Ok(Some(threshold))
    }
}

fn validate_amounts(calls: i64, tokens: i64) -> AppResult<()> {
    if calls < 0 || tokens < 0 {
        return Err(AppError::InvalidInput(
            "calls and tokens must not be negative".into(),
        ));
    }
    Ok(())
}
