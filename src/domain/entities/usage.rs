use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::plan::ServiceLimits;

pub const MINUTE_WINDOW_SECS: i64 = 60;
pub const DAY_WINDOW_SECS: i64 = 86_400;

/// Quota percentages that trigger a merchant notification, once each per cycle.
pub const NOTIFICATION_THRESHOLDS: [i32; 2] = [80, 100];

/// Metered downstream APIs.
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
#[sqlx(type_name = "api_service", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ApiService {
    Ai,
    Crawl,
}

impl ApiService {
    pub const ALL: [ApiService; 2] = [ApiService::Ai, ApiService::Crawl];

    /// AI calls are budgeted in tokens, crawl calls only in requests.
    pub fn counts_tokens(&self) -> bool {
        matches!(self, ApiService::Ai)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitKind {
    RequestsPerMinute,
    RequestsPerDay,
    TokensPerMinute,
    TokensPerDay,
    CycleQuota,
}

/// The limits that apply to one shop and service right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageLimits {
    pub service: ApiService,
    pub limits: ServiceLimits,
    /// End of the active billing cycle; `None` for shops on the free tier
    pub cycle_resets_at: Option<DateTime<Utc>>,
}

/// First limit a request would break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitViolation {
    pub kind: LimitKind,
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageCounter {
    pub shop: String,
    pub service: ApiService,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub minute_window_start: DateTime<Utc>,
    pub minute_requests: i64,
    pub minute_tokens: i64,
    pub day_window_start: DateTime<Utc>,
    pub day_requests: i64,
    pub day_tokens: i64,
    pub last_notified_threshold: i32,
    pub updated_at: DateTime<Utc>,
}

impl UsageCounter {
    pub fn new(shop: &str, service: ApiService, now: DateTime<Utc>) -> Self {
        Self {
            shop: shop.to_string(),
            service,
            total_requests: 0,
            total_tokens: 0,
            minute_window_start: now,
            minute_requests: 0,
            minute_tokens: 0,
            day_window_start: now,
            day_requests: 0,
            day_tokens: 0,
            last_notified_threshold: 0,
            updated_at: now,
        }
    }

    /// Empty out any window whose start is at least its length in the past.
    pub fn roll_windows(&mut self, now: DateTime<Utc>) {
        if now - self.minute_window_start >= Duration::seconds(MINUTE_WINDOW_SECS) {
            self.minute_window_start = now;
            self.minute_requests = 0;
            self.minute_tokens = 0;
        }
        if now - self.day_window_start >= Duration::seconds(DAY_WINDOW_SECS) {
            self.day_window_start = now;
            self.day_requests = 0;
            self.day_tokens = 0;
        }
    }

    /// Amount consumed against the cycle quota (tokens for AI, calls otherwise).
    pub fn quota_used(&self) -> i64 {
        if self.service.counts_tokens() {
            self.total_tokens
        } else {
            self.total_requests
        }
    }

    /// Would `calls`/`tokens` fit inside every applicable limit at `now`?
    ///
    /// Does not mutate; windows that have lapsed are evaluated as empty.
    pub fn check(
        &self,
        limits: &UsageLimits,
        calls: i64,
        tokens: i64,
        now: DateTime<Utc>,
    ) -> Result<(), LimitViolation> {
        let mut view = self.clone();
        view.roll_windows(now);
        view.first_violation(limits, calls, tokens)
            .map_or(Ok(()), Err)
    }

    /// Check-and-increment. Either every counter moves or none does.
    pub fn apply(
        &mut self,
        limits: &UsageLimits,
        calls: i64,
        tokens: i64,
        now: DateTime<Utc>,
    ) -> Result<(), LimitViolation> {
        self.roll_windows(now);
        if let Some(violation) = self.first_violation(limits, calls, tokens) {
            return Err(violation);
        }

        // Token windows without a limit are never checked, so saturate
        let tokens = if self.service.counts_tokens() { tokens } else { 0 };
        self.total_requests = self.total_requests.saturating_add(calls);
        self.total_tokens = self.total_tokens.saturating_add(tokens);
        self.minute_requests = self.minute_requests.saturating_add(calls);
        self.minute_tokens = self.minute_tokens.saturating_add(tokens);
        self.day_requests = self.day_requests.saturating_add(calls);
        self.day_tokens = self.day_tokens.saturating_add(tokens);
        self.updated_at = now;
        Ok(())
    }

    /// Undo a previous `apply` whose downstream call failed.
    pub fn release(&mut self, calls: i64, tokens: i64, now: DateTime<Utc>) {
        self.roll_windows(now);
        let tokens = if self.service.counts_tokens() { tokens } else { 0 };
        self.total_requests = (self.total_requests - calls).max(0);
        self.total_tokens = (self.total_tokens - tokens).max(0);
        self.minute_requests = (self.minute_requests - calls).max(0);
        self.minute_tokens = (self.minute_tokens - tokens).max(0);
        self.day_requests = (self.day_requests - calls).max(0);
        self.day_tokens = (self.day_tokens - tokens).max(0);
        self.updated_at = now;
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        *self = Self::new(&self.shop, self.service, now);
    }

    pub fn state(&self, limits: &UsageLimits, now: DateTime<Utc>) -> UsageState {
        let mut view = self.clone();
        view.roll_windows(now);

        let quota = limits.limits.cycle_quota;
        let used = view.quota_used();

        UsageState {
            service: view.service,
            total_requests: view.total_requests,
            total_tokens: view.total_tokens,
            remaining_quota: (quota - used).max(0),
            percentage_used: percentage_used(used, quota),
            rate_limit: RateLimitSnapshot {
                requests_per_minute: limits.limits.requests_per_minute,
                remaining_minute: (limits.limits.requests_per_minute - view.minute_requests)
                    .max(0),
                minute_resets_at: view.minute_window_start
                    + Duration::seconds(MINUTE_WINDOW_SECS),
                requests_per_day: limits.limits.requests_per_day,
                remaining_day: (limits.limits.requests_per_day - view.day_requests).max(0),
                day_resets_at: view.day_window_start + Duration::seconds(DAY_WINDOW_SECS),
                cycle_resets_at: limits.cycle_resets_at,
            },
        }
    }

    /// Assumes windows are already rolled.
    fn first_violation(
        &self,
        limits: &UsageLimits,
        calls: i64,
        tokens: i64,
    ) -> Option<LimitViolation> {
        let l = &limits.limits;
        let minute_reset = Some(self.minute_window_start + Duration::seconds(MINUTE_WINDOW_SECS));
        let day_reset = Some(self.day_window_start + Duration::seconds(DAY_WINDOW_SECS));

        let mut checks = vec![
            (LimitKind::RequestsPerMinute, l.requests_per_minute, self.minute_requests, calls, minute_reset),
            (LimitKind::RequestsPerDay, l.requests_per_day, self.day_requests, calls, day_reset),
        ];

        if self.service.counts_tokens() {
            if let Some(tpm) = l.tokens_per_minute {
                checks.push((LimitKind::TokensPerMinute, tpm, self.minute_tokens, tokens, minute_reset));
            }
            if let Some(tpd) = l.tokens_per_day {
                checks.push((LimitKind::TokensPerDay, tpd, self.day_tokens, tokens, day_reset));
            }
        }

        let quota_request = if self.service.counts_tokens() { tokens } else { calls };
        checks.push((
            LimitKind::CycleQuota,
            l.cycle_quota,
            self.quota_used(),
            quota_request,
            limits.cycle_resets_at,
        ));

        for (kind, limit, used, requested, reset_at) in checks {
            // An exhausted budget also refuses calls that report zero tokens up front
            let exhausted = used >= limit && calls > 0;
            // A sum past i64::MAX is past every limit
            let over = used.checked_add(requested).map_or(true, |total| total > limit);
            if over || exhausted {
                return Some(LimitViolation {
                    kind,
                    limit,
                    remaining: (limit - used).max(0),
                    reset_at,
                });
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub requests_per_minute: i64,
    pub remaining_minute: i64,
    pub minute_resets_at: DateTime<Utc>,
    pub requests_per_day: i64,
    pub remaining_day: i64,
    pub day_resets_at: DateTime<Utc>,
    pub cycle_resets_at: Option<DateTime<Utc>>,
}

/// Snapshot returned after recording usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageState {
    pub service: ApiService,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub remaining_quota: i64,
    pub percentage_used: i32,
    pub rate_limit: RateLimitSnapshot,
}

pub fn percentage_used(used: i64, quota: i64) -> i32 {
    if quota <= 0 {
        return if used > 0 { 100 } else { 0 };
    }
    ((used.saturating_mul(100)) / quota).clamp(0, 100) as i32
}

/// Highest threshold reached that hasn't been announced yet this cycle.
pub fn threshold_to_notify(percentage_used: i32, last_notified: i32) -> Option<i32> {
    NOTIFICATION_THRESHOLDS
        .iter()
        .rev()
        .copied()
        .find(|t| percentage_used >= *t && *t > last_notified)
}
