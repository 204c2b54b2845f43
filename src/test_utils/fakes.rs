//! Fakes for the outbound ports: billing provider, cache, notifier and a
//! scripted webhook handler.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::{
            billing_provider::{
                BillingProviderPort, CancelledCharge, ChargeCreated, OneTimeChargeRequest,
                RecurringChargeRequest,
            },
            cache::BillingCache,
            notifier::UsageNotifier,
        },
        use_cases::webhook_handlers::WebhookTopicHandler,
    },
    domain::entities::{
        usage::ApiService,
        webhook::{WebhookPayload, WebhookTopic},
    },
};

// ============================================================================
// FakeBillingProvider
// ============================================================================

#[derive(Default)]
pub struct FakeBillingProvider {
    fail: bool,
    recurring: Mutex<Vec<RecurringChargeRequest>>,
    one_time: Mutex<Vec<OneTimeChargeRequest>>,
    cancelled: Mutex<Vec<String>>,
}

impl FakeBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `BillingProvider`.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn recurring_requests(&self) -> Vec<RecurringChargeRequest> {
        self.recurring.lock().unwrap().clone()
    }

    pub fn one_time_requests(&self) -> Vec<OneTimeChargeRequest> {
        self.one_time.lock().unwrap().clone()
    }

    pub fn cancelled_charges(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    fn check(&self) -> AppResult<()> {
        if self.fail {
            return Err(AppError::BillingProvider("provider unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingProviderPort for FakeBillingProvider {
    async fn create_recurring_charge(
        &self,
        request: &RecurringChargeRequest,
    ) -> AppResult<ChargeCreated> {
        self.check()?;
        self.recurring.lock().unwrap().push(request.clone());
        let id = format!("gid://shopify/AppSubscription/{}", Uuid::new_v4().simple());
        Ok(ChargeCreated {
            confirmation_url: format!("https://{}/admin/charges/confirm?id={id}", request.shop),
            external_id: id,
        })
    }

    async fn create_one_time_charge(
        &self,
        request: &OneTimeChargeRequest,
    ) -> AppResult<ChargeCreated> {
        self.check()?;
        self.one_time.lock().unwrap().push(request.clone());
        let id = format!("gid://shopify/AppPurchaseOneTime/{}", Uuid::new_v4().simple());
        Ok(ChargeCreated {
            confirmation_url: format!("https://{}/admin/charges/confirm?id={id}", request.shop),
            external_id: id,
        })
    }

    async fn cancel_recurring_charge(
        &self,
        _shop: &str,
        external_id: &str,
        _prorate: bool,
    ) -> AppResult<CancelledCharge> {
        self.check()?;
        self.cancelled.lock().unwrap().push(external_id.to_string());
        Ok(CancelledCharge {
            status: "CANCELLED".to_string(),
            created_at: None,
            updated_at: Some(Utc::now()),
            price_cents: None,
        })
    }
}

// ============================================================================
// InMemoryBillingCache
// ============================================================================

#[derive(Default)]
pub struct InMemoryBillingCache {
    entries: Mutex<HashMap<(String, String), String>>,
    generations: Mutex<HashMap<String, u64>>,
}

impl InMemoryBillingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, shop: &str, resource: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .contains_key(&(shop.to_string(), resource.to_string()))
    }
}

#[async_trait]
impl BillingCache for InMemoryBillingCache {
    async fn get(&self, shop: &str, resource: &str) -> AppResult<Option<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&(shop.to_string(), resource.to_string()))
            .cloned())
    }

    async fn generation(&self, shop: &str) -> AppResult<u64> {
        Ok(self
            .generations
            .lock()
            .unwrap()
            .get(shop)
            .copied()
            .unwrap_or(0))
    }

    async fn set(
        &self,
        shop: &str,
        resource: &str,
        value: &str,
        generation: u64,
    ) -> AppResult<bool> {
        // Same lock order as `invalidate_shop`
        let generations = self.generations.lock().unwrap();
        if generations.get(shop).copied().unwrap_or(0) != generation {
            return Ok(false);
        }
        self.entries
            .lock()
            .unwrap()
            .insert((shop.to_string(), resource.to_string()), value.to_string());
        Ok(true)
    }

    async fn invalidate_shop(&self, shop: &str) -> AppResult<()> {
        let mut generations = self.generations.lock().unwrap();
        *generations.entry(shop.to_string()).or_insert(0) += 1;
        self.entries.lock().unwrap().retain(|(s, _), _| s != shop);
        Ok(())
    }
}

// ============================================================================
// RecordingNotifier
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub shop: String,
    pub email: String,
    pub service: ApiService,
    pub threshold: i32,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl UsageNotifier for RecordingNotifier {
    async fn notify(
        &self,
        shop: &str,
        email: &str,
        service: ApiService,
        threshold: i32,
    ) -> AppResult<()> {
        self.sent.lock().unwrap().push(SentNotification {
            shop: shop.to_string(),
            email: email.to_string(),
            service,
            threshold,
        });
        Ok(())
    }
}

// ============================================================================
// ScriptedHandler
// ============================================================================

/// Handler that fails its first `failures` calls, then succeeds.
pub struct ScriptedHandler {
    topic: WebhookTopic,
    failures_left: AtomicU32,
    calls: AtomicUsize,
    statuses: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    pub fn new(topic: WebhookTopic, failures: u32) -> Self {
        Self {
            topic,
            failures_left: AtomicU32::new(failures),
            calls: AtomicUsize::new(0),
            statuses: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Subscription statuses in the order the handler saw them.
    pub fn seen_statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookTopicHandler for ScriptedHandler {
    fn topic(&self) -> WebhookTopic {
        self.topic
    }

    async fn handle(&self, _shop: &str, payload: &WebhookPayload) -> AppResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let WebhookPayload::SubscriptionUpdate(update) = payload {
            self.statuses.lock().unwrap().push(update.status.clone());
        }

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AppError::Internal("scripted failure".into()));
        }
        Ok(())
    }
}
