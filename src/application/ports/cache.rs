use async_trait::async_trait;

use crate::app_error::AppResult;

pub const ACTIVE_SUBSCRIPTION_RESOURCE: &str = "active_subscription";

/// Short-TTL read-through cache keyed by (shop, resource).
///
/// Never consulted for state transitions. Every transition invalidates the
/// shop's entries and bumps its generation, so a reader that loaded from the
/// database before the transition cannot write its stale value back.
#[async_trait]
pub trait BillingCache: Send + Sync {
    async fn get(&self, shop: &str, resource: &str) -> AppResult<Option<String>>;

    /// Current generation of the shop's entries. Read it before loading the
    /// value that will be passed to `set`.
    async fn generation(&self, shop: &str) -> AppResult<u64>;

    /// Store `value` only if the shop is still at `generation`. Returns
    /// whether it was stored.
    async fn set(
        &self,
        shop: &str,
        resource: &str,
        value: &str,
        generation: u64,
    ) -> AppResult<bool>;

    async fn invalidate_shop(&self, shop: &str) -> AppResult<()>;
}
