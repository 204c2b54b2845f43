use async_trait::async_trait;

use crate::{app_error::AppResult, domain::entities::usage::ApiService};

/// Tells a merchant they crossed a usage threshold.
#[async_trait]
pub trait UsageNotifier: Send + Sync {
    async fn notify(
        &self,
        shop: &str,
        email: &str,
        service: ApiService,
        threshold: i32,
    ) -> AppResult<()>;
}
