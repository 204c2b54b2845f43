use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::application::use_cases::{
    subscription::SubscriptionUseCases, webhook_queue::WebhookQueueUseCases,
};
use crate::infra::config::AppConfig;

const STALE_CHECK_INTERVAL_SECS: u64 = 60;

/// In-process stand-in for an external scheduler calling `/api/cron/*`.
/// Passes are logged by the use cases; only failures are logged here.
pub async fn run_cron_loop(
    config: Arc<AppConfig>,
    queue: Arc<WebhookQueueUseCases>,
    subscriptions: Arc<SubscriptionUseCases>,
) {
    let mut drain_ticker = interval(Duration::from_secs(config.drain_interval_secs.max(1)));
    let mut stale_ticker = interval(Duration::from_secs(STALE_CHECK_INTERVAL_SECS));
    let mut sweep_ticker =
        interval(Duration::from_secs(config.cycle_sweep_interval_secs.max(1)));
    for ticker in [&mut drain_ticker, &mut stale_ticker, &mut sweep_ticker] {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    info!(
        drain_every = config.drain_interval_secs,
        sweep_every = config.cycle_sweep_interval_secs,
        "Billing cron loop started"
    );

    loop {
        tokio::select! {
            _ = drain_ticker.tick() => {
                if let Err(e) = queue.drain(config.drain_batch_size).await {
                    error!(error = %e, "Webhook drain failed");
                }
            }
            _ = stale_ticker.tick() => {
                if let Err(e) = queue.release_stale().await {
                    error!(error = %e, "Stale webhook release failed");
                }
            }
            _ = sweep_ticker.tick() => {
                if let Err(e) = subscriptions.sweep_cycles(config.cycle_sweep_batch_size).await {
                    error!(error = %e, "Cycle sweep failed");
                }
                let retention = chrono::Duration::days(config.webhook_retention_days);
                if let Err(e) = queue.purge_terminal(retention).await {
                    error!(error = %e, "Webhook purge failed");
                }
            }
        }
    }
}
