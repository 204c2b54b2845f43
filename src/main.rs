use dotenvy::dotenv;
use tracing::info;

use shop_billing_engine::infra::{app::create_app, cron::run_cron_loop, setup::init_app_state};
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let app_state = init_app_state().await?;

    // Read bind address from config before moving app_state
    let bind_addr = app_state.config.bind_addr;

    if app_state.config.internal_cron {
        tokio::spawn(run_cron_loop(
            app_state.config.clone(),
            app_state.webhook_queue.clone(),
            app_state.subscription_use_cases.clone(),
        ));
    }

    let app = create_app(app_state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Billing engine listening at {}", &listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
