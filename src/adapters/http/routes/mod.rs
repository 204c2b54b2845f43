pub mod admin;
pub mod billing;
pub mod cron;
pub mod shopify;
pub mod shops;
pub mod usage;

use axum::{Router, middleware};

use crate::adapters::http::{app_state::AppState, middleware::require_internal_secret};

/// `/shopify/*` is called by Shopify itself. Everything else is called by the
/// embedded app's backend or a scheduler and needs the internal secret.
pub fn router(app_state: AppState) -> Router<AppState> {
    let internal = Router::new()
        .nest("/shops", shops::router())
        .nest("/billing", billing::router())
        .nest("/usage", usage::router())
        .nest("/cron", cron::router())
        .nest("/admin", admin::router())
        .route_layer(middleware::from_fn_with_state(
            app_state,
            require_internal_secret,
        ));

    Router::new()
        .nest("/shopify", shopify::router())
        .merge(internal)
}
