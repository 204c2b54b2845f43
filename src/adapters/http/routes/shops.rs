use axum::{
    Json, Router,
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;

use crate::{adapters::http::app_state::AppState, app_error::AppResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/install", post(install_shop))
        .route("/{shop}", get(get_shop))
}

#[derive(Deserialize)]
struct InstallRequest {
    shop: String,
    email: Option<String>,
}

/// Called by the app after OAuth completes. Reinstalls clear `uninstalled_at`.
async fn install_shop(
    State(app_state): State<AppState>,
    Json(payload): Json<InstallRequest>,
) -> AppResult<impl IntoResponse> {
    let shop = app_state
        .shop_use_cases
        .install(&payload.shop, payload.email.as_deref())
        .await?;
    Ok(Json(shop))
}

async fn get_shop(
    State(app_state): State<AppState>,
    Path(shop): Path<String>,
) -> AppResult<impl IntoResponse> {
    let shop = app_state.shop_use_cases.get(&shop).await?;
    Ok(Json(shop))
}
