use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::{PostgresPersistence, parse_json_with_fallback},
    app_error::{AppError, AppResult},
    application::use_cases::subscription::PlanRepo,
    domain::entities::plan::{Plan, PlanName},
};

const SELECT_COLS: &str = r#"
    id, name, price_cents, currency, interval, ai_limits, crawl_limits,
    discount, created_at, updated_at
"#;

fn row_to_plan(row: sqlx::postgres::PgRow) -> Plan {
    let id: Uuid = row.get("id");
    let id_str = id.to_string();
    Plan {
        id,
        name: row.get("name"),
        price_cents: row.get("price_cents"),
        currency: row.get("currency"),
        interval: row.get("interval"),
        ai_limits: parse_json_with_fallback(&row.get("ai_limits"), "ai_limits", "plan", &id_str),
        crawl_limits: parse_json_with_fallback(
            &row.get("crawl_limits"),
            "crawl_limits",
            "plan",
            &id_str,
        ),
        discount: parse_json_with_fallback(
            &row.get::<Option<JsonValue>, _>("discount").unwrap_or_default(),
            "discount",
            "plan",
            &id_str,
        ),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl PlanRepo for PostgresPersistence {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Plan>> {
        let row = sqlx::query(&format!("SELECT {} FROM plans WHERE id = $1", SELECT_COLS))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(AppError::from)?;
        Ok(row.map(row_to_plan))
    }

    async fn get_by_name(&self, name: PlanName) -> AppResult<Option<Plan>> {
        let row = sqlx::query(&format!("SELECT {} FROM plans WHERE name = $1", SELECT_COLS))
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(AppError::from)?;
        Ok(row.map(row_to_plan))
    }

    async fn list(&self) -> AppResult<Vec<Plan>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM plans ORDER BY price_cents, name",
            SELECT_COLS
        ))
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(rows.into_iter().map(row_to_plan).collect())
    }
}
