use async_trait::async_trait;
use sqlx::Row;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::shop::SessionRepo,
};

#[async_trait]
impl SessionRepo for PostgresPersistence {
    async fn offline_access_token(&self, shop: &str) -> AppResult<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT access_token FROM sessions
            WHERE shop = $1 AND is_online = FALSE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(shop)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row.map(|r| r.get("access_token")))
    }

    async fn delete_for_shop(&self, shop: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE shop = $1")
            .bind(shop)
            .execute(self.pool())
            .await
            .map_err(AppError::from)?;
        Ok(result.rows_affected())
    }
}
