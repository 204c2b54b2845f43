use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::shop::ShopRepo,
    domain::entities::shop::Shop,
};

pub(crate) const SHOP_COLS: &str = r#"
    domain, email, early_adopter, store_credit_cents, content_credits,
    installed_at, uninstalled_at
"#;

pub(crate) fn row_to_shop(row: sqlx::postgres::PgRow) -> Shop {
    Shop {
        domain: row.get("domain"),
        email: row.get("email"),
        early_adopter: row.get("early_adopter"),
        store_credit_cents: row.get("store_credit_cents"),
        content_credits: row.get("content_credits"),
        installed_at: row.get("installed_at"),
        uninstalled_at: row.get("uninstalled_at"),
    }
}

#[async_trait]
impl ShopRepo for PostgresPersistence {
    async fn get(&self, domain: &str) -> AppResult<Option<Shop>> {
        let row = sqlx::query(&format!("SELECT {} FROM shops WHERE domain = $1", SHOP_COLS))
            .bind(domain)
            .fetch_optional(self.pool())
            .await
            .map_err(AppError::from)?;
        Ok(row.map(row_to_shop))
    }

    async fn upsert_installed(&self, domain: &str, email: Option<&str>) -> AppResult<Shop> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO shops (domain, email)
            VALUES ($1, $2)
            ON CONFLICT (domain) DO UPDATE
            SET uninstalled_at = NULL,
                email = COALESCE(EXCLUDED.email, shops.email)
            RETURNING {}
            "#,
            SHOP_COLS
        ))
        .bind(domain)
        .bind(email)
        .fetch_one(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row_to_shop(row))
    }

    async fn install_rank(&self, domain: &str) -> AppResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS rank
            FROM shops
            WHERE install_seq <= (SELECT install_seq FROM shops WHERE domain = $1)
            "#,
        )
        .bind(domain)
        .fetch_one(self.pool())
        .await
        .map_err(AppError::from)?;

        let rank: i64 = row.get("rank");
        // Subquery yields NULL for an unknown shop, so nothing is counted
        if rank == 0 {
            return Err(AppError::NotFound);
        }
        Ok(rank)
    }

    async fn mark_uninstalled(&self, domain: &str, at: DateTime<Utc>) -> AppResult<()> {
        let result = sqlx::query("UPDATE shops SET uninstalled_at = $2 WHERE domain = $1")
            .bind(domain)
            .bind(at)
            .execute(self.pool())
            .await
            .map_err(AppError::from)?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }
}
