use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::usage::UsageRepo,
    domain::entities::usage::{ApiService, LimitViolation, UsageCounter, UsageLimits},
};

const SELECT_COLS: &str = r#"
    shop, service, total_requests, total_tokens, minute_window_start,
    minute_requests, minute_tokens, day_window_start, day_requests,
    day_tokens, last_notified_threshold, updated_at
"#;

fn row_to_counter(row: sqlx::postgres::PgRow) -> UsageCounter {
    UsageCounter {
        shop: row.get("shop"),
        service: row.get("service"),
        total_requests: row.get("total_requests"),
        total_tokens: row.get("total_tokens"),
        minute_window_start: row.get("minute_window_start"),
        minute_requests: row.get("minute_requests"),
        minute_tokens: row.get("minute_tokens"),
        day_window_start: row.get("day_window_start"),
        day_requests: row.get("day_requests"),
        day_tokens: row.get("day_tokens"),
        last_notified_threshold: row.get("last_notified_threshold"),
        updated_at: row.get("updated_at"),
    }
}

/// Zero every counter of the shop. Runs on the caller's connection so a cycle
/// advance can reset usage in its own transaction.
pub(crate) async fn reset_counters(
    conn: &mut PgConnection,
    shop: &str,
    now: DateTime<Utc>,
) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE usage_counters
        SET total_requests = 0, total_tokens = 0,
            minute_window_start = $2, minute_requests = 0, minute_tokens = 0,
            day_window_start = $2, day_requests = 0, day_tokens = 0,
            last_notified_threshold = 0, updated_at = $2
        WHERE shop = $1
        "#,
    )
    .bind(shop)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;
    Ok(result.rows_affected())
}

/// Lock the counter row, creating it first if the shop never used `service`.
async fn lock_counter(
    conn: &mut PgConnection,
    shop: &str,
    service: ApiService,
    now: DateTime<Utc>,
) -> AppResult<UsageCounter> {
    sqlx::query(
        r#"
        INSERT INTO usage_counters (shop, service, minute_window_start, day_window_start, updated_at)
        VALUES ($1, $2, $3, $3, $3)
        ON CONFLICT (shop, service) DO NOTHING
        "#,
    )
    .bind(shop)
    .bind(service)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;

    let row = sqlx::query(&format!(
        "SELECT {} FROM usage_counters WHERE shop = $1 AND service = $2 FOR UPDATE",
        SELECT_COLS
    ))
    .bind(shop)
    .bind(service)
    .fetch_one(&mut *conn)
    .await
    .map_err(AppError::from)?;
    Ok(row_to_counter(row))
}

async fn store_counter(conn: &mut PgConnection, counter: &UsageCounter) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE usage_counters
        SET total_requests = $3, total_tokens = $4,
            minute_window_start = $5, minute_requests = $6, minute_tokens = $7,
            day_window_start = $8, day_requests = $9, day_tokens = $10,
            last_notified_threshold = $11, updated_at = $12
        WHERE shop = $1 AND service = $2
        "#,
    )
    .bind(&counter.shop)
    .bind(counter.service)
    .bind(counter.total_requests)
    .bind(counter.total_tokens)
    .bind(counter.minute_window_start)
    .bind(counter.minute_requests)
    .bind(counter.minute_tokens)
    .bind(counter.day_window_start)
    .bind(counter.day_requests)
    .bind(counter.day_tokens)
    .bind(counter.last_notified_threshold)
    .bind(counter.updated_at)
    .execute(conn)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

#[async_trait]
impl UsageRepo for PostgresPersistence {
    async fn get(&self, shop: &str, service: ApiService) -> AppResult<Option<UsageCounter>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM usage_counters WHERE shop = $1 AND service = $2",
            SELECT_COLS
        ))
        .bind(shop)
        .bind(service)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row.map(row_to_counter))
    }

    async fn try_consume(
        &self,
        shop: &str,
        service: ApiService,
        limits: &UsageLimits,
        calls: i64,
        tokens: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Result<UsageCounter, LimitViolation>> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;
        let mut counter = lock_counter(&mut tx, shop, service, now).await?;

        if let Err(violation) = counter.apply(limits, calls, tokens, now) {
            // Dropping the transaction rolls back the row insert, if any
            return Ok(Err(violation));
        }

        store_counter(&mut tx, &counter).await?;
        tx.commit().await.map_err(AppError::from)?;
        Ok(Ok(counter))
    }

    async fn release(
        &self,
        shop: &str,
        service: ApiService,
        calls: i64,
        tokens: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Option<UsageCounter>> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;
        let Some(row) = sqlx::query(&format!(
            "SELECT {} FROM usage_counters WHERE shop = $1 AND service = $2 FOR UPDATE",
            SELECT_COLS
        ))
        .bind(shop)
        .bind(service)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?
        else {
            return Ok(None);
        };

        let mut counter = row_to_counter(row);
        counter.release(calls, tokens, now);
        store_counter(&mut tx, &counter).await?;
        tx.commit().await.map_err(AppError::from)?;
        Ok(Some(counter))
    }

    async fn reset_shop(&self, shop: &str, now: DateTime<Utc>) -> AppResult<u64> {
        let mut conn = self.pool().acquire().await.map_err(AppError::from)?;
        reset_counters(&mut conn, shop, now).await
    }

    async fn mark_notified(
        &self,
        shop: &str,
        service: ApiService,
        expected: i32,
        threshold: i32,
    ) -> AppResult<bool> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;
        let mut counter = lock_counter(&mut tx, shop, service, Utc::now()).await?;
        if counter.last_notified_threshold != expected {
            return Ok(false);
        }

        counter.last_notified_threshold = threshold;
        sqlx::query(
            r#"
            UPDATE usage_counters
            SET last_notified_threshold = $3
            WHERE shop = $1 AND service = $2
            "#,
        )
        .bind(shop)
        .bind(service)
        .bind(counter.last_notified_threshold)
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;

        tx.commit().await.map_err(AppError::from)?;
        Ok(true)
    }
}
