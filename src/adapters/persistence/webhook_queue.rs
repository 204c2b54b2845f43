use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::{PostgresPersistence, is_unique_violation},
    app_error::{AppError, AppResult},
    application::use_cases::webhook_queue::{StaleRelease, WebhookQueueRepo},
    domain::entities::webhook::{NewWebhookQueueItem, QueueItemStatus, WebhookQueueItem},
};

const SELECT_COLS: &str = r#"
    id, topic, shop, payload, idempotency_key, status, attempts,
    next_attempt_at, locked_at, created_at, processed_at, error
"#;

const STALE_ERROR: &str = "processing timed out";

fn row_to_item(row: sqlx::postgres::PgRow) -> WebhookQueueItem {
    WebhookQueueItem {
        id: row.get("id"),
        topic: row.get("topic"),
        shop: row.get("shop"),
        payload: row.get("payload"),
        idempotency_key: row.get("idempotency_key"),
        status: row.get("status"),
        attempts: row.get("attempts"),
        next_attempt_at: row.get("next_attempt_at"),
        locked_at: row.get("locked_at"),
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
        error: row.get("error"),
    }
}

#[async_trait]
impl WebhookQueueRepo for PostgresPersistence {
    async fn insert_or_get(
        &self,
        new: NewWebhookQueueItem,
        now: DateTime<Utc>,
    ) -> AppResult<(WebhookQueueItem, bool)> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO webhook_queue (
                id, topic, shop, payload, idempotency_key, status,
                next_attempt_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (topic, shop, idempotency_key) WHERE status <> 'failed' DO NOTHING
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(Uuid::new_v4())
        .bind(new.topic)
        .bind(&new.shop)
        .bind(&new.payload)
        .bind(&new.idempotency_key)
        .bind(QueueItemStatus::Pending)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;

        if let Some(row) = inserted {
            return Ok((row_to_item(row), true));
        }

        let existing = sqlx::query(&format!(
            r#"
            SELECT {} FROM webhook_queue
            WHERE topic = $1 AND shop = $2 AND idempotency_key = $3 AND status <> 'failed'
            "#,
            SELECT_COLS
        ))
        .bind(new.topic)
        .bind(&new.shop)
        .bind(&new.idempotency_key)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| {
            AppError::Internal("webhook conflicted with an item that is no longer live".into())
        })?;
        Ok((row_to_item(existing), false))
    }

    async fn claim_due(&self, limit: i64, now: DateTime<Utc>) -> AppResult<Vec<WebhookQueueItem>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE webhook_queue
            SET status = 'processing', locked_at = $2
            WHERE id IN (
                SELECT id FROM webhook_queue
                WHERE status = 'pending' AND next_attempt_at <= $2
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(limit)
        .bind(now)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        let mut items: Vec<_> = rows.into_iter().map(row_to_item).collect();
        // RETURNING does not keep the subquery order
        items.sort_by_key(|i| i.created_at);
        Ok(items)
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_queue
            SET status = 'completed', attempts = attempts + 1, processed_at = $3,
                locked_at = NULL, error = NULL
            WHERE id = $1 AND status = 'processing' AND locked_at = $2
            "#,
        )
        .bind(id)
        .bind(claimed_at)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_queue
            SET status = 'pending', attempts = attempts + 1, next_attempt_at = $3,
                locked_at = NULL, error = $4
            WHERE id = $1 AND status = 'processing' AND locked_at = $2
            "#,
        )
        .bind(id)
        .bind(claimed_at)
        .bind(next_attempt_at)
        .bind(error)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_queue
            SET status = 'failed', attempts = attempts + 1, processed_at = $4,
                locked_at = NULL, error = $3
            WHERE id = $1 AND status = 'processing' AND locked_at = $2
            "#,
        )
        .bind(id)
        .bind(claimed_at)
        .bind(error)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_stale(
        &self,
        locked_before: DateTime<Utc>,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> AppResult<StaleRelease> {
        let rows = sqlx::query(
            r#"
            UPDATE webhook_queue
            SET attempts = attempts + 1,
                locked_at = NULL,
                error = $4,
                status = CASE WHEN attempts + 1 >= $2
                    THEN 'failed'::webhook_queue_status
                    ELSE 'pending'::webhook_queue_status END,
                processed_at = CASE WHEN attempts + 1 >= $2 THEN $3 ELSE processed_at END,
                next_attempt_at = CASE WHEN attempts + 1 >= $2 THEN next_attempt_at ELSE $3 END
            WHERE status = 'processing' AND locked_at < $1
            RETURNING status
            "#,
        )
        .bind(locked_before)
        .bind(max_attempts)
        .bind(now)
        .bind(STALE_ERROR)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        let mut released = StaleRelease::default();
        for row in rows {
            match row.get::<QueueItemStatus, _>("status") {
                QueueItemStatus::Failed => released.failed += 1,
                _ => released.requeued += 1,
            }
        }
        Ok(released)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<WebhookQueueItem>> {
        let row = sqlx::query(&format!("SELECT {} FROM webhook_queue WHERE id = $1", SELECT_COLS))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(AppError::from)?;
        Ok(row.map(row_to_item))
    }

    async fn list_failed(&self, limit: i64) -> AppResult<Vec<WebhookQueueItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM webhook_queue
            WHERE status = 'failed'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
            SELECT_COLS
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(rows.into_iter().map(row_to_item).collect())
    }

    async fn reset_for_replay(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<WebhookQueueItem>> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE webhook_queue
            SET status = 'pending', attempts = 0, next_attempt_at = $2,
                processed_at = NULL, error = NULL
            WHERE id = $1 AND status = 'failed'
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(self.pool())
        .await;

        match result {
            Ok(row) => Ok(row.map(row_to_item)),
            // The dedup index already holds a live delivery of the same event
            Err(e) if is_unique_violation(&e) => Err(AppError::InvalidInput(
                "a newer delivery of this event is already queued".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_queue
            WHERE status IN ('completed', 'failed') AND processed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(result.rows_affected())
    }
}
