use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgConnection, Row, types::Json};
use uuid::Uuid;

use crate::{
    adapters::persistence::{
        PostgresPersistence, is_unique_violation, parse_json_with_fallback,
        payment::insert_payment, usage_counter::reset_counters,
    },
    app_error::{AppError, AppResult},
    application::use_cases::subscription::{
        Activation, Cancellation, SUPERSEDED_CANCEL_REASON, SubscriptionRepo,
    },
    domain::entities::{
        payment::NewPayment,
        subscription::{CycleAdvance, NewSubscription, Subscription},
        subscription_status::SubscriptionStatus,
    },
};

const SELECT_COLS: &str = r#"
    id, shop, plan_id, plan_name, status, shopify_charge_id, cycle_start,
    cycle_end, price_cents, currency, interval, applied_discount,
    cancel_reason, cancelled_at, proration_credit_cents, created_at, updated_at
"#;

fn row_to_subscription(row: sqlx::postgres::PgRow) -> Subscription {
    let id: Uuid = row.get("id");
    Subscription {
        id,
        shop: row.get("shop"),
        plan_id: row.get("plan_id"),
        plan_name: row.get("plan_name"),
        status: row.get("status"),
        shopify_charge_id: row.get("shopify_charge_id"),
        cycle_start: row.get("cycle_start"),
        cycle_end: row.get("cycle_end"),
        price_cents: row.get("price_cents"),
        currency: row.get("currency"),
        interval: row.get("interval"),
        applied_discount: parse_json_with_fallback(
            &row.get::<Option<JsonValue>, _>("applied_discount").unwrap_or_default(),
            "applied_discount",
            "subscription",
            &id.to_string(),
        ),
        cancel_reason: row.get("cancel_reason"),
        cancelled_at: row.get("cancelled_at"),
        proration_credit_cents: row.get("proration_credit_cents"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

async fn shop_of(conn: &mut PgConnection, id: Uuid) -> AppResult<Option<String>> {
    let row = sqlx::query("SELECT shop FROM subscriptions WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from)?;
    Ok(row.map(|r| r.get("shop")))
}

/// Row lock on the shop. Writers that change more than one of the shop's
/// subscriptions take it first.
async fn lock_shop(conn: &mut PgConnection, shop: &str) -> AppResult<()> {
    sqlx::query("SELECT 1 FROM shops WHERE domain = $1 FOR UPDATE")
        .bind(shop)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

#[async_trait]
impl SubscriptionRepo for PostgresPersistence {
    async fn insert_pending(&self, new: NewSubscription) -> AppResult<Subscription> {
        let sub = new.into_pending(Utc::now());
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO subscriptions (
                id, shop, plan_id, plan_name, status, shopify_charge_id,
                price_cents, currency, interval, applied_discount, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(sub.id)
        .bind(&sub.shop)
        .bind(sub.plan_id)
        .bind(sub.plan_name)
        .bind(sub.status)
        .bind(&sub.shopify_charge_id)
        .bind(sub.price_cents)
        .bind(&sub.currency)
        .bind(sub.interval)
        .bind(sub.applied_discount.map(Json))
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .fetch_one(self.pool())
        .await;

        match result {
            Ok(row) => Ok(row_to_subscription(row)),
            Err(e) if is_unique_violation(&e) => Err(AppError::DuplicateCharge(sub.shopify_charge_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!("SELECT {} FROM subscriptions WHERE id = $1", SELECT_COLS))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(AppError::from)?;
        Ok(row.map(row_to_subscription))
    }

    async fn get_by_charge_id(&self, charge_id: &str) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE shopify_charge_id = $1",
            SELECT_COLS
        ))
        .bind(charge_id)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row.map(row_to_subscription))
    }

    async fn get_active_for_shop(&self, shop: &str) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE shop = $1 AND status = $2",
            SELECT_COLS
        ))
        .bind(shop)
        .bind(SubscriptionStatus::Active)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row.map(row_to_subscription))
    }

    async fn list_for_shop(&self, shop: &str) -> AppResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE shop = $1 ORDER BY created_at DESC",
            SELECT_COLS
        ))
        .bind(shop)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(rows.into_iter().map(row_to_subscription).collect())
    }

    async fn activate(&self, id: Uuid, activation: Activation) -> AppResult<Option<Subscription>> {
        let now = activation.now;
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;

        let Some(shop) = shop_of(&mut tx, id).await? else {
            return Ok(None);
        };

        // Same-shop activations run one at a time, so the supersede below sees
        // any ACTIVE row committed ahead of this one
        lock_shop(&mut tx, &shop).await?;

        let pending =
            sqlx::query("SELECT 1 FROM subscriptions WHERE id = $1 AND status = $2 FOR UPDATE")
                .bind(id)
                .bind(SubscriptionStatus::Pending)
                .fetch_optional(&mut *tx)
                .await
                .map_err(AppError::from)?;
        if pending.is_none() {
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $3, cancel_reason = $4, cancelled_at = $5, updated_at = $5
            WHERE shop = $1 AND id <> $2 AND status = $6
            "#,
        )
        .bind(&shop)
        .bind(id)
        .bind(SubscriptionStatus::Cancelled)
        .bind(SUPERSEDED_CANCEL_REASON)
        .bind(now)
        .bind(SubscriptionStatus::Active)
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE subscriptions
            SET status = $2, cycle_start = $3, cycle_end = $4, updated_at = $5
            WHERE id = $1
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(id)
        .bind(SubscriptionStatus::Active)
        .bind(activation.cycle_start)
        .bind(activation.cycle_end)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::from)?;

        insert_payment(&mut tx, &activation.initial_payment.into_payment(now)).await?;

        tx.commit().await.map_err(AppError::from)?;
        Ok(Some(row_to_subscription(row)))
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE subscriptions
            SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row.map(row_to_subscription))
    }

    async fn cancel(
        &self,
        id: Uuid,
        expected: SubscriptionStatus,
        cancellation: Cancellation,
    ) -> AppResult<Option<Subscription>> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;

        // Take the shop row before the subscription row, in the same order as
        // `activate`, when the credit below will touch it
        if cancellation.proration_credit_cents > 0 {
            let Some(shop) = shop_of(&mut tx, id).await? else {
                return Ok(None);
            };
            lock_shop(&mut tx, &shop).await?;
        }

        let Some(row) = sqlx::query(&format!(
            r#"
            UPDATE subscriptions
            SET status = $3, cancel_reason = $4, cancelled_at = $5,
                proration_credit_cents = $6, updated_at = $5
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(id)
        .bind(expected)
        .bind(SubscriptionStatus::Cancelled)
        .bind(&cancellation.reason)
        .bind(cancellation.now)
        .bind(cancellation.proration_credit_cents)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?
        else {
            return Ok(None);
        };
        let cancelled = row_to_subscription(row);

        if cancellation.proration_credit_cents > 0 {
            sqlx::query(
                "UPDATE shops SET store_credit_cents = store_credit_cents + $2 WHERE domain = $1",
            )
            .bind(&cancelled.shop)
            .bind(cancellation.proration_credit_cents)
            .execute(&mut *tx)
            .await
            .map_err(AppError::from)?;
        }

        tx.commit().await.map_err(AppError::from)?;
        Ok(Some(cancelled))
    }

    async fn advance_cycle(
        &self,
        id: Uuid,
        advance: CycleAdvance,
        renewal: NewPayment,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET cycle_start = $4, cycle_end = $5, price_cents = $6,
                applied_discount = $7, updated_at = $8
            WHERE id = $1 AND status = $2 AND cycle_end = $3
            "#,
        )
        .bind(id)
        .bind(SubscriptionStatus::Active)
        .bind(advance.expected_cycle_end)
        .bind(advance.new_cycle_start)
        .bind(advance.new_cycle_end)
        .bind(advance.price_cents)
        .bind(advance.applied_discount.map(Json))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        reset_counters(&mut tx, &renewal.shop, now).await?;
        insert_payment(&mut tx, &renewal.into_payment(now)).await?;
        tx.commit().await.map_err(AppError::from)?;
        Ok(true)
    }

    async fn cancel_all_for_shop(
        &self,
        shop: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, cancel_reason = $3, cancelled_at = $4, updated_at = $4
            WHERE shop = $1 AND status NOT IN ('CANCELLED', 'DECLINED', 'EXPIRED')
            "#,
        )
        .bind(shop)
        .bind(SubscriptionStatus::Cancelled)
        .bind(reason)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(result.rows_affected())
    }

    async fn list_due_for_renewal(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT shop FROM subscriptions
            WHERE status = $1 AND cycle_end <= $2
            ORDER BY cycle_end
            LIMIT $3
            "#,
        )
        .bind(SubscriptionStatus::Active)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(rows.into_iter().map(|r| r.get("shop")).collect())
    }
}
