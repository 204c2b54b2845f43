use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::subscription::PaymentRepo,
    domain::entities::{
        payment::{NewPayment, Payment},
        payment_status::PaymentStatus,
    },
};

const SELECT_COLS: &str = r#"
    id, shop, subscription_id, credit_purchase_id, amount_cents, currency,
    status, billing_period_start, billing_period_end, transaction_id,
    refund_of, created_at, updated_at
"#;

fn row_to_payment(row: sqlx::postgres::PgRow) -> Payment {
    Payment {
        id: row.get("id"),
        shop: row.get("shop"),
        subscription_id: row.get("subscription_id"),
        credit_purchase_id: row.get("credit_purchase_id"),
        amount_cents: row.get("amount_cents"),
        currency: row.get("currency"),
        status: row.get("status"),
        billing_period_start: row.get("billing_period_start"),
        billing_period_end: row.get("billing_period_end"),
        transaction_id: row.get("transaction_id"),
        refund_of: row.get("refund_of"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Insert a payment row on an open connection, usually inside the
/// transaction that changed the subscription or purchase it belongs to.
pub(crate) async fn insert_payment(
    conn: &mut PgConnection,
    payment: &Payment,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO payments (
            id, shop, subscription_id, credit_purchase_id, amount_cents, currency,
            status, billing_period_start, billing_period_end, transaction_id,
            refund_of, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(payment.id)
    .bind(&payment.shop)
    .bind(payment.subscription_id)
    .bind(payment.credit_purchase_id)
    .bind(payment.amount_cents)
    .bind(&payment.currency)
    .bind(payment.status)
    .bind(payment.billing_period_start)
    .bind(payment.billing_period_end)
    .bind(&payment.transaction_id)
    .bind(payment.refund_of)
    .bind(payment.created_at)
    .bind(payment.updated_at)
    .execute(conn)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

#[async_trait]
impl PaymentRepo for PostgresPersistence {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Payment>> {
        let row = sqlx::query(&format!("SELECT {} FROM payments WHERE id = $1", SELECT_COLS))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(AppError::from)?;
        Ok(row.map(row_to_payment))
    }

    async fn list_for_subscription(&self, subscription_id: Uuid) -> AppResult<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payments WHERE subscription_id = $1 ORDER BY created_at",
            SELECT_COLS
        ))
        .bind(subscription_id)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(rows.into_iter().map(row_to_payment).collect())
    }

    async fn list_for_shop(&self, shop: &str) -> AppResult<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payments WHERE shop = $1 ORDER BY created_at",
            SELECT_COLS
        ))
        .bind(shop)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(rows.into_iter().map(row_to_payment).collect())
    }

    async fn refund(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Option<(Payment, Payment)>> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;

        let Some(row) = sqlx::query(&format!(
            r#"
            UPDATE payments
            SET status = $2, updated_at = $3
            WHERE id = $1 AND status = $4 AND refund_of IS NULL
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(id)
        .bind(PaymentStatus::Refunded)
        .bind(now)
        .bind(PaymentStatus::Succeeded)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?
        else {
            return Ok(None);
        };
        let original = row_to_payment(row);

        let mut compensation = NewPayment {
            shop: original.shop.clone(),
            subscription_id: original.subscription_id,
            credit_purchase_id: original.credit_purchase_id,
            amount_cents: -original.amount_cents,
            currency: original.currency.clone(),
            status: PaymentStatus::Succeeded,
            billing_period_start: original.billing_period_start,
            billing_period_end: original.billing_period_end,
            transaction_id: original.transaction_id.as_ref().map(|t| format!("{t}:refund")),
        }
        .into_payment(now);
        compensation.refund_of = Some(original.id);
        insert_payment(&mut tx, &compensation).await?;

        tx.commit().await.map_err(AppError::from)?;
        Ok(Some((original, compensation)))
    }
}
