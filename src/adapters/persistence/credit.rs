use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::{
    adapters::persistence::{PostgresPersistence, is_unique_violation, payment::insert_payment},
    app_error::{AppError, AppResult},
    application::use_cases::credits::CreditRepo,
    domain::entities::{
        credit::{CreditPackage, CreditPurchase, NewCreditPurchase},
        payment::NewPayment,
        payment_status::PaymentStatus,
    },
};

const PURCHASE_COLS: &str = r#"
    id, shop, package_id, shopify_charge_id, credits, price_cents, currency,
    store_credit_applied_cents, status, created_at, updated_at
"#;

fn row_to_package(row: sqlx::postgres::PgRow) -> CreditPackage {
    CreditPackage {
        id: row.get("id"),
        name: row.get("name"),
        credits: row.get("credits"),
        price_cents: row.get("price_cents"),
        currency: row.get("currency"),
        active: row.get("active"),
    }
}

fn row_to_purchase(row: sqlx::postgres::PgRow) -> CreditPurchase {
    CreditPurchase {
        id: row.get("id"),
        shop: row.get("shop"),
        package_id: row.get("package_id"),
        shopify_charge_id: row.get("shopify_charge_id"),
        credits: row.get("credits"),
        price_cents: row.get("price_cents"),
        currency: row.get("currency"),
        store_credit_applied_cents: row.get("store_credit_applied_cents"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// PENDING -> `status` for the purchase and its pending payment rows.
async fn settle(
    conn: &mut PgConnection,
    id: Uuid,
    status: PaymentStatus,
    now: DateTime<Utc>,
) -> AppResult<Option<CreditPurchase>> {
    let Some(row) = sqlx::query(&format!(
        r#"
        UPDATE credit_purchases
        SET status = $2, updated_at = $3
        WHERE id = $1 AND status = $4
        RETURNING {}
        "#,
        PURCHASE_COLS
    ))
    .bind(id)
    .bind(status)
    .bind(now)
    .bind(PaymentStatus::Pending)
    .fetch_optional(&mut *conn)
    .await
    .map_err(AppError::from)?
    else {
        return Ok(None);
    };
    let purchase = row_to_purchase(row);

    let transaction_id =
        (status == PaymentStatus::Succeeded).then(|| purchase.shopify_charge_id.clone());
    sqlx::query(
        r#"
        UPDATE payments
        SET status = $2, updated_at = $3, transaction_id = COALESCE($4, transaction_id)
        WHERE credit_purchase_id = $1 AND status = $5
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(now)
    .bind(transaction_id)
    .bind(PaymentStatus::Pending)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;

    Ok(Some(purchase))
}

#[async_trait]
impl CreditRepo for PostgresPersistence {
    async fn get_package(&self, id: Uuid) -> AppResult<Option<CreditPackage>> {
        let row = sqlx::query(
            "SELECT id, name, credits, price_cents, currency, active FROM credit_packages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row.map(row_to_package))
    }

    async fn list_active_packages(&self) -> AppResult<Vec<CreditPackage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, credits, price_cents, currency, active
            FROM credit_packages
            WHERE active
            ORDER BY price_cents
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(rows.into_iter().map(row_to_package).collect())
    }

    async fn create_purchase(&self, new: NewCreditPurchase) -> AppResult<CreditPurchase> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;

        let balance: i64 = sqlx::query(
            "SELECT store_credit_cents FROM shops WHERE domain = $1 FOR UPDATE",
        )
        .bind(&new.shop)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?
        .map(|row| row.get::<i64, _>("store_credit_cents"))
        .ok_or(AppError::NotFound)?;
        if balance < new.store_credit_applied_cents {
            return Err(AppError::InvalidInput("store credit balance changed".into()));
        }

        if new.store_credit_applied_cents > 0 {
            sqlx::query(
                "UPDATE shops SET store_credit_cents = store_credit_cents - $2 WHERE domain = $1",
            )
            .bind(&new.shop)
            .bind(new.store_credit_applied_cents)
            .execute(&mut *tx)
            .await
            .map_err(AppError::from)?;
        }

        let now = Utc::now();
        let purchase = new.into_pending(now);
        let inserted = sqlx::query(
            r#"
            INSERT INTO credit_purchases (
                id, shop, package_id, shopify_charge_id, credits, price_cents, currency,
                store_credit_applied_cents, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(purchase.id)
        .bind(&purchase.shop)
        .bind(purchase.package_id)
        .bind(&purchase.shopify_charge_id)
        .bind(purchase.credits)
        .bind(purchase.price_cents)
        .bind(&purchase.currency)
        .bind(purchase.store_credit_applied_cents)
        .bind(purchase.status)
        .bind(purchase.created_at)
        .bind(purchase.updated_at)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(AppError::DuplicateCharge(purchase.shopify_charge_id));
            }
            Err(e) => return Err(e.into()),
        }

        let payment = NewPayment {
            shop: purchase.shop.clone(),
            subscription_id: None,
            credit_purchase_id: Some(purchase.id),
            amount_cents: purchase.price_cents,
            currency: purchase.currency.clone(),
            status: PaymentStatus::Pending,
            billing_period_start: None,
            billing_period_end: None,
            transaction_id: None,
        }
        .into_payment(now);
        insert_payment(&mut tx, &payment).await?;

        tx.commit().await.map_err(AppError::from)?;
        Ok(purchase)
    }

    async fn get_purchase_by_charge_id(&self, charge_id: &str) -> AppResult<Option<CreditPurchase>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM credit_purchases WHERE shopify_charge_id = $1",
            PURCHASE_COLS
        ))
        .bind(charge_id)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row.map(row_to_purchase))
    }

    async fn complete_purchase(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<CreditPurchase>> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;
        let Some(purchase) = settle(&mut tx, id, PaymentStatus::Succeeded, now).await? else {
            return Ok(None);
        };

        sqlx::query("UPDATE shops SET content_credits = content_credits + $2 WHERE domain = $1")
            .bind(&purchase.shop)
            .bind(purchase.credits)
            .execute(&mut *tx)
            .await
            .map_err(AppError::from)?;

        tx.commit().await.map_err(AppError::from)?;
        Ok(Some(purchase))
    }

    async fn fail_purchase(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<Option<CreditPurchase>> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;
        let Some(purchase) = settle(&mut tx, id, PaymentStatus::Failed, now).await? else {
            return Ok(None);
        };

        if purchase.store_credit_applied_cents > 0 {
            sqlx::query(
                "UPDATE shops SET store_credit_cents = store_credit_cents + $2 WHERE domain = $1",
            )
            .bind(&purchase.shop)
            .bind(purchase.store_credit_applied_cents)
            .execute(&mut *tx)
            .await
            .map_err(AppError::from)?;
        }

        tx.commit().await.map_err(AppError::from)?;
        Ok(Some(purchase))
    }
}
