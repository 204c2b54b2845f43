//! Shopify Admin GraphQL billing client.
//!
//! Implements [`BillingProviderPort`] with the `appSubscriptionCreate`,
//! `appPurchaseOneTimeCreate` and `appSubscriptionCancel` mutations, using the
//! shop's offline access token.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value as JsonValue, json};
use tracing::{info, instrument, warn};

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::billing_provider::{
            BillingProviderPort, CancelledCharge, ChargeCreated, OneTimeChargeRequest,
            RecurringChargeRequest,
        },
        use_cases::shop::SessionRepo,
    },
};

const SUBSCRIPTION_CREATE: &str = r#"
mutation AppSubscriptionCreate($name: String!, $returnUrl: URL!, $test: Boolean, $lineItems: [AppSubscriptionLineItemInput!]!) {
  appSubscriptionCreate(name: $name, returnUrl: $returnUrl, test: $test, lineItems: $lineItems) {
    appSubscription { id }
    confirmationUrl
    userErrors { field message }
  }
}"#;

const PURCHASE_CREATE: &str = r#"
mutation AppPurchaseOneTimeCreate($name: String!, $price: MoneyInput!, $returnUrl: URL!, $test: Boolean) {
  appPurchaseOneTimeCreate(name: $name, price: $price, returnUrl: $returnUrl, test: $test) {
    appPurchaseOneTime { id }
    confirmationUrl
    userErrors { field message }
  }
}"#;

const SUBSCRIPTION_CANCEL: &str = r#"
mutation AppSubscriptionCancel($id: ID!, $prorate: Boolean) {
  appSubscriptionCancel(id: $id, prorate: $prorate) {
    appSubscription {
      id
      status
      createdAt
      lineItems {
        plan {
          pricingDetails {
            ... on AppRecurringPricing { price { amount } }
          }
        }
      }
    }
    userErrors { field message }
  }
}"#;

// ============================================================================
// Response Shapes
// ============================================================================

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct UserError {
    #[serde(default)]
    field: Option<Vec<String>>,
    message: String,
}

#[derive(Deserialize)]
struct IdNode {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargeCreatePayload {
    #[serde(alias = "appSubscription", alias = "appPurchaseOneTime")]
    charge: Option<IdNode>,
    confirmation_url: Option<String>,
    user_errors: Vec<UserError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionCreateData {
    app_subscription_create: ChargeCreatePayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurchaseCreateData {
    app_purchase_one_time_create: ChargeCreatePayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelledSubscription {
    status: String,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    line_items: Vec<JsonValue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionCancelPayload {
    app_subscription: Option<CancelledSubscription>,
    user_errors: Vec<UserError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionCancelData {
    app_subscription_cancel: SubscriptionCancelPayload,
}

// ============================================================================
// Money
// ============================================================================

/// `2999` -> `"29.99"`.
fn cents_to_decimal(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// `"29.99"` / `"29.9"` / `"29"` -> `2999` / `2990` / `2900`.
fn decimal_to_cents(amount: &str) -> Option<i64> {
    let (whole, frac) = amount.trim().split_once('.').unwrap_or((amount.trim(), ""));
    let whole: i64 = whole.parse().ok()?;
    let frac = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.get(..2)?.parse::<i64>().ok()?,
    };
    Some(whole * 100 + if whole < 0 { -frac } else { frac })
}

fn user_errors_message(errors: &[UserError]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    Some(
        errors
            .iter()
            .map(|e| match &e.field {
                Some(field) => format!("{}: {}", field.join("."), e.message),
                None => e.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; "),
    )
}

// ============================================================================
// Client
// ============================================================================

pub struct ShopifyBillingClient {
    client: Client,
    sessions: Arc<dyn SessionRepo>,
    api_version: String,
    test_charges: bool,
}

impl ShopifyBillingClient {
    pub fn new(
        client: Client,
        sessions: Arc<dyn SessionRepo>,
        api_version: String,
        test_charges: bool,
    ) -> Self {
        Self {
            client,
            sessions,
            api_version,
            test_charges,
        }
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        shop: &str,
        query: &str,
        variables: JsonValue,
    ) -> AppResult<T> {
        let token = self
            .sessions
            .offline_access_token(shop)
            .await?
            .ok_or_else(|| {
                AppError::BillingProvider(format!("no offline access token for {shop}"))
            })?;

        let url = format!("https://{shop}/admin/api/{}/graphql.json", self.api_version);
        let response = self
            .client
            .post(&url)
            .header("X-Shopify-Access-Token", token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| AppError::BillingProvider(e.to_string()))?
            .error_for_status()
            .map_err(|e| AppError::BillingProvider(e.to_string()))?;

        let body: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|e| AppError::BillingProvider(format!("invalid response: {e}")))?;

        if !body.errors.is_empty() {
            let message = body
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AppError::BillingProvider(message));
        }
        body.data
            .ok_or_else(|| AppError::BillingProvider("response carried no data".into()))
    }
}

fn into_created(payload: ChargeCreatePayload) -> AppResult<ChargeCreated> {
    if let Some(message) = user_errors_message(&payload.user_errors) {
        return Err(AppError::BillingProvider(message));
    }
    match (payload.charge, payload.confirmation_url) {
        (Some(charge), Some(confirmation_url)) => Ok(ChargeCreated {
            confirmation_url,
            external_id: charge.id,
        }),
        _ => Err(AppError::BillingProvider(
            "charge created without id or confirmation URL".into(),
        )),
    }
}

#[async_trait]
impl BillingProviderPort for ShopifyBillingClient {
    #[instrument(skip(self, request), fields(shop = %request.shop, plan = %request.plan_name))]
    async fn create_recurring_charge(
        &self,
        request: &RecurringChargeRequest,
    ) -> AppResult<ChargeCreated> {
        let variables = json!({
            "name": request.plan_name.as_ref(),
            "returnUrl": request.return_url,
            "test": self.test_charges,
            "lineItems": [{
                "plan": {
                    "appRecurringPricingDetails": {
                        "price": {
                            "amount": cents_to_decimal(request.price_cents),
                            "currencyCode": request.currency,
                        },
                        "interval": request.interval.as_ref(),
                    }
                }
            }],
        });

        let data: SubscriptionCreateData = self
            .graphql(&request.shop, SUBSCRIPTION_CREATE, variables)
            .await?;
        let created = into_created(data.app_subscription_create)?;
        info!(charge_id = %created.external_id, "Recurring charge created");
        Ok(created)
    }

    #[instrument(skip(self, request), fields(shop = %request.shop))]
    async fn create_one_time_charge(
        &self,
        request: &OneTimeChargeRequest,
    ) -> AppResult<ChargeCreated> {
        let variables = json!({
            "name": request.name,
            "price": {
                "amount": cents_to_decimal(request.price_cents),
                "currencyCode": request.currency,
            },
            "returnUrl": request.return_url,
            "test": self.test_charges,
        });

        let data: PurchaseCreateData = self
            .graphql(&request.shop, PURCHASE_CREATE, variables)
            .await?;
        let created = into_created(data.app_purchase_one_time_create)?;
        info!(charge_id = %created.external_id, "One-time charge created");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn cancel_recurring_charge(
        &self,
        shop: &str,
        external_id: &str,
        prorate: bool,
    ) -> AppResult<CancelledCharge> {
        let data: SubscriptionCancelData = self
            .graphql(
                shop,
                SUBSCRIPTION_CANCEL,
                json!({ "id": external_id, "prorate": prorate }),
            )
            .await?;
        let payload = data.app_subscription_cancel;
        if let Some(message) = user_errors_message(&payload.user_errors) {
            return Err(AppError::BillingProvider(message));
        }
        let sub = payload.app_subscription.ok_or_else(|| {
            AppError::BillingProvider("cancel returned no subscription".into())
        })?;

        let price_cents = sub
            .line_items
            .first()
            .and_then(|item| item.pointer("/plan/pricingDetails/price/amount"))
            .and_then(JsonValue::as_str)
            .and_then(decimal_to_cents);
        if price_cents.is_none() {
            warn!(external_id, "Cancelled charge carried no readable price");
        }

        Ok(CancelledCharge {
            status: sub.status,
            created_at: sub.created_at,
            updated_at: Some(Utc::now()),
            price_cents,
        })
    }
}
