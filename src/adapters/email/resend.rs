use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::info;

use crate::{
    app_error::{AppError, AppResult},
    application::ports::notifier::UsageNotifier,
    domain::entities::usage::ApiService,
};

#[derive(Clone)]
pub struct ResendUsageNotifier {
    client: Client,
    api_key: SecretString,
    from: String,
}

impl ResendUsageNotifier {
    pub fn new(client: Client, api_key: SecretString, from: String) -> Self {
        Self {
            client,
            api_key,
            from,
        }
    }
}

#[derive(Serialize)]
struct ResendReq<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

fn service_label(service: ApiService) -> &'static str {
    match service {
        ApiService::Ai => "AI generation",
        ApiService::Crawl => "store crawl",
    }
}

fn usage_email(shop: &str, service: ApiService, threshold: i32) -> (String, String) {
    let label = service_label(service);
    if threshold >= 100 {
        (
            format!("You have used all of your {label} quota"),
            format!(
                "<p>{shop} has used 100% of this billing cycle's {label} quota. \
                 Further requests are paused until the cycle renews or you upgrade your plan.</p>"
            ),
        )
    } else {
        (
            format!("You have used {threshold}% of your {label} quota"),
            format!(
                "<p>{shop} has used {threshold}% of this billing cycle's {label} quota. \
                 Consider upgrading your plan to avoid interruptions.</p>"
            ),
        )
    }
}

#[async_trait]
impl UsageNotifier for ResendUsageNotifier {
    async fn notify(
        &self,
        shop: &str,
        email: &str,
        service: ApiService,
        threshold: i32,
    ) -> AppResult<()> {
        let (subject, html) = usage_email(shop, service, threshold);
        let body = ResendReq {
            from: &self.from,
            to: [email],
            subject: &subject,
            html: &html,
        };
        self.client
            .post("https://api.resend.com/emails")
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .error_for_status()
            .map_err(|e| AppError::Internal(e.to_string()))?;

        info!(shop, service = %service, threshold, "Usage notification sent");
        Ok(())
    }
}
