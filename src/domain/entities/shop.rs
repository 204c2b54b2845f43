use chrono::{DateTime, Utc};
use serde::Serialize;

/// A merchant installation, keyed by its `*.myshopify.com` domain.
#[derive(Debug, Clone, Serialize)]
pub struct Shop {
    pub domain: String,
    pub email: Option<String>,
    pub early_adopter: bool,
    /// Proration credit applied to future purchases
    pub store_credit_cents: i64,
    /// Credits bought through credit packages
    pub content_credits: i64,
    pub installed_at: DateTime<Utc>,
    pub uninstalled_at: Option<DateTime<Utc>>,
}

impl Shop {
    pub fn is_installed(&self) -> bool {
        self.uninstalled_at.is_none()
    }
}
