use serde::{Deserialize, Serialize};

/// Payment status shared by subscription charges and credit purchases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }

    /// Convert from a Shopify one-time purchase status string.
    ///
    /// `ACTIVE` is Shopify's word for a paid one-time purchase. Unknown or
    /// in-flight values (`PENDING`, `ACCEPTED`) stay pending.
    pub fn from_shopify_purchase_status(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => PaymentStatus::Succeeded,
            "DECLINED" | "EXPIRED" | "CANCELLED" | "CANCELED" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        }
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, PaymentStatus::Succeeded)
    }

    /// Valid transitions: PENDING -> SUCCEEDED | FAILED, SUCCEEDED -> REFUNDED
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Succeeded)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
                | (PaymentStatus::Succeeded, PaymentStatus::Refunded)
        )
    }

    /// Check if this status is terminal (should not be overwritten by webhooks)
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Refunded)
    }
}

impl Default for PaymentStatus {
    fn default() -> Self {
        PaymentStatus::Pending
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(PaymentStatus::Pending),
            "SUCCEEDED" => Ok(PaymentStatus::Succeeded),
            "FAILED" => Ok(PaymentStatus::Failed),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            _ => Err(format!("Invalid payment status: {}", s)),
        }
    }
}
