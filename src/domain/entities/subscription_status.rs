use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Lifecycle of a shop's recurring app subscription.
///
/// Values match the statuses Shopify reports for `AppSubscription`, so provider
/// statuses map onto this enum 1:1.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "subscription_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum SubscriptionStatus {
    /// Charge created, waiting for the merchant to approve it
    Pending,
    Active,
    #[strum(to_string = "CANCELLED", serialize = "CANCELED")]
    Cancelled,
    Declined,
    Expired,
    /// Billing paused by Shopify (e.g. store frozen for non-payment)
    Frozen,
}

impl SubscriptionStatus {
    /// Valid transitions from this status
    pub fn valid_transitions(&self) -> &'static [SubscriptionStatus] {
        use SubscriptionStatus::*;
        match self {
            Pending => &[Active, Declined, Expired],
            Active => &[Cancelled, Declined, Expired, Frozen],
            Frozen => &[Active, Cancelled, Expired],
            Cancelled | Declined | Expired => &[],
        }
    }

    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Terminal rows are kept for history and never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Declined | SubscriptionStatus::Expired
        )
    }

    /// Whether the merchant may still be cancelled by request (ACTIVE or FROZEN).
    pub fn is_cancellable(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Frozen)
    }

    /// Map a Shopify `AppSubscriptionStatus` string onto the local enum.
    ///
    /// Returns `None` for values we don't track (e.g. `ACCEPTED`, which Shopify
    /// only reports transiently before `ACTIVE`).
    pub fn from_provider(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}
