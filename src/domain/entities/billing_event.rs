use serde::Serialize;
use strum::{AsRefStr, Display};

/// Next write the embedded UI should perform for a billing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingEvent {
    Subscribe,
    Update,
    Renew,
    Cancel,
}
