use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::user::SubscriptionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionSource {
    Webhook,
    Checkout,
    Sweep,
    Cancellation,
    Gate,
}

impl TransitionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionSource::Webhook => "webhook",
            TransitionSource::Checkout => "checkout",
            TransitionSource::Sweep => "sweep",
            TransitionSource::Cancellation => "cancellation",
            TransitionSource::Gate => "gate",
        }
    }
}

/// One row of the billing audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubscriptionTransition {
    pub user_id: Uuid,
    pub source: TransitionSource,
    pub event_id: Option<String>,
    pub from_status: SubscriptionStatus,
    pub to_status: SubscriptionStatus,
    pub subscription_id: Option<String>,
    pub note: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
