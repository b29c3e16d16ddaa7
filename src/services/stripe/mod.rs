// async-stripe is compiled with a minimal feature set (runtime-tokio-hyper, checkout,
// webhook-events, connect). Touching APIs outside those features requires updating
// Cargo.toml explicitly.
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::stripe_signature::SignatureError;

#[derive(Debug, thiserror::Error)]
pub enum StripeServiceError {
    #[error("stripe api error: {0}")]
    Api(String),
    #[error("webhook verification failed: {0}")]
    Webhook(#[from] SignatureError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("stripe call timed out: {0}")]
    Timeout(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("other error: {0}")]
    Other(String),
}

impl From<stripe::StripeError> for StripeServiceError {
    fn from(err: stripe::StripeError) -> Self {
        StripeServiceError::Api(err.to_string())
    }
}

impl From<stripe::WebhookError> for StripeServiceError {
    fn from(err: stripe::WebhookError) -> Self {
        let reason = match err {
            stripe::WebhookError::BadTimestamp(_) => SignatureError::Expired,
            stripe::WebhookError::BadHeader(_) => SignatureError::InvalidTimestamp,
            stripe::WebhookError::BadParse(e) => return StripeServiceError::Serde(e.to_string()),
            _ => SignatureError::Mismatch,
        };
        StripeServiceError::Webhook(reason)
    }
}

impl From<serde_json::Error> for StripeServiceError {
    fn from(err: serde_json::Error) -> Self {
        StripeServiceError::Serde(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    Payment,
    Subscription,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutLineItem {
    pub price: String,
    pub quantity: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateCheckoutSessionRequest {
    pub success_url: String,
    pub cancel_url: String,
    pub mode: CheckoutMode,
    pub line_items: Vec<CheckoutLineItem>,
    pub client_reference_id: Option<String>,
    pub customer: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

/// A verified webhook event. `payload` is the full event body
/// (`{ id, type, data: { object } }`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    pub r#type: String,
    pub payload: serde_json::Value,
}

impl StripeEvent {
    pub fn object(&self) -> &serde_json::Value {
        self.payload
            .get("data")
            .and_then(|d| d.get("object"))
            .unwrap_or(&serde_json::Value::Null)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub status: String,
    /// Unix timestamp (seconds) when the current period ends
    pub current_period_end: i64,
    /// Unix timestamp (seconds) when the subscription will cancel, if set
    pub cancel_at: Option<i64>,
    pub cancel_at_period_end: bool,
}

/// Every call is a single attempt bounded by the configured timeout.
#[async_trait]
pub trait StripeService: Send + Sync {
    async fn create_customer(
        &self,
        email: &str,
        name: Option<&str>,
        user_id: &str,
    ) -> Result<String, StripeServiceError>;

    async fn update_customer_email(
        &self,
        customer_id: &str,
        email: &str,
    ) -> Result<(), StripeServiceError>;

    async fn create_checkout_session(
        &self,
        req: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeServiceError>;

    /// Raw session JSON, with line items expanded.
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<serde_json::Value, StripeServiceError>;

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<serde_json::Value, StripeServiceError>;

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError>;

    async fn set_subscription_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<SubscriptionInfo, StripeServiceError>;

    async fn cancel_subscription_immediately(
        &self,
        subscription_id: &str,
    ) -> Result<(), StripeServiceError>;
}

/// Turns a raw (already authenticated) webhook body into an event.
pub(crate) fn parse_event(payload: &[u8]) -> Result<StripeEvent, StripeServiceError> {
    let val: serde_json::Value = serde_json::from_slice(payload)?;
    let id = val
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StripeServiceError::Serde("event is missing an id".into()))?
        .to_string();
    let ty = val
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    Ok(StripeEvent {
        id,
        r#type: ty,
        payload: val,
    })
}

mod live;
mod mock;

pub use live::LiveStripeService;
pub use mock::MockStripeService;
