use super::{
    parse_event, CheckoutSession, CreateCheckoutSessionRequest, StripeEvent, StripeService,
    StripeServiceError, SubscriptionInfo,
};
use crate::utils::stripe_signature::{verify_signature, DEFAULT_TOLERANCE_SECS};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Test double. Calls are captured; failures are opt-in through the
/// `with_*` builders. Without a webhook secret every signature is accepted.
#[derive(Clone, Default)]
pub struct MockStripeService {
    pub created_customers: Arc<Mutex<Vec<(String, String)>>>,
    pub customer_email_updates: Arc<Mutex<Vec<(String, String)>>>,
    pub created_sessions: Arc<Mutex<Vec<CheckoutSession>>>,
    pub last_create_requests: Arc<Mutex<Vec<CreateCheckoutSessionRequest>>>,
    pub sessions: Arc<Mutex<HashMap<String, Value>>>,
    pub subscriptions: Arc<Mutex<HashMap<String, Value>>>,
    pub cancel_at_period_end_calls: Arc<Mutex<Vec<(String, bool)>>>,
    pub cancel_attempts: Arc<Mutex<Vec<String>>>,
    pub fail_cancel: bool,
    pub fail_customer_update: bool,
    pub checkout_error: Option<String>,
    pub webhook_secret: Option<String>,
}

impl MockStripeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_webhook_secret(mut self, secret: &str) -> Self {
        self.webhook_secret = Some(secret.to_string());
        self
    }

    pub fn with_failing_cancel(mut self) -> Self {
        self.fail_cancel = true;
        self
    }

    pub fn with_failing_customer_update(mut self) -> Self {
        self.fail_customer_update = true;
        self
    }

    pub fn with_checkout_error(mut self, message: &str) -> Self {
        self.checkout_error = Some(message.to_string());
        self
    }

    pub fn with_session(self, session: Value) -> Self {
        if let Some(id) = session.get("id").and_then(|v| v.as_str()) {
            self.sessions
                .lock()
                .unwrap()
                .insert(id.to_string(), session.clone());
        }
        self
    }

    pub fn with_subscription(self, subscription: Value) -> Self {
        if let Some(id) = subscription.get("id").and_then(|v| v.as_str()) {
            self.subscriptions
                .lock()
                .unwrap()
                .insert(id.to_string(), subscription.clone());
        }
        self
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancel_attempts.lock().unwrap().clone()
    }
}

fn make_id(prefix: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{}_{}_{}", prefix, ts, NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

#[async_trait]
impl StripeService for MockStripeService {
    async fn create_customer(
        &self,
        email: &str,
        _name: Option<&str>,
        user_id: &str,
    ) -> Result<String, StripeServiceError> {
        self.created_customers
            .lock()
            .unwrap()
            .push((email.to_string(), user_id.to_string()));
        Ok(make_id("cus_test"))
    }

    async fn update_customer_email(
        &self,
        customer_id: &str,
        email: &str,
    ) -> Result<(), StripeServiceError> {
        if self.fail_customer_update {
            return Err(StripeServiceError::Api("mock customer update failure".into()));
        }
        self.customer_email_updates
            .lock()
            .unwrap()
            .push((customer_id.to_string(), email.to_string()));
        Ok(())
    }

    async fn create_checkout_session(
        &self,
        req: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeServiceError> {
        self.last_create_requests.lock().unwrap().push(req.clone());
        if let Some(message) = &self.checkout_error {
            return Err(StripeServiceError::Api(message.clone()));
        }

        let session = CheckoutSession {
            id: make_id("cs_test"),
            url: Some("https://checkout.stripe.test/pay".into()),
        };
        self.created_sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<Value, StripeServiceError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| StripeServiceError::NotFound(format!("session {} not found", session_id)))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Value, StripeServiceError> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                StripeServiceError::NotFound(format!("subscription {} not found", subscription_id))
            })
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError> {
        if let Some(secret) = &self.webhook_secret {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            verify_signature(
                payload,
                signature_header,
                secret,
                now,
                DEFAULT_TOLERANCE_SECS,
            )?;
        }
        parse_event(payload)
    }

    async fn set_subscription_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<SubscriptionInfo, StripeServiceError> {
        self.cancel_at_period_end_calls
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), cancel_at_period_end));
        let period_end = self
            .subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .and_then(|s| s.get("current_period_end"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        Ok(SubscriptionInfo {
            id: subscription_id.to_string(),
            status: "active".into(),
            current_period_end: period_end,
            cancel_at: (cancel_at_period_end && period_end > 0).then_some(period_end),
            cancel_at_period_end,
        })
    }

    async fn cancel_subscription_immediately(
        &self,
        subscription_id: &str,
    ) -> Result<(), StripeServiceError> {
        self.cancel_attempts
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        if self.fail_cancel {
            return Err(StripeServiceError::Api("mock cancel failure".into()));
        }
        Ok(())
    }
}
