use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use super::{
    parse_event, CheckoutLineItem, CheckoutMode, CheckoutSession, CreateCheckoutSessionRequest,
    StripeEvent, StripeService, StripeServiceError, SubscriptionInfo,
};
use async_trait::async_trait;
use tracing::warn;

pub struct LiveStripeService {
    client: stripe::Client,
    webhook_secret: String,
    timeout: Duration,
}

impl LiveStripeService {
    pub fn new(
        secret_key: impl Into<String>,
        webhook_secret: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = stripe::Client::new(secret_key);
        Self {
            client,
            webhook_secret: webhook_secret.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &crate::config::StripeSettings) -> Self {
        Self::new(
            settings.secret_key.clone(),
            settings.webhook_secret.clone(),
            settings.timeout,
        )
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, StripeServiceError>
    where
        F: Future<Output = Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(StripeServiceError::from),
            Err(_) => {
                warn!(op, timeout_secs = self.timeout.as_secs(), "stripe call timed out");
                Err(StripeServiceError::Timeout(op.to_string()))
            }
        }
    }
}

fn map_mode(mode: CheckoutMode) -> stripe::CheckoutSessionMode {
    match mode {
        CheckoutMode::Payment => stripe::CheckoutSessionMode::Payment,
        CheckoutMode::Subscription => stripe::CheckoutSessionMode::Subscription,
    }
}

fn map_line_items(items: &[CheckoutLineItem]) -> Vec<stripe::CreateCheckoutSessionLineItems> {
    items
        .iter()
        .map(|li| stripe::CreateCheckoutSessionLineItems {
            price: Some(li.price.clone()),
            quantity: Some(li.quantity),
            ..Default::default()
        })
        .collect()
}

fn parse_subscription_id(raw: &str) -> Result<stripe::SubscriptionId, StripeServiceError> {
    raw.parse::<stripe::SubscriptionId>()
        .map_err(|e| StripeServiceError::Other(e.to_string()))
}

fn parse_customer_id(raw: &str) -> Result<stripe::CustomerId, StripeServiceError> {
    raw.parse::<stripe::CustomerId>()
        .map_err(|e| StripeServiceError::Other(e.to_string()))
}

fn subscription_info(sub: &stripe::Subscription) -> SubscriptionInfo {
    SubscriptionInfo {
        id: sub.id.to_string(),
        status: sub.status.to_string(),
        current_period_end: sub.current_period_end,
        cancel_at: sub.cancel_at,
        cancel_at_period_end: sub.cancel_at_period_end,
    }
}

#[async_trait]
impl StripeService for LiveStripeService {
    async fn create_customer(
        &self,
        email: &str,
        name: Option<&str>,
        user_id: &str,
    ) -> Result<String, StripeServiceError> {
        let mut params = stripe::CreateCustomer::new();
        params.email = Some(email);
        if let Some(name) = name {
            params.name = Some(name);
        }
        params.metadata = Some(HashMap::from([(
            "user_id".to_string(),
            user_id.to_string(),
        )]));
        let customer = self
            .bounded(
                "create_customer",
                stripe::Customer::create(&self.client, params),
            )
            .await?;
        Ok(customer.id.to_string())
    }

    async fn update_customer_email(
        &self,
        customer_id: &str,
        email: &str,
    ) -> Result<(), StripeServiceError> {
        let cid = parse_customer_id(customer_id)?;
        let mut params = stripe::UpdateCustomer::new();
        params.email = Some(email);
        self.bounded(
            "update_customer",
            stripe::Customer::update(&self.client, &cid, params),
        )
        .await?;
        Ok(())
    }

    async fn create_checkout_session(
        &self,
        req: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeServiceError> {
        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(map_mode(req.mode));
        params.success_url = Some(&req.success_url);
        params.cancel_url = Some(&req.cancel_url);
        if let Some(ref id) = req.client_reference_id {
            params.client_reference_id = Some(id);
        }
        if let Some(ref customer) = req.customer {
            params.customer = Some(parse_customer_id(customer)?);
        }
        if !req.metadata.is_empty() {
            params.metadata = Some(req.metadata.clone().into_iter().collect());
        }
        if !req.line_items.is_empty() {
            params.line_items = Some(map_line_items(&req.line_items));
        }

        let session = self
            .bounded(
                "create_checkout_session",
                stripe::CheckoutSession::create(&self.client, params),
            )
            .await?;
        Ok(CheckoutSession {
            id: session.id.to_string(),
            url: session.url.clone(),
        })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<serde_json::Value, StripeServiceError> {
        let sid = session_id
            .parse::<stripe::CheckoutSessionId>()
            .map_err(|e| StripeServiceError::NotFound(e.to_string()))?;
        let session = self
            .bounded(
                "retrieve_checkout_session",
                stripe::CheckoutSession::retrieve(&self.client, &sid, &["line_items"]),
            )
            .await?;
        Ok(serde_json::to_value(&session)?)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<serde_json::Value, StripeServiceError> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let sub = self
            .bounded(
                "retrieve_subscription",
                stripe::Subscription::retrieve(&self.client, &sub_id, &[]),
            )
            .await?;
        Ok(serde_json::to_value(&sub)?)
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError> {
        let payload_str =
            std::str::from_utf8(payload).map_err(|e| StripeServiceError::Serde(e.to_string()))?;
        // Handlers read the raw event JSON, so the typed event is dropped. A
        // `BadParse` is only reported once the signature has been accepted.
        match stripe::Webhook::construct_event(payload_str, signature_header, &self.webhook_secret) {
            Ok(_) | Err(stripe::WebhookError::BadParse(_)) => parse_event(payload),
            Err(err) => Err(err.into()),
        }
    }

    async fn set_subscription_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<SubscriptionInfo, StripeServiceError> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let mut params = stripe::UpdateSubscription::new();
        params.cancel_at_period_end = Some(cancel_at_period_end);
        let sub = self
            .bounded(
                "update_subscription",
                stripe::Subscription::update(&self.client, &sub_id, params),
            )
            .await?;
        Ok(subscription_info(&sub))
    }

    async fn cancel_subscription_immediately(
        &self,
        subscription_id: &str,
    ) -> Result<(), StripeServiceError> {
        let sub_id = parse_subscription_id(subscription_id)?;
        self.bounded(
            "cancel_subscription",
            stripe::Subscription::cancel(&self.client, &sub_id, Default::default()),
        )
        .await?;
        Ok(())
    }
}
