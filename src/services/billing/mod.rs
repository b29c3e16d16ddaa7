pub mod notifications;
pub mod transition;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::stripe_event_log_repository::StripeEventLogRepository;
use crate::db::subscription_transition_repository::SubscriptionTransitionRepository;
use crate::db::user_repository::UserRepository;
use crate::models::subscription_transition::{NewSubscriptionTransition, TransitionSource};
use crate::models::user::{BillingPeriod, SubscriptionState, SubscriptionStatus, User};
use crate::services::smtp_mailer::Mailer;
use crate::services::stripe::{
    CheckoutLineItem, CheckoutMode, CheckoutSession, CreateCheckoutSessionRequest, StripeEvent,
    StripeService, StripeServiceError,
};
use crate::utils::stripe_payload::{
    extract_customer_id, extract_str, extract_subscription_ref, extract_user_id,
};
use crate::utils::stripe_signature::SignatureError;
use notifications::EmailContent;
use transition::{
    apply_transition, plan_name_for_subscription, BillingEvent, SubscriptionSnapshot, Transition,
};

pub const EXPIRED_MESSAGE: &str =
    "Your subscription has expired. Renew to continue enjoying MovioLive!";
pub const SUBSCRIPTION_REQUIRED_MESSAGE: &str = "Active subscription required";

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Processor(String),
    #[error("invalid webhook signature: {0}")]
    Signature(#[from] SignatureError),
    #[error("invalid webhook payload: {0}")]
    Payload(String),
    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
}

impl From<StripeServiceError> for BillingError {
    fn from(err: StripeServiceError) -> Self {
        match err {
            StripeServiceError::Api(message) => BillingError::Processor(message),
            StripeServiceError::Webhook(e) => BillingError::Signature(e),
            other => BillingError::Processor(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub price_id: String,
    pub plan_type: Option<String>,
    pub billing_period: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    Unchanged,
    Duplicate,
    Ignored,
    /// The handler failed; the event stays unrecorded so a redelivery can retry it.
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub downgraded: usize,
    pub processor_failures: usize,
    pub store_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancellationOutcome {
    pub plan_name: Option<String>,
    pub processor_cancelled: bool,
}

/// What the access gate attaches to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionAccess {
    pub has_access: bool,
    pub status: SubscriptionStatus,
    pub plan_type: Option<String>,
    pub plan_name: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub is_expired: bool,
    pub expired_message: Option<String>,
}

pub struct BillingService {
    users: Arc<dyn UserRepository>,
    audit: Arc<dyn SubscriptionTransitionRepository>,
    events: Arc<dyn StripeEventLogRepository>,
    stripe: Arc<dyn StripeService>,
    mailer: Arc<dyn Mailer>,
    base_url: String,
}

fn outcome_of(transition: &Transition) -> WebhookOutcome {
    if transition.changed {
        WebhookOutcome::Applied
    } else {
        WebhookOutcome::Unchanged
    }
}

impl BillingService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        audit: Arc<dyn SubscriptionTransitionRepository>,
        events: Arc<dyn StripeEventLogRepository>,
        stripe: Arc<dyn StripeService>,
        mailer: Arc<dyn Mailer>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            users,
            audit,
            events,
            stripe,
            mailer,
            base_url: base_url.into(),
        }
    }

    async fn load_user(&self, user_id: Uuid) -> Result<User, BillingError> {
        self.users
            .find_user_by_id(user_id)
            .await?
            .ok_or(BillingError::NotFound("user"))
    }

    pub async fn create_checkout_session(
        &self,
        user_id: Uuid,
        req: CheckoutRequest,
    ) -> Result<CheckoutSession, BillingError> {
        let user = self.load_user(user_id).await?;

        let customer_id = match user.stripe_customer_id.clone() {
            Some(id) => id,
            None => {
                let id = self
                    .stripe
                    .create_customer(&user.email, Some(&user.full_name), &user.id.to_string())
                    .await
                    .map_err(|err| {
                        error!(?err, %user_id, "failed to create stripe customer");
                        BillingError::from(err)
                    })?;
                self.users.set_user_stripe_customer_id(user.id, &id).await?;
                info!(%user_id, customer_id = %id, "created stripe customer");
                id
            }
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("user_id".to_string(), user.id.to_string());
        if let Some(plan_type) = req.plan_type.as_deref() {
            metadata.insert("plan_type".to_string(), plan_type.to_string());
        }
        if let Some(period) = req.billing_period.as_deref() {
            metadata.insert("billing_period".to_string(), period.to_string());
        }

        let base = self.base_url.trim_end_matches('/');
        let request = CreateCheckoutSessionRequest {
            success_url: format!("{base}/success?session_id={{CHECKOUT_SESSION_ID}}"),
            cancel_url: format!("{base}/pricing?canceled=true"),
            mode: CheckoutMode::Subscription,
            line_items: vec![CheckoutLineItem {
                price: req.price_id.clone(),
                quantity: 1,
            }],
            client_reference_id: Some(user.id.to_string()),
            customer: Some(customer_id),
            metadata,
        };

        let session = self
            .stripe
            .create_checkout_session(request)
            .await
            .map_err(|err| {
                error!(?err, %user_id, price_id = %req.price_id, "failed to create checkout session");
                BillingError::from(err)
            })?;
        info!(%user_id, session_id = %session.id, "created checkout session");
        Ok(session)
    }

    /// Session as returned by the processor, plus `plan_name` when the
    /// session references a subscription.
    pub async fn checkout_session_details(&self, session_id: &str) -> Result<Value, BillingError> {
        let mut session = self.stripe.retrieve_checkout_session(session_id).await?;

        if let Some(sub_id) = extract_subscription_ref(&session) {
            match self.stripe.retrieve_subscription(&sub_id).await {
                Ok(subscription) => {
                    if let (Some(name), Some(map)) = (
                        plan_name_for_subscription(&subscription),
                        session.as_object_mut(),
                    ) {
                        map.insert("plan_name".to_string(), Value::String(name));
                    }
                }
                Err(err) => {
                    warn!(?err, session_id, subscription_id = %sub_id, "failed to load subscription for session lookup")
                }
            }
        }
        Ok(session)
    }

    /// Verifies and dispatches one webhook delivery. Only signature and
    /// payload problems are errors; handler failures are logged and reported
    /// as [`WebhookOutcome::Failed`].
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, BillingError> {
        let signature = signature.ok_or(SignatureError::MissingSignature)?;
        let event = self
            .stripe
            .verify_webhook(payload, signature)
            .map_err(|err| match err {
                StripeServiceError::Webhook(e) => BillingError::Signature(e),
                other => BillingError::Payload(other.to_string()),
            })?;

        let evt_type = event.r#type.as_str();
        match self.events.has_processed_event(&event.id).await {
            Ok(true) => {
                info!(event_id = %event.id, evt_type, "duplicate stripe event acknowledged");
                return Ok(WebhookOutcome::Duplicate);
            }
            Ok(false) => {}
            Err(err) => {
                warn!(?err, event_id = %event.id, "failed to check stripe event log; processing anyway")
            }
        }

        let outcome = match self.dispatch(&event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(?err, event_id = %event.id, evt_type, "stripe webhook handler failed");
                return Ok(WebhookOutcome::Failed);
            }
        };

        if let Err(err) = self.events.record_event(&event.id, evt_type).await {
            warn!(?err, event_id = %event.id, evt_type, "failed to record processed stripe event");
        }
        Ok(outcome)
    }

    async fn dispatch(&self, event: &StripeEvent) -> Result<WebhookOutcome, BillingError> {
        let evt_type = event.r#type.as_str();
        match evt_type {
            "checkout.session.completed" => self.on_checkout_completed(event).await,
            "customer.subscription.created" => self.on_subscription_changed(event, true).await,
            "customer.subscription.updated" => self.on_subscription_changed(event, false).await,
            "customer.subscription.deleted" => self.on_subscription_deleted(event).await,
            "invoice.payment_succeeded" => {
                info!(
                    event_id = %event.id,
                    customer_id = ?extract_customer_id(event.object()),
                    "invoice payment succeeded"
                );
                Ok(WebhookOutcome::Ignored)
            }
            "invoice.payment_failed" => {
                warn!(
                    event_id = %event.id,
                    customer_id = ?extract_customer_id(event.object()),
                    "invoice payment failed"
                );
                Ok(WebhookOutcome::Ignored)
            }
            _ => {
                info!(evt_type, "unhandled stripe event acknowledged");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Explicit user id first, then customer id, then stored subscription id.
    async fn resolve_user(
        &self,
        user_id: Option<Uuid>,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> Result<Option<User>, BillingError> {
        if let Some(id) = user_id {
            if let Some(user) = self.users.find_user_by_id(id).await? {
                return Ok(Some(user));
            }
        }

        let mut resolved = None;
        if let Some(customer_id) = customer_id {
            resolved = self
                .users
                .find_user_id_by_stripe_customer_id(customer_id)
                .await?;
        }
        if resolved.is_none() {
            if let Some(subscription_id) = subscription_id {
                resolved = self
                    .users
                    .find_user_id_by_subscription_id(subscription_id)
                    .await?;
            }
        }

        match resolved {
            Some(id) => Ok(self.users.find_user_by_id(id).await?),
            None => Ok(None),
        }
    }

    async fn on_checkout_completed(&self, event: &StripeEvent) -> Result<WebhookOutcome, BillingError> {
        let session = event.object();
        let customer_id = extract_customer_id(session);
        let subscription_id = extract_subscription_ref(session);

        let Some(user) = self
            .resolve_user(
                extract_user_id(session),
                customer_id.as_deref(),
                subscription_id.as_deref(),
            )
            .await?
        else {
            warn!(event_id = %event.id, "unable to resolve user for checkout completion");
            return Ok(WebhookOutcome::Ignored);
        };

        if user.stripe_customer_id.is_none() {
            if let Some(cid) = customer_id.as_deref() {
                if let Err(err) = self.users.set_user_stripe_customer_id(user.id, cid).await {
                    warn!(?err, user_id = %user.id, customer_id = cid, "failed to persist stripe customer id on checkout completion");
                }
            }
        }

        let billing_event = BillingEvent::CheckoutCompleted {
            subscription_id,
            plan_type: extract_str(session, &["metadata", "plan_type"]).map(str::to_string),
            billing_period: extract_str(session, &["metadata", "billing_period"])
                .and_then(BillingPeriod::parse),
        };
        let now = OffsetDateTime::now_utc();
        let transition = self
            .apply_for_user(
                &user,
                &billing_event,
                TransitionSource::Checkout,
                Some(event.id.as_str()),
                now,
            )
            .await?;
        self.cancel_replaced(&user, &transition).await;
        Ok(outcome_of(&transition))
    }

    async fn on_subscription_changed(
        &self,
        event: &StripeEvent,
        created: bool,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some(snapshot) = SubscriptionSnapshot::from_object(event.object()) else {
            warn!(event_id = %event.id, evt_type = %event.r#type, "subscription event missing id");
            return Ok(WebhookOutcome::Ignored);
        };

        let Some(user) = self
            .resolve_user(
                snapshot.user_id,
                snapshot.customer_id.as_deref(),
                Some(&snapshot.subscription_id),
            )
            .await?
        else {
            warn!(
                event_id = %event.id,
                subscription_id = %snapshot.subscription_id,
                "unable to resolve user for subscription event"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let billing_event = if created {
            BillingEvent::SubscriptionCreated(snapshot.clone())
        } else {
            BillingEvent::SubscriptionUpdated(snapshot.clone())
        };
        let now = OffsetDateTime::now_utc();
        let transition = self
            .apply_for_user(
                &user,
                &billing_event,
                TransitionSource::Webhook,
                Some(event.id.as_str()),
                now,
            )
            .await?;

        self.cancel_replaced(&user, &transition).await;

        if let Some(sub_id) = transition.schedule_cancel_at_period_end.as_deref() {
            match self
                .stripe
                .set_subscription_cancel_at_period_end(sub_id, true)
                .await
            {
                Ok(_) => info!(user_id = %user.id, subscription_id = sub_id, "daily plan set to cancel at period end"),
                Err(err) => warn!(?err, user_id = %user.id, subscription_id = sub_id, "failed to set cancel_at_period_end for daily plan"),
            }
        }

        if created && transition.changed && transition.next.status == SubscriptionStatus::Active {
            let content = notifications::payment_confirmation(
                &user.full_name,
                transition
                    .next
                    .plan_name
                    .as_deref()
                    .unwrap_or("MovioLive Premium"),
                snapshot.unit_amount,
                transition.next.current_period_end,
                snapshot.is_daily(),
            );
            self.notify(&user, content).await;
        }

        Ok(outcome_of(&transition))
    }

    async fn on_subscription_deleted(&self, event: &StripeEvent) -> Result<WebhookOutcome, BillingError> {
        let object = event.object();
        let Some(subscription_id) = extract_str(object, &["id"]) else {
            warn!(event_id = %event.id, "subscription deletion missing id");
            return Ok(WebhookOutcome::Ignored);
        };

        let customer_id = extract_customer_id(object);
        let Some(user) = self
            .resolve_user(None, customer_id.as_deref(), Some(subscription_id))
            .await?
        else {
            warn!(event_id = %event.id, subscription_id, "unable to resolve user for subscription deletion");
            return Ok(WebhookOutcome::Ignored);
        };

        let billing_event = BillingEvent::SubscriptionDeleted {
            subscription_id: subscription_id.to_string(),
        };
        let transition = self
            .apply_for_user(
                &user,
                &billing_event,
                TransitionSource::Webhook,
                Some(event.id.as_str()),
                OffsetDateTime::now_utc(),
            )
            .await?;
        if !transition.changed {
            info!(user_id = %user.id, subscription_id, note = transition.note, "subscription deletion left state unchanged");
        }
        Ok(outcome_of(&transition))
    }

    /// Runs the transition and persists its result. The state and the derived
    /// roles are written together whenever either differs from what is stored.
    async fn apply_for_user(
        &self,
        user: &User,
        event: &BillingEvent,
        source: TransitionSource,
        event_id: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<Transition, BillingError> {
        let transition = apply_transition(&user.subscription, event, now);
        let roles_drifted = user.roles != transition.roles;
        if !transition.changed && !roles_drifted {
            debug!(user_id = %user.id, note = transition.note, "subscription transition was a no-op");
            return Ok(transition);
        }

        self.users
            .write_subscription_state(user.id, &transition.next, &transition.roles)
            .await?;
        info!(
            user_id = %user.id,
            source = source.as_str(),
            from = %user.subscription.status,
            to = %transition.next.status,
            roles = ?transition.roles,
            note = transition.note,
            "applied subscription transition"
        );

        let record = NewSubscriptionTransition {
            user_id: user.id,
            source,
            event_id: event_id.map(str::to_string),
            from_status: user.subscription.status,
            to_status: transition.next.status,
            subscription_id: transition
                .next
                .subscription_id
                .clone()
                .or_else(|| user.subscription.subscription_id.clone()),
            note: Some(transition.note.to_string()),
            created_at: now,
        };
        if let Err(err) = self.audit.record_transition(&record).await {
            warn!(?err, user_id = %user.id, "failed to record subscription transition");
        }
        Ok(transition)
    }

    /// Returns whether the processor accepted the cancellation. A failure
    /// means local and processor state now disagree.
    async fn cancel_at_processor(&self, user_id: Uuid, subscription_id: &str, context: &'static str) -> bool {
        match self
            .stripe
            .cancel_subscription_immediately(subscription_id)
            .await
        {
            Ok(()) => {
                info!(%user_id, subscription_id, context, "cancelled subscription at processor");
                true
            }
            Err(err) => {
                error!(
                    billing_divergence = true,
                    ?err,
                    %user_id,
                    subscription_id,
                    context,
                    "failed to cancel subscription at processor"
                );
                false
            }
        }
    }

    async fn cancel_replaced(&self, user: &User, transition: &Transition) {
        if let Some(previous) = transition.cancel_previous.as_deref() {
            self.cancel_at_processor(user.id, previous, "replaced").await;
        }
    }

    async fn notify(&self, user: &User, content: EmailContent) {
        if let Err(err) = self
            .mailer
            .send_email_generic(&user.email, &content.subject, &content.body)
            .await
        {
            warn!(%err, user_id = %user.id, subject = %content.subject, "failed to send billing email");
        }
    }

    /// Downgrades users whose period has elapsed without a webhook saying so.
    pub async fn sweep_expired(
        &self,
        now: OffsetDateTime,
        batch_size: i64,
    ) -> Result<SweepReport, BillingError> {
        let expired = self
            .users
            .list_expired_active_subscriptions(now, batch_size)
            .await?;
        let mut report = SweepReport {
            scanned: expired.len(),
            ..Default::default()
        };

        for user in expired {
            if let Some(sub_id) = user.subscription.subscription_id.as_deref() {
                if !self.cancel_at_processor(user.id, sub_id, "sweep").await {
                    report.processor_failures += 1;
                }
            }
            match self
                .apply_for_user(&user, &BillingEvent::Expire, TransitionSource::Sweep, None, now)
                .await
            {
                Ok(_) => report.downgraded += 1,
                Err(err) => {
                    report.store_failures += 1;
                    error!(?err, user_id = %user.id, "failed to downgrade expired subscription");
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                downgraded = report.downgraded,
                processor_failures = report.processor_failures,
                store_failures = report.store_failures,
                "subscription sweep finished"
            );
        } else {
            debug!("subscription sweep found nothing to do");
        }
        Ok(report)
    }

    /// User-initiated cancellation. Local state is reset even when the
    /// processor call fails.
    pub async fn cancel_subscription(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<CancellationOutcome, BillingError> {
        let user = self.load_user(user_id).await?;
        if user.subscription.is_empty() {
            return Err(BillingError::NotFound("subscription"));
        }

        let processor_cancelled = match user.subscription.subscription_id.as_deref() {
            Some(sub_id) => self.cancel_at_processor(user.id, sub_id, "user_cancel").await,
            None => true,
        };

        let plan_name = user.subscription.plan_name.clone();
        self.apply_for_user(
            &user,
            &BillingEvent::Expire,
            TransitionSource::Cancellation,
            None,
            now,
        )
        .await?;

        let content = notifications::cancellation_confirmation(
            &user.full_name,
            plan_name.as_deref().unwrap_or("MovioLive Premium"),
            now,
        );
        self.notify(&user, content).await;

        Ok(CancellationOutcome {
            plan_name,
            processor_cancelled,
        })
    }

    /// Whether an earlier sweep or access check is what left the user
    /// without access. Lookup failures read as "not expired".
    async fn expired_earlier(&self, user_id: Uuid) -> bool {
        match self.audit.last_expired_at(user_id).await {
            Ok(expired_at) => expired_at.is_some(),
            Err(err) => {
                warn!(?err, %user_id, "failed to read last expiry");
                false
            }
        }
    }

    /// Reads the user's access, downgrading inline when the period has
    /// elapsed and repairing stored roles that disagree with the state.
    pub async fn evaluate_access(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<SubscriptionAccess, BillingError> {
        let user = self.load_user(user_id).await?;
        let mut state = user.subscription.clone();
        let mut is_expired = false;

        if state.is_expired_at(now) {
            is_expired = true;
            info!(%user_id, period_end = ?state.current_period_end, "subscription expired at access check");
            match self
                .apply_for_user(&user, &BillingEvent::Expire, TransitionSource::Gate, None, now)
                .await
            {
                Ok(transition) => state = transition.next,
                Err(err) => {
                    error!(?err, %user_id, "failed to persist expiry at access check");
                    state = SubscriptionState::inactive();
                }
            }
        } else {
            if !state.has_access_at(now) {
                is_expired = self.expired_earlier(user_id).await;
            }
            let derived = state.roles_at(now);
            if user.roles != derived {
                warn!(%user_id, stored = ?user.roles, derived = ?derived, "repairing roles that disagree with subscription state");
                if let Err(err) = self
                    .users
                    .write_subscription_state(user.id, &state, &derived)
                    .await
                {
                    warn!(?err, %user_id, "failed to repair roles");
                }
            }
        }

        Ok(SubscriptionAccess {
            has_access: state.has_access_at(now),
            status: state.status,
            plan_type: state.plan_type.clone(),
            plan_name: state.plan_name.clone(),
            expires_at: state.current_period_end,
            is_expired,
            expired_message: is_expired.then(|| EXPIRED_MESSAGE.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_db::{sample_user, MockDb};
    use crate::db::mock_stripe_event_log_repository::MockStripeEventLogRepository;
    use crate::models::user::{Role, SubscriptionState};
    use crate::services::smtp_mailer::MockMailer;
    use crate::services::stripe::MockStripeService;
    use crate::utils::stripe_signature::sign_payload;
    use serde_json::json;
    use time::Duration;

    const WEBHOOK_SECRET: &str = "whsec_billing_tests";

    struct Harness {
        db: Arc<MockDb>,
        stripe: Arc<MockStripeService>,
        mailer: Arc<MockMailer>,
        events: Arc<MockStripeEventLogRepository>,
        service: BillingService,
    }

    fn harness_with(db: MockDb, stripe: MockStripeService, mailer: MockMailer) -> Harness {
        let db = Arc::new(db);
        let stripe = Arc::new(stripe);
        let mailer = Arc::new(mailer);
        let events = Arc::new(MockStripeEventLogRepository::default());
        let service = BillingService::new(
            db.clone(),
            db.clone(),
            events.clone(),
            stripe.clone(),
            mailer.clone(),
            "https://moviolive.test/",
        );
        Harness {
            db,
            stripe,
            mailer,
            events,
            service,
        }
    }

    fn harness(db: MockDb) -> Harness {
        harness_with(
            db,
            MockStripeService::new().with_webhook_secret(WEBHOOK_SECRET),
            MockMailer::default(),
        )
    }

    fn active_user(email: &str, sub_id: &str, end: OffsetDateTime) -> User {
        let mut user = sample_user(email);
        user.stripe_customer_id = Some(format!("cus_{}", &user.id.simple().to_string()[..8]));
        user.subscription = SubscriptionState {
            subscription_id: Some(sub_id.to_string()),
            status: SubscriptionStatus::Active,
            plan_name: Some("Basic Monthly".into()),
            plan_type: Some("subscription".into()),
            billing_period: Some(BillingPeriod::Monthly),
            current_period_start: Some(end - Duration::days(30)),
            current_period_end: Some(end),
            has_active_pass: false,
        };
        user.roles = user.subscription.roles_at(OffsetDateTime::now_utc());
        user
    }

    fn event_body(id: &str, evt_type: &str, object: Value) -> String {
        json!({ "id": id, "type": evt_type, "data": { "object": object } }).to_string()
    }

    fn signed(body: &str) -> String {
        sign_payload(WEBHOOK_SECRET, OffsetDateTime::now_utc().unix_timestamp(), body)
    }

    fn subscription_object(id: &str, status: &str, customer: &str, interval: &str) -> Value {
        let start = OffsetDateTime::now_utc().unix_timestamp();
        let length = if interval == "day" { 86_400 } else { 30 * 86_400 };
        json!({
            "id": id,
            "object": "subscription",
            "status": status,
            "customer": customer,
            "cancel_at_period_end": false,
            "current_period_start": start,
            "current_period_end": start + length,
            "items": { "data": [ {
                "price": { "unit_amount": 999, "recurring": { "interval": interval } }
            } ] }
        })
    }

    async fn deliver(h: &Harness, id: &str, evt_type: &str, object: Value) -> WebhookOutcome {
        let body = event_body(id, evt_type, object);
        h.service
            .handle_webhook(body.as_bytes(), Some(&signed(&body)))
            .await
            .expect("signed webhook should verify")
    }

    #[tokio::test]
    async fn checkout_creates_customer_once_and_builds_urls() {
        let user = sample_user("viewer@moviolive.test");
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));

        let req = CheckoutRequest {
            price_id: "price_monthly".into(),
            plan_type: Some("subscription".into()),
            billing_period: Some("monthly".into()),
        };
        let session = h
            .service
            .create_checkout_session(user_id, req.clone())
            .await
            .unwrap();
        assert_eq!(session.url.as_deref(), Some("https://checkout.stripe.test/pay"));

        let customer_id = h.db.user(user_id).unwrap().stripe_customer_id;
        assert!(customer_id.is_some());

        h.service.create_checkout_session(user_id, req).await.unwrap();
        assert_eq!(h.stripe.created_customers.lock().unwrap().len(), 1);

        let requests = h.stripe.last_create_requests.lock().unwrap();
        let first = &requests[0];
        assert_eq!(
            first.success_url,
            "https://moviolive.test/success?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(first.cancel_url, "https://moviolive.test/pricing?canceled=true");
        assert_eq!(first.mode, CheckoutMode::Subscription);
        assert_eq!(first.customer, customer_id);
        assert_eq!(first.client_reference_id, Some(user_id.to_string()));
        assert_eq!(first.metadata.get("user_id"), Some(&user_id.to_string()));
        assert_eq!(first.metadata.get("plan_type").map(String::as_str), Some("subscription"));
    }

    #[tokio::test]
    async fn checkout_surfaces_processor_error_verbatim() {
        let user = sample_user("viewer@moviolive.test");
        let user_id = user.id;
        let h = harness_with(
            MockDb::with_user(user),
            MockStripeService::new().with_checkout_error("No such price: 'price_missing'"),
            MockMailer::default(),
        );
        let err = h
            .service
            .create_checkout_session(
                user_id,
                CheckoutRequest {
                    price_id: "price_missing".into(),
                    plan_type: None,
                    billing_period: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Processor(ref m) if m == "No such price: 'price_missing'"));
    }

    #[tokio::test]
    async fn checkout_for_unknown_user_is_not_found() {
        let h = harness(MockDb::default());
        let err = h
            .service
            .create_checkout_session(
                Uuid::new_v4(),
                CheckoutRequest {
                    price_id: "price_monthly".into(),
                    plan_type: None,
                    billing_period: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound("user")));
    }

    #[tokio::test]
    async fn checkout_then_subscription_created_grants_organizer() {
        let mut user = sample_user("host@moviolive.test");
        user.stripe_customer_id = Some("cus_host".into());
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));

        let session = json!({
            "id": "cs_test_1",
            "object": "checkout.session",
            "customer": "cus_host",
            "subscription": "sub_host",
            "client_reference_id": user_id.to_string(),
            "metadata": { "user_id": user_id.to_string(), "plan_type": "subscription", "billing_period": "monthly" }
        });
        let outcome = deliver(&h, "evt_checkout", "checkout.session.completed", session).await;
        assert_eq!(outcome, WebhookOutcome::Applied);
        let after_checkout = h.db.user(user_id).unwrap();
        assert_eq!(after_checkout.subscription.status, SubscriptionStatus::Active);
        assert_eq!(after_checkout.roles, vec![Role::Audience]);

        let outcome = deliver(
            &h,
            "evt_created",
            "customer.subscription.created",
            subscription_object("sub_host", "active", "cus_host", "month"),
        )
        .await;
        assert_eq!(outcome, WebhookOutcome::Applied);

        let user = h.db.user(user_id).unwrap();
        assert_eq!(user.roles, vec![Role::Audience, Role::Organizer]);
        assert_eq!(user.subscription.subscription_id.as_deref(), Some("sub_host"));
        assert_eq!(user.subscription.plan_name.as_deref(), Some("Basic Monthly"));
        let end = user.subscription.current_period_end.unwrap();
        let expected = OffsetDateTime::now_utc() + Duration::days(30);
        assert!((end - expected).abs() < Duration::minutes(5));

        let mails = h.mailer.sent_to("host@moviolive.test");
        assert_eq!(mails.len(), 1);
        assert!(mails[0].body.contains("Amount: $9.99"));

        let audit = h.db.transitions.lock().unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].source, TransitionSource::Checkout);
        assert_eq!(audit[1].event_id.as_deref(), Some("evt_created"));
        assert_eq!(
            h.events.recorded_events().len(),
            2,
            "both events should be recorded as processed"
        );
    }

    #[tokio::test]
    async fn replayed_created_payload_is_idempotent() {
        let mut user = sample_user("host@moviolive.test");
        user.stripe_customer_id = Some("cus_host".into());
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));
        let object = subscription_object("sub_host", "active", "cus_host", "month");

        deliver(&h, "evt_a", "customer.subscription.created", object.clone()).await;
        let first = h.db.user(user_id).unwrap();

        let duplicate = deliver(&h, "evt_a", "customer.subscription.created", object.clone()).await;
        assert_eq!(duplicate, WebhookOutcome::Duplicate);

        let replay = deliver(&h, "evt_b", "customer.subscription.created", object).await;
        assert_eq!(replay, WebhookOutcome::Unchanged);

        let second = h.db.user(user_id).unwrap();
        assert_eq!(first.subscription, second.subscription);
        assert_eq!(second.roles, vec![Role::Audience, Role::Organizer]);
        assert_eq!(h.db.state_write_count(), 1);
        assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn created_redelivery_after_renewal_keeps_the_renewed_period() {
        let mut user = sample_user("host@moviolive.test");
        user.stripe_customer_id = Some("cus_host".into());
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));
        let created = subscription_object("sub_host", "active", "cus_host", "month");

        deliver(&h, "evt_created", "customer.subscription.created", created.clone()).await;

        let mut renewal = created.clone();
        let first_end = renewal["current_period_end"].as_i64().unwrap();
        renewal["current_period_start"] = json!(first_end);
        renewal["current_period_end"] = json!(first_end + 30 * 86_400);
        let renewed = deliver(&h, "evt_renewed", "customer.subscription.updated", renewal).await;
        assert_eq!(renewed, WebhookOutcome::Applied);
        let renewed_end = h.db.user(user_id).unwrap().subscription.current_period_end;

        // Same payload under a new delivery id, as after a failed first attempt.
        let retry = deliver(&h, "evt_created_retry", "customer.subscription.created", created).await;
        assert_eq!(retry, WebhookOutcome::Unchanged);

        let stored = h.db.user(user_id).unwrap();
        assert_eq!(stored.subscription.current_period_end, renewed_end);
        assert_eq!(stored.roles, vec![Role::Audience, Role::Organizer]);
    }

    #[tokio::test]
    async fn daily_plan_is_set_to_cancel_at_period_end() {
        let mut user = sample_user("daily@moviolive.test");
        user.stripe_customer_id = Some("cus_daily".into());
        let h = harness(MockDb::with_user(user));

        deliver(
            &h,
            "evt_daily",
            "customer.subscription.created",
            subscription_object("sub_daily", "active", "cus_daily", "day"),
        )
        .await;

        let calls = h.stripe.cancel_at_period_end_calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[("sub_daily".to_string(), true)]);
        let mails = h.mailer.sent_to("daily@moviolive.test");
        assert!(mails[0].body.contains("do not renew"));
    }

    #[tokio::test]
    async fn new_subscription_cancels_the_previous_one() {
        let user = active_user(
            "host@moviolive.test",
            "sub_old",
            OffsetDateTime::now_utc() + Duration::days(10),
        );
        let customer = user.stripe_customer_id.clone().unwrap();
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));

        deliver(
            &h,
            "evt_new",
            "customer.subscription.created",
            subscription_object("sub_new", "active", &customer, "year"),
        )
        .await;

        assert_eq!(h.stripe.cancelled(), vec!["sub_old".to_string()]);
        let user = h.db.user(user_id).unwrap();
        assert_eq!(user.subscription.subscription_id.as_deref(), Some("sub_new"));
        assert_eq!(user.subscription.plan_name.as_deref(), Some("Premium Yearly"));
    }

    #[tokio::test]
    async fn subscription_deleted_downgrades_fully() {
        let user = active_user(
            "host@moviolive.test",
            "sub_1",
            OffsetDateTime::now_utc() + Duration::days(10),
        );
        let customer = user.stripe_customer_id.clone().unwrap();
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));

        let outcome = deliver(
            &h,
            "evt_deleted",
            "customer.subscription.deleted",
            json!({ "id": "sub_1", "customer": customer, "status": "canceled" }),
        )
        .await;
        assert_eq!(outcome, WebhookOutcome::Applied);

        let user = h.db.user(user_id).unwrap();
        assert_eq!(user.roles, vec![Role::Audience]);
        assert!(user.subscription.subscription_id.is_none());
        assert!(user.subscription.plan_name.is_none());
        assert_eq!(user.subscription.status, SubscriptionStatus::Inactive);
        assert!(user.stripe_customer_id.is_some());
    }

    #[tokio::test]
    async fn deletion_of_unknown_subscription_is_ignored() {
        let h = harness(MockDb::default());
        let outcome = deliver(
            &h,
            "evt_orphan",
            "customer.subscription.deleted",
            json!({ "id": "sub_orphan", "customer": "cus_nobody" }),
        )
        .await;
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert_eq!(h.events.recorded_events(), vec!["evt_orphan".to_string()]);
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_without_writes() {
        let user = active_user(
            "host@moviolive.test",
            "sub_1",
            OffsetDateTime::now_utc() + Duration::days(10),
        );
        let h = harness(MockDb::with_user(user));
        let body = event_body(
            "evt_forged",
            "customer.subscription.deleted",
            json!({ "id": "sub_1" }),
        );
        let forged = sign_payload("whsec_wrong", OffsetDateTime::now_utc().unix_timestamp(), &body);

        let err = h
            .service
            .handle_webhook(body.as_bytes(), Some(&forged))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Signature(SignatureError::Mismatch)));

        let missing = h.service.handle_webhook(body.as_bytes(), None).await.unwrap_err();
        assert!(matches!(missing, BillingError::Signature(SignatureError::MissingSignature)));

        assert_eq!(h.db.state_write_count(), 0);
        assert!(h.events.recorded_events().is_empty());
    }

    #[tokio::test]
    async fn failed_handler_leaves_event_unrecorded() {
        let user = active_user(
            "host@moviolive.test",
            "sub_1",
            OffsetDateTime::now_utc() + Duration::days(10),
        );
        let customer = user.stripe_customer_id.clone().unwrap();
        let db = MockDb {
            fail_state_writes: true,
            ..MockDb::default()
        };
        db.insert_user(user);
        let h = harness(db);

        let outcome = deliver(
            &h,
            "evt_retry",
            "customer.subscription.deleted",
            json!({ "id": "sub_1", "customer": customer }),
        )
        .await;
        assert_eq!(outcome, WebhookOutcome::Failed);
        assert!(h.events.recorded_events().is_empty());
    }

    #[tokio::test]
    async fn unhandled_and_invoice_events_are_acknowledged() {
        let h = harness(MockDb::default());
        assert_eq!(
            deliver(&h, "evt_inv", "invoice.payment_failed", json!({ "customer": "cus_x" })).await,
            WebhookOutcome::Ignored
        );
        assert_eq!(
            deliver(&h, "evt_misc", "customer.created", json!({ "id": "cus_x" })).await,
            WebhookOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn sweep_downgrades_expired_users_even_when_processor_fails() {
        let now = OffsetDateTime::now_utc();
        let expired = active_user("late@moviolive.test", "sub_late", now - Duration::hours(2));
        let current = active_user("ok@moviolive.test", "sub_ok", now + Duration::days(3));
        let expired_id = expired.id;
        let current_id = current.id;
        let db = MockDb::default();
        db.insert_user(expired);
        db.insert_user(current);
        let h = harness_with(
            db,
            MockStripeService::new().with_failing_cancel(),
            MockMailer::default(),
        );

        let report = h.service.sweep_expired(now, 500).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                scanned: 1,
                downgraded: 1,
                processor_failures: 1,
                store_failures: 0,
            }
        );

        let downgraded = h.db.user(expired_id).unwrap();
        assert_eq!(downgraded.subscription, SubscriptionState::inactive());
        assert_eq!(downgraded.roles, vec![Role::Audience]);

        let untouched = h.db.user(current_id).unwrap();
        assert_eq!(untouched.roles, vec![Role::Audience, Role::Organizer]);
        assert_eq!(h.stripe.cancelled(), vec!["sub_late".to_string()]);

        let again = h.service.sweep_expired(now, 500).await.unwrap();
        assert_eq!(again.scanned, 0);
    }

    #[tokio::test]
    async fn sweep_counts_store_failures_per_user() {
        let now = OffsetDateTime::now_utc();
        let db = MockDb {
            fail_state_writes: true,
            ..MockDb::default()
        };
        db.insert_user(active_user("a@moviolive.test", "sub_a", now - Duration::hours(1)));
        db.insert_user(active_user("b@moviolive.test", "sub_b", now - Duration::hours(3)));
        let h = harness(db);

        let report = h.service.sweep_expired(now, 500).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.downgraded, 0);
        assert_eq!(report.store_failures, 2);
        assert_eq!(h.stripe.cancelled().len(), 2);
    }

    #[tokio::test]
    async fn cancel_with_failing_processor_still_resets_locally() {
        let now = OffsetDateTime::now_utc();
        let user = active_user("host@moviolive.test", "sub_1", now + Duration::days(20));
        let user_id = user.id;
        let h = harness_with(
            MockDb::with_user(user),
            MockStripeService::new().with_failing_cancel(),
            MockMailer::default(),
        );

        let outcome = h.service.cancel_subscription(user_id, now).await.unwrap();
        assert_eq!(outcome.plan_name.as_deref(), Some("Basic Monthly"));
        assert!(!outcome.processor_cancelled);

        let user = h.db.user(user_id).unwrap();
        assert_eq!(user.subscription, SubscriptionState::inactive());
        assert_eq!(user.roles, vec![Role::Audience]);

        let mails = h.mailer.sent_to("host@moviolive.test");
        assert_eq!(mails.len(), 1);
        assert!(mails[0].body.contains("Cancelled plan: Basic Monthly"));

        let audit = h.db.transitions.lock().unwrap();
        assert_eq!(audit[0].source, TransitionSource::Cancellation);
        assert_eq!(audit[0].subscription_id.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn cancel_without_subscription_data_is_not_found_and_writes_nothing() {
        let user = sample_user("viewer@moviolive.test");
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));

        let err = h
            .service
            .cancel_subscription(user_id, OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound("subscription")));
        assert_eq!(h.db.state_write_count(), 0);
        assert!(h.stripe.cancelled().is_empty());
        assert!(h.mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_survives_mail_failure() {
        let now = OffsetDateTime::now_utc();
        let user = active_user("host@moviolive.test", "sub_1", now + Duration::days(20));
        let user_id = user.id;
        let h = harness_with(
            MockDb::with_user(user),
            MockStripeService::new(),
            MockMailer::failing(),
        );
        let outcome = h.service.cancel_subscription(user_id, now).await.unwrap();
        assert!(outcome.processor_cancelled);
        assert_eq!(h.stripe.cancelled(), vec!["sub_1".to_string()]);
    }

    #[tokio::test]
    async fn access_check_self_heals_expired_subscription() {
        let now = OffsetDateTime::now_utc();
        let user = active_user("late@moviolive.test", "sub_late", now - Duration::minutes(5));
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));

        let access = h.service.evaluate_access(user_id, now).await.unwrap();
        assert!(!access.has_access);
        assert!(access.is_expired);
        assert_eq!(access.expired_message.as_deref(), Some(EXPIRED_MESSAGE));
        assert_eq!(access.status, SubscriptionStatus::Inactive);

        let user = h.db.user(user_id).unwrap();
        assert_eq!(user.roles, vec![Role::Audience]);
        assert!(user.subscription.subscription_id.is_none());

        let again = h.service.evaluate_access(user_id, now).await.unwrap();
        assert!(!again.has_access);
        assert!(again.is_expired);
        assert_eq!(again.expired_message.as_deref(), Some(EXPIRED_MESSAGE));
        assert_eq!(h.db.transitions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn access_after_sweep_reports_expiry() {
        let now = OffsetDateTime::now_utc();
        let user = active_user("swept@moviolive.test", "sub_swept", now - Duration::hours(1));
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));

        let report = h.service.sweep_expired(now, 50).await.unwrap();
        assert_eq!(report.downgraded, 1);
        assert!(h.db.user(user_id).unwrap().subscription.current_period_end.is_none());

        let access = h
            .service
            .evaluate_access(user_id, now + Duration::minutes(1))
            .await
            .unwrap();
        assert!(!access.has_access);
        assert!(access.is_expired);
        assert_eq!(access.expired_message.as_deref(), Some(EXPIRED_MESSAGE));
    }

    #[tokio::test]
    async fn access_after_cancellation_is_not_an_expiry() {
        let now = OffsetDateTime::now_utc();
        let user = active_user("quit@moviolive.test", "sub_quit", now + Duration::days(9));
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));

        h.service.cancel_subscription(user_id, now).await.unwrap();
        let access = h.service.evaluate_access(user_id, now).await.unwrap();
        assert!(!access.has_access);
        assert!(!access.is_expired);
        assert!(access.expired_message.is_none());
    }

    #[tokio::test]
    async fn never_subscribed_user_is_not_expired() {
        let user = sample_user("new@moviolive.test");
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));

        let access = h
            .service
            .evaluate_access(user_id, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(!access.is_expired);
    }

    #[tokio::test]
    async fn access_check_reports_active_subscription() {
        let now = OffsetDateTime::now_utc();
        let end = now + Duration::days(4);
        let user = active_user("host@moviolive.test", "sub_1", end);
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));

        let access = h.service.evaluate_access(user_id, now).await.unwrap();
        assert!(access.has_access);
        assert_eq!(access.expires_at, Some(end));
        assert_eq!(access.plan_name.as_deref(), Some("Basic Monthly"));
        assert_eq!(h.db.state_write_count(), 0);
    }

    #[tokio::test]
    async fn access_check_repairs_drifted_roles() {
        let mut user = sample_user("drift@moviolive.test");
        user.roles = vec![Role::Audience, Role::Organizer];
        let user_id = user.id;
        let h = harness(MockDb::with_user(user));

        let access = h
            .service
            .evaluate_access(user_id, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(!access.has_access);
        assert_eq!(h.db.user(user_id).unwrap().roles, vec![Role::Audience]);
    }

    #[tokio::test]
    async fn session_details_include_plan_name() {
        let stripe = MockStripeService::new()
            .with_session(json!({ "id": "cs_test_9", "subscription": "sub_9", "payment_status": "paid" }))
            .with_subscription(json!({
                "id": "sub_9",
                "items": { "data": [ { "price": { "nickname": "Premium Yearly" } } ] }
            }));
        let h = harness_with(MockDb::default(), stripe, MockMailer::default());

        let session = h.service.checkout_session_details("cs_test_9").await.unwrap();
        assert_eq!(session["plan_name"], "Premium Yearly");
        assert_eq!(session["payment_status"], "paid");

        let missing = h.service.checkout_session_details("cs_missing").await;
        assert!(matches!(missing, Err(BillingError::Processor(_))));
    }
}
