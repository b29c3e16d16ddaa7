use async_trait::async_trait;
use sqlx::error::{BoxDynError, DatabaseError, ErrorKind};
use std::borrow::Cow;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

use super::event_repository::EventRepository;
use super::subscription_transition_repository::SubscriptionTransitionRepository;
use super::user_repository::UserRepository;
use crate::models::event::{Event, EventStatus, NewEvent};
use crate::models::subscription_transition::{NewSubscriptionTransition, TransitionSource};
use crate::models::user::{Role, SubscriptionState, SubscriptionStatus, User};

/// In-memory store used by handler and service tests.
#[derive(Default)]
pub struct MockDb {
    pub users: Mutex<HashMap<Uuid, User>>,
    pub should_fail: bool,
    pub fail_state_writes: bool,
    /// Makes `is_email_taken_by_other` answer `false`, as if another request
    /// claimed the address after the check ran.
    pub stale_email_check: bool,
    pub state_writes: Mutex<usize>,
    pub transitions: Mutex<Vec<NewSubscriptionTransition>>,
    pub events: Mutex<Vec<Event>>,
}

impl MockDb {
    pub fn with_user(user: User) -> Self {
        let db = Self::default();
        db.insert_user(user);
        db
    }

    pub fn insert_user(&self, user: User) {
        self.users.lock().unwrap().insert(user.id, user);
    }

    pub fn user(&self, user_id: Uuid) -> Option<User> {
        self.users.lock().unwrap().get(&user_id).cloned()
    }

    pub fn state_write_count(&self) -> usize {
        *self.state_writes.lock().unwrap()
    }

    fn fail_if_configured(&self) -> Result<(), sqlx::Error> {
        if self.should_fail {
            return Err(sqlx::Error::Protocol("Mock DB failure".into()));
        }
        Ok(())
    }
}

/// What Postgres reports when `users.email` is already taken.
#[derive(Debug)]
pub struct UniqueViolation(pub &'static str);

impl fmt::Display for UniqueViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "duplicate key value violates unique constraint \"{}\"", self.0)
    }
}

impl Error for UniqueViolation {}

impl DatabaseError for UniqueViolation {
    fn message(&self) -> &str {
        "duplicate key value violates unique constraint"
    }

    fn code(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed("23505"))
    }

    fn constraint(&self) -> Option<&str> {
        Some(self.0)
    }

    fn as_error(&self) -> &(dyn Error + Send + Sync + 'static) {
        self
    }

    fn as_error_mut(&mut self) -> &mut (dyn Error + Send + Sync + 'static) {
        self
    }

    fn into_error(self: Box<Self>) -> BoxDynError {
        self
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::UniqueViolation
    }
}

fn email_conflict(
    users: &HashMap<Uuid, User>,
    email: &str,
    except: Option<Uuid>,
) -> Option<sqlx::Error> {
    users
        .values()
        .any(|u| Some(u.id) != except && u.email.eq_ignore_ascii_case(email))
        .then(|| sqlx::Error::Database(Box::new(UniqueViolation("users_email_key"))))
}

/// A verified audience member with no billing history.
pub fn sample_user(email: &str) -> User {
    let now = OffsetDateTime::now_utc();
    User {
        id: Uuid::new_v4(),
        email: email.to_string(),
        password_hash: String::new(),
        full_name: "Test Viewer".into(),
        roles: vec![Role::Audience],
        stripe_customer_id: None,
        subscription: SubscriptionState::inactive(),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl UserRepository for MockDb {
    async fn create_user(
        &self,
        email: &str,
        full_name: &str,
        password_hash: &str,
    ) -> Result<User, sqlx::Error> {
        self.fail_if_configured()?;
        let mut users = self.users.lock().unwrap();
        if let Some(err) = email_conflict(&users, email, None) {
            return Err(err);
        }
        let mut user = sample_user(email);
        user.full_name = full_name.to_string();
        user.password_hash = password_hash.to_string();
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
        self.fail_if_configured()?;
        Ok(self.user(user_id))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        self.fail_if_configured()?;
        Ok(self
            .users
            .lock()
            .unwrap()
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_user_id_by_stripe_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        self.fail_if_configured()?;
        Ok(self
            .users
            .lock()
            .unwrap()
            .values()
            .find(|u| u.stripe_customer_id.as_deref() == Some(customer_id))
            .map(|u| u.id))
    }

    async fn find_user_id_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        self.fail_if_configured()?;
        Ok(self
            .users
            .lock()
            .unwrap()
            .values()
            .find(|u| u.subscription.subscription_id.as_deref() == Some(subscription_id))
            .map(|u| u.id))
    }

    async fn set_user_stripe_customer_id(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> Result<(), sqlx::Error> {
        self.fail_if_configured()?;
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(&user_id).ok_or(sqlx::Error::RowNotFound)?;
        user.stripe_customer_id = Some(customer_id.to_string());
        Ok(())
    }

    async fn write_subscription_state(
        &self,
        user_id: Uuid,
        state: &SubscriptionState,
        roles: &[Role],
    ) -> Result<(), sqlx::Error> {
        self.fail_if_configured()?;
        if self.fail_state_writes {
            return Err(sqlx::Error::Protocol("Mock state write failure".into()));
        }
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(&user_id).ok_or(sqlx::Error::RowNotFound)?;
        user.subscription = state.clone();
        user.roles = roles.to_vec();
        user.updated_at = OffsetDateTime::now_utc();
        *self.state_writes.lock().unwrap() += 1;
        Ok(())
    }

    async fn list_expired_active_subscriptions(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<User>, sqlx::Error> {
        self.fail_if_configured()?;
        let mut expired: Vec<User> = self
            .users
            .lock()
            .unwrap()
            .values()
            .filter(|u| {
                u.subscription.status == SubscriptionStatus::Active
                    && u.subscription.current_period_end.is_some_and(|end| end <= now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|u| u.subscription.current_period_end);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn update_user_name(&self, user_id: Uuid, full_name: &str) -> Result<(), sqlx::Error> {
        self.fail_if_configured()?;
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(&user_id).ok_or(sqlx::Error::RowNotFound)?;
        user.full_name = full_name.to_string();
        Ok(())
    }

    async fn update_user_email(&self, user_id: Uuid, email: &str) -> Result<(), sqlx::Error> {
        self.fail_if_configured()?;
        let mut users = self.users.lock().unwrap();
        if let Some(err) = email_conflict(&users, email, Some(user_id)) {
            return Err(err);
        }
        let user = users.get_mut(&user_id).ok_or(sqlx::Error::RowNotFound)?;
        user.email = email.to_string();
        Ok(())
    }

    async fn is_email_taken_by_other(
        &self,
        email: &str,
        user_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        self.fail_if_configured()?;
        if self.stale_email_check {
            return Ok(false);
        }
        Ok(self
            .users
            .lock()
            .unwrap()
            .values()
            .any(|u| u.id != user_id && u.email.eq_ignore_ascii_case(email)))
    }
}

#[async_trait]
impl SubscriptionTransitionRepository for MockDb {
    async fn record_transition(
        &self,
        transition: &NewSubscriptionTransition,
    ) -> Result<(), sqlx::Error> {
        self.transitions.lock().unwrap().push(transition.clone());
        Ok(())
    }

    async fn last_expired_at(&self, user_id: Uuid) -> Result<Option<OffsetDateTime>, sqlx::Error> {
        self.fail_if_configured()?;
        let transitions = self.transitions.lock().unwrap();
        Ok(transitions
            .iter()
            .rev()
            .find(|t| t.user_id == user_id)
            .filter(|t| {
                matches!(t.source, TransitionSource::Sweep | TransitionSource::Gate)
                    && t.to_status == SubscriptionStatus::Inactive
            })
            .map(|t| t.created_at))
    }
}

#[async_trait]
impl EventRepository for MockDb {
    async fn create_event(&self, event: &NewEvent) -> Result<Event, sqlx::Error> {
        self.fail_if_configured()?;
        let now = OffsetDateTime::now_utc();
        let created = Event {
            id: Uuid::new_v4(),
            user_id: event.user_id,
            title: event.title.clone(),
            starts_at: event.starts_at,
            price_cents: event.price_cents,
            status: EventStatus::Upcoming,
            viewer_count: 0,
            ticket_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.events.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn list_events(&self) -> Result<Vec<Event>, sqlx::Error> {
        self.fail_if_configured()?;
        let mut events = self.events.lock().unwrap().clone();
        events.sort_by_key(|e| e.starts_at);
        Ok(events)
    }

    async fn list_events_for_user(&self, user_id: Uuid) -> Result<Vec<Event>, sqlx::Error> {
        let mut events = self.list_events().await?;
        events.retain(|e| e.user_id == user_id);
        Ok(events)
    }

    async fn delete_event(&self, event_id: Uuid, user_id: Uuid) -> Result<bool, sqlx::Error> {
        self.fail_if_configured()?;
        let mut events = self.events.lock().unwrap();
        let before = events.len();
        events.retain(|e| !(e.id == event_id && e.user_id == user_id));
        Ok(events.len() < before)
    }
}
