use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::user::{Role, SubscriptionState, User};

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Inserts an Audience member with no billing history.
    async fn create_user(
        &self,
        email: &str,
        full_name: &str,
        password_hash: &str,
    ) -> Result<User, sqlx::Error>;
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error>;
    async fn find_user_id_by_stripe_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error>;
    async fn find_user_id_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error>;
    async fn set_user_stripe_customer_id(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> Result<(), sqlx::Error>;
    /// Replaces every billing field and the role set in one write.
    async fn write_subscription_state(
        &self,
        user_id: Uuid,
        state: &SubscriptionState,
        roles: &[Role],
    ) -> Result<(), sqlx::Error>;
    /// Users still marked active whose billing period ended at or before `now`.
    async fn list_expired_active_subscriptions(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<User>, sqlx::Error>;
    async fn update_user_name(&self, user_id: Uuid, full_name: &str) -> Result<(), sqlx::Error>;
    async fn update_user_email(&self, user_id: Uuid, email: &str) -> Result<(), sqlx::Error>;
    async fn is_email_taken_by_other(
        &self,
        email: &str,
        user_id: Uuid,
    ) -> Result<bool, sqlx::Error>;
}
