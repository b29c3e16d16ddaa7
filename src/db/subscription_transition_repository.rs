use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::subscription_transition::NewSubscriptionTransition;

#[async_trait]
pub trait SubscriptionTransitionRepository: Send + Sync {
    async fn record_transition(
        &self,
        transition: &NewSubscriptionTransition,
    ) -> Result<(), sqlx::Error>;

    /// When the user's most recent transition was an expiry downgrade (sweep
    /// or access check), returns when it happened.
    async fn last_expired_at(&self, user_id: Uuid) -> Result<Option<OffsetDateTime>, sqlx::Error>;
}
