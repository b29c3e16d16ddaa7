use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::subscription_transition_repository::SubscriptionTransitionRepository;
use crate::models::subscription_transition::NewSubscriptionTransition;

pub struct PostgresSubscriptionTransitionRepository {
    pub pool: PgPool,
}

#[async_trait]
impl SubscriptionTransitionRepository for PostgresSubscriptionTransitionRepository {
    async fn record_transition(
        &self,
        transition: &NewSubscriptionTransition,
    ) -> Result<(), sqlx::Error> {
        sqlx::query::<Postgres>(
            r#"
            INSERT INTO subscription_transitions
                (id, user_id, source, event_id, from_status, to_status, subscription_id, note, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(transition.user_id)
        .bind(transition.source.as_str())
        .bind(transition.event_id.as_deref())
        .bind(transition.from_status.as_str())
        .bind(transition.to_status.as_str())
        .bind(transition.subscription_id.as_deref())
        .bind(transition.note.as_deref())
        .bind(transition.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last_expired_at(&self, user_id: Uuid) -> Result<Option<OffsetDateTime>, sqlx::Error> {
        sqlx::query_scalar::<Postgres, OffsetDateTime>(
            r#"
            SELECT created_at FROM (
                SELECT source, to_status, created_at
                FROM subscription_transitions
                WHERE user_id = $1
                ORDER BY created_at DESC
                LIMIT 1
            ) latest
            WHERE source IN ('sweep', 'gate') AND to_status = 'inactive'
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }
}
