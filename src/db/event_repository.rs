use async_trait::async_trait;
use uuid::Uuid;

use crate::models::event::{Event, NewEvent};

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn create_event(&self, event: &NewEvent) -> Result<Event, sqlx::Error>;
    /// Every event, soonest first.
    async fn list_events(&self) -> Result<Vec<Event>, sqlx::Error>;
    async fn list_events_for_user(&self, user_id: Uuid) -> Result<Vec<Event>, sqlx::Error>;
    /// Deletes the event only when `user_id` owns it. Returns whether a row went away.
    async fn delete_event(&self, event_id: Uuid, user_id: Uuid) -> Result<bool, sqlx::Error>;
}
