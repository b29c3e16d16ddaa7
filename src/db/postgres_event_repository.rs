use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres};
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::db::event_repository::EventRepository;
use crate::models::event::{Event, EventStatus, NewEvent};

pub struct PostgresEventRepository {
    pub pool: PgPool,
}

const EVENT_COLUMNS: &str = r#"
    id,
    user_id,
    title,
    starts_at,
    price_cents,
    status,
    viewer_count,
    ticket_count,
    created_at,
    updated_at
"#;

#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    user_id: Uuid,
    title: String,
    starts_at: OffsetDateTime,
    price_cents: i64,
    status: String,
    viewer_count: i32,
    ticket_count: i32,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        let status = EventStatus::parse(&row.status).unwrap_or_else(|| {
            warn!(event_id = %row.id, status = %row.status, "unknown event status in store; treating as upcoming");
            EventStatus::Upcoming
        });
        Event {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            starts_at: row.starts_at,
            price_cents: row.price_cents,
            status,
            viewer_count: row.viewer_count,
            ticket_count: row.ticket_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl EventRepository for PostgresEventRepository {
    async fn create_event(&self, event: &NewEvent) -> Result<Event, sqlx::Error> {
        let sql = format!(
            "INSERT INTO events (id, user_id, title, starts_at, price_cents)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {EVENT_COLUMNS}"
        );
        let row = sqlx::query_as::<Postgres, EventRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(event.user_id)
            .bind(&event.title)
            .bind(event.starts_at)
            .bind(event.price_cents)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn list_events(&self) -> Result<Vec<Event>, sqlx::Error> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY starts_at ASC");
        let rows = sqlx::query_as::<Postgres, EventRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Event::from).collect())
    }

    async fn list_events_for_user(&self, user_id: Uuid) -> Result<Vec<Event>, sqlx::Error> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE user_id = $1 ORDER BY starts_at ASC"
        );
        let rows = sqlx::query_as::<Postgres, EventRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Event::from).collect())
    }

    async fn delete_event(&self, event_id: Uuid, user_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query::<Postgres>("DELETE FROM events WHERE id = $1 AND user_id = $2")
            .bind(event_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
