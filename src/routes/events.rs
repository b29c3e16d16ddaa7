use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    models::event::NewEvent, responses::JsonResponse, routes::auth::session::AuthSession,
    state::AppState,
};

const MAX_TITLE_LENGTH: usize = 200;

#[derive(Debug, Deserialize)]
pub struct CreateEventPayload {
    #[serde(default)]
    pub title: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub starts_at: Option<OffsetDateTime>,
    pub price: Option<f64>,
}

/// Whole cents from a decimal price. `None` for negative or non-finite input.
fn price_to_cents(price: f64) -> Option<i64> {
    (price.is_finite() && price >= 0.0 && price < 1e12).then(|| (price * 100.0).round() as i64)
}

/// Mounted behind the subscription gate, so only organizers reach it.
pub async fn create_event(
    State(app_state): State<AppState>,
    session: AuthSession,
    Json(payload): Json<CreateEventPayload>,
) -> Response {
    let user_id = match session.user_id() {
        Ok(id) => id,
        Err(_) => return JsonResponse::unauthorized("Invalid user ID").into_response(),
    };

    let title = payload.title.trim();
    let (Some(starts_at), Some(price)) = (payload.starts_at, payload.price) else {
        return JsonResponse::bad_request("All fields are required").into_response();
    };
    if title.is_empty() || title.chars().count() > MAX_TITLE_LENGTH {
        return JsonResponse::bad_request("Title must be between 1 and 200 characters")
            .into_response();
    }
    let Some(price_cents) = price_to_cents(price) else {
        return JsonResponse::bad_request("Price must be a valid positive number").into_response();
    };

    let new_event = NewEvent {
        user_id,
        title: title.to_string(),
        starts_at,
        price_cents,
    };
    match app_state.events.create_event(&new_event).await {
        Ok(event) => {
            info!(%user_id, event_id = %event.id, "event created");
            (
                StatusCode::CREATED,
                Json(json!({
                    "success": true,
                    "message": "Event created successfully",
                    "event": event,
                })),
            )
                .into_response()
        }
        Err(err) => {
            error!(?err, %user_id, "failed to create event");
            JsonResponse::server_error("Server error while creating event").into_response()
        }
    }
}

pub async fn list_events(State(app_state): State<AppState>) -> Response {
    match app_state.events.list_events().await {
        Ok(events) => Json(json!({
            "success": true,
            "total_events": events.len(),
            "events": events,
        }))
        .into_response(),
        Err(err) => {
            error!(?err, "failed to list events");
            JsonResponse::server_error("Server error while fetching events").into_response()
        }
    }
}

pub async fn list_my_events(State(app_state): State<AppState>, session: AuthSession) -> Response {
    let user_id = match session.user_id() {
        Ok(id) => id,
        Err(_) => return JsonResponse::unauthorized("Invalid user ID").into_response(),
    };

    match app_state.events.list_events_for_user(user_id).await {
        Ok(events) => Json(json!({
            "success": true,
            "total_events": events.len(),
            "events": events,
        }))
        .into_response(),
        Err(err) => {
            error!(?err, %user_id, "failed to list user events");
            JsonResponse::server_error("Server error while fetching events").into_response()
        }
    }
}

pub async fn delete_event(
    State(app_state): State<AppState>,
    session: AuthSession,
    Path(event_id): Path<Uuid>,
) -> Response {
    let user_id = match session.user_id() {
        Ok(id) => id,
        Err(_) => return JsonResponse::unauthorized("Invalid user ID").into_response(),
    };

    match app_state.events.delete_event(event_id, user_id).await {
        Ok(true) => {
            info!(%user_id, %event_id, "event deleted");
            Json(json!({
                "success": true,
                "message": "Event deleted successfully",
                "event_id": event_id,
            }))
            .into_response()
        }
        Ok(false) => JsonResponse::not_found(
            "Event not found or you don't have permission to delete this event",
        )
        .into_response(),
        Err(err) => {
            error!(?err, %user_id, %event_id, "failed to delete event");
            JsonResponse::server_error("Server error while deleting event").into_response()
        }
    }
}
