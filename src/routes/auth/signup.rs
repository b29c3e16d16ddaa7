use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    models::signup::SignupPayload,
    responses::JsonResponse,
    routes::users::{normalize_email, normalize_name},
    state::AppState,
    utils::password::hash_password,
};

const MIN_PASSWORD_LENGTH: usize = 8;

/// Registers an Audience member. Organizer only ever comes from a paid
/// subscription, so signup never grants it.
pub async fn handle_signup(
    State(app_state): State<AppState>,
    Json(payload): Json<SignupPayload>,
) -> Response {
    let Some(email) = normalize_email(&payload.email) else {
        return JsonResponse::bad_request("Invalid email address").into_response();
    };
    let Some(full_name) = normalize_name(&payload.full_name) else {
        return JsonResponse::bad_request("Name must be between 1 and 100 characters")
            .into_response();
    };
    if payload.password.chars().count() < MIN_PASSWORD_LENGTH {
        return JsonResponse::bad_request("Password must be at least 8 characters")
            .into_response();
    }

    match app_state.db.find_user_by_email(&email).await {
        Ok(None) => {}
        Ok(Some(_)) => return JsonResponse::conflict("User already registered").into_response(),
        Err(err) => {
            error!(?err, "failed to check email before signup");
            return JsonResponse::server_error("Database error").into_response();
        }
    }

    let password_hash = match hash_password(&payload.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!(?err, "password hashing failed");
            return JsonResponse::server_error("Password hashing failed").into_response();
        }
    };

    match app_state
        .db
        .create_user(&email, full_name, &password_hash)
        .await
    {
        Ok(user) => {
            info!(user_id = %user.id, "user signed up");
            (
                StatusCode::CREATED,
                Json(json!({ "success": true, "user": user })),
            )
                .into_response()
        }
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            warn!(constraint = ?db_err.constraint(), "signup raced another registration");
            JsonResponse::conflict("User already registered").into_response()
        }
        Err(err) => {
            error!(?err, "failed to insert user");
            JsonResponse::server_error("Could not create user").into_response()
        }
    }
}
