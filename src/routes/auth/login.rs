use crate::routes::auth::claims::Claims;
use crate::{
    responses::JsonResponse,
    state::AppState,
    utils::{jwt::create_jwt, password::verify_password},
};

use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use serde::Deserialize;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};

use super::session::{AuthSession, AUTH_COOKIE};

const SESSION_LENGTH: Duration = Duration::days(1);

#[derive(Deserialize)]
pub struct LoginPayload {
    pub email: String,
    pub password: String,
}

pub async fn handle_login(
    State(app_state): State<AppState>,
    Json(payload): Json<LoginPayload>,
) -> Response {
    let email = payload.email.trim().to_lowercase();
    let user = match app_state.db.find_user_by_email(&email).await {
        Ok(Some(record)) => record,
        Ok(None) => return JsonResponse::unauthorized("Invalid credentials").into_response(),
        Err(err) => {
            error!(?err, "failed to load user for login");
            return JsonResponse::server_error("Database error").into_response();
        }
    };

    if user.password_hash.trim().is_empty() {
        return JsonResponse::unauthorized("Invalid credentials").into_response();
    }

    match verify_password(&payload.password, &user.password_hash) {
        Ok(true) => {}
        Ok(false) => {
            warn!(user_id = %user.id, "login rejected: wrong password");
            return JsonResponse::unauthorized("Invalid credentials").into_response();
        }
        Err(err) => {
            error!(?err, user_id = %user.id, "password verification error");
            return JsonResponse::server_error("Internal error").into_response();
        }
    }

    let claims = Claims {
        id: user.id.to_string(),
        email: user.email.clone(),
        full_name: user.full_name.clone(),
        exp: (OffsetDateTime::now_utc() + SESSION_LENGTH).unix_timestamp() as usize,
        iss: String::new(),
        aud: String::new(),
    };

    let token = match create_jwt(
        claims,
        &app_state.jwt_keys,
        &app_state.jwt_issuer,
        &app_state.jwt_audience,
    ) {
        Ok(token) => token,
        Err(err) => {
            error!(?err, "failed to sign session token");
            return JsonResponse::server_error("Token generation failed").into_response();
        }
    };

    let cookie = Cookie::build((AUTH_COOKIE, token))
        .http_only(true)
        .secure(app_state.auth_cookie_secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(SESSION_LENGTH)
        .build();

    info!(user_id = %user.id, "user logged in");
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie.to_string())],
        Json(json!({ "success": true, "user": user })),
    )
        .into_response()
}

/// Current user with roles derived from the stored subscription state.
pub async fn handle_me(State(app_state): State<AppState>, session: AuthSession) -> Response {
    let user_id = match session.user_id() {
        Ok(id) => id,
        Err(_) => return JsonResponse::unauthorized("Invalid user ID").into_response(),
    };

    match app_state.db.find_user_by_id(user_id).await {
        Ok(Some(mut user)) => {
            user.roles = user.subscription.roles_at(OffsetDateTime::now_utc());
            Json(json!({ "success": true, "user": user })).into_response()
        }
        Ok(None) => JsonResponse::not_found("User not found").into_response(),
        Err(err) => {
            error!(?err, %user_id, "failed to load current user");
            JsonResponse::server_error("Database error").into_response()
        }
    }
}
