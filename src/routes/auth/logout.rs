use axum::{
    extract::State,
    http::{header::SET_COOKIE, StatusCode},
    response::IntoResponse,
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration as TimeDuration;

use super::session::AUTH_COOKIE;
use crate::responses::JsonResponse;
use crate::state::AppState;

pub async fn handle_logout(State(app_state): State<AppState>) -> impl IntoResponse {
    let expired_cookie = Cookie::build((AUTH_COOKIE, ""))
        .path("/")
        .http_only(true)
        .secure(app_state.auth_cookie_secure)
        .same_site(SameSite::Lax)
        .max_age(TimeDuration::seconds(0))
        .build();

    (
        StatusCode::OK,
        [(SET_COOKIE, expired_cookie.to_string())],
        JsonResponse::success("Logged out"),
    )
}
