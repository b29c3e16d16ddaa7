use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    responses::JsonResponse,
    routes::auth::session::AuthSession,
    services::billing::{
        BillingError, SubscriptionAccess, EXPIRED_MESSAGE, SUBSCRIPTION_REQUIRED_MESSAGE,
    },
    state::AppState,
};

async fn resolve_access(
    state: &AppState,
    req: Request<Body>,
) -> Result<(Uuid, SubscriptionAccess, Request<Body>), Response> {
    let (mut parts, body) = req.into_parts();
    let session = AuthSession::from_request_parts(&mut parts, state)
        .await
        .map_err(|_| JsonResponse::unauthorized("Session is required").into_response())?;
    let user_id = session
        .user_id()
        .map_err(|_| JsonResponse::unauthorized("Invalid user ID").into_response())?;

    let access = match state
        .billing
        .evaluate_access(user_id, OffsetDateTime::now_utc())
        .await
    {
        Ok(access) => access,
        Err(BillingError::NotFound(_)) => {
            return Err(JsonResponse::not_found("User not found").into_response())
        }
        Err(err) => {
            error!(?err, %user_id, "subscription check failed");
            return Err(JsonResponse::server_error("Failed to check subscription").into_response());
        }
    };

    Ok((user_id, access, Request::from_parts(parts, body)))
}

/// Attaches the caller's [`SubscriptionAccess`] to the request and continues.
pub async fn check_subscription(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let (_, access, mut req) = resolve_access(&state, req).await?;
    req.extensions_mut().insert(access);
    Ok(next.run(req).await)
}

/// Like [`check_subscription`] but answers 403 when the caller has no access.
pub async fn require_subscription(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let (user_id, access, mut req) = resolve_access(&state, req).await?;

    if !access.has_access {
        let was_expired = access.is_expired;
        let message = if was_expired {
            EXPIRED_MESSAGE
        } else {
            SUBSCRIPTION_REQUIRED_MESSAGE
        };
        info!(%user_id, was_expired, "subscription required");
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({
                "message": message,
                "requires_upgrade": true,
                "was_expired_subscription": was_expired,
            })),
        )
            .into_response());
    }

    req.extensions_mut().insert(access);
    Ok(next.run(req).await)
}
