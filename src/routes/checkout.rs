use axum::{
    body::Bytes,
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::{
    responses::JsonResponse,
    routes::auth::session::AuthSession,
    services::billing::{BillingError, CheckoutRequest, WebhookOutcome},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutPayload {
    #[serde(default)]
    pub price_id: String,
    pub plan_type: Option<String>,
    pub billing_period: Option<String>,
}

pub async fn create_checkout_session(
    State(app_state): State<AppState>,
    session: AuthSession,
    Json(payload): Json<CreateCheckoutPayload>,
) -> Response {
    let user_id = match session.user_id() {
        Ok(id) => id,
        Err(_) => return JsonResponse::unauthorized("Invalid user ID").into_response(),
    };

    let price_id = payload.price_id.trim();
    if price_id.is_empty() {
        return JsonResponse::bad_request("Price ID is required").into_response();
    }

    let request = CheckoutRequest {
        price_id: price_id.to_string(),
        plan_type: payload.plan_type,
        billing_period: payload.billing_period,
    };

    match app_state
        .billing
        .create_checkout_session(user_id, request)
        .await
    {
        Ok(checkout) => Json(json!({
            "success": true,
            "url": checkout.url,
            "session_id": checkout.id,
        }))
        .into_response(),
        Err(BillingError::NotFound(_)) => JsonResponse::not_found("User not found").into_response(),
        Err(BillingError::Processor(message)) => {
            JsonResponse::server_error(&message).into_response()
        }
        Err(err) => {
            error!(?err, %user_id, "checkout session creation failed");
            JsonResponse::server_error("Failed to create checkout session").into_response()
        }
    }
}

/// Raw body so the signature is checked over the exact bytes sent.
pub async fn stripe_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|value| value.to_str().ok());

    match app_state.billing.handle_webhook(&body, signature).await {
        Ok(outcome) => {
            if outcome == WebhookOutcome::Failed {
                warn!("stripe webhook acknowledged after handler failure");
            }
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Err(BillingError::Signature(err)) => {
            warn!(%err, "rejected stripe webhook signature");
            JsonResponse::bad_request("Invalid signature").into_response()
        }
        Err(BillingError::Payload(message)) => {
            warn!(%message, "rejected stripe webhook payload");
            JsonResponse::bad_request("Invalid payload").into_response()
        }
        Err(err) => {
            error!(?err, "stripe webhook processing error");
            JsonResponse::server_error("Webhook processing failed").into_response()
        }
    }
}

pub async fn get_checkout_session(
    State(app_state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match app_state.billing.checkout_session_details(&session_id).await {
        Ok(session) => Json(session).into_response(),
        Err(err) => {
            error!(?err, %session_id, "failed to retrieve checkout session");
            JsonResponse::server_error(&err.to_string()).into_response()
        }
    }
}

pub async fn cancel_subscription(
    State(app_state): State<AppState>,
    session: AuthSession,
) -> Response {
    let user_id = match session.user_id() {
        Ok(id) => id,
        Err(_) => return JsonResponse::unauthorized("Invalid user ID").into_response(),
    };

    match app_state
        .billing
        .cancel_subscription(user_id, OffsetDateTime::now_utc())
        .await
    {
        Ok(outcome) => {
            info!(%user_id, processor_cancelled = outcome.processor_cancelled, "subscription cancelled");
            Json(json!({
                "success": true,
                "message": "Subscription cancelled successfully",
                "plan_name": outcome.plan_name,
            }))
            .into_response()
        }
        Err(BillingError::NotFound(_)) => {
            JsonResponse::not_found("No active subscription found").into_response()
        }
        Err(err) => {
            error!(?err, %user_id, "failed to cancel subscription");
            JsonResponse::server_error("Failed to cancel subscription").into_response()
        }
    }
}
