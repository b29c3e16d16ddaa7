use axum::{
    extract::{Extension, Json},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::services::billing::SubscriptionAccess;

/// Access summary attached by the check gate.
pub async fn subscription_status(Extension(access): Extension<SubscriptionAccess>) -> Response {
    Json(json!({ "success": true, "subscription": access })).into_response()
}
