use axum::{
    extract::{Json, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    responses::JsonResponse, routes::auth::session::AuthSession, state::AppState,
    utils::password::verify_password,
};

const MAX_NAME_LENGTH: usize = 100;

#[derive(Debug, Deserialize)]
pub struct RenamePayload {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeEmailPayload {
    pub email: String,
    pub current_password: String,
}

pub(crate) fn normalize_name(raw: &str) -> Option<&str> {
    let name = raw.trim();
    (!name.is_empty() && name.chars().count() <= MAX_NAME_LENGTH).then_some(name)
}

pub(crate) fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(email)
}

pub async fn rename_user(
    State(app_state): State<AppState>,
    session: AuthSession,
    Json(payload): Json<RenamePayload>,
) -> Response {
    let user_id = match session.user_id() {
        Ok(id) => id,
        Err(_) => return JsonResponse::unauthorized("Invalid user ID").into_response(),
    };
    let Some(full_name) = normalize_name(&payload.full_name) else {
        return JsonResponse::bad_request("Name must be between 1 and 100 characters")
            .into_response();
    };

    match app_state.db.update_user_name(user_id, full_name).await {
        Ok(()) => Json(json!({ "success": true, "full_name": full_name })).into_response(),
        Err(sqlx::Error::RowNotFound) => JsonResponse::not_found("User not found").into_response(),
        Err(err) => {
            error!(?err, %user_id, "failed to update name");
            JsonResponse::server_error("Failed to update name").into_response()
        }
    }
}

pub async fn change_email(
    State(app_state): State<AppState>,
    session: AuthSession,
    Json(payload): Json<ChangeEmailPayload>,
) -> Response {
    let user_id = match session.user_id() {
        Ok(id) => id,
        Err(_) => return JsonResponse::unauthorized("Invalid user ID").into_response(),
    };
    let Some(email) = normalize_email(&payload.email) else {
        return JsonResponse::bad_request("Invalid email address").into_response();
    };

    let user = match app_state.db.find_user_by_id(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return JsonResponse::not_found("User not found").into_response(),
        Err(err) => {
            error!(?err, %user_id, "failed to load user for email change");
            return JsonResponse::server_error("Database error").into_response();
        }
    };

    match verify_password(&payload.current_password, &user.password_hash) {
        Ok(true) => {}
        Ok(false) => return JsonResponse::unauthorized("Incorrect password").into_response(),
        Err(err) => {
            warn!(?err, %user_id, "password verification failed during email change");
            return JsonResponse::unauthorized("Incorrect password").into_response();
        }
    }

    match app_state.db.is_email_taken_by_other(&email, user_id).await {
        Ok(false) => {}
        Ok(true) => return JsonResponse::conflict("Email is already in use").into_response(),
        Err(err) => {
            error!(?err, %user_id, "failed to check email availability");
            return JsonResponse::server_error("Database error").into_response();
        }
    }

    match app_state.db.update_user_email(user_id, &email).await {
        Ok(()) => {}
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            warn!(%user_id, constraint = ?db_err.constraint(), "email claimed concurrently");
            return JsonResponse::conflict("Email is already in use").into_response();
        }
        Err(err) => {
            error!(?err, %user_id, "failed to update email");
            return JsonResponse::server_error("Failed to update email").into_response();
        }
    }

    if let Some(customer_id) = user.stripe_customer_id.as_deref() {
        if let Err(err) = app_state
            .stripe
            .update_customer_email(customer_id, &email)
            .await
        {
            warn!(?err, %user_id, customer_id, "failed to sync email to stripe customer");
        }
    }

    info!(%user_id, "email changed");
    Json(json!({ "success": true, "email": email })).into_response()
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use serde_json::json;
    use tower::ServiceExt;

    use super::{normalize_email, normalize_name};
    use crate::db::mock_db::{sample_user, MockDb};
    use crate::models::user::User;
    use crate::routes::build_router;
    use crate::routes::test_support::{body_json, session_cookie, test_app};
    use crate::services::stripe::MockStripeService;
    use crate::utils::password::hash_password;

    fn put_json(path: &str, user: &User, body: serde_json::Value) -> Request<Body> {
        Request::put(path)
            .header(header::COOKIE, session_cookie(user))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn user_with_password(email: &str) -> User {
        let mut user = sample_user(email);
        user.password_hash = hash_password("s3cret-pass").unwrap();
        user
    }

    #[test]
    fn email_and_name_validation() {
        assert_eq!(
            normalize_email(" Ada@MovioLive.Test "),
            Some("ada@moviolive.test".to_string())
        );
        assert_eq!(normalize_email("no-at-sign"), None);
        assert_eq!(normalize_email("@moviolive.test"), None);
        assert_eq!(normalize_email("a@b@c"), None);

        assert_eq!(normalize_name("  Ada  "), Some("Ada"));
        assert_eq!(normalize_name("   "), None);
        assert_eq!(normalize_name(&"x".repeat(101)), None);
    }

    #[tokio::test]
    async fn rename_trims_and_persists() {
        let user = sample_user("viewer@moviolive.test");
        let app = test_app(MockDb::with_user(user.clone()), MockStripeService::new());

        let res = build_router(app.state.clone())
            .oneshot(put_json(
                "/api/users/me/name",
                &user,
                json!({"full_name": "  Grace Hopper "}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(app.db.user(user.id).unwrap().full_name, "Grace Hopper");
    }

    #[tokio::test]
    async fn email_change_syncs_stripe_customer() {
        let mut user = user_with_password("viewer@moviolive.test");
        user.stripe_customer_id = Some("cus_viewer".into());
        let app = test_app(MockDb::with_user(user.clone()), MockStripeService::new());

        let res = build_router(app.state.clone())
            .oneshot(put_json(
                "/api/users/me/email",
                &user,
                json!({"email": "New@MovioLive.test", "current_password": "s3cret-pass"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await["email"], "new@moviolive.test");
        assert_eq!(app.db.user(user.id).unwrap().email, "new@moviolive.test");
        assert_eq!(
            app.stripe.customer_email_updates.lock().unwrap().clone(),
            vec![("cus_viewer".to_string(), "new@moviolive.test".to_string())]
        );
    }

    #[tokio::test]
    async fn email_change_survives_stripe_failure() {
        let mut user = user_with_password("viewer@moviolive.test");
        user.stripe_customer_id = Some("cus_viewer".into());
        let app = test_app(
            MockDb::with_user(user.clone()),
            MockStripeService::new().with_failing_customer_update(),
        );

        let res = build_router(app.state.clone())
            .oneshot(put_json(
                "/api/users/me/email",
                &user,
                json!({"email": "new@moviolive.test", "current_password": "s3cret-pass"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(app.db.user(user.id).unwrap().email, "new@moviolive.test");
    }

    #[tokio::test]
    async fn email_change_rejects_taken_address_and_wrong_password() {
        let user = user_with_password("viewer@moviolive.test");
        let other = sample_user("taken@moviolive.test");
        let db = MockDb::with_user(user.clone());
        db.insert_user(other);
        let app = test_app(db, MockStripeService::new());
        let router = build_router(app.state.clone());

        let res = router
            .clone()
            .oneshot(put_json(
                "/api/users/me/email",
                &user,
                json!({"email": "taken@moviolive.test", "current_password": "s3cret-pass"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let res = router
            .oneshot(put_json(
                "/api/users/me/email",
                &user,
                json!({"email": "fresh@moviolive.test", "current_password": "wrong"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(app.db.user(user.id).unwrap().email, "viewer@moviolive.test");
    }

    #[tokio::test]
    async fn email_claimed_after_availability_check_is_a_conflict() {
        let mut user = user_with_password("viewer@moviolive.test");
        user.stripe_customer_id = Some("cus_viewer".into());
        let db = MockDb {
            stale_email_check: true,
            ..Default::default()
        };
        db.insert_user(user.clone());
        db.insert_user(sample_user("taken@moviolive.test"));
        let app = test_app(db, MockStripeService::new());

        let res = build_router(app.state.clone())
            .oneshot(put_json(
                "/api/users/me/email",
                &user,
                json!({"email": "taken@moviolive.test", "current_password": "s3cret-pass"}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(res).await["message"], "Email is already in use");
        assert_eq!(app.db.user(user.id).unwrap().email, "viewer@moviolive.test");
        assert!(app.stripe.customer_email_updates.lock().unwrap().is_empty());
    }
}
