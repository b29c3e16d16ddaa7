pub mod auth;
pub mod checkout;
pub mod events;
pub mod subscription;
pub mod users;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use crate::state::AppState;
use crate::utils::subscription_gate::{check_subscription, require_subscription};

/// All `/api` routes with state applied. Transport layers (CORS, tracing,
/// rate limiting) are added by the binary.
pub fn build_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/signup", post(auth::handle_signup))
        .route("/login", post(auth::handle_login))
        .route("/logout", post(auth::handle_logout))
        .route("/me", get(auth::handle_me));

    let checkout_routes = Router::new()
        .route(
            "/create-checkout-session",
            post(checkout::create_checkout_session),
        )
        .route("/webhook", post(checkout::stripe_webhook))
        .route("/session/{session_id}", get(checkout::get_checkout_session))
        .route("/cancel-subscription", post(checkout::cancel_subscription));

    let status_routes = Router::new()
        .route("/status", get(subscription::subscription_status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            check_subscription,
        ));

    let organizer_event_routes = Router::new()
        .route("/create-event", post(events::create_event))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_subscription,
        ));
    let event_routes = Router::new()
        .route("/get-all-events", get(events::list_events))
        .route("/get-user-events", get(events::list_my_events))
        .route("/{event_id}", delete(events::delete_event))
        .merge(organizer_event_routes);

    let user_routes = Router::new()
        .route("/me/name", put(users::rename_user))
        .route("/me/email", put(users::change_email));

    Router::new()
        .nest("/api/auth", auth_routes)
        .nest("/api/checkout", checkout_routes)
        .nest("/api/subscription", status_routes)
        .nest("/api/events", event_routes)
        .nest("/api/users", user_routes)
        .with_state(state)
}
