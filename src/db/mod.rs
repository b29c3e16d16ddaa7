pub mod event_repository;
pub mod mock_db;
pub mod mock_stripe_event_log_repository;
pub mod postgres_event_repository;
pub mod postgres_stripe_event_log_repository;
pub mod postgres_subscription_transition_repository;
pub mod postgres_user_repository;
pub mod stripe_event_log_repository;
pub mod subscription_transition_repository;
pub mod user_repository;
