pub mod event;
pub mod signup;
pub mod subscription_transition;
pub mod user;
