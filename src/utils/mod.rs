pub mod jwt;
pub mod password;
pub mod stripe_payload;
pub mod stripe_signature;
pub mod subscription_gate;
