use crate::db::event_repository::EventRepository;
use crate::db::user_repository::UserRepository;
use crate::services::billing::BillingService;
use crate::services::stripe::StripeService;
use crate::utils::jwt::{JwtKeyProvider, JwtKeys};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn UserRepository>,
    pub events: Arc<dyn EventRepository>,
    pub billing: Arc<BillingService>,
    pub stripe: Arc<dyn StripeService>,
    pub jwt_keys: Arc<JwtKeys>,
    pub jwt_issuer: Arc<str>,
    pub jwt_audience: Arc<str>,
    pub auth_cookie_secure: bool,
}

impl JwtKeyProvider for AppState {
    fn jwt_keys(&self) -> &JwtKeys {
        &self.jwt_keys
    }

    fn jwt_issuer(&self) -> &str {
        &self.jwt_issuer
    }

    fn jwt_audience(&self) -> &str {
        &self.jwt_audience
    }
}
