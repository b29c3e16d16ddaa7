use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SignupPayload {
    pub full_name: String,
    pub email: String,
    pub password: String,
}
