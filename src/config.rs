use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct StripeSettings {
    pub secret_key: String,
    pub webhook_secret: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub tls_disabled: bool,
}

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub interval: Duration,
    pub batch_size: i64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub frontend_origin: String,
    /// Origin used for checkout success/cancel redirects.
    pub base_url: String,
    pub bind_addr: SocketAddr,
    pub stripe: StripeSettings,
    pub smtp: SmtpSettings,
    pub sweep: SweepSettings,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub auth_cookie_secure: bool,
    pub sentry_dsn: Option<String>,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn optional(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

fn flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value: raw }),
        },
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok(); // Load .env file

        let frontend_origin = required("FRONTEND_ORIGIN")?;
        let base_url = optional("BASE_URL").unwrap_or_else(|| frontend_origin.clone());

        let stripe_timeout: u64 = parsed("STRIPE_TIMEOUT_SECONDS", 10)?;
        let sweep_hours: u64 = parsed("SUBSCRIPTION_SWEEP_INTERVAL_HOURS", 1)?;
        if sweep_hours == 0 {
            return Err(ConfigError::Invalid {
                name: "SUBSCRIPTION_SWEEP_INTERVAL_HOURS",
                value: "0".into(),
            });
        }

        Ok(Config {
            database_url: required("DATABASE_URL")?,
            frontend_origin,
            base_url,
            bind_addr: parsed("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 5000)))?,
            stripe: StripeSettings {
                secret_key: required("STRIPE_SECRET_KEY")?,
                webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
                timeout: Duration::from_secs(stripe_timeout),
            },
            smtp: SmtpSettings {
                host: required("SMTP_HOST")?,
                port: parsed("SMTP_PORT", 587)?,
                username: optional("SMTP_USERNAME"),
                password: optional("SMTP_PASSWORD"),
                from: required("SMTP_FROM")?,
                tls_disabled: flag("SMTP_TLS_DISABLED", false)?,
            },
            sweep: SweepSettings {
                interval: Duration::from_secs(sweep_hours * 60 * 60),
                batch_size: parsed("SUBSCRIPTION_SWEEP_BATCH", 500)?,
            },
            jwt_secret: required("JWT_SECRET")?,
            jwt_issuer: parsed("JWT_ISSUER", "moviolive".to_string())?,
            jwt_audience: parsed("JWT_AUDIENCE", "moviolive-web".to_string())?,
            auth_cookie_secure: flag("AUTH_COOKIE_SECURE", true)?,
            sentry_dsn: optional("SENTRY_DSN"),
        })
    }
}
