use async_trait::async_trait;
use lettre::address::AddressError;
use lettre::transport::smtp::Error as SmtpError;
use std::any::Any;
use std::fmt;

#[derive(Debug)]
pub enum MailError {
    InvalidEmailAddress(String),
    SendError(String),
    Other(String),
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailError::InvalidEmailAddress(e) => write!(f, "Invalid Address: {}", e),
            MailError::SendError(e) => write!(f, "Send error: {}", e),
            MailError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for MailError {}

impl From<SmtpError> for MailError {
    fn from(err: SmtpError) -> Self {
        MailError::SendError(err.to_string())
    }
}

impl From<lettre::error::Error> for MailError {
    fn from(err: lettre::error::Error) -> Self {
        MailError::SendError(err.to_string())
    }
}

impl From<AddressError> for MailError {
    fn from(e: AddressError) -> Self {
        MailError::InvalidEmailAddress(e.to_string())
    }
}

/// Outbound plain-text mail. Billing notifications are best-effort, so
/// callers log failures instead of propagating them.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email_generic(&self, to: &str, subject: &str, body: &str)
        -> Result<(), MailError>;
    fn as_any(&self) -> &dyn Any;
}

mod mock_mailer;
mod smtp_impl;

pub use mock_mailer::{MockMailer, SentEmail};
pub use smtp_impl::SmtpMailer;
