pub mod billing;
pub mod smtp_mailer;
pub mod stripe;
