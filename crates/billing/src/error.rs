//! Billing error types

use thiserror::Error;

use crate::verifier::Rejection;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(String),

    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error("webhook rejected: {0}")]
    WebhookRejected(Rejection),

    #[error("malformed gateway event: {0}")]
    MalformedEvent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the gateway should redeliver the event that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_) | BillingError::Gateway(_) | BillingError::Internal(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::Gateway(e.to_string())
    }
}

impl From<Rejection> for BillingError {
    fn from(r: Rejection) -> Self {
        BillingError::WebhookRejected(r)
    }
}
