//! HTTP error mapping
//!
//! Storage and gateway error text is logged here and never returned to the caller.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use retreat_billing::{BillingError, Rejection};
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("webhook rejected: {0}")]
    Rejected(Rejection),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn rejection_category(rejection: &Rejection) -> &'static str {
        match rejection {
            Rejection::MissingSignature => "missing_signature",
            Rejection::MalformedSignature => "malformed_signature",
            Rejection::SecretNotConfigured => "verification_unavailable",
            Rejection::SignatureMismatch => "invalid_signature",
            Rejection::StaleTimestamp { .. } => "stale_timestamp",
            Rejection::MalformedPayload => "malformed_payload",
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::WebhookRejected(rejection) => ApiError::Rejected(rejection),
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Rejected(rejection) => (
                StatusCode::BAD_REQUEST,
                Self::rejection_category(rejection).to_string(),
            ),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ApiError::from(BillingError::WebhookRejected(Rejection::SignatureMismatch)),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(BillingError::NotFound("evt".to_string())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(BillingError::Database("connection reset".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_stale_timestamp_category_hides_skew() {
        let category = ApiError::rejection_category(&Rejection::StaleTimestamp { skew_secs: 900 });
        assert_eq!(category, "stale_timestamp");
    }
}
