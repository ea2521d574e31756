//! Bearer-secret middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

/// Token from an `Authorization: Bearer <token>` header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Constant-time comparison; an unconfigured secret matches nothing
pub fn secret_matches(configured: Option<&str>, presented: Option<&str>) -> bool {
    match (configured, presented) {
        (Some(expected), Some(token)) => expected.as_bytes().ct_eq(token.as_bytes()).into(),
        _ => false,
    }
}

pub async fn require_cron_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = extract_bearer_token(request.headers());

    if !secret_matches(state.config.cron_secret.as_deref(), presented) {
        tracing::warn!(
            path = %request.uri().path(),
            secret_configured = state.config.cron_secret.is_some(),
            token_present = presented.is_some(),
            "Rejected unauthenticated cron/admin request"
        );
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}
