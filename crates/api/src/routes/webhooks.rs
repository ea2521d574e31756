//! Inbound webhooks
//!
//! Both endpoints take the raw body as a string: signatures are computed over the
//! exact bytes the sender produced.

use axum::{extract::State, http::HeaderMap, Json};
use retreat_billing::{EmailEventOutcome, SvixHeaders, WebhookOutcome};
use serde::Serialize;

use crate::error::ApiResult;
use crate::state::AppState;

const STRIPE_SIGNATURE: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct Acknowledged<T> {
    pub received: bool,
    pub outcome: T,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// 200 once processed or recognised as a duplicate; 400 on verification failure;
/// 500 when processing failed in a way a redelivery can fix
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Acknowledged<WebhookOutcome>>> {
    let outcome = state
        .billing
        .webhooks
        .handle(&body, header(&headers, STRIPE_SIGNATURE))
        .await?;

    Ok(Json(Acknowledged {
        received: true,
        outcome,
    }))
}

pub async fn email_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Acknowledged<EmailEventOutcome>>> {
    let svix = SvixHeaders {
        id: header(&headers, "svix-id"),
        timestamp: header(&headers, "svix-timestamp"),
        signature: header(&headers, "svix-signature"),
    };

    let outcome = state.billing.email_events.handle(&body, svix).await?;

    Ok(Json(Acknowledged {
        received: true,
        outcome,
    }))
}
