//! Operator endpoints: consistency report and webhook event recovery

use axum::{
    extract::{Path, Query, State},
    Json,
};
use retreat_billing::types::{EventProcessingResult, GatewayEventRecord};
use retreat_billing::InvariantCheckSummary;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_EVENT_LIMIT: i64 = 50;
const MAX_EVENT_LIMIT: i64 = 500;

pub async fn invariant_report(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    Ok(Json(state.billing.invariants.run_all_checks().await?))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub result: Option<EventProcessingResult>,
    pub limit: Option<i64>,
}

pub async fn list_webhook_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<Vec<GatewayEventRecord>>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    if !(1..=MAX_EVENT_LIMIT).contains(&limit) {
        return Err(ApiError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_EVENT_LIMIT
        )));
    }

    let events = state
        .billing
        .webhooks
        .list_events(query.result, limit)
        .await?;
    Ok(Json(events))
}

pub async fn reset_webhook_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.billing.webhooks.reset_stuck_event(&event_id).await?;
    tracing::info!(event_id = %event_id, "Webhook event reset by operator");
    Ok(Json(json!({ "reset": true, "event_id": event_id })))
}
