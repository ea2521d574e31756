use axum::{extract::State, Json};
use retreat_billing::ReconciliationSummary;
use time::OffsetDateTime;

use crate::error::ApiResult;
use crate::state::AppState;

/// Run expiry, due-payment and repair passes once
pub async fn run_reconciliation(
    State(state): State<AppState>,
) -> ApiResult<Json<ReconciliationSummary>> {
    let summary = state
        .billing
        .reconciliation
        .run(OffsetDateTime::now_utc())
        .await?;

    if summary.error_count() > 0 {
        tracing::warn!(
            errors = summary.error_count(),
            "Reconciliation finished with item errors"
        );
    }

    Ok(Json(summary))
}
