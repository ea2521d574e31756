//! API routes

mod admin;
mod cron;
mod health;
mod webhooks;

#[cfg(test)]
mod tests;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::auth::require_cron_secret;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    // Everything here needs the shared bearer secret
    let protected = Router::new()
        .route(
            "/cron/reconcile",
            get(cron::run_reconciliation).post(cron::run_reconciliation),
        )
        .route("/admin/invariants", get(admin::invariant_report))
        .route("/admin/webhook-events", get(admin::list_webhook_events))
        .route(
            "/admin/webhook-events/{event_id}/reset",
            post(admin::reset_webhook_event),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_cron_secret,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/webhooks/email", post(webhooks::email_webhook))
        .merge(protected)
        .with_state(state)
}
