// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Retreat payment & inventory reconciliation
//!
//! Keeps bookings, their installment schedules, the payments ledger and room
//! inventory consistent with what the payment gateway reports.
//!
//! ## Components
//!
//! - **Webhooks**: verify, deduplicate and apply gateway events
//! - **Schedule state machine**: retry, deadline and cancellation policy per installment
//! - **Inventory ledger**: at-most-once decrement per booking, clamped to capacity
//! - **Reconciliation job**: expiry, due-payment and repair passes
//! - **Invariants**: read-only consistency report
//! - **Notifications**: typed guest/admin messages sent through Resend

pub mod client;
pub mod config;
pub mod email_events;
pub mod error;
pub mod events;
pub mod gateway;
pub mod idempotency;
pub mod inventory;
pub mod invariants;
pub mod money;
pub mod notify;
pub mod payments;
pub mod policy;
pub mod reconcile;
pub mod schedule;
pub mod store;
pub mod types;
pub mod verifier;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Client
pub use client::{StripeClient, StripeConfig};

// Config
pub use config::{BillingConfig, EmailConfig, Environment};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{PaymentGateway, StripeGateway};

// Email events
pub use email_events::{EmailEventHandler, EmailEventOutcome, SvixHeaders};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notify::{EmailNotifier, Notification, NotificationDispatcher, Notifier};

// Payments
pub use payments::PaymentEngine;

// Policy
pub use policy::RetryPolicy;

// Reconciliation
pub use reconcile::{PassSummary, ReconciliationJob, ReconciliationSummary};

// Storage
pub use store::{BillingStore, MemoryStore, PgStore};

// Verification
pub use verifier::{EventVerifier, Rejection};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;

/// Everything the HTTP surface needs, wired to one store and one gateway
pub struct BillingService {
    pub store: Arc<dyn BillingStore>,
    pub engine: PaymentEngine,
    pub webhooks: WebhookHandler,
    pub reconciliation: ReconciliationJob,
    pub invariants: InvariantChecker,
    pub email_events: EmailEventHandler,
}

impl BillingService {
    /// Create the service from environment variables, backed by Postgres and Stripe
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();
        let gateway = Arc::new(StripeGateway::new(stripe)?);
        let notifier = Arc::new(EmailNotifier::new(config.email.clone()));

        if !notifier.is_enabled() {
            tracing::warn!("RESEND_API_KEY not set - notifications will only be logged");
        }

        Ok(Self::new(
            Arc::new(PgStore::new(pool)),
            gateway,
            notifier,
            webhook_secret,
            config,
        ))
    }

    /// Create the service from explicit parts
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        webhook_secret: Option<String>,
        config: BillingConfig,
    ) -> Self {
        let engine = PaymentEngine::new(
            store.clone(),
            gateway.clone(),
            NotificationDispatcher::new(notifier),
            config.clone(),
        );

        Self {
            webhooks: WebhookHandler::new(
                EventVerifier::new(webhook_secret, config.environment),
                store.clone(),
                engine.clone(),
            ),
            reconciliation: ReconciliationJob::new(store.clone(), gateway, engine.clone()),
            invariants: InvariantChecker::new(store.clone()),
            email_events: EmailEventHandler::new(
                config.email.webhook_secret.clone(),
                config.environment,
                store.clone(),
            ),
            engine,
            store,
        }
    }
}
