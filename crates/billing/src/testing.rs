//! Test doubles and fixtures
//!
//! Compiled for this crate's tests and behind the `testing` feature for downstream
//! crates. Nothing here talks to the network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::config::{BillingConfig, Environment};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeDetails, ChargeOutcome, ChargeRequest, ChargeStatus, GatewayError, PaymentGateway,
};
use crate::notify::{Notification, NotificationDispatcher, Notifier};
use crate::payments::PaymentEngine;
use crate::reconcile::ReconciliationJob;
use crate::store::MemoryStore;
use crate::verifier::{self, EventVerifier};
use crate::webhooks::{WebhookHandler, WebhookOutcome};

pub const WEBHOOK_SECRET: &str = "whsec_test_reconciliation";
pub const TEST_CUSTOMER: &str = "cus_test";
pub const TEST_PAYMENT_METHOD: &str = "pm_test";

/// Gateway that answers from a script and deduplicates by idempotency key the way
/// the real gateway does
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<ChargeOutcome, GatewayError>>>,
    requests: Mutex<Vec<ChargeRequest>>,
    settled: Mutex<HashMap<String, ChargeOutcome>>,
    fail_portal: AtomicBool,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next charge attempt. Unscripted attempts succeed.
    pub async fn push_charge(&self, result: Result<ChargeOutcome, GatewayError>) {
        self.script.lock().await.push_back(result);
    }

    pub async fn push_decline(&self, charge_ref: &str, reason: &str) {
        self.push_charge(Err(GatewayError::Declined {
            charge_ref: Some(charge_ref.to_string()),
            reason: reason.to_string(),
        }))
        .await;
    }

    pub fn fail_portal_sessions(&self) {
        self.fail_portal.store(true, Ordering::SeqCst);
    }

    pub async fn requests(&self) -> Vec<ChargeRequest> {
        self.requests.lock().await.clone()
    }

    /// Distinct idempotency keys that settled successfully
    pub async fn settled_count(&self) -> usize {
        self.settled.lock().await.len()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        self.requests.lock().await.push(request.clone());

        if let Some(previous) = self.settled.lock().await.get(&request.idempotency_key) {
            return Ok(previous.clone());
        }

        let result = self.script.lock().await.pop_front().unwrap_or_else(|| {
            Ok(ChargeOutcome {
                charge_ref: format!("pi_{}", request.idempotency_key),
                status: ChargeStatus::Succeeded,
                failure_reason: None,
            })
        });

        if let Ok(outcome) = &result {
            if outcome.status == ChargeStatus::Succeeded {
                self.settled
                    .lock()
                    .await
                    .insert(request.idempotency_key.clone(), outcome.clone());
            }
        }
        result
    }

    async fn retrieve_charge(&self, charge_ref: &str) -> Result<ChargeDetails, GatewayError> {
        Ok(ChargeDetails {
            charge_ref: charge_ref.to_string(),
            status: ChargeStatus::Succeeded,
            customer_id: Some(TEST_CUSTOMER.to_string()),
            payment_method_id: Some(TEST_PAYMENT_METHOD.to_string()),
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        _return_url: &str,
    ) -> Result<String, GatewayError> {
        if self.fail_portal.load(Ordering::SeqCst) {
            return Err(GatewayError::Timeout);
        }
        Ok(format!("https://billing.example.test/portal/{}", customer_id))
    }
}

/// Notifier that keeps everything it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later send fail after recording
    pub fn fail_deliveries(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }

    pub async fn count(&self, kind: &str) -> usize {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|n| n.kind() == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> BillingResult<()> {
        self.sent.lock().await.push(notification.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::Internal("mail provider unavailable".to_string()));
        }
        Ok(())
    }
}

/// Signature header for `body` as the gateway would send it at `at`
pub fn signature_for(body: &str, at: OffsetDateTime) -> String {
    verifier::sign(WEBHOOK_SECRET, body, at.unix_timestamp())
}

/// Gateway event payloads
pub mod payloads {
    use serde_json::json;
    use uuid::Uuid;

    use crate::types::ScheduleEntry;

    fn envelope(event_id: &str, event_type: &str, object: serde_json::Value) -> String {
        json!({
            "id": event_id,
            "type": event_type,
            "created": 1_772_355_600,
            "data": { "object": object },
        })
        .to_string()
    }

    pub fn checkout_completed(
        event_id: &str,
        booking_id: Uuid,
        payment_intent: &str,
        amount_minor: i64,
    ) -> String {
        envelope(
            event_id,
            "checkout.session.completed",
            json!({
                "id": format!("cs_{}", event_id),
                "payment_intent": payment_intent,
                "customer": super::TEST_CUSTOMER,
                "amount_total": amount_minor,
                "metadata": { "booking_id": booking_id.to_string() },
            }),
        )
    }

    pub fn payment_succeeded(event_id: &str, entry: &ScheduleEntry, payment_intent: &str) -> String {
        envelope(
            event_id,
            "payment_intent.succeeded",
            json!({
                "id": payment_intent,
                "amount": 0,
                "metadata": {
                    "booking_id": entry.booking_id.to_string(),
                    "schedule_entry_id": entry.id.to_string(),
                },
            }),
        )
    }

    pub fn payment_failed(
        event_id: &str,
        entry: &ScheduleEntry,
        payment_intent: &str,
        message: &str,
    ) -> String {
        envelope(
            event_id,
            "payment_intent.payment_failed",
            json!({
                "id": payment_intent,
                "amount": 0,
                "metadata": {
                    "booking_id": entry.booking_id.to_string(),
                    "schedule_entry_id": entry.id.to_string(),
                },
                "last_payment_error": { "message": message, "code": "card_declined" },
            }),
        )
    }

    /// `refunds` are `(refund id, minor units)` pairs
    pub fn charge_refunded(
        event_id: &str,
        booking_id: Uuid,
        payment_intent: &str,
        amount_minor: i64,
        refunds: &[(&str, i64)],
    ) -> String {
        let refunded: i64 = refunds.iter().map(|(_, amount)| amount).sum();
        let data: Vec<_> = refunds
            .iter()
            .map(|(id, amount)| json!({ "id": id, "amount": amount }))
            .collect();
        envelope(
            event_id,
            "charge.refunded",
            json!({
                "id": format!("ch_{}", payment_intent),
                "payment_intent": payment_intent,
                "amount": amount_minor,
                "amount_refunded": refunded,
                "metadata": { "booking_id": booking_id.to_string() },
                "refunds": { "data": data },
            }),
        )
    }

    /// Refund event carrying only the cumulative `amount_refunded`
    pub fn charge_refunded_total(
        event_id: &str,
        booking_id: Uuid,
        payment_intent: &str,
        amount_minor: i64,
        refunded_minor: i64,
    ) -> String {
        envelope(
            event_id,
            "charge.refunded",
            json!({
                "id": format!("ch_{}", payment_intent),
                "payment_intent": payment_intent,
                "amount": amount_minor,
                "amount_refunded": refunded_minor,
                "metadata": { "booking_id": booking_id.to_string() },
            }),
        )
    }
}

/// Seed data for a `MemoryStore`
pub mod fixtures {
    use rust_decimal::Decimal;
    use time::macros::datetime;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::store::MemoryStore;
    use crate::types::{Booking, BookingStatus, PaymentStatus, RoomInventory};

    pub fn now() -> OffsetDateTime {
        datetime!(2026-03-01 09:00 UTC)
    }

    /// EUR 900 in three installments of 300, nothing paid yet
    pub fn booking(room_id: Option<Uuid>, guest_count: i32) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            room_id,
            guest_name: "Ada Lovelace".to_string(),
            guest_email: "ada@example.com".to_string(),
            guest_count,
            currency: "eur".to_string(),
            total_amount: Decimal::from(900),
            deposit_amount: Decimal::from(300),
            balance_due: Decimal::from(900),
            installment_count: 3,
            payment_status: PaymentStatus::Unpaid,
            status: BookingStatus::Pending,
            gateway_customer_id: None,
            payment_method_id: None,
            inventory_applied: false,
            inventory_released_at: None,
            cancellation_reason: None,
            cancelled_at: None,
            cancellation_notified_at: None,
            created_at: now(),
        }
    }

    /// Booking plus a fully available room of `capacity`
    pub async fn seed_booking_with_room(
        store: &MemoryStore,
        guest_count: i32,
        capacity: i32,
    ) -> (Booking, Uuid) {
        let room_id = Uuid::new_v4();
        store
            .seed_room(RoomInventory {
                room_id,
                capacity,
                available: capacity,
            })
            .await;
        let booking = booking(Some(room_id), guest_count);
        store.seed_booking(booking.clone()).await;
        (booking, room_id)
    }
}

/// Engine, webhook handler and job wired to in-memory doubles
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: PaymentEngine,
    pub webhooks: WebhookHandler,
    pub job: ReconciliationJob,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(BillingConfig {
            environment: Environment::Test,
            ..BillingConfig::default()
        })
    }

    pub fn with_config(config: BillingConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let engine = PaymentEngine::new(
            store.clone(),
            gateway.clone(),
            NotificationDispatcher::new(notifier.clone()),
            config.clone(),
        );
        let webhooks = WebhookHandler::new(
            EventVerifier::new(Some(WEBHOOK_SECRET.to_string()), config.environment),
            store.clone(),
            engine.clone(),
        );
        let job = ReconciliationJob::new(store.clone(), gateway.clone(), engine.clone());

        Self {
            store,
            gateway,
            notifier,
            engine,
            webhooks,
            job,
        }
    }

    /// Sign and deliver a webhook body at `at`
    pub async fn deliver(&self, body: &str, at: OffsetDateTime) -> BillingResult<WebhookOutcome> {
        let signature = signature_for(body, at);
        self.webhooks.handle_at(body, Some(&signature), at).await
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
