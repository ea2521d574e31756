//! Gateway webhook handling
//!
//! Verify, claim, dispatch, record. A claimed event whose processing fails with a
//! retryable error is marked `error` and the error is returned, so the HTTP layer
//! answers non-2xx and the gateway redelivers into a fresh claim.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{metadata_uuid, ChargeRefunded, GatewayEvent, GatewayEventKind};
use crate::idempotency::{Claim, IdempotencyGuard};
use crate::money;
use crate::payments::{FirstPayment, PaymentEngine, RefundNotice};
use crate::schedule::EntryEvent;
use crate::store::BillingStore;
use crate::types::{EventProcessingResult, GatewayEventRecord};
use crate::verifier::EventVerifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
    /// Event type or payload the engine has nothing to do for
    Ignored,
    /// Processing failed in a way redelivery cannot fix; logged and acknowledged
    Discarded,
}

pub struct WebhookHandler {
    verifier: EventVerifier,
    guard: IdempotencyGuard,
    engine: PaymentEngine,
    store: Arc<dyn BillingStore>,
}

impl WebhookHandler {
    pub fn new(
        verifier: EventVerifier,
        store: Arc<dyn BillingStore>,
        engine: PaymentEngine,
    ) -> Self {
        let guard = IdempotencyGuard::new(
            store.clone(),
            engine.config().retry.processing_timeout,
        );
        Self {
            verifier,
            guard,
            engine,
            store,
        }
    }

    pub async fn handle(
        &self,
        raw_body: &str,
        signature: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        self.handle_at(raw_body, signature, OffsetDateTime::now_utc())
            .await
    }

    pub async fn handle_at(
        &self,
        raw_body: &str,
        signature: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let event = self.verifier.verify(raw_body, signature, now).map_err(|rejection| {
            tracing::warn!(
                rejection = %rejection,
                payload_len = raw_body.len(),
                "Gateway webhook rejected"
            );
            BillingError::from(rejection)
        })?;

        if self.guard.claim(&event, now).await? == Claim::AlreadyProcessed {
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing gateway event (claimed exclusive processing rights)"
        );

        match self.process(&event, now).await {
            Ok(outcome) => {
                self.guard.finish(&event.id, Ok(())).await;
                Ok(outcome)
            }
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Gateway event processing failed - awaiting redelivery"
                );
                self.guard.finish(&event.id, Err(&e.to_string())).await;
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Gateway event could not be processed - discarding"
                );
                self.guard.finish(&event.id, Err(&e.to_string())).await;
                Ok(WebhookOutcome::Discarded)
            }
        }
    }

    async fn process(
        &self,
        event: &GatewayEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        match event.kind()? {
            GatewayEventKind::CheckoutCompleted(session) => {
                let Some(booking_id) = metadata_uuid(&session.metadata, "booking_id") else {
                    tracing::warn!(
                        event_id = %event.id,
                        session_id = %session.id,
                        "Checkout session without booking_id metadata"
                    );
                    return Ok(WebhookOutcome::Ignored);
                };
                self.engine
                    .first_payment(
                        FirstPayment {
                            booking_id,
                            charge_ref: session.charge_ref().to_string(),
                            customer_id: session.customer.clone(),
                            amount: session.amount_total.map(money::from_minor_units),
                        },
                        now,
                    )
                    .await?;
                Ok(WebhookOutcome::Processed)
            }

            GatewayEventKind::PaymentSucceeded(intent) => {
                let Some(entry_id) = metadata_uuid(&intent.metadata, "schedule_entry_id") else {
                    tracing::debug!(
                        payment_intent = %intent.id,
                        "Payment intent is not a scheduled installment"
                    );
                    return Ok(WebhookOutcome::Ignored);
                };
                self.engine
                    .installment_succeeded(entry_id, &intent.id, now)
                    .await?;
                Ok(WebhookOutcome::Processed)
            }

            GatewayEventKind::PaymentFailed(intent) => {
                let Some(entry_id) = metadata_uuid(&intent.metadata, "schedule_entry_id") else {
                    tracing::debug!(
                        payment_intent = %intent.id,
                        "Failed payment intent is not a scheduled installment"
                    );
                    return Ok(WebhookOutcome::Ignored);
                };
                let Some(entry) = self.store.schedule_entry(entry_id).await? else {
                    tracing::warn!(entry_id = %entry_id, "Payment failure for unknown schedule entry");
                    return Ok(WebhookOutcome::Ignored);
                };
                let reason = intent.failure_reason();
                self.engine
                    .installment_failed(
                        &entry,
                        EntryEvent::ChargeFailed {
                            reason: &reason,
                            charge_ref: Some(&intent.id),
                        },
                        now,
                    )
                    .await?;
                Ok(WebhookOutcome::Processed)
            }

            GatewayEventKind::ChargeRefunded(charge) => {
                self.engine.record_refund(refund_notice(&charge), now).await?;
                Ok(WebhookOutcome::Processed)
            }

            GatewayEventKind::Unhandled => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Unhandled gateway event type"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Audit rows, newest first
    pub async fn list_events(
        &self,
        result: Option<EventProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<GatewayEventRecord>> {
        self.store.list_gateway_events(result, limit).await
    }

    /// Make a stuck or errored event claimable again on its next delivery
    pub async fn reset_stuck_event(&self, event_id: &str) -> BillingResult<()> {
        if self.store.reset_gateway_event(event_id).await? {
            tracing::info!(event_id = %event_id, "Gateway event reset for replay");
            Ok(())
        } else {
            Err(BillingError::NotFound(format!(
                "no resettable gateway event {}",
                event_id
            )))
        }
    }
}

fn refund_notice(charge: &ChargeRefunded) -> RefundNotice {
    let refunds = charge
        .refunds
        .as_ref()
        .map(|list| {
            list.data
                .iter()
                .map(|r| (r.id.clone(), money::from_minor_units(r.amount)))
                .collect()
        })
        .unwrap_or_default();

    RefundNotice {
        booking_id: metadata_uuid(&charge.metadata, "booking_id"),
        charge_ref: charge.charge_ref().to_string(),
        refunds,
        total_refunded: money::from_minor_units(charge.amount_refunded),
        charge_fully_refunded: charge.is_fully_refunded(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_refund_notice_uses_itemized_refunds() {
        let charge: ChargeRefunded = serde_json::from_value(serde_json::json!({
            "id": "ch_1",
            "payment_intent": "pi_1",
            "amount": 30000,
            "amount_refunded": 30000,
            "refunds": { "data": [ { "id": "re_1", "amount": 10000 }, { "id": "re_2", "amount": 20000 } ] }
        }))
        .unwrap();
        let notice = refund_notice(&charge);
        assert_eq!(notice.charge_ref, "pi_1");
        assert_eq!(notice.refunds.len(), 2);
        assert_eq!(notice.refunds[1], ("re_2".to_string(), Decimal::from(200)));
        assert!(notice.charge_fully_refunded);
    }

    #[test]
    fn test_refund_notice_without_itemized_refunds() {
        let charge: ChargeRefunded = serde_json::from_value(serde_json::json!({
            "id": "ch_1",
            "amount": 30000,
            "amount_refunded": 5000
        }))
        .unwrap();
        let notice = refund_notice(&charge);
        assert!(notice.refunds.is_empty());
        assert_eq!(notice.total_refunded, Decimal::from(50));
        assert!(!notice.charge_fully_refunded);
    }
}
