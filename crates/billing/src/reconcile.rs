//! Scheduled reconciliation job
//!
//! Three passes, in order: expire overdue failures, charge due installments, then
//! repair inventory left inconsistent by earlier partial failures. Every item is
//! processed independently; an error is recorded in the pass summary and the batch
//! moves on. Running the job twice for the same period is harmless: charges carry a
//! deterministic idempotency key and every state change is conditional.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeOutcome, ChargeRequest, ChargeStatus, GatewayError, PaymentGateway};
use crate::money;
use crate::payments::{FailureOutcome, PaymentEngine, SuccessOutcome, NON_PAYMENT_REASON};
use crate::schedule::{EntryEvent, NO_PAYMENT_METHOD_REASON};
use crate::store::{BillingStore, InventoryChange};
use crate::types::{BookingStatus, ScheduleEntry};

const REQUIRES_ACTION_REASON: &str = "payment requires customer authentication";
const GENERIC_FAILURE_REASON: &str = "payment failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub booking_id: Uuid,
    pub entry_id: Option<Uuid>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub errors: Vec<ItemError>,
}

impl PassSummary {
    fn error(&mut self, booking_id: Uuid, entry_id: Option<Uuid>, error: &BillingError) {
        tracing::error!(
            booking_id = %booking_id,
            entry_id = ?entry_id,
            error = %error,
            "Reconciliation item failed - continuing batch"
        );
        self.errors.push(ItemError {
            booking_id,
            entry_id,
            error: error.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub expiry: PassSummary,
    pub due: PassSummary,
    pub repair: PassSummary,
}

impl ReconciliationSummary {
    pub fn error_count(&self) -> usize {
        self.expiry.errors.len() + self.due.errors.len() + self.repair.errors.len()
    }
}

/// Result of charging one due installment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChargeResult {
    Succeeded,
    Failed,
    Skipped,
}

pub struct ReconciliationJob {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    engine: PaymentEngine,
}

impl ReconciliationJob {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        engine: PaymentEngine,
    ) -> Self {
        Self {
            store,
            gateway,
            engine,
        }
    }

    pub async fn run(&self, now: OffsetDateTime) -> BillingResult<ReconciliationSummary> {
        tracing::info!(now = %now, "Reconciliation run started");

        let expiry = self.expiry_pass(now).await?;
        let due = self.due_pass(now).await?;
        let repair = self.repair_pass(now).await?;

        let summary = ReconciliationSummary {
            started_at: now,
            expiry,
            due,
            repair,
        };
        tracing::info!(
            cancelled = summary.expiry.cancelled,
            charged = summary.due.succeeded,
            failed = summary.due.failed,
            repaired = summary.repair.succeeded,
            errors = summary.error_count(),
            "Reconciliation run finished"
        );
        Ok(summary)
    }

    /// Cancel bookings whose failed installment is past its payment deadline
    pub async fn expiry_pass(&self, now: OffsetDateTime) -> BillingResult<PassSummary> {
        let mut summary = PassSummary::default();
        let entries = self.store.expired_entries(now).await?;

        for entry in entries {
            summary.processed += 1;
            match self.engine.cancel_for_nonpayment(&entry, now).await {
                Ok(true) => summary.cancelled += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => summary.error(entry.booking_id, Some(entry.id), &e),
            }
        }

        // Cancellations whose guest email was lost to an earlier failure
        for booking_id in self.store.unnotified_cancellations(NON_PAYMENT_REASON).await? {
            match self.engine.notify_cancellation(booking_id, now).await {
                Ok(true) => tracing::info!(booking_id = %booking_id, "Late cancellation notice sent"),
                Ok(false) => {}
                Err(e) => summary.error(booking_id, None, &e),
            }
        }
        Ok(summary)
    }

    /// Resolve abandoned attempts, then charge every installment that is due
    pub async fn due_pass(&self, now: OffsetDateTime) -> BillingResult<PassSummary> {
        let mut summary = PassSummary::default();
        let today = now.date();
        let timeout = self.engine.config().retry.processing_timeout;

        for entry in self.store.stalled_entries(today, now, timeout).await? {
            summary.processed += 1;
            tracing::warn!(
                booking_id = %entry.booking_id,
                entry_id = %entry.id,
                last_attempt_at = ?entry.last_attempt_at,
                "Charge attempt stuck in processing"
            );
            match self
                .engine
                .installment_failed(&entry, EntryEvent::AttemptAbandoned, now)
                .await
            {
                Ok(FailureOutcome::Recorded { .. }) => summary.failed += 1,
                Ok(_) => summary.skipped += 1,
                Err(e) => summary.error(entry.booking_id, Some(entry.id), &e),
            }
        }

        for entry in self.store.due_entries(today, now).await? {
            summary.processed += 1;
            match self.charge_entry(&entry, now).await {
                Ok(ChargeResult::Succeeded) => summary.succeeded += 1,
                Ok(ChargeResult::Failed) => summary.failed += 1,
                Ok(ChargeResult::Skipped) => summary.skipped += 1,
                Err(e) => summary.error(entry.booking_id, Some(entry.id), &e),
            }
        }
        Ok(summary)
    }

    async fn charge_entry(
        &self,
        entry: &ScheduleEntry,
        now: OffsetDateTime,
    ) -> BillingResult<ChargeResult> {
        let booking = self
            .store
            .booking(entry.booking_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("booking {}", entry.booking_id)))?;

        if booking.status == BookingStatus::Cancelled {
            return Ok(ChargeResult::Skipped);
        }

        let (Some(customer_id), Some(payment_method_id)) = (
            booking.gateway_customer_id.clone(),
            booking.payment_method_id.clone(),
        ) else {
            tracing::warn!(
                booking_id = %booking.id,
                entry_id = %entry.id,
                "No payment method on file - recording failure without a charge"
            );
            let event = EntryEvent::ChargeFailed {
                reason: NO_PAYMENT_METHOD_REASON,
                charge_ref: None,
            };
            return self.record_failure(entry, event, now).await;
        };

        if !self.store.claim_entry(entry.id, now).await? {
            tracing::info!(
                booking_id = %booking.id,
                entry_id = %entry.id,
                "Installment claimed elsewhere - skipping"
            );
            return Ok(ChargeResult::Skipped);
        }

        let request = ChargeRequest {
            amount_minor: money::to_minor_units(entry.amount)?,
            currency: booking.currency.to_lowercase(),
            customer_id,
            payment_method_id,
            idempotency_key: entry.idempotency_key(),
            booking_id: booking.id,
            schedule_entry_id: entry.id,
        };

        tracing::info!(
            booking_id = %booking.id,
            entry_id = %entry.id,
            sequence = entry.sequence,
            amount = %entry.amount,
            attempt = entry.attempt_count + 1,
            "Charging installment"
        );

        let result = self.gateway.create_charge(&request).await;

        // The failure write compares against the claimed row
        let claimed = self
            .store
            .schedule_entry(entry.id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("schedule entry {}", entry.id)))?;

        match result {
            Ok(ChargeOutcome {
                charge_ref,
                status: ChargeStatus::Succeeded,
                ..
            }) => match self
                .engine
                .installment_succeeded(entry.id, &charge_ref, now)
                .await?
            {
                SuccessOutcome::Paid | SuccessOutcome::Duplicate => Ok(ChargeResult::Succeeded),
                SuccessOutcome::Late | SuccessOutcome::Unknown => Ok(ChargeResult::Skipped),
            },
            Ok(ChargeOutcome {
                charge_ref,
                status: ChargeStatus::Processing,
                ..
            }) => {
                tracing::info!(
                    entry_id = %entry.id,
                    charge_ref = %charge_ref,
                    "Charge still processing - awaiting webhook"
                );
                Ok(ChargeResult::Skipped)
            }
            Ok(ChargeOutcome {
                charge_ref,
                status,
                failure_reason,
            }) => {
                let reason = failure_reason.unwrap_or_else(|| {
                    if status == ChargeStatus::RequiresAction {
                        REQUIRES_ACTION_REASON.to_string()
                    } else {
                        GENERIC_FAILURE_REASON.to_string()
                    }
                });
                let event = EntryEvent::ChargeFailed {
                    reason: &reason,
                    charge_ref: Some(&charge_ref),
                };
                self.record_failure(&claimed, event, now).await
            }
            Err(e) => {
                if matches!(e, GatewayError::Timeout) {
                    tracing::warn!(entry_id = %entry.id, "Gateway timed out - counting as a failed attempt");
                }
                let reason = e.failure_reason();
                let event = EntryEvent::ChargeFailed {
                    reason: &reason,
                    charge_ref: e.charge_ref(),
                };
                self.record_failure(&claimed, event, now).await
            }
        }
    }

    async fn record_failure(
        &self,
        entry: &ScheduleEntry,
        event: EntryEvent<'_>,
        now: OffsetDateTime,
    ) -> BillingResult<ChargeResult> {
        match self.engine.installment_failed(entry, event, now).await? {
            FailureOutcome::Recorded { .. } => Ok(ChargeResult::Failed),
            FailureOutcome::Ignored | FailureOutcome::Superseded => Ok(ChargeResult::Skipped),
        }
    }

    /// Re-derive inventory from booking state
    pub async fn repair_pass(&self, now: OffsetDateTime) -> BillingResult<PassSummary> {
        let mut summary = PassSummary::default();
        let ledger = self.engine.ledger();

        for booking_id in self.store.bookings_missing_inventory().await? {
            summary.processed += 1;
            match ledger.decrement_once(booking_id).await {
                Ok(InventoryChange::Applied { .. }) => {
                    tracing::warn!(booking_id = %booking_id, "Repaired missing inventory decrement");
                    summary.succeeded += 1;
                }
                Ok(_) => summary.skipped += 1,
                Err(e) => summary.error(booking_id, None, &e),
            }
        }

        for booking_id in self.store.cancelled_holding_inventory().await? {
            summary.processed += 1;
            match ledger.release(booking_id, now).await {
                Ok(InventoryChange::Applied { .. }) => {
                    tracing::warn!(booking_id = %booking_id, "Released inventory held by cancelled booking");
                    summary.succeeded += 1;
                }
                Ok(_) => summary.skipped += 1,
                Err(e) => summary.error(booking_id, None, &e),
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_error_count() {
        let mut summary = ReconciliationSummary {
            started_at: OffsetDateTime::UNIX_EPOCH,
            expiry: PassSummary::default(),
            due: PassSummary::default(),
            repair: PassSummary::default(),
        };
        summary
            .due
            .error(Uuid::nil(), None, &BillingError::Internal("boom".to_string()));
        summary
            .repair
            .error(Uuid::nil(), None, &BillingError::Database("gone".to_string()));
        assert_eq!(summary.error_count(), 2);
        assert_eq!(summary.due.errors[0].error, "internal error: boom");
    }
}
