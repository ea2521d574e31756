//! Applies payment-schedule transitions
//!
//! `PaymentEngine` is shared by the webhook handler and the reconciliation job.
//! Each method loads current state, asks `schedule::transition` what to do, and
//! performs the resulting conditional writes. Writes to independent resources
//! (entry, ledger, booking, inventory) are not rolled back when a later one fails;
//! the repair pass reconciles them.

use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::inventory::InventoryLedger;
use crate::money;
use crate::notify::{Guest, NextInstallment, Notification, NotificationDispatcher};
use crate::schedule::{self, EntryEvent, PaymentPlan, Transition};
use crate::store::BillingStore;
use crate::types::{
    Booking, BookingStatus, PaymentKind, PaymentRecord, PaymentStatus, ScheduleEntry,
};

pub const NON_PAYMENT_REASON: &str = "payment deadline exceeded";

/// A checkout completed and the first installment settled
#[derive(Debug, Clone)]
pub struct FirstPayment {
    pub booking_id: Uuid,
    pub charge_ref: String,
    pub customer_id: Option<String>,
    /// Amount actually charged, when the gateway reports it
    pub amount: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct RefundNotice {
    pub booking_id: Option<Uuid>,
    pub charge_ref: String,
    /// `(refund reference, amount)` pairs; each reference is recorded once
    pub refunds: Vec<(String, Decimal)>,
    /// Cumulative amount refunded on the charge, used when refunds are not itemized
    pub total_refunded: Decimal,
    pub charge_fully_refunded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessOutcome {
    Paid,
    /// Entry was already paid or the same charge was already recorded
    Duplicate,
    /// Money arrived for a cancelled entry; recorded in the ledger only
    Late,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Recorded { exhausted: bool },
    Ignored,
    /// Another writer changed the entry first
    Superseded,
}

#[derive(Clone)]
pub struct PaymentEngine {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: InventoryLedger,
    notifier: NotificationDispatcher,
    config: BillingConfig,
}

fn guest(booking: &Booking) -> Guest {
    Guest {
        name: booking.guest_name.clone(),
        email: booking.guest_email.clone(),
    }
}

impl PaymentEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: NotificationDispatcher,
        config: BillingConfig,
    ) -> Self {
        Self {
            ledger: InventoryLedger::new(store.clone()),
            store,
            gateway,
            notifier,
            config,
        }
    }

    pub fn ledger(&self) -> &InventoryLedger {
        &self.ledger
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Recompute payment status and balance from the schedule and the ledger
    pub async fn refresh(&self, booking_id: Uuid) -> BillingResult<(PaymentStatus, Decimal)> {
        let booking = self
            .store
            .booking(booking_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("booking {}", booking_id)))?;
        let entries = self.store.schedule(booking_id).await?;
        let payments = self.store.payments(booking_id).await?;
        let status = schedule::derive_payment_status(booking.total_amount, &entries, &payments);
        let balance = self.store.refresh_balance(booking_id, status).await?;
        Ok((status, balance))
    }

    async fn ensure_schedule(
        &self,
        booking: &Booking,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<ScheduleEntry>> {
        let entries = self.store.schedule(booking.id).await?;
        if !entries.is_empty() {
            return Ok(entries);
        }

        let plan = PaymentPlan {
            max_attempts: self.config.retry.max_attempts,
            interval: self.config.installment_interval,
        };
        let inserted = self
            .store
            .insert_schedule(&plan.materialize(booking, now.date()))
            .await?;
        tracing::info!(
            booking_id = %booking.id,
            installments = inserted,
            "Materialized payment schedule"
        );
        self.store.schedule(booking.id).await
    }

    /// Settle the first installment after checkout
    pub async fn first_payment(
        &self,
        payment: FirstPayment,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let Some(booking) = self.store.booking(payment.booking_id).await? else {
            tracing::warn!(
                booking_id = %payment.booking_id,
                charge_ref = %payment.charge_ref,
                "Checkout completed for unknown booking - ignoring"
            );
            return Ok(());
        };

        let entries = self.ensure_schedule(&booking, now).await?;
        let first = entries.iter().find(|e| e.sequence == 1);

        if let Some(entry) = first {
            match schedule::transition(entry, EntryEvent::ChargeSucceeded, &self.config.retry, now) {
                Transition::MarkPaid => {
                    self.store
                        .mark_entry_paid(entry.id, &payment.charge_ref, now)
                        .await?;
                }
                Transition::LatePayment => tracing::warn!(
                    booking_id = %booking.id,
                    entry_id = %entry.id,
                    "First payment arrived for a closed schedule entry"
                ),
                _ => {}
            }
        }

        let amount = payment
            .amount
            .or_else(|| first.map(|e| e.amount))
            .unwrap_or(booking.deposit_amount);
        let inserted = self
            .store
            .insert_payment(&PaymentRecord::charge(
                booking.id,
                first.map(|e| e.id),
                amount,
                payment.charge_ref.clone(),
                now,
            ))
            .await?;

        if !inserted {
            tracing::info!(
                booking_id = %booking.id,
                charge_ref = %payment.charge_ref,
                "First payment already recorded"
            );
        }

        if booking.payment_method_id.is_none() {
            self.capture_payment_method(&booking, &payment).await;
        }

        let (status, balance) = self.refresh(booking.id).await?;
        tracing::info!(
            booking_id = %booking.id,
            payment_status = %status,
            balance_due = %balance,
            "First payment settled"
        );

        if booking.status == BookingStatus::Cancelled {
            tracing::warn!(
                booking_id = %booking.id,
                charge_ref = %payment.charge_ref,
                "Payment received for a cancelled booking - recorded without inventory"
            );
            return Ok(());
        }

        let confirmed = if self.config.auto_confirm && self.store.confirm_booking(booking.id).await? {
            tracing::info!(booking_id = %booking.id, "Booking confirmed");
            true
        } else {
            booking.status == BookingStatus::Confirmed
        };

        if let Err(e) = self.ledger.decrement_once(booking.id).await {
            tracing::error!(
                booking_id = %booking.id,
                error = %e,
                "Inventory decrement failed - repair pass will retry"
            );
        }

        if inserted {
            let guest_notice = if confirmed {
                Notification::BookingConfirmed {
                    booking_id: booking.id,
                    guest: guest(&booking),
                    amount_paid: amount,
                    currency: booking.currency.clone(),
                }
            } else {
                // Still pending review: acknowledge the deposit only
                let entries = self.store.schedule(booking.id).await?;
                Notification::PaymentSucceeded {
                    booking_id: booking.id,
                    guest: guest(&booking),
                    amount,
                    currency: booking.currency.clone(),
                    next_due: schedule::next_pending(&entries).map(|e| NextInstallment {
                        due_date: e.due_date,
                        amount: e.amount,
                    }),
                }
            };
            self.notifier.dispatch(guest_notice).await;
            self.notifier
                .dispatch(Notification::AdminNewBooking {
                    booking_id: booking.id,
                    guest_name: booking.guest_name.clone(),
                    guest_email: booking.guest_email.clone(),
                    total_amount: booking.total_amount,
                    currency: booking.currency.clone(),
                })
                .await;
        }

        Ok(())
    }

    async fn capture_payment_method(&self, booking: &Booking, payment: &FirstPayment) {
        match self.gateway.retrieve_charge(&payment.charge_ref).await {
            Ok(details) => {
                let Some(method) = details.payment_method_id else {
                    tracing::warn!(
                        booking_id = %booking.id,
                        "Checkout charge has no reusable payment method"
                    );
                    return;
                };
                let customer = details.customer_id.or_else(|| payment.customer_id.clone());
                if let Err(e) = self
                    .store
                    .set_payment_method(booking.id, customer.as_deref(), &method)
                    .await
                {
                    tracing::error!(booking_id = %booking.id, error = %e, "Failed to store payment method");
                }
            }
            Err(e) => tracing::warn!(
                booking_id = %booking.id,
                charge_ref = %payment.charge_ref,
                error = %e,
                "Could not retrieve checkout charge - installments will fail until a method is on file"
            ),
        }
    }

    /// A scheduled installment's charge settled
    pub async fn installment_succeeded(
        &self,
        entry_id: Uuid,
        charge_ref: &str,
        now: OffsetDateTime,
    ) -> BillingResult<SuccessOutcome> {
        let Some(entry) = self.store.schedule_entry(entry_id).await? else {
            tracing::warn!(entry_id = %entry_id, charge_ref, "Payment for unknown schedule entry");
            return Ok(SuccessOutcome::Unknown);
        };

        let transition =
            schedule::transition(&entry, EntryEvent::ChargeSucceeded, &self.config.retry, now);
        let newly_paid = match transition {
            Transition::MarkPaid => self.store.mark_entry_paid(entry.id, charge_ref, now).await?,
            Transition::LatePayment => {
                tracing::warn!(
                    booking_id = %entry.booking_id,
                    entry_id = %entry.id,
                    entry_status = %entry.status,
                    charge_ref,
                    "Payment received for a closed schedule entry - recording in ledger only"
                );
                false
            }
            _ => false,
        };

        let inserted = self
            .store
            .insert_payment(&PaymentRecord::charge(
                entry.booking_id,
                Some(entry.id),
                entry.amount,
                charge_ref,
                now,
            ))
            .await?;

        if inserted && !newly_paid && transition != Transition::LatePayment {
            tracing::warn!(
                booking_id = %entry.booking_id,
                entry_id = %entry.id,
                charge_ref,
                "Additional charge recorded for an already paid entry"
            );
        }

        let (status, balance) = self.refresh(entry.booking_id).await?;

        if transition == Transition::LatePayment {
            return Ok(SuccessOutcome::Late);
        }
        if !newly_paid {
            return Ok(SuccessOutcome::Duplicate);
        }

        tracing::info!(
            booking_id = %entry.booking_id,
            entry_id = %entry.id,
            sequence = entry.sequence,
            payment_status = %status,
            balance_due = %balance,
            "Installment paid"
        );

        if let Some(booking) = self.store.booking(entry.booking_id).await? {
            if booking.status != BookingStatus::Cancelled {
                if let Err(e) = self.ledger.decrement_once(booking.id).await {
                    tracing::error!(booking_id = %booking.id, error = %e, "Inventory decrement failed - repair pass will retry");
                }
            }

            let entries = self.store.schedule(booking.id).await?;
            let next_due = schedule::next_pending(&entries).map(|e| NextInstallment {
                due_date: e.due_date,
                amount: e.amount,
            });
            self.notifier
                .dispatch(Notification::PaymentSucceeded {
                    booking_id: booking.id,
                    guest: guest(&booking),
                    amount: entry.amount,
                    currency: booking.currency.clone(),
                    next_due,
                })
                .await;
        }

        Ok(SuccessOutcome::Paid)
    }

    /// Run the failure branch for `entry`. `event` is `ChargeFailed` or `AttemptAbandoned`.
    pub async fn installment_failed(
        &self,
        entry: &ScheduleEntry,
        event: EntryEvent<'_>,
        now: OffsetDateTime,
    ) -> BillingResult<FailureOutcome> {
        let (update, first_failure, exhausted) =
            match schedule::transition(entry, event, &self.config.retry, now) {
                Transition::RecordFailure {
                    update,
                    first_failure,
                    exhausted,
                } => (update, first_failure, exhausted),
                Transition::Ignore(reason) => {
                    tracing::info!(
                        entry_id = %entry.id,
                        entry_status = %entry.status,
                        reason,
                        "Failure ignored"
                    );
                    return Ok(FailureOutcome::Ignored);
                }
                other => {
                    tracing::warn!(entry_id = %entry.id, transition = ?other, "Unexpected transition for failure");
                    return Ok(FailureOutcome::Ignored);
                }
            };

        let applied = self
            .store
            .record_entry_failure(entry.id, entry.attempt_count, &update)
            .await?;
        if !applied {
            tracing::info!(
                entry_id = %entry.id,
                expected_attempts = entry.attempt_count,
                "Schedule entry changed concurrently - failure not applied"
            );
            return Ok(FailureOutcome::Superseded);
        }

        tracing::warn!(
            booking_id = %entry.booking_id,
            entry_id = %entry.id,
            attempt = update.attempt_count,
            max_attempts = entry.max_attempts,
            reason = %update.failure_reason,
            deadline = %update.payment_deadline,
            exhausted,
            "Installment payment failed"
        );

        if first_failure {
            self.notify_failure(
                entry,
                &update.failure_reason,
                update.attempt_count,
                update.payment_deadline,
            )
            .await;
        }

        Ok(FailureOutcome::Recorded { exhausted })
    }

    async fn notify_failure(
        &self,
        entry: &ScheduleEntry,
        reason: &str,
        attempt: i32,
        deadline: OffsetDateTime,
    ) {
        let booking = match self.store.booking(entry.booking_id).await {
            Ok(Some(booking)) => booking,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(
                    booking_id = %entry.booking_id,
                    error = %e,
                    "Failed to load booking for failure notification"
                );
                return;
            }
        };

        let update_url = match booking.gateway_customer_id.as_deref() {
            Some(customer_id) => match self
                .gateway
                .create_portal_session(customer_id, &self.config.portal_return_url)
                .await
            {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!(booking_id = %booking.id, error = %e, "Portal session failed - using fallback link");
                    self.config.payment_update_fallback_url.clone()
                }
            },
            None => self.config.payment_update_fallback_url.clone(),
        };

        self.notifier
            .dispatch(Notification::PaymentFailed {
                booking_id: booking.id,
                guest: guest(&booking),
                amount: entry.amount,
                currency: booking.currency.clone(),
                deadline,
                update_url,
            })
            .await;
        self.notifier
            .dispatch(Notification::AdminPaymentFailed {
                booking_id: booking.id,
                guest_name: booking.guest_name.clone(),
                amount: entry.amount,
                currency: booking.currency.clone(),
                reason: reason.to_string(),
                attempt,
                deadline,
            })
            .await;
    }

    /// Cancel the entry's booking if its payment deadline has passed. Returns whether
    /// this call cancelled it.
    pub async fn cancel_for_nonpayment(
        &self,
        entry: &ScheduleEntry,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        match schedule::transition(entry, EntryEvent::DeadlineCheck, &self.config.retry, now) {
            Transition::CancelBooking => {}
            _ => return Ok(false),
        }

        let booking_id = entry.booking_id;
        let cancelled = self
            .store
            .cancel_booking(booking_id, NON_PAYMENT_REASON, now)
            .await?;
        let closed = self.store.cancel_open_entries(booking_id).await?;

        if let Err(e) = self.ledger.release(booking_id, now).await {
            tracing::error!(
                booking_id = %booking_id,
                error = %e,
                "Inventory release failed - repair pass will retry"
            );
        }

        if cancelled {
            tracing::warn!(
                booking_id = %booking_id,
                entry_id = %entry.id,
                closed_entries = closed,
                "Booking cancelled for non-payment"
            );
        } else {
            tracing::info!(booking_id = %booking_id, closed_entries = closed, "Booking already cancelled");
        }

        self.refresh(booking_id).await?;
        // A previous attempt may have cancelled the booking and failed before notifying
        self.notify_cancellation(booking_id, now).await?;
        Ok(cancelled)
    }

    /// Send the non-payment cancellation email at most once per booking. Returns
    /// whether this call sent it.
    pub async fn notify_cancellation(
        &self,
        booking_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let Some(booking) = self.store.booking(booking_id).await? else {
            return Ok(false);
        };
        if booking.status != BookingStatus::Cancelled
            || booking.cancellation_reason.as_deref() != Some(NON_PAYMENT_REASON)
        {
            return Ok(false);
        }
        if !self.store.claim_cancellation_notice(booking_id, now).await? {
            return Ok(false);
        }

        self.notifier
            .dispatch(Notification::BookingCancelledNonPayment {
                booking_id,
                guest: guest(&booking),
            })
            .await;
        Ok(true)
    }

    /// Delta between the charge's cumulative refund and what is already on the ledger
    /// for it, keyed by the cumulative amount so a redelivery maps to the same line.
    /// Itemized lines recorded earlier for the same charge count as already refunded.
    async fn unitemized_refund(
        &self,
        booking_id: Uuid,
        entry_id: Option<Uuid>,
        notice: &RefundNotice,
    ) -> BillingResult<Vec<(String, Decimal)>> {
        let prefix = format!("{}:", notice.charge_ref);
        let already: Decimal = self
            .store
            .payments(booking_id)
            .await?
            .iter()
            .filter(|p| p.kind == PaymentKind::Refund)
            .filter(|p| {
                p.external_ref.starts_with(&prefix)
                    || (entry_id.is_some() && p.schedule_entry_id == entry_id)
            })
            .map(|p| p.amount.abs())
            .sum();
        let delta = notice.total_refunded - already;
        if delta <= Decimal::ZERO {
            return Ok(Vec::new());
        }
        Ok(vec![(
            format!("{}{}", prefix, money::normalize(notice.total_refunded)),
            delta,
        )])
    }

    /// Record refunds against the booking that owns `charge_ref`
    pub async fn record_refund(&self, notice: RefundNotice, now: OffsetDateTime) -> BillingResult<()> {
        let booking_id = match notice.booking_id {
            Some(id) => Some(id),
            None => self.store.booking_for_charge(&notice.charge_ref).await?,
        };
        let Some(booking_id) = booking_id else {
            tracing::warn!(charge_ref = %notice.charge_ref, "Refund for unknown charge - ignoring");
            return Ok(());
        };

        let entry_id = self
            .store
            .schedule(booking_id)
            .await?
            .into_iter()
            .find(|e| e.external_charge_ref.as_deref() == Some(notice.charge_ref.as_str()))
            .map(|e| e.id);

        let refunds = if notice.refunds.is_empty() {
            self.unitemized_refund(booking_id, entry_id, &notice).await?
        } else {
            notice.refunds.clone()
        };

        let mut recorded = 0;
        for (refund_ref, amount) in &refunds {
            let record = PaymentRecord::refund(booking_id, entry_id, *amount, refund_ref.clone(), now);
            if self.store.insert_payment(&record).await? {
                recorded += 1;
            }
        }

        if notice.charge_fully_refunded {
            self.store.mark_entry_refunded(&notice.charge_ref).await?;
        }

        let (status, balance) = self.refresh(booking_id).await?;
        tracing::info!(
            booking_id = %booking_id,
            charge_ref = %notice.charge_ref,
            recorded,
            payment_status = %status,
            balance_due = %balance,
            "Refund recorded"
        );

        if status == PaymentStatus::Refunded {
            if let Err(e) = self.ledger.release(booking_id, now).await {
                tracing::error!(booking_id = %booking_id, error = %e, "Inventory release after refund failed");
                return Err(e);
            }
        }
        Ok(())
    }
}
