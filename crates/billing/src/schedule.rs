//! Payment schedule state machine
//!
//! `transition` is the whole policy table: given an installment's current state and
//! something that happened to it, it decides the next state and which side effects
//! follow. It performs no I/O; `PaymentEngine` applies the result through the store.
//!
//! ```text
//! status      event               -> outcome
//! ----------  ------------------  -----------------------------------------------
//! pending     charge succeeded    -> paid
//! processing  charge succeeded    -> paid
//! failed      charge succeeded    -> paid (late recovery)
//! paid        charge succeeded    -> ignore (already settled)
//! cancelled   charge succeeded    -> ledger only, entry stays closed
//! pending     charge failed       -> pending (retry) | failed (attempts exhausted)
//! processing  charge failed       -> pending (retry) | failed (attempts exhausted)
//! paid        charge failed       -> ignore (paid never regresses)
//! failed      charge failed       -> ignore (already parked)
//! processing  attempt abandoned   -> failure branch
//! failed      deadline check      -> cancel booking when deadline <= now
//! pending     deadline check      -> cancel booking when deadline <= now
//! open        booking cancelled   -> cancelled
//! ```

use std::collections::HashSet;

use rust_decimal::{Decimal, RoundingStrategy};
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::money;
use crate::policy::RetryPolicy;
use crate::types::{Booking, EntryStatus, PaymentKind, PaymentRecord, PaymentStatus, ScheduleEntry};

pub const ABANDONED_ATTEMPT_REASON: &str = "charge attempt did not complete";
pub const NO_PAYMENT_METHOD_REASON: &str = "no payment method on file";

/// Something that happened to an installment
#[derive(Debug, Clone, Copy)]
pub enum EntryEvent<'a> {
    ChargeSucceeded,
    ChargeFailed {
        reason: &'a str,
        charge_ref: Option<&'a str>,
    },
    AttemptAbandoned,
    DeadlineCheck,
    BookingCancelled,
}

/// Field values written by the failure branch
#[derive(Debug, Clone, PartialEq)]
pub struct FailureUpdate {
    /// `Pending` while retries remain, `Failed` once exhausted
    pub status: EntryStatus,
    pub attempt_count: i32,
    pub last_attempt_at: OffsetDateTime,
    pub next_retry_at: Option<OffsetDateTime>,
    pub failure_reason: String,
    /// Only written if the entry has none yet
    pub failed_at: OffsetDateTime,
    /// Only written if the entry has none yet
    pub payment_deadline: OffsetDateTime,
    pub external_charge_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    MarkPaid,
    RecordFailure {
        update: FailureUpdate,
        /// First failure of this episode: notify guest and admin
        first_failure: bool,
        exhausted: bool,
    },
    CancelBooking,
    CancelEntry,
    /// Money arrived for a closed entry; record it in the ledger only
    LatePayment,
    Ignore(&'static str),
}

pub fn transition(
    entry: &ScheduleEntry,
    event: EntryEvent<'_>,
    policy: &RetryPolicy,
    now: OffsetDateTime,
) -> Transition {
    use EntryStatus::*;

    match (entry.status, event) {
        (Paid, EntryEvent::ChargeSucceeded) => Transition::Ignore("entry already paid"),
        (Pending | Processing | Failed, EntryEvent::ChargeSucceeded) => Transition::MarkPaid,
        (Cancelled | Refunded, EntryEvent::ChargeSucceeded) => Transition::LatePayment,

        (Processing, EntryEvent::ChargeFailed { reason, charge_ref }) => {
            failure(entry, reason, charge_ref, policy, now)
        }
        (Pending, EntryEvent::ChargeFailed { reason, charge_ref }) => {
            let already_counted = charge_ref.is_some()
                && entry.attempt_count > 0
                && entry.external_charge_ref.as_deref() == charge_ref;
            if already_counted {
                Transition::Ignore("failure already recorded for this charge")
            } else {
                failure(entry, reason, charge_ref, policy, now)
            }
        }
        (Paid, EntryEvent::ChargeFailed { .. }) => Transition::Ignore("paid is terminal"),
        (Failed, EntryEvent::ChargeFailed { .. }) => Transition::Ignore("retries exhausted"),
        (Cancelled | Refunded, EntryEvent::ChargeFailed { .. }) => {
            Transition::Ignore("entry closed")
        }

        (Processing, EntryEvent::AttemptAbandoned) => {
            failure(entry, ABANDONED_ATTEMPT_REASON, None, policy, now)
        }
        (_, EntryEvent::AttemptAbandoned) => Transition::Ignore("entry not processing"),

        (Failed | Pending, EntryEvent::DeadlineCheck) => match entry.payment_deadline {
            Some(deadline) if deadline <= now => Transition::CancelBooking,
            _ => Transition::Ignore("deadline not reached"),
        },
        (_, EntryEvent::DeadlineCheck) => Transition::Ignore("entry not awaiting payment"),

        (status, EntryEvent::BookingCancelled) if status.is_open() => Transition::CancelEntry,
        (_, EntryEvent::BookingCancelled) => Transition::Ignore("entry already closed"),
    }
}

fn failure(
    entry: &ScheduleEntry,
    reason: &str,
    charge_ref: Option<&str>,
    policy: &RetryPolicy,
    now: OffsetDateTime,
) -> Transition {
    let attempt_count = entry.attempt_count + 1;
    let exhausted = attempt_count >= entry.max_attempts;
    let first_failure = entry.failed_at.is_none();

    let update = FailureUpdate {
        status: if exhausted {
            EntryStatus::Failed
        } else {
            EntryStatus::Pending
        },
        attempt_count,
        last_attempt_at: now,
        next_retry_at: (!exhausted).then(|| policy.next_retry_at(now)),
        failure_reason: reason.to_string(),
        failed_at: entry.failed_at.unwrap_or(now),
        payment_deadline: entry
            .payment_deadline
            .unwrap_or_else(|| policy.deadline_from(now)),
        external_charge_ref: charge_ref
            .map(str::to_string)
            .or_else(|| entry.external_charge_ref.clone()),
    };

    Transition::RecordFailure {
        update,
        first_failure,
        exhausted,
    }
}

/// Booking-level payment status from the schedule and the ledger.
///
/// Refund states stick once any refund is on the ledger. `Paid` requires the
/// ledger to cover `total`; cancelled installments never count towards it.
pub fn derive_payment_status(
    total: Decimal,
    entries: &[ScheduleEntry],
    payments: &[PaymentRecord],
) -> PaymentStatus {
    let charged: Decimal = payments
        .iter()
        .filter(|p| p.kind == PaymentKind::Charge)
        .map(|p| p.amount)
        .sum();
    let refunded: Decimal = payments
        .iter()
        .filter(|p| p.kind == PaymentKind::Refund)
        .map(|p| p.amount.abs())
        .sum();

    if refunded > Decimal::ZERO {
        return if refunded >= charged {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartialRefund
        };
    }

    let paid_entries = entries
        .iter()
        .filter(|e| e.status == EntryStatus::Paid)
        .count();
    // Late settlements of closed entries are only on the ledger
    let settled_entries = payments
        .iter()
        .filter(|p| p.kind == PaymentKind::Charge)
        .filter_map(|p| p.schedule_entry_id)
        .collect::<HashSet<_>>()
        .len()
        .max(paid_entries);

    if paid_entries == 0 && charged <= Decimal::ZERO {
        PaymentStatus::Unpaid
    } else if balance_due(total, payments).is_zero() {
        PaymentStatus::Paid
    } else if settled_entries <= 1 {
        PaymentStatus::Deposit
    } else {
        PaymentStatus::Partial
    }
}

/// `max(0, total - net settled payments)`
pub fn balance_due(total: Decimal, payments: &[PaymentRecord]) -> Decimal {
    let net: Decimal = payments.iter().map(|p| p.amount).sum();
    money::non_negative(total - net)
}

/// Earliest installment still waiting to be charged
pub fn next_pending(entries: &[ScheduleEntry]) -> Option<&ScheduleEntry> {
    entries
        .iter()
        .filter(|e| e.status == EntryStatus::Pending)
        .min_by_key(|e| e.sequence)
}

/// Builds a booking's full schedule up front
#[derive(Debug, Clone, Copy)]
pub struct PaymentPlan {
    pub max_attempts: i32,
    pub interval: Duration,
}

impl PaymentPlan {
    /// Deposit first, the remainder split evenly with the last installment
    /// absorbing rounding. Entry 1 is due on `start`.
    pub fn materialize(&self, booking: &Booking, start: Date) -> Vec<ScheduleEntry> {
        let total = money::normalize(booking.total_amount);
        let count = booking.installment_count.max(1);
        let deposit = money::normalize(booking.deposit_amount);
        let deposit_usable = deposit > Decimal::ZERO && deposit < total;

        let amounts: Vec<Decimal> = if count == 1 || !deposit_usable {
            vec![total]
        } else {
            let remainder = total - deposit;
            let rest = Decimal::from(count - 1);
            let each = (remainder / rest).round_dp_with_strategy(2, RoundingStrategy::ToZero);
            if each <= Decimal::ZERO {
                vec![deposit, remainder]
            } else {
                let mut amounts = vec![deposit];
                amounts.extend(std::iter::repeat(each).take((count - 2) as usize));
                amounts.push(remainder - each * Decimal::from(count - 2));
                amounts
            }
        };

        amounts
            .into_iter()
            .enumerate()
            .map(|(idx, amount)| ScheduleEntry {
                id: Uuid::new_v4(),
                booking_id: booking.id,
                sequence: idx as i32 + 1,
                amount,
                due_date: start + self.interval * idx as i32,
                status: EntryStatus::Pending,
                attempt_count: 0,
                max_attempts: self.max_attempts,
                last_attempt_at: None,
                next_retry_at: None,
                failure_reason: None,
                failed_at: None,
                payment_deadline: None,
                paid_at: None,
                external_charge_ref: None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BookingStatus;
    use std::str::FromStr;
    use time::macros::{date, datetime};

    fn now() -> OffsetDateTime {
        datetime!(2026-03-01 09:00 UTC)
    }

    fn entry(status: EntryStatus) -> ScheduleEntry {
        ScheduleEntry {
            id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            sequence: 2,
            amount: Decimal::from(300),
            due_date: date!(2026 - 03 - 01),
            status,
            attempt_count: 0,
            max_attempts: 3,
            last_attempt_at: None,
            next_retry_at: None,
            failure_reason: None,
            failed_at: None,
            payment_deadline: None,
            paid_at: None,
            external_charge_ref: None,
        }
    }

    fn booking(total: i64, deposit: i64, installments: i32) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            room_id: None,
            guest_name: "Guest".to_string(),
            guest_email: "guest@example.com".to_string(),
            guest_count: 1,
            currency: "eur".to_string(),
            total_amount: Decimal::from(total),
            deposit_amount: Decimal::from(deposit),
            balance_due: Decimal::from(total),
            installment_count: installments,
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

    fn failed_with(entry: &ScheduleEntry, reason: &str) -> (FailureUpdate, bool, bool) {
        match transition(
            entry,
            EntryEvent::ChargeFailed {
                reason,
                charge_ref: Some("pi_x"),
            },
            &RetryPolicy::default(),
            now(),
        ) {
            Transition::RecordFailure {
                update,
                first_failure,
                exhausted,
            } => (update, first_failure, exhausted),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_first_failure_requeues_and_sets_deadline() {
        let (update, first, exhausted) = failed_with(&entry(EntryStatus::Processing), "card declined");
        assert!(first);
        assert!(!exhausted);
        assert_eq!(update.status, EntryStatus::Pending);
        assert_eq!(update.attempt_count, 1);
        assert_eq!(update.failed_at, now());
        assert_eq!(update.payment_deadline, now() + Duration::days(14));
        assert_eq!(update.next_retry_at, Some(now() + Duration::hours(24)));
        assert_eq!(update.failure_reason, "card declined");
    }

    #[test]
    fn test_retry_never_extends_deadline() {
        let mut e = entry(EntryStatus::Processing);
        let original_deadline = now() - Duration::days(3) + Duration::days(14);
        e.attempt_count = 1;
        e.failed_at = Some(now() - Duration::days(3));
        e.payment_deadline = Some(original_deadline);

        let (update, first, _) = failed_with(&e, "insufficient funds");
        assert!(!first);
        assert_eq!(update.payment_deadline, original_deadline);
        assert_eq!(update.failed_at, now() - Duration::days(3));
    }

    #[test]
    fn test_exhausted_attempts_park_as_failed() {
        let mut e = entry(EntryStatus::Processing);
        e.attempt_count = 2;
        e.failed_at = Some(now() - Duration::days(2));
        e.payment_deadline = Some(now() + Duration::days(12));

        let (update, _, exhausted) = failed_with(&e, "declined");
        assert!(exhausted);
        assert_eq!(update.status, EntryStatus::Failed);
        assert_eq!(update.next_retry_at, None);
    }

    #[test]
    fn test_paid_is_terminal_for_failures() {
        let policy = RetryPolicy::default();
        let t = transition(
            &entry(EntryStatus::Paid),
            EntryEvent::ChargeFailed {
                reason: "late decline",
                charge_ref: None,
            },
            &policy,
            now(),
        );
        assert_eq!(t, Transition::Ignore("paid is terminal"));
        assert_eq!(
            transition(&entry(EntryStatus::Paid), EntryEvent::ChargeSucceeded, &policy, now()),
            Transition::Ignore("entry already paid")
        );
    }

    #[test]
    fn test_success_after_failure_recovers() {
        let policy = RetryPolicy::default();
        for status in [EntryStatus::Failed, EntryStatus::Pending, EntryStatus::Processing] {
            assert_eq!(
                transition(&entry(status), EntryEvent::ChargeSucceeded, &policy, now()),
                Transition::MarkPaid
            );
        }
        assert_eq!(
            transition(&entry(EntryStatus::Cancelled), EntryEvent::ChargeSucceeded, &policy, now()),
            Transition::LatePayment
        );
    }

    #[test]
    fn test_duplicate_failure_for_same_charge_ignored() {
        let mut e = entry(EntryStatus::Pending);
        e.attempt_count = 1;
        e.external_charge_ref = Some("pi_x".to_string());
        let t = transition(
            &e,
            EntryEvent::ChargeFailed {
                reason: "declined",
                charge_ref: Some("pi_x"),
            },
            &RetryPolicy::default(),
            now(),
        );
        assert_eq!(t, Transition::Ignore("failure already recorded for this charge"));
    }

    #[test]
    fn test_deadline_check_cancels_only_at_or_after_deadline() {
        let policy = RetryPolicy::default();
        let mut e = entry(EntryStatus::Failed);
        e.payment_deadline = Some(now());
        assert_eq!(
            transition(&e, EntryEvent::DeadlineCheck, &policy, now()),
            Transition::CancelBooking
        );
        e.payment_deadline = Some(now() + Duration::seconds(1));
        assert!(matches!(
            transition(&e, EntryEvent::DeadlineCheck, &policy, now()),
            Transition::Ignore(_)
        ));
        let mut paid = entry(EntryStatus::Paid);
        paid.payment_deadline = Some(now() - Duration::days(1));
        assert!(matches!(
            transition(&paid, EntryEvent::DeadlineCheck, &policy, now()),
            Transition::Ignore(_)
        ));
    }

    #[test]
    fn test_abandoned_processing_enters_failure_branch() {
        let t = transition(
            &entry(EntryStatus::Processing),
            EntryEvent::AttemptAbandoned,
            &RetryPolicy::default(),
            now(),
        );
        match t {
            Transition::RecordFailure { update, .. } => {
                assert_eq!(update.failure_reason, ABANDONED_ATTEMPT_REASON)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_booking_cancel_closes_open_entries_only() {
        let policy = RetryPolicy::default();
        for status in [EntryStatus::Pending, EntryStatus::Processing, EntryStatus::Failed] {
            assert_eq!(
                transition(&entry(status), EntryEvent::BookingCancelled, &policy, now()),
                Transition::CancelEntry
            );
        }
        assert!(matches!(
            transition(&entry(EntryStatus::Paid), EntryEvent::BookingCancelled, &policy, now()),
            Transition::Ignore(_)
        ));
    }

    #[test]
    fn test_plan_three_equal_installments() {
        let plan = PaymentPlan {
            max_attempts: 3,
            interval: Duration::days(30),
        };
        let entries = plan.materialize(&booking(900, 300, 3), date!(2026 - 01 - 01));
        let amounts: Vec<_> = entries.iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![Decimal::from(300); 3]);
        assert_eq!(entries[0].due_date, date!(2026 - 01 - 01));
        assert_eq!(entries[2].due_date, date!(2026 - 03 - 02));
        assert_eq!(
            entries.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_plan_rounding_absorbed_by_last() {
        let plan = PaymentPlan {
            max_attempts: 3,
            interval: Duration::days(30),
        };
        let entries = plan.materialize(&booking(1000, 100, 4), date!(2026 - 01 - 01));
        let total: Decimal = entries.iter().map(|e| e.amount).sum();
        assert_eq!(total, Decimal::from(1000));
        assert_eq!(entries[1].amount, Decimal::from(300));
        assert_eq!(entries[3].amount, Decimal::from(300));

        let entries = plan.materialize(&booking(100, 10, 4), date!(2026 - 01 - 01));
        assert_eq!(entries[1].amount, Decimal::from(30));
        let odd = plan.materialize(
            &Booking {
                total_amount: Decimal::from_str("100.00").unwrap(),
                deposit_amount: Decimal::from_str("0.01").unwrap(),
                ..booking(100, 0, 4)
            },
            date!(2026 - 01 - 01),
        );
        let total: Decimal = odd.iter().map(|e| e.amount).sum();
        assert_eq!(total, Decimal::from(100));
        assert_eq!(odd[3].amount, Decimal::from_str("33.01").unwrap());
    }

    #[test]
    fn test_plan_single_payment_when_deposit_unusable() {
        let plan = PaymentPlan {
            max_attempts: 3,
            interval: Duration::days(30),
        };
        let entries = plan.materialize(&booking(500, 500, 3), date!(2026 - 01 - 01));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, Decimal::from(500));
    }

    #[test]
    fn test_payment_status_derivation() {
        let at = now();
        let b = Uuid::new_v4();
        let mut entries = vec![
            entry(EntryStatus::Paid),
            entry(EntryStatus::Pending),
            entry(EntryStatus::Pending),
        ];
        let mut payments = vec![PaymentRecord::charge(b, None, Decimal::from(300), "pi_1", at)];
        assert_eq!(derive_payment_status(Decimal::from(900), &entries, &payments), PaymentStatus::Deposit);
        assert_eq!(balance_due(Decimal::from(900), &payments), Decimal::from(600));

        entries[1].status = EntryStatus::Paid;
        payments.push(PaymentRecord::charge(b, None, Decimal::from(300), "pi_2", at));
        assert_eq!(derive_payment_status(Decimal::from(900), &entries, &payments), PaymentStatus::Partial);

        entries[2].status = EntryStatus::Paid;
        payments.push(PaymentRecord::charge(b, None, Decimal::from(300), "pi_3", at));
        assert_eq!(derive_payment_status(Decimal::from(900), &entries, &payments), PaymentStatus::Paid);
        assert_eq!(balance_due(Decimal::from(900), &payments), Decimal::ZERO);

        payments.push(PaymentRecord::refund(b, None, Decimal::from(100), "re_1", at));
        assert_eq!(derive_payment_status(Decimal::from(900), &entries, &payments), PaymentStatus::PartialRefund);
        assert_eq!(balance_due(Decimal::from(900), &payments), Decimal::from(100));

        payments.push(PaymentRecord::refund(b, None, Decimal::from(800), "re_2", at));
        assert_eq!(derive_payment_status(Decimal::from(900), &entries, &payments), PaymentStatus::Refunded);
        assert_eq!(balance_due(Decimal::from(900), &payments), Decimal::from(900));

        assert_eq!(
            derive_payment_status(Decimal::from(900), &[entry(EntryStatus::Pending)], &[]),
            PaymentStatus::Unpaid
        );
    }

    #[test]
    fn test_cancelled_installments_do_not_make_booking_paid() {
        let at = now();
        let b = Uuid::new_v4();
        let entries = vec![
            entry(EntryStatus::Paid),
            entry(EntryStatus::Cancelled),
            entry(EntryStatus::Cancelled),
        ];
        let mut payments = vec![PaymentRecord::charge(b, None, Decimal::from(300), "pi_1", at)];
        assert_eq!(
            derive_payment_status(Decimal::from(900), &entries, &payments),
            PaymentStatus::Deposit
        );

        // Late settlement of a cancelled installment still leaves a balance
        payments.push(PaymentRecord::charge(b, Some(entries[2].id), Decimal::from(300), "pi_3", at));
        assert_eq!(
            derive_payment_status(Decimal::from(900), &entries, &payments),
            PaymentStatus::Partial
        );
        assert_eq!(balance_due(Decimal::from(900), &payments), Decimal::from(300));
    }

    #[test]
    fn test_next_pending_is_lowest_sequence() {
        let mut a = entry(EntryStatus::Pending);
        a.sequence = 3;
        let mut b = entry(EntryStatus::Pending);
        b.sequence = 2;
        let mut c = entry(EntryStatus::Paid);
        c.sequence = 1;
        let entries = vec![a, b, c];
        assert_eq!(next_pending(&entries).map(|e| e.sequence), Some(2));
    }
}
