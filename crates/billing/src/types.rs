//! Persisted billing entities
//!
//! Statuses are stored as lowercase text columns; `as_str` and `FromStr` are the
//! only place that mapping lives.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingError;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BillingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BillingError::Database(format!(
                        "unknown {} value '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Booking-level payment progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Deposit,
    Partial,
    Paid,
    Refunded,
    PartialRefund,
}

text_enum!(PaymentStatus {
    Unpaid => "unpaid",
    Deposit => "deposit",
    Partial => "partial",
    Paid => "paid",
    Refunded => "refunded",
    PartialRefund => "partial_refund",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

text_enum!(BookingStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
    Completed => "completed",
});

/// Lifecycle of one installment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Processing,
    Paid,
    Failed,
    Cancelled,
    Refunded,
}

text_enum!(EntryStatus {
    Pending => "pending",
    Processing => "processing",
    Paid => "paid",
    Failed => "failed",
    Cancelled => "cancelled",
    Refunded => "refunded",
});

impl EntryStatus {
    /// Entries that still expect money
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            EntryStatus::Pending | EntryStatus::Processing | EntryStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Charge,
    Refund,
}

text_enum!(PaymentKind {
    Charge => "charge",
    Refund => "refund",
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Booking {
    pub id: Uuid,
    pub room_id: Option<Uuid>,
    pub guest_name: String,
    pub guest_email: String,
    pub guest_count: i32,
    pub currency: String,
    pub total_amount: Decimal,
    pub deposit_amount: Decimal,
    pub balance_due: Decimal,
    pub installment_count: i32,
    pub payment_status: PaymentStatus,
    pub status: BookingStatus,
    pub gateway_customer_id: Option<String>,
    pub payment_method_id: Option<String>,
    /// Set together with the room decrement, cleared by the matching increment
    pub inventory_applied: bool,
    pub inventory_released_at: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: Option<OffsetDateTime>,
    /// Claimed once, just before the cancellation email goes out
    pub cancellation_notified_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub sequence: i32,
    pub amount: Decimal,
    pub due_date: Date,
    pub status: EntryStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub next_retry_at: Option<OffsetDateTime>,
    pub failure_reason: Option<String>,
    pub failed_at: Option<OffsetDateTime>,
    pub payment_deadline: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
    pub external_charge_ref: Option<String>,
}

impl ScheduleEntry {
    /// Deterministic gateway idempotency key for charging this installment
    pub fn idempotency_key(&self) -> String {
        format!("schedule-{}-{}", self.id, self.due_date)
    }
}

/// Immutable ledger line for a settled charge or refund
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub schedule_entry_id: Option<Uuid>,
    pub kind: PaymentKind,
    /// Positive for charges, negative for refunds
    pub amount: Decimal,
    pub external_ref: String,
    pub created_at: OffsetDateTime,
}

impl PaymentRecord {
    pub fn charge(
        booking_id: Uuid,
        schedule_entry_id: Option<Uuid>,
        amount: Decimal,
        external_ref: impl Into<String>,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            schedule_entry_id,
            kind: PaymentKind::Charge,
            amount: amount.abs(),
            external_ref: external_ref.into(),
            created_at: at,
        }
    }

    pub fn refund(
        booking_id: Uuid,
        schedule_entry_id: Option<Uuid>,
        amount: Decimal,
        external_ref: impl Into<String>,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            schedule_entry_id,
            kind: PaymentKind::Refund,
            amount: -amount.abs(),
            external_ref: external_ref.into(),
            created_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoomInventory {
    pub room_id: Uuid,
    pub capacity: i32,
    pub available: i32,
}

/// Processing state of a gateway event in the audit table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventProcessingResult {
    Processing,
    Success,
    Error,
}

text_enum!(EventProcessingResult {
    Processing => "processing",
    Success => "success",
    Error => "error",
});

/// Dedup marker for a gateway webhook event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayEventRecord {
    pub gateway_event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_timestamp: OffsetDateTime,
    pub processing_result: EventProcessingResult,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Email provider delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Bounced,
    Complained,
    Opened,
    Clicked,
}

text_enum!(DeliveryStatus {
    Sent => "sent",
    Delivered => "delivered",
    Bounced => "bounced",
    Complained => "complained",
    Opened => "opened",
    Clicked => "clicked",
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailDeliveryEvent {
    /// Provider delivery id, unique per webhook message
    pub delivery_id: String,
    pub message_id: String,
    pub status: DeliveryStatus,
    pub recipient: Option<String>,
    pub occurred_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_roundtrip() {
        for status in [
            EntryStatus::Pending,
            EntryStatus::Processing,
            EntryStatus::Paid,
            EntryStatus::Failed,
            EntryStatus::Cancelled,
            EntryStatus::Refunded,
        ] {
            assert_eq!(status.as_str().parse::<EntryStatus>().unwrap(), status);
        }
        assert_eq!(PaymentStatus::PartialRefund.as_str(), "partial_refund");
        assert!("bogus".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let entry = ScheduleEntry {
            id: Uuid::nil(),
            booking_id: Uuid::nil(),
            sequence: 2,
            amount: Decimal::from(300),
            due_date: time::macros::date!(2026 - 03 - 01),
            status: EntryStatus::Pending,
            attempt_count: 0,
            max_attempts: 3,
            last_attempt_at: None,
            next_retry_at: None,
            failure_reason: None,
            failed_at: None,
            payment_deadline: None,
            paid_at: None,
            external_charge_ref: None,
        };
        assert_eq!(
            entry.idempotency_key(),
            "schedule-00000000-0000-0000-0000-000000000000-2026-03-01"
        );
        let mut retried = entry.clone();
        retried.attempt_count = 2;
        assert_eq!(retried.idempotency_key(), entry.idempotency_key());
    }

    #[test]
    fn test_payment_record_signs() {
        let at = OffsetDateTime::UNIX_EPOCH;
        let charge = PaymentRecord::charge(Uuid::nil(), None, Decimal::from(-10), "pi_1", at);
        let refund = PaymentRecord::refund(Uuid::nil(), None, Decimal::from(10), "re_1", at);
        assert_eq!(charge.amount, Decimal::from(10));
        assert_eq!(refund.amount, Decimal::from(-10));
    }
}
