//! Storage port for the reconciliation engine
//!
//! Every mutation of an invariant-bearing field is a single conditional operation:
//! the `WHERE` clause is both the check and the effect, so concurrent callers race
//! on the row rather than on a read made earlier. Methods returning `bool` report
//! whether this call performed the change.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::schedule::FailureUpdate;
use crate::types::{
    Booking, EmailDeliveryEvent, EventProcessingResult, GatewayEventRecord, PaymentRecord,
    PaymentStatus, RoomInventory, ScheduleEntry,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Result of an inventory flag flip plus counter update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InventoryChange {
    /// Counter moved; `clamped` is set when saturation kept it inside `[0, capacity]`
    Applied {
        room_id: Uuid,
        available: i32,
        clamped: bool,
    },
    /// The booking's guard flag was already in the target state
    Unchanged,
    /// Booking has no room assigned
    NoRoom,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // ---------------------------------------------------------------- bookings

    async fn booking(&self, booking_id: Uuid) -> BillingResult<Option<Booking>>;

    async fn list_bookings(&self) -> BillingResult<Vec<Booking>>;

    /// Remember the reusable payment method captured at checkout
    async fn set_payment_method(
        &self,
        booking_id: Uuid,
        customer_id: Option<&str>,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    /// `pending -> confirmed`
    async fn confirm_booking(&self, booking_id: Uuid) -> BillingResult<bool>;

    /// Soft-cancel unless already cancelled
    async fn cancel_booking(
        &self,
        booking_id: Uuid,
        reason: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Stamp `cancellation_notified_at` on a cancelled booking that has none yet
    async fn claim_cancellation_notice(
        &self,
        booking_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Bookings cancelled with `reason` whose guest was never told
    async fn unnotified_cancellations(&self, reason: &str) -> BillingResult<Vec<Uuid>>;

    /// Set payment status and recompute `balance_due` from the payments ledger in
    /// the same statement. Returns the new balance.
    async fn refresh_balance(
        &self,
        booking_id: Uuid,
        payment_status: PaymentStatus,
    ) -> BillingResult<Decimal>;

    // ---------------------------------------------------------------- schedule

    async fn schedule(&self, booking_id: Uuid) -> BillingResult<Vec<ScheduleEntry>>;

    async fn schedule_entry(&self, entry_id: Uuid) -> BillingResult<Option<ScheduleEntry>>;

    /// Insert a materialized schedule; rows whose `(booking_id, sequence)` exists are skipped
    async fn insert_schedule(&self, entries: &[ScheduleEntry]) -> BillingResult<u64>;

    /// `pending -> processing`, stamping the attempt time. Fails if another entry of
    /// the booking is already processing.
    async fn claim_entry(&self, entry_id: Uuid, at: OffsetDateTime) -> BillingResult<bool>;

    /// Any open status -> `paid`; clears failure and deadline fields
    async fn mark_entry_paid(
        &self,
        entry_id: Uuid,
        charge_ref: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Apply a failure outcome if `attempt_count` still equals `expected_attempts`
    /// and the entry is pending or processing. `failed_at` and `payment_deadline`
    /// are only written when currently unset.
    async fn record_entry_failure(
        &self,
        entry_id: Uuid,
        expected_attempts: i32,
        update: &FailureUpdate,
    ) -> BillingResult<bool>;

    /// Cancel every pending, processing or failed entry of a booking
    async fn cancel_open_entries(&self, booking_id: Uuid) -> BillingResult<u64>;

    /// `paid -> refunded` for the entry settled by `charge_ref`
    async fn mark_entry_refunded(&self, charge_ref: &str) -> BillingResult<bool>;

    /// Failed (or still pending) entries whose payment deadline has passed
    async fn expired_entries(&self, now: OffsetDateTime) -> BillingResult<Vec<ScheduleEntry>>;

    /// Pending entries after the first, due by `today` and past any retry delay
    async fn due_entries(&self, today: Date, now: OffsetDateTime)
        -> BillingResult<Vec<ScheduleEntry>>;

    /// Processing entries whose due date passed and whose claim is older than `stale_after`
    async fn stalled_entries(
        &self,
        today: Date,
        now: OffsetDateTime,
        stale_after: Duration,
    ) -> BillingResult<Vec<ScheduleEntry>>;

    // ---------------------------------------------------------------- payments

    /// Insert a ledger line; returns false if `external_ref` was already recorded
    async fn insert_payment(&self, record: &PaymentRecord) -> BillingResult<bool>;

    async fn payments(&self, booking_id: Uuid) -> BillingResult<Vec<PaymentRecord>>;

    /// Booking a charge reference belongs to, via the ledger or the schedule
    async fn booking_for_charge(&self, charge_ref: &str) -> BillingResult<Option<Uuid>>;

    // ---------------------------------------------------------------- inventory

    async fn room(&self, room_id: Uuid) -> BillingResult<Option<RoomInventory>>;

    async fn list_rooms(&self) -> BillingResult<Vec<RoomInventory>>;

    /// Set the booking's inventory flag and decrement its room by the guest count,
    /// both or neither. Never applies twice, nor after a release.
    async fn apply_inventory(&self, booking_id: Uuid) -> BillingResult<InventoryChange>;

    /// Clear the flag and give the guest count back, only if it was applied
    async fn release_inventory(
        &self,
        booking_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<InventoryChange>;

    /// Saturating adjustment of a room's available count
    async fn adjust_room(&self, room_id: Uuid, delta: i32) -> BillingResult<InventoryChange>;

    /// Live bookings with a settled charge whose inventory was never applied
    async fn bookings_missing_inventory(&self) -> BillingResult<Vec<Uuid>>;

    /// Cancelled bookings still holding inventory
    async fn cancelled_holding_inventory(&self) -> BillingResult<Vec<Uuid>>;

    // ---------------------------------------------------------------- events

    /// Claim exclusive processing rights for a gateway event. Succeeds for a new
    /// event, for one whose last attempt errored, and for one stuck in
    /// `processing` longer than `stale_after`.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
        now: OffsetDateTime,
        stale_after: Duration,
    ) -> BillingResult<bool>;

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn gateway_event(&self, event_id: &str) -> BillingResult<Option<GatewayEventRecord>>;

    async fn list_gateway_events(
        &self,
        result: Option<EventProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<GatewayEventRecord>>;

    /// Move a `processing` or `error` event back to claimable
    async fn reset_gateway_event(&self, event_id: &str) -> BillingResult<bool>;

    // ---------------------------------------------------------------- email

    /// Record a delivery-status event once per delivery id
    async fn record_email_event(&self, event: &EmailDeliveryEvent) -> BillingResult<bool>;
}
