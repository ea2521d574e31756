//! In-process store
//!
//! Holds everything behind one async mutex, so each trait call is atomic in the
//! same way a single conditional statement is in Postgres. Used by tests and by
//! local runs without a database.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::{Date, Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BillingStore, InventoryChange};
use crate::error::{BillingError, BillingResult};
use crate::schedule::{self, FailureUpdate};
use crate::types::{
    Booking, BookingStatus, EmailDeliveryEvent, EntryStatus, EventProcessingResult,
    GatewayEventRecord, PaymentKind, PaymentRecord, PaymentStatus, RoomInventory, ScheduleEntry,
};

#[derive(Default)]
struct State {
    bookings: HashMap<Uuid, Booking>,
    entries: HashMap<Uuid, ScheduleEntry>,
    payments: Vec<PaymentRecord>,
    rooms: HashMap<Uuid, RoomInventory>,
    events: HashMap<String, GatewayEventRecord>,
    email_events: HashMap<String, EmailDeliveryEvent>,
    faults: HashSet<&'static str>,
}

impl State {
    fn take_fault(&mut self, operation: &'static str) -> BillingResult<()> {
        if self.faults.remove(operation) {
            return Err(BillingError::Database(format!(
                "injected failure in {}",
                operation
            )));
        }
        Ok(())
    }

    fn booking_mut(&mut self, booking_id: Uuid) -> BillingResult<&mut Booking> {
        self.bookings
            .get_mut(&booking_id)
            .ok_or_else(|| BillingError::NotFound(format!("booking {}", booking_id)))
    }

    fn schedule(&self, booking_id: Uuid) -> Vec<ScheduleEntry> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.booking_id == booking_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    fn adjust(&mut self, room_id: Uuid, delta: i32) -> InventoryChange {
        match self.rooms.get_mut(&room_id) {
            Some(room) => {
                let wanted = room.available.saturating_add(delta);
                let available = wanted.clamp(0, room.capacity);
                room.available = available;
                InventoryChange::Applied {
                    room_id,
                    available,
                    clamped: available != wanted,
                }
            }
            None => InventoryChange::NoRoom,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_booking(&self, booking: Booking) {
        self.state.lock().await.bookings.insert(booking.id, booking);
    }

    pub async fn seed_room(&self, room: RoomInventory) {
        self.state.lock().await.rooms.insert(room.room_id, room);
    }

    /// Make the next call of `operation` fail with a database error
    pub async fn fail_once(&self, operation: &'static str) {
        self.state.lock().await.faults.insert(operation);
    }

    /// Overwrite an entry wholesale, bypassing the conditional transitions
    pub async fn put_entry(&self, entry: ScheduleEntry) {
        self.state.lock().await.entries.insert(entry.id, entry);
    }
}

fn sort_due(entries: &mut [ScheduleEntry]) {
    entries.sort_by(|a, b| {
        a.due_date
            .cmp(&b.due_date)
            .then(a.booking_id.cmp(&b.booking_id))
            .then(a.sequence.cmp(&b.sequence))
    });
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn booking(&self, booking_id: Uuid) -> BillingResult<Option<Booking>> {
        Ok(self.state.lock().await.bookings.get(&booking_id).cloned())
    }

    async fn list_bookings(&self) -> BillingResult<Vec<Booking>> {
        let state = self.state.lock().await;
        let mut bookings: Vec<_> = state.bookings.values().cloned().collect();
        bookings.sort_by_key(|b| b.created_at);
        Ok(bookings)
    }

    async fn set_payment_method(
        &self,
        booking_id: Uuid,
        customer_id: Option<&str>,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let booking = state.booking_mut(booking_id)?;
        booking.payment_method_id = Some(payment_method_id.to_string());
        if let Some(customer_id) = customer_id {
            booking.gateway_customer_id = Some(customer_id.to_string());
        }
        Ok(())
    }

    async fn confirm_booking(&self, booking_id: Uuid) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let booking = state.booking_mut(booking_id)?;
        if booking.status != BookingStatus::Pending {
            return Ok(false);
        }
        booking.status = BookingStatus::Confirmed;
        Ok(true)
    }

    async fn cancel_booking(
        &self,
        booking_id: Uuid,
        reason: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let booking = state.booking_mut(booking_id)?;
        if booking.status == BookingStatus::Cancelled {
            return Ok(false);
        }
        booking.status = BookingStatus::Cancelled;
        booking.cancellation_reason = Some(reason.to_string());
        booking.cancelled_at = Some(at);
        Ok(true)
    }

    async fn claim_cancellation_notice(
        &self,
        booking_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let booking = state.booking_mut(booking_id)?;
        if booking.status != BookingStatus::Cancelled || booking.cancellation_notified_at.is_some() {
            return Ok(false);
        }
        booking.cancellation_notified_at = Some(at);
        Ok(true)
    }

    async fn unnotified_cancellations(&self, reason: &str) -> BillingResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut ids: Vec<_> = state
            .bookings
            .values()
            .filter(|b| {
                b.status == BookingStatus::Cancelled
                    && b.cancellation_notified_at.is_none()
                    && b.cancellation_reason.as_deref() == Some(reason)
            })
            .map(|b| b.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn refresh_balance(
        &self,
        booking_id: Uuid,
        payment_status: PaymentStatus,
    ) -> BillingResult<Decimal> {
        let mut state = self.state.lock().await;
        let payments: Vec<_> = state
            .payments
            .iter()
            .filter(|p| p.booking_id == booking_id)
            .cloned()
            .collect();
        let booking = state.booking_mut(booking_id)?;
        booking.balance_due = schedule::balance_due(booking.total_amount, &payments);
        booking.payment_status = payment_status;
        Ok(booking.balance_due)
    }

    async fn schedule(&self, booking_id: Uuid) -> BillingResult<Vec<ScheduleEntry>> {
        Ok(self.state.lock().await.schedule(booking_id))
    }

    async fn schedule_entry(&self, entry_id: Uuid) -> BillingResult<Option<ScheduleEntry>> {
        Ok(self.state.lock().await.entries.get(&entry_id).cloned())
    }

    async fn insert_schedule(&self, entries: &[ScheduleEntry]) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for entry in entries {
            let taken = state
                .entries
                .values()
                .any(|e| e.booking_id == entry.booking_id && e.sequence == entry.sequence);
            if !taken {
                state.entries.insert(entry.id, entry.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn claim_entry(&self, entry_id: Uuid, at: OffsetDateTime) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let Some(booking_id) = state
            .entries
            .get(&entry_id)
            .filter(|e| e.status == EntryStatus::Pending)
            .map(|e| e.booking_id)
        else {
            return Ok(false);
        };
        let sibling_processing = state
            .entries
            .values()
            .any(|e| e.booking_id == booking_id && e.status == EntryStatus::Processing);
        if sibling_processing {
            return Ok(false);
        }
        if let Some(entry) = state.entries.get_mut(&entry_id) {
            entry.status = EntryStatus::Processing;
            entry.last_attempt_at = Some(at);
        }
        Ok(true)
    }

    async fn mark_entry_paid(
        &self,
        entry_id: Uuid,
        charge_ref: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.entries.get_mut(&entry_id) {
            Some(entry) if entry.status.is_open() => {
                entry.status = EntryStatus::Paid;
                entry.paid_at = Some(at);
                entry.external_charge_ref = Some(charge_ref.to_string());
                entry.next_retry_at = None;
                entry.failure_reason = None;
                entry.payment_deadline = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_entry_failure(
        &self,
        entry_id: Uuid,
        expected_attempts: i32,
        update: &FailureUpdate,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.entries.get_mut(&entry_id) {
            Some(entry)
                if entry.attempt_count == expected_attempts
                    && matches!(entry.status, EntryStatus::Pending | EntryStatus::Processing) =>
            {
                entry.status = update.status;
                entry.attempt_count = update.attempt_count;
                entry.last_attempt_at = Some(update.last_attempt_at);
                entry.next_retry_at = update.next_retry_at;
                entry.failure_reason = Some(update.failure_reason.clone());
                entry.failed_at = entry.failed_at.or(Some(update.failed_at));
                entry.payment_deadline = entry.payment_deadline.or(Some(update.payment_deadline));
                if update.external_charge_ref.is_some() {
                    entry.external_charge_ref = update.external_charge_ref.clone();
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_open_entries(&self, booking_id: Uuid) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        state.take_fault("cancel_open_entries")?;
        let mut cancelled = 0;
        for entry in state.entries.values_mut() {
            if entry.booking_id == booking_id && entry.status.is_open() {
                entry.status = EntryStatus::Cancelled;
                entry.next_retry_at = None;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn mark_entry_refunded(&self, charge_ref: &str) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let entry = state.entries.values_mut().find(|e| {
            e.status == EntryStatus::Paid && e.external_charge_ref.as_deref() == Some(charge_ref)
        });
        match entry {
            Some(entry) => {
                entry.status = EntryStatus::Refunded;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expired_entries(&self, now: OffsetDateTime) -> BillingResult<Vec<ScheduleEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state
            .entries
            .values()
            .filter(|e| matches!(e.status, EntryStatus::Failed | EntryStatus::Pending))
            .filter(|e| e.payment_deadline.is_some_and(|d| d <= now))
            .cloned()
            .collect();
        sort_due(&mut entries);
        Ok(entries)
    }

    async fn due_entries(
        &self,
        today: Date,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<ScheduleEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Pending && e.sequence > 1 && e.due_date <= today)
            .filter(|e| e.next_retry_at.map_or(true, |r| r <= now))
            .filter(|e| {
                state
                    .bookings
                    .get(&e.booking_id)
                    .is_some_and(|b| b.status != BookingStatus::Cancelled)
            })
            .cloned()
            .collect();
        sort_due(&mut entries);
        Ok(entries)
    }

    async fn stalled_entries(
        &self,
        today: Date,
        now: OffsetDateTime,
        stale_after: Duration,
    ) -> BillingResult<Vec<ScheduleEntry>> {
        let state = self.state.lock().await;
        let cutoff = now - stale_after;
        let mut entries: Vec<_> = state
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Processing && e.due_date <= today)
            .filter(|e| e.last_attempt_at.map_or(true, |at| at <= cutoff))
            .cloned()
            .collect();
        sort_due(&mut entries);
        Ok(entries)
    }

    async fn insert_payment(&self, record: &PaymentRecord) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if state.payments.iter().any(|p| p.external_ref == record.external_ref) {
            return Ok(false);
        }
        if !state.bookings.contains_key(&record.booking_id) {
            return Err(BillingError::NotFound(format!("booking {}", record.booking_id)));
        }
        state.payments.push(record.clone());
        Ok(true)
    }

    async fn payments(&self, booking_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn booking_for_charge(&self, charge_ref: &str) -> BillingResult<Option<Uuid>> {
        let state = self.state.lock().await;
        let from_ledger = state
            .payments
            .iter()
            .find(|p| p.kind == PaymentKind::Charge && p.external_ref == charge_ref)
            .map(|p| p.booking_id);
        Ok(from_ledger.or_else(|| {
            state
                .entries
                .values()
                .find(|e| e.external_charge_ref.as_deref() == Some(charge_ref))
                .map(|e| e.booking_id)
        }))
    }

    async fn room(&self, room_id: Uuid) -> BillingResult<Option<RoomInventory>> {
        Ok(self.state.lock().await.rooms.get(&room_id).copied())
    }

    async fn list_rooms(&self) -> BillingResult<Vec<RoomInventory>> {
        Ok(self.state.lock().await.rooms.values().copied().collect())
    }

    async fn apply_inventory(&self, booking_id: Uuid) -> BillingResult<InventoryChange> {
        let mut state = self.state.lock().await;
        let booking = state.booking_mut(booking_id)?;
        if booking.inventory_applied || booking.inventory_released_at.is_some() {
            return Ok(InventoryChange::Unchanged);
        }
        let Some(room_id) = booking.room_id else {
            return Ok(InventoryChange::NoRoom);
        };
        let guests = booking.guest_count;
        if !state.rooms.contains_key(&room_id) {
            return Ok(InventoryChange::NoRoom);
        }
        state.booking_mut(booking_id)?.inventory_applied = true;
        Ok(state.adjust(room_id, -guests))
    }

    async fn release_inventory(
        &self,
        booking_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<InventoryChange> {
        let mut state = self.state.lock().await;
        let booking = state.booking_mut(booking_id)?;
        if !booking.inventory_applied {
            return Ok(InventoryChange::Unchanged);
        }
        booking.inventory_applied = false;
        booking.inventory_released_at = Some(at);
        let guests = booking.guest_count;
        let room_id = booking.room_id;
        match room_id {
            Some(room_id) => Ok(state.adjust(room_id, guests)),
            None => Ok(InventoryChange::NoRoom),
        }
    }

    async fn adjust_room(&self, room_id: Uuid, delta: i32) -> BillingResult<InventoryChange> {
        Ok(self.state.lock().await.adjust(room_id, delta))
    }

    async fn bookings_missing_inventory(&self) -> BillingResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut ids: Vec<_> = state
            .bookings
            .values()
            .filter(|b| {
                b.status != BookingStatus::Cancelled
                    && !b.inventory_applied
                    && b.inventory_released_at.is_none()
                    && b.room_id.is_some()
            })
            .filter(|b| {
                state
                    .payments
                    .iter()
                    .any(|p| p.booking_id == b.id && p.kind == PaymentKind::Charge)
            })
            .map(|b| b.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn cancelled_holding_inventory(&self) -> BillingResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut ids: Vec<_> = state
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Cancelled && b.inventory_applied)
            .map(|b| b.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
        now: OffsetDateTime,
        stale_after: Duration,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.events.get_mut(event_id) {
            None => {
                state.events.insert(
                    event_id.to_string(),
                    GatewayEventRecord {
                        gateway_event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        event_timestamp,
                        processing_result: EventProcessingResult::Processing,
                        processing_started_at: Some(now),
                        error_message: None,
                        created_at: now,
                    },
                );
                Ok(true)
            }
            Some(record) => {
                let reclaimable = match record.processing_result {
                    EventProcessingResult::Error => true,
                    EventProcessingResult::Processing => record
                        .processing_started_at
                        .map_or(true, |started| started < now - stale_after),
                    EventProcessingResult::Success => false,
                };
                if reclaimable {
                    record.processing_result = EventProcessingResult::Processing;
                    record.processing_started_at = Some(now);
                    record.error_message = None;
                }
                Ok(reclaimable)
            }
        }
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.events.get_mut(event_id) {
            record.processing_result = result;
            record.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn gateway_event(&self, event_id: &str) -> BillingResult<Option<GatewayEventRecord>> {
        Ok(self.state.lock().await.events.get(event_id).cloned())
    }

    async fn list_gateway_events(
        &self,
        result: Option<EventProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<GatewayEventRecord>> {
        let state = self.state.lock().await;
        let mut events: Vec<_> = state
            .events
            .values()
            .filter(|e| result.map_or(true, |r| e.processing_result == r))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn reset_gateway_event(&self, event_id: &str) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.events.get_mut(event_id) {
            Some(record) if record.processing_result != EventProcessingResult::Success => {
                record.processing_result = EventProcessingResult::Error;
                record.processing_started_at = None;
                record.error_message = Some("reset for replay".to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_email_event(&self, event: &EmailDeliveryEvent) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if state.email_events.contains_key(&event.delivery_id) {
            return Ok(false);
        }
        state
            .email_events
            .insert(event.delivery_id.clone(), event.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    fn now() -> OffsetDateTime {
        datetime!(2026-03-01 09:00 UTC)
    }

    fn booking(room_id: Option<Uuid>, guests: i32) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            room_id,
            guest_name: "Guest".to_string(),
            guest_email: "guest@example.com".to_string(),
            guest_count: guests,
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

    fn entry(booking_id: Uuid, sequence: i32) -> ScheduleEntry {
        ScheduleEntry {
            id: Uuid::new_v4(),
            booking_id,
            sequence,
            amount: Decimal::from(300),
            due_date: date!(2026 - 03 - 01),
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
        }
    }

    #[tokio::test]
    async fn test_inventory_apply_and_release_once() {
        let store = MemoryStore::new();
        let room_id = Uuid::new_v4();
        store
            .seed_room(RoomInventory {
                room_id,
                capacity: 4,
                available: 4,
            })
            .await;
        let b = booking(Some(room_id), 2);
        store.seed_booking(b.clone()).await;

        assert!(matches!(
            store.apply_inventory(b.id).await.unwrap(),
            InventoryChange::Applied { available: 2, clamped: false, .. }
        ));
        assert_eq!(store.apply_inventory(b.id).await.unwrap(), InventoryChange::Unchanged);

        store.release_inventory(b.id, now()).await.unwrap();
        assert_eq!(
            store.release_inventory(b.id, now()).await.unwrap(),
            InventoryChange::Unchanged
        );
        // Released bookings never re-apply
        assert_eq!(store.apply_inventory(b.id).await.unwrap(), InventoryChange::Unchanged);
        assert_eq!(store.room(room_id).await.unwrap().unwrap().available, 4);
    }

    #[tokio::test]
    async fn test_adjust_room_saturates() {
        let store = MemoryStore::new();
        let room_id = Uuid::new_v4();
        store
            .seed_room(RoomInventory {
                room_id,
                capacity: 2,
                available: 1,
            })
            .await;
        assert_eq!(
            store.adjust_room(room_id, -3).await.unwrap(),
            InventoryChange::Applied {
                room_id,
                available: 0,
                clamped: true
            }
        );
        assert_eq!(
            store.adjust_room(room_id, 5).await.unwrap(),
            InventoryChange::Applied {
                room_id,
                available: 2,
                clamped: true
            }
        );
    }

    #[tokio::test]
    async fn test_only_one_entry_per_booking_processing() {
        let store = MemoryStore::new();
        let b = booking(None, 1);
        store.seed_booking(b.clone()).await;
        let second = entry(b.id, 2);
        let third = entry(b.id, 3);
        store
            .insert_schedule(&[second.clone(), third.clone()])
            .await
            .unwrap();

        assert!(store.claim_entry(second.id, now()).await.unwrap());
        assert!(!store.claim_entry(second.id, now()).await.unwrap());
        assert!(!store.claim_entry(third.id, now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_schedule_skips_existing_sequences() {
        let store = MemoryStore::new();
        let b = booking(None, 1);
        store.seed_booking(b.clone()).await;
        assert_eq!(store.insert_schedule(&[entry(b.id, 1)]).await.unwrap(), 1);
        assert_eq!(
            store
                .insert_schedule(&[entry(b.id, 1), entry(b.id, 2)])
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.schedule(b.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_update_keeps_first_deadline() {
        let store = MemoryStore::new();
        let b = booking(None, 1);
        store.seed_booking(b.clone()).await;
        let mut e = entry(b.id, 2);
        let original = now() + Duration::days(10);
        e.payment_deadline = Some(original);
        e.failed_at = Some(now() - Duration::days(4));
        e.attempt_count = 1;
        store.put_entry(e.clone()).await;

        let update = FailureUpdate {
            status: EntryStatus::Pending,
            attempt_count: 2,
            last_attempt_at: now(),
            next_retry_at: Some(now() + Duration::days(1)),
            failure_reason: "declined".to_string(),
            failed_at: now(),
            payment_deadline: now() + Duration::days(14),
            external_charge_ref: None,
        };
        // Stale attempt count loses
        assert!(!store.record_entry_failure(e.id, 0, &update).await.unwrap());
        assert!(store.record_entry_failure(e.id, 1, &update).await.unwrap());

        let stored = store.schedule_entry(e.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_deadline, Some(original));
        assert_eq!(stored.failed_at, Some(now() - Duration::days(4)));
        assert_eq!(stored.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_event_claim_lifecycle() {
        let store = MemoryStore::new();
        let stale = Duration::minutes(30);
        assert!(store
            .claim_event("evt_1", "charge.refunded", now(), now(), stale)
            .await
            .unwrap());
        assert!(!store
            .claim_event("evt_1", "charge.refunded", now(), now(), stale)
            .await
            .unwrap());

        // Stuck processing becomes claimable after the timeout
        let later = now() + Duration::minutes(31);
        assert!(store
            .claim_event("evt_1", "charge.refunded", now(), later, stale)
            .await
            .unwrap());

        store
            .finish_event("evt_1", EventProcessingResult::Error, Some("db down"))
            .await
            .unwrap();
        assert!(store
            .claim_event("evt_1", "charge.refunded", now(), later, stale)
            .await
            .unwrap());

        store
            .finish_event("evt_1", EventProcessingResult::Success, None)
            .await
            .unwrap();
        assert!(!store
            .claim_event("evt_1", "charge.refunded", now(), later + Duration::days(1), stale)
            .await
            .unwrap());
        assert!(!store.reset_gateway_event("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_payment_ref_rejected() {
        let store = MemoryStore::new();
        let b = booking(None, 1);
        store.seed_booking(b.clone()).await;
        let record = PaymentRecord::charge(b.id, None, Decimal::from(300), "pi_1", now());
        assert!(store.insert_payment(&record).await.unwrap());
        let again = PaymentRecord::charge(b.id, None, Decimal::from(300), "pi_1", now());
        assert!(!store.insert_payment(&again).await.unwrap());
        assert_eq!(store.payments(b.id).await.unwrap().len(), 1);
        assert_eq!(store.booking_for_charge("pi_1").await.unwrap(), Some(b.id));
    }
}
