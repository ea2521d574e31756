//! Postgres store
//!
//! Conditional transitions are single `UPDATE ... WHERE <expected state>` statements.
//! Inventory changes lock the booking row and then the room row inside one
//! transaction, so the guard flag and the counter move together.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use super::{BillingStore, InventoryChange};
use crate::error::{BillingError, BillingResult};
use crate::schedule::FailureUpdate;
use crate::types::{
    Booking, EmailDeliveryEvent, EventProcessingResult, GatewayEventRecord, PaymentRecord,
    PaymentStatus, RoomInventory, ScheduleEntry,
};

const BOOKING_COLUMNS: &str = "id, room_id, guest_name, guest_email, guest_count, currency, \
    total_amount, deposit_amount, balance_due, installment_count, payment_status, status, \
    gateway_customer_id, payment_method_id, inventory_applied, inventory_released_at, \
    cancellation_reason, cancelled_at, cancellation_notified_at, created_at";

const ENTRY_COLUMNS: &str = "id, booking_id, sequence, amount, due_date, status, attempt_count, \
    max_attempts, last_attempt_at, next_retry_at, failure_reason, failed_at, payment_deadline, \
    paid_at, external_charge_ref";

const EVENT_COLUMNS: &str = "gateway_event_id, event_type, event_timestamp, processing_result, \
    processing_started_at, error_message, created_at";

#[derive(Debug, FromRow)]
struct BookingRow {
    id: Uuid,
    room_id: Option<Uuid>,
    guest_name: String,
    guest_email: String,
    guest_count: i32,
    currency: String,
    total_amount: Decimal,
    deposit_amount: Decimal,
    balance_due: Decimal,
    installment_count: i32,
    payment_status: String,
    status: String,
    gateway_customer_id: Option<String>,
    payment_method_id: Option<String>,
    inventory_applied: bool,
    inventory_released_at: Option<OffsetDateTime>,
    cancellation_reason: Option<String>,
    cancelled_at: Option<OffsetDateTime>,
    cancellation_notified_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<BookingRow> for Booking {
    type Error = BillingError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            room_id: row.room_id,
            guest_name: row.guest_name,
            guest_email: row.guest_email,
            guest_count: row.guest_count,
            currency: row.currency,
            total_amount: row.total_amount,
            deposit_amount: row.deposit_amount,
            balance_due: row.balance_due,
            installment_count: row.installment_count,
            payment_status: row.payment_status.parse()?,
            status: row.status.parse()?,
            gateway_customer_id: row.gateway_customer_id,
            payment_method_id: row.payment_method_id,
            inventory_applied: row.inventory_applied,
            inventory_released_at: row.inventory_released_at,
            cancellation_reason: row.cancellation_reason,
            cancelled_at: row.cancelled_at,
            cancellation_notified_at: row.cancellation_notified_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EntryRow {
    id: Uuid,
    booking_id: Uuid,
    sequence: i32,
    amount: Decimal,
    due_date: Date,
    status: String,
    attempt_count: i32,
    max_attempts: i32,
    last_attempt_at: Option<OffsetDateTime>,
    next_retry_at: Option<OffsetDateTime>,
    failure_reason: Option<String>,
    failed_at: Option<OffsetDateTime>,
    payment_deadline: Option<OffsetDateTime>,
    paid_at: Option<OffsetDateTime>,
    external_charge_ref: Option<String>,
}

impl TryFrom<EntryRow> for ScheduleEntry {
    type Error = BillingError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(ScheduleEntry {
            id: row.id,
            booking_id: row.booking_id,
            sequence: row.sequence,
            amount: row.amount,
            due_date: row.due_date,
            status: row.status.parse()?,
            attempt_count: row.attempt_count,
            max_attempts: row.max_attempts,
            last_attempt_at: row.last_attempt_at,
            next_retry_at: row.next_retry_at,
            failure_reason: row.failure_reason,
            failed_at: row.failed_at,
            payment_deadline: row.payment_deadline,
            paid_at: row.paid_at,
            external_charge_ref: row.external_charge_ref,
        })
    }
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    booking_id: Uuid,
    schedule_entry_id: Option<Uuid>,
    kind: String,
    amount: Decimal,
    external_ref: String,
    created_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(PaymentRecord {
            id: row.id,
            booking_id: row.booking_id,
            schedule_entry_id: row.schedule_entry_id,
            kind: row.kind.parse()?,
            amount: row.amount,
            external_ref: row.external_ref,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    gateway_event_id: String,
    event_type: String,
    event_timestamp: OffsetDateTime,
    processing_result: String,
    processing_started_at: Option<OffsetDateTime>,
    error_message: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<EventRow> for GatewayEventRecord {
    type Error = BillingError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(GatewayEventRecord {
            gateway_event_id: row.gateway_event_id,
            event_type: row.event_type,
            event_timestamp: row.event_timestamp,
            processing_result: row.processing_result.parse()?,
            processing_started_at: row.processing_started_at,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Entry query ordered the way the reconciliation passes walk them
    fn entries_sql(predicate: &str) -> String {
        format!(
            "SELECT {} FROM payment_schedules WHERE {} ORDER BY due_date, booking_id, sequence",
            ENTRY_COLUMNS, predicate
        )
    }
}

/// Saturating counter update on a row locked inside `tx`
async fn adjust_locked(
    tx: &mut Transaction<'_, Postgres>,
    room_id: Uuid,
    delta: i32,
) -> BillingResult<InventoryChange> {
    let room: Option<(i32, i32)> =
        sqlx::query_as("SELECT available, capacity FROM rooms WHERE id = $1 FOR UPDATE")
            .bind(room_id)
            .fetch_optional(&mut **tx)
            .await?;

    let Some((available, capacity)) = room else {
        return Ok(InventoryChange::NoRoom);
    };

    let wanted = available.saturating_add(delta);
    let next = wanted.clamp(0, capacity);

    sqlx::query("UPDATE rooms SET available = $2, updated_at = NOW() WHERE id = $1")
        .bind(room_id)
        .bind(next)
        .execute(&mut **tx)
        .await?;

    Ok(InventoryChange::Applied {
        room_id,
        available: next,
        clamped: next != wanted,
    })
}

#[async_trait]
impl BillingStore for PgStore {
    async fn booking(&self, booking_id: Uuid) -> BillingResult<Option<Booking>> {
        let sql = format!("SELECT {} FROM bookings WHERE id = $1", BOOKING_COLUMNS);
        let row: Option<BookingRow> = sqlx::query_as(&sql)
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Booking::try_from).transpose()
    }

    async fn list_bookings(&self) -> BillingResult<Vec<Booking>> {
        let sql = format!("SELECT {} FROM bookings ORDER BY created_at", BOOKING_COLUMNS);
        let rows: Vec<BookingRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        convert_all(rows)
    }

    async fn set_payment_method(
        &self,
        booking_id: Uuid,
        customer_id: Option<&str>,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE bookings
            SET payment_method_id = $2,
                gateway_customer_id = COALESCE($3, gateway_customer_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(booking_id)
        .bind(payment_method_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn confirm_booking(&self, booking_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE bookings SET status = 'confirmed', updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(booking_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cancel_booking(
        &self,
        booking_id: Uuid,
        reason: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET status = 'cancelled',
                cancellation_reason = $2,
                cancelled_at = $3,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'cancelled'
            "#,
        )
        .bind(booking_id)
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_cancellation_notice(
        &self,
        booking_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET cancellation_notified_at = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'cancelled' AND cancellation_notified_at IS NULL
            "#,
        )
        .bind(booking_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn unnotified_cancellations(&self, reason: &str) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM bookings WHERE status = 'cancelled' \
             AND cancellation_notified_at IS NULL AND cancellation_reason = $1 ORDER BY id",
        )
        .bind(reason)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn refresh_balance(
        &self,
        booking_id: Uuid,
        payment_status: PaymentStatus,
    ) -> BillingResult<Decimal> {
        let balance: Option<(Decimal,)> = sqlx::query_as(
            r#"
            UPDATE bookings
            SET payment_status = $2,
                balance_due = GREATEST(
                    0,
                    total_amount - COALESCE(
                        (SELECT SUM(amount) FROM payments WHERE booking_id = $1), 0
                    )
                ),
                updated_at = NOW()
            WHERE id = $1
            RETURNING balance_due
            "#,
        )
        .bind(booking_id)
        .bind(payment_status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        balance
            .map(|(b,)| b)
            .ok_or_else(|| BillingError::NotFound(format!("booking {}", booking_id)))
    }

    async fn schedule(&self, booking_id: Uuid) -> BillingResult<Vec<ScheduleEntry>> {
        let sql = format!(
            "SELECT {} FROM payment_schedules WHERE booking_id = $1 ORDER BY sequence",
            ENTRY_COLUMNS
        );
        let rows: Vec<EntryRow> = sqlx::query_as(&sql)
            .bind(booking_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn schedule_entry(&self, entry_id: Uuid) -> BillingResult<Option<ScheduleEntry>> {
        let sql = format!("SELECT {} FROM payment_schedules WHERE id = $1", ENTRY_COLUMNS);
        let row: Option<EntryRow> = sqlx::query_as(&sql)
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ScheduleEntry::try_from).transpose()
    }

    async fn insert_schedule(&self, entries: &[ScheduleEntry]) -> BillingResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO payment_schedules
                    (id, booking_id, sequence, amount, due_date, status, attempt_count, max_attempts)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (booking_id, sequence) DO NOTHING
                "#,
            )
            .bind(entry.id)
            .bind(entry.booking_id)
            .bind(entry.sequence)
            .bind(entry.amount)
            .bind(entry.due_date)
            .bind(entry.status.as_str())
            .bind(entry.attempt_count)
            .bind(entry.max_attempts)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn claim_entry(&self, entry_id: Uuid, at: OffsetDateTime) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_schedules
            SET status = 'processing', last_attempt_at = $2, updated_at = NOW()
            WHERE id = $1
              AND status = 'pending'
              AND NOT EXISTS (
                  SELECT 1 FROM payment_schedules other
                  WHERE other.booking_id = payment_schedules.booking_id
                    AND other.status = 'processing'
              )
            "#,
        )
        .bind(entry_id)
        .bind(at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.rows_affected() == 1),
            // Lost the race to a concurrent claim on a sibling entry
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_entry_paid(
        &self,
        entry_id: Uuid,
        charge_ref: &str,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_schedules
            SET status = 'paid',
                paid_at = $3,
                external_charge_ref = $2,
                next_retry_at = NULL,
                failure_reason = NULL,
                payment_deadline = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing', 'failed')
            "#,
        )
        .bind(entry_id)
        .bind(charge_ref)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_entry_failure(
        &self,
        entry_id: Uuid,
        expected_attempts: i32,
        update: &FailureUpdate,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_schedules
            SET status = $3,
                attempt_count = $4,
                last_attempt_at = $5,
                next_retry_at = $6,
                failure_reason = $7,
                failed_at = COALESCE(failed_at, $8),
                payment_deadline = COALESCE(payment_deadline, $9),
                external_charge_ref = COALESCE($10, external_charge_ref),
                updated_at = NOW()
            WHERE id = $1
              AND attempt_count = $2
              AND status IN ('pending', 'processing')
            "#,
        )
        .bind(entry_id)
        .bind(expected_attempts)
        .bind(update.status.as_str())
        .bind(update.attempt_count)
        .bind(update.last_attempt_at)
        .bind(update.next_retry_at)
        .bind(&update.failure_reason)
        .bind(update.failed_at)
        .bind(update.payment_deadline)
        .bind(update.external_charge_ref.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cancel_open_entries(&self, booking_id: Uuid) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payment_schedules
            SET status = 'cancelled', next_retry_at = NULL, updated_at = NOW()
            WHERE booking_id = $1 AND status IN ('pending', 'processing', 'failed')
            "#,
        )
        .bind(booking_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_entry_refunded(&self, charge_ref: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_schedules SET status = 'refunded', updated_at = NOW() \
             WHERE external_charge_ref = $1 AND status = 'paid'",
        )
        .bind(charge_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expired_entries(&self, now: OffsetDateTime) -> BillingResult<Vec<ScheduleEntry>> {
        let sql = Self::entries_sql(
            "status IN ('failed', 'pending') AND payment_deadline IS NOT NULL \
             AND payment_deadline <= $1",
        );
        let rows: Vec<EntryRow> = sqlx::query_as(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn due_entries(
        &self,
        today: Date,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<ScheduleEntry>> {
        let sql = Self::entries_sql(
            "status = 'pending' AND sequence > 1 AND due_date <= $1 \
             AND (next_retry_at IS NULL OR next_retry_at <= $2) \
             AND EXISTS (SELECT 1 FROM bookings b WHERE b.id = booking_id AND b.status <> 'cancelled')",
        );
        let rows: Vec<EntryRow> = sqlx::query_as(&sql)
            .bind(today)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn stalled_entries(
        &self,
        today: Date,
        now: OffsetDateTime,
        stale_after: Duration,
    ) -> BillingResult<Vec<ScheduleEntry>> {
        let cutoff = now - stale_after;
        let sql = Self::entries_sql(
            "status = 'processing' AND due_date <= $1 \
             AND (last_attempt_at IS NULL OR last_attempt_at <= $2)",
        );
        let rows: Vec<EntryRow> = sqlx::query_as(&sql)
            .bind(today)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn insert_payment(&self, record: &PaymentRecord) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payments
                (id, booking_id, schedule_entry_id, kind, amount, external_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_ref) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.booking_id)
        .bind(record.schedule_entry_id)
        .bind(record.kind.as_str())
        .bind(record.amount)
        .bind(&record.external_ref)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn payments(&self, booking_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            "SELECT id, booking_id, schedule_entry_id, kind, amount, external_ref, created_at \
             FROM payments WHERE booking_id = $1 ORDER BY created_at",
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn booking_for_charge(&self, charge_ref: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT booking_id FROM payments WHERE external_ref = $1 AND kind = 'charge'
            UNION ALL
            SELECT booking_id FROM payment_schedules WHERE external_charge_ref = $1
            LIMIT 1
            "#,
        )
        .bind(charge_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn room(&self, room_id: Uuid) -> BillingResult<Option<RoomInventory>> {
        let row: Option<(Uuid, i32, i32)> =
            sqlx::query_as("SELECT id, capacity, available FROM rooms WHERE id = $1")
                .bind(room_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(room_id, capacity, available)| RoomInventory {
            room_id,
            capacity,
            available,
        }))
    }

    async fn list_rooms(&self) -> BillingResult<Vec<RoomInventory>> {
        let rows: Vec<(Uuid, i32, i32)> =
            sqlx::query_as("SELECT id, capacity, available FROM rooms ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(room_id, capacity, available)| RoomInventory {
                room_id,
                capacity,
                available,
            })
            .collect())
    }

    async fn apply_inventory(&self, booking_id: Uuid) -> BillingResult<InventoryChange> {
        let mut tx = self.pool.begin().await?;

        let booking: Option<(Option<Uuid>, i32, bool, Option<OffsetDateTime>)> = sqlx::query_as(
            "SELECT room_id, guest_count, inventory_applied, inventory_released_at \
             FROM bookings WHERE id = $1 FOR UPDATE",
        )
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (room_id, guests, applied, released_at) =
            booking.ok_or_else(|| BillingError::NotFound(format!("booking {}", booking_id)))?;

        if applied || released_at.is_some() {
            return Ok(InventoryChange::Unchanged);
        }
        let Some(room_id) = room_id else {
            return Ok(InventoryChange::NoRoom);
        };

        let change = adjust_locked(&mut tx, room_id, -guests).await?;
        if change == InventoryChange::NoRoom {
            return Ok(change);
        }

        sqlx::query(
            "UPDATE bookings SET inventory_applied = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(booking_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(change)
    }

    async fn release_inventory(
        &self,
        booking_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<InventoryChange> {
        let mut tx = self.pool.begin().await?;

        let flipped: Option<(Option<Uuid>, i32)> = sqlx::query_as(
            r#"
            UPDATE bookings
            SET inventory_applied = FALSE, inventory_released_at = $2, updated_at = NOW()
            WHERE id = $1 AND inventory_applied = TRUE
            RETURNING room_id, guest_count
            "#,
        )
        .bind(booking_id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let change = match flipped {
            None => InventoryChange::Unchanged,
            Some((None, _)) => InventoryChange::NoRoom,
            Some((Some(room_id), guests)) => adjust_locked(&mut tx, room_id, guests).await?,
        };

        tx.commit().await?;
        Ok(change)
    }

    async fn adjust_room(&self, room_id: Uuid, delta: i32) -> BillingResult<InventoryChange> {
        let mut tx = self.pool.begin().await?;
        let change = adjust_locked(&mut tx, room_id, delta).await?;
        tx.commit().await?;
        Ok(change)
    }

    async fn bookings_missing_inventory(&self) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT b.id FROM bookings b
            WHERE b.status <> 'cancelled'
              AND b.inventory_applied = FALSE
              AND b.inventory_released_at IS NULL
              AND b.room_id IS NOT NULL
              AND EXISTS (SELECT 1 FROM payments p WHERE p.booking_id = b.id AND p.kind = 'charge')
            ORDER BY b.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn cancelled_holding_inventory(&self) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM bookings WHERE status = 'cancelled' AND inventory_applied = TRUE \
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
        now: OffsetDateTime,
        stale_after: Duration,
    ) -> BillingResult<bool> {
        // Insert wins for new events; the conditional update re-claims errored or
        // stuck ones. Anything else returns no row.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_events
                (gateway_event_id, event_type, event_timestamp, processing_result,
                 processing_started_at, created_at)
            VALUES ($1, $2, $3, 'processing', $4, $4)
            ON CONFLICT (gateway_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = $4,
                error_message = NULL
            WHERE gateway_events.processing_result = 'error'
               OR (gateway_events.processing_result = 'processing'
                   AND (gateway_events.processing_started_at IS NULL
                        OR gateway_events.processing_started_at < $5))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(now)
        .bind(now - stale_after)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE gateway_events SET processing_result = $2, error_message = $3 \
             WHERE gateway_event_id = $1",
        )
        .bind(event_id)
        .bind(result.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn gateway_event(&self, event_id: &str) -> BillingResult<Option<GatewayEventRecord>> {
        let sql = format!(
            "SELECT {} FROM gateway_events WHERE gateway_event_id = $1",
            EVENT_COLUMNS
        );
        let row: Option<EventRow> = sqlx::query_as(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(GatewayEventRecord::try_from).transpose()
    }

    async fn list_gateway_events(
        &self,
        result: Option<EventProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<GatewayEventRecord>> {
        let sql = format!(
            "SELECT {} FROM gateway_events \
             WHERE ($1::TEXT IS NULL OR processing_result = $1) \
             ORDER BY created_at DESC LIMIT $2",
            EVENT_COLUMNS
        );
        let rows: Vec<EventRow> = sqlx::query_as(&sql)
            .bind(result.map(|r| r.as_str()))
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn reset_gateway_event(&self, event_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE gateway_events
            SET processing_result = 'error',
                processing_started_at = NULL,
                error_message = 'reset for replay'
            WHERE gateway_event_id = $1 AND processing_result IN ('processing', 'error')
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_email_event(&self, event: &EmailDeliveryEvent) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_delivery_events
                (delivery_id, message_id, status, recipient, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (delivery_id) DO NOTHING
            "#,
        )
        .bind(&event.delivery_id)
        .bind(&event.message_id)
        .bind(event.status.as_str())
        .bind(event.recipient.as_deref())
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
