//! Room inventory ledger
//!
//! A booking holds inventory between its first settled charge and its cancellation
//! or full refund. The `inventory_applied` flag on the booking moves in the same
//! store operation as the room counter, so repeated calls are no-ops.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{BillingStore, InventoryChange};

#[derive(Clone)]
pub struct InventoryLedger {
    store: Arc<dyn BillingStore>,
}

impl InventoryLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Decrement the booking's room by its guest count, at most once per booking
    pub async fn decrement_once(&self, booking_id: Uuid) -> BillingResult<InventoryChange> {
        let change = self.store.apply_inventory(booking_id).await?;
        log_change(booking_id, "decrement", change);
        Ok(change)
    }

    /// Give the booking's guest count back, only if it was previously taken
    pub async fn release(
        &self,
        booking_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<InventoryChange> {
        let change = self.store.release_inventory(booking_id, at).await?;
        log_change(booking_id, "release", change);
        Ok(change)
    }

    /// Raw saturating increment, for manual corrections
    pub async fn increment(&self, room_id: Uuid, count: i32) -> BillingResult<InventoryChange> {
        let change = self.store.adjust_room(room_id, count).await?;
        if let InventoryChange::Applied {
            available, clamped, ..
        } = change
        {
            if clamped {
                tracing::warn!(
                    room_id = %room_id,
                    count,
                    available,
                    "Inventory increment clamped at capacity"
                );
            }
        }
        Ok(change)
    }
}

fn log_change(booking_id: Uuid, action: &'static str, change: InventoryChange) {
    match change {
        InventoryChange::Applied {
            room_id,
            available,
            clamped: false,
        } => {
            tracing::info!(
                booking_id = %booking_id,
                room_id = %room_id,
                available,
                action,
                "Room inventory updated"
            );
        }
        InventoryChange::Applied {
            room_id,
            available,
            clamped: true,
        } => {
            tracing::warn!(
                booking_id = %booking_id,
                room_id = %room_id,
                available,
                action,
                "Room inventory inconsistent - counter clamped to [0, capacity]"
            );
        }
        InventoryChange::Unchanged => {
            tracing::debug!(booking_id = %booking_id, action, "Inventory already in target state");
        }
        InventoryChange::NoRoom => {
            tracing::debug!(booking_id = %booking_id, action, "Booking has no room inventory to adjust");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::fixtures;
    use crate::types::RoomInventory;

    #[tokio::test]
    async fn test_decrement_once_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let (booking, room_id) = fixtures::seed_booking_with_room(&store, 2, 3).await;
        let ledger = InventoryLedger::new(store.clone());

        ledger.decrement_once(booking.id).await.unwrap();
        ledger.decrement_once(booking.id).await.unwrap();
        assert_eq!(store.room(room_id).await.unwrap().unwrap().available, 1);

        ledger.release(booking.id, fixtures::now()).await.unwrap();
        ledger.release(booking.id, fixtures::now()).await.unwrap();
        assert_eq!(store.room(room_id).await.unwrap().unwrap().available, 3);
    }

    #[tokio::test]
    async fn test_increment_saturates_at_capacity() {
        let store = Arc::new(MemoryStore::new());
        let room_id = Uuid::new_v4();
        store
            .seed_room(RoomInventory {
                room_id,
                capacity: 2,
                available: 2,
            })
            .await;
        let ledger = InventoryLedger::new(store.clone());
        let change = ledger.increment(room_id, 1).await.unwrap();
        assert!(matches!(
            change,
            InventoryChange::Applied {
                available: 2,
                clamped: true,
                ..
            }
        ));
    }
}
