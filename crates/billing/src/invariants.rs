//! Billing invariant checks
//!
//! Read-only consistency checks over stored state. They can be run after any
//! reconciliation pass or webhook replay; each violation carries enough context to
//! locate the offending rows.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::schedule;
use crate::store::BillingStore;
use crate::types::{BookingStatus, EntryStatus};

const BALANCE_MATCHES_LEDGER: &str = "balance_matches_ledger";
const INVENTORY_WITHIN_CAPACITY: &str = "inventory_within_capacity";
const SINGLE_PROCESSING_ENTRY: &str = "single_processing_entry";
const CANCELLED_RELEASES_INVENTORY: &str = "cancelled_releases_inventory";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    /// Booking or room the violation is about
    pub subject_id: Uuid,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or capacity is wrong
    Critical,
    High,
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        if !violations.is_empty() {
            tracing::warn!(
                violations = violations.len(),
                checks_failed,
                "Billing invariant violations detected"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single check by name; unknown names report nothing
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            BALANCE_MATCHES_LEDGER => self.check_balance_matches_ledger().await,
            INVENTORY_WITHIN_CAPACITY => self.check_inventory_within_capacity().await,
            SINGLE_PROCESSING_ENTRY => self.check_single_processing_entry().await,
            CANCELLED_RELEASES_INVENTORY => self.check_cancelled_releases_inventory().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            BALANCE_MATCHES_LEDGER,
            INVENTORY_WITHIN_CAPACITY,
            SINGLE_PROCESSING_ENTRY,
            CANCELLED_RELEASES_INVENTORY,
        ]
    }

    /// `balance_due = max(0, total - charges + refunds)`
    async fn check_balance_matches_ledger(&self) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for booking in self.store.list_bookings().await? {
            let payments = self.store.payments(booking.id).await?;
            let expected = schedule::balance_due(booking.total_amount, &payments);
            if expected != booking.balance_due {
                violations.push(InvariantViolation {
                    invariant: BALANCE_MATCHES_LEDGER.to_string(),
                    subject_id: booking.id,
                    description: format!(
                        "Booking balance_due is {} but the ledger implies {}",
                        booking.balance_due, expected
                    ),
                    context: serde_json::json!({
                        "stored": booking.balance_due.to_string(),
                        "expected": expected.to_string(),
                        "payments": payments.len(),
                    }),
                    severity: ViolationSeverity::Critical,
                });
            }
        }
        Ok(violations)
    }

    async fn check_inventory_within_capacity(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .store
            .list_rooms()
            .await?
            .into_iter()
            .filter(|room| room.available < 0 || room.available > room.capacity)
            .map(|room| InvariantViolation {
                invariant: INVENTORY_WITHIN_CAPACITY.to_string(),
                subject_id: room.room_id,
                description: format!(
                    "Room availability {} is outside [0, {}]",
                    room.available, room.capacity
                ),
                context: serde_json::json!({
                    "available": room.available,
                    "capacity": room.capacity,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Two in-flight charges for one booking means the claim guard was bypassed
    async fn check_single_processing_entry(&self) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for booking in self.store.list_bookings().await? {
            let processing: Vec<Uuid> = self
                .store
                .schedule(booking.id)
                .await?
                .into_iter()
                .filter(|e| e.status == EntryStatus::Processing)
                .map(|e| e.id)
                .collect();
            if processing.len() > 1 {
                violations.push(InvariantViolation {
                    invariant: SINGLE_PROCESSING_ENTRY.to_string(),
                    subject_id: booking.id,
                    description: format!(
                        "Booking has {} installments processing (expected at most 1)",
                        processing.len()
                    ),
                    context: serde_json::json!({ "entry_ids": processing }),
                    severity: ViolationSeverity::High,
                });
            }
        }
        Ok(violations)
    }

    async fn check_cancelled_releases_inventory(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .store
            .list_bookings()
            .await?
            .into_iter()
            .filter(|b| b.status == BookingStatus::Cancelled && b.inventory_applied)
            .map(|b| InvariantViolation {
                invariant: CANCELLED_RELEASES_INVENTORY.to_string(),
                subject_id: b.id,
                description: "Cancelled booking still holds room inventory".to_string(),
                context: serde_json::json!({
                    "room_id": b.room_id,
                    "guest_count": b.guest_count,
                    "cancelled_at": b.cancelled_at.map(|at| at.unix_timestamp()),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::fixtures;
    use crate::types::RoomInventory;
    use rust_decimal::Decimal;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"balance_matches_ledger"));
        assert!(checks.contains(&"inventory_within_capacity"));
    }

    #[tokio::test]
    async fn test_consistent_store_is_healthy() {
        let store = Arc::new(MemoryStore::new());
        fixtures::seed_booking_with_room(&store, 1, 4).await;

        let summary = InvariantChecker::new(store).run_all_checks().await.unwrap();
        assert!(summary.healthy, "violations: {:?}", summary.violations);
        assert_eq!(summary.checks_passed, 4);
    }

    #[tokio::test]
    async fn test_detects_balance_and_inventory_violations() {
        let store = Arc::new(MemoryStore::new());
        let (mut booking, room_id) = fixtures::seed_booking_with_room(&store, 1, 4).await;
        booking.balance_due = Decimal::from(1);
        store.seed_booking(booking).await;
        store
            .seed_room(RoomInventory {
                room_id,
                capacity: 4,
                available: 5,
            })
            .await;

        let summary = InvariantChecker::new(store).run_all_checks().await.unwrap();
        assert!(!summary.healthy);
        assert_eq!(summary.checks_failed, 2);
        let names: HashSet<_> = summary.violations.iter().map(|v| v.invariant.as_str()).collect();
        assert!(names.contains("balance_matches_ledger"));
        assert!(names.contains("inventory_within_capacity"));
    }
}
