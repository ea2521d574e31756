//! At-most-once processing of gateway events
//!
//! The claim is the conditional insert/update itself; there is no separate
//! "has this been seen" read that a concurrent delivery could slip past.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::error::BillingResult;
use crate::events::GatewayEvent;
use crate::store::BillingStore;
use crate::types::EventProcessingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    AlreadyProcessed,
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn BillingStore>,
    processing_timeout: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn BillingStore>, processing_timeout: Duration) -> Self {
        Self {
            store,
            processing_timeout,
        }
    }

    pub async fn claim(&self, event: &GatewayEvent, now: OffsetDateTime) -> BillingResult<Claim> {
        let claimed = self
            .store
            .claim_event(
                &event.id,
                &event.event_type,
                event.timestamp(),
                now,
                self.processing_timeout,
            )
            .await?;

        if claimed {
            return Ok(Claim::Claimed);
        }

        let reason = match self.store.gateway_event(&event.id).await {
            Ok(Some(record)) => match record.processing_result {
                EventProcessingResult::Success => "already processed successfully",
                EventProcessingResult::Processing => "currently being processed by another worker",
                EventProcessingResult::Error => "exists with another status",
            },
            _ => "unknown",
        };
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            reason,
            "Duplicate gateway event - skipping"
        );
        Ok(Claim::AlreadyProcessed)
    }

    /// Record the outcome of a claimed event. Retried once since the audit row is
    /// what allows redelivery after an error.
    pub async fn finish(&self, event_id: &str, outcome: Result<(), &str>) {
        let (result, message) = match outcome {
            Ok(()) => (EventProcessingResult::Success, None),
            Err(message) => (EventProcessingResult::Error, Some(message)),
        };

        if let Err(e) = self.store.finish_event(event_id, result, message).await {
            tracing::warn!(event_id = %event_id, error = %e, "Failed to record event result, retrying");
            if let Err(retry_err) = self.store.finish_event(event_id, result, message).await {
                tracing::error!(
                    event_id = %event_id,
                    error = %retry_err,
                    processing_result = %result,
                    "Failed to record event result after retry - event stays claimable only after the processing timeout"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventData;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn event(id: &str) -> GatewayEvent {
        GatewayEvent {
            id: id.to_string(),
            event_type: "charge.refunded".to_string(),
            created: 1_700_000_000,
            data: EventData {
                object: serde_json::json!({}),
            },
        }
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[tokio::test]
    async fn test_second_claim_is_duplicate() {
        let guard = IdempotencyGuard::new(Arc::new(MemoryStore::new()), Duration::minutes(30));
        assert_eq!(guard.claim(&event("evt_1"), now()).await.unwrap(), Claim::Claimed);
        guard.finish("evt_1", Ok(())).await;
        assert_eq!(
            guard.claim(&event("evt_1"), now()).await.unwrap(),
            Claim::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn test_errored_event_can_be_reclaimed() {
        let guard = IdempotencyGuard::new(Arc::new(MemoryStore::new()), Duration::minutes(30));
        guard.claim(&event("evt_2"), now()).await.unwrap();
        guard.finish("evt_2", Err("storage unavailable")).await;
        assert_eq!(guard.claim(&event("evt_2"), now()).await.unwrap(), Claim::Claimed);
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let guard = Arc::new(IdempotencyGuard::new(
            Arc::new(MemoryStore::new()),
            Duration::minutes(30),
        ));
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                guard.claim(&event("evt_3"), now()).await.unwrap()
            }));
        }
        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() == Claim::Claimed {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }
}
