//! Retry, backoff and deadline policy for installment charges

use time::{Duration, OffsetDateTime};

/// Tuning for the schedule state machine. Transition logic reads these values
/// and never hardcodes intervals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before an installment is parked as `failed`
    pub max_attempts: i32,
    /// Delay before a failed attempt is retried
    pub retry_interval: Duration,
    /// Grace window after the first failure before the booking is cancelled
    pub deadline_window: Duration,
    /// A `processing` claim older than this is considered abandoned
    pub processing_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_interval: Duration::hours(24),
            deadline_window: Duration::days(14),
            processing_timeout: Duration::minutes(30),
        }
    }
}

impl RetryPolicy {
    pub fn next_retry_at(&self, now: OffsetDateTime) -> OffsetDateTime {
        now + self.retry_interval
    }

    pub fn deadline_from(&self, first_failure: OffsetDateTime) -> OffsetDateTime {
        first_failure + self.deadline_window
    }

    /// Whether a claim taken at `claimed_at` has outlived the processing timeout
    pub fn is_abandoned(&self, claimed_at: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
        match claimed_at {
            Some(at) => now - at >= self.processing_timeout,
            None => true,
        }
    }
}
