use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff shared by fetch and delivery retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            max_backoff,
        }
    }

    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    /// Doubles per attempt up to `max_backoff`, plus up to 10% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_backoff.as_millis() as u64;
        let max_ms = self.max_backoff.as_millis() as u64;
        let exponent = attempt.saturating_sub(1).min(16);
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(exponent)).min(max_ms);

        let jitter_ms = if delay_ms >= 10 {
            rand::thread_rng().gen_range(0..=delay_ms / 10)
        } else {
            0
        };

        Duration::from_millis(delay_ms.saturating_add(jitter_ms).min(max_ms.max(delay_ms)))
    }
}
