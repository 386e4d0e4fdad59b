// Bounded retry with exponential backoff for optimistic writes.

use std::time::Duration;

/// How many times a guarded write is attempted and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts, base_backoff: Duration::ZERO, max_backoff: Duration::ZERO }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 0-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(7);
        self.base_backoff.saturating_mul(1u32 << exp).min(self.max_backoff)
    }
}

/// Exponential delay used by loops retrying transport failures.
pub fn backoff_delay(attempt: u32) -> Duration {
    const BASE_DELAY_MS: u64 = 250;
    const MAX_DELAY_MS: u64 = 30_000;
    let exp = attempt.min(7);
    Duration::from_millis(BASE_DELAY_MS.saturating_mul(1u64 << exp).min(MAX_DELAY_MS))
}
