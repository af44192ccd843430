use std::time::Duration;

/// Bounded exponential backoff: attempt `n` (1-based) that fails waits
/// `base_delay * 2^(n-1)` before attempt `n + 1`.
///
/// Used twice: by the inference client for its per-call attempts, and by the
/// queue worker for job-level redelivery. The two budgets are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

/// Upper bound on a single backoff sleep.
const MAX_DELAY: Duration = Duration::from_secs(300);

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// A policy that never retries.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay to wait after `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(MAX_DELAY)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Sum of every backoff sleep when all attempts fail.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts).map(|a| self.delay_for(a)).sum()
    }
}
