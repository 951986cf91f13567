//! Bounded retry policy shared by the verifier and the payout executor.

use std::time::Duration;

/// Fixed-delay, bounded retry policy.
///
/// `max_attempts` counts every attempt including the first; a policy with
/// `max_attempts == 0` is treated as a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// No delay between attempts. For tests.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// 5 attempts, 1 second apart: a just-submitted transaction is usually
    /// indexed within that window.
    pub const fn verification_default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }

    /// 30 checks, 2 seconds apart.
    pub const fn confirmation_default() -> Self {
        Self::new(30, Duration::from_secs(2))
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Sleeps between attempts; no-op after the last one or with zero delay.
    pub async fn pause(&self, attempt: u32) {
        if attempt + 1 < self.attempts() && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    /// Upper bound on the time spent sleeping across all attempts.
    pub fn max_wait(&self) -> Duration {
        self.delay.saturating_mul(self.attempts().saturating_sub(1))
    }
}
