//! Exponential backoff with jitter, shared by every component that retries
//! a transient failure: the fabric reconnecting to a peer, the scheduler
//! retrying a dispatch against a different candidate, a client-facing SDK
//! retrying a `Transient` error.

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    /// Multiplicative jitter factor in `[0.0, 1.0]`: the computed delay is
    /// scaled by a random value in `[1.0 - jitter, 1.0]`.
    pub jitter: f64,
}

impl RetryPolicy {
    pub const fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self { base, max, max_attempts, jitter: 0.2 }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before attempt `attempt` (0-indexed: the first retry is
    /// `attempt == 0`). Returns `None` once `max_attempts` is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let raw = self.base.saturating_mul(exp).min(self.max);
        let jittered_factor = 1.0 - self.jitter * rand::thread_rng().gen::<f64>();
        Some(Duration::from_secs_f64(raw.as_secs_f64() * jittered_factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10), 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempt_and_caps_at_max() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100), 10).with_jitter(0.0);
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(20)));
        assert_eq!(policy.delay_for(10), Some(Duration::from_millis(100)));
    }

    #[test]
    fn exhausted_after_max_attempts() {
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(1), 3);
        assert!(policy.delay_for(3).is_none());
    }
}
