//! Retry policy with capped exponential backoff and jitter

use std::time::Duration;

use rand::Rng;

/// How many times, and how long between, conflict retries
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retries)
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound for any single sleep, jitter included
    pub max_delay: Duration,
    /// Jitter band as a fraction of the computed delay (0.25 = ±25%)
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(5),
            jitter_ratio: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    /// `min(base * 2^attempt, max_delay)` without jitter
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        // Cap the shift to prevent overflow
        let multiplier = 1u32 << attempt.min(31);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff scaled by `1 + jitter_ratio * unit`, clamped to `max_delay`.
    ///
    /// `unit` is clamped into `[-1, 1]`.
    pub fn backoff_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_backoff(attempt);
        let factor = 1.0 + self.jitter_ratio * unit.clamp(-1.0, 1.0);
        let nanos = (base.as_nanos() as f64 * factor.max(0.0)).round() as u64;
        Duration::from_nanos(nanos).min(self.max_delay)
    }

    /// Jittered backoff for `attempt` (0-based), drawn from the thread-local RNG
    pub fn backoff(&self, attempt: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.backoff_with_jitter(attempt, unit)
    }
}
