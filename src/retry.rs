//! Retry policy for activities and sub-workflows.
//!
//! Retries run inside the workflow: a failed attempt schedules a backoff
//! timer and then a fresh attempt, so the whole sequence is recorded in
//! history and replays deterministically.

use std::time::Duration;

/// Delay progression between attempts.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// No delay between retries.
    None,
    /// Fixed delay between all retries.
    Fixed { delay: Duration },
    /// delay = base * multiplier^(attempt-1), capped at max.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Delay after the given failure count (1-indexed: attempt 1 produced the
    /// first failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let nanos = (base.as_nanos() as f64 * factor) as u128;
                let delay = Duration::from_nanos(nanos.min(u64::MAX as u128) as u64);
                delay.min(*max)
            }
        }
    }
}

/// Attempt budget and backoff for one operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first. Must be >= 1.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// # Panics
    /// Panics if `max_attempts` is 0.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let b = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(250),
        };
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(b.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(b.delay_for_attempt(3), Duration::from_millis(250));
    }

    #[test]
    fn none_has_zero_delay() {
        assert_eq!(BackoffStrategy::None.delay_for_attempt(5), Duration::ZERO);
    }
}
