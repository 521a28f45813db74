//! Client reconnect policy for "service not currently active" replies.
//!
//! Retrying forever at a fixed interval is the historical contract and
//! remains the default, but the attempt count is configurable so callers
//! can get an explicit giving-up error instead.

use rand::{thread_rng, Rng};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    interval: Duration,
    /// `None` keeps the historical unbounded loop.
    max_attempts: Option<usize>,
    jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            jitter_fraction: 0.0,
        }
    }

    pub fn bounded(max_attempts: usize, interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts.max(1)),
            jitter_fraction: 0.0,
        }
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }

    fn delay(&self) -> Duration {
        if self.jitter_fraction <= 0.0 || self.interval.is_zero() {
            return self.interval;
        }
        let low = 1.0 - self.jitter_fraction;
        let high = 1.0 + self.jitter_fraction;
        let factor = thread_rng().gen_range(low..=high);
        Duration::from_millis((self.interval.as_millis() as f64 * factor).round() as u64)
    }
}

pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    /// Returns the delay to sleep before the next attempt, or `None` once
    /// the policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts + 1 >= max {
                return None;
            }
        }
        self.attempts += 1;
        Some(self.policy.delay())
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
