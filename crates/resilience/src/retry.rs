//! Retry delay calculation.
//!
//! A policy is pure arithmetic: callers ask whether an attempt is allowed
//! and how long to wait before it. Sleeping is the caller's business.

use std::time::Duration;

use meshlink_core::error::{Error, Result};
use serde::{Deserialize, Serialize};

const JITTER_MAX_MS: u64 = 1000;

/// How delays grow across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * multiplier^(attempt-1)`
    #[default]
    Exponential,
    /// `base * attempt`
    Linear,
    /// `base`
    Constant,
}

/// Delay calculator for retried operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    strategy: BackoffStrategy,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: bool,
    multiplier: f64,
}

impl RetryPolicy {
    /// Create a policy. `max_delay` is raised to `base_delay` if smaller,
    /// and the multiplier defaults to 2.
    pub fn new(
        strategy: BackoffStrategy,
        base_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
        jitter: bool,
    ) -> Self {
        Self {
            strategy,
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_attempts,
            jitter,
            multiplier: 2.0,
        }
    }

    /// Override the exponential multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Whether `attempt` (1-based) is still within budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before `attempt` (1-based): strategy curve, clamped to the
    /// cap, plus up to one second of uniform jitter when enabled.
    pub fn delay(&self, attempt: u32) -> Result<Duration> {
        if attempt < 1 {
            return Err(Error::Config("retry attempt must be >= 1".into()));
        }
        let base_ms = self.base_delay.as_millis() as f64;
        let raw_ms = match self.strategy {
            BackoffStrategy::Exponential => base_ms * self.multiplier.powi(attempt as i32 - 1),
            BackoffStrategy::Linear => base_ms * f64::from(attempt),
            BackoffStrategy::Constant => base_ms,
        };
        let mut delay_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        if self.jitter {
            use rand::Rng;
            delay_ms += rand::rng().random_range(0..=JITTER_MAX_MS) as f64;
        }
        Ok(Duration::from_millis(delay_ms.floor() as u64))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            BackoffStrategy::Exponential,
            Duration::from_secs(1),
            Duration::from_secs(30),
            3,
            true,
        )
    }
}
