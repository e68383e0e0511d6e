//! Token-bucket admission control for outbound frames.
//!
//! The bucket refills continuously at `rate` tokens per second up to
//! `burst`. Thread-safe via `std::sync::Mutex` (non-async, held briefly);
//! the blocking [`TokenBucket::consume`] sleeps between probes rather than
//! holding the lock.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use meshlink_core::error::{Error, Result};

const MAX_PROBE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket: `rate` tokens/sec sustained, `burst` instantaneous.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket. `rate` and `burst` are clamped to at least 1.
    pub fn new(rate: u32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: f64::from(rate.max(1)),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refill, then take one token if available. Never blocks.
    pub fn try_consume(&self) -> bool {
        let mut state = self.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, sleeping between probes until success or `timeout`.
    ///
    /// `None` waits indefinitely. The probe interval is
    /// `min(1/rate, 100ms)` so the wait tracks the refill rate.
    pub async fn consume(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let probe = Duration::from_secs_f64(1.0 / self.rate).min(MAX_PROBE_SLEEP);

        loop {
            if self.try_consume() {
                return Ok(());
            }
            let sleep_for = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::RateLimit(format!(
                            "no token available within {}ms",
                            timeout.unwrap_or_default().as_millis()
                        )));
                    }
                    probe.min(remaining)
                }
                None => probe,
            };
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Restore the bucket to full.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.tokens = self.burst;
        state.last_refill = Instant::now();
    }

    /// Currently available whole tokens (after refill).
    pub fn available(&self) -> u32 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens.floor() as u32
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_available_immediately() {
        let bucket = TokenBucket::new(1, 5);
        for _ in 0..5 {
            assert!(bucket.try_consume());
        }
        assert!(!bucket.try_consume());
    }

    #[test]
    fn reset_refills_to_burst() {
        let bucket = TokenBucket::new(1, 3);
        while bucket.try_consume() {}
        bucket.reset();
        assert_eq!(bucket.available(), 3);
    }

    #[test]
    fn zero_parameters_clamp_to_one() {
        let bucket = TokenBucket::new(0, 0);
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn consume_waits_for_refill() {
        let bucket = TokenBucket::new(10, 1);
        assert!(bucket.try_consume());
        // Bucket is empty; a blocking consume succeeds once 1/rate elapses.
        bucket.consume(Some(Duration::from_secs(1))).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn consume_times_out_when_starved() {
        let bucket = TokenBucket::new(1, 1);
        assert!(bucket.try_consume());
        let err = bucket
            .consume(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "rate_limit");
    }

    #[tokio::test]
    async fn conservation_over_window() {
        // Accepted sends over a window W never exceed burst + rate * W.
        let bucket = TokenBucket::new(50, 5);
        let start = Instant::now();
        let mut accepted = 0u32;
        while start.elapsed() < Duration::from_millis(100) {
            if bucket.try_consume() {
                accepted += 1;
            }
            tokio::task::yield_now().await;
        }
        let window = start.elapsed().as_secs_f64();
        let bound = 5.0 + 50.0 * window + 1.0;
        assert!(
            f64::from(accepted) <= bound,
            "accepted {accepted} exceeds bound {bound}"
        );
    }
}
