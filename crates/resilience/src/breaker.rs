//! Three-state circuit breaker with a sliding failure window.
//!
//! Closed → Open when the windowed failure count reaches the threshold;
//! Open → Half-open after `open_timeout`; Half-open → Closed after enough
//! consecutive successes, or straight back to Open on any failure. The
//! internal lock is never held across the wrapped operation's await.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use meshlink_core::error::{Error, Result};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tuning knobs; defaults follow common service-mesh practice.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Windowed failures required to trip Open.
    pub failure_threshold: u32,
    /// Half-open successes required to close again.
    pub success_threshold: u32,
    /// How long to stay Open before probing.
    pub open_timeout: Duration,
    /// Sliding window for failure accounting.
    pub window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    failure_timestamps: VecDeque<Instant>,
    next_attempt_at: Option<Instant>,
}

/// A circuit breaker guarding one downstream dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let config = CircuitBreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            ..config
        };
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                failure_timestamps: VecDeque::new(),
                next_attempt_at: None,
            }),
        }
    }

    /// Run `op` under the breaker.
    ///
    /// While Open (and before the open timeout elapses) this fails fast
    /// with a circuit-open error and `op` is never invoked.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.before_call()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }

    /// Current position.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Time remaining until an Open breaker will probe, if Open.
    pub fn time_until_retry(&self) -> Option<Duration> {
        let state = self.lock();
        match (state.state, state.next_attempt_at) {
            (CircuitState::Open, Some(at)) => Some(at.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }

    /// Force-return to Closed and clear all counters.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.failure_timestamps.clear();
        state.next_attempt_at = None;
    }

    fn before_call(&self) -> Result<()> {
        let mut state = self.lock();
        if state.state == CircuitState::Open {
            let now = Instant::now();
            match state.next_attempt_at {
                Some(at) if now >= at => {
                    tracing::debug!("circuit breaker transitioning open -> half-open");
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                }
                Some(at) => {
                    return Err(Error::CircuitOpen {
                        retry_in_ms: at.saturating_duration_since(now).as_millis() as u64,
                    });
                }
                None => {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                }
            }
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    tracing::info!("circuit breaker closed after successful probes");
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.failure_timestamps.clear();
                    state.next_attempt_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        match state.state {
            CircuitState::Closed => {
                state.failure_timestamps.push_back(now);
                let window = self.config.window;
                while let Some(front) = state.failure_timestamps.front() {
                    if now.duration_since(*front) > window {
                        state.failure_timestamps.pop_front();
                    } else {
                        break;
                    }
                }
                state.failure_count = state.failure_timestamps.len() as u32;
                if state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = state.failure_count,
                        "circuit breaker tripped open"
                    );
                    state.state = CircuitState::Open;
                    state.next_attempt_at = Some(now + self.config.open_timeout);
                }
            }
            CircuitState::HalfOpen => {
                tracing::debug!("half-open probe failed, reopening circuit");
                state.state = CircuitState::Open;
                state.success_count = 0;
                state.next_attempt_at = Some(now + self.config.open_timeout);
            }
            CircuitState::Open => {}
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_core::error::WebhookError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing() -> Result<()> {
        Err(WebhookError::Network {
            url: "https://example.com".into(),
            reason: "refused".into(),
        }
        .into())
    }

    fn config(open_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout,
            window: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn opens_after_threshold() {
        let breaker = CircuitBreaker::new(config(Duration::from_secs(60)));
        for _ in 0..3 {
            let _ = breaker.execute(|| async { failing() }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_fails_fast_without_invoking() {
        let breaker = CircuitBreaker::new(config(Duration::from_secs(60)));
        for _ in 0..3 {
            let _ = breaker.execute(|| async { failing() }).await;
        }

        let calls = AtomicU32::new(0);
        let err = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, meshlink_core::Error>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "circuit_open");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "op must not run while open");
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_timeout_then_closes() {
        let breaker = CircuitBreaker::new(config(Duration::from_secs(5)));
        for _ in 0..3 {
            let _ = breaker.execute(|| async { failing() }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;

        // First probe is allowed and succeeds; breaker is half-open.
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Second success closes it.
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(config(Duration::from_secs(5)));
        for _ in 0..3 {
            let _ = breaker.execute(|| async { failing() }).await;
        }
        tokio::time::advance(Duration::from_secs(6)).await;

        let _ = breaker.execute(|| async { failing() }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.time_until_retry().is_some());
    }

    #[tokio::test]
    async fn success_decrements_failure_count() {
        let breaker = CircuitBreaker::new(config(Duration::from_secs(60)));
        let _ = breaker.execute(|| async { failing() }).await;
        let _ = breaker.execute(|| async { failing() }).await;
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        // Two failures minus one success leaves headroom; one more failure
        // must not trip the breaker.
        let _ = breaker.execute(|| async { failing() }).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_returns_to_closed() {
        let breaker = CircuitBreaker::new(config(Duration::from_secs(60)));
        for _ in 0..3 {
            let _ = breaker.execute(|| async { failing() }).await;
        }
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.execute(|| async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn passes_through_operation_result() {
        let breaker = CircuitBreaker::default();
        let value = breaker.execute(|| async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(value, 42);
    }
}
