//! The webhook delivery engine.
//!
//! One bounded queue, one retry policy, one circuit breaker, one processor
//! task. The processor is a single runner: at most one POST is in flight
//! per engine, which keeps retry and breaker accounting simple. Failed
//! items rotate to the tail so one dead endpoint payload cannot block the
//! queue head forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderName};
use tokio::sync::Notify;
use tokio::time::Instant;

use meshlink_config::WebhookConfig;
use meshlink_core::error::{Error, Result, ValidationError, WebhookError};
use meshlink_core::event::{EventBus, MeshEvent};
use meshlink_resilience::{
    BoundedQueue, CircuitBreaker, CircuitBreakerConfig, OverflowPolicy, RetryPolicy,
};
use meshlink_security::validate_webhook_url;

use crate::payload::{WebhookEventKind, WebhookItem, WebhookPayload};

/// Queue capacity; overflow drops the oldest pending delivery.
const QUEUE_CAP: usize = 1000;

struct EngineInner {
    client: reqwest::Client,
    events: Arc<EventBus>,
    allow_insecure: bool,
    config: StdMutex<Option<WebhookConfig>>,
    retry: StdMutex<RetryPolicy>,
    breaker: CircuitBreaker,
    queue: StdMutex<BoundedQueue<WebhookItem>>,
    notify: Notify,
    destroyed: AtomicBool,
    processor_running: AtomicBool,
}

/// Queued, retried, circuit-broken HTTP POST fan-out.
pub struct WebhookEngine {
    inner: Arc<EngineInner>,
}

impl WebhookEngine {
    /// Build an engine. A `None` config means "not configured": enqueues
    /// fail until [`WebhookEngine::configure`] installs a target.
    pub fn new(
        config: Option<WebhookConfig>,
        allow_insecure: bool,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        Self::with_breaker(config, allow_insecure, events, CircuitBreakerConfig::default())
    }

    /// Build an engine with explicit circuit breaker tuning.
    pub fn with_breaker(
        config: Option<WebhookConfig>,
        allow_insecure: bool,
        events: Arc<EventBus>,
        breaker: CircuitBreakerConfig,
    ) -> Result<Self> {
        if let Some(config) = &config {
            validate_webhook_url(&config.url, allow_insecure)?;
            validate_headers(config)?;
        }
        let retry = config
            .as_ref()
            .map(|c| c.retry.policy())
            .unwrap_or_default();
        Ok(Self {
            inner: Arc::new(EngineInner {
                client: reqwest::Client::new(),
                events,
                allow_insecure,
                config: StdMutex::new(config),
                retry: StdMutex::new(retry),
                breaker: CircuitBreaker::new(breaker),
                queue: StdMutex::new(BoundedQueue::new(QUEUE_CAP, OverflowPolicy::DropOldest)),
                notify: Notify::new(),
                destroyed: AtomicBool::new(false),
                processor_running: AtomicBool::new(false),
            }),
        })
    }

    /// Queue one event for delivery and kick the processor.
    ///
    /// Events excluded by the configured filter are dropped silently.
    pub fn enqueue(
        &self,
        event: WebhookEventKind,
        data: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Config("webhook engine is destroyed".into()));
        }
        {
            let config = lock(&self.inner.config);
            let Some(config) = config.as_ref() else {
                return Err(WebhookError::NotConfigured.into());
            };
            if let Some(allowed) = &config.allowed_events {
                if !allowed.iter().any(|name| name == event.as_str()) {
                    tracing::trace!(event = %event, "webhook event filtered out");
                    return Ok(());
                }
            }
        }

        let payload = WebhookPayload::new(event, data, metadata);
        // Catch unserializable payloads here, not inside the processor.
        serde_json::to_string(&payload)
            .map_err(|e| ValidationError::Json(e.to_string()))?;

        {
            let mut queue = lock(&self.inner.queue);
            let at_cap = queue.size() == queue.max_size();
            queue.push(WebhookItem::new(payload))?;
            if at_cap {
                tracing::warn!("webhook queue full, dropped oldest pending delivery");
            }
        }
        self.inner.notify.notify_one();
        self.ensure_processor();
        Ok(())
    }

    /// Swap the delivery target; the new URL is validated immediately.
    pub fn configure(&self, config: WebhookConfig) -> Result<()> {
        validate_webhook_url(&config.url, self.inner.allow_insecure)?;
        validate_headers(&config)?;
        if let Some(allowed) = &config.allowed_events {
            for name in allowed {
                WebhookEventKind::parse(name)?;
            }
        }
        *lock(&self.inner.retry) = config.retry.policy();
        *lock(&self.inner.config) = Some(config);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Reset attempt bookkeeping on every failed item so the processor
    /// retries them from scratch.
    pub fn retry_failed(&self) {
        {
            let mut queue = lock(&self.inner.queue);
            for item in queue.iter_mut() {
                if item.last_error.is_some() {
                    item.reset();
                }
            }
        }
        self.inner.notify.notify_one();
    }

    /// Drop every pending delivery.
    pub fn clear_queue(&self) {
        lock(&self.inner.queue).clear();
    }

    /// Pending deliveries (failed-and-waiting included).
    pub fn queue_size(&self) -> usize {
        lock(&self.inner.queue).size()
    }

    /// Defensive copy of the pending items.
    pub fn pending(&self) -> Vec<WebhookItem> {
        lock(&self.inner.queue).to_vec()
    }

    /// Stop the processor and drop all state. The engine rejects use
    /// afterwards.
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.clear_queue();
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    /// Spawn the single processor task if it is not already running.
    fn ensure_processor(&self) {
        if self
            .inner
            .processor_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            process_loop(&inner).await;
            inner.processor_running.store(false, Ordering::SeqCst);
        });
    }
}

impl Drop for WebhookEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn process_loop(inner: &EngineInner) {
    loop {
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let head = { lock(&inner.queue).peek().cloned() };
        let Some(item) = head else {
            inner.notify.notified().await;
            continue;
        };

        // Head not due yet: sleep until its retry time, but wake early for
        // new enqueues (the head may change underneath us).
        if let Some(at) = item.next_retry {
            let now = Instant::now();
            if at > now {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = inner.notify.notified() => {}
                }
                continue;
            }
        }

        let Some(config) = lock(&inner.config).clone() else {
            inner.notify.notified().await;
            continue;
        };
        let url = config.url.clone();

        let outcome = inner
            .breaker
            .execute(|| deliver(inner, &config, &item.payload))
            .await;

        match outcome {
            Ok(status) => {
                lock(&inner.queue).shift();
                inner
                    .events
                    .publish(MeshEvent::WebhookSent { url: url.clone() });
                inner
                    .events
                    .publish(MeshEvent::WebhookSuccess { url, status });
            }
            Err(Error::CircuitOpen { retry_in_ms }) => {
                tracing::debug!(retry_in_ms, "webhook circuit open, pausing deliveries");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(retry_in_ms.max(10))) => {}
                    _ = inner.notify.notified() => {}
                }
            }
            Err(e) => {
                let (should_retry, attempts) = {
                    let retry = lock(&inner.retry).clone();
                    let mut queue = lock(&inner.queue);
                    match queue.peek_mut() {
                        Some(head) => {
                            head.attempts += 1;
                            head.last_attempt = Some(Instant::now());
                            head.last_error = Some(e.to_string());
                            let attempts = head.attempts;
                            if retry.should_retry(attempts) {
                                let delay = retry
                                    .delay(attempts)
                                    .unwrap_or(Duration::from_secs(1));
                                head.next_retry = Some(Instant::now() + delay);
                                // Rotate so other payloads are not stuck
                                // behind this one's backoff.
                                queue.rotate_head_to_tail();
                                (true, attempts)
                            } else {
                                queue.shift();
                                (false, attempts)
                            }
                        }
                        None => (false, 0),
                    }
                };
                if should_retry {
                    tracing::warn!(attempt = attempts, error = %e, "webhook delivery failed, will retry");
                    inner.events.publish(MeshEvent::WebhookRetry {
                        url,
                        attempt: attempts,
                    });
                } else {
                    tracing::error!(attempts, error = %e, "webhook delivery abandoned");
                    inner.events.publish(MeshEvent::WebhookError {
                        url,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

/// One POST attempt, run inside the circuit breaker.
async fn deliver(
    inner: &EngineInner,
    config: &WebhookConfig,
    payload: &WebhookPayload,
) -> Result<u16> {
    let url = validate_webhook_url(&config.url, inner.allow_insecure)?;
    let body = serde_json::to_string(payload)?;

    let mut request = inner
        .client
        .post(url.clone())
        .timeout(config.timeout())
        .header(CONTENT_TYPE, "application/json");
    for (name, value) in &config.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.body(body).send().await.map_err(|e| {
        if e.is_timeout() {
            Error::from(WebhookError::TimedOut {
                url: config.url.clone(),
                elapsed_ms: config.timeout_ms,
            })
        } else {
            WebhookError::Network {
                url: config.url.clone(),
                reason: e.to_string(),
            }
            .into()
        }
    })?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return Err(WebhookError::Http {
            url: config.url.clone(),
            status,
        }
        .into());
    }
    tracing::debug!(status, "webhook delivered");
    Ok(status)
}

fn validate_headers(config: &WebhookConfig) -> Result<()> {
    for name in config.headers.keys() {
        HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            Error::from(ValidationError::InvalidField {
                path: format!("webhook.headers.{name}"),
                reason: "not a valid HTTP header name".into(),
            })
        })?;
    }
    Ok(())
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
