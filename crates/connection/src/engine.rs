//! Connection lifecycle: connect, authenticate, heartbeat, reconnect.
//!
//! The engine owns the transport handle and the pending-request map. The
//! outbound path is serialized behind a FIFO-fair async mutex so wire
//! order matches caller arrival order. Authentication progress is observed
//! through the shared state's watch channel, never polled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use meshlink_config::ClientConfig;
use meshlink_core::error::{ConnectionError, AuthError, Error, Result};
use meshlink_core::event::{EventBus, MeshEvent};
use meshlink_core::frame::{Frame, FrameKind, FrameSink};
use meshlink_core::registry::RoomRegistry;
use meshlink_core::state::SharedState;
use meshlink_core::wire::{encode_frame, validate_frame};
use meshlink_resilience::{BoundedQueue, OverflowPolicy, TokenBucket};
use meshlink_security::FrameSigner;

use crate::transport::{self, TransportEvent, TransportHandle};

/// Keepalive cadence on an open transport.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Overall deadline for the challenge handshake.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(15);
/// How long a cached-auth probe may take before falling back to a
/// fresh challenge.
pub const CACHED_AUTH_WAIT: Duration = Duration::from_secs(2);

/// Frames buffered while reconnecting; oldest are dropped beyond this.
const OUTBOUND_QUEUE_CAP: usize = 100;

/// Owns the transport and the connection state machine.
pub struct ConnectionEngine {
    config: Arc<ClientConfig>,
    events: Arc<EventBus>,
    state: SharedState,
    limiter: TokenBucket,
    /// Wallet address from config or derived from the key, when known.
    wallet_address: Option<String>,
    transport: Mutex<Option<TransportHandle>>,
    pending: Arc<StdMutex<HashMap<String, oneshot::Sender<Result<Frame>>>>>,
    outbound: StdMutex<BoundedQueue<Frame>>,
    send_lock: Mutex<()>,
    intentional_disconnect: AtomicBool,
    reconnect_running: AtomicBool,
    pipeline_tx: mpsc::Sender<Frame>,
    rooms: StdMutex<Option<RoomRegistry>>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl ConnectionEngine {
    /// Build an engine. `pipeline_tx` receives every inbound frame that is
    /// not claimed by a pending request, in transport delivery order.
    pub fn new(
        config: Arc<ClientConfig>,
        events: Arc<EventBus>,
        state: SharedState,
        pipeline_tx: mpsc::Sender<Frame>,
    ) -> Arc<Self> {
        let rate = config.max_messages_per_second;
        let wallet_address = config.wallet_address.clone().or_else(|| {
            config
                .private_key
                .as_deref()
                .and_then(|key| FrameSigner::from_hex(key).ok())
                .map(|signer| signer.address())
        });
        Arc::new(Self {
            limiter: TokenBucket::new(rate, rate.max(1)),
            wallet_address,
            transport: Mutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            outbound: StdMutex::new(BoundedQueue::new(
                OUTBOUND_QUEUE_CAP,
                OverflowPolicy::DropOldest,
            )),
            send_lock: Mutex::new(()),
            intentional_disconnect: AtomicBool::new(false),
            reconnect_running: AtomicBool::new(false),
            pipeline_tx,
            rooms: StdMutex::new(None),
            background: StdMutex::new(Vec::new()),
            config,
            events,
            state,
        })
    }

    /// Install the room registry consulted during auto-join.
    pub fn set_room_registry(&self, registry: RoomRegistry) {
        *self.rooms.lock().unwrap_or_else(|e| e.into_inner()) = Some(registry);
    }

    /// The wallet address this engine authenticates as, when known.
    pub fn wallet_address(&self) -> Option<String> {
        self.wallet_address.clone()
    }

    /// Connect, authenticate, and drain any frames buffered during a
    /// reconnect window. Resolves once the client is ready to send.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.intentional_disconnect.store(false, Ordering::SeqCst);
        self.teardown_transport(1000).await;

        let url = self.transport_url();
        tracing::info!(url = %redact_query(&url), "connecting");

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(64);
        let handle = transport::open(&url, self.config.connection_timeout(), event_tx).await?;
        *self.transport.lock().await = Some(handle.clone());

        self.spawn_event_loop(event_rx);
        self.spawn_heartbeat(handle.clone());

        self.state.update_connection(|c| {
            c.connected = true;
            c.reconnecting = false;
            c.last_connected_at = Some(chrono::Utc::now());
            c.last_error = None;
        });
        self.events.publish(MeshEvent::Open);
        self.publish_state();

        if let Err(e) = self.authenticate(&handle).await {
            self.events.publish(MeshEvent::AuthError {
                reason: e.to_string(),
            });
            // Leave no half-authenticated socket behind.
            self.intentional_disconnect.store(true, Ordering::SeqCst);
            self.teardown_transport(1000).await;
            self.state.update_connection(|c| {
                c.connected = false;
                c.last_disconnected_at = Some(chrono::Utc::now());
                c.last_error = Some(e.to_string());
            });
            self.publish_state();
            return Err(e);
        }

        self.state.update_connection(|c| {
            c.reconnect_attempts = 0;
            c.reconnecting = false;
        });
        self.publish_state();
        self.after_auth().await;
        self.events.publish(MeshEvent::Ready);

        self.drain_outbound().await;
        Ok(())
    }

    /// Intentional shutdown: cancel timers, reject pending requests, close
    /// the socket with code 1000, and emit `disconnect`.
    pub async fn disconnect(&self) {
        self.intentional_disconnect.store(true, Ordering::SeqCst);
        self.reject_pending();
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.teardown_transport(1000).await;
        self.state.update_connection(|c| {
            c.connected = false;
            c.reconnecting = false;
            c.last_disconnected_at = Some(chrono::Utc::now());
        });
        self.publish_state();
        self.events.publish(MeshEvent::Disconnect);
    }

    /// Validate, rate-limit, and write one frame.
    ///
    /// While reconnecting (and reconnect is enabled) the frame is buffered
    /// and drained FIFO after the next successful authentication.
    pub async fn send(&self, mut frame: Frame) -> Result<()> {
        validate_frame(&frame)?;

        let handle = { self.transport.lock().await.clone() };
        let open = handle.as_ref().is_some_and(TransportHandle::is_open);
        if !open {
            let reconnecting = self.state.connection().reconnecting;
            if self.config.reconnect.enabled && reconnecting {
                let mut queue = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
                queue.push(frame)?;
                tracing::debug!(queued = queue.size(), "buffered frame during reconnect");
                return Ok(());
            }
            return Err(ConnectionError::NotConnected.into());
        }
        let handle = handle.expect("checked above");

        // While the handshake is in flight, only auth-phase frames may hit
        // the wire; user sends wait for the post-auth drain.
        let auth_pending =
            self.config.private_key.is_some() && !self.state.auth().authenticated;
        if auth_pending && !is_auth_phase(frame.kind) {
            let mut queue = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
            queue.push(frame)?;
            tracing::debug!(queued = queue.size(), "buffered frame during authentication");
            return Ok(());
        }

        // Serialize token acquisition and the write so wire order matches
        // caller arrival order.
        let _guard = self.send_lock.lock().await;
        frame.stamp();
        self.limiter
            .consume(Some(self.config.message_timeout()))
            .await?;
        let text = encode_frame(&frame, self.config.max_message_size)?;
        handle.send_text(text).await?;
        self.events.publish(MeshEvent::MessageSent(frame));
        Ok(())
    }

    /// Send a frame and await the reply that echoes its correlation id.
    pub async fn request(&self, mut frame: Frame, timeout: Duration) -> Result<Frame> {
        let id = frame.id.clone().unwrap_or_else(Frame::fresh_id);
        frame.id = Some(id.clone());

        let (tx, rx) = oneshot::channel();
        self.pending_lock().insert(id.clone(), tx);

        if let Err(e) = self.send(frame).await {
            self.pending_lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::ConnectionClosed.into()),
            Err(_) => {
                self.pending_lock().remove(&id);
                Err(Error::timeout(format!("request {id}"), timeout))
            }
        }
    }

    // --- Connect internals ---

    /// The transport URL with the webhook target appended, when configured.
    fn transport_url(&self) -> String {
        match &self.config.webhook {
            Some(webhook) => {
                let separator = if self.config.ws_url.contains('?') { '&' } else { '?' };
                let encoded: String =
                    url::form_urlencoded::byte_serialize(webhook.url.as_bytes()).collect();
                format!("{}{}webhookUrl={}", self.config.ws_url, separator, encoded)
            }
            None => self.config.ws_url.clone(),
        }
    }

    async fn authenticate(&self, handle: &TransportHandle) -> Result<()> {
        if self.config.private_key.is_none() {
            tracing::debug!("no credentials configured, skipping authentication");
            return Ok(());
        }

        // An explicitly configured wallet lets the server short-circuit on
        // a cached session; a freshly derived one has no session to find.
        if let Some(wallet) = &self.config.wallet_address {
            let mut probe = Frame::new(FrameKind::CheckCachedAuth);
            probe.from = Some(wallet.clone());
            self.send_raw(handle, probe).await?;
            if self.state.wait_authenticated(CACHED_AUTH_WAIT).await {
                tracing::info!("cached authentication accepted");
                return Ok(());
            }
        }

        self.send_raw(handle, Frame::new(FrameKind::RequestChallenge))
            .await?;
        if self.state.wait_authenticated(AUTH_TIMEOUT).await {
            return Ok(());
        }

        let connection = self.state.connection();
        if let Some(error) = connection.last_error {
            return Err(AuthError::Rejected(error).into());
        }
        Err(AuthError::TimedOut(AUTH_TIMEOUT.as_millis() as u64).into())
    }

    /// Write an auth-phase frame directly: validated and stamped, but not
    /// rate-limited and never buffered.
    async fn send_raw(&self, handle: &TransportHandle, mut frame: Frame) -> Result<()> {
        validate_frame(&frame)?;
        frame.stamp();
        let text = encode_frame(&frame, self.config.max_message_size)?;
        handle.send_text(text).await?;
        self.events.publish(MeshEvent::MessageSent(frame));
        Ok(())
    }

    /// Subscribe configured rooms and register agent capabilities after a
    /// successful handshake.
    async fn after_auth(&self) {
        let joined: Vec<String> = {
            let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
            rooms.as_ref().map(|r| r.joined()).unwrap_or_default()
        };
        for room in &self.config.auto_join_rooms {
            if joined.contains(room) {
                continue;
            }
            if let Err(e) = self.send(Frame::subscribe(room.clone())).await {
                tracing::warn!(room = %room, error = %e, "auto-join failed");
            }
        }

        if matches!(
            self.config.client_type,
            meshlink_config::ClientType::Agent | meshlink_config::ClientType::Coordinator
        ) {
            let register = Frame::new(FrameKind::Register).with_data(serde_json::json!({
                "client_type": match self.config.client_type {
                    meshlink_config::ClientType::Agent => "agent",
                    meshlink_config::ClientType::Coordinator => "coordinator",
                    meshlink_config::ClientType::User => "user",
                },
                "capabilities": self.config.capabilities,
            }));
            if let Err(e) = self.send(register).await {
                tracing::warn!(error = %e, "registration failed");
            }
        }
    }

    async fn drain_outbound(&self) {
        loop {
            let frame = {
                let mut queue = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
                queue.shift()
            };
            let Some(frame) = frame else { break };
            if let Err(e) = self.send(frame).await {
                tracing::warn!(error = %e, "failed to drain buffered frame");
            }
        }
    }

    // --- Background tasks ---

    fn spawn_event_loop(self: &Arc<Self>, mut event_rx: mpsc::Receiver<TransportEvent>) {
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    TransportEvent::Frame(text) => engine.handle_inbound(&text).await,
                    TransportEvent::Closed { code, reason } => {
                        engine.on_transport_closed(code, reason).await;
                        break;
                    }
                }
            }
        });
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    fn spawn_heartbeat(self: &Arc<Self>, handle: TransportHandle) {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // first tick is immediate
            loop {
                interval.tick().await;
                if !handle.is_open() {
                    break;
                }
                let mut ping = Frame::ping();
                ping.stamp();
                // Keepalives bypass the token bucket so user traffic can
                // never starve them.
                match serde_json::to_string(&ping) {
                    Ok(text) => {
                        if handle.send_text(text).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "ping serialization failed");
                        break;
                    }
                }
                tracing::trace!("ping sent");
            }
        });
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    async fn handle_inbound(&self, text: &str) {
        let frame = match meshlink_core::wire::decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping invalid inbound frame");
                self.events.publish(MeshEvent::MessageError {
                    code: e.code(),
                    message: e.to_string(),
                });
                return;
            }
        };

        self.events.publish(MeshEvent::MessageReceived(frame.clone()));

        if let Some(id) = frame.id.as_deref() {
            if let Some(tx) = self.pending_lock().remove(id) {
                let _ = tx.send(Ok(frame));
                return;
            }
        }

        if self.pipeline_tx.send(frame).await.is_err() {
            tracing::debug!("pipeline receiver gone, dropping frame");
        }
    }

    async fn on_transport_closed(self: &Arc<Self>, code: Option<u16>, reason: String) {
        tracing::info!(?code, reason = %reason, "transport closed");
        self.reject_pending();
        self.state.update_connection(|c| {
            c.connected = false;
            c.last_disconnected_at = Some(chrono::Utc::now());
            if code != Some(1000) {
                c.last_error = Some(if reason.is_empty() {
                    "transport closed".into()
                } else {
                    reason.clone()
                });
            }
        });
        self.events.publish(MeshEvent::Close { code, reason });
        self.publish_state();

        if self.intentional_disconnect.load(Ordering::SeqCst) || !self.config.reconnect.enabled {
            return;
        }
        self.spawn_reconnect();
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        // Single reconnect loop per engine; a second close while one is
        // running must not fork another.
        if self
            .reconnect_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let policy = engine.config.reconnect.policy();
            loop {
                if engine.intentional_disconnect.load(Ordering::SeqCst) {
                    break;
                }
                let attempt = engine.state.connection().reconnect_attempts + 1;
                if !policy.should_retry(attempt) {
                    engine.state.update_connection(|c| {
                        c.reconnecting = false;
                        c.last_error = Some("max reconnect attempts reached".into());
                    });
                    engine.publish_state();
                    engine.events.publish(MeshEvent::Error {
                        code: "connection",
                        message: format!(
                            "max reconnect attempts reached ({})",
                            attempt.saturating_sub(1)
                        ),
                    });
                    break;
                }

                engine.state.update_connection(|c| {
                    c.reconnecting = true;
                    c.reconnect_attempts = attempt;
                });
                engine.publish_state();
                engine
                    .events
                    .publish(MeshEvent::Reconnecting { attempt });

                let delay = policy
                    .delay(attempt)
                    .unwrap_or(Duration::from_secs(1));
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                tokio::time::sleep(delay).await;

                if engine.intentional_disconnect.load(Ordering::SeqCst) {
                    break;
                }
                match engine.connect().await {
                    Ok(()) => {
                        engine.events.publish(MeshEvent::Reconnected);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    }
                }
            }
            engine.reconnect_running.store(false, Ordering::SeqCst);
        });
    }

    // --- Plumbing ---

    /// Reject every pending request with a connection-closed error.
    fn reject_pending(&self) {
        let entries: Vec<_> = {
            let mut pending = self.pending_lock();
            pending.drain().collect()
        };
        for (id, tx) in entries {
            tracing::debug!(id = %id, "rejecting pending request");
            let _ = tx.send(Err(ConnectionError::ConnectionClosed.into()));
        }
    }

    async fn teardown_transport(&self, code: u16) {
        let handle = self.transport.lock().await.take();
        if let Some(handle) = handle {
            handle.close(code).await;
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            background.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
    }

    fn publish_state(&self) {
        self.events
            .publish(MeshEvent::StateChanged(self.state.connection()));
    }

    fn pending_lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Result<Frame>>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Frames that may cross the wire before authentication completes.
fn is_auth_phase(kind: FrameKind) -> bool {
    matches!(
        kind,
        FrameKind::RequestChallenge
            | FrameKind::CheckCachedAuth
            | FrameKind::Auth
            | FrameKind::Ping
            | FrameKind::Pong
    )
}

#[async_trait]
impl FrameSink for ConnectionEngine {
    async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.send(frame).await
    }
}

/// Strip query values from a URL for logging (the webhook target may carry
/// tokens).
fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
