//! # meshlink
//!
//! The client facade: one [`MeshClient`] owns the connection engine, the
//! message pipeline, and the webhook engine, wires them together, and
//! exposes the public surface. Subsystems communicate through the typed
//! event bus and bounded channels; the facade adds no protocol logic of
//! its own.
//!
//! ```no_run
//! use meshlink_client::MeshClient;
//! use meshlink_config::ClientConfig;
//!
//! # async fn run() -> meshlink_core::Result<()> {
//! let client = MeshClient::new(ClientConfig::new("wss://mesh.example.com/ws"))?;
//! client.connect().await?;
//! client.send_message("0xAgentAddress", "summarize this document").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use meshlink_config::ClientConfig;
use meshlink_connection::ConnectionEngine;
use meshlink_core::error::Result;
use meshlink_core::event::{EventBus, MeshEvent};
use meshlink_core::frame::{AgentInfo, Frame, FrameKind, FrameSink, RoomListData};
use meshlink_core::registry::{AgentRegistry, RoomRegistry};
use meshlink_core::state::{AuthSnapshot, ConnectionSnapshot, SharedState};
use meshlink_pipeline::{HandlerContext, MessagePipeline};
use meshlink_security::FrameSigner;
use meshlink_webhook::{WebhookEngine, WebhookEventKind};

pub use meshlink_config as config;
pub use meshlink_core::{Error, MeshEvent as Event};

/// The meshlink client.
///
/// Construction validates the configuration and builds every subsystem;
/// nothing touches the network until [`MeshClient::connect`].
pub struct MeshClient {
    config: Arc<ClientConfig>,
    events: Arc<EventBus>,
    state: SharedState,
    agents: AgentRegistry,
    rooms: RoomRegistry,
    connection: Arc<ConnectionEngine>,
    pipeline: Arc<MessagePipeline>,
    webhook: Arc<WebhookEngine>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl MeshClient {
    /// Build a client from a validated configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let events = Arc::new(EventBus::default());
        let state = SharedState::new();
        let agents = AgentRegistry::new();
        let rooms = RoomRegistry::new();

        let (pipeline_tx, pipeline_rx) = mpsc::channel::<Frame>(256);
        let connection =
            ConnectionEngine::new(config.clone(), events.clone(), state.clone(), pipeline_tx);
        connection.set_room_registry(rooms.clone());

        let signer = match config.private_key.as_deref() {
            Some(key) => Some(Arc::new(FrameSigner::from_hex(key)?)),
            None => None,
        };
        let ctx = HandlerContext::new(
            events.clone(),
            state.clone(),
            agents.clone(),
            rooms.clone(),
            signer,
            connection.clone() as Arc<dyn FrameSink>,
            config.client_type,
        );
        let pipeline = Arc::new(MessagePipeline::new(&config, ctx)?);
        let webhook = Arc::new(WebhookEngine::new(
            config.webhook.clone(),
            config.allow_insecure_webhooks,
            events.clone(),
        )?);

        let client = Self {
            config,
            events,
            state,
            agents,
            rooms,
            connection,
            pipeline,
            webhook,
            tasks: StdMutex::new(Vec::new()),
        };
        client.spawn_pump(pipeline_rx);
        client.spawn_webhook_forwarder();
        Ok(client)
    }

    // --- Lifecycle ---

    /// Connect and authenticate. Resolves once the client is ready to send.
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Intentional disconnect: no reconnect will follow.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        self.pipeline.clear_dedup();
        self.rooms.clear();
    }

    /// Disconnect and cascade destruction to every owned component.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.webhook.destroy();
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
    }

    // --- Messaging ---

    /// Send a raw frame.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.connection.send(frame).await
    }

    /// Send a text message to an agent address.
    pub async fn send_message(
        &self,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<()> {
        let frame = Frame::message(content)
            .with_id(Frame::fresh_id())
            .with_to(to);
        self.send(frame).await
    }

    /// Send a text message into a room.
    pub async fn send_room_message(
        &self,
        room: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<()> {
        let frame = Frame::message(content)
            .with_id(Frame::fresh_id())
            .with_room(room);
        self.send(frame).await
    }

    /// Submit a task to an agent. Returns the task id; the matching
    /// `task_response` arrives later as an [`MeshEvent::AgentResponse`].
    pub async fn send_task(
        &self,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<String> {
        let task_id = Frame::fresh_id();
        let mut frame = Frame::task(content)
            .with_id(Frame::fresh_id())
            .with_to(to);
        frame.task_id = Some(task_id.clone());
        self.send(frame).await?;
        Ok(task_id)
    }

    /// Send a frame and await the reply carrying the same correlation id.
    pub async fn request(&self, frame: Frame, timeout: Option<Duration>) -> Result<Frame> {
        self.connection
            .request(frame, timeout.unwrap_or_else(|| self.config.message_timeout()))
            .await
    }

    /// Submit a task and await its `task_response`.
    ///
    /// Responses are routed by the coordinator and arrive with their own
    /// frame id, so correlation here is by task id over the event stream,
    /// not the request path.
    pub async fn execute_task(
        &self,
        to: impl Into<String>,
        content: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Frame> {
        let deadline = timeout.unwrap_or_else(|| self.config.message_timeout());
        // Subscribe before sending so the response cannot slip past.
        let mut rx = self.events.subscribe();
        let task_id = self.send_task(to, content).await?;

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let MeshEvent::AgentResponse(frame) = event.as_ref() {
                            let matches = frame
                                .data_field("task_id")
                                .and_then(|v| v.as_str())
                                .is_some_and(|id| id == task_id)
                                || frame.task_id.as_deref() == Some(task_id.as_str());
                            if matches {
                                return Ok(frame.clone());
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "task waiter lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(meshlink_core::error::ConnectionError::ConnectionClosed.into());
                    }
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!("task {task_id}"), deadline)),
        }
    }

    // --- Rooms ---

    /// Ask the server to subscribe this client to a room. Membership is
    /// recorded when the acknowledgement arrives.
    pub async fn join_room(&self, room: impl Into<String>) -> Result<()> {
        self.send(Frame::subscribe(room)).await
    }

    /// Ask the server to unsubscribe this client from a room.
    pub async fn leave_room(&self, room: impl Into<String>) -> Result<()> {
        self.send(Frame::unsubscribe(room)).await
    }

    /// Fetch the server's room listing (request/response under the
    /// message timeout).
    pub async fn list_rooms(&self) -> Result<Vec<String>> {
        let reply = self
            .request(Frame::new(FrameKind::ListRooms), None)
            .await?;
        let data = RoomListData::from_frame(&reply);
        self.rooms.set_listing(data.rooms.clone());
        self.events.publish(MeshEvent::RoomList {
            rooms: data.rooms.clone(),
        });
        Ok(data.rooms)
    }

    /// Rooms this client is currently subscribed to.
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.joined()
    }

    // --- Introspection ---

    /// Copy of the known agent directory.
    pub fn agents(&self) -> Vec<AgentInfo> {
        self.agents.snapshot()
    }

    /// Copy of the connection state.
    pub fn connection_state(&self) -> ConnectionSnapshot {
        self.state.connection()
    }

    /// Copy of the auth state.
    pub fn auth_state(&self) -> AuthSnapshot {
        self.state.auth()
    }

    /// The wallet address this client authenticates as, when known.
    pub fn wallet_address(&self) -> Option<String> {
        self.connection.wallet_address()
    }

    /// Subscribe to the client's event stream.
    pub fn events(&self) -> broadcast::Receiver<Arc<MeshEvent>> {
        self.events.subscribe()
    }

    /// The webhook engine (configure, retry_failed, clear_queue).
    pub fn webhook(&self) -> &WebhookEngine {
        &self.webhook
    }

    // --- Wiring ---

    /// Inbound pump: pipeline processing in transport delivery order.
    fn spawn_pump(&self, mut pipeline_rx: mpsc::Receiver<Frame>) {
        let pipeline = Arc::clone(&self.pipeline);
        let task = tokio::spawn(async move {
            while let Some(frame) = pipeline_rx.recv().await {
                pipeline.process(frame).await;
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    /// Forward bus events into the webhook engine. Handlers never touch
    /// webhook I/O; this is the only bridge.
    fn spawn_webhook_forwarder(&self) {
        let webhook = Arc::clone(&self.webhook);
        let mut rx = self.events.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "webhook forwarder lagged behind event bus");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let forwarded: Option<(WebhookEventKind, serde_json::Value)> =
                    match event.as_ref() {
                        MeshEvent::MessageReceived(frame) => match frame.kind {
                            FrameKind::Message => serde_json::to_value(frame)
                                .ok()
                                .map(|v| (WebhookEventKind::Message, v)),
                            FrameKind::Task => serde_json::to_value(frame)
                                .ok()
                                .map(|v| (WebhookEventKind::Task, v)),
                            _ => None,
                        },
                        MeshEvent::AgentResponse(frame) => serde_json::to_value(frame)
                            .ok()
                            .map(|v| (WebhookEventKind::TaskResponse, v)),
                        MeshEvent::AgentSelected(frame) => serde_json::to_value(frame)
                            .ok()
                            .map(|v| (WebhookEventKind::AgentSelected, v)),
                        MeshEvent::Error { code, message } => Some((
                            WebhookEventKind::Error,
                            serde_json::json!({ "code": code, "message": message }),
                        )),
                        MeshEvent::StateChanged(snapshot) => serde_json::to_value(snapshot)
                            .ok()
                            .map(|v| (WebhookEventKind::ConnectionState, v)),
                        MeshEvent::AuthSuccess(snapshot) => serde_json::to_value(snapshot)
                            .ok()
                            .map(|v| (WebhookEventKind::AuthState, v)),
                        MeshEvent::AuthError { reason } => Some((
                            WebhookEventKind::AuthState,
                            serde_json::json!({ "authenticated": false, "reason": reason }),
                        )),
                        _ => None,
                    };

                if let Some((kind, data)) = forwarded {
                    if let Err(e) = webhook.enqueue(kind, data, None) {
                        // An unconfigured engine is the common, quiet case.
                        tracing::trace!(error = %e, "webhook enqueue skipped");
                    }
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }
}

impl std::fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClient")
            .field("config", &self.config)
            .field("connection", &self.state.connection())
            .finish()
    }
}
