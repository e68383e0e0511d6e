//! In-process mesh server for end-to-end tests.
//!
//! Speaks just enough of the wire protocol to drive the client: challenge
//! handshake, room acks, list_rooms replies, and scripted pushes. Records
//! every frame it receives and can kill its sockets to force reconnects.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::sync::broadcast;

/// Tunable server behavior per test.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Accept connections but never answer anything.
    pub silent: bool,
    /// Answer `check_cached_auth` with an immediate `auth_success`.
    pub cached_auth: bool,
    /// Answer signed `auth` frames with `auth_error`.
    pub reject_auth: bool,
}

#[derive(Clone)]
struct ServerState {
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicU32>,
    kill: broadcast::Sender<()>,
    push: broadcast::Sender<String>,
    behavior: Behavior,
}

/// Handle to a running test server.
pub struct MeshServer {
    addr: SocketAddr,
    state: ServerState,
    shutdown: Arc<tokio::sync::Notify>,
}

impl MeshServer {
    pub async fn spawn(behavior: Behavior) -> Self {
        let (kill, _) = broadcast::channel(8);
        let (push, _) = broadcast::channel(64);
        let state = ServerState {
            received: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicU32::new(0)),
            kill,
            push,
            behavior,
        };
        let app = Router::new()
            .route("/ws", get(upgrade))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let signal = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.notified().await })
                .await
                .unwrap();
        });
        Self {
            addr,
            state,
            shutdown,
        }
    }

    /// Stop accepting new connections and drop live ones.
    pub fn stop(&self) {
        self.shutdown.notify_one();
        self.kill_connections();
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Push a frame to every connected client.
    pub fn push_frame(&self, frame: Value) {
        let _ = self.state.push.send(frame.to_string());
    }

    /// Drop every live socket without a close frame.
    pub fn kill_connections(&self) {
        let _ = self.state.kill.send(());
    }

    /// Total sockets accepted so far.
    pub fn connection_count(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Copy of every frame received so far.
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().unwrap().clone()
    }

    /// Frames of one kind, in arrival order.
    pub fn received_of_kind(&self, kind: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|v| v["kind"] == kind)
            .collect()
    }

    /// Poll until `predicate` holds over the received frames.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&[Value]) -> bool, deadline: Duration) {
        let start = std::time::Instant::now();
        loop {
            {
                let received = self.state.received.lock().unwrap();
                if predicate(&received) {
                    return;
                }
            }
            assert!(
                start.elapsed() < deadline,
                "server did not observe expected frames in time: {:?}",
                self.received()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

async fn serve_connection(mut socket: WebSocket, state: ServerState) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut kill_rx = state.kill.subscribe();
    let mut push_rx = state.push.subscribe();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                            continue;
                        };
                        state.received.lock().unwrap().push(frame.clone());
                        if state.behavior.silent {
                            continue;
                        }
                        for reply in replies_for(&frame, &state.behavior) {
                            if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return,
                }
            }
            _ = kill_rx.recv() => {
                // Abrupt drop: no close frame, like a dying server.
                return;
            }
            out = push_rx.recv() => {
                if let Ok(text) = out {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn replies_for(frame: &Value, behavior: &Behavior) -> Vec<Value> {
    match frame["kind"].as_str() {
        Some("request_challenge") => vec![json!({
            "kind": "challenge",
            "data": { "challenge": "prove-it-86" },
        })],
        Some("auth") if behavior.reject_auth => vec![json!({
            "kind": "auth_error",
            "data": { "message": "signature not acceptable" },
        })],
        Some("auth") if frame["signature"].is_string() => vec![json!({
            "kind": "auth_success",
            "data": {
                "wallet_address": frame["public_key"],
                "rooms": [],
            },
        })],
        Some("register") => vec![json!({ "kind": "registration_success" })],
        Some("check_cached_auth") if behavior.cached_auth => vec![json!({
            "kind": "auth_success",
            "data": { "wallet_address": frame["from"], "rooms": [] },
        })],
        Some("list_rooms") => vec![json!({
            "kind": "list_rooms",
            "id": frame["id"],
            "data": { "rooms": ["lobby", "dev"] },
        })],
        Some("subscribe") => vec![json!({
            "kind": "subscribe",
            "data": { "room": frame["room"], "success": true },
        })],
        Some("unsubscribe") => vec![json!({
            "kind": "unsubscribe",
            "data": { "room": frame["room"], "success": true },
        })],
        Some("ping") => vec![json!({ "kind": "pong", "id": frame["id"] })],
        Some("task") => vec![json!({
            "kind": "task_response",
            "id": format!("{}-resp", frame["id"].as_str().unwrap_or("task")),
            "from": "0xagent",
            "data": {
                "task_id": frame["task_id"],
                "success": true,
                "result": { "echo": frame["content"] },
            },
        })],
        _ => Vec::new(),
    }
}

/// Collect client events into a vector for later assertions.
pub fn collect_events(
    mut rx: tokio::sync::broadcast::Receiver<Arc<meshlink_core::MeshEvent>>,
) -> Arc<Mutex<Vec<Arc<meshlink_core::MeshEvent>>>> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => sink.lock().unwrap().push(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    collected
}

/// Poll until `predicate` holds over the collected events.
pub async fn wait_for_event(
    events: &Arc<Mutex<Vec<Arc<meshlink_core::MeshEvent>>>>,
    mut predicate: impl FnMut(&[Arc<meshlink_core::MeshEvent>]) -> bool,
    deadline: Duration,
) {
    let start = std::time::Instant::now();
    loop {
        {
            let events = events.lock().unwrap();
            if predicate(&events) {
                return;
            }
        }
        assert!(
            start.elapsed() < deadline,
            "expected event did not arrive in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
