//! WebSocket transport actor.
//!
//! One background task owns the socket. Writers talk to it through a
//! command channel (which also serializes wire order); everything the
//! socket produces is forwarded to the engine as [`TransportEvent`]s. When
//! the socket dies the actor emits one `Closed` event and exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use meshlink_core::error::{ConnectionError, Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Command sent from the engine to the transport task.
enum TransportCommand {
    /// Write one text frame; `done` resolves when the write finished.
    Send {
        text: String,
        done: oneshot::Sender<Result<()>>,
    },
    /// Close the socket with the given code and exit quietly (no `Closed`
    /// event; the caller already knows).
    Close { code: u16 },
}

/// What the socket produced.
#[derive(Debug)]
pub enum TransportEvent {
    /// One inbound text frame, unparsed.
    Frame(String),
    /// The socket is gone (peer close, error, or EOF).
    Closed { code: Option<u16>, reason: String },
}

/// Cloneable handle for talking to the transport task.
#[derive(Clone)]
pub struct TransportHandle {
    command_tx: mpsc::Sender<TransportCommand>,
    connected: Arc<AtomicBool>,
}

impl TransportHandle {
    /// Whether the socket was open at last observation.
    pub fn is_open(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Write one text frame and wait for the write to complete.
    pub async fn send_text(&self, text: String) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.command_tx
            .send(TransportCommand::Send { text, done })
            .await
            .map_err(|_| Error::from(ConnectionError::NotConnected))?;
        result
            .await
            .unwrap_or_else(|_| Err(ConnectionError::NotConnected.into()))
    }

    /// Close the socket. Idempotent; an already-dead task is fine.
    pub async fn close(&self, code: u16) {
        let _ = self.command_tx.send(TransportCommand::Close { code }).await;
    }
}

/// Open a WebSocket with a handshake deadline and spawn its actor task.
///
/// Events flow into `event_tx` until the socket dies or the handle (and
/// all its clones) is dropped.
pub async fn open(
    url: &str,
    timeout: Duration,
    event_tx: mpsc::Sender<TransportEvent>,
) -> Result<TransportHandle> {
    let (stream, _response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| Error::timeout("websocket handshake", timeout))?
        .map_err(|e| Error::from(ConnectionError::HandshakeFailed(e.to_string())))?;

    let connected = Arc::new(AtomicBool::new(true));
    let (command_tx, command_rx) = mpsc::channel(64);
    let handle = TransportHandle {
        command_tx,
        connected: Arc::clone(&connected),
    };

    tokio::spawn(run(stream, command_rx, event_tx, connected));
    Ok(handle)
}

async fn run(
    mut stream: WsStream,
    mut command_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
) {
    let close_event = loop {
        tokio::select! {
            ws_msg = stream.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        if event_tx
                            .send(TransportEvent::Frame(text.to_string()))
                            .await
                            .is_err()
                        {
                            // Engine is gone; nothing left to serve.
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                            None => (None, String::new()),
                        };
                        break Some(TransportEvent::Closed { code, reason });
                    }
                    // Binary, Ping, Pong, Frame — control traffic, ignore.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break Some(TransportEvent::Closed {
                            code: None,
                            reason: e.to_string(),
                        });
                    }
                    None => {
                        break Some(TransportEvent::Closed {
                            code: None,
                            reason: "end of stream".into(),
                        });
                    }
                }
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Some(TransportCommand::Send { text, done }) => {
                        let result = stream
                            .send(Message::Text(text.into()))
                            .await
                            .map_err(|e| Error::from(ConnectionError::WriteFailed(e.to_string())));
                        let failed = result.is_err();
                        let _ = done.send(result);
                        if failed {
                            break Some(TransportEvent::Closed {
                                code: None,
                                reason: "write failed".into(),
                            });
                        }
                    }
                    Some(TransportCommand::Close { code }) => {
                        let _ = stream
                            .close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            }))
                            .await;
                        break None;
                    }
                    None => {
                        let _ = stream.close(None).await;
                        break None;
                    }
                }
            }
        }
    };

    connected.store(false, Ordering::Relaxed);
    if let Some(event) = close_event {
        tracing::debug!(?event, "transport closed");
        let _ = event_tx.send(event).await;
    }
}
