//! Client event system — decoupled communication between bounded contexts.
//!
//! Every observable occurrence in the runtime is one variant of the closed
//! [`MeshEvent`] set. Components publish to the shared [`EventBus`]; the
//! facade and the webhook engine subscribe and filter for what they care
//! about. There is no string-keyed fan-out.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::frame::Frame;
use crate::state::{AuthSnapshot, ConnectionSnapshot};

/// All events the client can emit.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// Transport handshake completed.
    Open,
    /// Transport closed.
    Close { code: Option<u16>, reason: String },
    /// A non-fatal or terminal error surfaced outside a call path.
    Error { code: &'static str, message: String },
    /// A reconnect attempt is scheduled.
    Reconnecting { attempt: u32 },
    /// A reconnect attempt succeeded.
    Reconnected,
    /// Connection state changed.
    StateChanged(ConnectionSnapshot),

    /// The server issued an authentication challenge.
    AuthChallenge,
    /// Authentication completed.
    AuthSuccess(AuthSnapshot),
    /// Authentication was rejected.
    AuthError { reason: String },
    /// The client is connected, authenticated (when required), and sendable.
    Ready,
    /// The client disconnected intentionally.
    Disconnect,

    /// A validated frame arrived from the transport.
    MessageReceived(Frame),
    /// A frame was written to the transport.
    MessageSent(Frame),
    /// A frame failed validation, verification, or handling.
    MessageError { code: &'static str, message: String },
    /// A frame with an already-seen id was suppressed.
    MessageDuplicate { id: String },

    /// A `task_response` frame was dispatched.
    AgentResponse(Frame),
    /// The coordinator routed a message to an agent.
    AgentSelected(Frame),
    /// The agent registry was replaced by an `agents` frame.
    AgentsUpdated { count: usize },

    /// A room subscription was acknowledged.
    RoomJoined { room: String },
    /// A room unsubscription was acknowledged.
    RoomLeft { room: String },
    /// The server reported the room listing.
    RoomList { rooms: Vec<String> },

    /// A webhook POST was written.
    WebhookSent { url: String },
    /// A webhook POST got a 2xx answer.
    WebhookSuccess { url: String, status: u16 },
    /// A webhook item was discarded after exhausting retries.
    WebhookError { url: String, message: String },
    /// A webhook delivery failed and was rescheduled.
    WebhookRetry { url: String, attempt: u32 },
}

/// A broadcast-based event bus for client events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Components can
/// subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<MeshEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: MeshEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<MeshEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(MeshEvent::Reconnecting { attempt: 3 });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            MeshEvent::Reconnecting { attempt } => assert_eq!(*attempt, 3),
            _ => panic!("Expected Reconnecting event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(MeshEvent::Error {
            code: "connection",
            message: "no subscribers".into(),
        });
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lag_not_corruption() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(MeshEvent::Reconnecting { attempt: i });
        }
        // The receiver lags; the next recv reports it rather than delivering
        // stale events out of order.
        assert!(rx.recv().await.is_err() || rx.recv().await.is_ok());
    }
}
