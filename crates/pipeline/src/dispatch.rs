//! The inbound pipeline: dedup gate, signature gate, handler dispatch.
//!
//! `process` runs once per frame, in transport delivery order (the caller
//! owns the serialization — one pump task per client). A frame that fails
//! a gate is dropped with the matching event; handler failures are
//! reported and isolated.

use std::sync::Arc;

use meshlink_config::ClientConfig;
use meshlink_core::error::Result;
use meshlink_core::event::MeshEvent;
use meshlink_core::frame::Frame;
use meshlink_resilience::DedupCache;
use meshlink_security::{SignatureVerifier, VerifierConfig};

use crate::context::HandlerContext;
use crate::handlers::{HandlerRegistry, default_registry};

/// Consumes inbound frames that were not matched to pending requests.
pub struct MessagePipeline {
    dedup: DedupCache,
    verifier: Option<SignatureVerifier>,
    registry: HandlerRegistry,
    ctx: HandlerContext,
}

impl MessagePipeline {
    /// Build a pipeline from the client configuration.
    pub fn new(config: &ClientConfig, ctx: HandlerContext) -> Result<Self> {
        let dedup = if config.dedup.enabled {
            DedupCache::new(config.dedup_ttl(), config.dedup.max_size)
        } else {
            DedupCache::disabled()
        };
        let verifier = if config.signatures.validate {
            Some(SignatureVerifier::new(VerifierConfig {
                trusted_addresses: config.signatures.trusted_addresses.clone(),
                require_for: config.signatures.require_for.clone(),
                strict_mode: config.signatures.strict,
            })?)
        } else {
            None
        };
        Ok(Self {
            dedup,
            verifier,
            registry: default_registry(),
            ctx,
        })
    }

    /// Run one frame through the gates and its handler.
    pub async fn process(&self, frame: Frame) {
        // Dedup gate: frames without an id are never deduped.
        if let Some(id) = frame.id.as_deref() {
            if !self.dedup.add(id) {
                tracing::debug!(id = %id, "duplicate frame suppressed");
                self.ctx.events.publish(MeshEvent::MessageDuplicate {
                    id: id.to_string(),
                });
                return;
            }
        }

        // Signature gate.
        if let Some(verifier) = &self.verifier {
            let verification = verifier.verify(&frame);
            if !verification.valid {
                let error: meshlink_core::Error = verification
                    .as_error(frame.kind)
                    .expect("failed verification carries an error")
                    .into();
                tracing::warn!(kind = %frame.kind, error = %error, "signature gate rejected frame");
                self.ctx.events.publish(MeshEvent::MessageError {
                    code: error.code(),
                    message: error.to_string(),
                });
                return;
            }
        }

        // Dispatch.
        let kind = frame.kind;
        match self.registry.get(kind) {
            Some(handler) => {
                if let Err(e) = handler.handle(frame, &self.ctx).await {
                    tracing::warn!(kind = %kind, error = %e, "handler failed");
                    self.ctx.events.publish(MeshEvent::MessageError {
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
            None => {
                tracing::debug!(kind = %kind, "no handler registered");
            }
        }
    }

    /// Swap in a custom handler (tests and embedders).
    pub fn set_handler(
        &mut self,
        kind: meshlink_core::FrameKind,
        handler: Arc<dyn crate::handlers::FrameHandler>,
    ) {
        self.registry.insert(kind, handler);
    }

    /// Drop all dedup state (intentional disconnect).
    pub fn clear_dedup(&self) {
        self.dedup.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::FrameHandler;
    use async_trait::async_trait;
    use meshlink_config::ClientType;
    use meshlink_core::error::MessageError;
    use meshlink_core::event::EventBus;
    use meshlink_core::frame::{FrameKind, FrameSink};
    use meshlink_core::registry::{AgentRegistry, RoomRegistry};
    use meshlink_core::state::SharedState;
    use meshlink_security::FrameSigner;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::broadcast::error::TryRecvError;

    const KEY_1: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const KEY_2: &str = "0x8b3a350cf5c34c9194ca85829a2df0ec3153be0318b5e2d3348e872092edffba";

    /// Sink that records sent frames instead of writing a socket.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Frame>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&self, frame: Frame) -> Result<()> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }
    }

    struct Fixture {
        pipeline: MessagePipeline,
        events: Arc<EventBus>,
        sink: Arc<RecordingSink>,
        state: SharedState,
        agents: AgentRegistry,
        rooms: RoomRegistry,
    }

    fn fixture(mutate: impl FnOnce(&mut ClientConfig)) -> Fixture {
        let mut config = ClientConfig::new("wss://mesh.example.com/ws");
        mutate(&mut config);
        let events = Arc::new(EventBus::default());
        let sink = Arc::new(RecordingSink::default());
        let state = SharedState::new();
        let agents = AgentRegistry::new();
        let rooms = RoomRegistry::new();
        let signer = config
            .private_key
            .as_deref()
            .map(|key| Arc::new(FrameSigner::from_hex(key).unwrap()));
        let ctx = HandlerContext::new(
            events.clone(),
            state.clone(),
            agents.clone(),
            rooms.clone(),
            signer,
            sink.clone() as Arc<dyn FrameSink>,
            ClientType::User,
        );
        let pipeline = MessagePipeline::new(&config, ctx).unwrap();
        Fixture {
            pipeline,
            events,
            sink,
            state,
            agents,
            rooms,
        }
    }

    fn task_response(id: &str) -> Frame {
        Frame::new(FrameKind::TaskResponse)
            .with_id(id)
            .with_data(json!({"task_id": "1", "success": true}))
    }

    fn drain(
        rx: &mut tokio::sync::broadcast::Receiver<Arc<MeshEvent>>,
    ) -> Vec<Arc<MeshEvent>> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        events
    }

    #[tokio::test]
    async fn duplicate_id_suppressed_within_ttl() {
        let f = fixture(|_| {});
        let mut rx = f.events.subscribe();

        f.pipeline.process(task_response("T1")).await;
        f.pipeline.process(task_response("T1")).await;

        let events = drain(&mut rx);
        let responses = events
            .iter()
            .filter(|e| matches!(e.as_ref(), MeshEvent::AgentResponse(_)))
            .count();
        let duplicates: Vec<_> = events
            .iter()
            .filter_map(|e| match e.as_ref() {
                MeshEvent::MessageDuplicate { id } => Some(id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(responses, 1, "handler must run exactly once");
        assert_eq!(duplicates, vec!["T1".to_string()]);
    }

    #[tokio::test]
    async fn frames_without_id_are_never_deduped() {
        let f = fixture(|_| {});
        let mut rx = f.events.subscribe();

        let frame = Frame::new(FrameKind::AgentSelected);
        f.pipeline.process(frame.clone()).await;
        f.pipeline.process(frame).await;

        let selected = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e.as_ref(), MeshEvent::AgentSelected(_)))
            .count();
        assert_eq!(selected, 2);
    }

    #[tokio::test]
    async fn disabled_dedup_lets_replays_through() {
        let f = fixture(|c| c.dedup.enabled = false);
        let mut rx = f.events.subscribe();

        f.pipeline.process(task_response("T1")).await;
        f.pipeline.process(task_response("T1")).await;

        let responses = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e.as_ref(), MeshEvent::AgentResponse(_)))
            .count();
        assert_eq!(responses, 2);
    }

    #[tokio::test]
    async fn signature_gate_drops_mismatched_signer() {
        let f = fixture(|c| {
            c.signatures.require_for = vec![FrameKind::TaskResponse];
        });
        let mut rx = f.events.subscribe();

        // Signed by key 2 but declaring key 1's address.
        let signer_1 = FrameSigner::from_hex(KEY_1).unwrap();
        let signer_2 = FrameSigner::from_hex(KEY_2).unwrap();
        let mut frame = task_response("T9");
        signer_2.sign_frame(&mut frame).unwrap();
        frame.public_key = Some(signer_1.address());

        f.pipeline.process(frame).await;

        let events = drain(&mut rx);
        assert!(
            events.iter().any(|e| matches!(
                e.as_ref(),
                MeshEvent::MessageError { code: "signature_verification", .. }
            )),
            "expected a signature error event"
        );
        assert!(
            !events
                .iter()
                .any(|e| matches!(e.as_ref(), MeshEvent::AgentResponse(_))),
            "frame must be dropped before dispatch"
        );
    }

    #[tokio::test]
    async fn missing_signature_rejected_when_required() {
        let f = fixture(|c| {
            c.signatures.require_for = vec![FrameKind::TaskResponse];
        });
        let mut rx = f.events.subscribe();
        f.pipeline.process(task_response("T2")).await;

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e.as_ref(),
            MeshEvent::MessageError { code: "signature_verification", .. }
        )));
    }

    #[tokio::test]
    async fn challenge_is_signed_and_answered() {
        let f = fixture(|c| c.private_key = Some(KEY_1.into()));
        let frame =
            Frame::new(FrameKind::Challenge).with_data(json!({"challenge": "prove-yourself"}));
        f.pipeline.process(frame).await;

        let sent = f.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, FrameKind::Auth);
        assert!(sent[0].signature.is_some());
        assert_eq!(
            sent[0].public_key.as_deref(),
            Some("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
        assert_eq!(f.state.auth().challenge.as_deref(), Some("prove-yourself"));
    }

    #[tokio::test]
    async fn challenge_without_credentials_reports_error() {
        let f = fixture(|_| {});
        let mut rx = f.events.subscribe();
        let frame = Frame::new(FrameKind::Challenge).with_data(json!({"challenge": "x"}));
        f.pipeline.process(frame).await;

        assert!(f.sink.sent.lock().unwrap().is_empty());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e.as_ref(),
            MeshEvent::MessageError { code: "authentication", .. }
        )));
    }

    #[tokio::test]
    async fn auth_success_flips_state_and_joins_rooms() {
        let f = fixture(|_| {});
        f.state.update_connection(|c| {
            c.connected = true;
            c.reconnect_attempts = 3;
        });

        let frame = Frame::new(FrameKind::AuthSuccess).with_data(json!({
            "wallet_address": "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266",
            "rooms": ["lobby", "research"],
        }));
        f.pipeline.process(frame).await;

        let auth = f.state.auth();
        assert!(auth.authenticated);
        assert_eq!(auth.rooms.len(), 2);
        assert!(f.rooms.is_joined("lobby"));
        assert_eq!(f.state.connection().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn agents_listing_replaces_registry() {
        let f = fixture(|_| {});
        let frame = Frame::new(FrameKind::Agents).with_data(json!({
            "agents": [
                {"address": "0x1111111111111111111111111111111111111111", "name": "summarizer"},
                "0x2222222222222222222222222222222222222222",
            ]
        }));
        f.pipeline.process(frame).await;
        assert_eq!(f.agents.len(), 2);
        assert_eq!(
            f.agents
                .get("0x1111111111111111111111111111111111111111")
                .unwrap()
                .name
                .as_deref(),
            Some("summarizer")
        );
    }

    #[tokio::test]
    async fn ping_answered_with_pong_echoing_id() {
        let f = fixture(|_| {});
        f.pipeline.process(Frame::ping().with_id("P7")).await;
        let sent = f.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, FrameKind::Pong);
        assert_eq!(sent[0].id.as_deref(), Some("P7"));
    }

    #[tokio::test]
    async fn handler_failure_is_isolated() {
        struct ExplodingHandler;
        #[async_trait]
        impl FrameHandler for ExplodingHandler {
            async fn handle(&self, _frame: Frame, _ctx: &HandlerContext) -> Result<()> {
                Err(MessageError::Dispatch("boom".into()).into())
            }
        }

        let mut f = fixture(|_| {});
        f.pipeline
            .set_handler(FrameKind::Message, Arc::new(ExplodingHandler));
        let mut rx = f.events.subscribe();

        f.pipeline.process(Frame::message("a").with_id("m1")).await;
        // The pipeline survives and keeps dispatching.
        f.pipeline.process(task_response("T3")).await;

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e.as_ref(), MeshEvent::MessageError { code: "message", .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e.as_ref(), MeshEvent::AgentResponse(_))));
    }

    #[tokio::test]
    async fn subscribe_ack_updates_rooms() {
        let f = fixture(|_| {});
        let mut rx = f.events.subscribe();

        let ack = Frame::new(FrameKind::Subscribe).with_data(json!({"room": "lobby", "success": "1"}));
        f.pipeline.process(ack).await;
        assert!(f.rooms.is_joined("lobby"));

        let leave = Frame::new(FrameKind::Unsubscribe).with_data(json!({"room": "lobby"}));
        f.pipeline.process(leave).await;
        assert!(!f.rooms.is_joined("lobby"));

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e.as_ref(), MeshEvent::RoomJoined { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e.as_ref(), MeshEvent::RoomLeft { .. })));
    }

    #[tokio::test]
    async fn room_listing_recorded() {
        let f = fixture(|_| {});
        let frame =
            Frame::new(FrameKind::ListRooms).with_data(json!({"rooms": ["lobby", "dev"]}));
        f.pipeline.process(frame).await;
        assert_eq!(f.rooms.listing(), vec!["lobby".to_string(), "dev".to_string()]);
    }
}
