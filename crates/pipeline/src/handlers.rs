//! The default handler set, one per inbound frame kind.
//!
//! Handlers are small: decode the typed payload, update the owning state,
//! emit the matching event, and reply through the sink when the protocol
//! asks for it. Anything a handler returns as `Err` is reported as a
//! `message:error` event by the dispatcher and never kills the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use meshlink_core::error::{AuthError, Result};
use meshlink_core::event::MeshEvent;
use meshlink_core::frame::{
    AgentsData, AuthSuccessData, ChallengeData, Frame, FrameKind, RoomAck, RoomListData,
    TaskResponseData,
};

use crate::context::HandlerContext;

/// One inbound frame kind's behavior.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()>;
}

/// Static kind → handler table.
pub struct HandlerRegistry {
    handlers: HashMap<FrameKind, Arc<dyn FrameHandler>>,
}

impl HandlerRegistry {
    pub fn get(&self, kind: FrameKind) -> Option<Arc<dyn FrameHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Replace or add a handler (tests and embedders).
    pub fn insert(&mut self, kind: FrameKind, handler: Arc<dyn FrameHandler>) {
        self.handlers.insert(kind, handler);
    }
}

/// The registry every pipeline starts from.
pub fn default_registry() -> HandlerRegistry {
    let mut handlers: HashMap<FrameKind, Arc<dyn FrameHandler>> = HashMap::new();
    handlers.insert(FrameKind::Challenge, Arc::new(ChallengeHandler));
    handlers.insert(FrameKind::AuthRequired, Arc::new(AuthRequiredHandler));
    handlers.insert(FrameKind::AuthSuccess, Arc::new(AuthSuccessHandler));
    handlers.insert(FrameKind::AuthError, Arc::new(AuthErrorHandler));
    handlers.insert(
        FrameKind::RegistrationSuccess,
        Arc::new(RegistrationSuccessHandler),
    );
    handlers.insert(FrameKind::Agents, Arc::new(AgentsHandler));
    handlers.insert(FrameKind::AgentSelected, Arc::new(AgentSelectedHandler));
    handlers.insert(FrameKind::Message, Arc::new(MessageHandler));
    handlers.insert(FrameKind::Task, Arc::new(TaskHandler));
    handlers.insert(FrameKind::TaskResponse, Arc::new(TaskResponseHandler));
    handlers.insert(FrameKind::Error, Arc::new(ErrorFrameHandler));
    handlers.insert(FrameKind::Ping, Arc::new(PingHandler));
    handlers.insert(FrameKind::Pong, Arc::new(PongHandler));
    handlers.insert(FrameKind::Capabilities, Arc::new(CapabilitiesHandler));
    handlers.insert(FrameKind::Subscribe, Arc::new(SubscribeAckHandler));
    handlers.insert(FrameKind::Unsubscribe, Arc::new(UnsubscribeAckHandler));
    handlers.insert(FrameKind::ListRooms, Arc::new(RoomListHandler));
    HandlerRegistry { handlers }
}

// --- Authentication ---

/// Signs the server's challenge and replies with an `auth` frame.
struct ChallengeHandler;

#[async_trait]
impl FrameHandler for ChallengeHandler {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()> {
        let data = ChallengeData::from_frame(&frame)?;
        ctx.state
            .update_auth(|auth| auth.challenge = Some(data.challenge.clone()));
        ctx.events.publish(MeshEvent::AuthChallenge);

        let signer = ctx
            .signer
            .as_ref()
            .ok_or(AuthError::NoCredentials)?;
        let signature = signer.sign_message(data.challenge.as_bytes())?;

        let mut reply = Frame::new(FrameKind::Auth);
        reply.signature = Some(signature);
        reply.public_key = Some(signer.address());
        reply.data = Some(serde_json::json!({ "challenge": data.challenge }));
        ctx.sink.send_frame(reply).await
    }
}

/// The server wants authentication; ask for a challenge.
struct AuthRequiredHandler;

#[async_trait]
impl FrameHandler for AuthRequiredHandler {
    async fn handle(&self, _frame: Frame, ctx: &HandlerContext) -> Result<()> {
        if ctx.signer.is_none() {
            return Err(AuthError::NoCredentials.into());
        }
        ctx.sink
            .send_frame(Frame::new(FrameKind::RequestChallenge))
            .await
    }
}

/// Flips the auth state and records granted rooms.
struct AuthSuccessHandler;

#[async_trait]
impl FrameHandler for AuthSuccessHandler {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()> {
        let data = AuthSuccessData::from_frame(&frame);
        ctx.state.update_auth(|auth| {
            auth.authenticated = true;
            auth.challenge = None;
            if let Some(wallet) = &data.wallet_address {
                auth.wallet_address = Some(wallet.clone());
            }
            auth.rooms = data.rooms.clone();
        });
        // A successful handshake ends any reconnect accounting.
        ctx.state.update_connection(|c| c.reconnect_attempts = 0);
        for room in &data.rooms {
            ctx.rooms.join(room.clone());
        }
        tracing::info!(
            wallet = data.wallet_address.as_deref().unwrap_or("<none>"),
            rooms = data.rooms.len(),
            "authenticated"
        );
        ctx.events.publish(MeshEvent::AuthSuccess(ctx.state.auth()));
        Ok(())
    }
}

/// Records the rejection so a waiting `connect()` can surface it.
struct AuthErrorHandler;

#[async_trait]
impl FrameHandler for AuthErrorHandler {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()> {
        let reason = frame
            .data_str("message")
            .or(frame.data_str("reason"))
            .or(frame.content.as_deref())
            .unwrap_or("authentication rejected")
            .to_string();
        ctx.state.update_auth(|auth| {
            auth.authenticated = false;
            auth.challenge = None;
        });
        // Ends the engine's bounded auth wait.
        ctx.state
            .update_connection(|c| c.last_error = Some(reason.clone()));
        tracing::warn!(reason = %reason, "authentication failed");
        ctx.events.publish(MeshEvent::AuthError { reason });
        Ok(())
    }
}

struct RegistrationSuccessHandler;

#[async_trait]
impl FrameHandler for RegistrationSuccessHandler {
    async fn handle(&self, _frame: Frame, _ctx: &HandlerContext) -> Result<()> {
        tracing::info!("agent registration acknowledged");
        Ok(())
    }
}

// --- Network directory ---

/// Replaces the agent registry with the server's listing.
struct AgentsHandler;

#[async_trait]
impl FrameHandler for AgentsHandler {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()> {
        let data = AgentsData::from_frame(&frame)?;
        let count = data.agents.len();
        ctx.agents.replace(data.agents);
        ctx.events.publish(MeshEvent::AgentsUpdated { count });
        Ok(())
    }
}

struct AgentSelectedHandler;

#[async_trait]
impl FrameHandler for AgentSelectedHandler {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()> {
        tracing::debug!(agent = frame.from.as_deref().unwrap_or("<unknown>"), "agent selected");
        ctx.events.publish(MeshEvent::AgentSelected(frame));
        Ok(())
    }
}

// --- Conversation ---

struct MessageHandler;

#[async_trait]
impl FrameHandler for MessageHandler {
    async fn handle(&self, frame: Frame, _ctx: &HandlerContext) -> Result<()> {
        tracing::debug!(
            from = frame.from.as_deref().unwrap_or("<unknown>"),
            room = frame.room.as_deref().unwrap_or("<direct>"),
            "message received"
        );
        Ok(())
    }
}

struct TaskHandler;

#[async_trait]
impl FrameHandler for TaskHandler {
    async fn handle(&self, frame: Frame, _ctx: &HandlerContext) -> Result<()> {
        tracing::debug!(task_id = frame.task_id.as_deref().unwrap_or("<none>"), "task received");
        Ok(())
    }
}

/// Validates the response payload and announces it.
struct TaskResponseHandler;

#[async_trait]
impl FrameHandler for TaskResponseHandler {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()> {
        let data = TaskResponseData::from_frame(&frame)?;
        tracing::debug!(task_id = %data.task_id, success = data.success, "task response");
        ctx.events.publish(MeshEvent::AgentResponse(frame));
        Ok(())
    }
}

/// Server-side error frames become error events.
struct ErrorFrameHandler;

#[async_trait]
impl FrameHandler for ErrorFrameHandler {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()> {
        let message = frame
            .data_str("message")
            .or(frame.content.as_deref())
            .unwrap_or("unspecified server error")
            .to_string();
        tracing::warn!(message = %message, "server error frame");
        ctx.events.publish(MeshEvent::Error {
            code: "server",
            message,
        });
        Ok(())
    }
}

// --- Keepalive ---

/// Replies `pong`, echoing the ping's correlation id.
struct PingHandler;

#[async_trait]
impl FrameHandler for PingHandler {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()> {
        let mut pong = Frame::new(FrameKind::Pong);
        pong.id = frame.id;
        ctx.sink.send_frame(pong).await
    }
}

struct PongHandler;

#[async_trait]
impl FrameHandler for PongHandler {
    async fn handle(&self, _frame: Frame, _ctx: &HandlerContext) -> Result<()> {
        tracing::trace!("pong received");
        Ok(())
    }
}

struct CapabilitiesHandler;

#[async_trait]
impl FrameHandler for CapabilitiesHandler {
    async fn handle(&self, frame: Frame, _ctx: &HandlerContext) -> Result<()> {
        tracing::debug!(data = ?frame.data, "server capabilities");
        Ok(())
    }
}

// --- Rooms ---
//
// Outbound subscribe/unsubscribe requests share their tag with the
// server's acknowledgements, so the inbound side of the tag is always an
// ack here.

struct SubscribeAckHandler;

#[async_trait]
impl FrameHandler for SubscribeAckHandler {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()> {
        let ack = RoomAck::from_frame(&frame)?;
        if ack.success {
            ctx.rooms.join(ack.room.clone());
            tracing::debug!(room = %ack.room, "subscribed");
            ctx.events.publish(MeshEvent::RoomJoined { room: ack.room });
        } else {
            tracing::warn!(room = %ack.room, "subscribe rejected");
            ctx.events.publish(MeshEvent::MessageError {
                code: "message",
                message: format!("subscribe to {} rejected", ack.room),
            });
        }
        Ok(())
    }
}

struct UnsubscribeAckHandler;

#[async_trait]
impl FrameHandler for UnsubscribeAckHandler {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()> {
        let ack = RoomAck::from_frame(&frame)?;
        if ack.success {
            ctx.rooms.leave(&ack.room);
            tracing::debug!(room = %ack.room, "unsubscribed");
            ctx.events.publish(MeshEvent::RoomLeft { room: ack.room });
        }
        Ok(())
    }
}

/// Stores and announces the server's room listing.
struct RoomListHandler;

#[async_trait]
impl FrameHandler for RoomListHandler {
    async fn handle(&self, frame: Frame, ctx: &HandlerContext) -> Result<()> {
        let data = RoomListData::from_frame(&frame);
        ctx.rooms.set_listing(data.rooms.clone());
        ctx.events.publish(MeshEvent::RoomList { rooms: data.rooms });
        Ok(())
    }
}
