//! Everything a frame handler may touch.

use std::sync::Arc;

use meshlink_config::ClientType;
use meshlink_core::event::EventBus;
use meshlink_core::frame::FrameSink;
use meshlink_core::registry::{AgentRegistry, RoomRegistry};
use meshlink_core::state::SharedState;
use meshlink_security::FrameSigner;

/// Capabilities handed to every handler invocation.
///
/// Handlers mutate shared state and reply through the sink; they never
/// talk to the transport or the webhook engine directly.
#[derive(Clone)]
pub struct HandlerContext {
    pub events: Arc<EventBus>,
    pub state: SharedState,
    pub agents: AgentRegistry,
    pub rooms: RoomRegistry,
    pub signer: Option<Arc<FrameSigner>>,
    pub sink: Arc<dyn FrameSink>,
    pub client_type: ClientType,
}

impl HandlerContext {
    pub fn new(
        events: Arc<EventBus>,
        state: SharedState,
        agents: AgentRegistry,
        rooms: RoomRegistry,
        signer: Option<Arc<FrameSigner>>,
        sink: Arc<dyn FrameSink>,
        client_type: ClientType,
    ) -> Self {
        Self {
            events,
            state,
            agents,
            rooms,
            signer,
            sink,
            client_type,
        }
    }
}
