//! # meshlink Connection
//!
//! Transport lifecycle for the meshlink client: the WebSocket actor that
//! owns the socket, and the [`ConnectionEngine`] that layers connect /
//! authenticate / heartbeat / reconnect semantics, request correlation,
//! and the serialized outbound path on top of it.

pub mod engine;
pub mod transport;

pub use engine::{AUTH_TIMEOUT, CACHED_AUTH_WAIT, ConnectionEngine, PING_INTERVAL};
pub use transport::{TransportEvent, TransportHandle};
