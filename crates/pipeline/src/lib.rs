//! # meshlink Pipeline
//!
//! Inbound frame processing: a dedup gate, a signature gate, and typed
//! dispatch over the frame kind to the default handler set. The facade
//! feeds this from the connection engine, one frame at a time, in
//! transport delivery order.

pub mod context;
pub mod dispatch;
pub mod handlers;

pub use context::HandlerContext;
pub use dispatch::MessagePipeline;
pub use handlers::{FrameHandler, HandlerRegistry, default_registry};
