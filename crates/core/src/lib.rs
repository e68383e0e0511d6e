//! # meshlink Core
//!
//! Wire frames, events, errors, and shared state for the meshlink
//! agent-network client. This crate defines the domain model that all other
//! crates implement against: the frame tag set, the closed event set, the
//! error taxonomy, and the state cells the engines coordinate through.

pub mod error;
pub mod event;
pub mod frame;
pub mod registry;
pub mod state;
pub mod wire;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use event::{EventBus, MeshEvent};
pub use frame::{AgentInfo, Frame, FrameKind, FrameSink};
pub use registry::{AgentRegistry, RoomRegistry};
pub use state::{AuthSnapshot, ConnectionSnapshot, SharedState};
pub use wire::{decode_frame, encode_frame, validate_frame};
