//! # meshlink Webhook
//!
//! Side-channel fan-out of client events to an HTTP endpoint: a bounded
//! in-memory queue, a configurable retry policy, a circuit breaker, SSRF
//! validation of the target, and a single-runner POST loop.

pub mod engine;
pub mod payload;

pub use engine::WebhookEngine;
pub use payload::{WebhookEventKind, WebhookItem, WebhookPayload};
