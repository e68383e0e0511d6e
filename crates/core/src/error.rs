//! Error types for the meshlink domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Each bounded context
//! has its own error enum; every variant maps to a stable machine code via
//! [`Error::code`] so callers can branch without string matching.

use thiserror::Error;

/// The top-level error type for all meshlink operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Transport / connection ---
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    // --- Authentication handshake ---
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    // --- Schema / config / payload shape ---
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // --- Post-validation frame processing ---
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    // --- Webhook delivery ---
    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    // --- Signature verification ---
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    // --- Deadlines ---
    #[error("Timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    // --- Token bucket ---
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    // --- Circuit breaker fast-fail ---
    #[error("Circuit breaker is open, retry in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },

    // --- Usage faults ---
    #[error("Configuration error: {0}")]
    Config(String),

    // --- Bounded queue with reject policy ---
    #[error("Queue overflow: capacity {capacity} reached")]
    QueueOverflow { capacity: usize },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine code for this error, independent of the diagnostic.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Connection(_) => "connection",
            Error::Auth(_) => "authentication",
            Error::Validation(_) => "validation",
            Error::Message(_) => "message",
            Error::Webhook(_) => "webhook",
            Error::Signature(_) => "signature_verification",
            Error::Timeout { .. } => "timeout",
            Error::RateLimit(_) => "rate_limit",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::Config(_) => "configuration",
            Error::QueueOverflow { .. } => "queue_overflow",
            Error::Serialization(_) => "validation",
        }
    }

    /// Whether a retry of the same operation can reasonably succeed.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::Timeout { .. }
                | Error::Webhook(_)
                | Error::RateLimit(_)
                | Error::CircuitOpen { .. }
        )
    }

    /// Shorthand for a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,

    #[error("invalid transport URL: {0}")]
    InvalidUrl(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("transport write failed: {0}")]
    WriteFailed(String),

    #[error("transport closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("max reconnect attempts reached ({attempts})")]
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("no signing credentials configured")]
    NoCredentials,

    #[error("authentication rejected: {0}")]
    Rejected(String),

    #[error("authentication timed out after {0}ms")]
    TimedOut(u64),

    #[error("wallet address mismatch: key derives {derived}, config says {configured}")]
    AddressMismatch { derived: String, configured: String },
}

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("unknown frame kind: {0}")]
    UnknownKind(String),

    #[error("frame kind {kind} requires {path}")]
    MissingField { kind: String, path: String },

    #[error("invalid field {path}: {reason}")]
    InvalidField { path: String, reason: String },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

#[derive(Debug, Clone, Error)]
pub enum MessageError {
    #[error("handler for {kind} failed: {reason}")]
    HandlerFailed { kind: String, reason: String },

    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

#[derive(Debug, Clone, Error)]
pub enum WebhookError {
    #[error("no webhook configured")]
    NotConfigured,

    #[error("invalid webhook URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("webhook POST to {url} returned status {status}")]
    Http { url: String, status: u16 },

    #[error("webhook network error for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("webhook POST to {url} timed out after {elapsed_ms}ms")]
    TimedOut { url: String, elapsed_ms: u64 },

    #[error("unknown webhook event kind: {0}")]
    UnknownEvent(String),
}

#[derive(Debug, Clone, Error)]
pub enum SignatureError {
    #[error("signature missing on {kind} frame that requires one")]
    Missing { kind: String },

    #[error("signature is not valid hex/recoverable: {0}")]
    Malformed(String),

    #[error("no address available for verification")]
    NoAddress,

    #[error("signature does not match declared address {declared} (recovered {recovered})")]
    Mismatch { declared: String, recovered: String },

    #[error("recovered signer {recovered} not in trusted whitelist")]
    Untrusted { recovered: String },

    #[error("signing failed: {0}")]
    SigningFailed(String),
}
