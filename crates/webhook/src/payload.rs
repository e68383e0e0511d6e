//! Webhook payload shapes.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use meshlink_core::error::{Error, WebhookError};

/// The closed set of event kinds a webhook can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    Message,
    Task,
    TaskResponse,
    AgentSelected,
    Error,
    ConnectionState,
    AuthState,
}

impl WebhookEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventKind::Message => "message",
            WebhookEventKind::Task => "task",
            WebhookEventKind::TaskResponse => "task_response",
            WebhookEventKind::AgentSelected => "agent_selected",
            WebhookEventKind::Error => "error",
            WebhookEventKind::ConnectionState => "connection_state",
            WebhookEventKind::AuthState => "auth_state",
        }
    }

    /// Parse a config-supplied event name.
    pub fn parse(name: &str) -> Result<Self, Error> {
        serde_json::from_value(serde_json::Value::String(name.trim().to_string()))
            .map_err(|_| WebhookError::UnknownEvent(name.to_string()).into())
    }
}

impl std::fmt::Display for WebhookEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The POST body: `{event, timestamp, data, metadata?}`.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event: WebhookEventKind,
    /// RFC 3339, stamped at enqueue time.
    pub timestamp: String,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl WebhookPayload {
    pub fn new(
        event: WebhookEventKind,
        data: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
            metadata,
        }
    }
}

/// One queued delivery with its attempt bookkeeping.
#[derive(Debug, Clone)]
pub struct WebhookItem {
    pub payload: WebhookPayload,
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
    pub next_retry: Option<Instant>,
    pub last_error: Option<String>,
}

impl WebhookItem {
    pub fn new(payload: WebhookPayload) -> Self {
        Self {
            payload,
            attempts: 0,
            last_attempt: None,
            next_retry: None,
            last_error: None,
        }
    }

    /// Forget past failures so the item is retried from scratch.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
        self.next_retry = None;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_parses_snake_case() {
        assert_eq!(
            WebhookEventKind::parse("task_response").unwrap(),
            WebhookEventKind::TaskResponse
        );
        assert_eq!(
            WebhookEventKind::parse(" connection_state ").unwrap(),
            WebhookEventKind::ConnectionState
        );
        assert!(WebhookEventKind::parse("explosion").is_err());
    }

    #[test]
    fn payload_serializes_expected_shape() {
        let payload = WebhookPayload::new(
            WebhookEventKind::Message,
            json!({"content": "hi"}),
            Some(json!({"room": "lobby"})),
        );
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["event"], "message");
        assert_eq!(value["data"]["content"], "hi");
        assert_eq!(value["metadata"]["room"], "lobby");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn metadata_omitted_when_absent() {
        let payload = WebhookPayload::new(WebhookEventKind::Error, json!({}), None);
        let text = serde_json::to_string(&payload).unwrap();
        assert!(!text.contains("metadata"));
    }

    #[test]
    fn reset_clears_bookkeeping() {
        let mut item = WebhookItem::new(WebhookPayload::new(
            WebhookEventKind::Task,
            json!({}),
            None,
        ));
        item.attempts = 3;
        item.last_error = Some("boom".into());
        item.next_retry = Some(Instant::now());
        item.reset();
        assert_eq!(item.attempts, 0);
        assert!(item.last_error.is_none());
        assert!(item.next_retry.is_none());
    }
}
