//! Wire frame model.
//!
//! A frame is one JSON text message on the transport. Every frame carries a
//! `kind` tag from a closed set; all other fields are optional and are
//! dropped from the serialized form when absent. Handlers are dispatched by
//! `FrameKind`, never by raw string comparison.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::wire::coerce_bool;

/// The closed set of wire frame tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    RequestChallenge,
    Challenge,
    CheckCachedAuth,
    Auth,
    AuthRequired,
    AuthSuccess,
    AuthError,
    Register,
    RegistrationSuccess,
    Message,
    Task,
    TaskResponse,
    AgentSelected,
    Agents,
    Error,
    Ping,
    Pong,
    Capabilities,
    Subscribe,
    Unsubscribe,
    ListRooms,
}

impl FrameKind {
    /// The wire tag for this kind (snake_case, as serialized).
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::RequestChallenge => "request_challenge",
            FrameKind::Challenge => "challenge",
            FrameKind::CheckCachedAuth => "check_cached_auth",
            FrameKind::Auth => "auth",
            FrameKind::AuthRequired => "auth_required",
            FrameKind::AuthSuccess => "auth_success",
            FrameKind::AuthError => "auth_error",
            FrameKind::Register => "register",
            FrameKind::RegistrationSuccess => "registration_success",
            FrameKind::Message => "message",
            FrameKind::Task => "task",
            FrameKind::TaskResponse => "task_response",
            FrameKind::AgentSelected => "agent_selected",
            FrameKind::Agents => "agents",
            FrameKind::Error => "error",
            FrameKind::Ping => "ping",
            FrameKind::Pong => "pong",
            FrameKind::Capabilities => "capabilities",
            FrameKind::Subscribe => "subscribe",
            FrameKind::Unsubscribe => "unsubscribe",
            FrameKind::ListRooms => "list_rooms",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the transport.
///
/// `timestamp` is kept as a raw RFC 3339 string: signed frames must
/// re-serialize byte-identically for signature verification, so no field is
/// normalized on the way through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Discriminant; drives validation and handler dispatch.
    pub kind: FrameKind,

    /// Opaque correlation token (request/response pairing, dedup key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Free-form payload text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// MIME-like tag for `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,

    /// RFC 3339 timestamp; stamped by the send path when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Kind-specific record; see the typed decoders below.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Hex-encoded 65-byte recoverable signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Declared signer address (0x-prefixed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Frame {
    /// Create a bare frame of the given kind with all optionals empty.
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            id: None,
            content: None,
            content_type: None,
            from: None,
            to: None,
            room: None,
            timestamp: None,
            data: None,
            signature: None,
            public_key: None,
            reasoning: None,
            task_id: None,
        }
    }

    /// A chat message addressed to an agent or a room.
    pub fn message(content: impl Into<String>) -> Self {
        let mut frame = Self::new(FrameKind::Message);
        frame.content = Some(content.into());
        frame.content_type = Some("text/plain".into());
        frame
    }

    /// A task submission.
    pub fn task(content: impl Into<String>) -> Self {
        let mut frame = Self::new(FrameKind::Task);
        frame.content = Some(content.into());
        frame.content_type = Some("text/plain".into());
        frame
    }

    /// A room subscription request.
    pub fn subscribe(room: impl Into<String>) -> Self {
        let mut frame = Self::new(FrameKind::Subscribe);
        frame.room = Some(room.into());
        frame
    }

    /// A room unsubscription request.
    pub fn unsubscribe(room: impl Into<String>) -> Self {
        let mut frame = Self::new(FrameKind::Unsubscribe);
        frame.room = Some(room.into());
        frame
    }

    /// A keepalive ping.
    pub fn ping() -> Self {
        Self::new(FrameKind::Ping)
    }

    /// Set the correlation id, builder-style.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the destination, builder-style.
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Set the room, builder-style.
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Set the kind-specific data record, builder-style.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Generate a fresh correlation id (UUID v4, unique per process).
    pub fn fresh_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Stamp `timestamp` with the current instant if absent.
    pub fn stamp(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        }
    }

    /// Look up a field inside `data` by key.
    pub fn data_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }

    /// Fetch a string field inside `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data_field(key).and_then(|v| v.as_str())
    }
}

/// Outbound frame handoff, implemented by the connection engine.
///
/// Handlers reply through this seam (pong, signed auth) without depending
/// on the transport.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Queue or write one frame to the transport.
    async fn send_frame(&self, frame: Frame) -> Result<()>;
}

// --- Typed `data` payloads ---

/// Payload of an inbound `challenge` frame.
#[derive(Debug, Clone)]
pub struct ChallengeData {
    pub challenge: String,
}

impl ChallengeData {
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let challenge = frame
            .data_str("challenge")
            .ok_or_else(|| ValidationError::MissingField {
                kind: frame.kind.to_string(),
                path: "data.challenge".into(),
            })?;
        Ok(Self {
            challenge: challenge.to_string(),
        })
    }
}

/// Payload of an inbound `auth_success` frame.
#[derive(Debug, Clone, Default)]
pub struct AuthSuccessData {
    pub wallet_address: Option<String>,
    pub rooms: Vec<String>,
}

impl AuthSuccessData {
    pub fn from_frame(frame: &Frame) -> Self {
        let wallet_address = frame.data_str("wallet_address").map(str::to_string);
        let rooms = frame
            .data_field("rooms")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            wallet_address,
            rooms,
        }
    }
}

/// Payload of an inbound `task_response` frame.
#[derive(Debug, Clone)]
pub struct TaskResponseData {
    pub task_id: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskResponseData {
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let task_id = frame
            .data_str("task_id")
            .map(str::to_string)
            .or_else(|| frame.task_id.clone())
            .ok_or_else(|| ValidationError::MissingField {
                kind: frame.kind.to_string(),
                path: "data.task_id".into(),
            })?;
        let success = match frame.data_field("success") {
            Some(v) => coerce_bool(v).map_err(|reason| ValidationError::InvalidField {
                path: "data.success".into(),
                reason,
            })?,
            None => {
                return Err(ValidationError::MissingField {
                    kind: frame.kind.to_string(),
                    path: "data.success".into(),
                }
                .into());
            }
        };
        Ok(Self {
            task_id,
            success,
            result: frame.data_field("result").cloned(),
            error: frame.data_str("error").map(str::to_string),
        })
    }
}

/// One agent as reported by an inbound `agents` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInfo {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Payload of an inbound `agents` frame.
#[derive(Debug, Clone, Default)]
pub struct AgentsData {
    pub agents: Vec<AgentInfo>,
}

impl AgentsData {
    /// Entries may be plain address strings or full agent records.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let items = frame
            .data_field("agents")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ValidationError::MissingField {
                kind: frame.kind.to_string(),
                path: "data.agents".into(),
            })?;

        let mut agents = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match item {
                serde_json::Value::String(address) => agents.push(AgentInfo {
                    address: address.clone(),
                    name: None,
                    capabilities: Vec::new(),
                    status: None,
                }),
                serde_json::Value::Object(_) => {
                    let info: AgentInfo = serde_json::from_value(item.clone()).map_err(|e| {
                        ValidationError::InvalidField {
                            path: format!("data.agents[{i}]"),
                            reason: e.to_string(),
                        }
                    })?;
                    agents.push(info);
                }
                other => {
                    return Err(ValidationError::InvalidField {
                        path: format!("data.agents[{i}]"),
                        reason: format!("expected string or object, got {other}"),
                    }
                    .into());
                }
            }
        }
        Ok(Self { agents })
    }
}

/// Payload of an inbound `list_rooms` reply.
#[derive(Debug, Clone, Default)]
pub struct RoomListData {
    pub rooms: Vec<String>,
}

impl RoomListData {
    pub fn from_frame(frame: &Frame) -> Self {
        let rooms = frame
            .data_field("rooms")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Self { rooms }
    }
}

/// Payload of an inbound subscribe/unsubscribe acknowledgement.
#[derive(Debug, Clone)]
pub struct RoomAck {
    pub room: String,
    pub success: bool,
}

impl RoomAck {
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let room = frame
            .data_str("room")
            .or(frame.room.as_deref())
            .ok_or_else(|| ValidationError::MissingField {
                kind: frame.kind.to_string(),
                path: "data.room".into(),
            })?
            .to_string();
        let success = match frame.data_field("success") {
            Some(v) => coerce_bool(v).map_err(|reason| ValidationError::InvalidField {
                path: "data.success".into(),
                reason,
            })?,
            // No explicit verdict means the server accepted the operation.
            None => true,
        };
        Ok(Self { room, success })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_roundtrips_snake_case() {
        let json = serde_json::to_string(&FrameKind::TaskResponse).unwrap();
        assert_eq!(json, "\"task_response\"");
        let kind: FrameKind = serde_json::from_str("\"auth_success\"").unwrap();
        assert_eq!(kind, FrameKind::AuthSuccess);
    }

    #[test]
    fn unknown_kind_rejected() {
        let result = serde_json::from_str::<FrameKind>("\"totally_new\"");
        assert!(result.is_err());
    }

    #[test]
    fn absent_fields_dropped_from_wire() {
        let frame = Frame::message("hi").with_to("0xabc");
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"kind\":\"message\""));
        assert!(!json.contains("signature"));
        assert!(!json.contains("room"));
    }

    #[test]
    fn stamp_is_idempotent() {
        let mut frame = Frame::ping();
        frame.stamp();
        let first = frame.timestamp.clone();
        frame.stamp();
        assert_eq!(frame.timestamp, first);
        assert!(first.unwrap().ends_with('Z'));
    }

    #[test]
    fn fresh_ids_are_unique() {
        let a = Frame::fresh_id();
        let b = Frame::fresh_id();
        assert_ne!(a, b);
    }

    #[test]
    fn challenge_data_requires_challenge() {
        let frame = Frame::new(FrameKind::Challenge).with_data(json!({"challenge": "abc123"}));
        assert_eq!(ChallengeData::from_frame(&frame).unwrap().challenge, "abc123");

        let empty = Frame::new(FrameKind::Challenge);
        assert!(ChallengeData::from_frame(&empty).is_err());
    }

    #[test]
    fn task_response_data_coerces_stringified_bool() {
        let frame = Frame::new(FrameKind::TaskResponse)
            .with_data(json!({"task_id": "t1", "success": "Yes"}));
        let data = TaskResponseData::from_frame(&frame).unwrap();
        assert_eq!(data.task_id, "t1");
        assert!(data.success);

        let bad = Frame::new(FrameKind::TaskResponse)
            .with_data(json!({"task_id": "t1", "success": "maybe"}));
        assert!(TaskResponseData::from_frame(&bad).is_err());
    }

    #[test]
    fn agents_data_accepts_strings_and_objects() {
        let frame = Frame::new(FrameKind::Agents).with_data(json!({
            "agents": [
                "0x1111111111111111111111111111111111111111",
                {"address": "0x2222222222222222222222222222222222222222", "name": "translator",
                 "capabilities": ["translate"]},
            ]
        }));
        let data = AgentsData::from_frame(&frame).unwrap();
        assert_eq!(data.agents.len(), 2);
        assert_eq!(data.agents[1].name.as_deref(), Some("translator"));
        assert_eq!(data.agents[1].capabilities, vec!["translate".to_string()]);
    }

    #[test]
    fn room_ack_defaults_to_success() {
        let frame = Frame::new(FrameKind::Subscribe).with_data(json!({"room": "lobby"}));
        let ack = RoomAck::from_frame(&frame).unwrap();
        assert_eq!(ack.room, "lobby");
        assert!(ack.success);
    }
}
