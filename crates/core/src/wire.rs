//! Wire-level frame validation (inbound and outbound).
//!
//! Every byte buffer from the transport goes through [`decode_frame`];
//! every outbound frame goes through [`encode_frame`] before it is written.
//! Validation is per-kind: each tag declares its required fields, and
//! booleans tolerate the stringified forms some peers emit.

use serde_json::Value;

use crate::error::{Result, ValidationError};
use crate::frame::{Frame, FrameKind};

/// Coerce a JSON value into a boolean.
///
/// Accepts real booleans plus the tolerant stringified forms:
/// `"true" | "1" | "yes"` and `"false" | "0" | "no"` (case-insensitive,
/// trimmed). Anything else is rejected with a reason.
pub fn coerce_bool(value: &Value) -> std::result::Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(format!("not a recognized boolean: {other:?}")),
        },
        other => Err(format!("expected boolean, got {other}")),
    }
}

/// Parse a transport text message into a validated [`Frame`].
pub fn decode_frame(text: &str) -> Result<Frame> {
    // Probe the kind tag first so an unknown tag reports as such rather
    // than as a generic deserialization failure.
    let probe: Value =
        serde_json::from_str(text).map_err(|e| ValidationError::Json(e.to_string()))?;
    let kind = probe
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ValidationError::MissingField {
            kind: "<unknown>".into(),
            path: "kind".into(),
        })?;
    if serde_json::from_value::<FrameKind>(Value::String(kind.to_string())).is_err() {
        return Err(ValidationError::UnknownKind(kind.to_string()).into());
    }

    let frame: Frame =
        serde_json::from_str(text).map_err(|e| ValidationError::Json(e.to_string()))?;
    validate_frame(&frame)?;
    Ok(frame)
}

/// Validate a frame against its kind's required fields.
pub fn validate_frame(frame: &Frame) -> Result<()> {
    match frame.kind {
        FrameKind::Message | FrameKind::Task => {
            if frame.content.is_none() {
                return Err(missing(frame, "content"));
            }
        }
        FrameKind::Challenge => {
            if frame.data_str("challenge").is_none() {
                return Err(missing(frame, "data.challenge"));
            }
        }
        FrameKind::Auth => {
            if frame.signature.is_none() {
                return Err(missing(frame, "signature"));
            }
        }
        FrameKind::TaskResponse => {
            if frame.data_str("task_id").is_none() && frame.task_id.is_none() {
                return Err(missing(frame, "data.task_id"));
            }
            match frame.data_field("success") {
                Some(v) => {
                    coerce_bool(v).map_err(|reason| ValidationError::InvalidField {
                        path: "data.success".into(),
                        reason,
                    })?;
                }
                None => return Err(missing(frame, "data.success")),
            }
        }
        FrameKind::Agents => {
            match frame.data_field("agents") {
                Some(Value::Array(_)) => {}
                Some(other) => {
                    return Err(ValidationError::InvalidField {
                        path: "data.agents".into(),
                        reason: format!("expected array, got {other}"),
                    }
                    .into());
                }
                None => return Err(missing(frame, "data.agents")),
            }
        }
        FrameKind::Subscribe | FrameKind::Unsubscribe => {
            if frame.room.is_none() && frame.data_str("room").is_none() {
                return Err(missing(frame, "room"));
            }
        }
        FrameKind::Error => {
            if frame.content.is_none() && frame.data_str("message").is_none() {
                return Err(missing(frame, "data.message"));
            }
        }
        // Bare control frames: nothing beyond the tag is required.
        FrameKind::RequestChallenge
        | FrameKind::CheckCachedAuth
        | FrameKind::AuthRequired
        | FrameKind::AuthSuccess
        | FrameKind::AuthError
        | FrameKind::Register
        | FrameKind::RegistrationSuccess
        | FrameKind::AgentSelected
        | FrameKind::Ping
        | FrameKind::Pong
        | FrameKind::Capabilities
        | FrameKind::ListRooms => {}
    }

    if let Some(data) = &frame.data {
        if !data.is_object() {
            return Err(ValidationError::InvalidField {
                path: "data".into(),
                reason: format!("expected object, got {data}"),
            }
            .into());
        }
    }

    Ok(())
}

/// Validate and serialize an outbound frame, enforcing the size cap.
pub fn encode_frame(frame: &Frame, max_size: usize) -> Result<String> {
    validate_frame(frame)?;
    let text = serde_json::to_string(frame)?;
    if text.len() > max_size {
        return Err(ValidationError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        }
        .into());
    }
    Ok(text)
}

fn missing(frame: &Frame, path: &str) -> crate::error::Error {
    ValidationError::MissingField {
        kind: frame.kind.to_string(),
        path: path.into(),
    }
    .into()
}
