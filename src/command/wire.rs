//! JSON wire frames exchanged with agents
//!
//! Outbound commands are serialized from envelopes. Inbound frames carry no
//! type tag, so they are classified by shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{CommandEnvelope, CommandKind, CommandResult, Priority, Target};
use crate::{Error, Result};

/// Outbound command frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub command_id: String,
    pub command: String,
    pub priority: Priority,
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_group: Option<String>,
}

impl From<&CommandEnvelope> for OutboundCommand {
    fn from(envelope: &CommandEnvelope) -> Self {
        Self {
            command_id: envelope.id().to_string(),
            command: envelope.kind().as_str().to_string(),
            priority: envelope.priority(),
            details: envelope.payload().clone(),
            target_node: envelope.target().node().map(ToString::to_string),
            target_group: envelope.target().group().map(ToString::to_string),
        }
    }
}

impl TryFrom<OutboundCommand> for CommandEnvelope {
    type Error = Error;

    fn try_from(frame: OutboundCommand) -> Result<Self> {
        let kind: CommandKind = frame.command.parse()?;
        let target = Target::from_parts(frame.target_node, frame.target_group)?;
        Self::new(frame.command_id, kind, frame.priority, frame.details, target)
    }
}

/// A classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Agent received the command
    Ack {
        command_id: String,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Agent finished the command
    Completion {
        command_id: String,
        failed: bool,
        result: CommandResult,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Heartbeat or other control frame; only refreshes activity
    Heartbeat,
}

/// Loose shape used to classify inbound JSON
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    command_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "type")]
    frame_type: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: Option<String>,
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            tracing::debug!(timestamp = raw, error = %e, "ignoring unparseable frame timestamp");
            None
        }
    }
}

/// Classify an inbound text frame by shape
///
/// # Errors
///
/// Returns `Error::Serialization` for non-JSON input and `Error::Rejected` for
/// JSON that matches no known frame shape
pub fn classify_frame(text: &str) -> Result<InboundFrame> {
    let raw: RawFrame = serde_json::from_str(text)?;

    let Some(command_id) = raw.command_id.filter(|id| !id.is_empty()) else {
        // Control frames carry a type tag but no command ID
        return match raw.frame_type {
            Some(_) => Ok(InboundFrame::Heartbeat),
            None => Err(Error::Rejected("frame has no command_id or type".to_string())),
        };
    };

    let timestamp = parse_timestamp(raw.timestamp.as_deref());
    match raw.status.as_deref() {
        Some("received") => Ok(InboundFrame::Ack {
            command_id,
            timestamp,
        }),
        Some(status @ ("completed" | "failed")) => {
            let failed = status == "failed";
            Ok(InboundFrame::Completion {
                command_id,
                failed,
                result: CommandResult {
                    success: raw.success.unwrap_or(!failed),
                    message: raw.message.unwrap_or_default(),
                    details: raw.details,
                },
                timestamp,
            })
        }
        Some(other) => Err(Error::Rejected(format!(
            "unknown status '{other}' for command {command_id}"
        ))),
        None => Err(Error::Rejected(format!(
            "frame for command {command_id} has no status"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isolate_envelope() -> CommandEnvelope {
        CommandEnvelope::new(
            "cmd-1",
            CommandKind::IsolateHost,
            Priority::Critical,
            serde_json::json!({"reason": "beaconing"}),
            Target::Node("h1".into()),
        )
        .unwrap()
    }

    #[test]
    fn outbound_frame_shape() {
        let frame = OutboundCommand::from(&isolate_envelope());
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "command_id": "cmd-1",
                "command": "isolate-host",
                "priority": "critical",
                "details": {"reason": "beaconing"},
                "target_node": "h1",
            })
        );
        assert!(json.get("target_group").is_none());
    }

    #[test]
    fn outbound_frame_restores_envelope() {
        let envelope = isolate_envelope();
        let frame = OutboundCommand::from(&envelope);
        let restored = CommandEnvelope::try_from(frame).unwrap();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn classifies_ack() {
        let frame = classify_frame(
            r#"{"command_id":"cmd-1","status":"received","timestamp":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::Ack {
                command_id,
                timestamp,
            } => {
                assert_eq!(command_id, "cmd-1");
                assert!(timestamp.is_some());
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn classifies_completion() {
        let frame = classify_frame(
            r#"{"command_id":"cmd-1","status":"completed","success":true,"message":"isolated","details":{"rules":4},"timestamp":"2024-05-01T10:00:05Z"}"#,
        )
        .unwrap();
        let InboundFrame::Completion {
            command_id,
            failed,
            result,
            ..
        } = frame
        else {
            panic!("expected completion");
        };
        assert_eq!(command_id, "cmd-1");
        assert!(!failed);
        assert!(result.success);
        assert_eq!(result.message, "isolated");
        assert_eq!(result.details, Some(serde_json::json!({"rules": 4})));
    }

    #[test]
    fn classifies_failure_without_success_field() {
        let frame =
            classify_frame(r#"{"command_id":"cmd-2","status":"failed","message":"denied"}"#)
                .unwrap();
        let InboundFrame::Completion { failed, result, .. } = frame else {
            panic!("expected completion");
        };
        assert!(failed);
        assert!(!result.success);
    }

    #[test]
    fn heartbeat_is_control() {
        assert_eq!(
            classify_frame(r#"{"type":"heartbeat","pid":42}"#).unwrap(),
            InboundFrame::Heartbeat
        );
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(classify_frame("not json").is_err());
        assert!(classify_frame(r#"{"hello":"world"}"#).is_err());
        assert!(classify_frame(r#"{"command_id":"cmd-1","status":"exploded"}"#).is_err());
        assert!(classify_frame(r#"{"command_id":"cmd-1"}"#).is_err());
    }
}
