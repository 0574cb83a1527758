//! Control-message protocol
//!
//! Text frames carry flat JSON objects with a `type` field:
//!
//! ```text
//! client -> relay   {"type":"identify","role":"source"|"observer","sessionId":"..."}
//! observer -> src   {"type":"tap_relative"|"swipe_relative", ...}   (forwarded verbatim)
//! relay -> client   {"type":"status","message":"...","sourceAvailable":bool}
//! ```
//!
//! Binary frames are opaque and never decoded here.

use axum::extract::ws::{close_code, CloseFrame};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const FIELD_TYPE: &str = "type";
pub const FIELD_ROLE: &str = "role";
pub const FIELD_SESSION_ID: &str = "sessionId";

/// Field names used by tablet/viewer clients of the first broker generation
const ROLE_ALIASES: &[&str] = &["client"];
const SESSION_ID_ALIASES: &[&str] = &["tabletId", "targetTabletId"];

pub const TYPE_IDENTIFY: &str = "identify";
pub const TYPE_TAP_RELATIVE: &str = "tap_relative";
pub const TYPE_SWIPE_RELATIVE: &str = "swipe_relative";

/// Close code sent to a source replaced by a newer identification
pub const CLOSE_REPLACED: u16 = 4000;
/// Close code sent to a peer that stopped answering heartbeats
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4001;

/// Role a connection takes within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Produces binary frames, consumes commands
    Source,
    /// Consumes binary frames, produces commands
    Observer,
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" | "tablet" => Ok(Role::Source),
            "observer" | "viewer" | "visor" => Ok(Role::Observer),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Observer => write!(f, "observer"),
        }
    }
}

/// Errors raised while decoding a text frame
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(String),

    #[error("identify message has no role")]
    MissingRole,

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("identify message has no session id")]
    MissingSessionId,
}

impl ProtocolError {
    /// Whether the error must close the connection
    ///
    /// Malformed frames are dropped and the connection stays open; an
    /// invalid identify message is a protocol violation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::Malformed(_))
    }
}

/// Observer commands relayed to the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    TapRelative,
    SwipeRelative,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::TapRelative => TYPE_TAP_RELATIVE,
            CommandKind::SwipeRelative => TYPE_SWIPE_RELATIVE,
        }
    }
}

/// Raw identify fields, validated separately so a bound connection can
/// ignore a repeated identify without tripping over its contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyRequest {
    pub role: Option<String>,
    pub session_id: Option<String>,
}

impl IdentifyRequest {
    fn from_fields(map: &Map<String, Value>) -> Self {
        Self {
            role: lookup(map, FIELD_ROLE, ROLE_ALIASES),
            session_id: lookup(map, FIELD_SESSION_ID, SESSION_ID_ALIASES),
        }
    }

    /// Resolve the role and session id, both required and non-empty
    pub fn validate(&self) -> Result<(Role, String), ProtocolError> {
        let role = match self.role.as_deref() {
            None | Some("") => return Err(ProtocolError::MissingRole),
            Some(raw) => raw.parse::<Role>()?,
        };
        let session_id = match self.session_id.as_deref() {
            None | Some("") => return Err(ProtocolError::MissingSessionId),
            Some(id) => id.to_string(),
        };
        Ok((role, session_id))
    }
}

/// First matching field among the canonical name and its aliases.
/// Numeric ids are accepted and rendered as strings.
fn lookup(map: &Map<String, Value>, field: &str, aliases: &[&str]) -> Option<String> {
    std::iter::once(field)
        .chain(aliases.iter().copied())
        .find_map(|key| match map.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
}

/// Decoded text frame
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Identify(IdentifyRequest),
    /// Observer command, re-serialized for forwarding
    Command { kind: CommandKind, body: String },
    /// Any other `type`; carries no routing effect
    Other { kind: String },
}

/// Decode a text frame into a control message
pub fn decode(text: &str) -> Result<ControlMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(ProtocolError::Malformed("expected a JSON object".into()));
    };
    let kind = map
        .get(FIELD_TYPE)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing `type` field".into()))?;

    let command = match kind {
        TYPE_IDENTIFY => return Ok(ControlMessage::Identify(IdentifyRequest::from_fields(&map))),
        TYPE_TAP_RELATIVE => CommandKind::TapRelative,
        TYPE_SWIPE_RELATIVE => CommandKind::SwipeRelative,
        other => {
            return Ok(ControlMessage::Other {
                kind: other.to_string(),
            })
        }
    };

    let body = serde_json::to_string(&map).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(ControlMessage::Command {
        kind: command,
        body,
    })
}

/// Status notification kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Sent to a source once its identification is accepted
    Identified,
    SourceConnected,
    SourceDisconnected,
}

/// Server-to-client status message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "status", rename_all = "camelCase")]
pub struct StatusMessage {
    pub message: StatusKind,
    pub source_available: bool,
}

impl StatusMessage {
    pub fn identified() -> Self {
        Self {
            message: StatusKind::Identified,
            source_available: true,
        }
    }

    /// Availability notice for observers
    pub fn source_available(available: bool) -> Self {
        Self {
            message: if available {
                StatusKind::SourceConnected
            } else {
                StatusKind::SourceDisconnected
            },
            source_available: available,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Why a connection was terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the transport or it failed on read
    PeerClosed,
    /// Invalid identify message
    ProtocolError(String),
    /// A newer source identified for the same session
    Replaced,
    /// Heartbeat probes went unanswered
    HeartbeatTimeout,
    /// An outbound write exceeded the send timeout
    SlowConsumer,
    /// An outbound write failed
    TransportError,
    /// Server shutting down
    Shutdown,
}

impl CloseReason {
    /// Close frame to send, if the transport is still worth writing to
    pub fn close_frame(&self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            CloseReason::PeerClosed | CloseReason::TransportError | CloseReason::SlowConsumer => {
                return None
            }
            CloseReason::ProtocolError(msg) => (close_code::PROTOCOL, msg.clone()),
            CloseReason::Replaced => (CLOSE_REPLACED, "replaced by a newer source".to_string()),
            CloseReason::HeartbeatTimeout => {
                (CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout".to_string())
            }
            CloseReason::Shutdown => (close_code::AWAY, "server shutting down".to_string()),
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            CloseReason::Replaced => write!(f, "replaced"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::SlowConsumer => write!(f, "send timeout"),
            CloseReason::TransportError => write!(f, "transport error"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify(text: &str) -> IdentifyRequest {
        match decode(text).unwrap() {
            ControlMessage::Identify(req) => req,
            other => panic!("expected identify, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_identify() {
        let req = identify(r#"{"type":"identify","role":"source","sessionId":"X"}"#);
        assert_eq!(req.validate(), Ok((Role::Source, "X".to_string())));

        let req = identify(r#"{"type":"identify","role":"observer","sessionId":"X"}"#);
        assert_eq!(req.validate(), Ok((Role::Observer, "X".to_string())));
    }

    #[test]
    fn test_decode_identify_legacy_fields() {
        let req = identify(r#"{"type":"identify","client":"tablet","tabletId":"T-1"}"#);
        assert_eq!(req.validate(), Ok((Role::Source, "T-1".to_string())));

        let req = identify(r#"{"type":"identify","client":"viewer","tabletId":42}"#);
        assert_eq!(req.validate(), Ok((Role::Observer, "42".to_string())));

        let req = identify(r#"{"type":"identify","client":"visor","targetTabletId":"T-1"}"#);
        assert_eq!(req.validate(), Ok((Role::Observer, "T-1".to_string())));
    }

    #[test]
    fn test_identify_validation_errors() {
        let req = identify(r#"{"type":"identify","sessionId":"X"}"#);
        assert_eq!(req.validate(), Err(ProtocolError::MissingRole));

        let req = identify(r#"{"type":"identify","role":"","sessionId":"X"}"#);
        assert_eq!(req.validate(), Err(ProtocolError::MissingRole));

        let req = identify(r#"{"type":"identify","role":"admin","sessionId":"X"}"#);
        assert_eq!(
            req.validate(),
            Err(ProtocolError::UnknownRole("admin".to_string()))
        );

        let req = identify(r#"{"type":"identify","role":"observer"}"#);
        assert_eq!(req.validate(), Err(ProtocolError::MissingSessionId));

        let req = identify(r#"{"type":"identify","role":"observer","sessionId":""}"#);
        assert_eq!(req.validate(), Err(ProtocolError::MissingSessionId));

        assert!(ProtocolError::MissingRole.is_fatal());
        assert!(ProtocolError::UnknownRole("x".into()).is_fatal());
        assert!(ProtocolError::MissingSessionId.is_fatal());
    }

    #[test]
    fn test_decode_malformed_is_not_fatal() {
        for text in ["not json", "[1,2,3]", "\"identify\"", r#"{"role":"source"}"#, r#"{"type":7}"#] {
            let err = decode(text).unwrap_err();
            assert!(matches!(err, ProtocolError::Malformed(_)), "{}", text);
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn test_decode_command_keeps_payload() {
        let msg = decode(r#"{"type":"tap_relative","x":0.25,"y":0.75}"#).unwrap();
        let ControlMessage::Command { kind, body } = msg else {
            panic!("expected command");
        };
        assert_eq!(kind, CommandKind::TapRelative);

        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["type"], "tap_relative");
        assert_eq!(value["x"], 0.25);
        assert_eq!(value["y"], 0.75);

        let msg = decode(r#"{"type":"swipe_relative","x1":0,"y1":0,"x2":1,"y2":1}"#).unwrap();
        assert!(matches!(
            msg,
            ControlMessage::Command {
                kind: CommandKind::SwipeRelative,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        assert_eq!(
            decode(r#"{"type":"keyframe_request"}"#).unwrap(),
            ControlMessage::Other {
                kind: "keyframe_request".to_string()
            }
        );
    }

    #[test]
    fn test_status_message_format() {
        let json = StatusMessage::source_available(true).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["message"], "source_connected");
        assert_eq!(value["sourceAvailable"], true);

        let parsed: StatusMessage =
            serde_json::from_str(r#"{"type":"status","message":"source_disconnected","sourceAvailable":false}"#)
                .unwrap();
        assert_eq!(parsed, StatusMessage::source_available(false));
    }

    #[test]
    fn test_close_frames() {
        let frame = CloseReason::ProtocolError("identify message has no role".into())
            .close_frame()
            .unwrap();
        assert_eq!(frame.code, close_code::PROTOCOL);

        assert_eq!(CloseReason::Replaced.close_frame().unwrap().code, CLOSE_REPLACED);
        assert_eq!(
            CloseReason::HeartbeatTimeout.close_frame().unwrap().code,
            CLOSE_HEARTBEAT_TIMEOUT
        );
        assert!(CloseReason::PeerClosed.close_frame().is_none());
        assert!(CloseReason::SlowConsumer.close_frame().is_none());
    }
}
