//! Wire protocol for client-server communication.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use quickdock_core::StateSnapshot;
use quickdock_session::ExecEnd;
use serde::{Deserialize, Serialize};

/// Message on the state events socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventMessage<'a> {
    /// A freshly published snapshot.
    State(&'a StateSnapshot),
    /// The subscriber fell behind and is being disconnected.
    Overloaded,
}

/// Control message from an exec client. Text frames that do not parse as one
/// of these are keystrokes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecClientMessage {
    /// Resize terminal.
    Resize { cols: u16, rows: u16 },
    /// Terminal input data (base64 encoded).
    Input { data: String },
    /// Ping for keepalive.
    Ping,
}

impl ExecClientMessage {
    /// Create an input message from raw bytes.
    #[must_use]
    pub fn input(data: &[u8]) -> Self {
        Self::Input {
            data: BASE64.encode(data),
        }
    }

    /// Decode input data from base64.
    #[must_use]
    pub fn decode_input(&self) -> Option<Vec<u8>> {
        if let Self::Input { data } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }
}

/// Control message from the server on an exec socket. Process output is sent
/// as binary frames, not through this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecServerMessage {
    /// Session ended; the socket closes right after.
    Exit {
        reason: String,
        exit_code: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Pong response.
    Pong,
    /// Error message.
    Error { message: String },
}

impl From<&ExecEnd> for ExecServerMessage {
    fn from(end: &ExecEnd) -> Self {
        let (reason, exit_code, message) = match end {
            ExecEnd::ProcessExited { exit_code } => ("process_exited", *exit_code, None),
            ExecEnd::ClientDisconnected => ("client_disconnected", None, None),
            ExecEnd::Closed => ("closed", None, None),
            ExecEnd::EngineFailed { message } => ("engine_failed", None, Some(message.clone())),
        };
        Self::Exit {
            reason: reason.to_string(),
            exit_code,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_roundtrip() {
        let original = b"\x1b[A\r";
        let msg = ExecClientMessage::input(original);
        assert_eq!(msg.decode_input().unwrap(), original);
        assert!(ExecClientMessage::Ping.decode_input().is_none());
    }

    #[test]
    fn test_resize_parses_from_client_json() {
        let parsed: ExecClientMessage =
            serde_json::from_str(r#"{"kind":"resize","cols":132,"rows":43}"#).unwrap();
        assert_eq!(parsed, ExecClientMessage::Resize { cols: 132, rows: 43 });

        assert!(serde_json::from_str::<ExecClientMessage>("ls -la").is_err());
        assert!(serde_json::from_str::<ExecClientMessage>(r#"{"kind":"resize"}"#).is_err());
    }

    #[test]
    fn test_state_envelope() {
        let snapshot = StateSnapshot {
            seq: 7,
            taken_at: 1,
            projects: Vec::new(),
        };
        let json = serde_json::to_value(EventMessage::State(&snapshot)).unwrap();
        assert_eq!(json["kind"], "state");
        assert_eq!(json["payload"]["seq"], 7);

        let json = serde_json::to_value(EventMessage::Overloaded).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "overloaded"}));
    }

    #[test]
    fn test_exit_notice_carries_reason_and_code() {
        let msg = ExecServerMessage::from(&ExecEnd::ProcessExited { exit_code: Some(130) });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "exit", "reason": "process_exited", "exit_code": 130})
        );

        let msg = ExecServerMessage::from(&ExecEnd::EngineFailed {
            message: "broken pipe".to_string(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["message"], "broken pipe");
        assert!(json["exit_code"].is_null());
    }
}
