//! WebSocket wire protocol
//!
//! Control messages travel as JSON text frames shaped
//! `{"event": "...", "data": {...}}`; terminal bytes travel as binary
//! frames and never pass through a parser. Every inbound text frame is
//! parsed against these types exactly once, at the edge.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::prompt::{PromptPayload, PromptResponse};

/// Upper bound on an exec command line.
pub const MAX_COMMAND_LEN: usize = 8_192;

/// Largest accepted terminal axis.
pub const MAX_TERMINAL_AXIS: u16 = 1_000;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthenticateRequest {
    pub username: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TerminalRequest {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ControlAction {
    ReplayCredentials,
    Reauth,
    Disconnect,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecWireRequest {
    pub command: String,
    #[serde(default)]
    pub pty: bool,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Client -> server control messages.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate(AuthenticateRequest),
    Terminal(TerminalRequest),
    Resize(ResizeRequest),
    Control(ControlAction),
    Exec(ExecWireRequest),
    PromptResponse(PromptResponse),
}

fn check_axis(field: &'static str, value: u16) -> Result<(), ValidationError> {
    if value == 0 || value > MAX_TERMINAL_AXIS {
        return Err(ValidationError::new(
            field,
            format!("must be within 1..={MAX_TERMINAL_AXIS}"),
        ));
    }
    Ok(())
}

impl ClientMessage {
    /// Semantic bounds beyond what serde shape-checks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ClientMessage::Authenticate(req) => {
                if req.username.is_empty() || req.username.len() > 256 {
                    return Err(ValidationError::new("username", "must be 1..=256 bytes"));
                }
                if let Some(host) = &req.host {
                    if host.is_empty() || host.len() > 255 {
                        return Err(ValidationError::new("host", "must be 1..=255 bytes"));
                    }
                }
                if let Some(cols) = req.cols {
                    check_axis("cols", cols)?;
                }
                if let Some(rows) = req.rows {
                    check_axis("rows", rows)?;
                }
                Ok(())
            }
            ClientMessage::Terminal(req) => {
                if req.term.is_empty() || req.term.len() > 64 {
                    return Err(ValidationError::new("term", "must be 1..=64 bytes"));
                }
                check_axis("cols", req.cols)?;
                check_axis("rows", req.rows)
            }
            ClientMessage::Resize(req) => {
                check_axis("cols", req.cols)?;
                check_axis("rows", req.rows)
            }
            ClientMessage::Exec(req) => {
                if req.command.is_empty() || req.command.len() > MAX_COMMAND_LEN {
                    return Err(ValidationError::new(
                        "command",
                        format!("must be 1..={MAX_COMMAND_LEN} bytes"),
                    ));
                }
                if let Some(cols) = req.cols {
                    check_axis("cols", cols)?;
                }
                if let Some(rows) = req.rows {
                    check_axis("rows", rows)?;
                }
                Ok(())
            }
            ClientMessage::Control(_) | ClientMessage::PromptResponse(_) => Ok(()),
        }
    }
}

/// Parse and validate one inbound text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ValidationError> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| ValidationError::new("message", e.to_string()))?;
    message.validate()?;
    Ok(message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthAction {
    RequestAuth,
    AuthResult,
    #[serde(rename = "keyboard-interactive")]
    KeyboardInteractive,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationStatus {
    pub action: AuthAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuthenticationStatus {
    pub fn request_auth() -> Self {
        Self {
            action: AuthAction::RequestAuth,
            success: None,
            message: None,
        }
    }

    pub fn result(success: bool, message: Option<String>) -> Self {
        Self {
            action: AuthAction::AuthResult,
            success: Some(success),
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub allow_replay: bool,
    pub allow_reauth: bool,
    pub allow_reconnect: bool,
    pub allow_file_transfer: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<UiHeader>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiHeader {
    pub text: String,
    pub background: String,
    pub color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStreamKind {
    Stdout,
    Stderr,
}

/// Typed error reply; the socket stays open.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    pub code: String,
    pub message: String,
}

/// Server -> client control messages.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    Authentication(AuthenticationStatus),
    Permissions(Permissions),
    #[serde(rename = "updateUI")]
    UpdateUi(UiUpdate),
    GetTerminal,
    #[serde(rename = "exec-data")]
    ExecData { stream: ExecStreamKind, data: String },
    #[serde(rename = "exec-exit")]
    ExecExit {
        code: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    Prompt(PromptPayload),
    Ssherror { message: String },
    Error(WireError),
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"event":"error","data":{"code":"internal","message":"serialization"}}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_parses_with_camel_case_fields() {
        let message = parse_client_message(
            r#"{"event":"authenticate","data":{"username":"alice","host":"10.0.0.5","port":22,"password":"s3cret","privateKey":null,"term":"xterm-256color","cols":120,"rows":40}}"#,
        )
        .unwrap();
        match message {
            ClientMessage::Authenticate(req) => {
                assert_eq!(req.username, "alice");
                assert_eq!(req.host.as_deref(), Some("10.0.0.5"));
                assert_eq!(req.cols, Some(120));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn prompt_response_uses_snake_case_event_name() {
        let message = parse_client_message(
            r#"{"event":"prompt_response","data":{"id":"p1","action":"ok","inputs":{}}}"#,
        )
        .unwrap();
        assert!(matches!(message, ClientMessage::PromptResponse(_)));
    }

    #[test]
    fn control_actions_parse() {
        let message = parse_client_message(
            r#"{"event":"control","data":"replayCredentials"}"#,
        )
        .unwrap();
        assert_eq!(message, ClientMessage::Control(ControlAction::ReplayCredentials));
    }

    #[test]
    fn zero_geometry_is_rejected() {
        let err = parse_client_message(
            r#"{"event":"resize","data":{"cols":0,"rows":24}}"#,
        )
        .unwrap_err();
        assert_eq!(err.field, "cols");
    }

    #[test]
    fn unknown_event_is_rejected() {
        assert!(parse_client_message(r#"{"event":"mystery","data":{}}"#).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(parse_client_message(
            r#"{"event":"resize","data":{"cols":80,"rows":24,"sneaky":true}}"#
        )
        .is_err());
    }

    #[test]
    fn empty_exec_command_is_rejected() {
        assert!(parse_client_message(
            r#"{"event":"exec","data":{"command":""}}"#
        )
        .is_err());
    }

    #[test]
    fn server_messages_use_wire_names() {
        let json = ServerMessage::UpdateUi(UiUpdate::default()).to_json();
        assert!(json.contains(r#""event":"updateUI""#));

        let json = ServerMessage::ExecData {
            stream: ExecStreamKind::Stderr,
            data: "oops".into(),
        }
        .to_json();
        assert!(json.contains(r#""event":"exec-data""#));
        assert!(json.contains(r#""stream":"stderr""#));

        let json = ServerMessage::Authentication(AuthenticationStatus::request_auth()).to_json();
        assert!(json.contains(r#""action":"request_auth""#));

        let json = ServerMessage::GetTerminal.to_json();
        assert!(json.contains(r#""event":"getTerminal""#));

        let json = ServerMessage::Ssherror {
            message: "broken".into(),
        }
        .to_json();
        assert!(json.contains(r#""event":"ssherror""#));
    }
}
