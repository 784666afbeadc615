//! Interactive prompt wire payloads
//!
//! The payload shape is wire-stable: it is what the browser client renders.
//! All bounds are enforced server-side before a prompt is tracked.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const MAX_TITLE_LEN: usize = 120;
pub const MAX_MESSAGE_LEN: usize = 1000;
pub const MAX_INPUT_VALUE_LEN: usize = 1000;
pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// Icons the client is allowed to render.
pub const ALLOWED_ICONS: &[&str] = &["info", "warning", "error", "question", "key", "lock", "host"];

static ACTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap());
static INPUT_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").unwrap());
static HTML_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

/// True when the string contains an HTML-like `<...>` sequence.
pub fn contains_html(value: &str) -> bool {
    HTML_RE.is_match(value)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptButton {
    pub action: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptInput {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub secret: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPayload {
    /// UUIDv4, allocated by the tracker.
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub buttons: Vec<PromptButton>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<PromptInput>,
    /// Milliseconds until the prompt expires.
    pub timeout: u64,
}

impl PromptPayload {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.is_empty() || self.title.chars().count() > MAX_TITLE_LEN {
            return Err(ValidationError::new(
                "title",
                format!("must be 1..={MAX_TITLE_LEN} characters"),
            ));
        }
        if contains_html(&self.title) {
            return Err(ValidationError::new("title", "markup is not allowed"));
        }
        if let Some(message) = &self.message {
            if message.chars().count() > MAX_MESSAGE_LEN {
                return Err(ValidationError::new(
                    "message",
                    format!("must be at most {MAX_MESSAGE_LEN} characters"),
                ));
            }
            if contains_html(message) {
                return Err(ValidationError::new("message", "markup is not allowed"));
            }
        }
        if let Some(icon) = &self.icon {
            if !ALLOWED_ICONS.contains(&icon.as_str()) {
                return Err(ValidationError::new("icon", format!("unknown icon {icon:?}")));
            }
        }
        if self.buttons.is_empty() {
            return Err(ValidationError::new("buttons", "at least one button required"));
        }
        for button in &self.buttons {
            if !ACTION_RE.is_match(&button.action) {
                return Err(ValidationError::new(
                    "buttons",
                    format!("bad action {:?}", button.action),
                ));
            }
            if contains_html(&button.label) {
                return Err(ValidationError::new("buttons", "markup is not allowed"));
            }
        }
        for input in &self.inputs {
            if !INPUT_KEY_RE.is_match(&input.key) {
                return Err(ValidationError::new(
                    "inputs",
                    format!("bad input key {:?}", input.key),
                ));
            }
            if contains_html(&input.label) {
                return Err(ValidationError::new("inputs", "markup is not allowed"));
            }
        }
        if self.timeout < MIN_TIMEOUT_MS || self.timeout > MAX_TIMEOUT_MS {
            return Err(ValidationError::new(
                "timeout",
                format!("must be within {MIN_TIMEOUT_MS}..={MAX_TIMEOUT_MS} ms"),
            ));
        }
        Ok(())
    }
}

/// The client's answer to a tracked prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptResponse {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

impl PromptResponse {
    /// Synthetic response delivered to waiters when a prompt times out.
    pub fn timed_out(id: &str) -> Self {
        Self {
            id: id.to_string(),
            action: "timeout".to_string(),
            inputs: HashMap::new(),
        }
    }

    /// Synthetic response delivered to waiters when the owning socket goes
    /// away before answering.
    pub fn dismissed(id: &str) -> Self {
        Self {
            id: id.to_string(),
            action: "dismissed".to_string(),
            inputs: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> PromptPayload {
        PromptPayload {
            id: uuid::Uuid::new_v4().to_string(),
            title: "Verify host key".to_string(),
            message: Some("Fingerprint: SHA256:abcdef".to_string()),
            icon: Some("host".to_string()),
            buttons: vec![
                PromptButton {
                    action: "accept".into(),
                    label: "Accept".into(),
                },
                PromptButton {
                    action: "reject".into(),
                    label: "Reject".into(),
                },
            ],
            inputs: vec![],
            timeout: 30_000,
        }
    }

    #[test]
    fn valid_payload_passes() {
        assert!(payload().validate().is_ok());
    }

    #[test]
    fn markup_is_rejected() {
        let mut p = payload();
        p.title = "<script>alert(1)</script>".into();
        assert!(p.validate().is_err());

        let mut p = payload();
        p.message = Some("click <a href=x>here</a>".into());
        assert!(p.validate().is_err());
    }

    #[test]
    fn timeout_bounds() {
        let mut p = payload();
        p.timeout = 500;
        assert!(p.validate().is_err());
        p.timeout = 700_000;
        assert!(p.validate().is_err());
        p.timeout = MIN_TIMEOUT_MS;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn bad_action_and_key_patterns() {
        let mut p = payload();
        p.buttons[0].action = "1bad".into();
        assert!(p.validate().is_err());

        let mut p = payload();
        p.inputs.push(PromptInput {
            key: "-bad".into(),
            label: "Value".into(),
            required: false,
            secret: false,
        });
        assert!(p.validate().is_err());
    }

    #[test]
    fn unknown_icon_rejected() {
        let mut p = payload();
        p.icon = Some("sparkles".into());
        assert!(p.validate().is_err());
    }
}
