//! Prompt Tracker & Validator
//!
//! Correlates server-originated interactive prompts with client responses.
//! Exactly one socket owns each prompt; responses from any other socket are
//! rejected, pending prompts are capped per socket, and expiry removes the
//! prompt whether or not anyone answers.

mod payload;

pub use payload::{
    contains_html, PromptButton, PromptInput, PromptPayload, PromptResponse, ALLOWED_ICONS,
    MAX_INPUT_VALUE_LEN, MAX_MESSAGE_LEN, MAX_TIMEOUT_MS, MAX_TITLE_LEN, MIN_TIMEOUT_MS,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ValidationError;

/// Default cap on pending prompts per socket.
pub const DEFAULT_MAX_PENDING_PER_SOCKET: usize = 5;

/// Response actions that are always accepted regardless of the offered
/// buttons.
const IMPLICIT_ACTIONS: &[&str] = &["dismissed", "timeout"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("too many pending prompts")]
    TooManyPending,

    #[error("unknown prompt")]
    UnknownPrompt,

    #[error("prompt belongs to another socket")]
    ForeignPrompt,

    #[error("prompt expired")]
    Expired,

    #[error("action {0:?} not offered")]
    InvalidAction(String),

    #[error("invalid inputs: {0}")]
    InvalidInputs(String),

    #[error(transparent)]
    Payload(#[from] ValidationError),
}

impl PromptError {
    pub fn code(&self) -> &'static str {
        match self {
            PromptError::TooManyPending => "TOO_MANY_PENDING",
            PromptError::UnknownPrompt => "UNKNOWN_PROMPT",
            PromptError::ForeignPrompt => "FOREIGN_PROMPT",
            PromptError::Expired => "EXPIRED",
            PromptError::InvalidAction(_) => "INVALID_ACTION",
            PromptError::InvalidInputs(_) => "INVALID_INPUTS",
            PromptError::Payload(_) => "INVALID_PAYLOAD",
        }
    }
}

struct TrackedPrompt {
    socket_id: String,
    payload: PromptPayload,
    #[allow(dead_code)]
    created_at: Instant,
    timeout_at: Instant,
    expected_buttons: HashSet<String>,
    expected_inputs: HashSet<String>,
    required_inputs: HashSet<String>,
    /// Waiter to wake with the (possibly synthetic) response.
    reply: Option<oneshot::Sender<PromptResponse>>,
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, TrackedPrompt>,
    by_socket: HashMap<String, HashSet<String>>,
}

/// Process-wide prompt registry.
pub struct PromptTracker {
    max_pending_per_socket: usize,
    indices: Mutex<Indices>,
}

impl Default for PromptTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_PER_SOCKET)
    }
}

impl PromptTracker {
    pub fn new(max_pending_per_socket: usize) -> Self {
        Self {
            max_pending_per_socket,
            indices: Mutex::new(Indices::default()),
        }
    }

    /// Track a prompt for `socket_id`. The payload id is overwritten with a
    /// freshly allocated UUIDv4. Returns the prompt id.
    pub fn track(
        &self,
        socket_id: &str,
        payload: PromptPayload,
    ) -> Result<String, PromptError> {
        let (id, _rx) = self.track_inner(socket_id, payload, false)?;
        Ok(id)
    }

    /// Track a prompt and receive the response (or a synthetic `timeout` /
    /// `dismissed` response) on the returned channel.
    pub fn track_with_reply(
        &self,
        socket_id: &str,
        payload: PromptPayload,
    ) -> Result<(String, oneshot::Receiver<PromptResponse>), PromptError> {
        let (id, rx) = self.track_inner(socket_id, payload, true)?;
        Ok((id, rx.unwrap_or_else(|| oneshot::channel().1)))
    }

    fn track_inner(
        &self,
        socket_id: &str,
        mut payload: PromptPayload,
        with_reply: bool,
    ) -> Result<(String, Option<oneshot::Receiver<PromptResponse>>), PromptError> {
        payload.id = uuid::Uuid::new_v4().to_string();
        payload.validate()?;

        let mut indices = self.indices.lock();
        let pending = indices
            .by_socket
            .get(socket_id)
            .map(HashSet::len)
            .unwrap_or(0);
        if pending >= self.max_pending_per_socket {
            return Err(PromptError::TooManyPending);
        }

        let id = payload.id.clone();
        let now = Instant::now();
        let (reply, rx) = if with_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let tracked = TrackedPrompt {
            socket_id: socket_id.to_string(),
            expected_buttons: payload.buttons.iter().map(|b| b.action.clone()).collect(),
            expected_inputs: payload.inputs.iter().map(|i| i.key.clone()).collect(),
            required_inputs: payload
                .inputs
                .iter()
                .filter(|i| i.required)
                .map(|i| i.key.clone())
                .collect(),
            created_at: now,
            timeout_at: now + Duration::from_millis(payload.timeout),
            payload,
            reply,
        };

        indices.by_id.insert(id.clone(), tracked);
        indices
            .by_socket
            .entry(socket_id.to_string())
            .or_default()
            .insert(id.clone());

        debug!(socket_id, prompt_id = %id, "prompt tracked");
        Ok((id, rx))
    }

    /// Snapshot of the payload, for emitting to the client.
    pub fn payload(&self, prompt_id: &str) -> Option<PromptPayload> {
        self.indices
            .lock()
            .by_id
            .get(prompt_id)
            .map(|t| t.payload.clone())
    }

    /// Validate a response without consuming the prompt.
    pub fn validate(&self, socket_id: &str, response: &PromptResponse) -> Result<(), PromptError> {
        let mut indices = self.indices.lock();
        self.validate_locked(&mut indices, socket_id, response)
    }

    fn validate_locked(
        &self,
        indices: &mut Indices,
        socket_id: &str,
        response: &PromptResponse,
    ) -> Result<(), PromptError> {
        let tracked = indices
            .by_id
            .get(&response.id)
            .ok_or(PromptError::UnknownPrompt)?;

        if tracked.socket_id != socket_id {
            return Err(PromptError::ForeignPrompt);
        }

        if Instant::now() > tracked.timeout_at {
            // expired: the prompt is gone either way
            Self::detach(indices, &response.id);
            return Err(PromptError::Expired);
        }

        let tracked = &indices.by_id[&response.id];
        let action_ok = tracked.expected_buttons.contains(&response.action)
            || IMPLICIT_ACTIONS.contains(&response.action.as_str());
        if !action_ok {
            return Err(PromptError::InvalidAction(response.action.clone()));
        }

        for key in response.inputs.keys() {
            if !tracked.expected_inputs.contains(key) {
                return Err(PromptError::InvalidInputs(format!("unexpected key {key:?}")));
            }
        }
        for key in &tracked.required_inputs {
            match response.inputs.get(key) {
                Some(value) if !value.is_empty() => {}
                _ => {
                    return Err(PromptError::InvalidInputs(format!(
                        "required input {key:?} missing"
                    )))
                }
            }
        }
        for (key, value) in &response.inputs {
            if value.chars().count() > MAX_INPUT_VALUE_LEN {
                return Err(PromptError::InvalidInputs(format!("value for {key:?} too long")));
            }
            if contains_html(value) {
                return Err(PromptError::InvalidInputs(format!(
                    "markup not allowed in {key:?}"
                )));
            }
        }

        Ok(())
    }

    /// Validate and consume: the prompt is removed and any waiter is woken
    /// with the response.
    pub fn resolve(&self, socket_id: &str, response: PromptResponse) -> Result<(), PromptError> {
        let reply = {
            let mut indices = self.indices.lock();
            self.validate_locked(&mut indices, socket_id, &response)?;
            let mut tracked =
                Self::detach(&mut indices, &response.id).ok_or(PromptError::UnknownPrompt)?;
            tracked.reply.take()
        };

        if let Some(tx) = reply {
            let _ = tx.send(response);
        }
        Ok(())
    }

    /// Remove every pending prompt owned by `socket_id`. Idempotent; called
    /// on socket disconnect. Waiters receive a synthetic `dismissed`
    /// response.
    pub fn remove_all_for_socket(&self, socket_id: &str) {
        let detached: Vec<TrackedPrompt> = {
            let mut indices = self.indices.lock();
            let ids: Vec<String> = indices
                .by_socket
                .remove(socket_id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();
            ids.iter()
                .filter_map(|id| indices.by_id.remove(id))
                .collect()
        };

        for mut tracked in detached {
            if let Some(tx) = tracked.reply.take() {
                let _ = tx.send(PromptResponse::dismissed(&tracked.payload.id));
            }
        }
    }

    /// Remove expired prompts, waking waiters with a `timeout` response.
    /// Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<TrackedPrompt> = {
            let mut indices = self.indices.lock();
            let ids: Vec<String> = indices
                .by_id
                .iter()
                .filter(|(_, t)| now > t.timeout_at)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| Self::detach(&mut indices, id))
                .collect()
        };

        let count = expired.len();
        for mut tracked in expired {
            warn!(prompt_id = %tracked.payload.id, socket_id = %tracked.socket_id, "prompt expired");
            if let Some(tx) = tracked.reply.take() {
                let _ = tx.send(PromptResponse::timed_out(&tracked.payload.id));
            }
        }
        count
    }

    /// Spawn the periodic expiry sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tracker.sweep_expired();
            }
        });
    }

    pub fn pending_count(&self, socket_id: &str) -> usize {
        self.indices
            .lock()
            .by_socket
            .get(socket_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Drop a single prompt without an answer. Any waiter is woken with a
    /// synthetic `dismissed` response.
    pub fn cancel(&self, prompt_id: &str) {
        let tracked = {
            let mut indices = self.indices.lock();
            Self::detach(&mut indices, prompt_id)
        };
        if let Some(mut tracked) = tracked {
            if let Some(tx) = tracked.reply.take() {
                let _ = tx.send(PromptResponse::dismissed(prompt_id));
            }
        }
    }

    fn detach(indices: &mut Indices, prompt_id: &str) -> Option<TrackedPrompt> {
        let tracked = indices.by_id.remove(prompt_id)?;
        if let Some(set) = indices.by_socket.get_mut(&tracked.socket_id) {
            set.remove(prompt_id);
            if set.is_empty() {
                indices.by_socket.remove(&tracked.socket_id);
            }
        }
        Some(tracked)
    }
}

/// Couples prompt tracking with delivery to the owning socket.
///
/// Adapters that need an interactive answer mid-operation (host key
/// confirmation, keyboard-interactive forwarding) hold one of these; the
/// Socket Bridge forwards whatever lands on `outbound` to the client as a
/// `prompt` message.
#[derive(Clone)]
pub struct PromptDispatcher {
    tracker: Arc<PromptTracker>,
    socket_id: String,
    outbound: tokio::sync::mpsc::Sender<PromptPayload>,
}

impl PromptDispatcher {
    pub fn new(
        tracker: Arc<PromptTracker>,
        socket_id: impl Into<String>,
        outbound: tokio::sync::mpsc::Sender<PromptPayload>,
    ) -> Self {
        Self {
            tracker,
            socket_id: socket_id.into(),
            outbound,
        }
    }

    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    /// Track the prompt, deliver it to the socket, and await the answer.
    /// A dead socket yields `dismissed`; a missed deadline yields `timeout`.
    pub async fn ask(&self, payload: PromptPayload) -> Result<PromptResponse, PromptError> {
        let timeout_ms = payload.timeout;
        let (id, rx) = self.tracker.track_with_reply(&self.socket_id, payload)?;

        let outgoing = self
            .tracker
            .payload(&id)
            .ok_or(PromptError::UnknownPrompt)?;
        if self.outbound.send(outgoing).await.is_err() {
            self.tracker.cancel(&id);
            return Ok(PromptResponse::dismissed(&id));
        }

        // The sweeper also expires prompts, but its cadence is coarse;
        // enforce the deadline here too.
        match tokio::time::timeout(Duration::from_millis(timeout_ms.saturating_add(1_000)), rx)
            .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Ok(PromptResponse::dismissed(&id)),
            Err(_) => {
                self.tracker.cancel(&id);
                Ok(PromptResponse::timed_out(&id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(timeout: u64) -> PromptPayload {
        PromptPayload {
            id: String::new(),
            title: "Question".into(),
            message: None,
            icon: None,
            buttons: vec![PromptButton {
                action: "ok".into(),
                label: "OK".into(),
            }],
            inputs: vec![PromptInput {
                key: "answer".into(),
                label: "Answer".into(),
                required: true,
                secret: false,
            }],
            timeout,
        }
    }

    fn response(id: &str, action: &str, answer: Option<&str>) -> PromptResponse {
        let mut inputs = HashMap::new();
        if let Some(answer) = answer {
            inputs.insert("answer".to_string(), answer.to_string());
        }
        PromptResponse {
            id: id.to_string(),
            action: action.to_string(),
            inputs,
        }
    }

    #[test]
    fn pending_cap_is_enforced() {
        let tracker = PromptTracker::new(2);
        tracker.track("s1", payload(5_000)).unwrap();
        tracker.track("s1", payload(5_000)).unwrap();
        assert_eq!(
            tracker.track("s1", payload(5_000)).unwrap_err(),
            PromptError::TooManyPending
        );
        // other sockets are unaffected
        assert!(tracker.track("s2", payload(5_000)).is_ok());
    }

    #[test]
    fn foreign_socket_is_rejected_and_prompt_survives() {
        let tracker = PromptTracker::default();
        let id = tracker.track("s1", payload(5_000)).unwrap();

        let err = tracker
            .validate("s2", &response(&id, "ok", Some("x")))
            .unwrap_err();
        assert_eq!(err, PromptError::ForeignPrompt);
        // still pending for the owner
        assert_eq!(tracker.pending_count("s1"), 1);
        assert!(tracker
            .validate("s1", &response(&id, "ok", Some("x")))
            .is_ok());
    }

    #[test]
    fn unknown_prompt_is_rejected() {
        let tracker = PromptTracker::default();
        assert_eq!(
            tracker
                .validate("s1", &response("nope", "ok", None))
                .unwrap_err(),
            PromptError::UnknownPrompt
        );
    }

    #[test]
    fn action_must_be_offered_or_implicit() {
        let tracker = PromptTracker::default();
        let id = tracker.track("s1", payload(5_000)).unwrap();

        assert!(matches!(
            tracker
                .validate("s1", &response(&id, "sideways", Some("x")))
                .unwrap_err(),
            PromptError::InvalidAction(_)
        ));
        // implicit actions pass
        assert!(tracker.validate("s1", &response(&id, "dismissed", Some("x"))).is_ok());
        assert!(tracker.validate("s1", &response(&id, "timeout", Some("x"))).is_ok());
    }

    #[test]
    fn required_inputs_must_be_present_and_nonempty() {
        let tracker = PromptTracker::default();
        let id = tracker.track("s1", payload(5_000)).unwrap();

        assert!(matches!(
            tracker.validate("s1", &response(&id, "ok", None)).unwrap_err(),
            PromptError::InvalidInputs(_)
        ));
        assert!(matches!(
            tracker
                .validate("s1", &response(&id, "ok", Some("")))
                .unwrap_err(),
            PromptError::InvalidInputs(_)
        ));

        // unexpected key
        let mut bad = response(&id, "ok", Some("x"));
        bad.inputs.insert("extra".into(), "y".into());
        assert!(matches!(
            tracker.validate("s1", &bad).unwrap_err(),
            PromptError::InvalidInputs(_)
        ));
    }

    #[test]
    fn markup_in_input_values_is_rejected() {
        let tracker = PromptTracker::default();
        let id = tracker.track("s1", payload(5_000)).unwrap();
        assert!(matches!(
            tracker
                .validate("s1", &response(&id, "ok", Some("<b>hi</b>")))
                .unwrap_err(),
            PromptError::InvalidInputs(_)
        ));
    }

    #[tokio::test]
    async fn resolve_wakes_waiter_and_consumes() {
        let tracker = PromptTracker::default();
        let (id, rx) = tracker.track_with_reply("s1", payload(5_000)).unwrap();

        tracker
            .resolve("s1", response(&id, "ok", Some("42")))
            .unwrap();
        let got = rx.await.unwrap();
        assert_eq!(got.action, "ok");
        assert_eq!(got.inputs.get("answer").map(String::as_str), Some("42"));

        // consumed
        assert_eq!(
            tracker
                .validate("s1", &response(&id, "ok", Some("42")))
                .unwrap_err(),
            PromptError::UnknownPrompt
        );
    }

    #[tokio::test]
    async fn socket_disconnect_dismisses_pending() {
        let tracker = PromptTracker::default();
        let (_id, rx) = tracker.track_with_reply("s1", payload(5_000)).unwrap();

        tracker.remove_all_for_socket("s1");
        tracker.remove_all_for_socket("s1"); // idempotent

        let got = rx.await.unwrap();
        assert_eq!(got.action, "dismissed");
        assert_eq!(tracker.pending_count("s1"), 0);
    }

    #[tokio::test]
    async fn expired_prompt_is_swept_with_timeout_response() {
        let tracker = PromptTracker::default();
        let (id, rx) = tracker.track_with_reply("s1", payload(1_000)).unwrap();

        // nothing to sweep yet
        assert_eq!(tracker.sweep_expired(), 0);

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert_eq!(tracker.sweep_expired(), 1);

        let got = rx.await.unwrap();
        assert_eq!(got.action, "timeout");
        assert_eq!(got.id, id);
    }
}
