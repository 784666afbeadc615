//! Authentication state machine
//!
//! One instance per socket. Orchestrates credential acquisition (session
//! deposited, client supplied, or interactive), tracks consecutive
//! failures, and decides when a socket has exhausted its attempts.
//! `idle -> collecting -> dialing -> interactive -> authenticated | failed`.

mod policy;

pub use policy::AuthMethodPolicy;

use serde::Serialize;
use tracing::warn;

use crate::error::{AuthError, ConnectionError, GatewayError, PolicyError};

/// Terminal failure reasons surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailureReason {
    InvalidCredentials,
    PolicyBlocked,
    NoMethod,
    Network,
    Timeout,
}

impl AuthFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFailureReason::InvalidCredentials => "invalid_credentials",
            AuthFailureReason::PolicyBlocked => "policy_blocked",
            AuthFailureReason::NoMethod => "no_method",
            AuthFailureReason::Network => "network",
            AuthFailureReason::Timeout => "timeout",
        }
    }

    /// Human message for the `authentication` wire reply.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthFailureReason::InvalidCredentials => "Invalid credentials",
            AuthFailureReason::PolicyBlocked => "Authentication blocked by policy",
            AuthFailureReason::NoMethod => "No authentication method available",
            AuthFailureReason::Network => "Connection failed",
            AuthFailureReason::Timeout => "Connection timeout",
        }
    }

    /// Map an adapter error onto the typed reason.
    pub fn classify(err: &GatewayError) -> Self {
        match err {
            GatewayError::Auth(AuthError::InvalidCredentials) => {
                AuthFailureReason::InvalidCredentials
            }
            GatewayError::Auth(AuthError::PolicyBlocked) => AuthFailureReason::PolicyBlocked,
            GatewayError::Auth(AuthError::NoMethod) => AuthFailureReason::NoMethod,
            GatewayError::Auth(AuthError::Interrupted(_)) => AuthFailureReason::Network,
            GatewayError::Policy(PolicyError::SubnetBlocked(_)) => {
                AuthFailureReason::PolicyBlocked
            }
            GatewayError::Connection(ConnectionError::Timeout) => AuthFailureReason::Timeout,
            _ => AuthFailureReason::Network,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Idle,
    Collecting,
    Dialing,
    Interactive,
    Authenticated,
    Failed(AuthFailureReason),
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Inform the client and wait for fresh credentials.
    Retry { remaining: u32 },
    /// Attempts exhausted; inform and disconnect the socket.
    Exhausted,
}

pub struct AuthStateMachine {
    phase: AuthPhase,
    attempts: u32,
    max_attempts: u32,
}

impl AuthStateMachine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            phase: AuthPhase::Idle,
            attempts: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Entering credential acquisition. Valid from idle or a prior failure.
    pub fn begin_collecting(&mut self) {
        match self.phase {
            AuthPhase::Idle | AuthPhase::Failed(_) | AuthPhase::Collecting => {
                self.phase = AuthPhase::Collecting;
            }
            other => {
                warn!(?other, "begin_collecting from unexpected phase");
                self.phase = AuthPhase::Collecting;
            }
        }
    }

    /// Complete credentials are in hand; the dial starts.
    pub fn begin_dialing(&mut self) {
        if self.phase != AuthPhase::Collecting {
            warn!(phase = ?self.phase, "begin_dialing from unexpected phase");
        }
        self.phase = AuthPhase::Dialing;
    }

    /// The server asked for keyboard-interactive input mid-dial.
    pub fn begin_interactive(&mut self) {
        if self.phase != AuthPhase::Dialing {
            warn!(phase = ?self.phase, "begin_interactive from unexpected phase");
        }
        self.phase = AuthPhase::Interactive;
    }

    pub fn succeeded(&mut self) {
        self.phase = AuthPhase::Authenticated;
        self.attempts = 0;
    }

    /// Record a failed attempt and decide the follow-up.
    pub fn failed(&mut self, reason: AuthFailureReason) -> AttemptOutcome {
        self.attempts += 1;
        self.phase = AuthPhase::Failed(reason);
        if self.attempts >= self.max_attempts {
            AttemptOutcome::Exhausted
        } else {
            AttemptOutcome::Retry {
                remaining: self.max_attempts - self.attempts,
            }
        }
    }

    /// Explicit reauthentication is a fresh start: phase and attempt
    /// counter both reset.
    pub fn reset(&mut self) {
        self.phase = AuthPhase::Idle;
        self.attempts = 0;
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == AuthPhase::Authenticated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut machine = AuthStateMachine::new(3);
        assert_eq!(machine.phase(), AuthPhase::Idle);
        machine.begin_collecting();
        machine.begin_dialing();
        machine.begin_interactive();
        machine.succeeded();
        assert!(machine.is_authenticated());
        assert_eq!(machine.attempts(), 0);
    }

    #[test]
    fn attempts_exhaust_after_max_consecutive_failures() {
        let mut machine = AuthStateMachine::new(3);
        machine.begin_collecting();
        machine.begin_dialing();

        assert_eq!(
            machine.failed(AuthFailureReason::InvalidCredentials),
            AttemptOutcome::Retry { remaining: 2 }
        );
        machine.begin_collecting();
        machine.begin_dialing();
        assert_eq!(
            machine.failed(AuthFailureReason::InvalidCredentials),
            AttemptOutcome::Retry { remaining: 1 }
        );
        machine.begin_collecting();
        machine.begin_dialing();
        assert_eq!(
            machine.failed(AuthFailureReason::InvalidCredentials),
            AttemptOutcome::Exhausted
        );
        assert_eq!(
            machine.phase(),
            AuthPhase::Failed(AuthFailureReason::InvalidCredentials)
        );
    }

    #[test]
    fn success_resets_the_attempt_counter() {
        let mut machine = AuthStateMachine::new(2);
        machine.begin_collecting();
        machine.begin_dialing();
        machine.failed(AuthFailureReason::InvalidCredentials);

        machine.begin_collecting();
        machine.begin_dialing();
        machine.succeeded();
        assert_eq!(machine.attempts(), 0);

        // a later failure starts counting from zero again
        machine.begin_collecting();
        machine.begin_dialing();
        assert_eq!(
            machine.failed(AuthFailureReason::Network),
            AttemptOutcome::Retry { remaining: 1 }
        );
    }

    #[test]
    fn classify_maps_error_kinds() {
        assert_eq!(
            AuthFailureReason::classify(&GatewayError::Auth(AuthError::InvalidCredentials)),
            AuthFailureReason::InvalidCredentials
        );
        assert_eq!(
            AuthFailureReason::classify(&GatewayError::Policy(PolicyError::SubnetBlocked(
                "192.0.2.1".into()
            ))),
            AuthFailureReason::PolicyBlocked
        );
        assert_eq!(
            AuthFailureReason::classify(&GatewayError::Connection(ConnectionError::Timeout)),
            AuthFailureReason::Timeout
        );
        assert_eq!(
            AuthFailureReason::classify(&GatewayError::Connection(ConnectionError::Refused(
                "x".into()
            ))),
            AuthFailureReason::Network
        );
    }
}
