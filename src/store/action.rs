//! Session actions and the pure reducer
//!
//! Actions form a closed set. The reducer is pure and total: every
//! action/state pair yields a valid next state. Illegal transitions return
//! `None` and the caller logs them at warn level; the reducer never panics.

use std::collections::HashMap;

use chrono::Utc;

use super::session::{
    AuthStatus, ConnectionStatus, Session, TerminalState,
};

/// Partial metadata payload; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    pub user_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// The closed action set processed by the reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    AuthSuccess {
        username: String,
        method: String,
    },
    AuthFailure {
        error: String,
        method: Option<String>,
    },
    AuthClear,
    ConnectionStart {
        host: String,
        port: u16,
    },
    ConnectionEstablished {
        connection_id: String,
    },
    ConnectionError {
        error: String,
    },
    ConnectionClosed,
    TerminalResize {
        rows: u16,
        cols: u16,
    },
    TerminalSetEnv {
        environment: HashMap<String, String>,
    },
    TerminalInit {
        term: String,
        rows: u16,
        cols: u16,
        environment: HashMap<String, String>,
    },
    TerminalDestroy,
    MetadataUpdate(MetadataPatch),
}

impl SessionAction {
    /// Stable name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SessionAction::AuthSuccess { .. } => "AUTH_SUCCESS",
            SessionAction::AuthFailure { .. } => "AUTH_FAILURE",
            SessionAction::AuthClear => "AUTH_CLEAR",
            SessionAction::ConnectionStart { .. } => "CONNECTION_START",
            SessionAction::ConnectionEstablished { .. } => "CONNECTION_ESTABLISHED",
            SessionAction::ConnectionError { .. } => "CONNECTION_ERROR",
            SessionAction::ConnectionClosed => "CONNECTION_CLOSED",
            SessionAction::TerminalResize { .. } => "TERMINAL_RESIZE",
            SessionAction::TerminalSetEnv { .. } => "TERMINAL_SET_ENV",
            SessionAction::TerminalInit { .. } => "TERMINAL_INIT",
            SessionAction::TerminalDestroy => "TERMINAL_DESTROY",
            SessionAction::MetadataUpdate(_) => "METADATA_UPDATE",
        }
    }
}

/// Apply `action` to `state`, producing the next state.
///
/// Returns `None` for an illegal transition (the state is left untouched by
/// the caller) and `Some(next)` otherwise. A `MetadataUpdate` that changes
/// nothing returns the state unchanged, `updated_at` included, so identical
/// patches are idempotent.
pub fn reduce(state: &Session, action: &SessionAction) -> Option<Session> {
    let mut next = state.clone();

    match action {
        SessionAction::AuthSuccess { username, method } => {
            next.auth.status = AuthStatus::Authenticated;
            next.auth.username = Some(username.clone());
            next.auth.method = Some(method.clone());
            next.auth.error_message = None;
        }
        SessionAction::AuthFailure { error, method } => {
            next.auth.status = AuthStatus::Failed;
            next.auth.error_message = Some(error.clone());
            next.auth.method = method.clone();
        }
        SessionAction::AuthClear => {
            next.auth = Default::default();
        }
        SessionAction::ConnectionStart { host, port } => {
            next.connection.status = ConnectionStatus::Connecting;
            next.connection.host = Some(host.clone());
            next.connection.port = Some(*port);
            next.connection.connection_id = None;
            next.connection.error_message = None;
            // Dialing implies an authentication attempt is underway.
            if next.auth.status == AuthStatus::Idle {
                next.auth.status = AuthStatus::Pending;
            }
        }
        SessionAction::ConnectionEstablished { connection_id } => {
            // connected requires an authenticated session
            if state.auth.status != AuthStatus::Authenticated {
                return None;
            }
            if state.connection.status == ConnectionStatus::Connected {
                return None;
            }
            next.connection.status = ConnectionStatus::Connected;
            next.connection.connection_id = Some(connection_id.clone());
            next.connection.error_message = None;
        }
        SessionAction::ConnectionError { error } => {
            next.connection.status = ConnectionStatus::Error;
            next.connection.connection_id = None;
            next.connection.error_message = Some(error.clone());
        }
        SessionAction::ConnectionClosed => {
            next.connection.status = ConnectionStatus::Closed;
            next.connection.connection_id = None;
        }
        SessionAction::TerminalResize { rows, cols } => {
            if *rows == 0 || *cols == 0 {
                return None;
            }
            next.terminal.rows = *rows;
            next.terminal.cols = *cols;
        }
        SessionAction::TerminalSetEnv { environment } => {
            next.terminal.environment = environment.clone();
        }
        SessionAction::TerminalInit {
            term,
            rows,
            cols,
            environment,
        } => {
            if *rows == 0 || *cols == 0 {
                return None;
            }
            next.terminal.term = term.clone();
            next.terminal.rows = *rows;
            next.terminal.cols = *cols;
            next.terminal.environment = environment.clone();
        }
        SessionAction::TerminalDestroy => {
            next.terminal = TerminalState::default();
        }
        SessionAction::MetadataUpdate(patch) => {
            if let Some(user_id) = &patch.user_id {
                next.metadata.user_id = Some(user_id.clone());
            }
            if let Some(client_ip) = &patch.client_ip {
                next.metadata.client_ip = Some(client_ip.clone());
            }
            if let Some(user_agent) = &patch.user_agent {
                next.metadata.user_agent = Some(user_agent.clone());
            }
            if next == *state {
                // no-op patch: idempotent, updated_at untouched
                return Some(next);
            }
        }
    }

    next.metadata.updated_at = Utc::now();
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("s1".to_string())
    }

    #[test]
    fn auth_success_sets_identity() {
        let state = session();
        let next = reduce(
            &state,
            &SessionAction::AuthSuccess {
                username: "alice".into(),
                method: "password".into(),
            },
        )
        .unwrap();
        assert_eq!(next.auth.status, AuthStatus::Authenticated);
        assert_eq!(next.auth.username.as_deref(), Some("alice"));
        assert!(next.metadata.updated_at >= state.metadata.updated_at);
    }

    #[test]
    fn established_requires_authenticated() {
        let state = session();
        assert!(reduce(
            &state,
            &SessionAction::ConnectionEstablished {
                connection_id: "c1".into()
            },
        )
        .is_none());

        let authed = reduce(
            &state,
            &SessionAction::AuthSuccess {
                username: "alice".into(),
                method: "password".into(),
            },
        )
        .unwrap();
        let connected = reduce(
            &authed,
            &SessionAction::ConnectionEstablished {
                connection_id: "c1".into(),
            },
        )
        .unwrap();
        assert_eq!(connected.connection.status, ConnectionStatus::Connected);
        assert_eq!(connected.connection.connection_id.as_deref(), Some("c1"));
    }

    #[test]
    fn zero_geometry_is_rejected() {
        let state = session();
        assert!(reduce(&state, &SessionAction::TerminalResize { rows: 0, cols: 80 }).is_none());
        assert!(reduce(&state, &SessionAction::TerminalResize { rows: 24, cols: 0 }).is_none());
        let next = reduce(&state, &SessionAction::TerminalResize { rows: 50, cols: 132 }).unwrap();
        assert_eq!((next.terminal.rows, next.terminal.cols), (50, 132));
    }

    #[test]
    fn metadata_update_is_idempotent() {
        let state = session();
        let patch = MetadataPatch {
            client_ip: Some("203.0.113.9".into()),
            ..Default::default()
        };
        let once = reduce(&state, &SessionAction::MetadataUpdate(patch.clone())).unwrap();
        let twice = reduce(&once, &SessionAction::MetadataUpdate(patch)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn connection_start_marks_auth_pending() {
        let state = session();
        let next = reduce(
            &state,
            &SessionAction::ConnectionStart {
                host: "10.0.0.5".into(),
                port: 22,
            },
        )
        .unwrap();
        assert_eq!(next.auth.status, AuthStatus::Pending);
        assert_eq!(next.connection.status, ConnectionStatus::Connecting);
    }

    #[test]
    fn close_clears_connection_id() {
        let mut state = session();
        state.auth.status = AuthStatus::Authenticated;
        let connected = reduce(
            &state,
            &SessionAction::ConnectionEstablished {
                connection_id: "c9".into(),
            },
        )
        .unwrap();
        let closed = reduce(&connected, &SessionAction::ConnectionClosed).unwrap();
        assert_eq!(closed.connection.status, ConnectionStatus::Closed);
        assert!(closed.connection.connection_id.is_none());
    }
}
