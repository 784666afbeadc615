//! Session state tree
//!
//! The Session is the single per-user state record owned by the
//! `SessionStore`. It is only ever mutated through dispatched actions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default terminal geometry for a fresh session.
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Idle,
    Pending,
    Authenticated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Error,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub status: AuthStatus,
    pub username: Option<String>,
    pub method: Option<String>,
    pub error_message: Option<String>,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            status: AuthStatus::Idle,
            username: None,
            method: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub connection_id: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub error_message: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            connection_id: None,
            host: None,
            port: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalState {
    pub term: String,
    pub rows: u16,
    pub cols: u16,
    pub environment: HashMap<String, String>,
    pub cwd: Option<String>,
}

impl Default for TerminalState {
    fn default() -> Self {
        Self {
            term: "xterm-color".to_string(),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            environment: HashMap::new(),
            cwd: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl SessionMetadata {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            user_id: None,
            client_ip: None,
            user_agent: None,
        }
    }
}

/// The full per-session state tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub auth: AuthState,
    pub connection: ConnectionState,
    pub terminal: TerminalState,
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn new(id: String) -> Self {
        Self {
            id,
            auth: AuthState::default(),
            connection: ConnectionState::default(),
            terminal: TerminalState::default(),
            metadata: SessionMetadata::new(Utc::now()),
        }
    }
}
