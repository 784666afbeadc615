//! Bus event types
//!
//! Events are a closed tagged set grouped into dotted families
//! (`auth.*`, `connection.*`, `terminal.*`, `session.*`, `system.*`,
//! `recording.*`, `replay.*`), each with a typed payload.

use serde::Serialize;

/// Drain order: `Critical` jumps the queue head, the rest sort descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Discriminant used for subscriptions and per-type middleware state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AuthRequested,
    AuthSucceeded,
    AuthFailed,
    ConnectionEstablished,
    ConnectionClosed,
    ConnectionErrored,
    TerminalResized,
    TerminalDestroyed,
    SessionCreated,
    SessionDestroyed,
    SystemError,
    SystemShutdown,
    RecordingStarted,
    RecordingStopped,
    ReplayRequested,
}

impl EventKind {
    /// Wire/log name, `family.event`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AuthRequested => "auth.requested",
            EventKind::AuthSucceeded => "auth.succeeded",
            EventKind::AuthFailed => "auth.failed",
            EventKind::ConnectionEstablished => "connection.established",
            EventKind::ConnectionClosed => "connection.closed",
            EventKind::ConnectionErrored => "connection.errored",
            EventKind::TerminalResized => "terminal.resized",
            EventKind::TerminalDestroyed => "terminal.destroyed",
            EventKind::SessionCreated => "session.created",
            EventKind::SessionDestroyed => "session.destroyed",
            EventKind::SystemError => "system.error",
            EventKind::SystemShutdown => "system.shutdown",
            EventKind::RecordingStarted => "recording.started",
            EventKind::RecordingStopped => "recording.stopped",
            EventKind::ReplayRequested => "replay.requested",
        }
    }
}

/// A domain event published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GatewayEvent {
    AuthRequested {
        session_id: String,
    },
    AuthSucceeded {
        session_id: String,
        username: String,
        method: String,
    },
    AuthFailed {
        session_id: String,
        reason: String,
    },
    ConnectionEstablished {
        session_id: String,
        connection_id: String,
        host: String,
        port: u16,
    },
    ConnectionClosed {
        session_id: String,
        connection_id: String,
    },
    ConnectionErrored {
        session_id: String,
        message: String,
    },
    TerminalResized {
        session_id: String,
        rows: u16,
        cols: u16,
    },
    TerminalDestroyed {
        session_id: String,
    },
    SessionCreated {
        session_id: String,
    },
    SessionDestroyed {
        session_id: String,
    },
    SystemError {
        subsystem: String,
        message: String,
        context: Option<String>,
    },
    SystemShutdown,
    RecordingStarted {
        session_id: String,
    },
    RecordingStopped {
        session_id: String,
    },
    ReplayRequested {
        session_id: String,
    },
}

impl GatewayEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GatewayEvent::AuthRequested { .. } => EventKind::AuthRequested,
            GatewayEvent::AuthSucceeded { .. } => EventKind::AuthSucceeded,
            GatewayEvent::AuthFailed { .. } => EventKind::AuthFailed,
            GatewayEvent::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            GatewayEvent::ConnectionClosed { .. } => EventKind::ConnectionClosed,
            GatewayEvent::ConnectionErrored { .. } => EventKind::ConnectionErrored,
            GatewayEvent::TerminalResized { .. } => EventKind::TerminalResized,
            GatewayEvent::TerminalDestroyed { .. } => EventKind::TerminalDestroyed,
            GatewayEvent::SessionCreated { .. } => EventKind::SessionCreated,
            GatewayEvent::SessionDestroyed { .. } => EventKind::SessionDestroyed,
            GatewayEvent::SystemError { .. } => EventKind::SystemError,
            GatewayEvent::SystemShutdown => EventKind::SystemShutdown,
            GatewayEvent::RecordingStarted { .. } => EventKind::RecordingStarted,
            GatewayEvent::RecordingStopped { .. } => EventKind::RecordingStopped,
            GatewayEvent::ReplayRequested { .. } => EventKind::ReplayRequested,
        }
    }

    /// Session the event concerns, when there is one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            GatewayEvent::AuthRequested { session_id }
            | GatewayEvent::AuthSucceeded { session_id, .. }
            | GatewayEvent::AuthFailed { session_id, .. }
            | GatewayEvent::ConnectionEstablished { session_id, .. }
            | GatewayEvent::ConnectionClosed { session_id, .. }
            | GatewayEvent::ConnectionErrored { session_id, .. }
            | GatewayEvent::TerminalResized { session_id, .. }
            | GatewayEvent::TerminalDestroyed { session_id }
            | GatewayEvent::SessionCreated { session_id }
            | GatewayEvent::SessionDestroyed { session_id }
            | GatewayEvent::RecordingStarted { session_id }
            | GatewayEvent::RecordingStopped { session_id }
            | GatewayEvent::ReplayRequested { session_id } => Some(session_id),
            GatewayEvent::SystemError { .. } | GatewayEvent::SystemShutdown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order() {
        assert!(EventPriority::Critical > EventPriority::High);
        assert!(EventPriority::High > EventPriority::Normal);
        assert!(EventPriority::Normal > EventPriority::Low);
    }

    #[test]
    fn kind_names_use_dotted_families() {
        assert_eq!(EventKind::AuthFailed.as_str(), "auth.failed");
        assert_eq!(EventKind::SystemError.as_str(), "system.error");
        assert_eq!(
            GatewayEvent::SessionCreated {
                session_id: "s".into()
            }
            .kind()
            .as_str(),
            "session.created"
        );
    }
}
