//! HTTP session link
//!
//! The routing layer (out of scope here) authenticates the browser and
//! deposits any HTTP-carried SSH credentials into this store, keyed by the
//! session cookie value. The WebSocket endpoint binds an upgrading socket
//! to its HTTP session through the same cookie. Clearing credentials is one
//! shared effect behind both the clear-credentials and force-reconnect
//! routes.

use dashmap::DashMap;
use zeroize::Zeroizing;

/// Credentials deposited by the routing layer (HTTP Basic Auth or POST).
#[derive(Debug, Clone, Default)]
pub struct SessionCredentials {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub term: Option<String>,
}

/// Presentation overrides carried by POST form fields.
#[derive(Debug, Clone, Default)]
pub struct HeaderOverride {
    pub text: Option<String>,
    pub background: Option<String>,
    pub color: Option<String>,
}

/// One cookie-identified HTTP session.
#[derive(Debug, Clone, Default)]
pub struct HttpSession {
    pub ssh_credentials: Option<SessionCredentials>,
    pub used_basic_auth: bool,
    /// Core session bound to this HTTP session, once a socket connects.
    pub core_session_id: Option<String>,
    pub header: HeaderOverride,
    pub allow_replay_override: Option<bool>,
}

/// Cookie-keyed session registry shared with the routing layer.
#[derive(Default)]
pub struct HttpSessionStore {
    sessions: DashMap<String, HttpSession>,
}

impl HttpSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routing-layer entry point: store credentials for a cookie.
    pub fn deposit(&self, sid: &str, credentials: SessionCredentials, used_basic_auth: bool) {
        let mut entry = self.sessions.entry(sid.to_string()).or_default();
        entry.ssh_credentials = Some(credentials);
        entry.used_basic_auth = used_basic_auth;
    }

    pub fn set_header(&self, sid: &str, header: HeaderOverride) {
        self.sessions.entry(sid.to_string()).or_default().header = header;
    }

    pub fn get(&self, sid: &str) -> Option<HttpSession> {
        self.sessions.get(sid).map(|s| s.clone())
    }

    /// Bind the core session created for this cookie's socket.
    pub fn bind_core_session(&self, sid: &str, core_session_id: &str) {
        self.sessions
            .entry(sid.to_string())
            .or_default()
            .core_session_id = Some(core_session_id.to_string());
    }

    /// Shared effect of the clear-credentials and force-reconnect routes.
    /// Passwords zeroize on drop.
    pub fn clear_credentials(&self, sid: &str) {
        if let Some(mut entry) = self.sessions.get_mut(sid) {
            entry.ssh_credentials = None;
            entry.used_basic_auth = false;
        }
    }

    pub fn remove(&self, sid: &str) {
        self.sessions.remove(sid);
    }
}

/// Extract a cookie value from a `Cookie:` header.
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key.trim() == name {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deposit_and_clear() {
        let store = HttpSessionStore::new();
        store.deposit(
            "sid-1",
            SessionCredentials {
                host: Some("10.0.0.5".into()),
                port: Some(22),
                username: Some("alice".into()),
                password: Some(Zeroizing::new("s3cret".into())),
                term: None,
            },
            true,
        );

        let session = store.get("sid-1").unwrap();
        assert!(session.used_basic_auth);
        assert_eq!(
            session
                .ssh_credentials
                .as_ref()
                .and_then(|c| c.username.as_deref()),
            Some("alice")
        );

        store.clear_credentials("sid-1");
        let session = store.get("sid-1").unwrap();
        assert!(session.ssh_credentials.is_none());
        assert!(!session.used_basic_auth);
    }

    #[test]
    fn clear_is_idempotent_for_unknown_sid() {
        let store = HttpSessionStore::new();
        store.clear_credentials("missing");
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn cookie_parsing() {
        let header = "theme=dark; webssh2.sid=abc123; other=1";
        assert_eq!(cookie_value(header, "webssh2.sid").as_deref(), Some("abc123"));
        assert_eq!(cookie_value(header, "missing"), None);
        assert_eq!(cookie_value("webssh2.sid=x", "webssh2.sid").as_deref(), Some("x"));
    }
}
