//! Session Store
//!
//! Single source of truth for per-session state. Mutations happen only via
//! `dispatch`, which applies the pure reducer and notifies subscribers
//! synchronously with the post-state. Dispatch is serialized per session id;
//! a subscriber that dispatches against its own session has the nested
//! action queued and applied after the current one finishes.

mod action;
mod session;

pub use action::{reduce, MetadataPatch, SessionAction};
pub use session::{
    AuthState, AuthStatus, ConnectionState, ConnectionStatus, Session, SessionMetadata,
    TerminalState, DEFAULT_COLS, DEFAULT_ROWS,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

type SubscriberFn = Arc<dyn Fn(&Session) + Send + Sync>;

struct SessionSlot {
    state: Mutex<Session>,
    subscribers: Mutex<Vec<(u64, SubscriberFn)>>,
    /// Actions waiting for the active drain loop (reentrancy + racing
    /// dispatchers land here).
    queue: Mutex<VecDeque<SessionAction>>,
    draining: AtomicBool,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            state: Mutex::new(session),
            subscribers: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }
}

/// Handle returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone)]
pub struct Subscription {
    session_id: String,
    token: u64,
}

/// Process-wide session state store.
pub struct SessionStore {
    sessions: DashMap<String, Arc<SessionSlot>>,
    next_token: AtomicU64,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Create a session, or return the existing one for `id` (idempotent).
    /// A fresh session starts with default 80x24 geometry and an empty
    /// environment.
    pub fn create_session(&self, id: Option<&str>) -> Session {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let slot = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(session_id = %id, "session created");
                Arc::new(SessionSlot::new(Session::new(id.clone())))
            })
            .value()
            .clone();

        let state = slot.state.lock();
        state.clone()
    }

    /// Snapshot of the current state, if the session exists.
    pub fn get_state(&self, id: &str) -> Option<Session> {
        let slot = self.sessions.get(id)?.value().clone();
        let state = slot.state.lock();
        Some(state.clone())
    }

    /// Apply `action` to session `id` and notify subscribers.
    ///
    /// Unknown sessions and illegal transitions are logged at warn level and
    /// otherwise ignored; dispatch never panics and never blocks on itself.
    pub fn dispatch(&self, id: &str, action: SessionAction) {
        let Some(slot) = self.sessions.get(id).map(|e| e.value().clone()) else {
            warn!(session_id = %id, action = action.name(), "dispatch to unknown session");
            return;
        };

        slot.queue.lock().push_back(action);

        if slot.draining.swap(true, Ordering::AcqRel) {
            // Another drain is active for this session (possibly this very
            // thread, called from a subscriber). It will pick the action up.
            return;
        }

        loop {
            let next_action = slot.queue.lock().pop_front();
            let Some(action) = next_action else {
                slot.draining.store(false, Ordering::Release);
                // A dispatcher may have enqueued between the pop and the
                // store above; reclaim the drain if so.
                if slot.queue.lock().is_empty() || slot.draining.swap(true, Ordering::AcqRel) {
                    break;
                }
                continue;
            };

            let post = {
                let mut state = slot.state.lock();
                match reduce(&state, &action) {
                    Some(next) => {
                        *state = next.clone();
                        Some(next)
                    }
                    None => {
                        warn!(
                            session_id = %id,
                            action = action.name(),
                            "illegal transition ignored"
                        );
                        None
                    }
                }
            };

            if let Some(post) = post {
                // Snapshot the subscriber list so callbacks may subscribe or
                // unsubscribe without deadlocking.
                let subscribers: Vec<SubscriberFn> = slot
                    .subscribers
                    .lock()
                    .iter()
                    .map(|(_, f)| f.clone())
                    .collect();
                for subscriber in subscribers {
                    subscriber(&post);
                }
            }
        }
    }

    /// Register a listener for `id`. Fires once per applied action with the
    /// post-state. Callbacks must be non-blocking; long work belongs on the
    /// Event Bus.
    pub fn subscribe<F>(&self, id: &str, f: F) -> Option<Subscription>
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        let slot = self.sessions.get(id)?.value().clone();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        slot.subscribers.lock().push((token, Arc::new(f)));
        Some(Subscription {
            session_id: id.to_string(),
            token,
        })
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(slot) = self
            .sessions
            .get(&subscription.session_id)
            .map(|e| e.value().clone())
        {
            slot.subscribers
                .lock()
                .retain(|(token, _)| *token != subscription.token);
        }
    }

    /// Drop the session and all its subscriptions.
    pub fn remove_session(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            debug!(session_id = %id, "session removed");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove sessions with no live connection that have been idle longer
    /// than `ttl_secs`. Returns the removed ids.
    pub fn sweep_idle(&self, ttl_secs: i64) -> Vec<String> {
        let cutoff = Utc::now() - ChronoDuration::seconds(ttl_secs);
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                let state = entry.value().state.lock();
                state.metadata.updated_at < cutoff
                    && !matches!(
                        state.connection.status,
                        ConnectionStatus::Connected | ConnectionStatus::Connecting
                    )
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in &stale {
            self.remove_session(id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn create_is_idempotent_per_id() {
        let store = SessionStore::new();
        let a = store.create_session(Some("fixed"));
        store.dispatch(
            "fixed",
            SessionAction::ConnectionStart {
                host: "h".into(),
                port: 22,
            },
        );
        let b = store.create_session(Some("fixed"));
        assert_eq!(a.id, b.id);
        // second create returned the mutated session, not a fresh one
        assert_eq!(b.connection.status, ConnectionStatus::Connecting);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn subscribers_see_exactly_one_post_state_per_action() {
        let store = SessionStore::new();
        store.create_session(Some("s"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        store
            .subscribe("s", move |state| {
                seen_clone.lock().push(state.connection.status);
            })
            .unwrap();

        store.dispatch(
            "s",
            SessionAction::ConnectionStart {
                host: "h".into(),
                port: 22,
            },
        );
        store.dispatch("s", SessionAction::ConnectionClosed);

        let statuses = seen.lock().clone();
        assert_eq!(
            statuses,
            vec![ConnectionStatus::Connecting, ConnectionStatus::Closed]
        );
    }

    #[test]
    fn illegal_action_produces_no_notification() {
        let store = SessionStore::new();
        store.create_session(Some("s"));

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        store
            .subscribe("s", move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // not authenticated: ignored
        store.dispatch(
            "s",
            SessionAction::ConnectionEstablished {
                connection_id: "c".into(),
            },
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn nested_dispatch_is_queued_not_recursive() {
        let store = Arc::new(SessionStore::new());
        store.create_session(Some("s"));

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let store_clone = store.clone();
        store
            .subscribe("s", move |state| {
                order_clone.lock().push(state.terminal.rows);
                if state.terminal.rows == 30 {
                    // re-dispatch from inside the notification
                    store_clone.dispatch("s", SessionAction::TerminalResize { rows: 40, cols: 80 });
                }
            })
            .unwrap();

        store.dispatch("s", SessionAction::TerminalResize { rows: 30, cols: 80 });

        let rows = order.lock().clone();
        assert_eq!(rows, vec![30, 40]);
        assert_eq!(store.get_state("s").unwrap().terminal.rows, 40);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let store = SessionStore::new();
        store.create_session(Some("s"));

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let sub = store
            .subscribe("s", move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        store.dispatch("s", SessionAction::TerminalResize { rows: 25, cols: 80 });
        store.unsubscribe(&sub);
        store.dispatch("s", SessionAction::TerminalResize { rows: 26, cols: 80 });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sweep_removes_only_idle_disconnected_sessions() {
        let store = SessionStore::new();
        store.create_session(Some("idle"));
        store.create_session(Some("live"));
        store.dispatch(
            "live",
            SessionAction::ConnectionStart {
                host: "h".into(),
                port: 22,
            },
        );

        // ttl of -1s makes everything stale immediately
        let removed = store.sweep_idle(-1);
        assert_eq!(removed, vec!["idle".to_string()]);
        assert!(store.get_state("live").is_some());
    }
}
