//! Connection Pool
//!
//! Process-wide registry of live transport connections, indexed by
//! connection id and by session id. Both indices are updated under one lock
//! so a reader never observes a half-registered connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Ssh,
    Telnet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Handle to the underlying transport, held by the pooled connection so the
/// pool can end clients it evicts.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Politely end the client. Close failures are ignored by callers.
    async fn end(&self);
}

/// A live transport connection owned by the pool.
pub struct PooledConnection {
    pub id: String,
    pub session_id: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
    status: Mutex<TransportStatus>,
    /// Unix millis of the last adapter I/O.
    last_activity: AtomicI64,
    handle: Arc<dyn TransportHandle>,
}

impl PooledConnection {
    pub fn new(
        id: String,
        session_id: String,
        protocol: Protocol,
        host: String,
        port: u16,
        username: Option<String>,
        handle: Arc<dyn TransportHandle>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_id,
            protocol,
            host,
            port,
            username,
            created_at: now,
            status: Mutex::new(TransportStatus::Connected),
            last_activity: AtomicI64::new(now.timestamp_millis()),
            handle,
        }
    }

    pub fn status(&self) -> TransportStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: TransportStatus) {
        *self.status.lock() = status;
    }

    /// Record adapter I/O on this connection.
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let millis = self.last_activity.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn transport(&self) -> Arc<dyn TransportHandle> {
        self.handle.clone()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection id {0} already pooled")]
    DuplicateId(String),
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, Arc<PooledConnection>>,
    by_session: HashMap<String, HashSet<String>>,
}

/// The process-wide connection registry.
#[derive(Default)]
pub struct ConnectionPool {
    indices: Mutex<Indices>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<PooledConnection>) -> Result<(), PoolError> {
        let mut indices = self.indices.lock();
        if indices.by_id.contains_key(&conn.id) {
            return Err(PoolError::DuplicateId(conn.id.clone()));
        }
        indices
            .by_session
            .entry(conn.session_id.clone())
            .or_default()
            .insert(conn.id.clone());
        debug!(connection_id = %conn.id, session_id = %conn.session_id, "connection pooled");
        indices.by_id.insert(conn.id.clone(), conn);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<PooledConnection>> {
        self.indices.lock().by_id.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<PooledConnection>> {
        let mut indices = self.indices.lock();
        let conn = indices.by_id.remove(id)?;
        if let Some(set) = indices.by_session.get_mut(&conn.session_id) {
            set.remove(id);
            if set.is_empty() {
                indices.by_session.remove(&conn.session_id);
            }
        }
        debug!(connection_id = %id, "connection removed from pool");
        Some(conn)
    }

    pub fn get_by_session(&self, session_id: &str) -> Vec<Arc<PooledConnection>> {
        let indices = self.indices.lock();
        indices
            .by_session
            .get(session_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| indices.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Evict everything, politely ending each client (fire-and-forget).
    pub fn clear(&self) {
        let drained: Vec<Arc<PooledConnection>> = {
            let mut indices = self.indices.lock();
            indices.by_session.clear();
            indices.by_id.drain().map(|(_, c)| c).collect()
        };

        if !drained.is_empty() {
            info!(count = drained.len(), "clearing connection pool");
        }
        for conn in drained {
            conn.set_status(TransportStatus::Disconnected);
            let handle = conn.transport();
            tokio::spawn(async move { handle.end().await });
        }
    }

    pub fn len(&self) -> usize {
        self.indices.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.lock().by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct StubTransport(Arc<AtomicUsize>);

    #[async_trait]
    impl TransportHandle for StubTransport {
        async fn end(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn conn(id: &str, session_id: &str, ends: Arc<AtomicUsize>) -> Arc<PooledConnection> {
        Arc::new(PooledConnection::new(
            id.to_string(),
            session_id.to_string(),
            Protocol::Ssh,
            "10.0.0.5".to_string(),
            22,
            Some("alice".to_string()),
            Arc::new(StubTransport(ends)),
        ))
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let pool = ConnectionPool::new();
        let ends = Arc::new(AtomicUsize::new(0));
        pool.add(conn("c1", "s1", ends.clone())).unwrap();
        assert_eq!(
            pool.add(conn("c1", "s2", ends)).unwrap_err(),
            PoolError::DuplicateId("c1".into())
        );
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn session_index_tracks_membership() {
        let pool = ConnectionPool::new();
        let ends = Arc::new(AtomicUsize::new(0));
        pool.add(conn("c1", "s1", ends.clone())).unwrap();
        pool.add(conn("c2", "s1", ends.clone())).unwrap();
        pool.add(conn("c3", "s2", ends)).unwrap();

        let mut ids: Vec<String> = pool
            .get_by_session("s1")
            .iter()
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);

        pool.remove("c1");
        assert_eq!(pool.get_by_session("s1").len(), 1);
        assert!(pool.get("c1").is_none());

        pool.remove("c2");
        assert!(pool.get_by_session("s1").is_empty());
    }

    #[tokio::test]
    async fn clear_ends_every_transport() {
        let pool = ConnectionPool::new();
        let ends = Arc::new(AtomicUsize::new(0));
        pool.add(conn("c1", "s1", ends.clone())).unwrap();
        pool.add(conn("c2", "s2", ends.clone())).unwrap();

        pool.clear();
        assert!(pool.is_empty());

        // end() runs on spawned tasks
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(ends.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn touch_advances_last_activity() {
        let ends = Arc::new(AtomicUsize::new(0));
        let c = conn("c1", "s1", ends);
        let before = c.last_activity();
        std::thread::sleep(std::time::Duration::from_millis(5));
        c.touch();
        assert!(c.last_activity() >= before);
        assert!(c.last_activity() >= c.created_at);
    }
}
