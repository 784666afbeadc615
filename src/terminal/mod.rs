//! Terminal & Buffer Service
//!
//! Tracks terminal geometry and environment per session and, when recording
//! is enabled, keeps a bounded in-memory ring of outbound `(timestamp,
//! bytes)` entries. The ring overwrites its oldest entry when full.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

/// Default ring capacity in entries.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// One captured chunk of outbound terminal data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    pub timestamp: DateTime<Utc>,
    pub bytes: Bytes,
}

/// Bounded ring of recorded terminal output.
pub struct RecordBuffer {
    entries: RwLock<VecDeque<RecordEntry>>,
    capacity: usize,
    /// Total entries ever written, including overwritten ones.
    total: AtomicU64,
}

impl RecordBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            total: AtomicU64::new(0),
        }
    }

    pub async fn append(&self, bytes: Bytes) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(RecordEntry {
            timestamp: Utc::now(),
            bytes,
        });
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Take everything currently buffered, oldest first.
    pub async fn drain(&self) -> Vec<RecordEntry> {
        let mut entries = self.entries.write().await;
        entries.drain(..).collect()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_entries(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Geometry and environment for one session's terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalProfile {
    pub term: String,
    pub rows: u16,
    pub cols: u16,
    pub environment: HashMap<String, String>,
    pub cwd: Option<String>,
}

/// Per-session terminal state plus the optional recording ring.
pub struct TerminalService {
    profiles: DashMap<String, TerminalProfile>,
    buffers: DashMap<String, Arc<RecordBuffer>>,
    buffer_capacity: usize,
    recording_enabled: bool,
}

impl TerminalService {
    pub fn new(recording_enabled: bool, buffer_capacity: usize) -> Self {
        Self {
            profiles: DashMap::new(),
            buffers: DashMap::new(),
            buffer_capacity,
            recording_enabled,
        }
    }

    pub fn init(
        &self,
        session_id: &str,
        term: String,
        rows: u16,
        cols: u16,
        environment: HashMap<String, String>,
    ) {
        self.profiles.insert(
            session_id.to_string(),
            TerminalProfile {
                term,
                rows,
                cols,
                environment,
                cwd: None,
            },
        );
    }

    pub fn resize(&self, session_id: &str, rows: u16, cols: u16) {
        if let Some(mut profile) = self.profiles.get_mut(session_id) {
            profile.rows = rows;
            profile.cols = cols;
        }
    }

    pub fn set_cwd(&self, session_id: &str, cwd: Option<String>) {
        if let Some(mut profile) = self.profiles.get_mut(session_id) {
            profile.cwd = cwd;
        }
    }

    pub fn profile(&self, session_id: &str) -> Option<TerminalProfile> {
        self.profiles.get(session_id).map(|p| p.clone())
    }

    /// Capture outbound bytes for `session_id` when recording is on.
    pub async fn record(&self, session_id: &str, bytes: &[u8]) {
        if !self.recording_enabled {
            return;
        }
        let buffer = self
            .buffers
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(RecordBuffer::new(self.buffer_capacity)))
            .value()
            .clone();
        buffer.append(Bytes::copy_from_slice(bytes)).await;
    }

    pub fn recording_enabled(&self) -> bool {
        self.recording_enabled
    }

    /// Flush the buffered entries for the recorder, oldest first.
    pub async fn flush_recording(&self, session_id: &str) -> Vec<RecordEntry> {
        match self.buffers.get(session_id).map(|b| b.value().clone()) {
            Some(buffer) => buffer.drain().await,
            None => Vec::new(),
        }
    }

    /// Drop all terminal state for a destroyed session.
    pub async fn destroy(&self, session_id: &str) {
        self.profiles.remove(session_id);
        if let Some((_, buffer)) = self.buffers.remove(session_id) {
            buffer.clear().await;
            debug!(session_id, "terminal record buffer cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_overwrites_oldest_when_full() {
        let buffer = RecordBuffer::new(3);
        for i in 0..5u8 {
            buffer.append(Bytes::from(vec![i])).await;
        }
        assert_eq!(buffer.len().await, 3);
        assert_eq!(buffer.total_entries(), 5);

        let entries = buffer.drain().await;
        let payloads: Vec<u8> = entries.iter().map(|e| e.bytes[0]).collect();
        assert_eq!(payloads, vec![2, 3, 4]);
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn record_is_noop_when_disabled() {
        let service = TerminalService::new(false, 10);
        service.record("s1", b"data").await;
        assert!(service.flush_recording("s1").await.is_empty());
    }

    #[tokio::test]
    async fn record_and_flush_when_enabled() {
        let service = TerminalService::new(true, 10);
        service.record("s1", b"one").await;
        service.record("s1", b"two").await;

        let entries = service.flush_recording("s1").await;
        assert_eq!(entries.len(), 2);
        assert_eq!(&entries[0].bytes[..], b"one");
        assert!(entries[0].timestamp <= entries[1].timestamp);

        // flush drained the ring
        assert!(service.flush_recording("s1").await.is_empty());
    }

    #[tokio::test]
    async fn destroy_clears_profile_and_buffer() {
        let service = TerminalService::new(true, 10);
        service.init("s1", "xterm".into(), 24, 80, HashMap::new());
        service.record("s1", b"data").await;

        service.destroy("s1").await;
        assert!(service.profile("s1").is_none());
        assert!(service.flush_recording("s1").await.is_empty());
    }

    #[tokio::test]
    async fn resize_updates_profile() {
        let service = TerminalService::new(false, 10);
        service.init("s1", "xterm-256color".into(), 24, 80, HashMap::new());
        service.resize("s1", 40, 120);
        let profile = service.profile("s1").unwrap();
        assert_eq!((profile.rows, profile.cols), (40, 120));
        assert_eq!(profile.term, "xterm-256color");
    }
}
