//! Structured gateway logging
//!
//! Emits structured events through `tracing` and, when configured, a
//! buffered syslog sink. High-volume targets are down-sampled to a
//! configured rate and hard-capped by a per-minute budget; drops are
//! counted, never silently lost twice.

mod syslog;

pub use syslog::{SyslogHandle, SyslogSink};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::LoggingSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Failure,
}

/// One structured event. Build with the fluent setters and hand to
/// `StructuredLogger::emit`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub event: String,
    pub subsystem: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LogStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_out: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogEvent {
    pub fn new(level: LogLevel, event: impl Into<String>, subsystem: &'static str) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            event: event.into(),
            subsystem,
            connection_id: None,
            session_id: None,
            status: None,
            duration_ms: None,
            bytes_in: None,
            bytes_out: None,
            reason: None,
            data: None,
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn status(mut self, status: LogStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn bytes(mut self, bytes_in: u64, bytes_out: u64) -> Self {
        self.bytes_in = Some(bytes_in);
        self.bytes_out = Some(bytes_out);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Per-target (event, subsystem) sampling window.
struct TargetWindow {
    window_start: Instant,
    emitted_this_second: u32,
    emitted_this_minute: u32,
    minute_start: Instant,
}

/// Counters exposed for observability.
#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggerStats {
    pub emitted: u64,
    pub sampled_out: u64,
    pub rate_limited: u64,
}

pub struct StructuredLogger {
    sample_rate: u32,
    rate_limit_per_minute: u32,
    windows: Mutex<HashMap<(String, &'static str), TargetWindow>>,
    emitted: AtomicU64,
    sampled_out: AtomicU64,
    rate_limited: AtomicU64,
    syslog: Option<SyslogHandle>,
}

impl StructuredLogger {
    pub fn new(section: &LoggingSection, syslog: Option<SyslogHandle>) -> Self {
        Self {
            sample_rate: section.sample_rate.max(1),
            rate_limit_per_minute: section.rate_limit_per_minute.max(1),
            windows: Mutex::new(HashMap::new()),
            emitted: AtomicU64::new(0),
            sampled_out: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            syslog,
        }
    }

    /// Emit one event, subject to sampling and the per-target budget.
    pub fn emit(&self, event: LogEvent) {
        if !self.admit(&event) {
            return;
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);

        let json = serde_json::to_string(&event).unwrap_or_else(|e| {
            format!("{{\"event\":\"serialize_failed\",\"error\":\"{e}\"}}")
        });

        match event.level {
            LogLevel::Debug => debug!(target: "webssh2::audit", "{json}"),
            LogLevel::Info => info!(target: "webssh2::audit", "{json}"),
            LogLevel::Warn => warn!(target: "webssh2::audit", "{json}"),
            LogLevel::Error => error!(target: "webssh2::audit", "{json}"),
        }

        if let Some(syslog) = &self.syslog {
            syslog.push(json);
        }
    }

    fn admit(&self, event: &LogEvent) -> bool {
        let key = (event.event.clone(), event.subsystem);
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(key).or_insert(TargetWindow {
            window_start: now,
            emitted_this_second: 0,
            emitted_this_minute: 0,
            minute_start: now,
        });

        if now.duration_since(window.minute_start).as_secs() >= 60 {
            window.minute_start = now;
            window.emitted_this_minute = 0;
        }
        if now.duration_since(window.window_start).as_secs() >= 1 {
            window.window_start = now;
            window.emitted_this_second = 0;
        }

        if window.emitted_this_minute >= self.rate_limit_per_minute {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if window.emitted_this_second >= self.sample_rate {
            self.sampled_out.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        window.emitted_this_second += 1;
        window.emitted_this_minute += 1;
        true
    }

    pub fn stats(&self) -> LoggerStats {
        LoggerStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            sampled_out: self.sampled_out.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger(sample_rate: u32, per_minute: u32) -> StructuredLogger {
        let section = LoggingSection {
            sample_rate,
            rate_limit_per_minute: per_minute,
            syslog: None,
        };
        StructuredLogger::new(&section, None)
    }

    fn event(name: &str) -> LogEvent {
        LogEvent::new(LogLevel::Info, name, "test")
    }

    #[test]
    fn sampling_caps_per_second_volume() {
        let logger = logger(3, 1000);
        for _ in 0..10 {
            logger.emit(event("busy"));
        }
        let stats = logger.stats();
        assert_eq!(stats.emitted, 3);
        assert_eq!(stats.sampled_out, 7);
    }

    #[test]
    fn rate_limit_is_per_target() {
        let logger = logger(100, 2);
        for _ in 0..5 {
            logger.emit(event("a"));
        }
        logger.emit(event("b"));
        let stats = logger.stats();
        // "a" capped at 2, "b" unaffected
        assert_eq!(stats.emitted, 3);
        assert_eq!(stats.rate_limited, 3);
    }

    #[test]
    fn builder_fields_serialize() {
        let event = LogEvent::new(LogLevel::Info, "connect", "ssh")
            .session("s1")
            .connection("c1")
            .status(LogStatus::Success)
            .duration_ms(42)
            .bytes(10, 20)
            .reason("test");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "connect");
        assert_eq!(json["status"], "success");
        assert_eq!(json["durationMs"], 42);
        assert_eq!(json["bytesIn"], 10);
        assert_eq!(json["sessionId"], "s1");
    }
}
