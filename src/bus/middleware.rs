//! Bus middleware chain
//!
//! Composable hooks around each publish: logging, per-type rate limiting,
//! payload deduplication, and circuit breaking. Middleware never blocks;
//! every decision is a short synchronous computation.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::event::{EventKind, EventPriority, GatewayEvent};

/// Outcome of running an event through the pre-publish hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishDecision {
    Continue,
    /// Dropped without error (dedup, sampling); the caller sees success.
    Drop(&'static str),
    /// Rejected; the caller sees a publish failure.
    Reject(&'static str),
}

pub trait BusMiddleware: Send + Sync {
    /// Runs before the event is enqueued.
    fn on_publish(&self, _event: &GatewayEvent, _priority: EventPriority) -> PublishDecision {
        PublishDecision::Continue
    }

    /// Runs after the drain loop has dispatched the event to all handlers.
    /// `failures` counts handlers that returned an error this round.
    fn on_processed(&self, _event: &GatewayEvent, _failures: u32) {}
}

/// Simple token bucket. Shared by the bus rate-limit middleware and the
/// Socket Bridge per-message budgets.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    /// Take one token; false means over budget.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Debug-logs every publish.
pub struct LoggingMiddleware;

impl BusMiddleware for LoggingMiddleware {
    fn on_publish(&self, event: &GatewayEvent, priority: EventPriority) -> PublishDecision {
        debug!(event = event.kind().as_str(), ?priority, "bus publish");
        PublishDecision::Continue
    }
}

/// Per event-type token bucket.
pub struct RateLimitMiddleware {
    capacity: u32,
    refill_per_sec: u32,
    buckets: Mutex<HashMap<EventKind, TokenBucket>>,
}

impl RateLimitMiddleware {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity,
            refill_per_sec,
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl BusMiddleware for RateLimitMiddleware {
    fn on_publish(&self, event: &GatewayEvent, _priority: EventPriority) -> PublishDecision {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(event.kind())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_per_sec));
        if bucket.try_acquire() {
            PublishDecision::Continue
        } else {
            PublishDecision::Reject("rate_limited")
        }
    }
}

/// Drops events whose `(type, payload)` hash was seen inside the window.
pub struct DedupMiddleware {
    window: Duration,
    seen: Mutex<HashMap<u64, Instant>>,
}

impl DedupMiddleware {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn fingerprint(event: &GatewayEvent) -> u64 {
        let payload = serde_json::to_string(event).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        event.kind().hash(&mut hasher);
        payload.hash(&mut hasher);
        hasher.finish()
    }
}

impl BusMiddleware for DedupMiddleware {
    fn on_publish(&self, event: &GatewayEvent, _priority: EventPriority) -> PublishDecision {
        let fingerprint = Self::fingerprint(event);
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now.duration_since(*at) < self.window);
        if seen.insert(fingerprint, now).is_some() {
            PublishDecision::Drop("duplicate")
        } else {
            PublishDecision::Continue
        }
    }
}

struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Opens per event-type after N consecutive failing rounds; publishes are
/// rejected until the cool-down passes.
pub struct CircuitBreakerMiddleware {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<HashMap<EventKind, BreakerState>>,
}

impl CircuitBreakerMiddleware {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_open(&self, kind: EventKind) -> bool {
        let state = self.state.lock();
        state
            .get(&kind)
            .and_then(|s| s.open_until)
            .is_some_and(|until| Instant::now() < until)
    }
}

impl BusMiddleware for CircuitBreakerMiddleware {
    fn on_publish(&self, event: &GatewayEvent, _priority: EventPriority) -> PublishDecision {
        let kind = event.kind();
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(&kind) {
            if let Some(until) = entry.open_until {
                if Instant::now() < until {
                    return PublishDecision::Reject("circuit_open");
                }
                // cool-down elapsed, half-open
                entry.open_until = None;
                entry.consecutive_failures = 0;
            }
        }
        PublishDecision::Continue
    }

    fn on_processed(&self, event: &GatewayEvent, failures: u32) {
        let kind = event.kind();
        let mut state = self.state.lock();
        let entry = state.entry(kind).or_insert(BreakerState {
            consecutive_failures: 0,
            open_until: None,
        });
        if failures == 0 {
            entry.consecutive_failures = 0;
            return;
        }
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.threshold {
            warn!(
                event = kind.as_str(),
                failures = entry.consecutive_failures,
                "circuit breaker opened"
            );
            entry.open_until = Some(Instant::now() + self.cooldown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> GatewayEvent {
        GatewayEvent::SessionCreated {
            session_id: "s".into(),
        }
    }

    #[test]
    fn token_bucket_refills() {
        let mut bucket = TokenBucket::new(2, 1000);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn dedup_drops_within_window() {
        let dedup = DedupMiddleware::new(Duration::from_secs(60));
        assert_eq!(
            dedup.on_publish(&event(), EventPriority::Normal),
            PublishDecision::Continue
        );
        assert_eq!(
            dedup.on_publish(&event(), EventPriority::Normal),
            PublishDecision::Drop("duplicate")
        );
        // different payload passes
        let other = GatewayEvent::SessionCreated {
            session_id: "other".into(),
        };
        assert_eq!(
            dedup.on_publish(&other, EventPriority::Normal),
            PublishDecision::Continue
        );
    }

    #[test]
    fn breaker_opens_after_threshold_and_recovers() {
        let breaker = CircuitBreakerMiddleware::new(2, Duration::from_millis(10));
        breaker.on_processed(&event(), 1);
        assert!(!breaker.is_open(EventKind::SessionCreated));
        breaker.on_processed(&event(), 1);
        assert!(breaker.is_open(EventKind::SessionCreated));
        assert_eq!(
            breaker.on_publish(&event(), EventPriority::Normal),
            PublishDecision::Reject("circuit_open")
        );

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(
            breaker.on_publish(&event(), EventPriority::Normal),
            PublishDecision::Continue
        );
    }

    #[test]
    fn breaker_resets_on_success() {
        let breaker = CircuitBreakerMiddleware::new(2, Duration::from_secs(60));
        breaker.on_processed(&event(), 1);
        breaker.on_processed(&event(), 0);
        breaker.on_processed(&event(), 1);
        assert!(!breaker.is_open(EventKind::SessionCreated));
    }
}
