//! Event Bus
//!
//! In-process publish/subscribe with a bounded priority queue, a single
//! cooperative drain task, per-handler priorities, bounded retries, and a
//! composable middleware chain. Publishing never blocks the producer: a full
//! queue is an overflow failure returned to the caller.

pub mod event;
pub mod middleware;

pub use event::{EventKind, EventPriority, GatewayEvent};
pub use middleware::{
    BusMiddleware, CircuitBreakerMiddleware, DedupMiddleware, LoggingMiddleware, PublishDecision,
    RateLimitMiddleware, TokenBucket,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Tunables. Defaults: queue cap 10 000, 3 retries, breaker 5 failures with
/// a 60 s cool-down.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            max_retries: 3,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("event queue full")]
    Overflow,

    #[error("publish rejected: {0}")]
    Rejected(&'static str),
}

/// Handler outcome; an `Err` counts as a failure and triggers the retry and
/// `system.error` paths.
pub type HandlerResult = Result<(), String>;

type Handler = Arc<dyn Fn(&GatewayEvent) -> HandlerResult + Send + Sync>;
type Filter = Arc<dyn Fn(&GatewayEvent) -> bool + Send + Sync>;

/// Options accepted by `subscribe` / `subscribe_all`.
#[derive(Default)]
pub struct SubscribeOptions {
    pub filter: Option<Filter>,
    /// Higher runs earlier for the same event.
    pub priority: i32,
    /// Remove the handler after its first invocation.
    pub once: bool,
}

struct Registration {
    token: u64,
    kind: Option<EventKind>,
    handler: Handler,
    filter: Option<Filter>,
    priority: i32,
    once: bool,
}

struct QueuedEvent {
    event: GatewayEvent,
    priority: EventPriority,
    retries: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub published: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub queue_size: usize,
    pub avg_processing_micros: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BusSubscription(u64);

pub struct EventBus {
    config: BusConfig,
    queue: Mutex<VecDeque<QueuedEvent>>,
    subscribers: Mutex<Vec<Registration>>,
    middleware: Vec<Arc<dyn BusMiddleware>>,
    wake: Notify,
    idle: Notify,
    in_flight: AtomicBool,
    next_token: AtomicU64,
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    processing_micros: AtomicU64,
}

impl EventBus {
    /// Build the bus with the default middleware chain and spawn its drain
    /// task on the current runtime.
    pub fn spawn(config: BusConfig) -> Arc<Self> {
        let middleware: Vec<Arc<dyn BusMiddleware>> = vec![
            Arc::new(LoggingMiddleware),
            Arc::new(CircuitBreakerMiddleware::new(
                config.breaker_threshold,
                config.breaker_cooldown,
            )),
        ];
        Self::spawn_with_middleware(config, middleware)
    }

    pub fn spawn_with_middleware(
        config: BusConfig,
        middleware: Vec<Arc<dyn BusMiddleware>>,
    ) -> Arc<Self> {
        let bus = Arc::new(Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(Vec::new()),
            middleware,
            wake: Notify::new(),
            idle: Notify::new(),
            in_flight: AtomicBool::new(false),
            next_token: AtomicU64::new(1),
            published: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            processing_micros: AtomicU64::new(0),
        });

        let drain = bus.clone();
        tokio::spawn(async move { drain.run().await });
        bus
    }

    /// Subscribe to a single event type.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F, opts: SubscribeOptions) -> BusSubscription
    where
        F: Fn(&GatewayEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler), opts)
    }

    /// Subscribe to every event type.
    pub fn subscribe_all<F>(&self, handler: F, opts: SubscribeOptions) -> BusSubscription
    where
        F: Fn(&GatewayEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler), opts)
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler, opts: SubscribeOptions) -> BusSubscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Registration {
            token,
            kind,
            handler,
            filter: opts.filter,
            priority: opts.priority,
            once: opts.once,
        });
        BusSubscription(token)
    }

    pub fn unsubscribe(&self, subscription: BusSubscription) {
        self.subscribers
            .lock()
            .retain(|r| r.token != subscription.0);
    }

    /// Publish one event. Returns an error when the queue is full or a
    /// middleware rejects; the producer is never blocked.
    pub fn publish(&self, event: GatewayEvent, priority: EventPriority) -> Result<(), PublishError> {
        for mw in &self.middleware {
            match mw.on_publish(&event, priority) {
                PublishDecision::Continue => {}
                PublishDecision::Drop(reason) => {
                    debug!(event = event.kind().as_str(), reason, "event dropped");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                PublishDecision::Reject(reason) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(PublishError::Rejected(reason));
                }
            }
        }

        self.enqueue(QueuedEvent {
            event,
            priority,
            retries: 0,
        })?;
        self.published.fetch_add(1, Ordering::Relaxed);
        self.wake.notify_one();
        Ok(())
    }

    /// Publish a batch at one priority. Stops at the first failure.
    pub fn publish_many(
        &self,
        events: Vec<GatewayEvent>,
        priority: EventPriority,
    ) -> Result<(), PublishError> {
        for event in events {
            self.publish(event, priority)?;
        }
        Ok(())
    }

    fn enqueue(&self, queued: QueuedEvent) -> Result<(), PublishError> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.queue_capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(PublishError::Overflow);
        }
        if queued.priority == EventPriority::Critical {
            queue.push_front(queued);
        } else {
            // keep FIFO order within a priority, higher priorities first
            let mut idx = queue.len();
            while idx > 0 && queue[idx - 1].priority < queued.priority {
                idx -= 1;
            }
            queue.insert(idx, queued);
        }
        Ok(())
    }

    /// Plain tail re-enqueue used by the retry path; bypasses middleware.
    fn requeue_tail(&self, queued: QueuedEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.queue_capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        queue.push_back(queued);
    }

    /// Await until the queue is fully drained.
    pub async fn flush(&self) {
        loop {
            let notified = self.idle.notified();
            if self.queue.lock().is_empty() && !self.in_flight.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Drop everything still queued.
    pub fn clear(&self) {
        self.queue.lock().clear();
        self.idle.notify_waiters();
    }

    pub fn stats(&self) -> BusStats {
        let processed = self.processed.load(Ordering::Relaxed);
        let micros = self.processing_micros.load(Ordering::Relaxed);
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            processed,
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queue_size: self.queue.lock().len(),
            avg_processing_micros: if processed > 0 { micros / processed } else { 0 },
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(queued) => {
                    self.in_flight.store(true, Ordering::Release);
                    self.process(queued);
                    self.in_flight.store(false, Ordering::Release);
                    if self.queue.lock().is_empty() {
                        self.idle.notify_waiters();
                    }
                }
                None => {
                    self.idle.notify_waiters();
                    let notified = self.wake.notified();
                    if self.queue.lock().is_empty() {
                        notified.await;
                    }
                }
            }
        }
    }

    fn process(&self, queued: QueuedEvent) {
        let started = Instant::now();
        let kind = queued.event.kind();

        // snapshot matching registrations, descending handler priority
        let mut matching: Vec<(u64, Handler, Option<Filter>, bool)> = {
            let subscribers = self.subscribers.lock();
            let mut regs: Vec<&Registration> = subscribers
                .iter()
                .filter(|r| r.kind.is_none() || r.kind == Some(kind))
                .collect();
            regs.sort_by(|a, b| b.priority.cmp(&a.priority));
            regs.iter()
                .map(|r| (r.token, r.handler.clone(), r.filter.clone(), r.once))
                .collect()
        };

        let mut failures = 0u32;
        let mut fired_once_tokens = Vec::new();
        for (token, handler, filter, once) in matching.drain(..) {
            if let Some(filter) = &filter {
                if !filter(&queued.event) {
                    continue;
                }
            }
            if once {
                fired_once_tokens.push(token);
            }
            if let Err(err) = handler(&queued.event) {
                warn!(event = kind.as_str(), error = %err, "event handler failed");
                failures += 1;
            }
        }

        if !fired_once_tokens.is_empty() {
            self.subscribers
                .lock()
                .retain(|r| !fired_once_tokens.contains(&r.token));
        }

        for mw in &self.middleware {
            mw.on_processed(&queued.event, failures);
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        self.processing_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        if failures > 0 {
            self.failed.fetch_add(failures as u64, Ordering::Relaxed);

            if kind != EventKind::SystemError {
                let _ = self.publish(
                    GatewayEvent::SystemError {
                        subsystem: "bus".to_string(),
                        message: format!("{failures} handler(s) failed"),
                        context: Some(kind.as_str().to_string()),
                    },
                    EventPriority::High,
                );
            }

            if queued.retries < self.config.max_retries {
                self.requeue_tail(QueuedEvent {
                    event: queued.event,
                    priority: queued.priority,
                    retries: queued.retries + 1,
                });
                self.wake.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event(session_id: &str) -> GatewayEvent {
        GatewayEvent::SessionCreated {
            session_id: session_id.into(),
        }
    }

    #[tokio::test]
    async fn handlers_run_in_descending_priority() {
        let bus = EventBus::spawn(BusConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, priority) in [("low", -1), ("high", 10), ("mid", 5)] {
            let order = order.clone();
            bus.subscribe(
                EventKind::SessionCreated,
                move |_| {
                    order.lock().push(label);
                    Ok(())
                },
                SubscribeOptions {
                    priority,
                    ..Default::default()
                },
            );
        }

        bus.publish(event("s"), EventPriority::Normal).unwrap();
        bus.flush().await;

        assert_eq!(order.lock().clone(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn queue_never_exceeds_capacity() {
        let bus = EventBus::spawn_with_middleware(
            BusConfig {
                queue_capacity: 4,
                ..Default::default()
            },
            Vec::new(),
        );
        // no subscribers; flood faster than the drain task can run by
        // holding no await points between publishes
        let mut overflowed = false;
        for i in 0..64 {
            match bus.publish(event(&format!("s{i}")), EventPriority::Low) {
                Ok(()) => assert!(bus.stats().queue_size <= 4),
                Err(PublishError::Overflow) => {
                    overflowed = true;
                    break;
                }
                Err(other) => panic!("unexpected: {other}"),
            }
        }
        assert!(overflowed || bus.stats().queue_size <= 4);
        bus.flush().await;
    }

    #[tokio::test]
    async fn failing_handler_is_retried_and_reports_system_error() {
        let bus = EventBus::spawn_with_middleware(
            BusConfig {
                max_retries: 2,
                ..Default::default()
            },
            Vec::new(),
        );

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        bus.subscribe(
            EventKind::SessionCreated,
            move |_| {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            },
            SubscribeOptions::default(),
        );

        let system_errors = Arc::new(AtomicUsize::new(0));
        let system_errors_clone = system_errors.clone();
        bus.subscribe(
            EventKind::SystemError,
            move |_| {
                system_errors_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            SubscribeOptions::default(),
        );

        bus.publish(event("s"), EventPriority::Normal).unwrap();
        bus.flush().await;

        // initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(system_errors.load(Ordering::SeqCst), 3);
        assert!(bus.stats().failed >= 3);
    }

    #[tokio::test]
    async fn once_handler_fires_a_single_time() {
        let bus = EventBus::spawn_with_middleware(BusConfig::default(), Vec::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.subscribe(
            EventKind::SessionCreated,
            move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            SubscribeOptions {
                once: true,
                ..Default::default()
            },
        );

        bus.publish(event("a"), EventPriority::Normal).unwrap();
        bus.publish(event("b"), EventPriority::Normal).unwrap();
        bus.flush().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filter_gates_delivery() {
        let bus = EventBus::spawn_with_middleware(BusConfig::default(), Vec::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.subscribe(
            EventKind::SessionCreated,
            move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            SubscribeOptions {
                filter: Some(Arc::new(|e: &GatewayEvent| {
                    e.session_id() == Some("wanted")
                })),
                ..Default::default()
            },
        );

        bus.publish(event("other"), EventPriority::Normal).unwrap();
        bus.publish(event("wanted"), EventPriority::Normal).unwrap();
        bus.flush().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_all_sees_every_kind() {
        let bus = EventBus::spawn_with_middleware(BusConfig::default(), Vec::new());
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let kinds_clone = kinds.clone();
        bus.subscribe_all(
            move |e| {
                kinds_clone.lock().push(e.kind());
                Ok(())
            },
            SubscribeOptions::default(),
        );

        bus.publish(event("s"), EventPriority::Normal).unwrap();
        bus.publish(GatewayEvent::SystemShutdown, EventPriority::Critical)
            .unwrap();
        bus.flush().await;

        let seen = kinds.lock().clone();
        assert!(seen.contains(&EventKind::SessionCreated));
        assert!(seen.contains(&EventKind::SystemShutdown));
    }
}
