//! WebSSH2 - a WebSocket-to-SSH/Telnet terminal gateway
//!
//! Terminates browser WebSocket connections on one side and outbound SSH
//! (or Telnet) client connections on the other, mediating authentication,
//! per-session state, bidirectional terminal I/O with backpressure, and
//! interactive prompts.

// mimalloc keeps latency steady under the high-frequency small allocations
// of frame forwarding
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod adapter;
pub mod auth;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod prompt;
pub mod ssh;
pub mod store;
pub mod telnet;
pub mod terminal;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use bridge::{BridgeServices, HttpSessionStore};
use bus::{BusConfig, EventBus, EventKind, GatewayEvent, SubscribeOptions};
use config::GatewayConfig;
use error::GatewayError;
use logging::{StructuredLogger, SyslogSink};
use pool::ConnectionPool;
use prompt::PromptTracker;
use ssh::{HostKeyService, HostKeyStore, SshAdapter};
use store::SessionStore;
use telnet::TelnetAdapter;
use terminal::TerminalService;

/// Prompt expiry sweep cadence.
const PROMPT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Idle session GC cadence and TTL.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SESSION_IDLE_TTL_SECS: i64 = 600;

/// Assemble every service from the validated configuration. Must run on a
/// tokio runtime: the bus drain task, prompt sweeper, session sweeper, and
/// the optional syslog sink all spawn here.
pub fn build_gateway(config: GatewayConfig) -> Result<Arc<BridgeServices>, GatewayError> {
    let config = Arc::new(config);

    let syslog = config.logging.syslog.clone().map(SyslogSink::spawn);
    let logger = Arc::new(StructuredLogger::new(&config.logging, syslog));

    let store = Arc::new(SessionStore::new());
    let bus = EventBus::spawn(BusConfig::default());
    let pool = Arc::new(ConnectionPool::new());

    let prompts = Arc::new(PromptTracker::default());
    prompts.spawn_sweeper(PROMPT_SWEEP_INTERVAL);

    let terminals = Arc::new(TerminalService::new(
        config.recording.enabled,
        config.recording.buffer_size,
    ));

    let host_keys = Arc::new(HostKeyService::new(HostKeyStore::new(), true));
    let subnets = config.ssh.parsed_subnets()?;

    let ssh = Arc::new(SshAdapter::new(
        config.ssh.clone(),
        config.auth.clone(),
        subnets.clone(),
        pool.clone(),
        store.clone(),
        bus.clone(),
        host_keys,
        logger.clone(),
    ));
    let telnet = Arc::new(TelnetAdapter::new(
        config.telnet.clone(),
        Duration::from_millis(config.ssh.ready_timeout),
        subnets,
        pool.clone(),
        store.clone(),
        bus.clone(),
        logger.clone(),
    )?);

    let http_sessions = Arc::new(HttpSessionStore::new());

    let services = Arc::new(BridgeServices::new(
        config,
        store.clone(),
        bus.clone(),
        pool,
        prompts,
        terminals.clone(),
        logger.clone(),
        http_sessions,
        ssh,
        telnet,
    ));

    wire_recording(&bus, terminals, logger);
    spawn_session_sweeper(store, bus);

    Ok(services)
}

/// Recording and session lifecycle handlers on the bus. Handlers are
/// non-blocking: the actual buffer work is deferred to spawned tasks.
fn wire_recording(
    bus: &Arc<EventBus>,
    terminals: Arc<TerminalService>,
    logger: Arc<StructuredLogger>,
) {
    let terminals_flush = terminals.clone();
    let logger_flush = logger.clone();
    bus.subscribe(
        EventKind::RecordingStarted,
        move |event| {
            if let GatewayEvent::RecordingStarted { session_id } = event {
                let terminals = terminals_flush.clone();
                let logger = logger_flush.clone();
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    let entries = terminals.flush_recording(&session_id).await;
                    logger.emit(
                        logging::LogEvent::new(
                            logging::LogLevel::Info,
                            "recording_flush",
                            "terminal",
                        )
                        .session(&session_id)
                        .status(logging::LogStatus::Success)
                        .data(serde_json::json!({ "entries": entries.len() })),
                    );
                });
            }
            Ok(())
        },
        SubscribeOptions::default(),
    );

    bus.subscribe(
        EventKind::SessionDestroyed,
        move |event| {
            if let GatewayEvent::SessionDestroyed { session_id } = event {
                let terminals = terminals.clone();
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    terminals.destroy(&session_id).await;
                });
            }
            Ok(())
        },
        SubscribeOptions::default(),
    );
}

/// Periodically drop sessions that have been idle and disconnected for
/// longer than the TTL.
fn spawn_session_sweeper(store: Arc<SessionStore>, bus: Arc<EventBus>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = store.sweep_idle(SESSION_IDLE_TTL_SECS);
            for session_id in removed {
                info!(session_id = %session_id, "idle session removed");
                if bus
                    .publish(
                        GatewayEvent::SessionDestroyed { session_id },
                        bus::EventPriority::Normal,
                    )
                    .is_err()
                {
                    warn!("failed to publish session.destroyed");
                }
            }
        }
    });
}
