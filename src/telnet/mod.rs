//! Telnet adapter
//!
//! Same surface as the SSH adapter, over a raw TCP stream with RFC 854
//! option negotiation. Login is expectation-driven: wait for the login
//! prompt, write the username, wait for the password prompt, write the
//! password, then watch briefly for a failure pattern before declaring
//! success.

mod iac;

pub use iac::{escape_outbound, StepOutput, TelnetMachine};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapter::{
    resolve_allowed, ConnectConfig, ExecHandle, ExecRequest, ProtocolAdapter, ResolveError,
    SessionCommand, ShellHandle, ShellRequest, SHELL_CHANNEL_CAPACITY,
};
use crate::bus::{EventBus, EventPriority, GatewayEvent};
use crate::config::TelnetSection;
use crate::error::{
    AuthError, ConnectionError, GatewayError, PolicyError, ValidationError,
};
use crate::logging::{LogEvent, LogLevel, LogStatus, StructuredLogger};
use crate::pool::{ConnectionPool, PooledConnection, Protocol, TransportHandle, TransportStatus};
use crate::prompt::PromptDispatcher;
use crate::store::{SessionAction, SessionStore};

/// How long to watch for a failure pattern after writing credentials.
const LOGIN_FAILURE_GRACE: Duration = Duration::from_millis(1_500);

/// Cap on the cleaned-text window used for prompt matching.
const EXPECT_WINDOW: usize = 4_096;

#[derive(Error, Debug)]
pub enum TelnetError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Target blocked by subnet policy: {0}")]
    SubnetBlocked(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TelnetError> for GatewayError {
    fn from(err: TelnetError) -> Self {
        match err {
            TelnetError::Timeout => GatewayError::Connection(ConnectionError::Timeout),
            TelnetError::LoginFailed(_) => GatewayError::Auth(AuthError::InvalidCredentials),
            TelnetError::SubnetBlocked(host) => {
                GatewayError::Policy(PolicyError::SubnetBlocked(host))
            }
            TelnetError::ConnectionFailed(msg) => {
                GatewayError::Connection(ConnectionError::Refused(msg))
            }
            other => GatewayError::internal(other),
        }
    }
}

struct TelnetEntry {
    session_id: String,
    cmd_tx: mpsc::Sender<SessionCommand>,
    /// Taken by the first `shell` call.
    data_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

/// Pool transport handle: closing means telling the I/O task to stop.
struct TelnetTransport {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

#[async_trait]
impl TransportHandle for TelnetTransport {
    async fn end(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Close).await;
    }
}

pub struct TelnetAdapter {
    config: TelnetSection,
    ready_timeout: Duration,
    subnets: Vec<IpNet>,
    login_re: Regex,
    password_re: Regex,
    failure_re: Regex,
    pool: Arc<ConnectionPool>,
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    logger: Arc<StructuredLogger>,
    entries: Arc<DashMap<String, Arc<TelnetEntry>>>,
}

impl TelnetAdapter {
    pub fn new(
        config: TelnetSection,
        ready_timeout: Duration,
        subnets: Vec<IpNet>,
        pool: Arc<ConnectionPool>,
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
        logger: Arc<StructuredLogger>,
    ) -> Result<Self, GatewayError> {
        let login_re = Regex::new(&config.login_prompt)
            .map_err(|e| GatewayError::Config(crate::error::ConfigError(e.to_string())))?;
        let password_re = Regex::new(&config.password_prompt)
            .map_err(|e| GatewayError::Config(crate::error::ConfigError(e.to_string())))?;
        let failure_re = Regex::new(&config.failure_prompt)
            .map_err(|e| GatewayError::Config(crate::error::ConfigError(e.to_string())))?;

        Ok(Self {
            config,
            ready_timeout,
            subnets,
            login_re,
            password_re,
            failure_re,
            pool,
            store,
            bus,
            logger,
            entries: Arc::new(DashMap::new()),
        })
    }

    /// Drive the login expectation. Returns leftover cleaned bytes that
    /// arrived after authentication.
    async fn login(
        &self,
        stream: &mut TcpStream,
        machine: &mut TelnetMachine,
        username: &str,
        password: &str,
    ) -> Result<Vec<u8>, TelnetError> {
        let mut window = String::new();
        let mut leftover: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];

        // login prompt -> username
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(TelnetError::ConnectionFailed(
                    "closed during login".to_string(),
                ));
            }
            let step = machine.feed(&buf[..n]);
            if !step.responses.is_empty() {
                stream.write_all(&step.responses).await?;
            }
            window.push_str(&String::from_utf8_lossy(&step.data));
            trim_window(&mut window);
            if self.login_re.is_match(&window) {
                break;
            }
        }
        stream
            .write_all(&escape_outbound(format!("{username}\r\n").as_bytes()))
            .await?;
        window.clear();

        // password prompt -> password
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(TelnetError::ConnectionFailed(
                    "closed during login".to_string(),
                ));
            }
            let step = machine.feed(&buf[..n]);
            if !step.responses.is_empty() {
                stream.write_all(&step.responses).await?;
            }
            window.push_str(&String::from_utf8_lossy(&step.data));
            trim_window(&mut window);
            if self.password_re.is_match(&window) {
                break;
            }
        }
        stream
            .write_all(&escape_outbound(format!("{password}\r\n").as_bytes()))
            .await?;
        window.clear();

        // watch briefly for a failure pattern
        let deadline = Instant::now() + LOGIN_FAILURE_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => {
                    return Err(TelnetError::ConnectionFailed(
                        "closed after login".to_string(),
                    ))
                }
                Ok(Ok(n)) => {
                    let step = machine.feed(&buf[..n]);
                    if !step.responses.is_empty() {
                        stream.write_all(&step.responses).await?;
                    }
                    window.push_str(&String::from_utf8_lossy(&step.data));
                    trim_window(&mut window);
                    leftover.extend_from_slice(&step.data);
                    if self.failure_re.is_match(&window) {
                        return Err(TelnetError::LoginFailed(
                            "credentials rejected".to_string(),
                        ));
                    }
                }
                Ok(Err(e)) => return Err(TelnetError::Io(e)),
            }
        }

        Ok(leftover)
    }

    async fn connect_inner(
        &self,
        config: &ConnectConfig,
    ) -> Result<String, TelnetError> {
        let addr = resolve_allowed(&config.host, config.port, &self.subnets)
            .await
            .map_err(|err| match err {
                ResolveError::Lookup(e) => {
                    TelnetError::ConnectionFailed(format!("failed to resolve {}: {e}", config.host))
                }
                ResolveError::NoAddress => {
                    TelnetError::ConnectionFailed(format!("no address found for {}", config.host))
                }
                ResolveError::Blocked => {
                    self.logger.emit(
                        LogEvent::new(LogLevel::Warn, "connect", "telnet")
                            .status(LogStatus::Failure)
                            .reason("policy_block"),
                    );
                    TelnetError::SubnetBlocked(config.host.clone())
                }
            })?;

        let result = tokio::time::timeout(self.ready_timeout, async {
            let mut stream = TcpStream::connect(addr).await.map_err(|e| {
                TelnetError::ConnectionFailed(format!("{}: {e}", config.host))
            })?;
            if let Err(e) = stream.set_nodelay(true) {
                warn!("failed to set TCP_NODELAY: {e}");
            }

            let mut machine = TelnetMachine::new(config.term.clone(), 80, 24);
            let leftover = match (&config.username, &config.password) {
                (Some(username), Some(password)) => {
                    self.login(&mut stream, &mut machine, username, password)
                        .await?
                }
                _ => Vec::new(),
            };
            Ok::<_, TelnetError>((stream, machine, leftover))
        })
        .await;

        let (stream, machine, leftover) = match result {
            Ok(inner) => inner?,
            Err(_) => {
                warn!(host = %config.host, port = config.port, "Connection timeout");
                return Err(TelnetError::Timeout);
            }
        };

        // a session holds at most one live connection
        for stale in self.pool.get_by_session(&config.session_id) {
            self.disconnect(&stale.id).await;
        }

        let connection_id = uuid::Uuid::new_v4().to_string();
        let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>(SHELL_CHANNEL_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel::<Bytes>(SHELL_CHANNEL_CAPACITY);

        let conn = Arc::new(PooledConnection::new(
            connection_id.clone(),
            config.session_id.clone(),
            Protocol::Telnet,
            config.host.clone(),
            config.port,
            config.username.clone(),
            Arc::new(TelnetTransport {
                cmd_tx: cmd_tx.clone(),
            }),
        ));
        self.pool
            .add(conn.clone())
            .map_err(|e| TelnetError::ConnectionFailed(e.to_string()))?;

        self.entries.insert(
            connection_id.clone(),
            Arc::new(TelnetEntry {
                session_id: config.session_id.clone(),
                cmd_tx,
                data_rx: Mutex::new(Some(data_rx)),
            }),
        );

        self.spawn_io(stream, machine, leftover, cmd_rx, data_tx, conn);
        Ok(connection_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_io(
        &self,
        stream: TcpStream,
        mut machine: TelnetMachine,
        pending: Vec<u8>,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        data_tx: mpsc::Sender<Bytes>,
        conn: Arc<PooledConnection>,
    ) {
        let pool = self.pool.clone();
        let store = self.store.clone();
        let bus = self.bus.clone();
        let entries = self.entries.clone();

        tokio::spawn(async move {
            let connection_id = conn.id.clone();
            let session_id = conn.session_id.clone();
            let (mut reader, mut writer) = stream.into_split();

            if !pending.is_empty() {
                let _ = data_tx.send(Bytes::from(pending)).await;
            }

            let mut buf = [0u8; 8192];
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(SessionCommand::Data(data)) => {
                                let escaped = escape_outbound(&data);
                                if writer.write_all(&escaped).await.is_err() {
                                    break;
                                }
                                conn.touch();
                            }
                            Some(SessionCommand::Resize(cols, rows)) => {
                                if let Some(report) = machine.set_window(cols, rows) {
                                    if writer.write_all(&report).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(SessionCommand::Close) | None => break,
                        }
                    }

                    read = reader.read(&mut buf) => {
                        match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                conn.touch();
                                let step = machine.feed(&buf[..n]);
                                if !step.responses.is_empty()
                                    && writer.write_all(&step.responses).await.is_err()
                                {
                                    break;
                                }
                                if !step.data.is_empty()
                                    && data_tx.send(Bytes::from(step.data)).await.is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            let _ = writer.shutdown().await;
            entries.remove(&connection_id);
            if let Some(removed) = pool.remove(&connection_id) {
                removed.set_status(TransportStatus::Disconnected);
                store.dispatch(&session_id, SessionAction::ConnectionClosed);
                let _ = bus.publish(
                    GatewayEvent::ConnectionClosed {
                        session_id: session_id.clone(),
                        connection_id: connection_id.clone(),
                    },
                    EventPriority::Normal,
                );
            }
            debug!(connection_id = %connection_id, "telnet io task stopped");
        });
    }

    fn entry(&self, connection_id: &str) -> Result<Arc<TelnetEntry>, TelnetError> {
        self.entries
            .get(connection_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| TelnetError::ConnectionNotFound(connection_id.to_string()))
    }
}

fn trim_window(window: &mut String) {
    if window.len() > EXPECT_WINDOW {
        let mut cut = window.len() - EXPECT_WINDOW;
        while cut < window.len() && !window.is_char_boundary(cut) {
            cut += 1;
        }
        // keep the tail; prompts appear at the end
        let tail = window.split_off(cut);
        *window = tail;
    }
}

#[async_trait]
impl ProtocolAdapter for TelnetAdapter {
    async fn connect(
        &self,
        config: ConnectConfig,
        _prompter: Option<PromptDispatcher>,
    ) -> Result<String, GatewayError> {
        let started = Instant::now();
        let session_id = config.session_id.clone();

        self.store.dispatch(
            &session_id,
            SessionAction::ConnectionStart {
                host: config.host.clone(),
                port: config.port,
            },
        );

        match self.connect_inner(&config).await {
            Ok(connection_id) => {
                let method = if config.username.is_some() {
                    "password"
                } else {
                    "none"
                };
                self.store.dispatch(
                    &session_id,
                    SessionAction::AuthSuccess {
                        username: config.username.clone().unwrap_or_default(),
                        method: method.to_string(),
                    },
                );
                self.store.dispatch(
                    &session_id,
                    SessionAction::ConnectionEstablished {
                        connection_id: connection_id.clone(),
                    },
                );
                let _ = self.bus.publish(
                    GatewayEvent::ConnectionEstablished {
                        session_id: session_id.clone(),
                        connection_id: connection_id.clone(),
                        host: config.host.clone(),
                        port: config.port,
                    },
                    EventPriority::Normal,
                );
                self.logger.emit(
                    LogEvent::new(LogLevel::Info, "connect", "telnet")
                        .session(&session_id)
                        .connection(&connection_id)
                        .status(LogStatus::Success)
                        .duration_ms(started.elapsed().as_millis() as u64),
                );
                info!(host = %config.host, port = config.port, "telnet connection established");
                Ok(connection_id)
            }
            Err(err) => {
                let gateway_err: GatewayError = err.into();
                match &gateway_err {
                    GatewayError::Auth(auth_err) => {
                        self.store.dispatch(
                            &session_id,
                            SessionAction::AuthFailure {
                                error: auth_err.to_string(),
                                method: Some("password".to_string()),
                            },
                        );
                    }
                    other => {
                        self.store.dispatch(
                            &session_id,
                            SessionAction::ConnectionError {
                                error: other.user_message(),
                            },
                        );
                    }
                }
                self.logger.emit(
                    LogEvent::new(LogLevel::Warn, "connect", "telnet")
                        .session(&session_id)
                        .status(LogStatus::Failure)
                        .duration_ms(started.elapsed().as_millis() as u64)
                        .reason(gateway_err.code()),
                );
                Err(gateway_err)
            }
        }
    }

    async fn shell(
        &self,
        connection_id: &str,
        request: ShellRequest,
    ) -> Result<ShellHandle, GatewayError> {
        let entry = self.entry(connection_id).map_err(GatewayError::from)?;
        let data_rx = entry
            .data_rx
            .lock()
            .take()
            .ok_or_else(|| GatewayError::Connection(ConnectionError::Closed))?;

        // align the negotiated window with the client terminal
        let _ = entry
            .cmd_tx
            .send(SessionCommand::Resize(request.cols, request.rows))
            .await;

        Ok(ShellHandle {
            connection_id: connection_id.to_string(),
            cmd_tx: entry.cmd_tx.clone(),
            data_rx,
        })
    }

    async fn exec(
        &self,
        _connection_id: &str,
        _command: &str,
        _request: ExecRequest,
    ) -> Result<ExecHandle, GatewayError> {
        Err(GatewayError::Validation(ValidationError::new(
            "exec",
            "not supported over telnet",
        )))
    }

    async fn resize(&self, connection_id: &str, rows: u16, cols: u16) -> Result<(), GatewayError> {
        let entry = self.entry(connection_id).map_err(GatewayError::from)?;
        entry
            .cmd_tx
            .send(SessionCommand::Resize(cols, rows))
            .await
            .map_err(|_| GatewayError::Connection(ConnectionError::Closed))
    }

    async fn disconnect(&self, connection_id: &str) {
        if let Some(entry) = self.entries.get(connection_id).map(|e| e.value().clone()) {
            let _ = entry.cmd_tx.send(SessionCommand::Close).await;
        }
    }

    fn connection_status(&self, connection_id: &str) -> Option<TransportStatus> {
        self.pool.get(connection_id).map(|c| c.status())
    }

    async fn disconnect_session(&self, session_id: &str) {
        for conn in self.pool.get_by_session(session_id) {
            if conn.protocol == Protocol::Telnet {
                self.disconnect(&conn.id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, EventBus};
    use crate::config::LoggingSection;
    use crate::store::{ConnectionStatus, SessionStore};
    use tokio::net::TcpListener;
    use zeroize::Zeroizing;

    fn adapter(
        pool: Arc<ConnectionPool>,
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
    ) -> TelnetAdapter {
        let logger = Arc::new(StructuredLogger::new(&LoggingSection::default(), None));
        TelnetAdapter::new(
            TelnetSection::default(),
            Duration::from_secs(10),
            Vec::new(),
            pool,
            store,
            bus,
            logger,
        )
        .unwrap()
    }

    fn connect_config(session_id: &str, host: &str, port: u16) -> ConnectConfig {
        ConnectConfig {
            session_id: session_id.to_string(),
            host: host.to_string(),
            port,
            username: Some("alice".to_string()),
            password: Some(Zeroizing::new("s3cret".to_string())),
            private_key: None,
            passphrase: None,
            term: "xterm".to_string(),
        }
    }

    /// Minimal telnet server: prompt for login and password, then either
    /// greet or reject.
    async fn stub_server(listener: TcpListener, reject: bool) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];

        stream.write_all(b"login: ").await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("alice"));

        stream.write_all(b"Password: ").await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("s3cret"));

        if reject {
            stream.write_all(b"Login incorrect\r\nlogin: ").await.unwrap();
            // keep open long enough for the client to see the rejection
            tokio::time::sleep(Duration::from_millis(300)).await;
        } else {
            stream.write_all(b"Welcome!\r\n$ ").await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    #[tokio::test]
    async fn login_expectation_succeeds_and_pools_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(stub_server(listener, false));

        let pool = Arc::new(ConnectionPool::new());
        let store = Arc::new(SessionStore::new());
        let bus = EventBus::spawn(BusConfig::default());
        store.create_session(Some("t1"));

        let adapter = adapter(pool.clone(), store.clone(), bus);
        let connection_id = adapter
            .connect(connect_config("t1", "127.0.0.1", port), None)
            .await
            .unwrap();

        assert_eq!(
            adapter.connection_status(&connection_id),
            Some(TransportStatus::Connected)
        );
        let state = store.get_state("t1").unwrap();
        assert_eq!(state.connection.status, ConnectionStatus::Connected);
        assert_eq!(
            state.connection.connection_id.as_deref(),
            Some(connection_id.as_str())
        );

        // the banner that arrived after login is delivered to the shell
        let mut shell = adapter
            .shell(
                &connection_id,
                ShellRequest {
                    term: "xterm".into(),
                    rows: 24,
                    cols: 80,
                    env: Default::default(),
                },
            )
            .await
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), shell.data_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&first).contains("Welcome"));

        adapter.disconnect(&connection_id).await;
    }

    #[tokio::test]
    async fn login_failure_pattern_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(stub_server(listener, true));

        let pool = Arc::new(ConnectionPool::new());
        let store = Arc::new(SessionStore::new());
        let bus = EventBus::spawn(BusConfig::default());
        store.create_session(Some("t2"));

        let adapter = adapter(pool.clone(), store.clone(), bus);
        let err = adapter
            .connect(connect_config("t2", "127.0.0.1", port), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GatewayError::Auth(AuthError::InvalidCredentials)
        ));
        assert!(pool.is_empty());
        let state = store.get_state("t2").unwrap();
        assert_eq!(state.auth.status, crate::store::AuthStatus::Failed);
    }

    #[tokio::test]
    async fn subnet_policy_blocks_before_dialing() {
        let pool = Arc::new(ConnectionPool::new());
        let store = Arc::new(SessionStore::new());
        let bus = EventBus::spawn(BusConfig::default());
        store.create_session(Some("t3"));

        let logger = Arc::new(StructuredLogger::new(&LoggingSection::default(), None));
        let adapter = TelnetAdapter::new(
            TelnetSection::default(),
            Duration::from_secs(5),
            vec!["10.0.0.0/24".parse().unwrap()],
            pool.clone(),
            store.clone(),
            bus,
            logger,
        )
        .unwrap();

        let err = adapter
            .connect(connect_config("t3", "192.0.2.1", 23), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GatewayError::Policy(PolicyError::SubnetBlocked(_))
        ));
        let state = store.get_state("t3").unwrap();
        assert_eq!(state.connection.status, ConnectionStatus::Error);
        assert!(pool.is_empty());
    }
}
