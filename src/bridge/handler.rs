//! Socket Bridge
//!
//! One instance per accepted WebSocket. Drives authentication to
//! completion, requests the terminal, opens the shell, and proxies bytes
//! and control messages in both directions until either side closes.
//! Inbound text frames are parsed exactly once at the edge; binary frames
//! are raw terminal bytes and bypass parsing entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::adapter::{
    ConnectConfig, ExecEvent, ExecRequest, ProtocolAdapter, SessionCommand, ShellHandle,
    ShellRequest,
};
use crate::auth::{AttemptOutcome, AuthFailureReason, AuthStateMachine};
use crate::bus::{EventBus, EventPriority, GatewayEvent};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::logging::{LogEvent, LogLevel, LogStatus, StructuredLogger};
use crate::pool::ConnectionPool;
use crate::prompt::{PromptDispatcher, PromptPayload, PromptTracker};
use crate::ssh::SshAdapter;
use crate::store::{MetadataPatch, SessionAction, SessionStore};
use crate::telnet::TelnetAdapter;
use crate::terminal::TerminalService;

use super::http_session::{HttpSession, HttpSessionStore};
use super::limits::{command_permitted, filter_env, RiskyMessage, SocketLimits};
use super::protocol::{
    parse_client_message, AuthenticateRequest, AuthenticationStatus, ClientMessage, ControlAction,
    ExecStreamKind, Permissions, ServerMessage, UiHeader, UiUpdate, WireError,
};

/// Outbound frame channel capacity (the socket-side high-water mark).
const OUTBOUND_CAPACITY: usize = 512;

/// Per-frame write deadline before the client is declared dead.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the `authenticate` message.
const AUTH_WAIT: Duration = Duration::from_secs(180);

/// How long to wait for the `terminal` reply to `getTerminal`.
const TERMINAL_WAIT: Duration = Duration::from_secs(60);

/// WebSocket keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Why a bridge ended, for the teardown log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    Replaced,
    AuthExhausted,
    ShellClosed,
    Timeout,
    NetworkError(String),
}

impl DisconnectReason {
    fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::Replaced => "replaced",
            DisconnectReason::AuthExhausted => "auth_exhausted",
            DisconnectReason::ShellClosed => "shell_closed",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::NetworkError(_) => "network_error",
        }
    }
}

/// Protocol selected by the upgrade path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeProtocol {
    Ssh,
    Telnet,
}

/// Process-wide bundle of services shared by every bridge.
pub struct BridgeServices {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<SessionStore>,
    pub bus: Arc<EventBus>,
    pub pool: Arc<ConnectionPool>,
    pub prompts: Arc<PromptTracker>,
    pub terminals: Arc<TerminalService>,
    pub logger: Arc<StructuredLogger>,
    pub http_sessions: Arc<HttpSessionStore>,
    pub ssh: Arc<SshAdapter>,
    pub telnet: Arc<TelnetAdapter>,
    /// One active bridge per session; a newcomer evicts the holder.
    active: DashMap<String, Arc<Notify>>,
}

impl BridgeServices {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<GatewayConfig>,
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
        pool: Arc<ConnectionPool>,
        prompts: Arc<PromptTracker>,
        terminals: Arc<TerminalService>,
        logger: Arc<StructuredLogger>,
        http_sessions: Arc<HttpSessionStore>,
        ssh: Arc<SshAdapter>,
        telnet: Arc<TelnetAdapter>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            pool,
            prompts,
            terminals,
            logger,
            http_sessions,
            ssh,
            telnet,
            active: DashMap::new(),
        }
    }

    fn adapter(&self, protocol: BridgeProtocol) -> Arc<dyn ProtocolAdapter> {
        match protocol {
            BridgeProtocol::Ssh => self.ssh.clone(),
            BridgeProtocol::Telnet => self.telnet.clone(),
        }
    }
}

enum AuthPhaseEnd {
    Connected {
        connection_id: String,
        password: Option<Zeroizing<String>>,
    },
    Ended(DisconnectReason),
}

enum ShellEnd {
    Reauth,
    Ended(DisconnectReason),
}

pub struct SocketBridge {
    services: Arc<BridgeServices>,
    protocol: BridgeProtocol,
    socket_id: String,
    session_id: String,
    http_sid: Option<String>,
    outbound: mpsc::Sender<Message>,
    limits: SocketLimits,
    evicted: Arc<Notify>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl SocketBridge {
    /// Handle one accepted, origin-checked WebSocket until it ends.
    pub async fn run(
        services: Arc<BridgeServices>,
        ws_stream: WebSocketStream<TcpStream>,
        protocol: BridgeProtocol,
        http_sid: Option<String>,
        client_ip: Option<String>,
        user_agent: Option<String>,
    ) {
        let started = Instant::now();
        let socket_id = uuid::Uuid::new_v4().to_string();

        let http_session = http_sid
            .as_deref()
            .and_then(|sid| services.http_sessions.get(sid));

        // the cookie-bound HTTP session pins the core session id across
        // reconnects; otherwise each socket gets a fresh one
        let session_id = http_session
            .as_ref()
            .and_then(|s| s.core_session_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if let Some(sid) = http_sid.as_deref() {
            services.http_sessions.bind_core_session(sid, &session_id);
        }

        services.store.create_session(Some(&session_id));
        services.store.dispatch(
            &session_id,
            SessionAction::MetadataUpdate(MetadataPatch {
                client_ip,
                user_agent,
                ..Default::default()
            }),
        );
        let _ = services.bus.publish(
            GatewayEvent::SessionCreated {
                session_id: session_id.clone(),
            },
            EventPriority::Normal,
        );

        // one active bridge per session: replace the previous holder
        let evicted = Arc::new(Notify::new());
        if let Some(previous) = services
            .active
            .insert(session_id.clone(), evicted.clone())
        {
            debug!(session_id = %session_id, "replacing existing bridge for session");
            previous.notify_one();
        }

        let (sink, source) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(Self::write_loop(sink, outbound_rx));
        let pinger = tokio::spawn(Self::ping_loop(outbound.clone()));

        let bridge = SocketBridge {
            services: services.clone(),
            protocol,
            socket_id,
            session_id: session_id.clone(),
            http_sid,
            outbound,
            limits: SocketLimits::default(),
            evicted,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        };

        let my_registration = bridge.evicted.clone();
        let reason = bridge.run_phases(source).await;
        bridge.teardown(&reason).await;

        services.logger.emit(
            LogEvent::new(LogLevel::Info, "socket_closed", "bridge")
                .session(&session_id)
                .status(LogStatus::Success)
                .duration_ms(started.elapsed().as_millis() as u64)
                .bytes(
                    bridge.bytes_in.load(Ordering::Relaxed),
                    bridge.bytes_out.load(Ordering::Relaxed),
                )
                .reason(reason.as_str()),
        );

        pinger.abort();
        // dropping the last outbound sender ends the writer
        drop(bridge);
        let _ = writer.await;

        // deregister only our own slot; a replacement bridge keeps its own
        services
            .active
            .remove_if(&session_id, |_, notify| Arc::ptr_eq(notify, &my_registration));

        info!(session_id = %session_id, reason = reason.as_str(), "bridge terminated");
    }

    async fn write_loop(mut sink: WsSink, mut outbound_rx: mpsc::Receiver<Message>) {
        while let Some(message) = outbound_rx.recv().await {
            match tokio::time::timeout(SEND_TIMEOUT, sink.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("websocket send failed: {e}");
                    break;
                }
                Err(_) => {
                    warn!("websocket send timeout, client unresponsive");
                    break;
                }
            }
        }
        debug!("websocket writer stopped");
    }

    async fn ping_loop(outbound: mpsc::Sender<Message>) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if outbound.send(Message::Ping(Vec::new())).await.is_err() {
                break;
            }
        }
    }

    async fn send(&self, message: ServerMessage) -> bool {
        self.outbound
            .send(Message::Text(message.to_json()))
            .await
            .is_ok()
    }

    async fn send_error(&self, code: &str, message: impl Into<String>) {
        let _ = self
            .send(ServerMessage::Error(WireError {
                code: code.to_string(),
                message: message.into(),
            }))
            .await;
    }

    fn effective_allow_replay(&self, http: Option<&HttpSession>) -> bool {
        http.and_then(|s| s.allow_replay_override)
            .unwrap_or(self.services.config.options.allow_replay)
    }

    async fn run_phases(&self, mut source: WsSource) -> DisconnectReason {
        // prompts raised mid-dial (host keys, keyboard-interactive) flow
        // through this channel out to the socket
        let (prompt_tx, mut prompt_rx) = mpsc::channel::<PromptPayload>(8);
        let dispatcher = PromptDispatcher::new(
            self.services.prompts.clone(),
            self.socket_id.clone(),
            prompt_tx,
        );
        let prompt_outbound = self.outbound.clone();
        let prompt_pump = tokio::spawn(async move {
            while let Some(payload) = prompt_rx.recv().await {
                let message = ServerMessage::Prompt(payload).to_json();
                if prompt_outbound.send(Message::Text(message)).await.is_err() {
                    break;
                }
            }
        });

        let mut auth = AuthStateMachine::new(self.services.config.auth.max_attempts);
        let adapter = self.services.adapter(self.protocol);

        let reason = loop {
            let http_session = self
                .http_sid
                .as_deref()
                .and_then(|sid| self.services.http_sessions.get(sid));

            // ---- authentication ----
            let (connection_id, password) = match self
                .auth_phase(&mut source, &mut auth, &adapter, &dispatcher, http_session.as_ref())
                .await
            {
                AuthPhaseEnd::Connected {
                    connection_id,
                    password,
                } => (connection_id, password),
                AuthPhaseEnd::Ended(reason) => break reason,
            };

            let _ = self
                .send(ServerMessage::Permissions(Permissions {
                    allow_replay: self.effective_allow_replay(http_session.as_ref()),
                    allow_reauth: self.services.config.options.allow_reauth,
                    allow_reconnect: self.services.config.options.allow_reconnect,
                    allow_file_transfer: self.services.config.options.allow_file_transfer,
                }))
                .await;
            let _ = self
                .send(ServerMessage::UpdateUi(self.ui_update(http_session.as_ref())))
                .await;

            // ---- terminal geometry ----
            let _ = self.send(ServerMessage::GetTerminal).await;
            let terminal = match self.wait_for_terminal(&mut source).await {
                Ok(request) => request,
                Err(reason) => {
                    adapter.disconnect(&connection_id).await;
                    break reason;
                }
            };

            let env = filter_env(&terminal.env);
            self.services.store.dispatch(
                &self.session_id,
                SessionAction::TerminalInit {
                    term: terminal.term.clone(),
                    rows: terminal.rows,
                    cols: terminal.cols,
                    environment: env.clone(),
                },
            );
            self.services.terminals.init(
                &self.session_id,
                terminal.term.clone(),
                terminal.rows,
                terminal.cols,
                env.clone(),
            );

            // ---- shell ----
            let shell = match adapter
                .shell(
                    &connection_id,
                    ShellRequest {
                        term: terminal.term.clone(),
                        rows: terminal.rows,
                        cols: terminal.cols,
                        env,
                    },
                )
                .await
            {
                Ok(shell) => shell,
                Err(err) => {
                    let _ = self
                        .send(ServerMessage::Ssherror {
                            message: err.user_message(),
                        })
                        .await;
                    adapter.disconnect(&connection_id).await;
                    break DisconnectReason::NetworkError(err.user_message());
                }
            };

            match self
                .shell_phase(&mut source, &adapter, &connection_id, shell, password, http_session.as_ref())
                .await
            {
                ShellEnd::Reauth => {
                    adapter.disconnect(&connection_id).await;
                    self.services
                        .store
                        .dispatch(&self.session_id, SessionAction::AuthClear);
                    self.services
                        .store
                        .dispatch(&self.session_id, SessionAction::TerminalDestroy);
                    auth.reset();
                    continue;
                }
                ShellEnd::Ended(reason) => {
                    adapter.disconnect(&connection_id).await;
                    break reason;
                }
            }
        };

        prompt_pump.abort();
        reason
    }

    /// Build the connect config for one attempt. `None` when the target
    /// host is missing.
    fn build_connect_config(
        &self,
        request: Option<&AuthenticateRequest>,
        http: Option<&HttpSession>,
    ) -> Option<ConnectConfig> {
        let config = &self.services.config;
        let creds = http.and_then(|s| s.ssh_credentials.as_ref());

        let host = request
            .and_then(|r| r.host.clone())
            .or_else(|| creds.and_then(|c| c.host.clone()))
            .or_else(|| config.ssh.host.clone())?;

        let default_port = match self.protocol {
            BridgeProtocol::Ssh => config.ssh.port,
            BridgeProtocol::Telnet => config.telnet.port,
        };

        Some(ConnectConfig {
            session_id: self.session_id.clone(),
            host,
            port: request
                .and_then(|r| r.port)
                .or_else(|| creds.and_then(|c| c.port))
                .unwrap_or(default_port),
            username: request
                .map(|r| r.username.clone())
                .or_else(|| creds.and_then(|c| c.username.clone())),
            password: request
                .and_then(|r| r.password.clone())
                .map(Zeroizing::new)
                .or_else(|| creds.and_then(|c| c.password.clone())),
            private_key: request
                .and_then(|r| r.private_key.clone())
                .map(Zeroizing::new),
            passphrase: request
                .and_then(|r| r.passphrase.clone())
                .map(Zeroizing::new),
            term: request
                .and_then(|r| r.term.clone())
                .or_else(|| creds.and_then(|c| c.term.clone()))
                .unwrap_or_else(|| config.ssh.term.clone()),
        })
    }

    async fn auth_phase(
        &self,
        source: &mut WsSource,
        auth: &mut AuthStateMachine,
        adapter: &Arc<dyn ProtocolAdapter>,
        dispatcher: &PromptDispatcher,
        http_session: Option<&HttpSession>,
    ) -> AuthPhaseEnd {
        // server-side credentials from HTTP Basic/POST skip the client ask
        let mut server_side = http_session
            .map(|s| s.used_basic_auth && s.ssh_credentials.is_some())
            .unwrap_or(false);

        loop {
            auth.begin_collecting();

            let connect_config = if server_side {
                server_side = false;
                match self.build_connect_config(None, http_session) {
                    Some(config) => config,
                    None => {
                        // deposited credentials were incomplete; fall back
                        // to asking the client
                        continue;
                    }
                }
            } else {
                let _ = self
                    .send(ServerMessage::Authentication(
                        AuthenticationStatus::request_auth(),
                    ))
                    .await;
                let request = match self.wait_for_authenticate(source).await {
                    Ok(request) => request,
                    Err(reason) => return AuthPhaseEnd::Ended(reason),
                };
                match self.build_connect_config(Some(&request), http_session) {
                    Some(config) => config,
                    None => {
                        self.send_error("validation", "target host required").await;
                        continue;
                    }
                }
            };

            auth.begin_dialing();
            let password = connect_config.password.clone();
            let username = connect_config.username.clone();

            let result = self
                .drive_dial(source, adapter, connect_config, dispatcher, auth)
                .await;

            match result {
                Ok(connection_id) => {
                    auth.succeeded();
                    let _ = self
                        .send(ServerMessage::Authentication(AuthenticationStatus::result(
                            true, None,
                        )))
                        .await;
                    let method = self
                        .services
                        .store
                        .get_state(&self.session_id)
                        .and_then(|s| s.auth.method)
                        .unwrap_or_default();
                    let _ = self.services.bus.publish(
                        GatewayEvent::AuthSucceeded {
                            session_id: self.session_id.clone(),
                            username: username.unwrap_or_default(),
                            method,
                        },
                        EventPriority::Normal,
                    );
                    return AuthPhaseEnd::Connected {
                        connection_id,
                        password,
                    };
                }
                Err(DialOutcome::Ended(reason)) => return AuthPhaseEnd::Ended(reason),
                Err(DialOutcome::Failed(err)) => {
                    let reason = AuthFailureReason::classify(&err);
                    // stale credentials never survive a failed attempt
                    if let Some(sid) = self.http_sid.as_deref() {
                        self.services.http_sessions.clear_credentials(sid);
                    }
                    match auth.failed(reason) {
                        AttemptOutcome::Retry { remaining } => {
                            debug!(
                                session_id = %self.session_id,
                                reason = reason.as_str(),
                                remaining,
                                "authentication attempt failed"
                            );
                            let _ = self
                                .send(ServerMessage::Authentication(
                                    AuthenticationStatus::result(
                                        false,
                                        Some(reason.user_message().to_string()),
                                    ),
                                ))
                                .await;
                        }
                        AttemptOutcome::Exhausted => {
                            let _ = self
                                .send(ServerMessage::Authentication(
                                    AuthenticationStatus::result(
                                        false,
                                        Some(reason.user_message().to_string()),
                                    ),
                                ))
                                .await;
                            let _ = self
                                .send(ServerMessage::Ssherror {
                                    message: "Authentication attempts exhausted".to_string(),
                                })
                                .await;
                            return AuthPhaseEnd::Ended(DisconnectReason::AuthExhausted);
                        }
                    }
                }
            }
        }
    }

    /// Await the dial while keeping the socket responsive: prompt replies
    /// are routed to the tracker, disconnects abort the attempt.
    async fn drive_dial(
        &self,
        source: &mut WsSource,
        adapter: &Arc<dyn ProtocolAdapter>,
        config: ConnectConfig,
        dispatcher: &PromptDispatcher,
        auth: &mut AuthStateMachine,
    ) -> Result<String, DialOutcome> {
        let mut dial = Box::pin(adapter.connect(config, Some(dispatcher.clone())));

        loop {
            tokio::select! {
                result = &mut dial => {
                    return result.map_err(DialOutcome::Failed);
                }

                _ = self.evicted.notified() => {
                    return Err(DialOutcome::Ended(DisconnectReason::Replaced));
                }

                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => match parse_client_message(&text) {
                            Ok(ClientMessage::PromptResponse(response)) => {
                                if !self.limits.admit(RiskyMessage::PromptResponse) {
                                    warn!(session_id = %self.session_id, "prompt_response rate limited");
                                    continue;
                                }
                                auth.begin_interactive();
                                if let Err(err) =
                                    self.services.prompts.resolve(&self.socket_id, response)
                                {
                                    self.send_error(err.code(), err.to_string()).await;
                                }
                            }
                            Ok(ClientMessage::Control(ControlAction::Disconnect)) => {
                                return Err(DialOutcome::Ended(DisconnectReason::ClientClosed));
                            }
                            Ok(_) => {
                                self.send_error("not_ready", "connection in progress").await;
                            }
                            Err(err) => {
                                self.send_error("validation", err.to_string()).await;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(DialOutcome::Ended(DisconnectReason::ClientClosed));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(DialOutcome::Ended(DisconnectReason::NetworkError(
                                e.to_string(),
                            )));
                        }
                    }
                }
            }
        }
    }

    async fn wait_for_authenticate(
        &self,
        source: &mut WsSource,
    ) -> Result<AuthenticateRequest, DisconnectReason> {
        let deadline = tokio::time::sleep(AUTH_WAIT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Err(DisconnectReason::Timeout),
                _ = self.evicted.notified() => return Err(DisconnectReason::Replaced),
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => match parse_client_message(&text) {
                        Ok(ClientMessage::Authenticate(request)) => return Ok(request),
                        Ok(ClientMessage::Control(ControlAction::Disconnect)) => {
                            return Err(DisconnectReason::ClientClosed);
                        }
                        Ok(_) => self.send_error("not_authenticated", "authenticate first").await,
                        Err(err) => self.send_error("validation", err.to_string()).await,
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(DisconnectReason::ClientClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(DisconnectReason::NetworkError(e.to_string()));
                    }
                },
            }
        }
    }

    async fn wait_for_terminal(
        &self,
        source: &mut WsSource,
    ) -> Result<super::protocol::TerminalRequest, DisconnectReason> {
        let deadline = tokio::time::sleep(TERMINAL_WAIT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Err(DisconnectReason::Timeout),
                _ = self.evicted.notified() => return Err(DisconnectReason::Replaced),
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => match parse_client_message(&text) {
                        Ok(ClientMessage::Terminal(request)) => return Ok(request),
                        Ok(ClientMessage::Control(ControlAction::Disconnect)) => {
                            return Err(DisconnectReason::ClientClosed);
                        }
                        Ok(_) => self.send_error("not_ready", "terminal negotiation pending").await,
                        Err(err) => self.send_error("validation", err.to_string()).await,
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(DisconnectReason::ClientClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(DisconnectReason::NetworkError(e.to_string()));
                    }
                },
            }
        }
    }

    fn ui_update(&self, http: Option<&HttpSession>) -> UiUpdate {
        let config = &self.services.config;
        let text = http
            .and_then(|s| s.header.text.clone())
            .or_else(|| config.header.text.clone());
        UiUpdate {
            header: text.map(|text| UiHeader {
                text,
                background: http
                    .and_then(|s| s.header.background.clone())
                    .unwrap_or_else(|| config.header.background.clone()),
                color: http
                    .and_then(|s| s.header.color.clone())
                    .unwrap_or_else(|| config.header.color.clone()),
            }),
            status: Some("Connected".to_string()),
            terminal: Some(config.terminal.term.clone()),
        }
    }

    async fn shell_phase(
        &self,
        source: &mut WsSource,
        adapter: &Arc<dyn ProtocolAdapter>,
        connection_id: &str,
        shell: ShellHandle,
        password: Option<Zeroizing<String>>,
        http_session: Option<&HttpSession>,
    ) -> ShellEnd {
        let ShellHandle {
            cmd_tx,
            mut data_rx,
            ..
        } = shell;

        // adapter -> socket pump; bounded outbound applies the socket-side
        // high-water mark, pausing adapter reads instead of dropping bytes
        let outbound = self.outbound.clone();
        let terminals = self.services.terminals.clone();
        let session_id = self.session_id.clone();
        let bytes_out = Arc::new(AtomicU64::new(0));
        let bytes_out_pump = bytes_out.clone();
        let mut pump = tokio::spawn(async move {
            while let Some(bytes) = data_rx.recv().await {
                bytes_out_pump.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                terminals.record(&session_id, &bytes).await;
                if outbound.send(Message::Binary(bytes.to_vec())).await.is_err() {
                    break;
                }
            }
        });

        let allow_replay = self.effective_allow_replay(http_session);
        let allow_reauth = self.services.config.options.allow_reauth;
        let allow_exec = self.services.config.options.allow_exec;
        let replay_crlf = self.services.config.options.replay_crlf;

        let end = loop {
            tokio::select! {
                _ = self.evicted.notified() => break ShellEnd::Ended(DisconnectReason::Replaced),

                _ = &mut pump => {
                    // adapter side closed
                    break ShellEnd::Ended(DisconnectReason::ShellClosed);
                }

                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            self.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
                            if cmd_tx.send(SessionCommand::Data(data)).await.is_err() {
                                break ShellEnd::Ended(DisconnectReason::ShellClosed);
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            match parse_client_message(&text) {
                                Ok(message) => {
                                    match self
                                        .handle_control_message(
                                            message,
                                            adapter,
                                            connection_id,
                                            &cmd_tx,
                                            password.as_ref(),
                                            allow_replay,
                                            allow_reauth,
                                            allow_exec,
                                            replay_crlf,
                                        )
                                        .await
                                    {
                                        ControlFlow::Continue => {}
                                        ControlFlow::Reauth => break ShellEnd::Reauth,
                                        ControlFlow::Disconnect => {
                                            break ShellEnd::Ended(DisconnectReason::ClientClosed)
                                        }
                                    }
                                }
                                Err(err) => {
                                    self.send_error("validation", err.to_string()).await;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break ShellEnd::Ended(DisconnectReason::ClientClosed);
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break ShellEnd::Ended(DisconnectReason::NetworkError(e.to_string()));
                        }
                    }
                }
            }
        };

        self.bytes_out
            .fetch_add(bytes_out.load(Ordering::Relaxed), Ordering::Relaxed);
        let _ = cmd_tx.send(SessionCommand::Close).await;
        pump.abort();
        end
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_control_message(
        &self,
        message: ClientMessage,
        adapter: &Arc<dyn ProtocolAdapter>,
        connection_id: &str,
        cmd_tx: &mpsc::Sender<SessionCommand>,
        password: Option<&Zeroizing<String>>,
        allow_replay: bool,
        allow_reauth: bool,
        allow_exec: bool,
        replay_crlf: bool,
    ) -> ControlFlow {
        match message {
            ClientMessage::Resize(request) => {
                self.services.store.dispatch(
                    &self.session_id,
                    SessionAction::TerminalResize {
                        rows: request.rows,
                        cols: request.cols,
                    },
                );
                self.services
                    .terminals
                    .resize(&self.session_id, request.rows, request.cols);
                let _ = adapter
                    .resize(connection_id, request.rows, request.cols)
                    .await;
                let _ = self.services.bus.publish(
                    GatewayEvent::TerminalResized {
                        session_id: self.session_id.clone(),
                        rows: request.rows,
                        cols: request.cols,
                    },
                    EventPriority::Low,
                );
                ControlFlow::Continue
            }

            ClientMessage::Control(action) => {
                if !self.limits.admit(RiskyMessage::Control) {
                    warn!(session_id = %self.session_id, "control message rate limited");
                    self.send_error("rate_limit", "control messages over budget")
                        .await;
                    return ControlFlow::Continue;
                }
                match action {
                    ControlAction::ReplayCredentials => {
                        if !allow_replay {
                            self.send_error("policy", "credential replay disabled").await;
                            return ControlFlow::Continue;
                        }
                        let Some(password) = password else {
                            self.send_error("policy", "no stored credentials").await;
                            return ControlFlow::Continue;
                        };
                        let mut line = password.as_bytes().to_vec();
                        if replay_crlf {
                            line.extend_from_slice(b"\r\n");
                        } else {
                            line.push(b'\n');
                        }
                        let _ = cmd_tx.send(SessionCommand::Data(line)).await;
                        debug!(session_id = %self.session_id, "credentials replayed");
                        ControlFlow::Continue
                    }
                    ControlAction::Reauth => {
                        if !allow_reauth {
                            self.send_error("policy", "reauthentication disabled").await;
                            return ControlFlow::Continue;
                        }
                        ControlFlow::Reauth
                    }
                    ControlAction::Disconnect => ControlFlow::Disconnect,
                }
            }

            ClientMessage::Exec(request) => {
                if !self.limits.admit(RiskyMessage::Exec) {
                    warn!(session_id = %self.session_id, "exec rate limited");
                    self.send_error("rate_limit", "exec over budget").await;
                    return ControlFlow::Continue;
                }
                if !allow_exec {
                    self.send_error("policy", "exec disabled").await;
                    return ControlFlow::Continue;
                }
                if let Err(err) = command_permitted(&request.command) {
                    self.send_error("policy", err.to_string()).await;
                    return ControlFlow::Continue;
                }

                let exec_request = ExecRequest {
                    pty: request.pty,
                    term: request.term.clone(),
                    rows: request.rows.unwrap_or(24),
                    cols: request.cols.unwrap_or(80),
                    env: filter_env(&request.env),
                    timeout: Duration::from_millis(request.timeout_ms.unwrap_or(60_000)),
                };

                match adapter
                    .exec(connection_id, &request.command, exec_request)
                    .await
                {
                    Ok(handle) => {
                        let outbound = self.outbound.clone();
                        tokio::spawn(async move {
                            let mut events = handle.events;
                            while let Some(event) = events.recv().await {
                                let message = match event {
                                    ExecEvent::Stdout(bytes) => ServerMessage::ExecData {
                                        stream: ExecStreamKind::Stdout,
                                        data: String::from_utf8_lossy(&bytes).into_owned(),
                                    },
                                    ExecEvent::Stderr(bytes) => ServerMessage::ExecData {
                                        stream: ExecStreamKind::Stderr,
                                        data: String::from_utf8_lossy(&bytes).into_owned(),
                                    },
                                    ExecEvent::Exit { code, signal } => {
                                        let _ = outbound
                                            .send(Message::Text(
                                                ServerMessage::ExecExit { code, signal }.to_json(),
                                            ))
                                            .await;
                                        break;
                                    }
                                };
                                if outbound
                                    .send(Message::Text(message.to_json()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        });
                    }
                    Err(err) => {
                        self.send_error(err.code(), err.user_message()).await;
                    }
                }
                ControlFlow::Continue
            }

            ClientMessage::PromptResponse(response) => {
                if !self.limits.admit(RiskyMessage::PromptResponse) {
                    warn!(session_id = %self.session_id, "prompt_response rate limited");
                    return ControlFlow::Continue;
                }
                if let Err(err) = self.services.prompts.resolve(&self.socket_id, response) {
                    self.send_error(err.code(), err.to_string()).await;
                }
                ControlFlow::Continue
            }

            ClientMessage::Authenticate(_) => {
                self.send_error("already_authenticated", "session already authenticated")
                    .await;
                ControlFlow::Continue
            }

            ClientMessage::Terminal(_) => {
                self.send_error("already_initialized", "terminal already initialized")
                    .await;
                ControlFlow::Continue
            }
        }
    }

    async fn teardown(&self, reason: &DisconnectReason) {
        self.services.prompts.remove_all_for_socket(&self.socket_id);
        // the session record stays in the store for the idle sweeper; only
        // its terminal state dies with the socket
        self.services.terminals.destroy(&self.session_id).await;
        self.services.store.dispatch(
            &self.session_id,
            SessionAction::TerminalDestroy,
        );
        let _ = self.services.bus.publish(
            GatewayEvent::TerminalDestroyed {
                session_id: self.session_id.clone(),
            },
            EventPriority::Low,
        );
        debug!(
            session_id = %self.session_id,
            reason = reason.as_str(),
            bytes_in = self.bytes_in.load(Ordering::Relaxed),
            bytes_out = self.bytes_out.load(Ordering::Relaxed),
            "bridge teardown complete"
        );
    }
}

enum ControlFlow {
    Continue,
    Reauth,
    Disconnect,
}

enum DialOutcome {
    Failed(GatewayError),
    Ended(DisconnectReason),
}
