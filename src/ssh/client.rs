//! SSH adapter built on russh
//!
//! Owns the dial/auth sequence, the per-connection russh handles, and the
//! lifecycle dispatches into the Session Store and Event Bus. Auth method
//! selection is strict precedence: non-empty password, then private key,
//! then keyboard-interactive; with nothing available the dial is still
//! attempted with "none" after a warning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::Disconnect;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::adapter::{
    resolve_allowed, ConnectConfig, ExecHandle, ExecRequest, ProtocolAdapter, ResolveError,
    SessionCommand, ShellHandle, ShellRequest,
};
use crate::auth::AuthMethodPolicy;
use crate::bus::{EventBus, EventPriority, GatewayEvent};
use crate::config::{AuthSection, SshSection};
use crate::error::GatewayError;
use crate::logging::{LogEvent, LogLevel, LogStatus, StructuredLogger};
use crate::pool::{ConnectionPool, PooledConnection, Protocol, TransportHandle, TransportStatus};
use crate::prompt::PromptDispatcher;
use crate::store::{SessionAction, SessionStore};

use super::channel::{spawn_exec_channel, spawn_shell_channel};
use super::error::SshError;
use super::keyboard_interactive::{InteractivePrompt, KeyboardInteractivePrompter};
use super::known_hosts::HostKeyService;

/// russh callback handler: host key verification is delegated to the
/// HostKeyService, which may prompt the owning socket.
pub struct GatewayClientHandler {
    host: String,
    port: u16,
    host_keys: Arc<HostKeyService>,
    prompter: Option<PromptDispatcher>,
}

impl GatewayClientHandler {
    pub fn new(
        host: String,
        port: u16,
        host_keys: Arc<HostKeyService>,
        prompter: Option<PromptDispatcher>,
    ) -> Self {
        Self {
            host,
            port,
            host_keys,
            prompter,
        }
    }
}

impl client::Handler for GatewayClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.host_keys
            .verify(
                &self.host,
                self.port,
                server_public_key,
                self.prompter.as_ref(),
            )
            .await
    }
}

/// Transport handle stored in the pool; ends the russh session politely.
struct RusshTransport {
    handle: Arc<Handle<GatewayClientHandler>>,
}

#[async_trait]
impl TransportHandle for RusshTransport {
    async fn end(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }
}

struct SshEntry {
    session_id: String,
    handle: Arc<Handle<GatewayClientHandler>>,
    /// Command channel of the currently open shell, if any.
    shell_cmd: Mutex<Option<mpsc::Sender<SessionCommand>>>,
}

pub struct SshAdapter {
    config: SshSection,
    policy: AuthMethodPolicy,
    subnets: Vec<IpNet>,
    pool: Arc<ConnectionPool>,
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    host_keys: Arc<HostKeyService>,
    logger: Arc<StructuredLogger>,
    entries: Arc<DashMap<String, Arc<SshEntry>>>,
}

impl SshAdapter {
    pub fn new(
        config: SshSection,
        auth_policy: AuthSection,
        subnets: Vec<IpNet>,
        pool: Arc<ConnectionPool>,
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
        host_keys: Arc<HostKeyService>,
        logger: Arc<StructuredLogger>,
    ) -> Self {
        Self {
            config,
            policy: AuthMethodPolicy::from_config(&auth_policy),
            subnets,
            pool,
            store,
            bus,
            host_keys,
            logger,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Resolve the target and enforce the subnet allow-list before any dial.
    async fn resolve_target(&self, host: &str, port: u16) -> Result<SocketAddr, SshError> {
        resolve_allowed(host, port, &self.subnets)
            .await
            .map_err(|err| match err {
                ResolveError::Lookup(e) => {
                    SshError::ConnectionFailed(format!("failed to resolve {host}: {e}"))
                }
                ResolveError::NoAddress => {
                    SshError::ConnectionFailed(format!("no address found for {host}"))
                }
                ResolveError::Blocked => {
                    self.logger.emit(
                        LogEvent::new(LogLevel::Warn, "connect", "ssh")
                            .status(LogStatus::Failure)
                            .reason("policy_block"),
                    );
                    SshError::SubnetBlocked(host.to_string())
                }
            })
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<GatewayClientHandler>,
        config: &ConnectConfig,
        prompter: Option<PromptDispatcher>,
    ) -> Result<&'static str, SshError> {
        let username = config.username.clone().unwrap_or_default();

        if config.has_password() && self.policy.permits("password") {
            let password = config.password.as_ref().map(|p| p.as_str()).unwrap_or("");
            let result = handle
                .authenticate_password(&username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
            if result.success() {
                return Ok("password");
            }
            // a password-rejecting server may still offer keyboard-interactive
            if self.keyboard_interactive_permitted() {
                debug!("password rejected, falling back to keyboard-interactive");
                return self
                    .authenticate_keyboard_interactive(handle, &username, config, prompter)
                    .await;
            }
            return Err(SshError::AuthenticationFailed(
                "password rejected by server".to_string(),
            ));
        }

        if config.has_private_key() && self.policy.permits("publickey") {
            let pem = config.private_key.as_ref().map(|k| k.as_str()).unwrap_or("");
            let passphrase = config.passphrase.as_ref().map(|p| p.as_str());
            let key = russh::keys::decode_secret_key(pem, passphrase)
                .map_err(|e| SshError::KeyError(e.to_string()))?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            let result = handle
                .authenticate_publickey(&username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
            if result.success() {
                return Ok("publickey");
            }
            return Err(SshError::AuthenticationFailed(
                "public key rejected by server".to_string(),
            ));
        }

        if self.keyboard_interactive_permitted() {
            return self
                .authenticate_keyboard_interactive(handle, &username, config, prompter)
                .await;
        }

        // Nothing usable. Attempt anyway; some targets accept "none".
        warn!("no authentication method available, attempting none");
        let result = handle
            .authenticate_none(&username)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
        if result.success() {
            Ok("none")
        } else {
            Err(SshError::NoAuthMethod)
        }
    }

    fn keyboard_interactive_permitted(&self) -> bool {
        self.policy.permits("keyboard-interactive") && !self.config.disable_interactive_auth
    }

    async fn authenticate_keyboard_interactive(
        &self,
        handle: &mut Handle<GatewayClientHandler>,
        username: &str,
        config: &ConnectConfig,
        prompter: Option<PromptDispatcher>,
    ) -> Result<&'static str, SshError> {
        let responder = KeyboardInteractivePrompter::new(
            config.password.as_ref().map(|p| p.to_string()),
            self.config.always_send_keyboard_interactive_prompts,
            prompter,
        );

        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok("keyboard-interactive"),
                KeyboardInteractiveAuthResponse::Failure { .. } => {
                    return Err(SshError::AuthenticationFailed(
                        "keyboard-interactive rejected by server".to_string(),
                    ));
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    let forwarded: Vec<InteractivePrompt> = prompts
                        .into_iter()
                        .map(|p| InteractivePrompt {
                            prompt: p.prompt,
                            echo: p.echo,
                        })
                        .collect();
                    let answers = responder.answer(&name, &instructions, &forwarded).await;
                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
                }
            }
        }
    }

    async fn connect_inner(
        &self,
        config: &ConnectConfig,
        prompter: Option<PromptDispatcher>,
    ) -> Result<(String, &'static str), SshError> {
        let addr = self.resolve_target(&config.host, config.port).await?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: if self.config.keepalive_interval > 0 {
                Some(Duration::from_millis(self.config.keepalive_interval))
            } else {
                None
            },
            keepalive_max: self.config.keepalive_count_max,
            preferred: self.config.algorithms.preferred(),
            ..Default::default()
        };

        let handler = GatewayClientHandler::new(
            config.host.clone(),
            config.port,
            self.host_keys.clone(),
            prompter.clone(),
        );

        let ready_timeout = Duration::from_millis(self.config.ready_timeout);
        let deadline = tokio::time::timeout(ready_timeout, async {
            let mut handle = client::connect(Arc::new(ssh_config), addr, handler).await?;
            debug!(host = %config.host, port = config.port, "ssh handshake completed");
            let method = self.authenticate(&mut handle, config, prompter).await?;
            Ok::<_, SshError>((handle, method))
        })
        .await;

        let (handle, method) = match deadline {
            Ok(result) => result?,
            Err(_) => {
                warn!(host = %config.host, port = config.port, "Connection timeout");
                return Err(SshError::Timeout);
            }
        };
        let handle = Arc::new(handle);

        info!(host = %config.host, port = config.port, method, "ssh authentication successful");

        // a session holds at most one live connection
        for stale in self.pool.get_by_session(&config.session_id) {
            self.disconnect(&stale.id).await;
        }

        let connection_id = uuid::Uuid::new_v4().to_string();
        let conn = Arc::new(PooledConnection::new(
            connection_id.clone(),
            config.session_id.clone(),
            Protocol::Ssh,
            config.host.clone(),
            config.port,
            config.username.clone(),
            Arc::new(RusshTransport {
                handle: handle.clone(),
            }),
        ));
        self.pool
            .add(conn)
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        self.entries.insert(
            connection_id.clone(),
            Arc::new(SshEntry {
                session_id: config.session_id.clone(),
                handle,
                shell_cmd: Mutex::new(None),
            }),
        );

        Ok((connection_id, method))
    }

    fn entry(&self, connection_id: &str) -> Result<Arc<SshEntry>, SshError> {
        self.entries
            .get(connection_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SshError::ConnectionNotFound(connection_id.to_string()))
    }

    fn require_connected(&self, connection_id: &str) -> Result<Arc<PooledConnection>, SshError> {
        let conn = self
            .pool
            .get(connection_id)
            .ok_or_else(|| SshError::ConnectionNotFound(connection_id.to_string()))?;
        if conn.status() != TransportStatus::Connected {
            return Err(SshError::NotReady(format!(
                "connection {connection_id} is {:?}",
                conn.status()
            )));
        }
        Ok(conn)
    }

    /// Open the SFTP subsystem on an established connection.
    pub async fn sftp(
        &self,
        connection_id: &str,
    ) -> Result<super::sftp::SftpChannel, GatewayError> {
        let entry = self.entry(connection_id).map_err(GatewayError::from)?;
        self.require_connected(connection_id)
            .map_err(GatewayError::from)?;
        super::sftp::SftpChannel::open(&entry.handle)
            .await
            .map_err(GatewayError::from)
    }
}

#[async_trait]
impl ProtocolAdapter for SshAdapter {
    async fn connect(
        &self,
        config: ConnectConfig,
        prompter: Option<PromptDispatcher>,
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

        match self.connect_inner(&config, prompter).await {
            Ok((connection_id, method)) => {
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
                    LogEvent::new(LogLevel::Info, "connect", "ssh")
                        .session(&session_id)
                        .connection(&connection_id)
                        .status(LogStatus::Success)
                        .duration_ms(started.elapsed().as_millis() as u64),
                );
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
                                method: None,
                            },
                        );
                        let _ = self.bus.publish(
                            GatewayEvent::AuthFailed {
                                session_id: session_id.clone(),
                                reason: auth_err.code().to_string(),
                            },
                            EventPriority::High,
                        );
                    }
                    other => {
                        self.store.dispatch(
                            &session_id,
                            SessionAction::ConnectionError {
                                error: other.user_message(),
                            },
                        );
                        let _ = self.bus.publish(
                            GatewayEvent::ConnectionErrored {
                                session_id: session_id.clone(),
                                message: other.user_message(),
                            },
                            EventPriority::High,
                        );
                    }
                }
                self.logger.emit(
                    LogEvent::new(LogLevel::Warn, "connect", "ssh")
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
        let conn = self
            .require_connected(connection_id)
            .map_err(GatewayError::from)?;

        let mut channel = entry
            .handle
            .channel_open_session()
            .await
            .map_err(|e| GatewayError::from(SshError::ChannelError(e.to_string())))?;

        // env refusal is common and harmless
        for (name, value) in &request.env {
            let _ = channel.set_env(false, name.as_str(), value.as_str()).await;
        }

        channel
            .request_pty(
                false,
                &request.term,
                request.cols as u32,
                request.rows as u32,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| GatewayError::from(SshError::ChannelError(format!("pty: {e}"))))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| GatewayError::from(SshError::ChannelError(format!("shell: {e}"))))?;

        info!(connection_id, term = %request.term, rows = request.rows, cols = request.cols, "shell opened");

        let (closed_tx, closed_rx) = oneshot::channel();
        let (cmd_tx, data_rx) = spawn_shell_channel(channel, conn, closed_tx);
        *entry.shell_cmd.lock() = Some(cmd_tx.clone());

        // close of the shell tears the whole connection down
        let pool = self.pool.clone();
        let store = self.store.clone();
        let bus = self.bus.clone();
        let entries = self.entries.clone();
        let connection_id_owned = connection_id.to_string();
        let session_id = entry.session_id.clone();
        tokio::spawn(async move {
            let _ = closed_rx.await;
            if let Some(conn) = pool.remove(&connection_id_owned) {
                conn.set_status(TransportStatus::Disconnected);
                store.dispatch(&session_id, SessionAction::ConnectionClosed);
                let _ = bus.publish(
                    GatewayEvent::ConnectionClosed {
                        session_id: session_id.clone(),
                        connection_id: connection_id_owned.clone(),
                    },
                    EventPriority::Normal,
                );
            }
            if let Some((_, entry)) = entries.remove(&connection_id_owned) {
                let _ = entry
                    .handle
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
            }
        });

        Ok(ShellHandle {
            connection_id: connection_id.to_string(),
            cmd_tx,
            data_rx,
        })
    }

    async fn exec(
        &self,
        connection_id: &str,
        command: &str,
        request: ExecRequest,
    ) -> Result<ExecHandle, GatewayError> {
        let entry = self.entry(connection_id).map_err(GatewayError::from)?;
        let conn = self
            .require_connected(connection_id)
            .map_err(GatewayError::from)?;

        let mut channel = entry
            .handle
            .channel_open_session()
            .await
            .map_err(|e| GatewayError::from(SshError::ChannelError(e.to_string())))?;

        for (name, value) in &request.env {
            let _ = channel.set_env(false, name.as_str(), value.as_str()).await;
        }

        if request.pty {
            let term = request.term.as_deref().unwrap_or("xterm-color");
            channel
                .request_pty(false, term, request.cols as u32, request.rows as u32, 0, 0, &[])
                .await
                .map_err(|e| GatewayError::from(SshError::ChannelError(format!("pty: {e}"))))?;
        }

        channel
            .exec(true, command)
            .await
            .map_err(|e| GatewayError::from(SshError::ChannelError(format!("exec: {e}"))))?;

        debug!(connection_id, command, "exec started");
        let events = spawn_exec_channel(
            channel,
            conn,
            command.to_string(),
            request.timeout,
            self.logger.clone(),
        );
        Ok(ExecHandle { events })
    }

    async fn resize(&self, connection_id: &str, rows: u16, cols: u16) -> Result<(), GatewayError> {
        let entry = self.entry(connection_id).map_err(GatewayError::from)?;
        let cmd_tx = entry.shell_cmd.lock().clone();
        if let Some(cmd_tx) = cmd_tx {
            cmd_tx
                .send(SessionCommand::Resize(cols, rows))
                .await
                .map_err(|_| GatewayError::from(SshError::Disconnected))?;
        }
        Ok(())
    }

    async fn disconnect(&self, connection_id: &str) {
        let entry = self.entries.remove(connection_id).map(|(_, e)| e);
        if let Some(entry) = &entry {
            let cmd_tx = entry.shell_cmd.lock().clone();
            if let Some(cmd_tx) = cmd_tx {
                let _ = cmd_tx.send(SessionCommand::Close).await;
            }
            let _ = entry
                .handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
        }

        if let Some(conn) = self.pool.remove(connection_id) {
            conn.set_status(TransportStatus::Disconnected);
            self.store
                .dispatch(&conn.session_id, SessionAction::ConnectionClosed);
            let _ = self.bus.publish(
                GatewayEvent::ConnectionClosed {
                    session_id: conn.session_id.clone(),
                    connection_id: connection_id.to_string(),
                },
                EventPriority::Normal,
            );
            info!(connection_id, "ssh connection disconnected");
        }
    }

    fn connection_status(&self, connection_id: &str) -> Option<TransportStatus> {
        self.pool.get(connection_id).map(|c| c.status())
    }

    async fn disconnect_session(&self, session_id: &str) {
        let connections = self.pool.get_by_session(session_id);
        for conn in connections {
            if conn.protocol == Protocol::Ssh {
                self.disconnect(&conn.id).await;
            }
        }
    }
}
