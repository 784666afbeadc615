//! Protocol adapter contract
//!
//! The SSH and Telnet adapters share one surface: dial and authenticate,
//! open an interactive shell, run one-shot commands, resize, and tear down.
//! Shell and exec I/O flow over bounded channels in both directions, which
//! is what gives the bridge its backpressure: a slow consumer stalls the
//! producer instead of growing a buffer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ipnet::IpNet;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::error::GatewayError;
use crate::pool::TransportStatus;
use crate::prompt::PromptDispatcher;

/// Why target resolution failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    Lookup(String),
    NoAddress,
    /// Resolved, but no address lies inside the allow-list.
    Blocked,
}

/// Resolve `host:port` and enforce the CIDR allow-list. An empty list
/// permits any target; otherwise the first allowed address wins and the
/// dial is rejected before any packet is sent when none qualifies.
pub async fn resolve_allowed(
    host: &str,
    port: u16,
    subnets: &[IpNet],
) -> Result<SocketAddr, ResolveError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ResolveError::Lookup(e.to_string()))?
        .collect();

    if addrs.is_empty() {
        return Err(ResolveError::NoAddress);
    }
    if subnets.is_empty() {
        return Ok(addrs[0]);
    }
    addrs
        .into_iter()
        .find(|addr| subnets.iter().any(|net| net.contains(&addr.ip())))
        .ok_or(ResolveError::Blocked)
}

/// Capacity of the shell data channels. Bounded on purpose.
pub const SHELL_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the exec event channel.
pub const EXEC_CHANNEL_CAPACITY: usize = 256;

/// Target and credentials for one dial.
#[derive(Clone)]
pub struct ConnectConfig {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    /// PEM-encoded private key content (not a path).
    pub private_key: Option<Zeroizing<String>>,
    pub passphrase: Option<Zeroizing<String>>,
    pub term: String,
}

impl ConnectConfig {
    pub fn has_password(&self) -> bool {
        self.password.as_ref().is_some_and(|p| !p.is_empty())
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.as_ref().is_some_and(|k| !k.is_empty())
    }
}

/// Commands accepted by an open shell.
#[derive(Debug)]
pub enum SessionCommand {
    /// Bytes for the remote stdin.
    Data(Vec<u8>),
    /// Resize the PTY (cols, rows).
    Resize(u16, u16),
    /// Close the shell.
    Close,
}

/// Geometry and environment for a new shell.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub term: String,
    pub rows: u16,
    pub cols: u16,
    pub env: HashMap<String, String>,
}

/// A live shell: commands in, output bytes out.
pub struct ShellHandle {
    pub connection_id: String,
    pub cmd_tx: mpsc::Sender<SessionCommand>,
    pub data_rx: mpsc::Receiver<Bytes>,
}

/// Options for a one-shot command.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub pty: bool,
    pub term: Option<String>,
    pub rows: u16,
    pub cols: u16,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl Default for ExecRequest {
    fn default() -> Self {
        Self {
            pty: false,
            term: None,
            rows: 24,
            cols: 80,
            env: HashMap::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Streamed exec output. `Exit` is always the final event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit {
        code: Option<u32>,
        signal: Option<String>,
    },
}

/// Receiver side of a running exec.
pub struct ExecHandle {
    pub events: mpsc::Receiver<ExecEvent>,
}

/// Fully collected exec result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub code: Option<u32>,
    pub signal: Option<String>,
}

impl ExecHandle {
    /// Drain the stream into a single outcome.
    pub async fn collect(mut self) -> ExecOutcome {
        let mut outcome = ExecOutcome::default();
        while let Some(event) = self.events.recv().await {
            match event {
                ExecEvent::Stdout(bytes) => outcome.stdout.extend_from_slice(&bytes),
                ExecEvent::Stderr(bytes) => outcome.stderr.extend_from_slice(&bytes),
                ExecEvent::Exit { code, signal } => {
                    outcome.code = code;
                    outcome.signal = signal;
                    break;
                }
            }
        }
        outcome
    }
}

/// The shared adapter surface.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Dial, authenticate, and register the connection in the pool.
    /// Returns the new connection id.
    async fn connect(
        &self,
        config: ConnectConfig,
        prompter: Option<PromptDispatcher>,
    ) -> Result<String, GatewayError>;

    /// Open an interactive shell on an established connection.
    async fn shell(
        &self,
        connection_id: &str,
        request: ShellRequest,
    ) -> Result<ShellHandle, GatewayError>;

    /// Run a single non-interactive command.
    async fn exec(
        &self,
        connection_id: &str,
        command: &str,
        request: ExecRequest,
    ) -> Result<ExecHandle, GatewayError>;

    /// Resize the open shell PTY.
    async fn resize(&self, connection_id: &str, rows: u16, cols: u16) -> Result<(), GatewayError>;

    /// Tear down one connection. Idempotent.
    async fn disconnect(&self, connection_id: &str);

    fn connection_status(&self, connection_id: &str) -> Option<TransportStatus>;

    /// Tear down every connection bound to a session.
    async fn disconnect_session(&self, session_id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_assembles_streams_and_exit() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(ExecEvent::Stdout(Bytes::from_static(b"out1")))
            .await
            .unwrap();
        tx.send(ExecEvent::Stderr(Bytes::from_static(b"err")))
            .await
            .unwrap();
        tx.send(ExecEvent::Stdout(Bytes::from_static(b"out2")))
            .await
            .unwrap();
        tx.send(ExecEvent::Exit {
            code: Some(0),
            signal: None,
        })
        .await
        .unwrap();

        let outcome = ExecHandle { events: rx }.collect().await;
        assert_eq!(outcome.stdout, b"out1out2");
        assert_eq!(outcome.stderr, b"err");
        assert_eq!(outcome.code, Some(0));
    }

    #[test]
    fn connect_config_credential_presence() {
        let config = ConnectConfig {
            session_id: "s".into(),
            host: "h".into(),
            port: 22,
            username: Some("u".into()),
            password: Some(Zeroizing::new(String::new())),
            private_key: None,
            passphrase: None,
            term: "xterm".into(),
        };
        assert!(!config.has_password());
        assert!(!config.has_private_key());
    }
}
