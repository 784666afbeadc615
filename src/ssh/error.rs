//! SSH adapter error types

use thiserror::Error;

use crate::error::{AuthError, ConnectionError, GatewayError};

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("No authentication method available")]
    NoAuthMethod,

    #[error("Authentication method blocked by policy")]
    AuthPolicyBlocked,

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection not ready: {0}")]
    NotReady(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Host key for {host}:{port} changed: expected {expected}, got {actual}")]
    HostKeyChanged {
        host: String,
        port: u16,
        expected: String,
        actual: String,
    },

    #[error("Host key for {host}:{port} rejected ({fingerprint})")]
    HostKeyRejected {
        host: String,
        port: u16,
        fingerprint: String,
    },

    #[error("Target blocked by subnet policy: {0}")]
    SubnetBlocked(String),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl From<SshError> for GatewayError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::AuthenticationFailed(_) => GatewayError::Auth(AuthError::InvalidCredentials),
            SshError::NoAuthMethod => GatewayError::Auth(AuthError::NoMethod),
            SshError::AuthPolicyBlocked => GatewayError::Auth(AuthError::PolicyBlocked),
            SshError::Timeout => GatewayError::Connection(ConnectionError::Timeout),
            SshError::SubnetBlocked(host) => {
                GatewayError::Policy(crate::error::PolicyError::SubnetBlocked(host))
            }
            SshError::HostKeyChanged {
                host,
                port,
                expected,
                actual,
            } => GatewayError::Connection(ConnectionError::HostKeyMismatch {
                host,
                port,
                expected,
                actual,
            }),
            SshError::HostKeyRejected {
                host,
                port,
                fingerprint,
            } => GatewayError::Connection(ConnectionError::HostKeyUnknown {
                host,
                port,
                fingerprint,
            }),
            SshError::Disconnected => GatewayError::Connection(ConnectionError::Closed),
            SshError::ConnectionFailed(msg) => {
                GatewayError::Connection(ConnectionError::Refused(msg))
            }
            other => GatewayError::internal(other),
        }
    }
}
