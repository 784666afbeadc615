//! Gateway error taxonomy
//!
//! Every adapter and service operation returns an explicit `Result`. Errors
//! carry a machine-readable code (`code()`), a human message (`Display`),
//! and an optional cause. The Socket Bridge maps these onto user-visible
//! wire messages; `Internal` is never surfaced raw.

use thiserror::Error;

/// Authentication failures surfaced to the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Authentication method not permitted by policy")]
    PolicyBlocked,

    #[error("No authentication method available")]
    NoMethod,

    #[error("Authentication interrupted: {0}")]
    Interrupted(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::PolicyBlocked => "policy_blocked",
            AuthError::NoMethod => "no_method",
            AuthError::Interrupted(_) => "interrupted",
        }
    }
}

/// Transport-level connection failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection timeout")]
    Timeout,

    #[error("Connection refused by {0}")]
    Refused(String),

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Host key for {host}:{port} has changed (expected {expected}, got {actual})")]
    HostKeyMismatch {
        host: String,
        port: u16,
        expected: String,
        actual: String,
    },

    #[error("Unknown host key for {host}:{port} ({fingerprint})")]
    HostKeyUnknown {
        host: String,
        port: u16,
        fingerprint: String,
    },

    #[error("Connection closed")]
    Closed,
}

impl ConnectionError {
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionError::Timeout => "timeout",
            ConnectionError::Refused(_) => "refused",
            ConnectionError::HostUnreachable(_) => "host_unreachable",
            ConnectionError::HostKeyMismatch { .. } => "host_key_changed",
            ConnectionError::HostKeyUnknown { .. } => "host_key_unknown",
            ConnectionError::Closed => "closed",
        }
    }
}

/// Wire/negotiation failures (Telnet option negotiation, unexpected
/// interactive prompts during SSH auth).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Unexpected prompt: {0}")]
    UnexpectedPrompt(String),
}

/// Policy rejections. These keep the socket open; rate limits are dropped
/// silently after a warn log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Target address not in allowed subnets: {0}")]
    SubnetBlocked(String),

    #[error("Rate limit exceeded for {0}")]
    RateLimited(&'static str),

    #[error("Too many pending prompts")]
    MaxPrompts,
}

impl PolicyError {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::SubnetBlocked(_) => "subnet_blocked",
            PolicyError::RateLimited(_) => "rate_limited",
            PolicyError::MaxPrompts => "max_prompts",
        }
    }
}

/// SFTP capability failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SftpError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("SFTP operation timed out")]
    Timeout,

    #[error("SFTP operation failed: {0}")]
    OperationFailed(String),
}

/// A message rejected at the boundary. User-visible; the socket stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Validation failed for {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Boot-time configuration failure. Fatal; the process exits 1.
#[derive(Error, Debug)]
#[error("Configuration error: {0}")]
pub struct ConfigError(pub String);

/// Top-level error union used across subsystem boundaries.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Sftp(#[from] SftpError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Reserved. Logged in full, surfaced to users as a generic message.
    #[error("Internal error")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl GatewayError {
    pub fn internal<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        GatewayError::Internal(Box::new(err))
    }

    /// Machine-readable code for structured logs and wire errors.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Auth(e) => e.code(),
            GatewayError::Connection(e) => e.code(),
            GatewayError::Protocol(ProtocolError::Negotiation(_)) => "negotiation",
            GatewayError::Protocol(ProtocolError::UnexpectedPrompt(_)) => "unexpected_prompt",
            GatewayError::Policy(e) => e.code(),
            GatewayError::Sftp(SftpError::NotFound(_)) => "sftp_not_found",
            GatewayError::Sftp(SftpError::PermissionDenied(_)) => "sftp_permission_denied",
            GatewayError::Sftp(SftpError::Timeout) => "sftp_timeout",
            GatewayError::Sftp(SftpError::OperationFailed(_)) => "sftp_failed",
            GatewayError::Validation(_) => "validation",
            GatewayError::Config(_) => "config",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Message safe to show to the remote user.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_is_never_surfaced_raw() {
        let err = GatewayError::internal(std::io::Error::new(
            std::io::ErrorKind::Other,
            "secret detail",
        ));
        assert_eq!(err.user_message(), "Internal error");
        assert_eq!(err.code(), "internal");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(AuthError::InvalidCredentials.code(), "invalid_credentials");
        assert_eq!(
            PolicyError::SubnetBlocked("192.0.2.1".into()).code(),
            "subnet_blocked"
        );
        assert_eq!(ConnectionError::Timeout.code(), "timeout");
    }
}
