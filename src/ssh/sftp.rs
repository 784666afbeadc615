//! SFTP subsystem capability
//!
//! Thin wrapper over russh-sftp: every call carries a timeout and maps
//! protocol status codes onto the gateway SFTP error taxonomy. Transfer
//! streaming and listing presentation live with the consumer.

use std::time::Duration;

use russh::client::Handle;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use serde::Serialize;
use tracing::debug;

use crate::error::SftpError;

use super::client::GatewayClientHandler;
use super::error::SshError;

/// Default per-call deadline.
const SFTP_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpDirEntry {
    pub name: String,
    pub size: Option<u64>,
    pub is_dir: bool,
}

pub struct SftpChannel {
    session: SftpSession,
    timeout: Duration,
}

impl SftpChannel {
    pub(crate) async fn open(handle: &Handle<GatewayClientHandler>) -> Result<Self, SshError> {
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::ChannelError(format!("sftp subsystem: {e}")))?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::ChannelError(format!("sftp init: {e}")))?;
        debug!("sftp subsystem opened");
        Ok(Self {
            session,
            timeout: SFTP_CALL_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, SftpError>
    where
        F: std::future::Future<Output = Result<T, russh_sftp::client::error::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(map_sftp_error),
            Err(_) => Err(SftpError::Timeout),
        }
    }

    pub async fn realpath(&self, path: &str) -> Result<String, SftpError> {
        self.bounded(self.session.canonicalize(path)).await
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<SftpDirEntry>, SftpError> {
        let entries = self.bounded(self.session.read_dir(path)).await?;
        Ok(entries
            .map(|entry| {
                let metadata = entry.metadata();
                SftpDirEntry {
                    name: entry.file_name(),
                    size: metadata.size,
                    is_dir: metadata.is_dir(),
                }
            })
            .collect())
    }

    pub async fn stat(&self, path: &str) -> Result<SftpDirEntry, SftpError> {
        let metadata = self.bounded(self.session.metadata(path)).await?;
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        Ok(SftpDirEntry {
            name,
            size: metadata.size,
            is_dir: metadata.is_dir(),
        })
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.bounded(self.session.create_dir(path)).await
    }

    pub async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.bounded(self.session.remove_file(path)).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.bounded(self.session.rename(from, to)).await
    }
}

fn map_sftp_error(err: russh_sftp::client::error::Error) -> SftpError {
    if let russh_sftp::client::error::Error::Status(status) = &err {
        return match status.status_code {
            StatusCode::NoSuchFile => SftpError::NotFound(status.error_message.clone()),
            StatusCode::PermissionDenied => {
                SftpError::PermissionDenied(status.error_message.clone())
            }
            _ => SftpError::OperationFailed(status.error_message.clone()),
        };
    }
    SftpError::OperationFailed(err.to_string())
}
