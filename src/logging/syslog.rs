//! Buffered syslog sink
//!
//! Collects structured events in memory and periodically flushes them to a
//! syslog receiver over TCP, optionally wrapped in TLS (RFC 5425
//! octet-counted framing). A failed flush keeps the buffer for the next
//! interval, bounded by the configured cap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::SyslogSection;

/// local0.info
const PRI: u8 = 134;
const SYSLOG_VERSION: u8 = 1;

enum SyslogStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl SyslogStream {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            SyslogStream::Plain(s) => s.write_all(data).await,
            SyslogStream::Tls(s) => s.write_all(data).await,
        }
    }
}

/// Producer handle held by the structured logger.
#[derive(Clone)]
pub struct SyslogHandle {
    buffer: Arc<Mutex<Vec<String>>>,
    cap: usize,
}

impl SyslogHandle {
    /// Queue a message for the next flush. Over-cap pushes evict the oldest
    /// entry; the sink never blocks the logger.
    pub fn push(&self, message: String) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.cap {
            buffer.remove(0);
        }
        buffer.push(message);
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }
}

/// The flushing task plus its connection state.
pub struct SyslogSink {
    config: SyslogSection,
    hostname: String,
    buffer: Arc<Mutex<Vec<String>>>,
    stream: Option<SyslogStream>,
}

impl SyslogSink {
    /// Spawn the sink task and return the producer handle.
    pub fn spawn(config: SyslogSection) -> SyslogHandle {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let handle = SyslogHandle {
            buffer: buffer.clone(),
            cap: config.buffer_size.max(1),
        };

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        let mut sink = SyslogSink {
            config,
            hostname,
            buffer,
            stream: None,
        };

        tokio::spawn(async move {
            let interval = Duration::from_millis(sink.config.flush_interval.max(100));
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sink.flush().await;
            }
        });

        handle
    }

    async fn flush(&mut self) {
        let batch: Vec<String> = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let framed: Vec<u8> = batch
            .iter()
            .map(|msg| frame(&self.format_message(msg)))
            .collect::<Vec<_>>()
            .concat();

        if let Err(err) = self.write(&framed).await {
            warn!(error = %err, "syslog flush failed, retrying next interval");
            self.stream = None;
            let mut buffer = self.buffer.lock();
            let mut restored = batch;
            restored.extend(buffer.drain(..));
            restored.truncate(self.config.buffer_size.max(1));
            *buffer = restored;
        } else {
            debug!(count = batch.len(), "syslog batch flushed");
        }
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.stream.is_none() {
            self.stream = Some(self.connect().await?);
        }
        // stream is set above; a connect failure already returned
        if let Some(stream) = self.stream.as_mut() {
            stream.write_all(data).await?;
        }
        Ok(())
    }

    async fn connect(&self) -> std::io::Result<SyslogStream> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let tcp = TcpStream::connect(&addr).await?;

        if !self.config.tls {
            return Ok(SyslogStream::Plain(tcp));
        }

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(self.config.host.clone())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let tls = connector.connect(server_name, tcp).await?;
        Ok(SyslogStream::Tls(Box::new(tls)))
    }

    fn format_message(&self, message: &str) -> String {
        format!(
            "<{PRI}>{SYSLOG_VERSION} {} {} webssh2 {} - - {message}",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            self.hostname,
            std::process::id(),
        )
    }
}

/// RFC 5425 octet-counting framing.
fn frame(message: &str) -> Vec<u8> {
    let mut out = format!("{} ", message.len()).into_bytes();
    out.extend_from_slice(message.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_uses_octet_counting() {
        let framed = frame("hello");
        assert_eq!(framed, b"5 hello");
    }

    #[tokio::test]
    async fn handle_evicts_oldest_over_cap() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let handle = SyslogHandle {
            buffer: buffer.clone(),
            cap: 2,
        };
        handle.push("a".into());
        handle.push("b".into());
        handle.push("c".into());
        assert_eq!(handle.pending(), 2);
        assert_eq!(buffer.lock().clone(), vec!["b".to_string(), "c".to_string()]);
    }
}
