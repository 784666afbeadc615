//! SSH channel I/O tasks
//!
//! Each open shell or exec gets one task that owns the russh channel and
//! shuttles between it and the bounded adapter channels. A full `data_tx`
//! stalls the loop, which stops reading from the channel and lets the SSH
//! window fill: that is the outbound backpressure path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::adapter::{
    ExecEvent, SessionCommand, EXEC_CHANNEL_CAPACITY, SHELL_CHANNEL_CAPACITY,
};
use crate::logging::{LogEvent, LogLevel, LogStatus, StructuredLogger};
use crate::pool::PooledConnection;

/// Spawn the shell loop. `closed_tx` fires exactly once when the loop ends,
/// whatever the cause.
pub fn spawn_shell_channel(
    mut channel: Channel<Msg>,
    conn: Arc<PooledConnection>,
    closed_tx: oneshot::Sender<()>,
) -> (mpsc::Sender<SessionCommand>, mpsc::Receiver<Bytes>) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(SHELL_CHANNEL_CAPACITY);
    let (data_tx, data_rx) = mpsc::channel::<Bytes>(SHELL_CHANNEL_CAPACITY);

    let connection_id = conn.id.clone();
    tokio::spawn(async move {
        debug!(connection_id = %connection_id, "shell channel handler started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!(connection_id = %connection_id, "failed to write to channel: {e}");
                                break;
                            }
                            conn.touch();
                        }
                        Some(SessionCommand::Resize(cols, rows)) => {
                            if let Err(e) = channel
                                .window_change(cols as u32, rows as u32, 0, 0)
                                .await
                            {
                                // not fatal, keep the shell running
                                error!(connection_id = %connection_id, "resize failed: {e}");
                            } else {
                                debug!(connection_id = %connection_id, cols, rows, "pty resized");
                            }
                        }
                        Some(SessionCommand::Close) | None => {
                            let _ = channel.eof().await;
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            conn.touch();
                            if data_tx.send(Bytes::copy_from_slice(&data)).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            // stderr is interleaved into the terminal stream
                            if ext == 1 {
                                conn.touch();
                                if data_tx.send(Bytes::copy_from_slice(&data)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            info!(connection_id = %connection_id, "shell channel closed");
                            break;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            debug!(connection_id = %connection_id, exit_status, "shell exit status");
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            debug!(connection_id = %connection_id, ?signal_name, "shell exit signal");
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        debug!(connection_id = %connection_id, "shell channel handler stopped");
        let _ = closed_tx.send(());
    });

    (cmd_tx, data_rx)
}

/// Spawn the exec loop. The receiver sees stdout/stderr chunks and a final
/// `Exit`; the whole run is bounded by `timeout`.
pub fn spawn_exec_channel(
    mut channel: Channel<Msg>,
    conn: Arc<PooledConnection>,
    command: String,
    timeout: Duration,
    logger: Arc<StructuredLogger>,
) -> mpsc::Receiver<ExecEvent> {
    let (events_tx, events_rx) = mpsc::channel::<ExecEvent>(EXEC_CHANNEL_CAPACITY);

    let connection_id = conn.id.clone();
    let session_id = conn.session_id.clone();
    tokio::spawn(async move {
        let started = Instant::now();
        let mut code: Option<u32> = None;
        let mut signal: Option<String> = None;
        let mut bytes_out: u64 = 0;

        let run = tokio::time::timeout(timeout, async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => {
                        conn.touch();
                        bytes_out += data.len() as u64;
                        if events_tx
                            .send(ExecEvent::Stdout(Bytes::copy_from_slice(&data)))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                        conn.touch();
                        bytes_out += data.len() as u64;
                        if events_tx
                            .send(ExecEvent::Stderr(Bytes::copy_from_slice(&data)))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        code = Some(exit_status);
                    }
                    ChannelMsg::ExitSignal { signal_name, .. } => {
                        signal = Some(format!("{signal_name:?}"));
                    }
                    ChannelMsg::Eof | ChannelMsg::Close => break,
                    _ => {}
                }
            }
        })
        .await;

        let timed_out = run.is_err();
        if timed_out {
            let _ = channel.eof().await;
        }

        let success = !timed_out && signal.is_none() && code.unwrap_or(0) == 0;
        let mut event = LogEvent::new(
            if success { LogLevel::Info } else { LogLevel::Warn },
            "exec",
            "ssh",
        )
        .session(session_id)
        .connection(connection_id)
        .status(if success {
            LogStatus::Success
        } else {
            LogStatus::Failure
        })
        .duration_ms(started.elapsed().as_millis() as u64)
        .bytes(command.len() as u64, bytes_out);
        if timed_out {
            event = event.reason("timeout");
        } else if let Some(signal) = &signal {
            event = event.reason(format!("signal {signal}"));
        }
        logger.emit(event);

        let _ = events_tx.send(ExecEvent::Exit { code, signal }).await;
    });

    events_rx
}
