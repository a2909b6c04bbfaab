//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through a cloneable `HandleController` that sends commands over an mpsc
//! channel and waits for a oneshot reply. No lock is ever held across an
//! `.await` on the handle.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Outcome of a keepalive round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply within the probe timeout
    Timeout,
    /// The connection is gone
    IoError,
}

impl PingResult {
    pub fn is_ok(self) -> bool {
        self == PingResult::Ok
    }
}

/// Commands sent to the handle owner task
pub enum HandleCommand {
    /// Open a session channel (shell, exec or sftp subsystem)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// `keepalive@openssh.com` with want_reply
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    Disconnect,
}

/// Cloneable sender side of the handle owner task.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Wrap a raw sender. Production code uses `spawn_handle_owner_task`.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| match e {
                russh::Error::Disconnect => SshError::Disconnected,
                other => SshError::ChannelError(other.to_string()),
            })
    }

    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Whether the owner task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Move `handle` into its owner task and return the controller.
///
/// `probe_timeout` bounds each keepalive round trip requested through
/// [`HandleController::ping`].
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    label: String,
    probe_timeout: Duration,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle;
        debug!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        // Dropped channel is closed by the server
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    let result = if handle.is_closed() {
                        PingResult::IoError
                    } else {
                        match tokio::time::timeout(probe_timeout, handle.send_keepalive(true))
                            .await
                        {
                            Ok(Ok(())) => PingResult::Ok,
                            Ok(Err(e)) => {
                                warn!("Keepalive failed for {}: {}", label, e);
                                PingResult::IoError
                            }
                            Err(_) => {
                                warn!("Keepalive timeout for {} ({:?})", label, probe_timeout);
                                PingResult::Timeout
                            }
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    debug!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx }
}

/// Answer everything still queued with a disconnect
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_on_closed_task_reports_io_error() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        drop(cmd_rx);
        let controller = HandleController::new(cmd_tx);

        assert!(!controller.is_connected());
        assert_eq!(controller.ping().await, PingResult::IoError);
        assert!(matches!(
            controller.open_session_channel().await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_drain_answers_pending_commands() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);

        let pinger = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ping().await })
        };
        // Wait until the ping is queued
        while cmd_rx.is_empty() {
            tokio::task::yield_now().await;
        }
        drain_pending_commands(&mut cmd_rx);

        assert_eq!(pinger.await.unwrap(), PingResult::IoError);
    }
}
