//! Interactive shell channel loop

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::error::SshError;

/// Commands for a running shell
#[derive(Debug)]
pub enum ShellCommand {
    /// Bytes for the remote stdin
    Data(Vec<u8>),
    /// Resize the PTY (cols, rows)
    Resize(u32, u32),
    Close,
}

/// How to start the shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellRequest {
    /// Request a PTY before the shell
    pub pty: bool,
    pub terminal_type: String,
    pub cols: u32,
    pub rows: u32,
}

impl ShellRequest {
    pub fn pty(terminal_type: impl Into<String>, cols: u32, rows: u32) -> Self {
        Self {
            pty: true,
            terminal_type: terminal_type.into(),
            cols,
            rows,
        }
    }
}

/// Identifies one started shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellHandle {
    pub id: String,
}

impl ShellHandle {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for ShellHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Request PTY + shell on `channel` and spawn the loop pumping it.
///
/// Returns the sender used to drive the shell. The loop ends when the remote
/// side closes, `Close` is received, or every sender is dropped.
pub async fn spawn_shell(
    mut channel: Channel<Msg>,
    request: &ShellRequest,
    sink: mpsc::Sender<Vec<u8>>,
    shell_id: String,
) -> Result<mpsc::Sender<ShellCommand>, SshError> {
    if request.pty {
        channel
            .request_pty(
                false,
                &request.terminal_type,
                request.cols,
                request.rows,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;
        debug!("PTY allocated for shell {}", shell_id);
    }

    channel
        .request_shell(false)
        .await
        .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

    info!("Interactive shell {} started", shell_id);

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(1024);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ShellCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to write to shell {}: {}", shell_id, e);
                                break;
                            }
                        }
                        Some(ShellCommand::Resize(cols, rows)) => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                // Not fatal for the shell
                                error!("Failed to resize shell {}: {}", shell_id, e);
                            } else {
                                debug!("Shell {} resized to {}x{}", shell_id, cols, rows);
                            }
                        }
                        Some(ShellCommand::Close) | None => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if sink.send(data.to_vec()).await.is_err() {
                                debug!("Shell {} output receiver dropped", shell_id);
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            if sink.send(data.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            info!("Shell {} exited with status {}", shell_id, exit_status);
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            info!("Shell {} closed by remote", shell_id);
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        debug!("Shell loop {} terminated", shell_id);
    });

    Ok(cmd_tx)
}
