//! Transport seam
//!
//! The session manager never touches russh directly. It drives a
//! [`Connector`] to obtain a [`Handshake`] (TCP + key exchange done, not yet
//! authenticated), authenticates it into a [`Transport`], and from then on
//! only uses the trait methods below. Tests plug in in-memory implementations.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::config::Endpoint;
use super::error::SshError;
use super::shell::{ShellHandle, ShellRequest};
use crate::sftp::backend::RemoteFs;
use crate::sftp::error::SftpError;

/// Output of one blocking remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// stdout followed by stderr, lossily decoded
    pub text: String,
    /// `None` when the server never sent an exit status
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn new(text: impl Into<String>, exit_status: Option<u32>) -> Self {
        Self {
            text: text.into(),
            exit_status,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self.exit_status, None | Some(0))
    }
}

/// Opens the TCP connection and runs the SSH handshake for an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn handshake(&self, endpoint: &Endpoint) -> Result<Box<dyn Handshake>, SshError>;
}

/// A negotiated but unauthenticated connection.
#[async_trait]
pub trait Handshake: Send {
    /// Authenticate with the endpoint's credentials.
    async fn authenticate(self: Box<Self>, endpoint: &Endpoint)
        -> Result<Arc<dyn Transport>, SshError>;

    /// Drop the connection without authenticating
    async fn abort(self: Box<Self>);
}

/// One authenticated SSH connection.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    fn is_authorized(&self) -> bool;

    /// Run `command` to completion and collect its output.
    async fn execute(&self, command: &str) -> Result<CommandOutput, SshError>;

    /// Start the interactive shell. Output is pushed to `sink` until the
    /// shell exits or [`Transport::stop_shell`] is called; the sink is then
    /// dropped.
    async fn start_shell(
        &self,
        request: ShellRequest,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<ShellHandle, SshError>;

    /// Write bytes to the running shell's stdin
    async fn write_raw(&self, data: &[u8]) -> Result<(), SshError>;

    async fn resize_shell(&self, cols: u32, rows: u32) -> Result<(), SshError>;

    async fn stop_shell(&self);

    /// Cheap round trip proving the connection still carries traffic
    async fn probe(&self) -> Result<(), SshError>;

    /// Open the SFTP subsystem on a fresh channel
    async fn open_sftp(&self) -> Result<Box<dyn RemoteFs>, SftpError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}
