//! SSH module - transport channels over russh
//!
//! # Features
//! - Two-phase open: handshake, then password or key pair authentication
//! - Host key verification via ~/.ssh/known_hosts (TOFU or strict)
//! - Single-owner russh handle driven through a cloneable controller
//! - Blocking command execution and an interactive PTY shell
//! - [`Transport`] trait seam so the session manager can run on fakes

mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;
mod shell;
mod transport;

pub use client::{ClientHandler, RusshTransport, SshConnector};
pub use config::{AuthMethod, Endpoint, EndpointError};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use shell::{ShellCommand, ShellHandle, ShellRequest};
pub use transport::{CommandOutput, Connector, Handshake, Transport};
