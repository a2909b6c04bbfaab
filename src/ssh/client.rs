//! SSH Client implementation using russh

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{client, ChannelMsg};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, Endpoint};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::shell::{spawn_shell, ShellCommand, ShellHandle, ShellRequest};
use super::transport::{CommandOutput, Connector, Handshake, Transport};
use crate::config::SessionSettings;
use crate::sftp::backend::{RemoteFs, RusshFs};
use crate::sftp::error::SftpError;

/// [`Connector`] opening real SSH connections.
pub struct SshConnector {
    settings: SessionSettings,
    known_hosts: Arc<KnownHostsStore>,
}

impl SshConnector {
    pub fn new(settings: SessionSettings, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            settings,
            known_hosts,
        }
    }

    /// Known hosts from `settings.known_hosts_path`, or `~/.ssh/known_hosts`
    pub fn from_settings(settings: SessionSettings) -> Self {
        let known_hosts = match &settings.known_hosts_path {
            Some(path) => KnownHostsStore::with_path(path.clone()),
            None => KnownHostsStore::user_default(),
        };
        Self::new(settings, Arc::new(known_hosts))
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn handshake(&self, endpoint: &Endpoint) -> Result<Box<dyn Handshake>, SshError> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        // Liveness is probed explicitly before each operation
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(self.settings.keepalive_interval()),
            keepalive_max: self.settings.keepalive_max,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            endpoint.host.clone(),
            endpoint.port,
            self.settings.strict_host_key_checking,
            self.known_hosts.clone(),
        );

        let handle = tokio::time::timeout(
            self.settings.connect_timeout(),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
        .map_err(|e| match e {
            SshError::HostKeyRejected(_) => e,
            other => SshError::ConnectionFailed(other.to_string()),
        })?;

        debug!("SSH handshake completed with {}", addr);

        Ok(Box::new(RusshHandshake {
            handle,
            label: endpoint.display_name(),
            command_timeout: self.settings.command_timeout(),
            probe_timeout: self.settings.probe_timeout(),
        }))
    }
}

struct RusshHandshake {
    handle: client::Handle<ClientHandler>,
    label: String,
    command_timeout: Duration,
    probe_timeout: Duration,
}

#[async_trait]
impl Handshake for RusshHandshake {
    async fn authenticate(
        self: Box<Self>,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn Transport>, SshError> {
        let RusshHandshake {
            mut handle,
            label,
            command_timeout,
            probe_timeout,
        } = *self;

        let authenticated = match &endpoint.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&endpoint.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::KeyPair {
                public_key,
                private_key,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())?;
                check_public_half(public_key, &key)?;

                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

                handle
                    .authenticate_publickey(&endpoint.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", label);

        let controller = spawn_handle_owner_task(handle, label.clone(), probe_timeout);
        Ok(Arc::new(RusshTransport {
            controller,
            authorized: AtomicBool::new(true),
            command_timeout,
            label,
            shell: Mutex::new(None),
        }))
    }

    async fn abort(self: Box<Self>) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "Connection aborted", "en")
            .await;
        debug!("Aborted handshake for {}", self.label);
    }
}

/// A provided public key must belong to the private key
fn check_public_half(public_key: &str, key: &PrivateKey) -> Result<(), SshError> {
    if public_key.trim().is_empty() {
        return Ok(());
    }
    let public = PublicKey::from_openssh(public_key.trim())
        .map_err(|e| SshError::KeyError(format!("Invalid public key: {}", e)))?;
    if public.key_data() != key.public_key().key_data() {
        return Err(SshError::KeyError(
            "Public key does not match private key".to_string(),
        ));
    }
    Ok(())
}

struct ShellControl {
    handle: ShellHandle,
    cmd_tx: mpsc::Sender<ShellCommand>,
}

/// [`Transport`] over one authenticated russh connection.
pub struct RusshTransport {
    controller: HandleController,
    authorized: AtomicBool,
    command_timeout: Duration,
    label: String,
    shell: Mutex<Option<ShellControl>>,
}

impl RusshTransport {
    fn shell_sender(&self) -> Result<mpsc::Sender<ShellCommand>, SshError> {
        self.shell
            .lock()
            .as_ref()
            .map(|s| s.cmd_tx.clone())
            .ok_or(SshError::NoShell)
    }
}

#[async_trait]
impl Transport for RusshTransport {
    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }

    async fn execute(&self, command: &str) -> Result<CommandOutput, SshError> {
        let mut channel = self.controller.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("exec failed: {}", e)))?;

        let collect = async {
            let mut output = Vec::new();
            let mut exit_status = None;
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        output.extend_from_slice(&data)
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                        exit_status = Some(status)
                    }
                    // Exit status usually arrives after EOF, wait for Close
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
            (output, exit_status)
        };

        let (output, exit_status) = tokio::time::timeout(self.command_timeout, collect)
            .await
            .map_err(|_| {
                SshError::Timeout(format!("Command timed out after {:?}", self.command_timeout))
            })?;

        debug!(
            "exec on {} finished with {:?} ({} bytes)",
            self.label,
            exit_status,
            output.len()
        );
        Ok(CommandOutput {
            text: String::from_utf8_lossy(&output).into_owned(),
            exit_status,
        })
    }

    async fn start_shell(
        &self,
        request: ShellRequest,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<ShellHandle, SshError> {
        let channel = self.controller.open_session_channel().await?;
        let handle = ShellHandle::new();
        let cmd_tx = spawn_shell(channel, &request, sink, handle.id.clone()).await?;

        let previous = self.shell.lock().replace(ShellControl {
            handle: handle.clone(),
            cmd_tx,
        });
        if let Some(previous) = previous {
            debug!("Replacing shell {} on {}", previous.handle.id, self.label);
            let _ = previous.cmd_tx.try_send(ShellCommand::Close);
        }
        Ok(handle)
    }

    async fn write_raw(&self, data: &[u8]) -> Result<(), SshError> {
        self.shell_sender()?
            .send(ShellCommand::Data(data.to_vec()))
            .await
            .map_err(|_| SshError::NoShell)
    }

    async fn resize_shell(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.shell_sender()?
            .send(ShellCommand::Resize(cols, rows))
            .await
            .map_err(|_| SshError::NoShell)
    }

    async fn stop_shell(&self) {
        let control = self.shell.lock().take();
        if let Some(control) = control {
            info!("Stopping shell {} on {}", control.handle.id, self.label);
            let _ = control.cmd_tx.send(ShellCommand::Close).await;
        }
    }

    async fn probe(&self) -> Result<(), SshError> {
        match self.controller.ping().await {
            PingResult::Ok => Ok(()),
            PingResult::Timeout => Err(SshError::Timeout("Keepalive timed out".to_string())),
            PingResult::IoError => Err(SshError::Disconnected),
        }
    }

    async fn open_sftp(&self) -> Result<Box<dyn RemoteFs>, SftpError> {
        let channel = self
            .controller
            .open_session_channel()
            .await
            .map_err(|e| SftpError::ChannelError(e.to_string()))?;
        Ok(Box::new(RusshFs::open(channel).await?))
    }

    async fn close(&self) {
        self.authorized.store(false, Ordering::Release);
        self.stop_shell().await;
        self.controller.disconnect().await;
    }
}

/// Client handler for russh callbacks: host key verification.
pub struct ClientHandler {
    host: String,
    port: u16,
    /// - true: reject unknown keys
    /// - false: trust on first use (still reject changed keys)
    strict: bool,
    known_hosts: Arc<KnownHostsStore>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self
            .known_hosts
            .verify(&self.host, self.port, server_public_key)
        {
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } if self.strict => {
                warn!(
                    "Unknown host key for {}:{} ({}), strict mode rejects it",
                    self.host, self.port, fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "unknown host {}:{} with fingerprint {}",
                    self.host, self.port, fingerprint
                )))
            }
            HostKeyVerification::Unknown { fingerprint } => {
                info!(
                    "New host {}:{}, adding to known_hosts ({})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = self
                    .known_hosts
                    .add_host(&self.host, self.port, server_public_key)
                {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} has changed (expected {}, got {})",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}
