//! Session Manager
//!
//! Owns at most one remote session made of two independent transports:
//! - the shell channel, used only by the interactive terminal
//! - the file-ops channel, carrying SFTP and blocking commands
//!
//! Every file operation takes the file-ops lock, probes the connection while
//! holding it, and only then touches the channel. A failed probe tears the
//! whole session down exactly once; later calls return `SessionLost` until
//! `connect` or `reconnect` succeeds. Nothing is retried.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, MutexGuard};
use tracing::{debug, info, warn};

use super::clipboard::{ClipboardMode, PendingClipboard};
use super::env_detector::{
    git_branches_cmd, has_apt, parse_git_branches, parse_os_probe, GitBranch, RemoteOs,
    APT_PROBE_CMD, HOME_CMD, OS_PROBE_CMD,
};
use super::error::{CommandError, ConnectError, FileOpError, ListError, LivenessError};
use super::external::{EndpointStore, NullEndpointStore, Reachability, RouteReachability};
use super::state::{SessionState, SessionStateMachine};
use crate::config::SessionSettings;
use crate::sftp::path_utils::{file_name, is_root, join_remote_path, parent_of};
use crate::sftp::progress::ProgressFn;
use crate::sftp::session::SftpChannel;
use crate::sftp::types::RemoteFileEntry;
use crate::sftp::SftpError;
use crate::ssh::{
    CommandOutput, Connector, Endpoint, ShellHandle, ShellRequest, SshConnector, SshError,
    Transport,
};

/// Capacity of the state broadcast channel
const EVENT_CAPACITY: usize = 16;

/// What the remote host offers, for UI hints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCapabilities {
    pub apt_available: bool,
    /// The probed directory contains a `.git` entry
    pub git_repository: bool,
}

pub(crate) struct FileChannels {
    transport: Arc<dyn Transport>,
    sftp: SftpChannel,
}

struct FileSlot {
    state: SessionStateMachine,
    channels: Option<Arc<FileChannels>>,
}

struct ShellSlot {
    state: SessionStateMachine,
    transport: Option<Arc<dyn Transport>>,
    shell: Option<ShellHandle>,
}

pub struct SessionManager {
    connector: Arc<dyn Connector>,
    reachability: Arc<dyn Reachability>,
    endpoint_store: Arc<dyn EndpointStore>,
    settings: SessionSettings,

    state: Mutex<SessionStateMachine>,
    events: broadcast::Sender<SessionState>,

    /// Last endpoint passed to `connect`; kept for `reconnect`
    endpoint: RwLock<Option<Endpoint>>,

    /// File-ops lock. Lock order: files, then shell.
    files: tokio::sync::Mutex<FileSlot>,
    shell: tokio::sync::Mutex<ShellSlot>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, settings: SessionSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            reachability: Arc::new(RouteReachability::new()),
            endpoint_store: Arc::new(NullEndpointStore),
            settings,
            state: Mutex::new(SessionStateMachine::new()),
            events,
            endpoint: RwLock::new(None),
            files: tokio::sync::Mutex::new(FileSlot {
                state: SessionStateMachine::new(),
                channels: None,
            }),
            shell: tokio::sync::Mutex::new(ShellSlot {
                state: SessionStateMachine::new(),
                transport: None,
                shell: None,
            }),
        }
    }

    /// Manager over real SSH connections
    pub fn with_russh(settings: SessionSettings) -> Self {
        let connector = Arc::new(SshConnector::from_settings(settings.clone()));
        Self::new(connector, settings)
    }

    pub fn with_reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.reachability = reachability;
        self
    }

    pub fn with_endpoint_store(mut self, store: Arc<dyn EndpointStore>) -> Self {
        self.endpoint_store = store;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().current()
    }

    /// Session-level state changes, in order
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.events.subscribe()
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.read().clone()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// PTY request built from the terminal settings
    pub fn default_shell_request(&self) -> ShellRequest {
        ShellRequest::pty(
            self.settings.terminal_type.clone(),
            self.settings.cols,
            self.settings.rows,
        )
    }

    fn transition(&self, next: SessionState) {
        let result = self.state.lock().transition(next);
        match result {
            Ok(true) => {
                info!("Session state -> {}", next);
                let _ = self.events.send(next);
            }
            Ok(false) => {}
            Err(e) => warn!("{}", e),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open both channels to `endpoint`, replacing any current session.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<(), ConnectError> {
        if self.state() == SessionState::Closed {
            return Err(ConnectError::Closed);
        }
        endpoint.validate()?;

        if !self.reachability.is_network_available().await {
            warn!("No network route, not connecting to {}", endpoint.display_name());
            return Err(ConnectError::NetworkUnavailable);
        }

        let mut files = self.files.lock().await;
        if self.state() == SessionState::Closed {
            return Err(ConnectError::Closed);
        }
        self.teardown_locked(&mut files).await;

        *self.endpoint.write() = Some(endpoint.clone());
        self.transition(SessionState::Connecting);
        info!("Connecting to {}", endpoint.display_name());

        let mut shell = self.shell.lock().await;
        match self.open_channels(&endpoint, &mut files, &mut shell).await {
            Ok(()) => {
                drop(shell);
                self.transition(SessionState::ConnectedAndAuthorized);
                info!("Session established with {}", endpoint.display_name());
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", endpoint.display_name(), e);
                advance(&mut files.state, SessionState::Disconnected, "files");
                advance(&mut shell.state, SessionState::Disconnected, "shell");
                drop(shell);
                self.transition(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Handshake both transports, then authenticate both, then open SFTP.
    /// On failure whatever was opened is closed again.
    async fn open_channels(
        &self,
        endpoint: &Endpoint,
        files: &mut FileSlot,
        shell: &mut ShellSlot,
    ) -> Result<(), ConnectError> {
        advance(&mut shell.state, SessionState::Connecting, "shell");
        advance(&mut files.state, SessionState::Connecting, "files");

        let shell_handshake = self.connector.handshake(endpoint).await?;
        let files_handshake = match self.connector.handshake(endpoint).await {
            Ok(handshake) => handshake,
            Err(e) => {
                shell_handshake.abort().await;
                return Err(e.into());
            }
        };

        advance(&mut shell.state, SessionState::ConnectedUnauthenticated, "shell");
        advance(&mut files.state, SessionState::ConnectedUnauthenticated, "files");
        self.transition(SessionState::ConnectedUnauthenticated);

        let shell_transport = match shell_handshake.authenticate(endpoint).await {
            Ok(transport) => transport,
            Err(e) => {
                files_handshake.abort().await;
                return Err(e.into());
            }
        };
        advance(&mut shell.state, SessionState::ConnectedAndAuthorized, "shell");

        let files_transport = match files_handshake.authenticate(endpoint).await {
            Ok(transport) => transport,
            Err(e) => {
                shell_transport.close().await;
                return Err(e.into());
            }
        };

        let sftp = match open_sftp(files_transport.as_ref(), self.settings.effective_chunk_size())
            .await
        {
            Ok(sftp) => sftp,
            Err(e) => {
                shell_transport.close().await;
                files_transport.close().await;
                return Err(ConnectError::SftpUnavailable(e.to_string()));
            }
        };
        advance(&mut files.state, SessionState::ConnectedAndAuthorized, "files");

        shell.transport = Some(shell_transport);
        files.channels = Some(Arc::new(FileChannels {
            transport: files_transport,
            sftp,
        }));
        Ok(())
    }

    /// `connect` again with the retained endpoint.
    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        if self.state() == SessionState::Closed {
            return Err(ConnectError::Closed);
        }
        let endpoint = self.endpoint().ok_or(ConnectError::NoEndpoint)?;
        info!("Reconnecting to {}", endpoint.display_name());
        self.connect(endpoint).await
    }

    /// Close both channels and forget the endpoint. Idempotent.
    pub async fn disconnect(&self) {
        let mut files = self.files.lock().await;
        if self.teardown_locked(&mut files).await {
            info!("Disconnected");
        }
        *self.endpoint.write() = None;
    }

    /// Disconnect for good. The manager rejects `connect` afterwards.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.transition(SessionState::Closed);
    }

    /// Close and clear both channels. Returns whether anything was open.
    async fn teardown_locked(&self, files: &mut FileSlot) -> bool {
        let file_channels = files.channels.take();
        let mut shell = self.shell.lock().await;
        let shell_transport = shell.transport.take();
        shell.shell = None;

        let had_session = file_channels.is_some() || shell_transport.is_some();

        if let Some(channels) = file_channels {
            channels.sftp.close().await;
            channels.transport.close().await;
        }
        if let Some(transport) = shell_transport {
            transport.stop_shell().await;
            transport.close().await;
        }

        advance(&mut files.state, SessionState::Disconnected, "files");
        advance(&mut shell.state, SessionState::Disconnected, "shell");
        drop(shell);

        if had_session {
            self.transition(SessionState::Disconnected);
        }
        had_session
    }

    async fn teardown(&self) {
        let mut files = self.files.lock().await;
        self.teardown_locked(&mut files).await;
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Take the file-ops lock and prove the session is still alive.
    pub(crate) async fn file_ops(&self) -> Result<FileOps<'_>, LivenessError> {
        let mut guard = self.files.lock().await;
        let Some(channels) = guard.channels.clone() else {
            return Err(LivenessError::SessionLost);
        };

        let shell_ok = {
            let shell = self.shell.lock().await;
            shell
                .transport
                .as_ref()
                .is_some_and(|t| t.is_connected() && t.is_authorized())
        };
        let files_ok = channels.transport.is_connected() && channels.transport.is_authorized();

        let alive = shell_ok
            && files_ok
            && match channels.transport.probe().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Liveness probe failed: {}", e);
                    false
                }
            };

        if !alive {
            warn!("Session lost, tearing down");
            self.teardown_locked(&mut guard).await;
            return Err(LivenessError::SessionLost);
        }

        Ok(FileOps {
            manager: self,
            guard,
            channels,
        })
    }

    /// Probe the session; tears it down if it is gone.
    pub async fn ensure_live(&self) -> Result<(), LivenessError> {
        self.file_ops().await.map(|_| ())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Run `command` on the file-ops transport; output with trailing
    /// control characters trimmed.
    pub async fn execute_command(&self, command: &str) -> Result<String, CommandError> {
        let output = self.execute_raw(command).await?;
        match output.exit_status {
            Some(127) => Err(CommandError::NotFound(command.to_string())),
            Some(126) => Err(CommandError::PermissionDenied(command.to_string())),
            _ => Ok(trim_trailing_control(&output.text)),
        }
    }

    async fn execute_raw(&self, command: &str) -> Result<CommandOutput, CommandError> {
        let ops = self.file_ops().await?;
        execute_on(ops, command).await
    }

    /// Login directory of the remote user, `/` when `$HOME` is empty
    pub async fn home_directory(&self) -> Result<String, CommandError> {
        let home = self.execute_command(HOME_CMD).await?;
        if home.is_empty() {
            Ok("/".to_string())
        } else {
            Ok(home)
        }
    }

    /// Replace a leading `~` with the remote home directory.
    pub async fn expand_home(&self, path: &str) -> Result<String, CommandError> {
        if path == "~" {
            return self.home_directory().await;
        }
        match path.strip_prefix("~/") {
            Some(rest) => Ok(join_remote_path(&self.home_directory().await?, rest)),
            None => Ok(path.to_string()),
        }
    }

    /// Fingerprint the remote OS and write it back to the endpoint record.
    pub async fn detect_os(&self) -> Result<RemoteOs, CommandError> {
        let output = self.execute_raw(OS_PROBE_CMD).await?;
        let os = parse_os_probe(&output.text);
        let fingerprint = os.fingerprint();
        info!("Remote OS: {}", fingerprint);

        let updated = {
            let mut endpoint = self.endpoint.write();
            endpoint.as_mut().map(|ep| {
                ep.cached_os_fingerprint = Some(fingerprint.clone());
                ep.clone()
            })
        };
        if let Some(endpoint) = updated {
            self.endpoint_store
                .save_os_fingerprint(&endpoint, &fingerprint);
        }
        Ok(os)
    }

    pub async fn probe_capabilities(&self, dir: &str) -> Result<RemoteCapabilities, CommandError> {
        let apt = self.execute_raw(APT_PROBE_CMD).await?;
        let entries = self.list_directory(dir, true).await?;

        let caps = RemoteCapabilities {
            apt_available: apt.success() && has_apt(&apt.text),
            git_repository: entries
                .iter()
                .any(|e| !e.is_parent_link && e.name == ".git"),
        };
        debug!("Capabilities of {}: {:?}", dir, caps);
        Ok(caps)
    }

    /// Local branches of the repository at `repo`; empty when it is not one.
    pub async fn git_branches(&self, repo: &str) -> Result<Vec<GitBranch>, CommandError> {
        let ops = self.file_ops().await?;
        let command = git_branches_cmd(&ops.sftp().resolve(repo));
        let output = execute_on(ops, &command).await?;
        if !output.success() {
            debug!("git branch failed in {}: {}", repo, output.text.trim_end());
            return Ok(Vec::new());
        }
        Ok(parse_git_branches(&output.text))
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Listing of `path` with a synthetic `..` row on non-root directories.
    pub async fn list_directory(
        &self,
        path: &str,
        include_hidden: bool,
    ) -> Result<Vec<RemoteFileEntry>, ListError> {
        let ops = self.file_ops().await?;
        let dir = ops.sftp().resolve(path);

        let result = ops.sftp().list(&dir).await;
        let mut entries = match result {
            Ok(entries) => entries,
            Err(e) => return Err(settle(ops, e).await),
        };

        if !is_root(&dir) {
            let parent_meta = ops.sftp().metadata(&parent_of(&dir)).await.ok();
            entries.push(RemoteFileEntry::parent_link(&dir, parent_meta.as_ref()));
        }
        drop(ops);

        if !include_hidden {
            entries.retain(|e| !e.is_hidden());
        }
        Ok(entries)
    }

    pub async fn stat(&self, path: &str) -> Result<RemoteFileEntry, FileOpError> {
        let ops = self.file_ops().await?;
        let result = ops.sftp().stat(path).await;
        finish(ops, result).await
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), FileOpError> {
        let ops = self.file_ops().await?;
        let result = ops.sftp().create_directory(path).await;
        finish(ops, result).await
    }

    pub async fn create_empty_file(&self, path: &str) -> Result<(), FileOpError> {
        let ops = self.file_ops().await?;
        let result = ops.sftp().create_empty_file(path).await;
        finish(ops, result).await
    }

    /// Remove a file or an empty directory
    pub async fn remove(&self, path: &str) -> Result<(), FileOpError> {
        let ops = self.file_ops().await?;
        let result = ops.sftp().remove(path).await;
        finish(ops, result).await
    }

    /// Remove a directory tree; returns the number of removed entries.
    pub async fn remove_directory_recursive(&self, path: &str) -> Result<u64, FileOpError> {
        let ops = self.file_ops().await?;
        let result = ops.sftp().remove_directory_recursive(path).await;
        finish(ops, result).await
    }

    pub async fn move_item(&self, source: &str, dest: &str) -> Result<(), FileOpError> {
        let ops = self.file_ops().await?;
        let result = ops.sftp().move_item(source, dest).await;
        finish(ops, result).await
    }

    pub async fn copy_item(
        &self,
        source: &str,
        dest: &str,
        progress: &mut ProgressFn<'_>,
    ) -> Result<u64, FileOpError> {
        let ops = self.file_ops().await?;
        let result = ops.sftp().copy(source, dest, progress).await;
        finish(ops, result).await
    }

    pub async fn read_file(
        &self,
        path: &str,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Vec<u8>, FileOpError> {
        let ops = self.file_ops().await?;
        let result = ops.sftp().read(path, progress).await;
        finish(ops, result).await
    }

    pub async fn write_file(
        &self,
        bytes: &[u8],
        path: &str,
        progress: &mut ProgressFn<'_>,
    ) -> Result<u64, FileOpError> {
        let ops = self.file_ops().await?;
        let result = ops.sftp().write(bytes, path, progress).await;
        finish(ops, result).await
    }

    /// Copy or move the clipboard's path into `destination_dir`.
    ///
    /// The clipboard is emptied whatever the outcome. Returns the new path.
    pub async fn paste(
        &self,
        clipboard: &PendingClipboard,
        destination_dir: &str,
        progress: &mut ProgressFn<'_>,
    ) -> Result<String, FileOpError> {
        let entry = clipboard.take().ok_or(FileOpError::ClipboardEmpty)?;

        let ops = self.file_ops().await?;
        let dir = ops.sftp().resolve(destination_dir);
        let dest = join_remote_path(&dir, file_name(&entry.path));
        info!("Pasting {} ({:?}) to {}", entry.path, entry.mode, dest);

        let result = match entry.mode {
            ClipboardMode::Copy => ops
                .sftp()
                .copy(&entry.path, &dest, progress)
                .await
                .map(|_| ()),
            ClipboardMode::Move => ops.sftp().move_item(&entry.path, &dest).await,
        };
        finish(ops, result).await.map(|()| dest)
    }

    // ========================================================================
    // Terminal
    // ========================================================================

    /// Start the interactive shell; its output is streamed to `sink`.
    pub async fn start_terminal(
        &self,
        request: ShellRequest,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<ShellHandle, CommandError> {
        self.ensure_live().await?;

        let mut shell = self.shell.lock().await;
        let Some(transport) = shell.transport.clone() else {
            return Err(CommandError::SessionLost);
        };
        let result = transport.start_shell(request, sink).await;
        match result {
            Ok(handle) => {
                info!("Terminal {} started", handle.id);
                shell.shell = Some(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                drop(shell);
                Err(self.settle_shell(transport, e).await)
            }
        }
    }

    pub async fn write_terminal(&self, data: &[u8]) -> Result<(), CommandError> {
        let transport = self.shell_transport().await?;
        match transport.write_raw(data).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.settle_shell(transport, e).await),
        }
    }

    pub async fn resize_terminal(&self, cols: u32, rows: u32) -> Result<(), CommandError> {
        let transport = self.shell_transport().await?;
        match transport.resize_shell(cols, rows).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.settle_shell(transport, e).await),
        }
    }

    pub async fn stop_terminal(&self) {
        let mut shell = self.shell.lock().await;
        if let (Some(handle), Some(transport)) = (shell.shell.take(), shell.transport.clone()) {
            info!("Stopping terminal {}", handle.id);
            transport.stop_shell().await;
        }
    }

    /// The shell transport if its flags are still up. No probe: this sits
    /// on the keystroke path.
    async fn shell_transport(&self) -> Result<Arc<dyn Transport>, LivenessError> {
        let transport = {
            let shell = self.shell.lock().await;
            shell.transport.clone()
        };
        match transport {
            Some(t) if t.is_connected() && t.is_authorized() => Ok(t),
            Some(_) => {
                warn!("Shell channel dropped, tearing down session");
                self.teardown().await;
                Err(LivenessError::SessionLost)
            }
            None => Err(LivenessError::SessionLost),
        }
    }

    async fn settle_shell(&self, transport: Arc<dyn Transport>, err: SshError) -> CommandError {
        if err.is_transport_failure() && transport.probe().await.is_err() {
            warn!("Shell channel failed ({}), tearing down session", err);
            self.teardown().await;
            return CommandError::SessionLost;
        }
        err.into()
    }
}

/// The file-ops lock plus the live channels it guards.
pub(crate) struct FileOps<'a> {
    manager: &'a SessionManager,
    guard: MutexGuard<'a, FileSlot>,
    channels: Arc<FileChannels>,
}

impl FileOps<'_> {
    pub(crate) fn sftp(&self) -> &SftpChannel {
        &self.channels.sftp
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.channels.transport.as_ref()
    }

    /// After a failed operation: re-probe if the failure looks like the
    /// transport, and tear the session down if the probe fails too.
    /// Returns whether the session was torn down.
    pub(crate) async fn recover(mut self, transport_failure: bool) -> bool {
        if !transport_failure {
            return false;
        }
        if self.channels.transport.probe().await.is_ok() {
            return false;
        }
        warn!("Transport failed during operation, tearing down session");
        self.manager.teardown_locked(&mut self.guard).await;
        true
    }
}

async fn open_sftp(transport: &dyn Transport, chunk_size: usize) -> Result<SftpChannel, SftpError> {
    let fs = transport.open_sftp().await?;
    SftpChannel::open(fs, chunk_size).await
}

async fn execute_on(ops: FileOps<'_>, command: &str) -> Result<CommandOutput, CommandError> {
    debug!("exec: {}", command);
    let result = ops.transport().execute(command).await;
    match result {
        Ok(output) => Ok(output),
        Err(e) => {
            if ops.recover(e.is_transport_failure()).await {
                Err(CommandError::SessionLost)
            } else {
                Err(CommandError::Transport(e))
            }
        }
    }
}

/// Map an SFTP failure, tearing the session down if it died under us.
async fn settle<E>(ops: FileOps<'_>, err: SftpError) -> E
where
    E: From<SftpError> + From<LivenessError>,
{
    if ops.recover(err.is_transport_failure()).await {
        LivenessError::SessionLost.into()
    } else {
        err.into()
    }
}

async fn finish<T, E>(ops: FileOps<'_>, result: Result<T, SftpError>) -> Result<T, E>
where
    E: From<SftpError> + From<LivenessError>,
{
    match result {
        Ok(value) => Ok(value),
        Err(e) => Err(settle(ops, e).await),
    }
}

fn advance(machine: &mut SessionStateMachine, next: SessionState, channel: &str) {
    if let Err(e) = machine.transition(next) {
        warn!("{} channel: {}", channel, e);
    }
}

fn trim_trailing_control(text: &str) -> String {
    text.trim_end_matches(|c: char| c.is_control()).to_string()
}
