//! In-memory stand-ins for the SSH server, used by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};

use crate::session::external::{EndpointStore, Reachability};
use crate::sftp::backend::{RemoteDirEntry, RemoteFs, RemoteReader, RemoteWriter};
use crate::sftp::path_utils::{normalize_remote_path, parent_of, resolve_remote_path};
use crate::sftp::types::RemoteMetadata;
use crate::sftp::SftpError;
use crate::ssh::{
    AuthMethod, CommandOutput, Connector, Endpoint, Handshake, ShellHandle, ShellRequest,
    SshError, Transport,
};

// ============================================================================
// Remote filesystem
// ============================================================================

enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Default)]
struct FsState {
    home: String,
    nodes: BTreeMap<String, Node>,
    rejected_writes: HashSet<String>,
    failing_removals: HashSet<String>,
    removals: Vec<String>,
    /// Next `open_write` waits for this before touching the tree
    write_gate: Option<Arc<Notify>>,
    activity: Activity,
}

/// Remote operations as the server sees them
#[derive(Default)]
struct Activity {
    in_flight: usize,
    max_in_flight: usize,
    events: Vec<String>,
}

impl FsState {
    fn ensure_dirs(&mut self, path: &str) {
        let mut current = String::new();
        self.nodes.entry("/".to_string()).or_insert(Node::Dir);
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.nodes.entry(current.clone()).or_insert(Node::Dir);
        }
    }

    fn metadata(&self, path: &str) -> Option<RemoteMetadata> {
        match self.nodes.get(path)? {
            Node::File(data) => Some(RemoteMetadata::file(data.len() as u64)),
            Node::Dir => Some(RemoteMetadata::directory()),
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn children(&self, dir: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|k| k.as_str() != "/" && parent_of(k) == dir)
            .cloned()
            .collect()
    }
}

/// Shared in-memory tree implementing [`RemoteFs`]. Clones see the same tree.
#[derive(Clone, Default)]
pub struct MemoryFs {
    state: Arc<Mutex<FsState>>,
}

impl MemoryFs {
    pub fn with_home(home: &str) -> Self {
        let fs = Self::default();
        {
            let mut state = fs.state.lock();
            state.home = normalize_remote_path(home);
            let home = state.home.clone();
            state.ensure_dirs(&home);
        }
        fs
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        state.ensure_dirs(&parent_of(path));
        state
            .nodes
            .insert(normalize_remote_path(path), Node::File(data.to_vec()));
    }

    pub fn add_dir(&self, path: &str) {
        self.state.lock().ensure_dirs(&normalize_remote_path(path));
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(path)? {
            Node::File(data) => Some(data.clone()),
            Node::Dir => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    /// Writes to `path` are accepted with zero bytes, like a full disk
    pub fn reject_writes_to(&self, path: &str) {
        self.state
            .lock()
            .rejected_writes
            .insert(path.to_string());
    }

    pub fn fail_removal_of(&self, path: &str) {
        self.state
            .lock()
            .failing_removals
            .insert(path.to_string());
    }

    /// Successful removals, in order
    pub fn removal_log(&self) -> Vec<String> {
        self.state.lock().removals.clone()
    }

    /// Hold the next `open_write` until the returned gate is notified
    pub fn hold_next_write(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().write_gate = Some(gate.clone());
        gate
    }

    /// Operations currently running against the tree
    pub fn in_flight(&self) -> usize {
        self.state.lock().activity.in_flight
    }

    /// Highest number of operations ever running at once
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().activity.max_in_flight
    }

    /// `start <op>` / `end <op>` markers, in order
    pub fn activity_log(&self) -> Vec<String> {
        self.state.lock().activity.events.clone()
    }

    /// Mark `op` as running until the returned guard drops
    pub fn begin(&self, op: &str) -> InFlight {
        {
            let mut state = self.state.lock();
            let activity = &mut state.activity;
            activity.in_flight += 1;
            activity.max_in_flight = activity.max_in_flight.max(activity.in_flight);
            activity.events.push(format!("start {}", op));
        }
        InFlight {
            fs: self.clone(),
            op: op.to_string(),
        }
    }

    fn absolute(&self, path: &str) -> String {
        let state = self.state.lock();
        resolve_remote_path(path, &state.home, &state.home)
    }
}

pub struct InFlight {
    fs: MemoryFs,
    op: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.fs.state.lock();
        state.activity.in_flight -= 1;
        state.activity.events.push(format!("end {}", self.op));
    }
}

/// Reads the live node, so a truncation after open is visible
struct MemoryReader {
    fs: MemoryFs,
    path: String,
    offset: usize,
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let n = {
            let state = self.fs.state.lock();
            match state.nodes.get(&self.path) {
                Some(Node::File(data)) => {
                    let rest = data.get(self.offset..).unwrap_or_default();
                    let n = rest.len().min(buf.remaining());
                    buf.put_slice(&rest[..n]);
                    n
                }
                _ => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "file vanished",
                    )))
                }
            }
        };
        self.offset += n;
        Poll::Ready(Ok(()))
    }
}

struct MemoryWriter {
    fs: MemoryFs,
    path: String,
    rejected: bool,
    _op: InFlight,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.rejected {
            return Poll::Ready(Ok(0));
        }
        let mut state = self.fs.state.lock();
        match state.nodes.get_mut(&self.path) {
            Some(Node::File(data)) => {
                data.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            _ => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "file vanished",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        let path = self.absolute(path);
        if self.exists(&path) {
            Ok(path)
        } else {
            Err(SftpError::NotFound(path))
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError> {
        let path = self.absolute(path);
        let _op = self.begin(&format!("read_dir {}", path));
        let state = self.state.lock();
        if !state.nodes.contains_key(&path) {
            return Err(SftpError::NotFound(path));
        }
        if !state.is_dir(&path) {
            return Err(SftpError::NotADirectory(path));
        }
        Ok(state
            .children(&path)
            .into_iter()
            .filter_map(|child| {
                let metadata = state.metadata(&child)?;
                let name = child.rsplit('/').next().unwrap_or_default().to_string();
                Some(RemoteDirEntry { name, metadata })
            })
            .collect())
    }

    async fn metadata(&self, path: &str) -> Result<RemoteMetadata, SftpError> {
        let path = self.absolute(path);
        self.state
            .lock()
            .metadata(&path)
            .ok_or(SftpError::NotFound(path))
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        let path = self.absolute(path);
        match self.state.lock().nodes.get(&path) {
            Some(Node::File(_)) => {}
            Some(Node::Dir) => return Err(SftpError::IsADirectory(path.clone())),
            None => return Err(SftpError::NotFound(path.clone())),
        }
        Ok(Box::pin(MemoryReader {
            fs: self.clone(),
            path,
            offset: 0,
        }))
    }

    async fn open_write(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        let path = self.absolute(path);
        let op = self.begin(&format!("write {}", path));
        let gate = self.state.lock().write_gate.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let rejected = {
            let mut state = self.state.lock();
            if !state.is_dir(&parent_of(&path)) {
                return Err(SftpError::NotFound(path));
            }
            if state.is_dir(&path) {
                return Err(SftpError::IsADirectory(path));
            }
            state.nodes.insert(path.clone(), Node::File(Vec::new()));
            state.rejected_writes.contains(&path)
        };
        Ok(Box::pin(MemoryWriter {
            fs: self.clone(),
            path,
            rejected,
            _op: op,
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        let from = self.absolute(from);
        let to = self.absolute(to);
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&from) {
            return Err(SftpError::NotFound(from));
        }
        if !state.is_dir(&parent_of(&to)) {
            return Err(SftpError::NotFound(to));
        }
        if state.nodes.contains_key(&to) {
            return Err(SftpError::Rejected(format!("{} already exists", to)));
        }

        let prefix = format!("{}/", from);
        let moved: Vec<String> = state
            .nodes
            .keys()
            .filter(|k| **k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = state.nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                state.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        let path = self.absolute(path);
        let mut state = self.state.lock();
        if state.failing_removals.contains(&path) {
            return Err(SftpError::PermissionDenied(path));
        }
        match state.nodes.get(&path) {
            Some(Node::File(_)) => {}
            Some(Node::Dir) => return Err(SftpError::IsADirectory(path)),
            None => return Err(SftpError::NotFound(path)),
        }
        state.nodes.remove(&path);
        state.removals.push(path);
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        let path = self.absolute(path);
        let mut state = self.state.lock();
        if state.failing_removals.contains(&path) {
            return Err(SftpError::PermissionDenied(path));
        }
        if !state.nodes.contains_key(&path) {
            return Err(SftpError::NotFound(path));
        }
        if !state.is_dir(&path) {
            return Err(SftpError::NotADirectory(path));
        }
        if !state.children(&path).is_empty() {
            return Err(SftpError::Rejected(format!("{} is not empty", path)));
        }
        state.nodes.remove(&path);
        state.removals.push(path);
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        let path = self.absolute(path);
        let mut state = self.state.lock();
        if !state.is_dir(&parent_of(&path)) {
            return Err(SftpError::NotFound(path));
        }
        if state.nodes.contains_key(&path) {
            return Err(SftpError::Rejected(format!("{} already exists", path)));
        }
        state.nodes.insert(path, Node::Dir);
        Ok(())
    }

    async fn close(&self) {}
}

// ============================================================================
// SSH server
// ============================================================================

struct ServerState {
    password: String,
    reachable: bool,
    sftp_available: bool,
    link_up: bool,
    commands: HashMap<String, CommandOutput>,
    handshakes: usize,
    open_transports: usize,
    shell_size: Option<(u32, u32)>,
}

/// Scriptable fake server behind [`Connector`]. Clones share state.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
    fs: MemoryFs,
}

impl FakeServer {
    /// Server accepting `password`, login directory `/home/user`
    pub fn new(password: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                password: password.to_string(),
                reachable: true,
                sftp_available: true,
                link_up: true,
                commands: HashMap::new(),
                handshakes: 0,
                open_transports: 0,
                shell_size: None,
            })),
            fs: MemoryFs::with_home("/home/user"),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            server: self.clone(),
        })
    }

    pub fn fs(&self) -> MemoryFs {
        self.fs.clone()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn set_sftp_available(&self, available: bool) {
        self.state.lock().sftp_available = available;
    }

    /// Drop (or restore) the network under every open transport
    pub fn set_link_up(&self, up: bool) {
        self.state.lock().link_up = up;
    }

    /// Reply to `command`; anything unscripted exits 127
    pub fn script(&self, command: &str, text: &str, exit_status: Option<u32>) {
        self.state
            .lock()
            .commands
            .insert(command.to_string(), CommandOutput::new(text, exit_status));
    }

    pub fn handshakes(&self) -> usize {
        self.state.lock().handshakes
    }

    pub fn open_transports(&self) -> usize {
        self.state.lock().open_transports
    }

    pub fn shell_size(&self) -> Option<(u32, u32)> {
        self.state.lock().shell_size
    }
}

struct FakeConnector {
    server: FakeServer,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn handshake(&self, endpoint: &Endpoint) -> Result<Box<dyn Handshake>, SshError> {
        let mut state = self.server.state.lock();
        state.handshakes += 1;
        if !state.reachable || !state.link_up {
            return Err(SshError::ConnectionFailed(format!(
                "{}: connection refused",
                endpoint.host
            )));
        }
        Ok(Box::new(FakeHandshake {
            server: self.server.clone(),
        }))
    }
}

struct FakeHandshake {
    server: FakeServer,
}

#[async_trait]
impl Handshake for FakeHandshake {
    async fn authenticate(
        self: Box<Self>,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn Transport>, SshError> {
        let mut state = self.server.state.lock();
        let accepted = match &endpoint.auth {
            AuthMethod::Password { password } => *password == state.password,
            AuthMethod::KeyPair { private_key, .. } => !private_key.is_empty(),
        };
        if !accepted {
            return Err(SshError::AuthenticationFailed("Permission denied".to_string()));
        }
        state.open_transports += 1;
        Ok(Arc::new(FakeTransport {
            server: self.server.clone(),
            open: AtomicBool::new(true),
            shell: Mutex::new(None),
        }))
    }

    async fn abort(self: Box<Self>) {}
}

struct FakeTransport {
    server: FakeServer,
    open: AtomicBool,
    shell: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl FakeTransport {
    fn live(&self) -> Result<(), SshError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SshError::Disconnected)
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.server.state.lock().link_up
    }

    fn is_authorized(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn execute(&self, command: &str) -> Result<CommandOutput, SshError> {
        self.live()?;
        let _op = self.server.fs.begin(&format!("exec {}", command));
        let scripted = self.server.state.lock().commands.get(command).cloned();
        Ok(scripted.unwrap_or_else(|| {
            CommandOutput::new(format!("sh: {}: command not found\n", command), Some(127))
        }))
    }

    async fn start_shell(
        &self,
        request: ShellRequest,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<ShellHandle, SshError> {
        self.live()?;
        *self.shell.lock() = Some(sink);
        self.server.state.lock().shell_size = Some((request.cols, request.rows));
        Ok(ShellHandle::new())
    }

    /// Echoes input back as output
    async fn write_raw(&self, data: &[u8]) -> Result<(), SshError> {
        self.live()?;
        let sink = self.shell.lock().clone().ok_or(SshError::NoShell)?;
        sink.send(data.to_vec())
            .await
            .map_err(|_| SshError::NoShell)
    }

    async fn resize_shell(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.live()?;
        if self.shell.lock().is_none() {
            return Err(SshError::NoShell);
        }
        self.server.state.lock().shell_size = Some((cols, rows));
        Ok(())
    }

    async fn stop_shell(&self) {
        self.shell.lock().take();
    }

    async fn probe(&self) -> Result<(), SshError> {
        self.live()
    }

    async fn open_sftp(&self) -> Result<Box<dyn RemoteFs>, SftpError> {
        if !self.server.state.lock().sftp_available {
            return Err(SftpError::SubsystemNotAvailable("sftp".to_string()));
        }
        Ok(Box::new(self.server.fs()))
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.shell.lock().take();
            self.server.state.lock().open_transports -= 1;
        }
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// No network at all
pub struct Unreachable;

#[async_trait]
impl Reachability for Unreachable {
    async fn is_network_available(&self) -> bool {
        false
    }
}

/// Keeps every fingerprint written back
#[derive(Default)]
pub struct RecordingEndpointStore {
    saved: Mutex<Vec<String>>,
}

impl RecordingEndpointStore {
    pub fn saved(&self) -> Vec<String> {
        self.saved.lock().clone()
    }
}

impl EndpointStore for RecordingEndpointStore {
    fn save_os_fingerprint(&self, _endpoint: &Endpoint, fingerprint: &str) {
        self.saved.lock().push(fingerprint.to_string());
    }
}
