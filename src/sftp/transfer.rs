//! Transfer Coordinator
//!
//! Runs uploads and downloads through the session manager, one at a time.
//! Cancellation is cooperative: the progress callback returns `false`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::progress::ProgressFn;
use super::session::SftpChannel;
use super::types::TransferDirection;
use crate::session::SessionManager;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transfer failed: {0}")]
    Io(#[source] SftpError),

    #[error("Remote rejected the transfer: {0}")]
    RemoteRejected(String),

    #[error("Session lost")]
    SessionLost,
}

impl From<SftpError> for TransferError {
    fn from(err: SftpError) -> Self {
        match err {
            SftpError::Cancelled => TransferError::Cancelled,
            SftpError::Rejected(msg) => TransferError::RemoteRejected(msg),
            SftpError::PermissionDenied(path) => {
                TransferError::RemoteRejected(format!("permission denied: {}", path))
            }
            other => TransferError::Io(other),
        }
    }
}

impl serde::Serialize for TransferError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// What to upload
#[derive(Debug, Clone)]
pub enum UploadSource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// One upload or download
#[derive(Debug, Clone)]
pub enum TransferTask {
    Upload {
        source: UploadSource,
        remote_path: String,
    },
    Download {
        remote_path: String,
        destination: PathBuf,
    },
}

impl TransferTask {
    pub fn direction(&self) -> TransferDirection {
        match self {
            TransferTask::Upload { .. } => TransferDirection::Upload,
            TransferTask::Download { .. } => TransferDirection::Download,
        }
    }

    pub fn remote_path(&self) -> &str {
        match self {
            TransferTask::Upload { remote_path, .. } | TransferTask::Download { remote_path, .. } => {
                remote_path
            }
        }
    }
}

/// Shared cancellation flag for UIs with a cancel button.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Progress callback that forwards to `inner` and stops the transfer once
    /// the flag is raised.
    pub fn guard<'a, F>(&self, mut inner: F) -> impl FnMut(u64, u64) -> bool + Send + 'a
    where
        F: FnMut(u64, u64) -> bool + Send + 'a,
    {
        let flag = self.0.clone();
        move |done, total| {
            if flag.load(Ordering::SeqCst) {
                return false;
            }
            inner(done, total) && !flag.load(Ordering::SeqCst)
        }
    }
}

pub struct TransferCoordinator {
    manager: Arc<SessionManager>,
    permit: Semaphore,
}

impl TransferCoordinator {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            permit: Semaphore::new(1),
        }
    }

    /// Run `task`, waiting for any transfer already in flight. Returns the
    /// number of bytes moved.
    pub async fn run(
        &self,
        task: TransferTask,
        progress: &mut ProgressFn<'_>,
    ) -> Result<u64, TransferError> {
        // Never closed
        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| TransferError::SessionLost)?;

        let ops = self
            .manager
            .file_ops()
            .await
            .map_err(|_| TransferError::SessionLost)?;

        let direction = task.direction();
        info!("Starting {:?} of {}", direction, task.remote_path());

        let result = match &task {
            TransferTask::Upload {
                source: UploadSource::Bytes(bytes),
                remote_path,
            } => ops.sftp().write(bytes, remote_path, progress).await,
            TransferTask::Upload {
                source: UploadSource::File(local),
                remote_path,
            } => upload_file(ops.sftp(), local, remote_path, progress).await,
            TransferTask::Download {
                remote_path,
                destination,
            } => download_file(ops.sftp(), remote_path, destination, progress).await,
        };

        match result {
            Ok(bytes) => {
                info!(
                    "{:?} of {} finished ({} bytes)",
                    direction,
                    task.remote_path(),
                    bytes
                );
                Ok(bytes)
            }
            Err(e) => {
                warn!("{:?} of {} failed: {}", direction, task.remote_path(), e);
                if ops.recover(e.is_transport_failure()).await {
                    Err(TransferError::SessionLost)
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

async fn upload_file(
    sftp: &SftpChannel,
    local: &Path,
    remote_path: &str,
    progress: &mut ProgressFn<'_>,
) -> Result<u64, SftpError> {
    let mut file = tokio::fs::File::open(local).await?;
    let total = file.metadata().await?.len();
    debug!("Uploading {} ({} bytes)", local.display(), total);
    sftp.write_from(&mut file, total, remote_path, progress).await
}

/// Downloads land in `<name>.part` next to `destination` and are renamed over
/// it on success. A failure removes only the partial file, so an existing
/// destination survives a failed download.
async fn download_file(
    sftp: &SftpChannel,
    remote_path: &str,
    destination: &Path,
    progress: &mut ProgressFn<'_>,
) -> Result<u64, SftpError> {
    let partial = partial_path(destination);
    let mut file = tokio::fs::File::create(&partial).await?;
    let result = sftp.read_to(remote_path, &mut file, progress).await;
    drop(file);

    match result {
        Ok(bytes) => {
            tokio::fs::rename(&partial, destination).await?;
            Ok(bytes)
        }
        Err(e) => {
            if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                warn!(
                    "Failed to remove partial download {}: {}",
                    partial.display(),
                    remove_err
                );
            }
            Err(e)
        }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}
