//! termlink - SSH/SFTP connection and session core
//!
//! One [`SessionManager`] owns a remote session made of two transports: an
//! interactive shell and a file-ops channel carrying SFTP and blocking
//! commands. Every file operation is preceded by a liveness probe; a dead
//! session is torn down and reported as `SessionLost`, never retried.

pub mod config;
pub mod logging;
pub mod session;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
mod test_utils;

pub use config::SessionSettings;
pub use session::{
    ClipboardMode, CommandError, ConnectError, FileOpError, ListError, LivenessError,
    PendingClipboard, SessionManager, SessionState,
};
pub use sftp::{
    CancelFlag, RemoteFileEntry, SftpError, TransferCoordinator, TransferError, TransferTask,
    UploadSource,
};
pub use ssh::{AuthMethod, Endpoint, SshError};
