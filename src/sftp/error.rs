//! SFTP Error types

use russh_sftp::client::error::Error as RusshSftpError;
use russh_sftp::protocol::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transfer cancelled")]
    Cancelled,

    /// The server refused the operation without a more specific status
    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    /// Copy source and destination resolve to the same path
    #[error("Source and destination are the same file: {0}")]
    SameFile(String),

    #[error("Failed to remove {path}: {source}")]
    RemoveFailed {
        path: String,
        #[source]
        source: Box<SftpError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SFTP subsystem not available: {0}")]
    SubsystemNotAvailable(String),

    #[error("Connection lost")]
    ConnectionLost,
}

impl SftpError {
    /// Whether the channel underneath should be considered dead
    pub fn is_transport_failure(&self) -> bool {
        match self {
            SftpError::ConnectionLost
            | SftpError::ChannelError(_)
            | SftpError::Protocol(_)
            | SftpError::SubsystemNotAvailable(_) => true,
            SftpError::Io(e) => !matches!(e.kind(), std::io::ErrorKind::WriteZero),
            SftpError::RemoveFailed { source, .. } => source.is_transport_failure(),
            _ => false,
        }
    }

    /// Attach the path an SFTP failure refers to
    pub fn from_sftp(err: RusshSftpError, path: &str) -> Self {
        match err {
            RusshSftpError::Status(status) => match status.status_code {
                StatusCode::NoSuchFile => SftpError::NotFound(path.to_string()),
                StatusCode::PermissionDenied => SftpError::PermissionDenied(path.to_string()),
                StatusCode::NoConnection | StatusCode::ConnectionLost => SftpError::ConnectionLost,
                _ => SftpError::Rejected(format!("{}: {}", path, status.error_message)),
            },
            other => {
                let msg = other.to_string();
                if msg.contains("No such file") {
                    SftpError::NotFound(path.to_string())
                } else if msg.contains("Permission denied") {
                    SftpError::PermissionDenied(path.to_string())
                } else {
                    SftpError::Protocol(msg)
                }
            }
        }
    }

    /// Map an I/O error raised by a remote file handle
    pub fn from_remote_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::WriteZero => SftpError::Rejected(format!("{}: short write", path)),
            std::io::ErrorKind::NotFound => SftpError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => SftpError::PermissionDenied(path.to_string()),
            _ => SftpError::Io(err),
        }
    }
}

impl serde::Serialize for SftpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
