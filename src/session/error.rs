//! Errors surfaced by the session manager

use thiserror::Error;

use crate::sftp::SftpError;
use crate::ssh::{EndpointError, SshError};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Network unavailable")]
    NetworkUnavailable,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] EndpointError),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("SFTP unavailable: {0}")]
    SftpUnavailable(String),

    /// `reconnect` without a retained endpoint
    #[error("No endpoint to reconnect to")]
    NoEndpoint,

    #[error("Session manager is closed")]
    Closed,
}

impl From<SshError> for ConnectError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::AuthenticationFailed(msg) => ConnectError::AuthenticationFailed(msg),
            SshError::KeyError(msg) => ConnectError::AuthenticationFailed(msg),
            SshError::HostKeyRejected(msg) => ConnectError::HostKeyRejected(msg),
            other => ConnectError::HostUnreachable(other.to_string()),
        }
    }
}

/// The session is gone (not connected, not authorized, or the probe failed).
/// Callers must `connect` or `reconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LivenessError {
    #[error("Session lost")]
    SessionLost,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Session lost")]
    SessionLost,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Command not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transport(#[from] SshError),
}

impl From<LivenessError> for CommandError {
    fn from(_: LivenessError) -> Self {
        CommandError::SessionLost
    }
}

impl From<ListError> for CommandError {
    fn from(err: ListError) -> Self {
        match err {
            ListError::SessionLost => CommandError::SessionLost,
            ListError::PermissionDenied(path) => CommandError::PermissionDenied(path),
            ListError::NotFound(path) => CommandError::NotFound(path),
            ListError::Transport(e) => {
                CommandError::Transport(SshError::ChannelError(e.to_string()))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ListError {
    #[error("Session lost")]
    SessionLost,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transport(SftpError),
}

impl From<LivenessError> for ListError {
    fn from(_: LivenessError) -> Self {
        ListError::SessionLost
    }
}

impl From<SftpError> for ListError {
    fn from(err: SftpError) -> Self {
        match err {
            SftpError::NotFound(path) => ListError::NotFound(path),
            SftpError::PermissionDenied(path) => ListError::PermissionDenied(path),
            other => ListError::Transport(other),
        }
    }
}

/// Errors of the single-file operations and paste
#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("Session lost")]
    SessionLost,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Clipboard is empty")]
    ClipboardEmpty,

    #[error(transparent)]
    Sftp(SftpError),
}

impl From<LivenessError> for FileOpError {
    fn from(_: LivenessError) -> Self {
        FileOpError::SessionLost
    }
}

impl From<SftpError> for FileOpError {
    fn from(err: SftpError) -> Self {
        match err {
            SftpError::NotFound(path) => FileOpError::NotFound(path),
            SftpError::PermissionDenied(path) => FileOpError::PermissionDenied(path),
            SftpError::Cancelled => FileOpError::Cancelled,
            other => FileOpError::Sftp(other),
        }
    }
}

macro_rules! serialize_as_string {
    ($($ty:ty),*) => {$(
        impl serde::Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }
    )*};
}

serialize_as_string!(ConnectError, LivenessError, CommandError, ListError, FileOpError);
