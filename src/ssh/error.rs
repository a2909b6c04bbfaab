//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("No interactive shell is running")]
    NoShell,

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Whether this error means the underlying socket can no longer be trusted.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            SshError::Disconnected
                | SshError::IoError(_)
                | SshError::ProtocolError(_)
                | SshError::ChannelError(_)
                | SshError::Timeout(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
