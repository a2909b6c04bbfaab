//! Remote filesystem seam
//!
//! [`SftpChannel`](super::session::SftpChannel) only speaks to a [`RemoteFs`].
//! Production uses [`RusshFs`] over the SFTP subsystem; tests use an
//! in-memory tree.

use std::pin::Pin;

use async_trait::async_trait;
use russh::client::Msg;
use russh::Channel;
use russh_sftp::client::fs::Metadata;
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::error::SftpError;
use super::types::{FileType, RemoteMetadata};

pub type RemoteReader = Pin<Box<dyn AsyncRead + Send>>;
pub type RemoteWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A directory entry as listed by the server
#[derive(Debug, Clone)]
pub struct RemoteDirEntry {
    pub name: String,
    pub metadata: RemoteMetadata,
}

#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Absolute form of `path`; `"."` yields the login directory
    async fn canonicalize(&self, path: &str) -> Result<String, SftpError>;

    /// Entries of `path`, without `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError>;

    async fn metadata(&self, path: &str) -> Result<RemoteMetadata, SftpError>;

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError>;

    /// Create or truncate `path` for writing
    async fn open_write(&self, path: &str) -> Result<RemoteWriter, SftpError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;

    async fn remove_file(&self, path: &str) -> Result<(), SftpError>;

    /// Remove an empty directory
    async fn remove_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn create_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn close(&self);
}

/// [`RemoteFs`] over russh-sftp
pub struct RusshFs {
    sftp: RusshSftpSession,
}

impl RusshFs {
    /// Request the `sftp` subsystem on `channel` and start the client.
    pub async fn open(channel: Channel<Msg>) -> Result<Self, SftpError> {
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SftpError::SubsystemNotAvailable(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;

        debug!("SFTP subsystem opened");
        Ok(Self { sftp })
    }
}

fn convert_metadata(meta: &Metadata) -> RemoteMetadata {
    let file_type = if meta.is_dir() {
        FileType::Directory
    } else if meta.is_symlink() {
        FileType::Symlink
    } else if meta.is_regular() {
        FileType::File
    } else {
        FileType::Unknown
    };

    RemoteMetadata {
        file_type: Some(file_type),
        size: meta.size,
        permissions: meta.permissions,
        mtime: meta.mtime,
    }
}

#[async_trait]
impl RemoteFs for RusshFs {
    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        self.sftp
            .canonicalize(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;

        Ok(read_dir
            .filter_map(|entry| {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    return None;
                }
                Some(RemoteDirEntry {
                    metadata: convert_metadata(&entry.metadata()),
                    name,
                })
            })
            .collect())
    }

    async fn metadata(&self, path: &str) -> Result<RemoteMetadata, SftpError> {
        self.sftp
            .metadata(path)
            .await
            .map(|m| convert_metadata(&m))
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;
        Ok(Box::pin(file))
    }

    async fn open_write(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        let file = self
            .sftp
            .create(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;
        Ok(Box::pin(file))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| SftpError::from_sftp(e, from))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn close(&self) {
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close: {}", e);
        }
    }
}
