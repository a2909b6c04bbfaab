//! SFTP data types

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::path_utils::parent_of;

/// File type as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Attributes of one remote path, as returned by a [`RemoteFs`] backend.
///
/// [`RemoteFs`]: super::backend::RemoteFs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteMetadata {
    pub file_type: Option<FileType>,
    pub size: Option<u64>,
    /// Raw st_mode bits, when the server sent them
    pub permissions: Option<u32>,
    /// Seconds since the epoch
    pub mtime: Option<u32>,
}

impl RemoteMetadata {
    pub fn directory() -> Self {
        Self {
            file_type: Some(FileType::Directory),
            permissions: Some(0o040755),
            ..Default::default()
        }
    }

    pub fn file(size: u64) -> Self {
        Self {
            file_type: Some(FileType::File),
            size: Some(size),
            permissions: Some(0o100644),
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == Some(FileType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == Some(FileType::Symlink)
    }
}

/// One row of a directory listing. A snapshot; refetched on every listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileEntry {
    /// File name (not full path)
    pub name: String,
    /// Full absolute path
    pub path: String,
    pub is_directory: bool,
    pub is_symlink: bool,
    /// `ls -l` style permission string, e.g. "drwxr-xr-x"
    pub permissions: String,
    pub size_bytes: Option<u64>,
    pub modification_time: Option<DateTime<Utc>>,
    /// The synthetic `..` row appended to non-root listings
    #[serde(default)]
    pub is_parent_link: bool,
}

impl RemoteFileEntry {
    pub fn from_metadata(name: impl Into<String>, path: impl Into<String>, meta: &RemoteMetadata) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            is_directory: meta.is_dir(),
            is_symlink: meta.is_symlink(),
            permissions: permission_string(meta),
            size_bytes: if meta.is_dir() { None } else { meta.size },
            modification_time: meta
                .mtime
                .and_then(|t| Utc.timestamp_opt(i64::from(t), 0).single()),
            is_parent_link: false,
        }
    }

    /// The synthetic `..` entry for the listing of `dir`.
    ///
    /// `parent_meta` is the parent's metadata when it could be fetched.
    pub fn parent_link(dir: &str, parent_meta: Option<&RemoteMetadata>) -> Self {
        let meta = parent_meta.copied().unwrap_or_else(RemoteMetadata::directory);
        let mut entry = Self::from_metadata("..", parent_of(dir), &meta);
        entry.is_directory = true;
        entry.is_symlink = false;
        entry.size_bytes = None;
        entry.is_parent_link = true;
        entry
    }

    /// Dot-file, excluding the synthetic parent entry
    pub fn is_hidden(&self) -> bool {
        !self.is_parent_link && self.name.starts_with('.')
    }
}

/// `drwxr-xr-x` rendering of the type and mode bits
pub fn permission_string(meta: &RemoteMetadata) -> String {
    let type_char = match meta.file_type {
        Some(FileType::Directory) => 'd',
        Some(FileType::Symlink) => 'l',
        _ => '-',
    };
    let Some(mode) = meta.permissions else {
        return format!("{}?????????", type_char);
    };

    let mut out = String::with_capacity(10);
    out.push(type_char);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}
