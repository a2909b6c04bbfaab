//! Session tuning knobs

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current settings file version
pub const SETTINGS_VERSION: u32 = 1;

/// Timeouts, keepalive, chunking and terminal defaults used by the session core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// TCP connect + SSH handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound for one blocking remote command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Liveness probe reply timeout
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Transport-level keepalive interval
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Missed keepalives before russh drops the connection
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// SFTP read/write chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Terminal type requested with the PTY
    #[serde(default = "default_terminal_type")]
    pub terminal_type: String,

    #[serde(default = "default_cols")]
    pub cols: u32,

    #[serde(default = "default_rows")]
    pub rows: u32,

    /// Strict host key checking
    /// - true: reject connections to unknown hosts
    /// - false: trust on first use, still reject changed keys
    #[serde(default)]
    pub strict_host_key_checking: bool,

    /// known_hosts file; `~/.ssh/known_hosts` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,
}

/// A settings value the session core cannot run with
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("terminal_type must not be empty")]
    EmptyTerminalType,
}

impl SessionSettings {
    /// Reject values that would stall or break a session: zero timeouts,
    /// a zero chunk size, an empty terminal.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let positive = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("command_timeout_secs", self.command_timeout_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("keepalive_interval_secs", self.keepalive_interval_secs),
            ("chunk_size", self.chunk_size as u64),
            ("cols", u64::from(self.cols)),
            ("rows", u64::from(self.rows)),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, value)| *value == 0) {
            return Err(SettingsError::Zero(field));
        }
        if self.terminal_type.trim().is_empty() {
            return Err(SettingsError::EmptyTerminalType);
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Chunk size clamped to something SFTP servers accept
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }
}

/// Most servers cap a single SFTP read/write at 256 KiB
const MAX_CHUNK_SIZE: usize = 256 * 1024;

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_terminal_type() -> String {
    "xterm-256color".to_string()
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            chunk_size: default_chunk_size(),
            terminal_type: default_terminal_type(),
            cols: default_cols(),
            rows: default_rows(),
            strict_host_key_checking: false,
            known_hosts_path: None,
        }
    }
}
