//! Remote endpoint description

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A remote host plus the credentials and default path used to reach it.
///
/// Created and edited by the bookmark layer; the session core only reads it,
/// except for `cached_os_fingerprint` which is written back after probing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Directory opened first in the file browser
    #[serde(default = "default_remote_path")]
    pub default_remote_path: String,

    /// OS description detected on a previous connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_os_fingerprint: Option<String>,
}

/// Authentication methods supported
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// In-memory OpenSSH key pair
    KeyPair {
        /// OpenSSH public key line; may be empty, the private key is authoritative
        #[serde(default)]
        public_key: String,
        /// PEM/OpenSSH private key text
        private_key: String,
        /// Optional passphrase for encrypted keys
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("host is empty")]
    EmptyHost,

    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("username is empty")]
    EmptyUsername,

    #[error("private key is empty")]
    EmptyPrivateKey,
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key_pair(
        public_key: impl Into<String>,
        private_key: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self::KeyPair {
            public_key: public_key.into(),
            private_key: private_key.into(),
            passphrase: passphrase.filter(|p| !p.is_empty()),
        }
    }
}

impl Endpoint {
    /// Create an endpoint with password authentication
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: AuthMethod::password(password),
            default_remote_path: default_remote_path(),
            cached_os_fingerprint: None,
        }
    }

    /// Create an endpoint with key pair authentication
    pub fn with_key_pair(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        public_key: impl Into<String>,
        private_key: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: AuthMethod::key_pair(public_key, private_key, passphrase),
            default_remote_path: default_remote_path(),
            cached_os_fingerprint: None,
        }
    }

    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.default_remote_path = path.into();
        self
    }

    /// Check the fields a connection attempt depends on.
    pub fn validate(&self) -> Result<(), EndpointError> {
        if self.host.trim().is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        if self.port == 0 {
            return Err(EndpointError::InvalidPort);
        }
        if self.username.trim().is_empty() {
            return Err(EndpointError::EmptyUsername);
        }
        if let AuthMethod::KeyPair { private_key, .. } = &self.auth {
            if private_key.trim().is_empty() {
                return Err(EndpointError::EmptyPrivateKey);
            }
        }
        Ok(())
    }

    /// `user@host` with the port appended when it is not 22
    pub fn display_name(&self) -> String {
        if self.port == 22 {
            format!("{}@{}", self.username, self.host)
        } else {
            format!("{}@{}:{}", self.username, self.host, self.port)
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .field("default_remote_path", &self.default_remote_path)
            .field("cached_os_fingerprint", &self.cached_os_fingerprint)
            .finish()
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password(<redacted>)"),
            AuthMethod::KeyPair { passphrase, .. } => f
                .debug_struct("KeyPair")
                .field("private_key", &"<redacted>")
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_remote_path() -> String {
    "~".to_string()
}
