//! Host key verification against an OpenSSH-style known_hosts file

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a stored entry
    Verified,
    /// No entry for this host and key type
    Unknown { fingerprint: String },
    /// Stored key differs from the presented one
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// In-memory view of a known_hosts file, appended to on trust-on-first-use.
pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Load `~/.ssh/known_hosts`
    pub fn user_default() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("known_hosts"));
        Self::with_path(path)
    }

    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts {:?}: {}", store.path, e);
        }

        store
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            return Ok(());
        }

        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) are not matched
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(hostname.to_lowercase())
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        debug!("Loaded {} known host entries from {:?}", entry_count, self.path);
        Ok(())
    }

    /// `host` for port 22, `[host]:port` otherwise (OpenSSH convention)
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint in OpenSSH display format
    pub fn fingerprint(key: &PublicKey) -> String {
        fingerprint_bytes(&key.public_key_bytes())
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_b64 = BASE64.encode(key.public_key_bytes());
        let actual_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        match entries.iter().find(|e| e.key_type == actual_type) {
            Some(entry) if entry.key_data == actual_b64 => HostKeyVerification::Verified,
            Some(entry) => {
                let expected_fingerprint = BASE64
                    .decode(&entry.key_data)
                    .map(|bytes| fingerprint_bytes(&bytes))
                    .unwrap_or_else(|_| "unknown".to_string());
                HostKeyVerification::Changed {
                    expected_fingerprint,
                    actual_fingerprint: fingerprint,
                }
            }
            // Known host, new key type
            None => HostKeyVerification::Unknown { fingerprint },
        }
    }

    /// Remember a host key in memory and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_data = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_data.clone(),
            });

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_data)?;

        info!("Added host key for {} ({}) to {:?}", lookup_key, key_type, self.path);
        Ok(())
    }
}

fn fingerprint_bytes(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}
