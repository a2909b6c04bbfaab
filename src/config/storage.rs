//! Settings Storage
//!
//! `~/.termlink/settings.json`, written atomically. Loaded settings are
//! validated before the session core sees them.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use super::settings::{SessionSettings, SettingsError, SETTINGS_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Invalid settings in {}: {}", .path.display(), .source)]
    Invalid {
        path: PathBuf,
        #[source]
        source: SettingsError,
    },
}

/// Default settings location
pub fn settings_file() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".termlink").join("settings.json"))
        .ok_or(StorageError::NoHomeDir)
}

pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load settings from disk.
    ///
    /// A missing file yields defaults. Unparseable JSON is backed up and
    /// replaced by defaults in memory. Parseable but unusable values are an
    /// error.
    pub async fn load(&self) -> Result<SessionSettings, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", self.path.display());
                return Ok(SessionSettings::default());
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let settings = match serde_json::from_str::<SessionSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Settings file corrupted: {}", e);
                match self.backup().await {
                    Ok(backup) => warn!(
                        "Corrupted settings backed up to {}, using defaults",
                        backup.display()
                    ),
                    Err(backup_err) => error!("Failed to back up corrupted settings: {}", backup_err),
                }
                return Ok(SessionSettings::default());
            }
        };

        if settings.version > SETTINGS_VERSION {
            return Err(StorageError::VersionTooNew {
                found: settings.version,
                supported: SETTINGS_VERSION,
            });
        }
        self.check(&settings)?;
        Ok(settings)
    }

    /// Validate and write through a temp file and rename
    pub async fn save(&self, settings: &SessionSettings) -> Result<(), StorageError> {
        self.check(settings)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(settings)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    fn check(&self, settings: &SessionSettings) -> Result<(), StorageError> {
        settings.validate().map_err(|source| StorageError::Invalid {
            path: self.path.clone(),
            source,
        })
    }

    async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup = backup_path(&self.path, chrono::Utc::now());
        fs::copy(&self.path, &backup).await?;
        Ok(backup)
    }
}

fn backup_path(path: &Path, at: chrono::DateTime<chrono::Utc>) -> PathBuf {
    path.with_extension(format!("json.backup.{}", at.format("%Y%m%d_%H%M%S")))
}
