//! Configuration Management Module
//!
//! Session tuning settings and their on-disk JSON storage.

pub mod settings;
pub mod storage;

pub use settings::{SessionSettings, SettingsError, SETTINGS_VERSION};
pub use storage::{settings_file, SettingsStorage, StorageError};
