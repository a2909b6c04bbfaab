//! Single-slot remote clipboard for copy/move workflows

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipboardMode {
    Copy,
    Move,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardEntry {
    /// Absolute remote path
    pub path: String,
    pub mode: ClipboardMode,
}

/// Holds at most one remote path. Written by the UI layer, consumed by a
/// paste whatever its outcome.
#[derive(Debug, Default)]
pub struct PendingClipboard {
    slot: Mutex<Option<ClipboardEntry>>,
}

impl PendingClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held path
    pub fn set(&self, path: impl Into<String>, mode: ClipboardMode) {
        *self.slot.lock() = Some(ClipboardEntry {
            path: path.into(),
            mode,
        });
    }

    pub fn peek(&self) -> Option<ClipboardEntry> {
        self.slot.lock().clone()
    }

    /// Empty the slot, returning what it held
    pub fn take(&self) -> Option<ClipboardEntry> {
        self.slot.lock().take()
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot() {
        let clip = PendingClipboard::new();
        assert!(clip.is_empty());

        clip.set("/a", ClipboardMode::Copy);
        clip.set("/b", ClipboardMode::Move);
        assert_eq!(clip.peek().unwrap().path, "/b");

        let taken = clip.take().unwrap();
        assert_eq!(taken.mode, ClipboardMode::Move);
        assert!(clip.take().is_none());
    }

    #[test]
    fn test_clear() {
        let clip = PendingClipboard::new();
        clip.set("/a", ClipboardMode::Copy);
        clip.clear();
        assert!(clip.is_empty());
    }
}
