//! Transfer progress reporting

use human_bytes::human_bytes;
use serde::{Deserialize, Serialize};

/// Progress callback: `(bytes_done, bytes_total) -> keep_going`.
///
/// Called after every chunk. Returning `false` aborts the transfer with
/// `Cancelled`; no further chunk is read or written.
pub type ProgressFn<'a> = dyn FnMut(u64, u64) -> bool + Send + 'a;

/// Snapshot of a running transfer, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub done: u64,
    /// Zero when the size was unknown up front
    pub total: u64,
}

impl TransferProgress {
    pub fn new(done: u64, total: u64) -> Self {
        Self { done, total }
    }

    /// Completed fraction in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            if self.done == 0 {
                0.0
            } else {
                1.0
            }
        } else {
            (self.done as f64 / self.total as f64).min(1.0)
        }
    }

    pub fn percentage(&self) -> f64 {
        self.fraction() * 100.0
    }

    /// `"1.2 MiB / 3.4 MiB"`, or just the done count when the total is unknown
    pub fn describe(&self) -> String {
        if self.total == 0 {
            human_bytes(self.done as f64)
        } else {
            format!(
                "{} / {}",
                human_bytes(self.done as f64),
                human_bytes(self.total as f64)
            )
        }
    }
}

/// Adapt a display callback into a [`ProgressFn`] that never cancels.
pub fn observe<F>(mut on_progress: F) -> impl FnMut(u64, u64) -> bool + Send
where
    F: FnMut(TransferProgress) + Send,
{
    move |done, total| {
        on_progress(TransferProgress::new(done, total));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction() {
        assert_eq!(TransferProgress::new(0, 0).fraction(), 0.0);
        assert_eq!(TransferProgress::new(5, 0).fraction(), 1.0);
        assert_eq!(TransferProgress::new(50, 200).percentage(), 25.0);
        assert_eq!(TransferProgress::new(300, 200).fraction(), 1.0);
    }

    #[test]
    fn test_describe() {
        let text = TransferProgress::new(1024, 4096).describe();
        assert!(text.contains(" / "));
        assert!(!TransferProgress::new(10, 0).describe().contains('/'));
    }

    #[test]
    fn test_observe_never_cancels() {
        let mut seen = Vec::new();
        {
            let mut cb = observe(|p| seen.push(p.done));
            assert!(cb(1, 2));
            assert!(cb(2, 2));
        }
        assert_eq!(seen, vec![1, 2]);
    }
}
