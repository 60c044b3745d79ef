//! Record of when admitted requests actually started.
//!
//! Useful for demos and tests that need to check the spacing of admitted work; not part of
//! the admission path itself.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

/// Shared, append-only list of request start times. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    entries: Arc<Mutex<Vec<SystemTime>>>,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a start time.
    pub fn record(&self, at: SystemTime) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push(at);
    }

    /// Start times in recording order.
    pub fn requests(&self) -> Vec<SystemTime> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Start times in chronological order.
    pub fn sorted(&self) -> Vec<SystemTime> {
        let mut entries = self.requests();
        entries.sort();
        entries
    }

    /// Spacing between consecutive starts, chronologically.
    pub fn gaps(&self) -> Vec<Duration> {
        self.sorted()
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]).unwrap_or(Duration::ZERO))
            .collect()
    }

    /// Clear the log.
    pub fn reset(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(
            target: "pacegate::request_log",
            cleared = entries.len(),
            "request log reset"
        );
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
