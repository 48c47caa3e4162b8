//! Bounded in-memory ring of status transitions, for admin debugging.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::model::StatusLogEntry;

/// Holds the most recent status-log entries, capped by count and age.
/// Entries never leave the process except through the admin-only
/// `status_log` websocket event.
pub struct StatusLogBuffer {
    entries: Mutex<VecDeque<StatusLogEntry>>,
    max_entries: usize,
    retention: Duration,
}

impl StatusLogBuffer {
    pub fn new(max_entries: usize, retention: Duration) -> Self {
        StatusLogBuffer {
            entries: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
            retention,
        }
    }

    pub fn push(&self, entry: StatusLogEntry) {
        let cutoff = lattice_common::millis() - self.retention.as_millis() as i64;
        let mut entries = self.entries.lock();
        while entries.front().is_some_and(|e| e.at < cutoff) {
            entries.pop_front();
        }
        if entries.len() == self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Newest-last snapshot.
    pub fn entries(&self) -> Vec<StatusLogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
