//! Process-local websocket counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters recorded by the hub and the write pumps. Exported wholesale by
/// `snapshot` for diagnostics and tests.
#[derive(Debug, Default)]
pub struct WebSocketMetrics {
    /// Resume requests that needed zero replays.
    pub reconnect_lossless: AtomicU64,
    /// Resume requests replayed from the dead queue.
    pub reconnect_found: AtomicU64,
    /// Resume requests whose sequence had already been overwritten.
    pub reconnect_notfound: AtomicU64,
    /// Broadcasts accepted by `publish`.
    pub broadcasts: AtomicU64,
    /// Events enqueued to individual connections.
    pub events_sent: AtomicU64,
    /// Non-critical events shed by slow connections.
    pub events_shed_slow: AtomicU64,
    /// Connections closed because their send queue filled.
    pub conns_closed_full: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub reconnect_lossless: u64,
    pub reconnect_found: u64,
    pub reconnect_notfound: u64,
    pub broadcasts: u64,
    pub events_sent: u64,
    pub events_shed_slow: u64,
    pub conns_closed_full: u64,
}

impl WebSocketMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reconnect_lossless: self.reconnect_lossless.load(Ordering::Relaxed),
            reconnect_found: self.reconnect_found.load(Ordering::Relaxed),
            reconnect_notfound: self.reconnect_notfound.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_shed_slow: self.events_shed_slow.load(Ordering::Relaxed),
            conns_closed_full: self.conns_closed_full.load(Ordering::Relaxed),
        }
    }
}

/// Relaxed increment; these are statistics, not synchronization.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let m = WebSocketMetrics::default();
        inc(&m.reconnect_found);
        inc(&m.reconnect_found);
        inc(&m.broadcasts);
        let s = m.snapshot();
        assert_eq!(s.reconnect_found, 2);
        assert_eq!(s.broadcasts, 1);
        assert_eq!(s.reconnect_lossless, 0);
    }
}
