//! Expiring cluster-wide server-busy flag.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cluster payload for `busy_state_changed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BusyState {
    pub busy: bool,
    /// Epoch seconds after which the flag auto-clears; 0 when not busy.
    pub expires_at: i64,
}

/// Process-wide busy governor. While set, non-critical producers (status
/// broadcasts; any producer that consults `is_busy`) become no-ops.
///
/// The flag is derived from the stored expiry timestamp, so it clears
/// itself once the deadline passes even if no timer fires.
#[derive(Debug, Default)]
pub struct ServerBusy {
    /// Epoch seconds; 0 means not busy.
    expires_at: AtomicI64,
}

impl ServerBusy {
    pub fn is_busy(&self) -> bool {
        let at = self.expires_at.load(Ordering::Acquire);
        at != 0 && Utc::now().timestamp() < at
    }

    /// Mark the server busy for `dur`. Replaces any earlier deadline.
    pub fn set(&self, dur: Duration) {
        let at = Utc::now().timestamp() + dur.as_secs() as i64;
        self.expires_at.store(at, Ordering::Release);
    }

    pub fn clear(&self) {
        self.expires_at.store(0, Ordering::Release);
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        let at = self.expires_at.load(Ordering::Acquire);
        if at == 0 {
            return None;
        }
        DateTime::from_timestamp(at, 0)
    }

    pub fn state(&self) -> BusyState {
        let busy = self.is_busy();
        BusyState {
            busy,
            expires_at: if busy {
                self.expires_at.load(Ordering::Acquire)
            } else {
                0
            },
        }
    }

    /// Apply a peer's busy state locally.
    pub fn apply(&self, state: BusyState) {
        if state.busy {
            self.expires_at.store(state.expires_at, Ordering::Release);
        } else {
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_expire() {
        let busy = ServerBusy::default();
        assert!(!busy.is_busy());

        busy.set(Duration::from_secs(60));
        assert!(busy.is_busy());
        assert!(busy.expires().is_some());

        busy.clear();
        assert!(!busy.is_busy());
        assert!(busy.expires().is_none());
    }

    #[test]
    fn zero_duration_expires_immediately() {
        let busy = ServerBusy::default();
        busy.set(Duration::from_secs(0));
        assert!(!busy.is_busy());
    }

    #[test]
    fn apply_converges_with_peer() {
        let a = ServerBusy::default();
        let b = ServerBusy::default();

        a.set(Duration::from_secs(30));
        b.apply(a.state());
        assert!(b.is_busy());
        assert_eq!(a.state(), b.state());

        a.clear();
        b.apply(a.state());
        assert!(!b.is_busy());
    }
}
