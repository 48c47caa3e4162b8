//! The user status entity and its invariants.

use serde::{Deserialize, Serialize};

/// The closed set of user statuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Away,
    Dnd,
    #[default]
    Offline,
    OutOfOffice,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Away => "away",
            UserStatus::Dnd => "dnd",
            UserStatus::Offline => "offline",
            UserStatus::OutOfOffice => "out_of_office",
        }
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's presence status.
///
/// Invariants:
/// - `prev_status.is_some()` only while `status == Offline` (the
///   DND-restoration signal) or while a timed DND (the status it
///   interrupted);
/// - `dnd_end_time != 0` only while `status == Dnd` and `manual == true`,
///   or on the offline row a DND-inactivity demotion left behind (so a
///   restored DND still expires on schedule);
/// - `manual == false` whenever `status == Online`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub user_id: String,
    pub status: UserStatus,
    #[serde(default)]
    pub manual: bool,
    /// Epoch millis of the last recognized user activity.
    #[serde(default)]
    pub last_activity_at: i64,
    /// Channel the user is currently viewing; lives only in the cache.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active_channel: String,
    /// Status to restore: what a timed DND interrupted, or Dnd on the
    /// offline row a DND-inactivity demotion left behind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_status: Option<UserStatus>,
    /// Epoch seconds when a timed DND ends; 0 when untimed.
    #[serde(default)]
    pub dnd_end_time: i64,
}

impl Status {
    pub fn new_online(user_id: &str, now_ms: i64) -> Self {
        Status {
            user_id: user_id.to_string(),
            status: UserStatus::Online,
            manual: false,
            last_activity_at: now_ms,
            ..Default::default()
        }
    }

    pub fn new_offline(user_id: &str, manual: bool, now_ms: i64) -> Self {
        Status {
            user_id: user_id.to_string(),
            status: UserStatus::Offline,
            manual,
            last_activity_at: now_ms,
            ..Default::default()
        }
    }

    /// True when the user is Offline carrying a pending DND restoration.
    pub fn awaiting_dnd_restore(&self) -> bool {
        self.status == UserStatus::Offline && self.prev_status == Some(UserStatus::Dnd)
    }
}
