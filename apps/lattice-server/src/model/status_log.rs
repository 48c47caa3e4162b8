//! Entries in the bounded status-log ring, broadcast to admins.

use serde::{Deserialize, Serialize};

use super::status::UserStatus;

/// Device label on a log entry when the client did not identify itself.
pub const DEVICE_UNKNOWN: &str = "unknown";
/// Device label for status changes made through the API surface.
pub const DEVICE_API: &str = "api";

/// What produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLogKind {
    StatusChange,
    Activity,
}

/// Why a transition (or activity refresh) happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLogReason {
    Manual,
    Connect,
    Disconnect,
    Inactivity,
    Activity,
    DndExpired,
    DndInactivity,
    DndRestored,
    ChannelView,
    Heartbeat,
    WindowFocus,
    OfflinePrevented,
    SetActivity,
    Websocket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusLogEntry {
    /// Epoch millis when the entry was recorded.
    pub at: i64,
    pub kind: StatusLogKind,
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    pub old_status: UserStatus,
    pub new_status: UserStatus,
    pub reason: StatusLogReason,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub window_active: bool,
    #[serde(default)]
    pub channel_id: String,
    /// Whether the user explicitly picked the new status.
    #[serde(default)]
    pub manual: bool,
    /// Caller label for tracing a transition back to its code path.
    #[serde(default)]
    pub source: String,
}
