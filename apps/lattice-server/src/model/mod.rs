pub mod cluster;
pub mod event;
pub mod request;
pub mod session;
pub mod status;
pub mod status_log;

pub use cluster::{ClusterEvent, ClusterMessage, ClusterSendType};
pub use event::{Broadcast, WebSocketEvent};
pub use request::{WebSocketRequest, WebSocketResponse};
pub use session::Session;
pub use status::{Status, UserStatus};
pub use status_log::{StatusLogEntry, StatusLogKind, StatusLogReason};

/// Minimum gap between session-activity writes to the session store (ms).
pub const SESSION_ACTIVITY_TIMEOUT_MS: i64 = 5 * 60 * 1000;

/// Minimum gap between non-broadcast status row updates (ms).
pub const STATUS_MIN_UPDATE_MS: i64 = 2 * 60 * 1000;

/// Grid the DND expiry job runs on. DND end times are truncated down to
/// this interval so the status expires on the wall-clock minute the user
/// sees, at the cost of expiring up to one interval early.
pub const DND_EXPIRY_INTERVAL_SECS: i64 = 60;

/// Actions with this prefix bypass the websocket router and are handed to
/// the plugin consumer.
pub const PLUGIN_ACTION_PREFIX: &str = "custom_";
