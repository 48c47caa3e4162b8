//! Server configuration, loaded from environment variables.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Options recognized by the fabric core.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Seconds of inactivity before an auto-Online user turns Away.
    pub user_status_away_timeout: i64,
    /// Heartbeat-driven away threshold in minutes (accurate statuses only).
    pub inactivity_timeout_minutes: i64,
    /// Minutes of inactivity before a manual-DND user turns Offline;
    /// 0 disables.
    pub dnd_inactivity_timeout_minutes: i64,
    /// Sliding (true) vs fixed session expiry.
    pub extend_session_length_with_activity: bool,
    /// Session cache TTL in minutes.
    pub session_cache_in_minutes: i64,
    /// Master kill switch for the presence engine.
    pub enable_user_statuses: bool,
    /// Feature flag: heartbeat-based presence.
    pub accurate_statuses: bool,
    /// Feature flag: coerce activity to Online from Away/Offline.
    pub no_offline: bool,
    pub enable_status_logs: bool,
    pub status_log_retention_days: i64,
    pub max_status_logs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8065,
            user_status_away_timeout: 300,
            inactivity_timeout_minutes: 5,
            dnd_inactivity_timeout_minutes: 0,
            extend_session_length_with_activity: true,
            session_cache_in_minutes: 10,
            enable_user_statuses: true,
            accurate_statuses: false,
            no_offline: false,
            enable_status_logs: false,
            status_log_retention_days: 7,
            max_status_logs: 500,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> Self {
        let d = Config::default();
        Config {
            port: env_parse("PORT", d.port),
            user_status_away_timeout: env_parse(
                "USER_STATUS_AWAY_TIMEOUT",
                d.user_status_away_timeout,
            ),
            inactivity_timeout_minutes: env_parse(
                "INACTIVITY_TIMEOUT_MINUTES",
                d.inactivity_timeout_minutes,
            ),
            dnd_inactivity_timeout_minutes: env_parse(
                "DND_INACTIVITY_TIMEOUT_MINUTES",
                d.dnd_inactivity_timeout_minutes,
            ),
            extend_session_length_with_activity: env_parse(
                "EXTEND_SESSION_LENGTH_WITH_ACTIVITY",
                d.extend_session_length_with_activity,
            ),
            session_cache_in_minutes: env_parse(
                "SESSION_CACHE_IN_MINUTES",
                d.session_cache_in_minutes,
            ),
            enable_user_statuses: env_parse("ENABLE_USER_STATUSES", d.enable_user_statuses),
            accurate_statuses: env_parse("ACCURATE_STATUSES", d.accurate_statuses),
            no_offline: env_parse("NO_OFFLINE", d.no_offline),
            enable_status_logs: env_parse("ENABLE_STATUS_LOGS", d.enable_status_logs),
            status_log_retention_days: env_parse(
                "STATUS_LOG_RETENTION_DAYS",
                d.status_log_retention_days,
            ),
            max_status_logs: env_parse("MAX_STATUS_LOGS", d.max_status_logs),
        }
    }

    /// Hash of the client-visible options, sent in the `hello` frame so
    /// clients can detect config drift across reconnects.
    pub fn client_config_hash(&self) -> String {
        let mut h = DefaultHasher::new();
        self.user_status_away_timeout.hash(&mut h);
        self.enable_user_statuses.hash(&mut h);
        self.accurate_statuses.hash(&mut h);
        self.no_offline.hash(&mut h);
        format!("{:016x}", h.finish())
    }

    pub fn away_timeout_ms(&self) -> i64 {
        self.user_status_away_timeout * 1000
    }

    pub fn inactivity_timeout_ms(&self) -> i64 {
        self.inactivity_timeout_minutes * 60 * 1000
    }

    pub fn dnd_inactivity_timeout_ms(&self) -> i64 {
        self.dnd_inactivity_timeout_minutes * 60 * 1000
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
