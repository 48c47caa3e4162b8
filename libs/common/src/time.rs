use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// All activity timestamps in the platform (`last_activity_at`, status
/// transitions, session activity) are epoch millis.
pub fn millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current wall-clock time in seconds since the Unix epoch. Used for
/// DND end times, which are second-granularity on the wire.
pub fn seconds() -> i64 {
    Utc::now().timestamp()
}

/// Truncates an epoch-seconds timestamp down to the previous multiple of
/// `interval_secs`.
pub fn truncate_to_interval(epoch_secs: i64, interval_secs: i64) -> i64 {
    if interval_secs <= 0 {
        return epoch_secs;
    }
    epoch_secs - epoch_secs.rem_euclid(interval_secs)
}
