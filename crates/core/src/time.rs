//! Time helpers shared by the stores.
//!
//! Timestamps are persisted as Unix epoch milliseconds.

use chrono::{DateTime, TimeZone, Utc};

/// Current time truncated to millisecond precision
pub fn now_millis() -> DateTime<Utc> {
    from_epoch_millis(Utc::now().timestamp_millis())
}

/// Convert epoch milliseconds to a UTC timestamp.
///
/// Out-of-range values clamp to the epoch.
pub fn from_epoch_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Convert a UTC timestamp to epoch milliseconds
pub fn to_epoch_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}
