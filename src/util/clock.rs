//! Wall-clock helpers.
//!
//! Persisted time stamps use the compact `YYYYmmddHHMMSS` form (always UTC):
//! it sorts lexicographically in time order, which the wait-queue key format
//! relies on, and it stays readable when poking at the state directory.

use chrono::{DateTime, NaiveDateTime, Utc};

/// `strftime` format of every persisted time stamp.
pub const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Stamp used when a record carries no activity time at all.
pub const EPOCH_STAMP: &str = "19700101000000";

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    u128::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Format an instant as a 14 digit stamp.
#[must_use]
pub fn format_stamp(at: DateTime<Utc>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

/// Current time as a 14 digit stamp.
#[must_use]
pub fn now_stamp() -> String {
    format_stamp(Utc::now())
}

/// Parse a 14 digit stamp; `None` if it is malformed.
#[must_use]
pub fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    if stamp.len() != 14 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
