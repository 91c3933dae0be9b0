//! UTC time helpers. All persisted timestamps are RFC 3339 UTC strings.

use chrono::{DateTime, Utc};

#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current time as the canonical persisted form.
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Today's UTC date as `YYYY-MM-DD`, the `daily_usage` partition key.
#[must_use]
pub fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Parse a persisted RFC 3339 timestamp. Returns `None` on malformed input
/// rather than failing the surrounding query.
#[must_use]
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Minutes between two instants, rounded up. A zero-length interval is 0;
/// anything in (0, 60s] is 1.
#[must_use]
pub fn ceil_minutes(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    let millis = (to - from).num_milliseconds().max(0) as u64;
    millis.div_ceil(60_000) as i64
}
