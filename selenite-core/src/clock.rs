//! Wall-clock helpers and job identifiers.
//!
//! All persisted timestamps are UTC epoch milliseconds (`i64`); elapsed-time
//! measurements use `std::time::Instant` at the call sites instead.

use chrono::{TimeZone, Utc};
use uuid::Uuid;

/// Current wall-clock time as UTC epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Fresh v4 UUID string — the identity of a job for its whole lifetime.
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// RFC 3339 rendering of an epoch-ms timestamp for API payloads and logs.
pub fn ms_to_rfc3339(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}
