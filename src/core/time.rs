//! Shared timestamp and identifier helpers.

use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    format!("{}Z", now_unix_secs())
}

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn parse_epoch_z(ts: &str) -> Option<u64> {
    ts.trim_end_matches('Z').parse::<u64>().ok()
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Document ids are `<prefix>-<ULID>`: a millisecond timestamp plus 80 random bits,
/// so independent writers never need to coordinate and ids sort by creation time.
pub fn new_document_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Ulid::new())
}
