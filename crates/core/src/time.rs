//! Wall-clock helpers.
//!
//! Every timestamp in the mesh is Unix epoch milliseconds. Components take an
//! explicit `now_ms` in their `*_at` entry points and call [`current_timestamp_ms`]
//! only at the outer edge.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
        .min(u64::MAX as u128) as u64
}

/// Milliseconds elapsed between `earlier` and `now`, zero if the clock went backwards.
pub fn elapsed_ms(earlier: u64, now: u64) -> u64 {
    now.saturating_sub(earlier)
}
