//! Time utilities
//!
//! Wall-clock helpers shared by the registry (state stamps) and sessions
//! (statistics receipt time, heartbeats).

use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// A clock set before the Unix epoch yields 0.
///
/// # Examples
/// ```
/// use bg_core::time::current_time_millis;
///
/// let now = current_time_millis();
/// assert!(now > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Next stamp for a sequence of transitions: the current time, but always
/// strictly greater than `previous` even if the clock stalls or steps back.
pub fn next_stamp(previous: u64) -> u64 {
    current_time_millis().max(previous.saturating_add(1))
}

/// Calculate elapsed time in milliseconds since a given timestamp.
///
/// Returns 0 if the given time is in the future.
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}
