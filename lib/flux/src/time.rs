use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current unix timestamp in milliseconds.
#[inline]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_millis() as u64
}

/// Granularity of one timing wheel tick, in milliseconds.
pub const TICK_GRANULARITY_MS: u64 = 10;

/// Converts a millisecond delay to a whole number of wheel ticks, rounding up so that a timer
/// never fires earlier than requested.
#[inline]
pub fn millis_to_ticks(millis: u64) -> u64 {
    (millis + TICK_GRANULARITY_MS - 1) / TICK_GRANULARITY_MS
}
