//! Writing period arithmetic.
//!
//! The period grid starts at midnight (UTC) of every day. Periods that do not
//! divide a day evenly restart at the next midnight.

use crate::data::{from_millis, to_millis, Timestamp, MILLIS_PER_DAY};

fn split_day(timestamp: Timestamp) -> (i64, i64) {
    let millis = to_millis(timestamp);
    let day = millis.div_euclid(MILLIS_PER_DAY) * MILLIS_PER_DAY;
    (day, millis - day)
}

/// Rounds the timestamp to the nearest period boundary.
///
/// Halfway points round up. A non-positive period returns the timestamp as is.
pub fn closest_write_time(timestamp: Timestamp, period_secs: i64) -> Timestamp {
    if period_secs <= 0 {
        return timestamp;
    }
    let period = period_secs * 1000;
    let (day, time_of_day) = split_day(timestamp);
    let rounded = (time_of_day + period / 2) / period * period;
    from_millis(day + rounded.min(MILLIS_PER_DAY))
}

/// Returns the first period boundary strictly after the timestamp.
pub fn next_write_time(timestamp: Timestamp, period_secs: i64) -> Timestamp {
    if period_secs <= 0 {
        return timestamp;
    }
    let period = period_secs * 1000;
    let (day, time_of_day) = split_day(timestamp);
    let next = (time_of_day / period + 1) * period;
    from_millis(day + next.min(MILLIS_PER_DAY))
}

/// Returns true if the timestamp lies exactly on a period boundary.
pub fn is_multiple_of_period(timestamp: Timestamp, period_secs: i64) -> bool {
    if period_secs <= 0 {
        return false;
    }
    let (_, time_of_day) = split_day(timestamp);
    time_of_day % (period_secs * 1000) == 0
}

/// Pulls the timestamp to the closest boundary if within `tolerance_secs`.
pub fn pull_to_period(
    timestamp: Timestamp,
    period_secs: i64,
    tolerance_secs: i64,
) -> Option<Timestamp> {
    if period_secs <= 0 {
        return None;
    }
    let closest = closest_write_time(timestamp, period_secs);
    let distance = (to_millis(timestamp) - to_millis(closest)).abs();
    (distance <= tolerance_secs * 1000).then_some(closest)
}

/// Validates a timestamp against the period grid.
///
/// With a zero tolerance the timestamp must be on a boundary; otherwise it is
/// pulled to the closest boundary within the tolerance. Returns the timestamp
/// to store, or `None` if it is rejected.
pub fn align_to_period(
    timestamp: Timestamp,
    period_secs: i64,
    tolerance_secs: i64,
) -> Option<Timestamp> {
    if tolerance_secs > 0 {
        pull_to_period(timestamp, period_secs, tolerance_secs)
    } else if is_multiple_of_period(timestamp, period_secs) {
        Some(timestamp)
    } else {
        None
    }
}
