//! Sliding-window rate estimation over minute buckets.
//!
//! Only two counters are kept per identity: the current minute-of-hour and
//! the one before it. The previous bucket's contribution decays linearly as
//! the current minute progresses, which approximates a true 60 second
//! sliding window without storing individual hits.

use chrono::{DateTime, Duration, Timelike, Utc};

/// Seconds per bucket.
const SECONDS_PER_MINUTE: u32 = 60;

/// Bucket coordinates of an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Minute-of-hour of the instant.
    pub current_minute: u32,
    /// Minute-of-hour one minute earlier. Wraps 0 -> 59.
    pub previous_minute: u32,
    /// Second-of-minute of the instant.
    pub second: u32,
}

impl Window {
    /// Locate `now` in the minute grid.
    ///
    /// Buckets are keyed by minute-of-hour only, so instants an hour apart
    /// share a bucket.
    pub fn at(now: DateTime<Utc>) -> Self {
        let before = now - Duration::minutes(1);
        Self {
            current_minute: now.minute(),
            previous_minute: before.minute(),
            second: now.second(),
        }
    }

    /// Share of the previous bucket still inside the window.
    pub fn weight(&self) -> f64 {
        decay_weight(self.second)
    }

    /// Estimated hits over the last minute.
    pub fn estimate(&self, before: u64, now: u64) -> f64 {
        estimate_rate(before, now, self.second)
    }

    /// See [`would_exceed`].
    pub fn would_exceed(&self, before: u64, now: u64, hits: u64, max: u64) -> bool {
        would_exceed(before, now, self.second, hits, max)
    }
}

/// `(60 - second) / 60` in real-valued division: 1.0 at second 0, 1/60 at second 59.
pub fn decay_weight(second: u32) -> f64 {
    let second = second.min(SECONDS_PER_MINUTE);
    f64::from(SECONDS_PER_MINUTE - second) / f64::from(SECONDS_PER_MINUTE)
}

/// Weighted previous bucket plus the full current bucket.
pub fn estimate_rate(before: u64, now: u64, second: u32) -> f64 {
    before as f64 * decay_weight(second) + now as f64
}

/// Whether adding `hits` to the estimate at `second` would put it strictly
/// above `max`. Landing exactly on the limit does not.
///
/// Evaluated in sixtieths with integers, so the result never depends on
/// floating-point rounding of the weight.
pub fn would_exceed(before: u64, now: u64, second: u32, hits: u64, max: u64) -> bool {
    let minute = u128::from(SECONDS_PER_MINUTE);
    let remaining = u128::from(SECONDS_PER_MINUTE - second.min(SECONDS_PER_MINUTE));

    let weighted = u128::from(before) * remaining + (u128::from(now) + u128::from(hits)) * minute;
    weighted > u128::from(max) * minute
}
