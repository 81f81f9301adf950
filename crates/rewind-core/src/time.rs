//! Time Representation
//!
//! This module defines how rewind represents time on the playback timeline.
//!
//! ## Why Nanoseconds?
//!
//! Recording files store message timestamps with nanosecond precision, and
//! playback must preserve ordering between messages that are microseconds
//! apart. A single `u64` of nanoseconds since the Unix epoch covers ~584
//! years, compares cheaply, and makes the k-way merge heap key trivial.
//!
//! ## TimeRange
//!
//! A `TimeRange` is an inclusive `[start, end]` window on the timeline.
//! Iterators are created for a range, the playback tick requests the window
//! `(current, current + elapsed * speed]`, and the read-ahead buffer is
//! bounded by a duration expressed in the same nanosecond unit.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Nanoseconds since the Unix epoch.
pub type Time = u64;

/// Convert a [`Duration`] into timeline nanoseconds.
pub fn duration_to_nanos(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}

/// Convert fractional seconds into timeline nanoseconds.
pub fn nanos_from_secs_f64(secs: f64) -> u64 {
    (secs * 1_000_000_000.0) as u64
}

/// Convert timeline nanoseconds into fractional seconds.
pub fn nanos_to_secs_f64(nanos: u64) -> f64 {
    nanos as f64 / 1_000_000_000.0
}

/// An inclusive time window `[start, end]` on the playback timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// First instant covered by the range
    pub start: Time,

    /// Last instant covered by the range
    pub end: Time,
}

impl TimeRange {
    pub fn new(start: Time, end: Time) -> Self {
        Self { start, end }
    }

    /// Whether `t` falls inside the range (inclusive on both ends).
    pub fn contains(&self, t: Time) -> bool {
        t >= self.start && t <= self.end
    }

    /// Clamp `t` into the range.
    pub fn clamp(&self, t: Time) -> Time {
        t.max(self.start).min(self.end)
    }

    /// Duration covered by the range in nanoseconds.
    pub fn span(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Smallest range covering both `self` and `other`.
    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_inclusive_bounds() {
        let range = TimeRange::new(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(range.contains(15));
        assert!(!range.contains(9));
        assert!(!range.contains(21));
    }

    #[test]
    fn test_clamp() {
        let range = TimeRange::new(100, 200);
        assert_eq!(range.clamp(50), 100);
        assert_eq!(range.clamp(150), 150);
        assert_eq!(range.clamp(999), 200);
    }

    #[test]
    fn test_union() {
        let a = TimeRange::new(10, 50);
        let b = TimeRange::new(30, 90);
        assert_eq!(a.union(&b), TimeRange::new(10, 90));

        let disjoint = TimeRange::new(200, 300);
        assert_eq!(a.union(&disjoint), TimeRange::new(10, 300));
    }

    #[test]
    fn test_span() {
        assert_eq!(TimeRange::new(10, 25).span(), 15);
        assert_eq!(TimeRange::new(7, 7).span(), 0);
    }

    #[test]
    fn test_duration_conversion_roundtrip() {
        let d = Duration::from_millis(1500);
        assert_eq!(duration_to_nanos(d), 1_500_000_000);
        assert!((nanos_to_secs_f64(1_500_000_000) - 1.5).abs() < 1e-9);
        assert_eq!(nanos_from_secs_f64(1.5), 1_500_000_000);
    }
}
