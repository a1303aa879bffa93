//! Write timestamps and inclusive timestamp windows.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical write timestamp attached to fragments and to individual cells.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Least possible timestamp.
    pub const MIN: Self = Self(0);
    /// Greatest possible timestamp (used for open-ended windows).
    pub const MAX: Self = Self(u64::MAX);

    /// Construct a timestamp from a raw `u64`.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw `u64` value backing this timestamp.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Milliseconds since the Unix epoch, used when a write carries no
    /// explicit timestamp.
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self(millis)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Timestamp").field(&self.0).finish()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive `[start, end]` window of timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimestampRange {
    /// First timestamp in the window.
    pub start: Timestamp,
    /// Last timestamp in the window.
    pub end: Timestamp,
}

impl TimestampRange {
    /// The window covering every timestamp.
    pub const ALL: Self = Self {
        start: Timestamp::MIN,
        end: Timestamp::MAX,
    };

    /// Build a window from raw bounds. Callers validate `start <= end`.
    #[inline]
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            start: Timestamp::new(start),
            end: Timestamp::new(end),
        }
    }

    /// A single discrete write time.
    #[inline]
    pub const fn at(ts: Timestamp) -> Self {
        Self { start: ts, end: ts }
    }

    /// `true` when `start <= end`.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// `true` when `ts` lies inside the window.
    #[inline]
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// `true` when `self` lies entirely inside `window`.
    #[inline]
    pub fn is_within(&self, window: &TimestampRange) -> bool {
        self.start >= window.start && self.end <= window.end
    }

    /// `true` when the two windows share at least one timestamp.
    #[inline]
    pub fn intersects(&self, window: &TimestampRange) -> bool {
        self.start <= window.end && window.start <= self.end
    }

    /// Overlap test used by directory classification: full containment when
    /// `partial` is false, any intersection otherwise.
    #[inline]
    pub fn overlaps(&self, window: &TimestampRange, partial: bool) -> bool {
        if partial {
            self.intersects(window)
        } else {
            self.is_within(window)
        }
    }

    /// Smallest window covering both inputs.
    #[inline]
    pub fn union(&self, other: &TimestampRange) -> TimestampRange {
        TimestampRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for TimestampRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_rules() {
        let window = TimestampRange::new(2, 4);
        assert!(TimestampRange::new(2, 4).overlaps(&window, false));
        assert!(TimestampRange::new(3, 3).overlaps(&window, false));
        assert!(!TimestampRange::new(1, 3).overlaps(&window, false));
        assert!(TimestampRange::new(1, 3).overlaps(&window, true));
        assert!(TimestampRange::new(4, 9).overlaps(&window, true));
        assert!(!TimestampRange::new(5, 9).overlaps(&window, true));
        assert!(!TimestampRange::new(0, 1).overlaps(&window, true));
    }

    #[test]
    fn union_spans_both() {
        let merged = TimestampRange::new(3, 5).union(&TimestampRange::new(1, 2));
        assert_eq!(merged, TimestampRange::new(1, 5));
        assert!(TimestampRange::ALL.contains(Timestamp::MAX));
    }
}
