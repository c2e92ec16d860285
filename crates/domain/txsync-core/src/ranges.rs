//! Inclusive time-interval arithmetic for synchronized coverage.
//!
//! Intervals are closed on both ends over whole seconds, so `[a, b]` and `[b + 1, c]` are
//! adjacent and coalesce into `[a, c]`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    /// Callers guarantee `start <= end`.
    pub const fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts <= self.end
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// Clamp `ts` into this range.
    pub fn clamp(&self, ts: Timestamp) -> Timestamp {
        ts.clamp(self.start, self.end)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Sort, drop invalid entries and merge overlapping or adjacent intervals.
pub fn normalize(ranges: impl IntoIterator<Item = TimeRange>) -> Vec<TimeRange> {
    let mut sorted: Vec<TimeRange> = ranges.into_iter().filter(TimeRange::is_valid).collect();
    sorted.sort_by_key(|r| (r.start, r.end));

    let mut out: Vec<TimeRange> = Vec::with_capacity(sorted.len());
    for r in sorted {
        match out.last_mut() {
            Some(last) if r.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(r.end);
            }
            _ => out.push(r),
        }
    }
    out
}

/// Insert `new` into `covered` and coalesce.
pub fn coalesce(covered: &[TimeRange], new: TimeRange) -> Vec<TimeRange> {
    normalize(covered.iter().copied().chain(std::iter::once(new)))
}

/// Sub-intervals of `[start, end]` that `covered` does not contain, ascending.
pub fn gaps(covered: &[TimeRange], start: Timestamp, end: Timestamp) -> Vec<TimeRange> {
    if start > end {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut cursor = start;
    for r in normalize(covered.iter().copied()) {
        if r.end < cursor {
            continue;
        }
        if r.start > end {
            break;
        }
        if r.start > cursor {
            out.push(TimeRange::new(cursor, r.start - 1));
        }
        match r.end.checked_add(1) {
            Some(next) if next <= end => cursor = next,
            _ => return out,
        }
    }
    out.push(TimeRange::new(cursor, end));
    out
}

pub fn is_covered(covered: &[TimeRange], start: Timestamp, end: Timestamp) -> bool {
    gaps(covered, start, end).is_empty()
}
