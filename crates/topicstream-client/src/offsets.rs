//! Offset ranges and commit bookkeeping for one partition session.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use topicstream_proto::OffsetsRange;

use crate::error::ClientError;

/// Half-open offset range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OffsetRange {
    pub start: i64,
    pub end: i64,
}

impl OffsetRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn len(&self) -> i64 {
        (self.end - self.start).max(0)
    }

    pub fn contains(&self, other: &OffsetRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &OffsetRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for OffsetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl From<OffsetRange> for OffsetsRange {
    fn from(range: OffsetRange) -> Self {
        OffsetsRange {
            start: range.start,
            end: range.end,
        }
    }
}

impl From<OffsetsRange> for OffsetRange {
    fn from(range: OffsetsRange) -> Self {
        OffsetRange::new(range.start, range.end)
    }
}

/// A set of disjoint half-open ranges. Adjacent ranges are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    // start -> end
    ranges: BTreeMap<i64, i64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `range`. Fails without changing the set when it intersects a
    /// range already present.
    pub fn insert(&mut self, range: OffsetRange) -> Result<(), OffsetRange> {
        if range.is_empty() {
            return Ok(());
        }

        let before = self
            .ranges
            .range(..=range.start)
            .next_back()
            .map(|(&s, &e)| OffsetRange::new(s, e));
        let after = self
            .ranges
            .range((Bound::Excluded(range.start), Bound::Unbounded))
            .next()
            .map(|(&s, &e)| OffsetRange::new(s, e));

        if let Some(b) = before {
            if b.overlaps(&range) {
                return Err(b);
            }
        }
        if let Some(a) = after {
            if a.overlaps(&range) {
                return Err(a);
            }
        }

        let mut merged = range;
        if let Some(b) = before.filter(|b| b.end == range.start) {
            self.ranges.remove(&b.start);
            merged.start = b.start;
        }
        if let Some(a) = after.filter(|a| a.start == range.end) {
            self.ranges.remove(&a.start);
            merged.end = a.end;
        }
        self.ranges.insert(merged.start, merged.end);
        Ok(())
    }

    /// Whether one stored range fully covers `range`.
    pub fn covers(&self, range: &OffsetRange) -> bool {
        self.ranges
            .range(..=range.start)
            .next_back()
            .map(|(&s, &e)| OffsetRange::new(s, e).contains(range))
            .unwrap_or(false)
    }

    /// Whether any stored range intersects `range`.
    pub fn intersects(&self, range: &OffsetRange) -> bool {
        let before = self
            .ranges
            .range(..=range.start)
            .next_back()
            .is_some_and(|(_, &e)| e > range.start);
        let inside = self
            .ranges
            .range(range.start..range.end.max(range.start))
            .next()
            .is_some();
        !range.is_empty() && (before || inside)
    }

    /// Drop everything below `watermark`, truncating a straddling range.
    pub fn remove_below(&mut self, watermark: i64) {
        let below: Vec<(i64, i64)> = self
            .ranges
            .range(..watermark)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (start, end) in below {
            self.ranges.remove(&start);
            if end > watermark {
                self.ranges.insert(watermark, end);
            }
        }
    }

    /// Remove and return all ranges in ascending order.
    pub fn take(&mut self) -> Vec<OffsetRange> {
        std::mem::take(&mut self.ranges)
            .into_iter()
            .map(|(s, e)| OffsetRange::new(s, e))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = OffsetRange> + '_ {
        self.ranges.iter().map(|(&s, &e)| OffsetRange::new(s, e))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }
}

/// Outcome of registering a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New range, must be sent to the server.
    Registered,
    /// Already covered by a pending commit. Nothing new to send.
    AlreadyPending,
}

/// Committed watermark plus the commits waiting for it to move.
///
/// The watermark only moves forward. A registered range is pending until the
/// watermark reaches its end. Pending ranges never overlap each other.
#[derive(Debug, Clone, Default)]
pub struct CommitTracker {
    committed: i64,
    pending: RangeSet,
    unsent: RangeSet,
}

impl CommitTracker {
    pub fn new(committed: i64) -> Self {
        Self {
            committed,
            ..Default::default()
        }
    }

    pub fn committed(&self) -> i64 {
        self.committed
    }

    /// Validate and register `range`.
    pub fn register(&mut self, range: OffsetRange) -> Result<Registration, ClientError> {
        if range.start < self.committed {
            return Err(ClientError::CommitBelowWatermark {
                start: range.start,
                end: range.end,
                committed: self.committed,
            });
        }
        if self.pending.covers(&range) {
            return Ok(Registration::AlreadyPending);
        }
        if self.pending.insert(range).is_err() {
            return Err(ClientError::CommitOverlap {
                start: range.start,
                end: range.end,
            });
        }
        // `pending` accepted it, so it cannot intersect the unsent subset.
        let _ = self.unsent.insert(range);
        Ok(Registration::Registered)
    }

    /// Registered ranges that have not been sent yet, merged and ascending.
    pub fn take_unsent(&mut self) -> Vec<OffsetRange> {
        self.unsent.take()
    }

    pub fn has_unsent(&self) -> bool {
        !self.unsent.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Apply a committed offset reported by the server. Returns whether the
    /// watermark moved.
    pub fn advance(&mut self, committed: i64) -> bool {
        if committed <= self.committed {
            return false;
        }
        self.committed = committed;
        self.pending.remove_below(committed);
        self.unsent.remove_below(committed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: i64, end: i64) -> OffsetRange {
        OffsetRange::new(start, end)
    }

    #[test]
    fn test_insert_merges_adjacent() {
        let mut set = RangeSet::new();
        set.insert(r(0, 2)).unwrap();
        set.insert(r(4, 6)).unwrap();
        set.insert(r(2, 4)).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![r(0, 6)]);
    }

    #[test]
    fn test_insert_rejects_intersection() {
        let mut set = RangeSet::new();
        set.insert(r(10, 20)).unwrap();
        assert_eq!(set.insert(r(15, 25)), Err(r(10, 20)));
        assert_eq!(set.insert(r(5, 11)), Err(r(10, 20)));
        assert_eq!(set.insert(r(10, 12)), Err(r(10, 20)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_covers_and_intersects() {
        let mut set = RangeSet::new();
        set.insert(r(10, 20)).unwrap();
        assert!(set.covers(&r(12, 15)));
        assert!(!set.covers(&r(15, 25)));
        assert!(set.intersects(&r(19, 30)));
        assert!(set.intersects(&r(0, 11)));
        assert!(!set.intersects(&r(20, 30)));
        assert!(!set.intersects(&r(0, 10)));
    }

    #[test]
    fn test_remove_below_truncates() {
        let mut set = RangeSet::new();
        set.insert(r(0, 5)).unwrap();
        set.insert(r(8, 12)).unwrap();
        set.remove_below(10);
        assert_eq!(set.take(), vec![r(10, 12)]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_tracker_rejects_below_watermark() {
        let mut tracker = CommitTracker::new(5);
        assert!(matches!(
            tracker.register(r(3, 6)),
            Err(ClientError::CommitBelowWatermark { committed: 5, .. })
        ));
        assert_eq!(tracker.register(r(5, 6)).unwrap(), Registration::Registered);
    }

    #[test]
    fn test_tracker_duplicate_and_overlap() {
        let mut tracker = CommitTracker::new(0);
        assert_eq!(tracker.register(r(0, 4)).unwrap(), Registration::Registered);
        assert_eq!(
            tracker.register(r(1, 3)).unwrap(),
            Registration::AlreadyPending
        );
        assert!(matches!(
            tracker.register(r(3, 8)),
            Err(ClientError::CommitOverlap { start: 3, end: 8 })
        ));
        assert_eq!(tracker.take_unsent(), vec![r(0, 4)]);
        assert!(tracker.has_pending());
    }

    #[test]
    fn test_tracker_coalesces_unsent_and_advances() {
        let mut tracker = CommitTracker::new(0);
        tracker.register(r(0, 1)).unwrap();
        tracker.register(r(1, 2)).unwrap();
        tracker.register(r(5, 6)).unwrap();
        assert_eq!(tracker.take_unsent(), vec![r(0, 2), r(5, 6)]);

        assert!(tracker.advance(2));
        assert!(!tracker.advance(1));
        assert_eq!(tracker.committed(), 2);
        assert!(tracker.has_pending());
        assert!(tracker.advance(6));
        assert!(!tracker.has_pending());
    }
}
