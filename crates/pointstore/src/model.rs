//! Core data model shared by every backend.

use std::fmt;

/// Unique identifier of a series (a data point), owned by the caller's catalog.
pub type SeriesId = u64;

/// Sample timestamp in milliseconds since the Unix epoch. Negative values are
/// pre-epoch and fully supported.
pub type Timestamp = i64;

/// A single timestamped value of a series.
///
/// At most one authoritative sample exists per `(series, timestamp)`; a later
/// write with the same timestamp replaces the earlier one.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Sample time in milliseconds.
    pub timestamp: Timestamp,
    /// Numeric value.
    pub value: f64,
    /// Optional opaque annotation payload.
    pub annotation: Option<Vec<u8>>,
}

impl Sample {
    /// Creates a sample without annotation.
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self {
            timestamp,
            value,
            annotation: None,
        }
    }

    /// Attaches an annotation payload.
    pub fn with_annotation(mut self, annotation: impl Into<Vec<u8>>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }
}

/// One element of a batch write.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    /// Target series.
    pub series: SeriesId,
    /// Sample to store.
    pub sample: Sample,
}

impl BatchEntry {
    /// Creates a batch entry.
    pub fn new(series: SeriesId, sample: Sample) -> Self {
        Self { series, sample }
    }
}

/// A sample tagged with the series it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedSample {
    /// Owning series.
    pub series: SeriesId,
    /// The sample.
    pub sample: Sample,
}

/// Direction of a time-ordered scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeOrder {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

impl TimeOrder {
    /// Returns the opposite direction.
    pub fn reverse(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}

/// How results for several series are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// One stream merged across all series by timestamp.
    #[default]
    Combined,
    /// Series delivered one after another, each time ordered.
    PerPoint,
}

/// Half-open query window `[start, end)`.
///
/// A window whose end is not after its start is empty: it contains no
/// samples, but bookend lookups around it still resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    /// Inclusive start.
    pub start: Timestamp,
    /// Exclusive end.
    pub end: Timestamp,
}

impl QueryWindow {
    /// Creates a window.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Returns true if the window contains no timestamps.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Returns true if `ts` lies within the window.
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Intersection with another window.
    pub fn intersect(&self, other: &QueryWindow) -> QueryWindow {
        QueryWindow {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        }
    }
}

impl fmt::Display for QueryWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A time bucket covering `[start, end)`; each bucket of a series maps to one
/// shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeBucket {
    /// Inclusive bucket start, aligned to the bucket duration.
    pub start: Timestamp,
    /// Exclusive bucket end. Saturates at `i64::MAX`.
    pub end: Timestamp,
}

impl TimeBucket {
    /// Returns the bucket of `duration_ms` that contains `ts`.
    pub fn containing(ts: Timestamp, duration_ms: i64) -> Self {
        Self::starting_at(align_timestamp(ts, duration_ms), duration_ms)
    }

    /// Returns the bucket starting at an already aligned timestamp.
    ///
    /// The lowest bucket starts at the clamped `i64::MIN`; its end stays on
    /// the bucket grid so it never overlaps its successor.
    pub fn starting_at(start: Timestamp, duration_ms: i64) -> Self {
        let duration = i128::from(duration_ms.max(1));
        let grid_start = i128::from(start).div_euclid(duration) * duration;
        let end = (grid_start + duration).min(i128::from(Timestamp::MAX));
        Self {
            start,
            end: end as Timestamp,
        }
    }

    /// Returns true if every timestamp of the bucket is older than `cutoff`.
    pub fn expired_by(&self, cutoff: Timestamp) -> bool {
        self.end <= cutoff
    }

    /// The bucket as a query window.
    pub fn window(&self) -> QueryWindow {
        QueryWindow::new(self.start, self.end)
    }
}

/// Identity of one shard: a series and the start of its time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey {
    /// Owning series.
    pub series: SeriesId,
    /// Start of the bucket the shard covers.
    pub bucket_start: Timestamp,
}

impl ShardKey {
    /// Creates a shard key.
    pub fn new(series: SeriesId, bucket_start: Timestamp) -> Self {
        Self {
            series,
            bucket_start,
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}@{}", self.series, self.bucket_start)
    }
}

/// Aligns a timestamp down to a multiple of `duration`, flooring toward
/// negative infinity so pre-epoch timestamps land in the correct bucket.
pub(crate) fn align_timestamp(timestamp: Timestamp, duration: i64) -> i64 {
    let (quotient, _) = div_floor(timestamp, duration);
    quotient.saturating_mul(duration)
}

fn div_floor(value: i64, divisor: i64) -> (i64, i64) {
    let mut quotient = value / divisor;
    let mut remainder = value % divisor;
    if remainder < 0 {
        quotient -= 1;
        remainder += divisor;
    }
    (quotient, remainder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_alignment_handles_negative_timestamps() {
        let bucket = TimeBucket::containing(-10, 100);
        assert_eq!(bucket.start, -100);
        assert_eq!(bucket.end, 0);

        let bucket = TimeBucket::containing(0, 100);
        assert_eq!(bucket.start, 0);
        assert_eq!(bucket.end, 100);

        let bucket = TimeBucket::containing(199, 100);
        assert_eq!(bucket.start, 100);
    }

    #[test]
    fn test_bucket_saturates_near_max() {
        let bucket = TimeBucket::containing(i64::MAX - 1, 1000);
        assert!(bucket.start <= i64::MAX - 1);
        assert_eq!(bucket.end, i64::MAX);
    }

    #[test]
    fn test_lowest_bucket_ends_on_grid() {
        let lowest = TimeBucket::containing(i64::MIN, 1000);
        assert_eq!(lowest.start, i64::MIN);
        let next = TimeBucket::containing(lowest.end, 1000);
        assert_eq!(next.start, lowest.end);
        assert_eq!(TimeBucket::containing(lowest.end - 1, 1000), lowest);
        assert_eq!(lowest.end.rem_euclid(1000), 0);
    }

    #[test]
    fn test_window_semantics() {
        let window = QueryWindow::new(0, 40);
        assert!(window.contains(0));
        assert!(window.contains(39));
        assert!(!window.contains(40));
        assert!(!window.is_empty());
        assert!(QueryWindow::new(5, 5).is_empty());
        assert!(QueryWindow::new(10, 5).is_empty());

        let clipped = window.intersect(&QueryWindow::new(20, 100));
        assert_eq!(clipped, QueryWindow::new(20, 40));
    }

    #[test]
    fn test_order_reverse() {
        assert_eq!(TimeOrder::Ascending.reverse(), TimeOrder::Descending);
        assert_eq!(TimeOrder::Descending.reverse(), TimeOrder::Ascending);
    }
}
