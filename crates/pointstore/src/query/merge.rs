//! K-way merge of per-series sample streams.

use crate::backend::SampleScan;
use crate::error::{Result, StoreError};
use crate::model::{Sample, SeriesId, TaggedSample, TimeOrder, Timestamp};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct HeapItem {
    key: (Timestamp, SeriesId),
    order: TimeOrder,
    source: usize,
    sample: Sample,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for HeapItem {}

// BinaryHeap pops the greatest item: smallest key first when ascending,
// largest key first when descending.
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.order {
            TimeOrder::Ascending => other.key.cmp(&self.key),
            TimeOrder::Descending => self.key.cmp(&other.key),
        }
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges time-ordered series streams into one stream ordered by
/// `(timestamp, series)`, ascending or descending.
///
/// Each source is read one sample ahead; nothing is pulled before the first
/// call to `next`. The merge stops after yielding an error.
pub struct KWayMerge {
    sources: Vec<(SeriesId, SampleScan)>,
    order: TimeOrder,
    heap: BinaryHeap<HeapItem>,
    primed: bool,
    pending_error: Option<StoreError>,
    done: bool,
}

impl KWayMerge {
    /// Creates a merge over `sources`, each ordered by `order`.
    pub fn new(sources: Vec<(SeriesId, SampleScan)>, order: TimeOrder) -> Self {
        let capacity = sources.len();
        Self {
            sources,
            order,
            heap: BinaryHeap::with_capacity(capacity),
            primed: false,
            pending_error: None,
            done: false,
        }
    }

    fn pull(&mut self, source: usize) -> Result<()> {
        let (series, scan) = &mut self.sources[source];
        if let Some(sample) = scan.next().transpose()? {
            self.heap.push(HeapItem {
                key: (sample.timestamp, *series),
                order: self.order,
                source,
                sample,
            });
        }
        Ok(())
    }
}

impl Iterator for KWayMerge {
    type Item = Result<TaggedSample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(err) = self.pending_error.take() {
            self.done = true;
            return Some(Err(err));
        }
        if !self.primed {
            self.primed = true;
            for source in 0..self.sources.len() {
                if let Err(err) = self.pull(source) {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }

        let Some(item) = self.heap.pop() else {
            self.done = true;
            return None;
        };
        if let Err(err) = self.pull(item.source) {
            self.pending_error = Some(err);
        }
        Some(Ok(TaggedSample {
            series: item.key.1,
            sample: item.sample,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(
        series: SeriesId,
        timestamps: &[Timestamp],
        order: TimeOrder,
    ) -> (SeriesId, SampleScan) {
        let mut samples: Vec<_> = timestamps.iter().map(|ts| Sample::new(*ts, 0.0)).collect();
        if order == TimeOrder::Descending {
            samples.reverse();
        }
        (series, Box::new(samples.into_iter().map(Ok)))
    }

    fn keys(merge: KWayMerge) -> Vec<(Timestamp, SeriesId)> {
        merge
            .map(|item| {
                let item = item.unwrap();
                (item.sample.timestamp, item.series)
            })
            .collect()
    }

    #[test]
    fn test_merge_ascending_breaks_ties_by_series() {
        let order = TimeOrder::Ascending;
        let merge = KWayMerge::new(
            vec![
                source(2, &[1, 4, 9], order),
                source(1, &[1, 5], order),
                source(3, &[], order),
            ],
            order,
        );
        assert_eq!(keys(merge), vec![(1, 1), (1, 2), (4, 2), (5, 1), (9, 2)]);
    }

    #[test]
    fn test_descending_is_reverse_of_ascending() {
        let data: [(SeriesId, &[Timestamp]); 3] =
            [(1, &[-3, 0, 7][..]), (2, &[0, 2][..]), (5, &[7, 8][..])];
        let build = |order| {
            KWayMerge::new(
                data.iter().map(|(series, ts)| source(*series, ts, order)).collect(),
                order,
            )
        };

        let mut ascending = keys(build(TimeOrder::Ascending));
        ascending.reverse();
        assert_eq!(ascending, keys(build(TimeOrder::Descending)));
    }

    #[test]
    fn test_error_is_yielded_after_pending_sample() {
        let failing: SampleScan = Box::new(
            vec![
                Ok(Sample::new(1, 0.0)),
                Err(StoreError::CorruptShard("bad record".into())),
            ]
            .into_iter(),
        );
        let mut merge = KWayMerge::new(vec![(1, failing)], TimeOrder::Ascending);

        assert_eq!(merge.next().unwrap().unwrap().sample.timestamp, 1);
        assert!(matches!(merge.next(), Some(Err(StoreError::CorruptShard(_)))));
        assert!(merge.next().is_none());
    }

    #[test]
    fn test_sources_are_not_read_before_first_next() {
        let poisoned: SampleScan = Box::new(std::iter::once_with(|| -> Result<Sample> {
            panic!("source read eagerly")
        }));
        let merge = KWayMerge::new(vec![(1, poisoned)], TimeOrder::Ascending);
        drop(merge);
    }
}
