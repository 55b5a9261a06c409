//! Volatile in-memory backend.

use crate::backend::{paging, Backend, SampleScan};
use crate::codec;
use crate::config::{BackendSelector, StoreConfig};
use crate::error::Result;
use crate::model::{BatchEntry, QueryWindow, Sample, SeriesId, TimeOrder, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type SeriesMap = HashMap<SeriesId, BTreeMap<Timestamp, Sample>>;

/// Backend keeping every series in a sorted map.
///
/// Nothing survives a restart. When a per-series value limit is set the
/// oldest samples are dropped first.
#[derive(Clone)]
pub struct MemoryBackend {
    series: Arc<RwLock<SeriesMap>>,
    value_limit: Option<usize>,
    page_size: usize,
}

impl MemoryBackend {
    /// Creates an empty backend sized from `config`.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            series: Arc::new(RwLock::new(HashMap::new())),
            value_limit: config.memory_series_value_limit,
            page_size: config.batch_size.max(1),
        }
    }

    /// Number of samples held for `series`.
    pub fn len(&self, series: SeriesId) -> usize {
        self.series.read().get(&series).map_or(0, BTreeMap::len)
    }

    fn insert(&self, map: &mut SeriesMap, series: SeriesId, sample: &Sample) {
        let values = map.entry(series).or_default();
        values.insert(sample.timestamp, sample.clone());
        if let Some(limit) = self.value_limit {
            while values.len() > limit {
                values.pop_first();
            }
        }
    }
}

impl Backend for MemoryBackend {
    fn selector(&self) -> BackendSelector {
        BackendSelector::Memory
    }

    fn write(&self, series: SeriesId, sample: &Sample) -> Result<()> {
        codec::validate(sample)?;
        let mut map = self.series.write();
        self.insert(&mut map, series, sample);
        Ok(())
    }

    fn write_batch(&self, entries: &[BatchEntry]) -> Result<()> {
        for entry in entries {
            codec::validate(&entry.sample)?;
        }
        let mut map = self.series.write();
        for entry in entries {
            self.insert(&mut map, entry.series, &entry.sample);
        }
        Ok(())
    }

    fn scan(&self, series: SeriesId, window: QueryWindow, order: TimeOrder) -> Result<SampleScan> {
        Ok(Box::new(MemoryScan {
            series: Arc::clone(&self.series),
            id: series,
            window,
            order,
            page_size: self.page_size,
            cursor: None,
            page: Vec::new().into_iter(),
            exhausted: false,
        }))
    }

    fn latest_before(&self, series: SeriesId, ts: Timestamp) -> Result<Option<Sample>> {
        let map = self.series.read();
        Ok(map
            .get(&series)
            .and_then(|values| values.range(..ts).next_back())
            .map(|(_, sample)| sample.clone()))
    }

    fn earliest_at_or_after(&self, series: SeriesId, ts: Timestamp) -> Result<Option<Sample>> {
        let map = self.series.read();
        Ok(map
            .get(&series)
            .and_then(|values| values.range(ts..).next())
            .map(|(_, sample)| sample.clone()))
    }

    fn purge_before(&self, cutoff: Timestamp) -> Result<u64> {
        let mut map = self.series.write();
        let mut removed = 0;
        for values in map.values_mut() {
            let kept = values.split_off(&cutoff);
            removed += values.len() as u64;
            *values = kept;
        }
        map.retain(|_, values| !values.is_empty());
        Ok(removed)
    }
}

/// Scan copying one page at a time so the map lock is never held between
/// calls to `next`.
struct MemoryScan {
    series: Arc<RwLock<SeriesMap>>,
    id: SeriesId,
    window: QueryWindow,
    order: TimeOrder,
    page_size: usize,
    cursor: Option<Timestamp>,
    page: std::vec::IntoIter<Sample>,
    exhausted: bool,
}

impl MemoryScan {
    fn load_page(&mut self) {
        let remaining = paging::remaining(self.window, self.order, self.cursor);
        if remaining.is_empty() {
            self.exhausted = true;
            return;
        }

        let map = self.series.read();
        let Some(values) = map.get(&self.id) else {
            self.exhausted = true;
            return;
        };
        let range = values.range(remaining.start..remaining.end);
        let page: Vec<Sample> = match self.order {
            TimeOrder::Ascending => range.take(self.page_size).map(|(_, s)| s.clone()).collect(),
            TimeOrder::Descending => range
                .rev()
                .take(self.page_size)
                .map(|(_, s)| s.clone())
                .collect(),
        };
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.cursor = page.last().map(|s| s.timestamp).or(self.cursor);
        self.page = page.into_iter();
    }
}

impl Iterator for MemoryScan {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(sample) = self.page.next() {
                return Some(Ok(sample));
            }
            if self.exhausted {
                return None;
            }
            self.load_page();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(page_size: usize) -> MemoryBackend {
        MemoryBackend::new(&StoreConfig::default().with_batch_size(page_size))
    }

    fn collect(scan: SampleScan) -> Vec<Timestamp> {
        scan.map(|s| s.unwrap().timestamp).collect()
    }

    #[test]
    fn test_scan_pages_in_both_orders() {
        let backend = backend(3);
        let entries: Vec<_> = (0..10)
            .map(|i| BatchEntry::new(1, Sample::new(i * 10, i as f64)))
            .collect();
        backend.write_batch(&entries).unwrap();

        let window = QueryWindow::new(15, 85);
        assert_eq!(
            collect(backend.scan(1, window, TimeOrder::Ascending).unwrap()),
            vec![20, 30, 40, 50, 60, 70, 80]
        );
        assert_eq!(
            collect(backend.scan(1, window, TimeOrder::Descending).unwrap()),
            vec![80, 70, 60, 50, 40, 30, 20]
        );
    }

    #[test]
    fn test_scan_sees_writes_between_pages() {
        let backend = backend(2);
        for ts in [1, 2, 3] {
            backend.write(1, &Sample::new(ts, 0.0)).unwrap();
        }
        let mut scan = backend.scan(1, QueryWindow::new(0, 100), TimeOrder::Ascending).unwrap();
        assert_eq!(scan.next().unwrap().unwrap().timestamp, 1);
        backend.write(1, &Sample::new(50, 0.0)).unwrap();
        let rest: Vec<_> = scan.map(|s| s.unwrap().timestamp).collect();
        assert_eq!(rest, vec![2, 3, 50]);
    }

    #[test]
    fn test_last_write_wins() {
        let backend = backend(10);
        backend.write(1, &Sample::new(5, 1.0)).unwrap();
        backend.write(1, &Sample::new(5, 2.0)).unwrap();
        assert_eq!(backend.len(1), 1);
        assert_eq!(backend.earliest_at_or_after(1, 0).unwrap().unwrap().value, 2.0);
    }

    #[test]
    fn test_value_limit_drops_oldest() {
        let config = StoreConfig::default().with_memory_series_value_limit(3);
        let backend = MemoryBackend::new(&config);
        for ts in 0..5 {
            backend.write(1, &Sample::new(ts, 0.0)).unwrap();
        }
        assert_eq!(backend.len(1), 3);
        assert!(backend.latest_before(1, 2).unwrap().is_none());
    }

    #[test]
    fn test_bookends_and_purge() {
        let backend = backend(10);
        for ts in [-10, 5, 50] {
            backend.write(7, &Sample::new(ts, 0.0)).unwrap();
        }
        assert_eq!(backend.latest_before(7, 0).unwrap().unwrap().timestamp, -10);
        assert_eq!(backend.earliest_at_or_after(7, 40).unwrap().unwrap().timestamp, 50);
        assert!(backend.latest_before(8, 0).unwrap().is_none());

        assert_eq!(backend.purge_before(5).unwrap(), 1);
        assert_eq!(backend.len(7), 2);
    }

    #[test]
    fn test_empty_window_yields_nothing() {
        let backend = backend(10);
        backend.write(1, &Sample::new(5, 0.0)).unwrap();
        let scan = backend.scan(1, QueryWindow::new(5, 5), TimeOrder::Ascending).unwrap();
        assert!(collect(scan).is_empty());
    }
}
