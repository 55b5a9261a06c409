//! Integration tests for range and bookend queries.

use alopex_pointstore::{
    BackendRegistry, BackendSelector, BatchEntry, BookendPosition, EmbeddedBackend, MemoryBackend,
    PointValueStore, QueryMode, QueryWindow, Sample, SeriesId, StoreConfig, SyncMode, TimeOrder,
    Timestamp,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Stores to run every scenario against.
fn stores(dir: &TempDir) -> Vec<PointValueStore> {
    let registry = BackendRegistry::default();
    let base = StoreConfig::new(dir.path())
        .with_shard_duration(Duration::from_millis(32))
        .with_sync_mode(SyncMode::None)
        .with_batch_size(3);

    let mut selectors = vec![BackendSelector::Embedded, BackendSelector::Memory];
    if cfg!(feature = "sqlite") {
        selectors.push(BackendSelector::relational("sqlite"));
    }
    selectors
        .into_iter()
        .map(|selector| {
            PointValueStore::open(base.clone().with_backend(selector), &registry).unwrap()
        })
        .collect()
}

fn bookends(
    store: &PointValueStore,
    series: &[SeriesId],
    window: QueryWindow,
    mode: QueryMode,
) -> Vec<(BookendPosition, SeriesId, Timestamp)> {
    store
        .bookend_query(series, window, mode)
        .unwrap()
        .map(|v| {
            let v = v.unwrap();
            (v.position, v.series, v.sample.timestamp)
        })
        .collect()
}

fn range(
    store: &PointValueStore,
    series: &[SeriesId],
    window: QueryWindow,
    order: TimeOrder,
    mode: QueryMode,
) -> Vec<(SeriesId, Timestamp)> {
    store
        .range_query(series, window, order, mode)
        .unwrap()
        .map(|t| {
            let t = t.unwrap();
            (t.series, t.sample.timestamp)
        })
        .collect()
}

// ============================================================================
// Bookend Queries
// ============================================================================

/// Samples at -10, 5 and 50 with window [0, 40) give before -10, within 5
/// and after 50 on every backend.
#[test]
fn test_bookend_completeness() {
    let temp_dir = TempDir::new().unwrap();
    for store in stores(&temp_dir) {
        for ts in [-10, 5, 50] {
            store.insert_sync(1, Sample::new(ts, ts as f64)).unwrap();
        }
        let selector = store.backend().selector();
        for mode in [QueryMode::Combined, QueryMode::PerPoint] {
            assert_eq!(
                bookends(&store, &[1], QueryWindow::new(0, 40), mode),
                vec![
                    (BookendPosition::Before, 1, -10),
                    (BookendPosition::Within, 1, 5),
                    (BookendPosition::After, 1, 50),
                ],
                "{selector} {mode:?}"
            );
        }
        store.close().unwrap();
    }
}

/// An empty window yields only the bracketing values.
#[test]
fn test_empty_window_bookends() {
    let temp_dir = TempDir::new().unwrap();
    for store in stores(&temp_dir) {
        for ts in [-10, 5, 50] {
            store.insert_sync(1, Sample::new(ts, 0.0)).unwrap();
        }
        assert_eq!(
            bookends(&store, &[1], QueryWindow::new(5, 5), QueryMode::Combined),
            vec![(BookendPosition::Before, 1, -10), (BookendPosition::After, 1, 5)],
            "{}",
            store.backend().selector()
        );
        assert!(range(
            &store,
            &[1],
            QueryWindow::new(5, 5),
            TimeOrder::Ascending,
            QueryMode::Combined
        )
        .is_empty());
        store.close().unwrap();
    }
}

/// Missing bookends are omitted, not errors.
#[test]
fn test_bookends_omitted_at_edges() {
    let temp_dir = TempDir::new().unwrap();
    for store in stores(&temp_dir) {
        store.insert_sync(4, Sample::new(100, 0.0)).unwrap();
        store.insert_sync(4, Sample::new(150, 0.0)).unwrap();
        assert_eq!(
            bookends(&store, &[4, 5], QueryWindow::new(100, 1_000), QueryMode::PerPoint),
            vec![(BookendPosition::Within, 4, 100), (BookendPosition::Within, 4, 150)]
        );
        store.close().unwrap();
    }
}

// ============================================================================
// Range Queries
// ============================================================================

/// Combined queries interleave series by time; ties go to the lower id.
#[test]
fn test_combined_query_interleaves_series() {
    let temp_dir = TempDir::new().unwrap();
    for store in stores(&temp_dir) {
        let entries: Vec<_> = [(2, 10), (1, 10), (1, 70), (2, 40), (3, 5), (3, 200)]
            .into_iter()
            .map(|(series, ts)| BatchEntry::new(series, Sample::new(ts, 0.0)))
            .collect();
        store.insert_batch(&entries, None).unwrap();

        let window = QueryWindow::new(0, 100);
        assert_eq!(
            range(&store, &[1, 2, 3], window, TimeOrder::Ascending, QueryMode::Combined),
            vec![(3, 5), (1, 10), (2, 10), (2, 40), (1, 70)]
        );
        assert_eq!(
            range(&store, &[1, 2, 3], window, TimeOrder::Descending, QueryMode::Combined),
            vec![(1, 70), (2, 40), (2, 10), (1, 10), (3, 5)]
        );
        assert_eq!(
            range(&store, &[3, 2, 1, 2], window, TimeOrder::Ascending, QueryMode::PerPoint),
            vec![(1, 10), (1, 70), (2, 10), (2, 40), (3, 5)]
        );
        store.close().unwrap();
    }
}

/// The per-series form maps every requested series to its own stream.
#[test]
fn test_per_series_mapping() {
    let temp_dir = TempDir::new().unwrap();
    for store in stores(&temp_dir) {
        for (series, ts) in [(7, 3), (7, 1), (8, 2)] {
            store.insert_sync(series, Sample::new(ts, 0.0)).unwrap();
        }
        let mapped: Vec<(SeriesId, Vec<Timestamp>)> = store
            .range_query_per_series(&[9, 8, 7], QueryWindow::new(0, 10), TimeOrder::Descending)
            .unwrap()
            .into_iter()
            .map(|(series, scan)| (series, scan.map(|s| s.unwrap().timestamp).collect()))
            .collect();
        assert_eq!(mapped, vec![(7, vec![3, 1]), (8, vec![2]), (9, vec![])]);
        store.close().unwrap();
    }
}

/// Abandoning a scan part way leaves no shard pinned.
#[test]
fn test_abandoned_scan_releases_handles() {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::new(temp_dir.path())
        .with_shard_duration(Duration::from_millis(10))
        .with_sync_mode(SyncMode::None)
        .with_max_open_files(2);
    let backend = Arc::new(EmbeddedBackend::open(&config).unwrap());
    let store = PointValueStore::new(config, backend.clone()).unwrap();
    for series in 0..5 {
        for ts in 0..100 {
            store.insert_sync(series, Sample::new(ts, 0.0)).unwrap();
        }
    }

    let mut scan = store
        .range_query(
            &[0, 1, 2, 3, 4],
            QueryWindow::new(0, 100),
            TimeOrder::Ascending,
            QueryMode::Combined,
        )
        .unwrap();
    for _ in 0..7 {
        scan.next().unwrap().unwrap();
    }
    assert_eq!(backend.shard_stats().pinned, 0);
    drop(scan);

    // With everything released, new writes still find free handles.
    store.insert_sync(99, Sample::new(0, 0.0)).unwrap();
    assert!(backend.shard_stats().peak_open <= 2);
}

// ============================================================================
// Order Symmetry
// ============================================================================

fn dataset_strategy() -> impl Strategy<Value = Vec<(SeriesId, Timestamp)>> {
    prop::collection::vec((0u64..4, -500i64..500), 0..80)
}

proptest! {
    /// Ascending reversed equals descending, for combined and per-series
    /// results, over any window.
    #[test]
    fn test_order_symmetry(data in dataset_strategy(), start in -600i64..600, len in 0i64..800) {
        let config = StoreConfig::default().with_batch_size(5);
        let backend = Arc::new(MemoryBackend::new(&config));
        let store = PointValueStore::new(config.clone(), backend).unwrap();
        let entries: Vec<_> = data
            .iter()
            .map(|(series, ts)| BatchEntry::new(*series, Sample::new(*ts, 0.0)))
            .collect();
        store.insert_batch(&entries, None).unwrap();

        let window = QueryWindow::new(start, start + len);
        let series = [0, 1, 2, 3];
        let combined = QueryMode::Combined;
        let mut ascending = range(&store, &series, window, TimeOrder::Ascending, combined);
        let descending = range(&store, &series, window, TimeOrder::Descending, combined);
        ascending.reverse();
        prop_assert_eq!(&ascending, &descending);

        let mut expected: Vec<_> = data
            .iter()
            .filter(|(_, ts)| window.contains(*ts))
            .map(|(series, ts)| (*series, *ts))
            .collect();
        expected.sort_unstable_by_key(|(series, ts)| (*ts, *series));
        expected.dedup();
        expected.reverse();
        prop_assert_eq!(descending, expected);
    }
}
