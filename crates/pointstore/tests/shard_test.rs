//! Integration tests for the embedded shard engine: the open-handle bound,
//! I/O strategy equivalence and recovery after reopening.

use alopex_pointstore::backend::{Backend, EmbeddedBackend};
use alopex_pointstore::shard::SegmentKind;
use alopex_pointstore::{
    IoStrategy, QueryWindow, Sample, SeriesId, ShardKey, StoreConfig, SyncMode, TimeOrder,
    Timestamp,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir) -> StoreConfig {
    StoreConfig::new(dir.path())
        .with_shard_duration(Duration::from_millis(1_000))
        .with_sync_mode(SyncMode::None)
}

fn read_all(backend: &EmbeddedBackend, series: SeriesId, order: TimeOrder) -> Vec<Sample> {
    backend
        .scan(series, QueryWindow::new(i64::MIN, i64::MAX), order)
        .unwrap()
        .map(|s| s.unwrap())
        .collect()
}

// ============================================================================
// Handle Bound
// ============================================================================

/// Touching many more series than `max_open_files` never opens more than
/// `max_open_files` shards at once.
#[test]
fn test_handle_bound_with_many_series() {
    let temp_dir = TempDir::new().unwrap();
    let backend = EmbeddedBackend::open(&config(&temp_dir).with_max_open_files(4)).unwrap();

    for round in 0..3 {
        for series in 0..40u64 {
            let ts = round * 100 + series as i64;
            backend.write(series, &Sample::new(ts, ts as f64)).unwrap();
        }
    }
    for series in 0..40u64 {
        assert_eq!(read_all(&backend, series, TimeOrder::Ascending).len(), 3);
    }

    let stats = backend.shard_stats();
    assert!(stats.peak_open <= 4, "peak_open = {}", stats.peak_open);
    assert!(stats.open <= 4);
    assert!(stats.evictions > 0);
    assert_eq!(stats.pinned, 0);
}

/// Concurrent writers on more series than handles stay within the bound.
#[test]
fn test_handle_bound_under_concurrency() {
    let temp_dir = TempDir::new().unwrap();
    let backend =
        Arc::new(EmbeddedBackend::open(&config(&temp_dir).with_max_open_files(3)).unwrap());

    let handles: Vec<_> = (0..6u64)
        .map(|worker| {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                for i in 0..50i64 {
                    let series = worker * 10 + (i as u64 % 4);
                    backend.write(series, &Sample::new(i, 0.0)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = backend.shard_stats();
    assert!(stats.peak_open <= 3, "peak_open = {}", stats.peak_open);
    let total: usize = (0..6u64)
        .flat_map(|worker| (0..4).map(move |k| worker * 10 + k))
        .map(|series| read_all(&backend, series, TimeOrder::Ascending).len())
        .sum();
    assert_eq!(total, 300);
}

// ============================================================================
// I/O Strategies
// ============================================================================

/// Every read strategy returns the same samples, including overlay merges.
#[test]
fn test_io_strategies_are_equivalent() {
    let mut results = Vec::new();
    for strategy in IoStrategy::ALL {
        let temp_dir = TempDir::new().unwrap();
        let backend = EmbeddedBackend::open(&config(&temp_dir).with_io_strategy(strategy)).unwrap();

        for ts in (0..3_000).step_by(7) {
            backend.write(1, &Sample::new(ts, ts as f64)).unwrap();
        }
        for ts in (1..3_000).step_by(97) {
            backend
                .write(1, &Sample::new(ts, -1.0).with_annotation(b"late".to_vec()))
                .unwrap();
        }

        let ascending = read_all(&backend, 1, TimeOrder::Ascending);
        let mut descending = read_all(&backend, 1, TimeOrder::Descending);
        descending.reverse();
        assert_eq!(ascending, descending, "strategy {strategy:?}");
        assert!(ascending.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        results.push((strategy, ascending));
    }

    let (_, reference) = &results[0];
    for (strategy, samples) in &results[1..] {
        assert_eq!(samples, reference, "strategy {strategy:?} differs");
    }
}

// ============================================================================
// Recovery
// ============================================================================

/// A torn record at the end of a base segment is dropped on reopen and the
/// shard accepts new appends afterwards.
#[test]
fn test_torn_tail_recovered_on_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(&temp_dir);
    {
        let backend = EmbeddedBackend::open(&config).unwrap();
        for ts in [10, 20, 30] {
            backend.write(5, &Sample::new(ts, 1.0)).unwrap();
        }
        let base = backend
            .layout()
            .segment_path(ShardKey::new(5, 0), SegmentKind::Base);
        let mut file = OpenOptions::new().append(true).open(base).unwrap();
        file.write_all(&[0xAB; 11]).unwrap();
    }

    let backend = EmbeddedBackend::open(&config).unwrap();
    let timestamps: Vec<Timestamp> = read_all(&backend, 5, TimeOrder::Ascending)
        .iter()
        .map(|s| s.timestamp)
        .collect();
    assert_eq!(timestamps, vec![10, 20, 30]);

    backend.write(5, &Sample::new(40, 1.0)).unwrap();
    assert_eq!(read_all(&backend, 5, TimeOrder::Ascending).len(), 4);
}

/// A shard file cut short during creation does not break its bucket: reads
/// skip it and the next write recreates it.
#[test]
fn test_incomplete_shard_header_recovered_on_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(&temp_dir);
    {
        let backend = EmbeddedBackend::open(&config).unwrap();
        backend.write(1, &Sample::new(10, 1.0)).unwrap();
        let next = backend
            .layout()
            .segment_path(ShardKey::new(1, 1_000), SegmentKind::Base);
        std::fs::File::create(next).unwrap();
    }

    let backend = EmbeddedBackend::open(&config).unwrap();
    let timestamps = |backend: &EmbeddedBackend| -> Vec<Timestamp> {
        read_all(backend, 1, TimeOrder::Ascending)
            .iter()
            .map(|s| s.timestamp)
            .collect()
    };
    assert_eq!(timestamps(&backend), vec![10]);
    assert_eq!(backend.earliest_at_or_after(1, 11).unwrap(), None);

    backend.write(1, &Sample::new(1_005, 2.0)).unwrap();
    assert_eq!(timestamps(&backend), vec![10, 1_005]);
}

/// Pending overlays survive a restart and compaction keeps query results.
#[test]
fn test_overlay_survives_reopen_and_compaction() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(&temp_dir).with_overlay_compaction_threshold(0);
    let before = {
        let backend = EmbeddedBackend::open(&config).unwrap();
        for ts in [100, 300, 500, 200, 400, 300] {
            backend.write(2, &Sample::new(ts, ts as f64 / 100.0)).unwrap();
        }
        read_all(&backend, 2, TimeOrder::Ascending)
    };
    assert_eq!(before.len(), 5);

    let backend = EmbeddedBackend::open(&config).unwrap();
    assert_eq!(read_all(&backend, 2, TimeOrder::Ascending), before);

    let result = backend.compact().unwrap();
    assert_eq!(result.shards_compacted, 1);
    assert_eq!(result.duplicates_resolved, 1);
    assert_eq!(read_all(&backend, 2, TimeOrder::Ascending), before);
    assert!(!backend
        .layout()
        .segment_path(ShardKey::new(2, 0), SegmentKind::Overlay)
        .exists());
}
