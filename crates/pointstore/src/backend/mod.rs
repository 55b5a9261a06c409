//! Backend adapter interface.
//!
//! Every storage engine the store can run on implements [`Backend`]. The
//! store itself only ever talks to this trait, so the write path and query
//! engine behave identically on every backend.

pub mod embedded;
pub mod memory;
pub mod registry;
#[cfg(feature = "sqlite")]
pub mod relational;

use crate::config::BackendSelector;
use crate::error::Result;
use crate::lifecycle::compaction::CompactionResult;
use crate::model::{BatchEntry, QueryWindow, Sample, SeriesId, TimeOrder, Timestamp};

pub use embedded::EmbeddedBackend;
pub use memory::MemoryBackend;
pub use registry::{BackendFactory, BackendRegistry};
#[cfg(feature = "sqlite")]
pub use relational::SqliteBackend;

/// Lazy, time-ordered stream of one series' samples.
///
/// The stream stops after yielding an error.
pub type SampleScan = Box<dyn Iterator<Item = Result<Sample>> + Send>;

/// Uniform contract every storage backend fulfils.
pub trait Backend: Send + Sync {
    /// Identifier the backend was resolved under.
    fn selector(&self) -> BackendSelector;

    /// Durably stores one sample, replacing any sample of the same timestamp.
    fn write(&self, series: SeriesId, sample: &Sample) -> Result<()>;

    /// Durably stores a batch using the backend's bulk path.
    ///
    /// Per-series arrival order is preserved. When the batch stops part way,
    /// the error is `PartialBatch` carrying the number of persisted entries.
    fn write_batch(&self, entries: &[BatchEntry]) -> Result<()> {
        for (persisted, entry) in entries.iter().enumerate() {
            self.write(entry.series, &entry.sample)
                .map_err(|err| err.after_persisted(persisted))?;
        }
        Ok(())
    }

    /// Lazily streams the samples of `series` within `window` in `order`.
    fn scan(&self, series: SeriesId, window: QueryWindow, order: TimeOrder) -> Result<SampleScan>;

    /// Latest sample of `series` strictly before `ts`.
    fn latest_before(&self, series: SeriesId, ts: Timestamp) -> Result<Option<Sample>>;

    /// Earliest sample of `series` at or after `ts`.
    fn earliest_at_or_after(&self, series: SeriesId, ts: Timestamp) -> Result<Option<Sample>>;

    /// Deletes data older than `cutoff`, returning the number of samples
    /// removed. Backends may keep samples that share storage with newer data.
    fn purge_before(&self, _cutoff: Timestamp) -> Result<u64> {
        Ok(0)
    }

    /// Reorganizes storage for read efficiency.
    fn compact(&self) -> Result<CompactionResult> {
        Ok(CompactionResult::default())
    }

    /// Releases cached resources ahead of shutdown.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Helpers shared by paging scans.
pub(crate) mod paging {
    use crate::model::{QueryWindow, TimeOrder, Timestamp};

    /// Remaining part of `window` after the last yielded timestamp.
    pub fn remaining(
        window: QueryWindow,
        order: TimeOrder,
        cursor: Option<Timestamp>,
    ) -> QueryWindow {
        match (order, cursor) {
            (_, None) => window,
            (TimeOrder::Ascending, Some(last)) => {
                QueryWindow::new(last.saturating_add(1).max(window.start), window.end)
            }
            (TimeOrder::Descending, Some(last)) => {
                QueryWindow::new(window.start, last.min(window.end))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use parking_lot::Mutex;

    /// Backend that relies on the default batch path and fails on demand.
    struct FlakyBackend {
        written: Mutex<Vec<BatchEntry>>,
        fail_at: usize,
    }

    impl Backend for FlakyBackend {
        fn selector(&self) -> BackendSelector {
            BackendSelector::external("flaky")
        }

        fn write(&self, series: SeriesId, sample: &Sample) -> Result<()> {
            let mut written = self.written.lock();
            if written.len() == self.fail_at {
                return Err(StoreError::Backend {
                    backend: "flaky".into(),
                    message: "injected".into(),
                });
            }
            written.push(BatchEntry::new(series, sample.clone()));
            Ok(())
        }

        fn scan(&self, _: SeriesId, _: QueryWindow, _: TimeOrder) -> Result<SampleScan> {
            Ok(Box::new(std::iter::empty()))
        }

        fn latest_before(&self, _: SeriesId, _: Timestamp) -> Result<Option<Sample>> {
            Ok(None)
        }

        fn earliest_at_or_after(&self, _: SeriesId, _: Timestamp) -> Result<Option<Sample>> {
            Ok(None)
        }
    }

    #[test]
    fn test_default_write_batch_reports_persisted() {
        let backend = FlakyBackend {
            written: Mutex::new(Vec::new()),
            fail_at: 3,
        };
        let entries: Vec<_> = (0..5)
            .map(|i| BatchEntry::new(1, Sample::new(i, i as f64)))
            .collect();

        let err = backend.write_batch(&entries).unwrap_err();
        assert!(matches!(err, StoreError::PartialBatch { persisted: 3, .. }));
        assert!(err.is_storage_io());
        assert_eq!(backend.written.lock().len(), 3);
    }

    #[test]
    fn test_paging_remaining_window() {
        let window = QueryWindow::new(0, 100);
        assert_eq!(paging::remaining(window, TimeOrder::Ascending, None), window);
        assert_eq!(
            paging::remaining(window, TimeOrder::Ascending, Some(41)),
            QueryWindow::new(42, 100)
        );
        assert_eq!(
            paging::remaining(window, TimeOrder::Descending, Some(41)),
            QueryWindow::new(0, 41)
        );
        assert!(paging::remaining(window, TimeOrder::Ascending, Some(99)).is_empty());
    }
}
