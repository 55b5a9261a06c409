//! The point-value store facade.

use crate::backend::{Backend, BackendRegistry, SampleScan};
use crate::codec;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::lifecycle::compaction::CompactionResult;
use crate::lifecycle::retention::{current_timestamp_millis, FixedRetention, RetentionPolicy};
use crate::model::{BatchEntry, QueryMode, QueryWindow, Sample, SeriesId, TimeOrder, Timestamp};
use crate::query::{BookendScan, QueryEngine, RangeScan};
use crate::write::{self, QueueStats, WriteQueue};
use std::sync::Arc;
use tracing::{debug, info};

/// Time-series point-value store over a single backend.
///
/// The backend is chosen once, when the store is built; every write and
/// query goes through the same [`Backend`] contract.
pub struct PointValueStore {
    config: StoreConfig,
    backend: Arc<dyn Backend>,
    queries: QueryEngine,
    queue: WriteQueue,
    retention: Option<FixedRetention>,
}

impl PointValueStore {
    /// Builds a store around an already constructed backend.
    pub fn new(config: StoreConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        let queue = WriteQueue::start(
            Arc::clone(&backend),
            config.batch_size,
            config.write_queue_capacity,
        )?;
        let retention = if config.retention_enabled {
            config.retention_period.map(FixedRetention)
        } else {
            None
        };
        info!(
            "Opened point-value store on {} backend",
            backend.selector()
        );

        Ok(Self {
            queries: QueryEngine::new(Arc::clone(&backend)),
            config,
            backend,
            queue,
            retention,
        })
    }

    /// Resolves the configured backend from `registry` and builds the store.
    pub fn open(config: StoreConfig, registry: &BackendRegistry) -> Result<Self> {
        let backend = registry.resolve(&config)?;
        Self::new(config, backend)
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Durably stores one sample before returning.
    pub fn insert_sync(&self, series: SeriesId, sample: Sample) -> Result<()> {
        codec::validate(&sample)?;
        self.backend.write(series, &sample)
    }

    /// Queues one sample for the background writer.
    ///
    /// Blocks while the queue is full. Backend failures are reported by the
    /// next [`flush`](Self::flush).
    pub fn insert_async(&self, series: SeriesId, sample: Sample) -> Result<()> {
        codec::validate(&sample)?;
        self.queue.enqueue(BatchEntry::new(series, sample))
    }

    /// Waits until every queued sample was handed to the backend.
    pub fn flush(&self) -> Result<()> {
        self.queue.flush()
    }

    /// Returns write queue metrics.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Stores `entries` through the backend's bulk path, in batches of
    /// `batch_size` (the configured size when `None`).
    pub fn insert_batch(&self, entries: &[BatchEntry], batch_size: Option<usize>) -> Result<usize> {
        write::write_chunked(
            self.backend.as_ref(),
            entries,
            batch_size.unwrap_or(self.config.batch_size),
        )
    }

    /// Lazy range query; see [`QueryEngine::range_query`].
    pub fn range_query(
        &self,
        series: &[SeriesId],
        window: QueryWindow,
        order: TimeOrder,
        mode: QueryMode,
    ) -> Result<RangeScan> {
        self.queries.range_query(series, window, order, mode)
    }

    /// Per-point range query as one stream per series.
    pub fn range_query_per_series(
        &self,
        series: &[SeriesId],
        window: QueryWindow,
        order: TimeOrder,
    ) -> Result<Vec<(SeriesId, SampleScan)>> {
        self.queries.range_query_per_series(series, window, order)
    }

    /// Lazy bookend query; see [`BookendScan`].
    pub fn bookend_query(
        &self,
        series: &[SeriesId],
        window: QueryWindow,
        mode: QueryMode,
    ) -> Result<BookendScan> {
        self.queries.bookend_query(series, window, mode)
    }

    /// Deletes data older than the retention period as of `now`.
    ///
    /// Does nothing while retention is disabled.
    pub fn purge_expired(&self, now: Timestamp) -> Result<u64> {
        let Some(policy) = self.retention else {
            debug!("Retention disabled, skipping purge");
            return Ok(0);
        };
        let cutoff = policy.cutoff(now);
        let removed = self.backend.purge_before(cutoff)?;
        info!("Retention purge removed {} samples older than {}", removed, cutoff);
        Ok(removed)
    }

    /// Deletes data older than the retention period as of the current time.
    pub fn purge_expired_now(&self) -> Result<u64> {
        self.purge_expired(current_timestamp_millis())
    }

    /// Compacts backend storage.
    pub fn compact(&self) -> Result<CompactionResult> {
        self.backend.compact()
    }

    /// Flushes queued writes, stops the background writer and releases
    /// backend resources.
    ///
    /// A flush failure is reported after the backend was closed.
    pub fn close(self) -> Result<()> {
        let flushed = self.queue.flush();
        self.queue.shutdown();
        self.backend.close()?;
        info!("Closed point-value store on {} backend", self.backend.selector());
        flushed
    }
}
