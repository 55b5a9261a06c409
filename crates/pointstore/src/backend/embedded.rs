//! Embedded shard engine backend.
//!
//! Samples are routed to one shard per series and time bucket. The set of
//! existing shards per series is kept in an in-memory catalog, recovered
//! from the directory layout at startup, so scans and bookend lookups visit
//! only buckets that hold data.

use crate::backend::{Backend, SampleScan};
use crate::codec;
use crate::config::{BackendSelector, StoreConfig};
use crate::error::{Result, StoreError};
use crate::lifecycle::compaction::{CompactionResult, OverlayCompactionPolicy};
use crate::model::{BatchEntry, QueryWindow, Sample, SeriesId, ShardKey, TimeOrder, Timestamp};
use crate::shard::{ShardCatalog, ShardLayout, ShardManager, ShardStats};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, info};

struct EmbeddedInner {
    shards: ShardManager,
    catalog: RwLock<ShardCatalog>,
    compaction: OverlayCompactionPolicy,
}

impl EmbeddedInner {
    fn layout(&self) -> &ShardLayout {
        self.shards.layout()
    }

    fn note_bucket(&self, key: ShardKey) {
        let known = self
            .catalog
            .read()
            .get(&key.series)
            .is_some_and(|buckets| buckets.contains(&key.bucket_start));
        if !known {
            self.catalog
                .write()
                .entry(key.series)
                .or_default()
                .insert(key.bucket_start);
        }
    }

    /// Bucket starts of `series` in ascending order that may hold samples
    /// of `window`.
    fn buckets_for(&self, series: SeriesId, window: QueryWindow) -> Vec<Timestamp> {
        if window.is_empty() {
            return Vec::new();
        }
        let first = self.layout().bucket_for(window.start).start;
        let last = self.layout().bucket_for(window.end - 1).start;
        self.catalog
            .read()
            .get(&series)
            .map(|buckets| buckets.range(first..=last).copied().collect())
            .unwrap_or_default()
    }

    fn write_group(&self, key: ShardKey, samples: &[Sample]) -> Result<()> {
        let handle = self.shards.open(key)?;
        self.note_bucket(key);
        let summary = handle.append(samples)?;
        if self.compaction.should_compact(summary.overlay_pending) {
            // The samples are already durable; a failed compaction only
            // leaves the overlay in place for the next attempt.
            if let Err(err) = handle.compact() {
                error!("Overlay compaction failed for shard {}: {}", key, err);
            }
        }
        Ok(())
    }

    fn read_shard(&self, key: ShardKey, window: QueryWindow) -> Result<Vec<Sample>> {
        match self.shards.open_existing(key)? {
            Some(handle) => handle.read_window(window),
            None => Ok(Vec::new()),
        }
    }
}

/// Backend storing samples in pooled shard files under the data directory.
#[derive(Clone)]
pub struct EmbeddedBackend {
    inner: Arc<EmbeddedInner>,
}

impl EmbeddedBackend {
    /// Opens the shard engine rooted at `config.data_dir`, recovering the
    /// shard catalog from disk.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let layout = ShardLayout::new(&config.data_dir, config.shard_duration_ms());
        let catalog = layout.discover()?;
        info!(
            "Opened embedded backend at {:?}: {} series, {} shards",
            config.data_dir,
            catalog.len(),
            catalog.values().map(|buckets| buckets.len()).sum::<usize>()
        );

        Ok(Self {
            inner: Arc::new(EmbeddedInner {
                shards: ShardManager::new(layout, config),
                catalog: RwLock::new(catalog),
                compaction: OverlayCompactionPolicy::new(config.overlay_compaction_threshold),
            }),
        })
    }

    /// Returns a snapshot of shard pool activity.
    pub fn shard_stats(&self) -> ShardStats {
        self.inner.shards.stats()
    }

    /// Returns the shard layout.
    pub fn layout(&self) -> &ShardLayout {
        self.inner.layout()
    }

    /// Number of shards known for `series`.
    pub fn shard_count(&self, series: SeriesId) -> usize {
        self.inner
            .catalog
            .read()
            .get(&series)
            .map_or(0, |buckets| buckets.len())
    }

    fn drop_shard(&self, key: ShardKey) -> Result<u64> {
        let samples = self.inner.read_shard(key, self.layout().bucket_of(key).window())?;
        self.inner.shards.remove(key)?;
        self.layout().remove_shard_files(key)?;

        let mut catalog = self.inner.catalog.write();
        if let Some(buckets) = catalog.get_mut(&key.series) {
            buckets.remove(&key.bucket_start);
            if buckets.is_empty() {
                catalog.remove(&key.series);
            }
        }
        Ok(samples.len() as u64)
    }

    fn catalog_snapshot(&self) -> Vec<ShardKey> {
        self.inner
            .catalog
            .read()
            .iter()
            .flat_map(|(series, buckets)| {
                buckets
                    .iter()
                    .map(|start| ShardKey::new(*series, *start))
            })
            .collect()
    }
}

impl Backend for EmbeddedBackend {
    fn selector(&self) -> BackendSelector {
        BackendSelector::Embedded
    }

    fn write(&self, series: SeriesId, sample: &Sample) -> Result<()> {
        codec::validate(sample)?;
        let key = self.layout().shard_key(series, sample.timestamp);
        self.inner
            .write_group(key, std::slice::from_ref(sample))
            .map_err(StoreError::into_cause)
    }

    /// Groups the batch by shard so each shard is opened and synced once.
    fn write_batch(&self, entries: &[BatchEntry]) -> Result<()> {
        let mut groups: Vec<(ShardKey, Vec<Sample>)> = Vec::new();
        let mut by_key: HashMap<ShardKey, usize> = HashMap::new();
        for entry in entries {
            codec::validate(&entry.sample)?;
            let key = self.layout().shard_key(entry.series, entry.sample.timestamp);
            let idx = *by_key.entry(key).or_insert_with(|| {
                groups.push((key, Vec::new()));
                groups.len() - 1
            });
            groups[idx].1.push(entry.sample.clone());
        }

        let mut persisted = 0;
        for (key, samples) in &groups {
            self.inner
                .write_group(*key, samples)
                .map_err(|err| err.after_persisted(persisted))?;
            persisted += samples.len();
        }
        debug!(
            "Wrote batch of {} samples across {} shards",
            entries.len(),
            groups.len()
        );
        Ok(())
    }

    fn scan(&self, series: SeriesId, window: QueryWindow, order: TimeOrder) -> Result<SampleScan> {
        let buckets = self.inner.buckets_for(series, window);
        Ok(Box::new(ShardScan {
            inner: Arc::clone(&self.inner),
            series,
            window,
            order,
            buckets: buckets.into(),
            buffer: Vec::new().into_iter(),
            done: false,
        }))
    }

    fn latest_before(&self, series: SeriesId, ts: Timestamp) -> Result<Option<Sample>> {
        let buckets: Vec<Timestamp> = match self.inner.catalog.read().get(&series) {
            Some(buckets) => buckets.range(..ts).rev().copied().collect(),
            None => return Ok(None),
        };
        for bucket_start in buckets {
            let key = ShardKey::new(series, bucket_start);
            if let Some(handle) = self.inner.shards.open_existing(key)? {
                if let Some(sample) = handle.latest_before(ts)? {
                    return Ok(Some(sample));
                }
            }
        }
        Ok(None)
    }

    fn earliest_at_or_after(&self, series: SeriesId, ts: Timestamp) -> Result<Option<Sample>> {
        let first = self.layout().bucket_for(ts).start;
        let buckets: Vec<Timestamp> = match self.inner.catalog.read().get(&series) {
            Some(buckets) => buckets.range(first..).copied().collect(),
            None => return Ok(None),
        };
        for bucket_start in buckets {
            let key = ShardKey::new(series, bucket_start);
            if let Some(handle) = self.inner.shards.open_existing(key)? {
                if let Some(sample) = handle.earliest_at_or_after(ts)? {
                    return Ok(Some(sample));
                }
            }
        }
        Ok(None)
    }

    /// Drops whole shards whose bucket ends at or before `cutoff`.
    ///
    /// A shard that fails to drop is logged and kept for the next purge.
    fn purge_before(&self, cutoff: Timestamp) -> Result<u64> {
        let expired: Vec<ShardKey> = self
            .catalog_snapshot()
            .into_iter()
            .filter(|key| self.layout().bucket_of(*key).expired_by(cutoff))
            .collect();

        let mut removed = 0;
        for key in expired {
            match self.drop_shard(key) {
                Ok(count) => {
                    removed += count;
                    debug!("Purged shard {} ({} samples)", key, count);
                }
                Err(err) => error!("Retention drop failed for shard {}: {}", key, err),
            }
        }
        Ok(removed)
    }

    /// Folds every pending overlay into its base segment.
    fn compact(&self) -> Result<CompactionResult> {
        let mut result = CompactionResult::default();
        for key in self.catalog_snapshot() {
            if let Some(handle) = self.inner.shards.open_existing(key)? {
                if handle.overlay_pending() == 0 {
                    continue;
                }
                if let Some(compacted) = handle.compact()? {
                    result.absorb(compacted);
                }
            }
        }
        Ok(result)
    }

    fn close(&self) -> Result<()> {
        let closed = self.inner.shards.close_idle();
        debug!("Closed {} idle shards", closed);
        Ok(())
    }
}

/// Lazy scan over a series' shards, loading one shard window at a time.
///
/// No shard handle is held between calls to `next`, so an abandoned scan
/// pins nothing.
struct ShardScan {
    inner: Arc<EmbeddedInner>,
    series: SeriesId,
    window: QueryWindow,
    order: TimeOrder,
    buckets: VecDeque<Timestamp>,
    buffer: std::vec::IntoIter<Sample>,
    done: bool,
}

impl Iterator for ShardScan {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(sample) = self.buffer.next() {
                return Some(Ok(sample));
            }
            if self.done {
                return None;
            }
            let bucket_start = match self.order {
                TimeOrder::Ascending => self.buckets.pop_front(),
                TimeOrder::Descending => self.buckets.pop_back(),
            };
            let Some(bucket_start) = bucket_start else {
                self.done = true;
                return None;
            };

            let key = ShardKey::new(self.series, bucket_start);
            match self.inner.read_shard(key, self.window) {
                Ok(mut samples) => {
                    if self.order == TimeOrder::Descending {
                        samples.reverse();
                    }
                    self.buffer = samples.into_iter();
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
