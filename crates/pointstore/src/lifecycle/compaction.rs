//! Overlay compaction.
//!
//! Backdated samples accumulate in a shard's overlay segment until the
//! overlay holds enough records to be folded back into the base segment.
//! Reads merge the two on the fly with the same rule compaction applies, so
//! compacting a shard never changes what a query returns.

use crate::model::{Sample, Timestamp};
use std::collections::BTreeMap;

/// Result of merging a base segment with its overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedSamples {
    /// Time-ordered samples, one per timestamp.
    pub samples: Vec<Sample>,
    /// Samples that were replaced by a later write of the same timestamp.
    pub duplicates: usize,
}

/// Merges time-ordered base samples with arrival-ordered overlay samples.
///
/// Last write wins: overlay records replace base records of the same
/// timestamp, and later overlay records replace earlier ones.
pub fn merge_overlay(base: Vec<Sample>, overlay: Vec<Sample>) -> MergedSamples {
    if overlay.is_empty() {
        return MergedSamples {
            samples: base,
            duplicates: 0,
        };
    }

    let mut merged: BTreeMap<Timestamp, Sample> = BTreeMap::new();
    let mut duplicates = 0;
    for sample in base.into_iter().chain(overlay) {
        if merged.insert(sample.timestamp, sample).is_some() {
            duplicates += 1;
        }
    }

    MergedSamples {
        samples: merged.into_values().collect(),
        duplicates,
    }
}

/// Decides when a shard's overlay should be compacted.
#[derive(Debug, Clone, Copy)]
pub struct OverlayCompactionPolicy {
    threshold: usize,
}

impl OverlayCompactionPolicy {
    /// Compacts once an overlay holds `threshold` records. A threshold of
    /// zero disables automatic compaction.
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Returns true if an overlay of `pending` records should be compacted.
    pub fn should_compact(&self, pending: usize) -> bool {
        self.threshold > 0 && pending >= self.threshold
    }
}

/// Summary of a compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Shards whose overlay was folded into the base segment.
    pub shards_compacted: u64,
    /// Samples written to rewritten base segments.
    pub samples_merged: u64,
    /// Samples replaced by later writes of the same timestamp.
    pub duplicates_resolved: u64,
    /// Total bytes written.
    pub bytes_written: u64,
}

impl CompactionResult {
    /// Adds another result into this one.
    pub fn absorb(&mut self, other: CompactionResult) {
        self.shards_compacted += other.shards_compacted;
        self.samples_merged += other.samples_merged;
        self.duplicates_resolved += other.duplicates_resolved;
        self.bytes_written += other.bytes_written;
    }
}
