//! Lifecycle management modules for overlay compaction and retention.

pub mod compaction;
pub mod retention;

pub use compaction::{merge_overlay, CompactionResult, MergedSamples, OverlayCompactionPolicy};
pub use retention::{FixedRetention, RetentionPolicy};
