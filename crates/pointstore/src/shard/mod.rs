//! Shard storage for the embedded backend.
//!
//! Each series is split into fixed-duration time buckets and every bucket is
//! stored as one shard on disk. Open shards are pooled by [`ShardManager`]
//! under a hard cap on open handles.

pub mod format;
pub(crate) mod io;
pub mod layout;
pub mod manager;
pub mod segment;

pub use format::{SegmentHeader, SegmentKind};
pub use layout::{ShardCatalog, ShardLayout};
pub use manager::{ShardHandle, ShardManager, ShardStats};
pub use segment::{AppendSummary, ShardSegment};
