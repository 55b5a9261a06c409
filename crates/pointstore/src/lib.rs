//! Pointstore - Alopex time-series point-value store
//!
//! This crate stores timestamped numeric samples per series behind a single
//! backend contract, so ingestion and queries behave the same on every
//! storage engine.
//!
//! # Components
//!
//! - [`codec`]: fixed-layout sample records with a CRC32 trailer
//! - [`shard`]: embedded shard files and the LRU-bounded handle pool
//! - [`write`]: chunked batch writes and the write-behind queue
//! - [`query`]: lazy range and bookend queries with a k-way merge
//! - [`backend`]: the [`Backend`] trait, builtin adapters and the registry
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_pointstore::{
//!     BackendRegistry, PointValueStore, QueryMode, QueryWindow, Sample, StoreConfig, TimeOrder,
//! };
//!
//! let config = StoreConfig::new("/var/lib/points");
//! let store = PointValueStore::open(config, &BackendRegistry::default())?;
//! store.insert_sync(7, Sample::new(1_700_000_000_000, 21.5))?;
//! store.insert_async(7, Sample::new(1_700_000_005_000, 21.7))?;
//! store.flush()?;
//!
//! let window = QueryWindow::new(1_700_000_000_000, 1_700_000_010_000);
//! for sample in store.range_query(&[7], window, TimeOrder::Ascending, QueryMode::Combined)? {
//!     println!("{:?}", sample?);
//! }
//! ```

#![deny(missing_docs)]

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod query;
pub mod shard;
pub mod store;
pub mod write;

pub use backend::{Backend, BackendRegistry, EmbeddedBackend, MemoryBackend, SampleScan};
#[cfg(feature = "sqlite")]
pub use backend::SqliteBackend;
pub use config::{BackendSelector, IoStrategy, StoreConfig, SyncMode};
pub use error::{CodecError, Result, StoreError};
pub use lifecycle::{CompactionResult, FixedRetention, RetentionPolicy};
pub use model::{
    BatchEntry, QueryMode, QueryWindow, Sample, SeriesId, ShardKey, TaggedSample, TimeBucket,
    TimeOrder, Timestamp,
};
pub use query::{BookendPosition, BookendScan, BookendValue, QueryEngine, RangeScan};
pub use store::PointValueStore;
