//! Store configuration.
//!
//! A [`StoreConfig`] is assembled once, either through the `with_*` builder
//! methods or from string properties, and handed to the store at
//! construction.

use crate::error::{Result, StoreError};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default cap on simultaneously open shard handles.
pub const DEFAULT_MAX_OPEN_FILES: usize = 256;

/// Default number of samples per backend batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default expected spacing between samples.
pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_millis(5000);

/// Number of samples a shard is sized to hold when no explicit shard
/// duration is configured.
pub const SAMPLES_PER_SHARD: u32 = 16_384;

/// Default capacity of the write-behind queue.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 100_000;

/// Default number of overlay records that triggers shard compaction.
pub const DEFAULT_OVERLAY_COMPACTION_THRESHOLD: usize = 1024;

/// Sync mode for shard durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each append (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

impl FromStr for SyncMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fsync" => Ok(Self::Fsync),
            "fdatasync" => Ok(Self::Fdatasync),
            "none" => Ok(Self::None),
            other => Err(StoreError::InvalidConfig(format!(
                "unknown sync mode '{other}'"
            ))),
        }
    }
}

/// How shard bytes are read from disk.
///
/// All strategies return identical bytes; they differ only in cost profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStrategy {
    /// Memory-mapped view of the shard file.
    #[default]
    Mapped,
    /// Positional reads (`pread`) on the pooled descriptor.
    Positional,
    /// Seek then read on the pooled descriptor.
    Sequential,
    /// A fresh buffered stream per read, skipped forward to the offset.
    Stream,
}

impl FromStr for IoStrategy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MAPPED" | "MAPPED_BYTE_BUFFER" => Ok(Self::Mapped),
            "POSITIONAL" | "FILE_CHANNEL" => Ok(Self::Positional),
            "SEQUENTIAL" | "RANDOM_ACCESS_FILE" => Ok(Self::Sequential),
            "STREAM" | "INPUT_STREAM" => Ok(Self::Stream),
            _ => Err(StoreError::InvalidConfig(format!(
                "unknown io strategy '{s}'"
            ))),
        }
    }
}

impl IoStrategy {
    /// All strategies, in declaration order.
    pub const ALL: [IoStrategy; 4] = [
        IoStrategy::Mapped,
        IoStrategy::Positional,
        IoStrategy::Sequential,
        IoStrategy::Stream,
    ];
}

/// Identifies the backend a store runs on.
///
/// Parsed from `embedded`, `memory`, `relational:<dialect>` and
/// `external:<product>`. The legacy identifiers `ias-tsdb`, `sql:<dialect>`
/// and `tsl:<product>` are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum BackendSelector {
    /// Built-in shard engine.
    #[default]
    Embedded,
    /// In-process series layer.
    Memory,
    /// Relational table engine of the given dialect.
    Relational {
        /// SQL dialect, e.g. `sqlite`.
        dialect: String,
    },
    /// Externally supplied adapter.
    External {
        /// Product name the adapter was registered under.
        product: String,
    },
}

impl BackendSelector {
    /// Convenience constructor for a relational selector.
    pub fn relational(dialect: impl Into<String>) -> Self {
        Self::Relational {
            dialect: dialect.into(),
        }
    }

    /// Convenience constructor for an external selector.
    pub fn external(product: impl Into<String>) -> Self {
        Self::External {
            product: product.into(),
        }
    }
}

impl fmt::Display for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embedded => f.write_str("embedded"),
            Self::Memory => f.write_str("memory"),
            Self::Relational { dialect } => write!(f, "relational:{dialect}"),
            Self::External { product } => write!(f, "external:{product}"),
        }
    }
}

impl FromStr for BackendSelector {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let selector = match s.split_once(':') {
            None if s == "embedded" || s == "ias-tsdb" => Self::Embedded,
            None if s == "memory" => Self::Memory,
            Some(("tsl", "memory")) => Self::Memory,
            Some(("relational" | "sql", dialect)) if !dialect.is_empty() => {
                Self::relational(dialect)
            }
            Some(("external" | "tsl", product)) if !product.is_empty() => {
                Self::external(product)
            }
            _ => return Err(StoreError::UnsupportedBackend(s)),
        };
        Ok(selector)
    }
}

/// Configuration for a point-value store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for on-disk backends.
    pub data_dir: PathBuf,
    /// Backend to resolve at startup.
    pub backend: BackendSelector,
    /// Cap on simultaneously open shard handles.
    pub max_open_files: usize,
    /// Read strategy for shard files.
    pub io_strategy: IoStrategy,
    /// Number of samples per backend batch.
    pub batch_size: usize,
    /// Expected spacing between samples of one series.
    pub sample_period: Duration,
    /// Time span covered by one shard. Derived from `sample_period` if unset.
    pub shard_duration: Option<Duration>,
    /// Whether the retention purge may delete data.
    pub retention_enabled: bool,
    /// Age beyond which samples are purged.
    pub retention_period: Option<Duration>,
    /// Durability of each append.
    pub sync_mode: SyncMode,
    /// Maximum wait for a shard handle; `None` blocks indefinitely.
    pub open_timeout: Option<Duration>,
    /// Capacity of the write-behind queue.
    pub write_queue_capacity: usize,
    /// Overlay record count that triggers shard compaction.
    pub overlay_compaction_threshold: usize,
    /// Maximum values kept per series by the memory backend.
    pub memory_series_value_limit: Option<usize>,
    /// Database file of the relational backend. Defaults to a file under
    /// `data_dir`.
    pub relational_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            backend: BackendSelector::default(),
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            io_strategy: IoStrategy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            sample_period: DEFAULT_SAMPLE_PERIOD,
            shard_duration: None,
            retention_enabled: false,
            retention_period: None,
            sync_mode: SyncMode::default(),
            open_timeout: None,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            overlay_compaction_threshold: DEFAULT_OVERLAY_COMPACTION_THRESHOLD,
            memory_series_value_limit: None,
            relational_path: None,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration rooted at `data_dir` with defaults elsewhere.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the backend.
    pub fn with_backend(mut self, backend: BackendSelector) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the shard handle cap.
    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    /// Sets the shard read strategy.
    pub fn with_io_strategy(mut self, io_strategy: IoStrategy) -> Self {
        self.io_strategy = io_strategy;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the expected sample period.
    pub fn with_sample_period(mut self, sample_period: Duration) -> Self {
        self.sample_period = sample_period;
        self
    }

    /// Sets an explicit shard duration.
    pub fn with_shard_duration(mut self, shard_duration: Duration) -> Self {
        self.shard_duration = Some(shard_duration);
        self
    }

    /// Enables retention with the given period.
    pub fn with_retention(mut self, period: Duration) -> Self {
        self.retention_enabled = true;
        self.retention_period = Some(period);
        self
    }

    /// Disables the retention purge.
    pub fn without_retention(mut self) -> Self {
        self.retention_enabled = false;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the shard handle wait timeout.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    /// Sets the write-behind queue capacity.
    pub fn with_write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    /// Sets the overlay compaction threshold.
    pub fn with_overlay_compaction_threshold(mut self, threshold: usize) -> Self {
        self.overlay_compaction_threshold = threshold;
        self
    }

    /// Caps values kept per series by the memory backend.
    pub fn with_memory_series_value_limit(mut self, limit: usize) -> Self {
        self.memory_series_value_limit = Some(limit);
        self
    }

    /// Sets the relational database file.
    pub fn with_relational_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.relational_path = Some(path.into());
        self
    }

    /// Shard duration in milliseconds, derived from the sample period when
    /// not set explicitly.
    pub fn shard_duration_ms(&self) -> i64 {
        let duration = self
            .shard_duration
            .unwrap_or_else(|| self.sample_period.saturating_mul(SAMPLES_PER_SHARD));
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX).max(1)
    }

    /// Database file used by the relational backend.
    pub fn relational_path(&self) -> PathBuf {
        self.relational_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("points.sqlite3"))
    }

    /// Checks the configuration for values the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_open_files == 0 {
            return Err(StoreError::InvalidConfig(
                "max_open_files must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(StoreError::InvalidConfig(
                "batch_size must be at least 1".into(),
            ));
        }
        if self.write_queue_capacity == 0 {
            return Err(StoreError::InvalidConfig(
                "write_queue_capacity must be at least 1".into(),
            ));
        }
        if self.sample_period.is_zero() {
            return Err(StoreError::InvalidConfig(
                "sample_period must be positive".into(),
            ));
        }
        if self.shard_duration.is_some_and(|d| d.as_millis() == 0) {
            return Err(StoreError::InvalidConfig(
                "shard_duration must be at least 1ms".into(),
            ));
        }
        if self.retention_enabled && self.retention_period.is_none() {
            return Err(StoreError::InvalidConfig(
                "retention is enabled without a retention_period".into(),
            ));
        }
        Ok(())
    }

    /// Builds a configuration from string properties.
    ///
    /// Unknown keys are logged and ignored; malformed values are rejected.
    ///
    /// # Examples
    /// ```rust,ignore
    /// use alopex_pointstore::StoreConfig;
    ///
    /// let config = StoreConfig::from_properties([
    ///     ("backend", "embedded"),
    ///     ("max_open_files", "64"),
    ///     ("io_strategy", "MAPPED_BYTE_BUFFER"),
    /// ])?;
    /// ```
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in properties {
            let key = key.as_ref().trim();
            let value = value.as_ref().trim();
            match key {
                "data_dir" => config.data_dir = PathBuf::from(value),
                "backend" => config.backend = value.parse()?,
                "max_open_files" => config.max_open_files = parse_number(key, value)?,
                "io_strategy" => config.io_strategy = value.parse()?,
                "batch_size" => config.batch_size = parse_number(key, value)?,
                "sample_period_ms" => {
                    config.sample_period = Duration::from_millis(parse_number(key, value)?)
                }
                "shard_duration_ms" => {
                    config.shard_duration = Some(Duration::from_millis(parse_number(key, value)?))
                }
                "retention_enabled" => config.retention_enabled = parse_bool(key, value)?,
                "retention_period_ms" => {
                    config.retention_period = Some(Duration::from_millis(parse_number(key, value)?))
                }
                "sync_mode" => config.sync_mode = value.parse()?,
                "open_timeout_ms" => {
                    config.open_timeout = Some(Duration::from_millis(parse_number(key, value)?))
                }
                "write_queue_capacity" => {
                    config.write_queue_capacity = parse_number(key, value)?
                }
                "overlay_compaction_threshold" => {
                    config.overlay_compaction_threshold = parse_number(key, value)?
                }
                "memory.series_value_limit" => {
                    let limit: i64 = parse_number(key, value)?;
                    config.memory_series_value_limit = usize::try_from(limit).ok();
                }
                "relational_path" => config.relational_path = Some(PathBuf::from(value)),
                _ => warn!("Ignoring unknown store property '{}'", key),
            }
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| StoreError::InvalidConfig(format!("{key}: '{value}' is not a valid number")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(StoreError::InvalidConfig(format!(
            "{key}: '{value}' is not a boolean"
        ))),
    }
}
