//! On-disk layout of shard files.
//!
//! ```text
//! <data_dir>/
//!   <series id, 16 hex digits>/
//!     <bucket_start>.pvs        base segment
//!     <bucket_start>.pvo        overlay segment (only while backdates are pending)
//!     <bucket_start>.pvs.tmp    compaction output before rename
//! ```

use crate::error::Result;
use crate::model::{SeriesId, ShardKey, TimeBucket, Timestamp};
use crate::shard::format::SegmentKind;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Base segment file extension.
const BASE_EXTENSION: &str = "pvs";

/// Overlay segment file extension.
const OVERLAY_EXTENSION: &str = "pvo";

/// Suffix of in-progress compaction output.
const TMP_SUFFIX: &str = ".tmp";

/// Known shards per series, as recovered from disk.
pub type ShardCatalog = BTreeMap<SeriesId, BTreeSet<Timestamp>>;

/// Provides filesystem paths for shards and buckets.
#[derive(Debug, Clone)]
pub struct ShardLayout {
    /// Root data directory.
    data_dir: PathBuf,
    /// Bucket duration in milliseconds.
    bucket_duration_ms: i64,
}

impl ShardLayout {
    /// Creates a layout rooted at `data_dir` with buckets of
    /// `bucket_duration_ms`.
    pub fn new(data_dir: impl AsRef<Path>, bucket_duration_ms: i64) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            bucket_duration_ms: bucket_duration_ms.max(1),
        }
    }

    /// Returns the root data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the bucket duration in milliseconds.
    pub fn bucket_duration_ms(&self) -> i64 {
        self.bucket_duration_ms
    }

    /// Bucket containing `ts`.
    pub fn bucket_for(&self, ts: Timestamp) -> TimeBucket {
        TimeBucket::containing(ts, self.bucket_duration_ms)
    }

    /// Bucket identified by a shard key.
    pub fn bucket_of(&self, key: ShardKey) -> TimeBucket {
        TimeBucket::starting_at(key.bucket_start, self.bucket_duration_ms)
    }

    /// Shard that stores `ts` of `series`.
    pub fn shard_key(&self, series: SeriesId, ts: Timestamp) -> ShardKey {
        ShardKey::new(series, self.bucket_for(ts).start)
    }

    /// Directory holding all shards of a series.
    pub fn series_dir(&self, series: SeriesId) -> PathBuf {
        self.data_dir.join(format!("{:016x}", series))
    }

    /// Path of a segment file.
    pub fn segment_path(&self, key: ShardKey, kind: SegmentKind) -> PathBuf {
        self.series_dir(key.series)
            .join(Self::segment_file_name(key.bucket_start, kind))
    }

    /// Path compaction writes to before replacing the base segment.
    pub fn compaction_tmp_path(&self, key: ShardKey) -> PathBuf {
        let mut name = Self::segment_file_name(key.bucket_start, SegmentKind::Base);
        name.push_str(TMP_SUFFIX);
        self.series_dir(key.series).join(name)
    }

    /// Builds a segment file name using `{bucket_start}.{pvs|pvo}`.
    pub fn segment_file_name(bucket_start: Timestamp, kind: SegmentKind) -> String {
        let extension = match kind {
            SegmentKind::Base => BASE_EXTENSION,
            SegmentKind::Overlay => OVERLAY_EXTENSION,
        };
        format!("{}.{}", bucket_start, extension)
    }

    /// Parses a segment file name into bucket start and kind.
    pub fn parse_segment_file_name(name: &str) -> Option<(Timestamp, SegmentKind)> {
        let (stem, extension) = name.rsplit_once('.')?;
        let kind = match extension {
            BASE_EXTENSION => SegmentKind::Base,
            OVERLAY_EXTENSION => SegmentKind::Overlay,
            _ => return None,
        };
        let bucket_start = stem.parse::<i64>().ok()?;
        Some((bucket_start, kind))
    }

    /// Parses a series directory name.
    pub fn parse_series_dir_name(name: &str) -> Option<SeriesId> {
        if name.len() != 16 {
            return None;
        }
        u64::from_str_radix(name, 16).ok()
    }

    /// Scans the data directory for existing shards.
    ///
    /// Leftover compaction output is deleted: the base segment it was meant
    /// to replace is still intact, and the overlay is only removed after a
    /// successful rename.
    pub fn discover(&self) -> Result<ShardCatalog> {
        let mut catalog = ShardCatalog::new();
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(catalog),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(series) = name.to_str().and_then(Self::parse_series_dir_name) else {
                continue;
            };

            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let file_name = file.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };
                if file_name.ends_with(TMP_SUFFIX) {
                    warn!("Removing stale compaction output {:?}", file.path());
                    fs::remove_file(file.path())?;
                    continue;
                }
                if let Some((bucket_start, _)) = Self::parse_segment_file_name(file_name) {
                    catalog.entry(series).or_default().insert(bucket_start);
                }
            }
        }

        Ok(catalog)
    }

    /// Deletes both segment files of a shard. Missing files are ignored.
    pub fn remove_shard_files(&self, key: ShardKey) -> Result<()> {
        for kind in [SegmentKind::Overlay, SegmentKind::Base] {
            match fs::remove_file(self.segment_path(key, kind)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        let dir = self.series_dir(key.series);
        if dir.exists() {
            fsync_dir(&dir)?;
        }
        Ok(())
    }
}

/// Fsyncs a directory so renames and creations within it persist.
pub(crate) fn fsync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir_file = fs::File::open(dir)?;
        dir_file.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
