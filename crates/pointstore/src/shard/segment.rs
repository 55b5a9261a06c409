//! An open shard: its base segment, pending overlay and sparse time index.
//!
//! All access goes through the shard's `RwLock`: appends and compaction take
//! it exclusively, window reads share it. A reader therefore observes the
//! shard entirely before or entirely after any write.

use crate::codec::{self, RecordIter};
use crate::config::{IoStrategy, SyncMode};
use crate::error::{CodecError, Result, StoreError};
use crate::lifecycle::compaction::{merge_overlay, CompactionResult};
use crate::model::{QueryWindow, Sample, ShardKey, TimeBucket, Timestamp};
use crate::shard::format::{SegmentHeader, SegmentKind, HEADER_SIZE};
use crate::shard::io::{sync_file, SegmentFile};
use crate::shard::layout::{fsync_dir, ShardLayout};
use parking_lot::RwLock;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One index entry is kept for every `INDEX_STRIDE` base records.
pub(crate) const INDEX_STRIDE: usize = 64;

/// Sparse map from timestamps to byte offsets in the base segment.
#[derive(Debug, Default)]
struct SparseIndex {
    entries: Vec<(Timestamp, u64)>,
    since_last: usize,
}

impl SparseIndex {
    fn note(&mut self, ts: Timestamp, offset: u64) {
        if self.entries.is_empty() || self.since_last >= INDEX_STRIDE {
            self.entries.push((ts, offset));
            self.since_last = 0;
        }
        self.since_last += 1;
    }

    /// Byte range of the base segment that may hold samples of `window`.
    fn byte_range(&self, window: &QueryWindow, body_end: u64) -> (u64, u64) {
        let lo_idx = self.entries.partition_point(|(ts, _)| *ts < window.start);
        let lo = match lo_idx {
            0 => HEADER_SIZE as u64,
            i => self.entries[i - 1].1,
        };
        let hi_idx = self.entries.partition_point(|(ts, _)| *ts < window.end);
        let hi = self.entries.get(hi_idx).map_or(body_end, |(_, offset)| *offset);
        (lo, hi.max(lo))
    }
}

/// Size and record count of the overlay segment. A zero length means the
/// overlay file does not exist.
#[derive(Debug, Clone, Copy, Default)]
struct OverlayState {
    len: u64,
    count: usize,
}

struct SegmentState {
    base: SegmentFile,
    /// Published length of the base segment; bytes past it are not readable.
    base_len: u64,
    first_ts: Option<Timestamp>,
    /// Write cursor: newest timestamp in the base segment.
    last_ts: Option<Timestamp>,
    count: u64,
    index: SparseIndex,
    overlay: OverlayState,
}

/// Outcome of appending samples to a shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendSummary {
    /// Samples appended in order to the base segment.
    pub base: usize,
    /// Samples routed to the overlay segment.
    pub overlay: usize,
    /// Overlay records now awaiting compaction.
    pub overlay_pending: usize,
}

/// Route of a sample relative to the shard's write cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Base,
    Overlay,
}

/// An open shard of one series and time bucket.
pub struct ShardSegment {
    key: ShardKey,
    bucket: TimeBucket,
    series_dir: PathBuf,
    base_path: PathBuf,
    overlay_path: PathBuf,
    tmp_path: PathBuf,
    io_strategy: IoStrategy,
    sync_mode: SyncMode,
    state: RwLock<SegmentState>,
}

impl ShardSegment {
    /// Opens the shard, recovering any torn tail. When the shard does not
    /// exist it is created if `create` is set, otherwise `None` is returned.
    pub(crate) fn open(
        layout: &ShardLayout,
        key: ShardKey,
        io_strategy: IoStrategy,
        sync_mode: SyncMode,
        create: bool,
    ) -> Result<Option<Self>> {
        let bucket = layout.bucket_of(key);
        let series_dir = layout.series_dir(key.series);
        let base_path = layout.segment_path(key, SegmentKind::Base);

        if discard_incomplete(&base_path, SegmentKind::Base, key)?
            && sync_mode != SyncMode::None
        {
            fsync_dir(&series_dir)?;
        }
        let base = match SegmentFile::open(&base_path, io_strategy) {
            Ok((file, header)) => {
                header.expect(SegmentKind::Base, key)?;
                file
            }
            Err(StoreError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                if !create {
                    return Ok(None);
                }
                fs::create_dir_all(&series_dir)?;
                let header = SegmentHeader::new(SegmentKind::Base, key.series, bucket);
                let file = SegmentFile::create(&base_path, &header, io_strategy, sync_mode)?;
                if sync_mode != SyncMode::None {
                    fsync_dir(&series_dir)?;
                }
                debug!("Created shard {}", key);
                file
            }
            Err(err) => return Err(err),
        };

        let segment = Self {
            key,
            bucket,
            overlay_path: layout.segment_path(key, SegmentKind::Overlay),
            tmp_path: layout.compaction_tmp_path(key),
            series_dir,
            base_path,
            io_strategy,
            sync_mode,
            state: RwLock::new(SegmentState {
                base,
                base_len: HEADER_SIZE as u64,
                first_ts: None,
                last_ts: None,
                count: 0,
                index: SparseIndex::default(),
                overlay: OverlayState::default(),
            }),
        };
        segment.recover()?;
        Ok(Some(segment))
    }

    /// Shard identity.
    pub fn key(&self) -> ShardKey {
        self.key
    }

    /// Time bucket covered by the shard.
    pub fn bucket(&self) -> TimeBucket {
        self.bucket
    }

    /// Number of samples in the base segment.
    pub fn base_count(&self) -> u64 {
        self.state.read().count
    }

    /// Number of overlay records awaiting compaction.
    pub fn overlay_pending(&self) -> usize {
        self.state.read().overlay.count
    }

    /// Newest timestamp in the base segment.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.state.read().last_ts
    }

    fn recover(&self) -> Result<()> {
        let mut state = self.state.write();

        let file_len = state.base.file_len()?;
        let body_len = file_len.saturating_sub(HEADER_SIZE as u64) as usize;
        let body = state.base.read_at(HEADER_SIZE as u64, body_len)?;
        let mut records = RecordIter::new(&body);
        let mut valid_len = body.len();
        while let Some(item) = records.next() {
            match item {
                Ok((offset, sample)) => {
                    if state.last_ts.is_some_and(|last| sample.timestamp <= last) {
                        return Err(StoreError::CorruptShard(format!(
                            "{}: base timestamps out of order at offset {}",
                            self.key,
                            HEADER_SIZE + offset
                        )));
                    }
                    let offset = (HEADER_SIZE + offset) as u64;
                    state.index.note(sample.timestamp, offset);
                    state.first_ts.get_or_insert(sample.timestamp);
                    state.last_ts = Some(sample.timestamp);
                    state.count += 1;
                }
                Err(err) => {
                    valid_len = records.offset();
                    self.check_torn_tail(&err, &body[valid_len..], SegmentKind::Base)?;
                }
            }
        }
        state.base_len = (HEADER_SIZE + valid_len) as u64;
        if valid_len < body.len() {
            state.base.truncate(state.base_len)?;
        }

        state.overlay = self.recover_overlay()?;
        Ok(())
    }

    fn recover_overlay(&self) -> Result<OverlayState> {
        if discard_incomplete(&self.overlay_path, SegmentKind::Overlay, self.key)? {
            if self.sync_mode != SyncMode::None {
                fsync_dir(&self.series_dir)?;
            }
            return Ok(OverlayState::default());
        }
        let (file, header) = match SegmentFile::open(&self.overlay_path, self.io_strategy) {
            Ok(opened) => opened,
            Err(StoreError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(OverlayState::default())
            }
            Err(err) => return Err(err),
        };
        header.expect(SegmentKind::Overlay, self.key)?;

        let body_len = file.file_len()?.saturating_sub(HEADER_SIZE as u64) as usize;
        let body = file.read_at(HEADER_SIZE as u64, body_len)?;
        let mut records = RecordIter::new(&body);
        let mut count = 0;
        let mut valid_len = body.len();
        while let Some(item) = records.next() {
            match item {
                Ok(_) => count += 1,
                Err(err) => {
                    valid_len = records.offset();
                    self.check_torn_tail(&err, &body[valid_len..], SegmentKind::Overlay)?;
                }
            }
        }
        let len = (HEADER_SIZE + valid_len) as u64;
        if valid_len < body.len() {
            file.truncate(len)?;
        }
        Ok(OverlayState { len, count })
    }

    /// Accepts a decode failure only if it is an incomplete final append.
    fn check_torn_tail(&self, err: &CodecError, rest: &[u8], kind: SegmentKind) -> Result<()> {
        let torn = match err {
            CodecError::Truncated { .. } => true,
            CodecError::ChecksumMismatch { .. } => codec::record_len(rest) == Ok(rest.len()),
            _ => false,
        };
        if !torn {
            return Err(StoreError::CorruptShard(format!(
                "{} {:?} segment: {}",
                self.key, kind, err
            )));
        }
        warn!(
            "Truncating torn tail of {} bytes from {:?} segment of shard {}: {}",
            rest.len(),
            kind,
            self.key,
            err
        );
        Ok(())
    }

    /// Appends samples in order.
    ///
    /// A sample newer than the write cursor is appended to the base segment;
    /// any other sample (backdated, or overwriting an existing timestamp) goes
    /// to the overlay. Consecutive samples with the same route are written and
    /// synced together. On failure, `PartialBatch` reports how many leading
    /// samples were persisted.
    pub fn append(&self, samples: &[Sample]) -> Result<AppendSummary> {
        for sample in samples {
            codec::validate(sample)?;
            debug_assert!(
                sample.timestamp >= self.bucket.start && sample.timestamp < self.bucket.end,
                "sample {} outside shard {}",
                sample.timestamp,
                self.key
            );
        }

        let mut state = self.state.write();
        let mut summary = AppendSummary::default();
        let mut persisted = 0;
        let mut run_start = 0;
        while run_start < samples.len() {
            let route = route_for(state.last_ts, samples[run_start].timestamp);
            let mut run_end = run_start + 1;
            let mut cursor = state.last_ts.max(Some(samples[run_start].timestamp));
            if route == Route::Base {
                while run_end < samples.len()
                    && route_for(cursor, samples[run_end].timestamp) == Route::Base
                {
                    cursor = Some(samples[run_end].timestamp);
                    run_end += 1;
                }
            } else {
                while run_end < samples.len()
                    && route_for(state.last_ts, samples[run_end].timestamp) == Route::Overlay
                {
                    run_end += 1;
                }
            }

            let run = &samples[run_start..run_end];
            let written = match route {
                Route::Base => self.append_base(&mut state, run),
                Route::Overlay => self.append_overlay(&mut state, run),
            };
            if let Err(err) = written {
                return Err(StoreError::PartialBatch {
                    persisted,
                    source: Box::new(err),
                });
            }

            match route {
                Route::Base => summary.base += run.len(),
                Route::Overlay => summary.overlay += run.len(),
            }
            persisted += run.len();
            run_start = run_end;
        }

        summary.overlay_pending = state.overlay.count;
        Ok(summary)
    }

    fn append_base(&self, state: &mut SegmentState, run: &[Sample]) -> Result<()> {
        let mut buf = Vec::with_capacity(run.iter().map(codec::encoded_len).sum());
        let mut offsets = Vec::with_capacity(run.len());
        for sample in run {
            offsets.push((sample.timestamp, state.base_len + buf.len() as u64));
            codec::encode_into(sample, &mut buf);
        }

        if let Err(err) = state.base.write_at(state.base_len, &buf, self.sync_mode) {
            if let Err(truncate_err) = state.base.truncate(state.base_len) {
                warn!(
                    "Failed to discard partial append to shard {}: {}",
                    self.key, truncate_err
                );
            }
            return Err(err);
        }

        state.base_len += buf.len() as u64;
        for (ts, offset) in offsets {
            state.index.note(ts, offset);
        }
        if let (Some(first), Some(last)) = (run.first(), run.last()) {
            state.first_ts.get_or_insert(first.timestamp);
            state.last_ts = Some(last.timestamp);
        }
        state.count += run.len() as u64;
        Ok(())
    }

    fn append_overlay(&self, state: &mut SegmentState, run: &[Sample]) -> Result<()> {
        let mut buf = Vec::with_capacity(run.iter().map(codec::encoded_len).sum());
        for sample in run {
            codec::encode_into(sample, &mut buf);
        }

        let creating = state.overlay.len == 0;
        let mut file = OpenOptions::new()
            .write(true)
            .create(creating)
            .truncate(creating)
            .open(&self.overlay_path)?;
        if creating {
            SegmentHeader::new(SegmentKind::Overlay, self.key.series, self.bucket)
                .write_to(&mut file)?;
            state.overlay.len = HEADER_SIZE as u64;
        }
        file.seek(SeekFrom::Start(state.overlay.len))?;
        if let Err(err) = file.write_all(&buf).and_then(|_| file.flush()) {
            if let Err(truncate_err) = file.set_len(state.overlay.len) {
                warn!(
                    "Failed to discard partial overlay append to shard {}: {}",
                    self.key, truncate_err
                );
            }
            return Err(err.into());
        }
        sync_file(&file, self.sync_mode)?;
        if creating && self.sync_mode != SyncMode::None {
            fsync_dir(&self.series_dir)?;
        }

        state.overlay.len += buf.len() as u64;
        state.overlay.count += run.len();
        Ok(())
    }

    /// Reads the samples of `window` in ascending time order, with overlay
    /// records applied.
    pub fn read_window(&self, window: QueryWindow) -> Result<Vec<Sample>> {
        let window = window.intersect(&self.bucket.window());
        if window.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.state.read();
        let mut samples = Vec::new();
        if state.count > 0 {
            let (lo, hi) = state.index.byte_range(&window, state.base_len);
            if hi > lo {
                let bytes = state.base.read_at(lo, (hi - lo) as usize)?;
                for item in RecordIter::new(&bytes) {
                    let (_, sample) = item?;
                    if sample.timestamp >= window.end {
                        break;
                    }
                    if sample.timestamp >= window.start {
                        samples.push(sample);
                    }
                }
            }
        }

        if state.overlay.count > 0 {
            let overlay: Vec<Sample> = self
                .read_overlay(&state)?
                .into_iter()
                .filter(|sample| window.contains(sample.timestamp))
                .collect();
            if !overlay.is_empty() {
                samples = merge_overlay(samples, overlay).samples;
            }
        }
        Ok(samples)
    }

    fn read_overlay(&self, state: &SegmentState) -> Result<Vec<Sample>> {
        let (file, header) = SegmentFile::open(&self.overlay_path, self.io_strategy)?;
        header.expect(SegmentKind::Overlay, self.key)?;
        let body_len = state.overlay.len.saturating_sub(HEADER_SIZE as u64) as usize;
        let body = file.read_at(HEADER_SIZE as u64, body_len)?;
        Ok(codec::decode_all(&body)?)
    }

    /// Latest sample strictly before `ts`.
    pub fn latest_before(&self, ts: Timestamp) -> Result<Option<Sample>> {
        Ok(self
            .read_window(QueryWindow::new(self.bucket.start, ts))?
            .pop())
    }

    /// Earliest sample at or after `ts`.
    pub fn earliest_at_or_after(&self, ts: Timestamp) -> Result<Option<Sample>> {
        Ok(self
            .read_window(QueryWindow::new(ts, self.bucket.end))?
            .into_iter()
            .next())
    }

    /// Folds the overlay into the base segment.
    ///
    /// The merged segment is written to a temporary file, fsynced and renamed
    /// over the base segment before the overlay is deleted. A crash at any
    /// step leaves a shard that reads the same as before.
    pub fn compact(&self) -> Result<Option<CompactionResult>> {
        let mut state = self.state.write();
        if state.overlay.count == 0 {
            return Ok(None);
        }

        let base_body_len = (state.base_len - HEADER_SIZE as u64) as usize;
        let base = codec::decode_all(&state.base.read_at(HEADER_SIZE as u64, base_body_len)?)?;
        let overlay = self.read_overlay(&state)?;
        let merged = merge_overlay(base, overlay);

        let mut body = Vec::with_capacity(merged.samples.iter().map(codec::encoded_len).sum());
        let mut index = SparseIndex::default();
        for sample in &merged.samples {
            index.note(sample.timestamp, (HEADER_SIZE + body.len()) as u64);
            codec::encode_into(sample, &mut body);
        }

        // 1. Write and fsync the merged segment
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.tmp_path)?;
            SegmentHeader::new(SegmentKind::Base, self.key.series, self.bucket)
                .write_to(&mut file)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fsync_dir(&self.series_dir)?;

        // 2. Atomic rename over the base segment
        fs::rename(&self.tmp_path, &self.base_path)?;
        fsync_dir(&self.series_dir)?;

        let (file, header) = SegmentFile::open(&self.base_path, self.io_strategy)?;
        header.expect(SegmentKind::Base, self.key)?;
        state.base = file;
        state.base_len = (HEADER_SIZE + body.len()) as u64;
        state.first_ts = merged.samples.first().map(|s| s.timestamp);
        state.last_ts = merged.samples.last().map(|s| s.timestamp);
        state.count = merged.samples.len() as u64;
        state.index = index;

        // 3. Drop the overlay; replaying it over the new base is harmless
        fs::remove_file(&self.overlay_path)?;
        fsync_dir(&self.series_dir)?;
        state.overlay = OverlayState::default();

        debug!(
            "Compacted shard {}: {} samples, {} duplicates resolved",
            self.key,
            merged.samples.len(),
            merged.duplicates
        );

        Ok(Some(CompactionResult {
            shards_compacted: 1,
            samples_merged: merged.samples.len() as u64,
            duplicates_resolved: merged.duplicates as u64,
            bytes_written: (HEADER_SIZE + body.len()) as u64,
        }))
    }
}

/// Removes a segment too short to hold its header, left behind by a crash
/// while the segment was being created. Returns true if a file was removed.
fn discard_incomplete(path: &Path, kind: SegmentKind, key: ShardKey) -> Result<bool> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() < HEADER_SIZE as u64 => {
            warn!(
                "Discarding incomplete {:?} segment of shard {} ({} bytes)",
                kind,
                key,
                meta.len()
            );
            fs::remove_file(path)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn route_for(cursor: Option<Timestamp>, ts: Timestamp) -> Route {
    match cursor {
        Some(last) if ts <= last => Route::Overlay,
        _ => Route::Base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_segment(layout: &ShardLayout, key: ShardKey) -> ShardSegment {
        ShardSegment::open(layout, key, IoStrategy::Mapped, SyncMode::None, true)
            .unwrap()
            .unwrap()
    }

    fn timestamps(samples: &[Sample]) -> Vec<Timestamp> {
        samples.iter().map(|s| s.timestamp).collect()
    }

    #[test]
    fn test_open_missing_without_create() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path(), 1000);
        let opened = ShardSegment::open(
            &layout,
            ShardKey::new(1, 0),
            IoStrategy::Mapped,
            SyncMode::None,
            false,
        )
        .unwrap();
        assert!(opened.is_none());
    }

    #[test]
    fn test_backdated_samples_route_to_overlay() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path(), 1000);
        let segment = open_segment(&layout, ShardKey::new(1, 0));

        let summary = segment
            .append(&[Sample::new(0, 0.0), Sample::new(20, 2.0), Sample::new(40, 4.0)])
            .unwrap();
        assert_eq!(summary.base, 3);

        let summary = segment.append(&[Sample::new(10, 1.0)]).unwrap();
        assert_eq!(summary.overlay, 1);
        assert_eq!(summary.overlay_pending, 1);
        assert_eq!(segment.last_timestamp(), Some(40));

        let samples = segment.read_window(QueryWindow::new(0, 1000)).unwrap();
        assert_eq!(timestamps(&samples), vec![0, 10, 20, 40]);
    }

    #[test]
    fn test_mixed_runs_in_one_append() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path(), 1000);
        let segment = open_segment(&layout, ShardKey::new(1, 0));

        let summary = segment
            .append(&[
                Sample::new(10, 1.0),
                Sample::new(20, 2.0),
                Sample::new(5, 0.5),
                Sample::new(20, 2.5),
                Sample::new(30, 3.0),
            ])
            .unwrap();
        assert_eq!(summary.base, 3);
        assert_eq!(summary.overlay, 2);

        let samples = segment.read_window(QueryWindow::new(0, 1000)).unwrap();
        assert_eq!(timestamps(&samples), vec![5, 10, 20, 30]);
        assert_eq!(samples[2].value, 2.5);
    }

    #[test]
    fn test_window_read_uses_index_boundaries() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path(), 100_000);
        let segment = open_segment(&layout, ShardKey::new(1, 0));

        let samples: Vec<_> = (0..1000).map(|i| Sample::new(i * 10, i as f64)).collect();
        segment.append(&samples).unwrap();

        let window = segment.read_window(QueryWindow::new(2505, 3015)).unwrap();
        assert_eq!(timestamps(&window), (251..=301).map(|i| i * 10).collect::<Vec<_>>());

        assert!(segment.read_window(QueryWindow::new(500, 500)).unwrap().is_empty());
        assert_eq!(segment.latest_before(2505).unwrap().unwrap().timestamp, 2500);
        assert_eq!(segment.earliest_at_or_after(2505).unwrap().unwrap().timestamp, 2510);
        assert!(segment.earliest_at_or_after(10_000).unwrap().is_none());
        assert!(segment.latest_before(0).unwrap().is_none());
    }

    #[test]
    fn test_reopen_recovers_state() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path(), 1000);
        let key = ShardKey::new(9, 0);
        {
            let segment = open_segment(&layout, key);
            segment
                .append(&[Sample::new(1, 1.0), Sample::new(3, 3.0), Sample::new(2, 2.0)])
                .unwrap();
        }

        let segment = open_segment(&layout, key);
        assert_eq!(segment.base_count(), 2);
        assert_eq!(segment.overlay_pending(), 1);
        assert_eq!(segment.last_timestamp(), Some(3));
        let samples = segment.read_window(QueryWindow::new(0, 1000)).unwrap();
        assert_eq!(timestamps(&samples), vec![1, 2, 3]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path(), 1000);
        let key = ShardKey::new(9, 0);
        {
            let segment = open_segment(&layout, key);
            segment
                .append(&[Sample::new(1, 1.0), Sample::new(2, 2.0)])
                .unwrap();
        }

        let path = layout.segment_path(key, SegmentKind::Base);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        let segment = open_segment(&layout, key);
        assert_eq!(segment.base_count(), 1);
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            (HEADER_SIZE + codec::MIN_RECORD_SIZE) as u64
        );
        segment.append(&[Sample::new(5, 5.0)]).unwrap();
        let samples = segment.read_window(QueryWindow::new(0, 1000)).unwrap();
        assert_eq!(timestamps(&samples), vec![1, 5]);
    }

    #[test]
    fn test_incomplete_base_segment_is_recreated() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path(), 1000);
        let key = ShardKey::new(9, 0);
        let path = layout.segment_path(key, SegmentKind::Base);
        fs::create_dir_all(layout.series_dir(key.series)).unwrap();

        // Crash between creating the file and writing its header.
        fs::write(&path, [0u8; 7]).unwrap();
        let opened =
            ShardSegment::open(&layout, key, IoStrategy::Mapped, SyncMode::None, false).unwrap();
        assert!(opened.is_none());
        assert!(!path.exists());

        fs::write(&path, b"").unwrap();
        let segment = open_segment(&layout, key);
        assert_eq!(segment.base_count(), 0);
        segment
            .append(&[Sample::new(5, 5.0), Sample::new(6, 6.0)])
            .unwrap();
        let samples = segment.read_window(QueryWindow::new(0, 1000)).unwrap();
        assert_eq!(timestamps(&samples), vec![5, 6]);
    }

    #[test]
    fn test_incomplete_overlay_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path(), 1000);
        let key = ShardKey::new(9, 0);
        {
            let segment = open_segment(&layout, key);
            segment
                .append(&[Sample::new(10, 1.0), Sample::new(20, 2.0)])
                .unwrap();
        }

        // Crash while the first backdate was writing the overlay header.
        let overlay = layout.segment_path(key, SegmentKind::Overlay);
        fs::write(&overlay, [0x50, 0x56]).unwrap();

        let segment = open_segment(&layout, key);
        assert_eq!(segment.overlay_pending(), 0);
        assert!(!overlay.exists());
        let samples = segment.read_window(QueryWindow::new(0, 1000)).unwrap();
        assert_eq!(timestamps(&samples), vec![10, 20]);

        segment.append(&[Sample::new(15, 1.5)]).unwrap();
        assert_eq!(segment.overlay_pending(), 1);
        let samples = segment.read_window(QueryWindow::new(0, 1000)).unwrap();
        assert_eq!(timestamps(&samples), vec![10, 15, 20]);
    }

    #[test]
    fn test_corruption_in_middle_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path(), 1000);
        let key = ShardKey::new(9, 0);
        {
            let segment = open_segment(&layout, key);
            segment
                .append(&[Sample::new(1, 1.0), Sample::new(2, 2.0)])
                .unwrap();
        }

        let path = layout.segment_path(key, SegmentKind::Base);
        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 9] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let result = ShardSegment::open(&layout, key, IoStrategy::Mapped, SyncMode::None, true);
        assert!(matches!(result, Err(StoreError::CorruptShard(_))));
    }

    #[test]
    fn test_compaction_preserves_reads() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ShardLayout::new(temp_dir.path(), 1000);
        let key = ShardKey::new(3, 0);
        let segment = open_segment(&layout, key);

        segment
            .append(&[Sample::new(100, 1.0), Sample::new(300, 3.0)])
            .unwrap();
        segment
            .append(&[Sample::new(200, 2.0), Sample::new(100, 1.5)])
            .unwrap();
        let before = segment.read_window(QueryWindow::new(0, 1000)).unwrap();

        let result = segment.compact().unwrap().unwrap();
        assert_eq!(result.shards_compacted, 1);
        assert_eq!(result.samples_merged, 3);
        assert_eq!(result.duplicates_resolved, 1);
        assert_eq!(segment.overlay_pending(), 0);
        assert!(!layout.segment_path(key, SegmentKind::Overlay).exists());
        assert!(!layout.compaction_tmp_path(key).exists());

        let after = segment.read_window(QueryWindow::new(0, 1000)).unwrap();
        assert_eq!(before, after);
        assert_eq!(after[0].value, 1.5);
        assert!(segment.compact().unwrap().is_none());

        // Appends continue after the compacted tail.
        segment.append(&[Sample::new(400, 4.0)]).unwrap();
        assert_eq!(segment.overlay_pending(), 0);
    }
}
