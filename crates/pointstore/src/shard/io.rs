//! Segment file access under the configured [`IoStrategy`].

use crate::config::{IoStrategy, SyncMode};
use crate::error::{Result, StoreError};
use crate::shard::format::SegmentHeader;
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Buffer size for stream reads.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// An open segment file.
///
/// Reads go through the configured strategy; writes always append at the
/// offset the caller tracks as the published length.
pub(crate) struct SegmentFile {
    path: PathBuf,
    file: File,
    strategy: IoStrategy,
    /// Serializes seek-based access to the shared file cursor.
    cursor: Mutex<()>,
    /// Cached mapping; replaced once appends outgrow it.
    mapped: Mutex<Option<Arc<Mmap>>>,
}

impl SegmentFile {
    /// Opens an existing segment and validates its header.
    pub fn open(path: &Path, strategy: IoStrategy) -> Result<(Self, SegmentHeader)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = SegmentHeader::read_from(&mut file)?;
        Ok((Self::from_file(path, file, strategy), header))
    }

    /// Creates a new segment containing only `header`.
    pub fn create(
        path: &Path,
        header: &SegmentHeader,
        strategy: IoStrategy,
        sync_mode: SyncMode,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        header.write_to(&mut file)?;
        sync_file(&file, sync_mode)?;
        Ok(Self::from_file(path, file, strategy))
    }

    fn from_file(path: &Path, file: File, strategy: IoStrategy) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            strategy,
            cursor: Mutex::new(()),
            mapped: Mutex::new(None),
        }
    }

    /// Physical file length.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Reads `len` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        match self.strategy {
            IoStrategy::Mapped => self.read_mapped(offset, len),
            IoStrategy::Positional => self.read_positional(offset, len),
            IoStrategy::Sequential => self.read_sequential(offset, len),
            IoStrategy::Stream => self.read_stream(offset, len),
        }
    }

    fn read_mapped(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset as usize + len;
        let map = {
            let mut mapped = self.mapped.lock();
            match mapped.as_ref() {
                Some(map) if map.len() >= end => Arc::clone(map),
                _ => {
                    // Only bytes below the published length are read, and those
                    // are never rewritten in place; compaction swaps the inode.
                    let map = Arc::new(unsafe { Mmap::map(&self.file) }?);
                    *mapped = Some(Arc::clone(&map));
                    map
                }
            }
        };
        if map.len() < end {
            return Err(unexpected_eof(&self.path, offset, len));
        }
        Ok(map[offset as usize..end].to_vec())
    }

    fn read_positional(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        read_exact_at(&self.file, &mut buf, offset)?;
        Ok(buf)
    }

    fn read_sequential(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let _cursor = self.cursor.lock();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_stream(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, File::open(&self.path)?);
        let skipped = io::copy(&mut reader.by_ref().take(offset), &mut io::sink())?;
        if skipped < offset {
            return Err(unexpected_eof(&self.path, offset, len));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes `bytes` at `offset` and syncs per `sync_mode`.
    pub fn write_at(&self, offset: u64, bytes: &[u8], sync_mode: SyncMode) -> Result<()> {
        {
            let _cursor = self.cursor.lock();
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(bytes)?;
        }
        sync_file(&self.file, sync_mode)
    }

    /// Truncates the file, discarding a torn tail.
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.mapped.lock().take();
        self.file.set_len(len)?;
        self.file.sync_all()?;
        Ok(())
    }
}

pub(crate) fn sync_file(file: &File, sync_mode: SyncMode) -> Result<()> {
    match sync_mode {
        SyncMode::Fsync => file.sync_all()?,
        SyncMode::Fdatasync => file.sync_data()?,
        SyncMode::None => {}
    }
    Ok(())
}

fn unexpected_eof(path: &Path, offset: u64, len: usize) -> StoreError {
    StoreError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("{path:?}: read of {len} bytes at {offset} past end of file"),
    ))
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
