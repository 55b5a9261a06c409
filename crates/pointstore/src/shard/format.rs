//! Shard segment file format.
//!
//! A shard is stored as up to two segment files sharing one header layout:
//! the base segment, whose records are strictly increasing in timestamp, and
//! the overlay segment, which collects backdated and overwriting samples in
//! arrival order.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Segment Header (40 bytes)                                   │
//! │  - Magic: "PVSH" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Kind: u8 (1 byte) base=0, overlay=1                       │
//! │  - Reserved: 1 byte                                          │
//! │  - Series ID: u64 (8 bytes)                                  │
//! │  - Bucket Start: i64 (8 bytes)                               │
//! │  - Bucket End: i64 (8 bytes)                                 │
//! │  - Header CRC32: u32 (4 bytes)                               │
//! │  - Reserved: 4 bytes                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Sample records (see `codec`), appended in place             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{Result, StoreError};
use crate::model::{SeriesId, ShardKey, TimeBucket, Timestamp};
use std::io::{Read, Write};

/// Magic bytes for segment headers: "PVSH"
pub const SEGMENT_MAGIC: [u8; 4] = *b"PVSH";

/// Current segment format version.
pub const SEGMENT_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 40;

/// Role of a segment file within its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentKind {
    /// Time-ordered main segment.
    Base = 0,
    /// Arrival-ordered segment of backdated samples.
    Overlay = 1,
}

impl SegmentKind {
    /// Creates a SegmentKind from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Base),
            1 => Some(Self::Overlay),
            _ => None,
        }
    }
}

/// Header written at the start of every segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Segment role.
    pub kind: SegmentKind,
    /// Owning series.
    pub series_id: SeriesId,
    /// Bucket start (inclusive).
    pub bucket_start: Timestamp,
    /// Bucket end (exclusive).
    pub bucket_end: Timestamp,
}

impl SegmentHeader {
    /// Creates a header for the given shard bucket.
    pub fn new(kind: SegmentKind, series_id: SeriesId, bucket: TimeBucket) -> Self {
        Self {
            kind,
            series_id,
            bucket_start: bucket.start,
            bucket_end: bucket.end,
        }
    }

    /// Shard this segment belongs to.
    pub fn key(&self) -> ShardKey {
        ShardKey::new(self.series_id, self.bucket_start)
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..6].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf[6] = self.kind as u8;
        buf[8..16].copy_from_slice(&self.series_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.bucket_start.to_le_bytes());
        buf[24..32].copy_from_slice(&self.bucket_end.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..32]);
        buf[32..36].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Writes the header to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Reads and validates a header from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }

    /// Parses and validates a header.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != SEGMENT_MAGIC {
            return Err(StoreError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != SEGMENT_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }

        let expected = u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]);
        let actual = crc32fast::hash(&buf[0..32]);
        if expected != actual {
            return Err(StoreError::CorruptShard(format!(
                "header checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            )));
        }

        let kind = SegmentKind::from_u8(buf[6])
            .ok_or_else(|| StoreError::CorruptShard(format!("unknown segment kind {}", buf[6])))?;

        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[8..16]);
        let series_id = u64::from_le_bytes(word);
        word.copy_from_slice(&buf[16..24]);
        let bucket_start = i64::from_le_bytes(word);
        word.copy_from_slice(&buf[24..32]);
        let bucket_end = i64::from_le_bytes(word);

        Ok(Self {
            kind,
            series_id,
            bucket_start,
            bucket_end,
        })
    }

    /// Checks that the header describes the expected shard and role.
    pub fn expect(&self, kind: SegmentKind, key: ShardKey) -> Result<()> {
        if self.kind != kind || self.key() != key {
            return Err(StoreError::CorruptShard(format!(
                "segment header {:?} for {} does not match expected {:?} for {}",
                self.kind,
                self.key(),
                kind,
                key
            )));
        }
        Ok(())
    }
}
