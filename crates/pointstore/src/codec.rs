//! Sample record codec.
//!
//! Every backend that persists raw bytes stores samples in this layout, so a
//! record written by one component can be read by any other.
//!
//! ## Record Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  timestamp    i64 LE  (8 bytes)              │
//! │  value        f64 LE  (8 bytes, IEEE-754)    │
//! │  annot_len    u32 LE  (4 bytes, MAX = none)  │
//! │  annotation   annot_len bytes                │
//! │  crc32        u32 LE  (4 bytes)              │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The checksum covers every byte before it. Records are self-delimiting, so
//! a shard body is a plain concatenation of records.

use crate::error::CodecError;
use crate::model::{Sample, Timestamp};

/// Size of the fixed portion preceding the annotation.
pub const FIXED_PREFIX_SIZE: usize = 20;

/// Size of the trailing checksum.
pub const CHECKSUM_SIZE: usize = 4;

/// Smallest possible record (no annotation).
pub const MIN_RECORD_SIZE: usize = FIXED_PREFIX_SIZE + CHECKSUM_SIZE;

/// Annotation length marker meaning "no annotation".
const NO_ANNOTATION: u32 = u32::MAX;

/// Largest annotation a record can carry.
pub const MAX_ANNOTATION_LEN: usize = (NO_ANNOTATION - 1) as usize;

/// Newest storable timestamp. `i64::MAX` is kept free so that the half-open
/// window `[t, i64::MAX)` covers every stored sample at or after `t`.
pub const MAX_TIMESTAMP: Timestamp = i64::MAX - 1;

/// Checks that a sample can be encoded and stored.
pub fn validate(sample: &Sample) -> Result<(), CodecError> {
    if sample.timestamp > MAX_TIMESTAMP {
        return Err(CodecError::ReservedTimestamp(sample.timestamp));
    }
    match &sample.annotation {
        Some(annotation) if annotation.len() > MAX_ANNOTATION_LEN => {
            Err(CodecError::AnnotationTooLarge(annotation.len()))
        }
        _ => Ok(()),
    }
}

/// Returns the encoded size of a sample.
pub fn encoded_len(sample: &Sample) -> usize {
    MIN_RECORD_SIZE + sample.annotation.as_ref().map_or(0, Vec::len)
}

/// Encodes a sample into a new buffer.
///
/// The sample must have passed [`validate`].
pub fn encode(sample: &Sample) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(sample));
    encode_into(sample, &mut buf);
    buf
}

/// Appends the encoding of `sample` to `buf`.
pub fn encode_into(sample: &Sample, buf: &mut Vec<u8>) {
    let start = buf.len();
    buf.extend_from_slice(&sample.timestamp.to_le_bytes());
    buf.extend_from_slice(&sample.value.to_bits().to_le_bytes());
    match &sample.annotation {
        Some(annotation) => {
            debug_assert!(annotation.len() <= MAX_ANNOTATION_LEN);
            buf.extend_from_slice(&(annotation.len() as u32).to_le_bytes());
            buf.extend_from_slice(annotation);
        }
        None => buf.extend_from_slice(&NO_ANNOTATION.to_le_bytes()),
    }
    let crc = crc32fast::hash(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Decodes exactly one record occupying the whole buffer.
pub fn decode(bytes: &[u8]) -> Result<Sample, CodecError> {
    let (sample, consumed) = decode_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes(bytes.len() - consumed));
    }
    Ok(sample)
}

/// Decodes the record at the start of `bytes`, returning it together with
/// the number of bytes it occupied.
pub fn decode_prefix(bytes: &[u8]) -> Result<(Sample, usize), CodecError> {
    let record_len = record_len(bytes)?;
    let body = &bytes[..record_len - CHECKSUM_SIZE];

    let expected = read_u32(bytes, record_len - CHECKSUM_SIZE);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    let timestamp = read_i64(bytes, 0);
    let value = f64::from_bits(read_u64(bytes, 8));
    let annotation = match read_u32(bytes, 16) {
        NO_ANNOTATION => None,
        _ => Some(body[FIXED_PREFIX_SIZE..].to_vec()),
    };

    Ok((
        Sample {
            timestamp,
            value,
            annotation,
        },
        record_len,
    ))
}

/// Reads the timestamp of the record at the start of `bytes` without
/// verifying its checksum.
pub fn peek_timestamp(bytes: &[u8]) -> Result<Timestamp, CodecError> {
    if bytes.len() < 8 {
        return Err(CodecError::Truncated {
            needed: 8,
            available: bytes.len(),
        });
    }
    Ok(read_i64(bytes, 0))
}

/// Length of the record at the start of `bytes`, checking that it is fully
/// present.
pub fn record_len(bytes: &[u8]) -> Result<usize, CodecError> {
    if bytes.len() < MIN_RECORD_SIZE {
        return Err(CodecError::Truncated {
            needed: MIN_RECORD_SIZE,
            available: bytes.len(),
        });
    }
    let annotation_len = match read_u32(bytes, 16) {
        NO_ANNOTATION => 0,
        len => len as usize,
    };
    let needed = MIN_RECORD_SIZE + annotation_len;
    if bytes.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(needed)
}

/// Iterator over a concatenation of records.
///
/// Yields `(offset, sample)` pairs, where `offset` is relative to the start
/// of the buffer. Stops after the first error.
pub struct RecordIter<'a> {
    bytes: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> RecordIter<'a> {
    /// Creates an iterator over `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            failed: false,
        }
    }

    /// Offset of the next undecoded byte.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<(usize, Sample), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.bytes.len() {
            return None;
        }
        match decode_prefix(&self.bytes[self.offset..]) {
            Ok((sample, consumed)) => {
                let at = self.offset;
                self.offset += consumed;
                Some(Ok((at, sample)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Decodes every record in `bytes`.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Sample>, CodecError> {
    RecordIter::new(bytes)
        .map(|item| item.map(|(_, sample)| sample))
        .collect()
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn read_i64(bytes: &[u8], at: usize) -> i64 {
    read_u64(bytes, at) as i64
}
