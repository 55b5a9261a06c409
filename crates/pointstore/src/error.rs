//! Error and Result types for point-value store operations.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised while encoding or decoding a sample record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The buffer ends before the record does.
    #[error("Truncated record: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to finish decoding.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// Record checksum does not match its contents.
    #[error("Record checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed over the record bytes.
        actual: u32,
    },

    /// Bytes remain after a complete record was decoded.
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    /// Annotation exceeds the maximum encodable length.
    #[error("Annotation of {0} bytes exceeds the record limit")]
    AnnotationTooLarge(usize),

    /// Timestamp is reserved as the open end of query windows.
    #[error("Timestamp {0} is reserved and cannot be stored")]
    ReservedTimestamp(i64),
}

/// The error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A sample record could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error reported by the relational backend.
    #[cfg(feature = "sqlite")]
    #[error("Relational backend error: {0}")]
    Relational(#[from] rusqlite::Error),

    /// Error reported by an externally supplied backend adapter.
    #[error("Backend {backend} failed: {message}")]
    Backend {
        /// Backend identifier.
        backend: String,
        /// Adapter supplied description.
        message: String,
    },

    /// Invalid magic bytes in a shard header.
    #[error("Invalid magic bytes: expected PVSH, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported shard format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Shard file contents contradict its header or location.
    #[error("Corrupt shard: {0}")]
    CorruptShard(String),

    /// No shard handle could be obtained before the open timeout elapsed.
    #[error("Shard handle pool exhausted: all {max_open} handles in use after {waited:?}")]
    ResourceExhausted {
        /// Configured handle cap.
        max_open: usize,
        /// Time spent waiting for a handle.
        waited: Duration,
    },

    /// The configured backend identifier has no registered adapter.
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// Configuration value is missing or malformed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Asynchronous writes failed since the previous flush.
    #[error("Flush failed, {unconfirmed} queued samples were not persisted: {source}")]
    Flush {
        /// Number of samples known not to be persisted.
        unconfirmed: u64,
        /// First error encountered by the write-behind worker.
        #[source]
        source: Box<StoreError>,
    },

    /// A batch write stopped part way through.
    #[error("Batch write failed after {persisted} samples: {source}")]
    PartialBatch {
        /// Number of batch entries that were persisted.
        persisted: usize,
        /// Error that stopped the batch.
        #[source]
        source: Box<StoreError>,
    },

    /// The write-behind queue has been shut down.
    #[error("Write queue is closed")]
    QueueClosed,
}

impl StoreError {
    /// Returns true for failures of the storage medium itself, as opposed to
    /// configuration or resource errors.
    pub fn is_storage_io(&self) -> bool {
        match self {
            Self::Io(_) | Self::Backend { .. } => true,
            #[cfg(feature = "sqlite")]
            Self::Relational(_) => true,
            Self::PartialBatch { source, .. } | Self::Flush { source, .. } => {
                source.is_storage_io()
            }
            _ => false,
        }
    }

    /// Number of entries known to be persisted when this error ends a batch
    /// of `attempted` entries.
    pub(crate) fn persisted_of(&self, attempted: usize) -> usize {
        match self {
            Self::PartialBatch { persisted, .. } => (*persisted).min(attempted),
            _ => 0,
        }
    }

    /// Wraps the error as a batch failure after `persisted` earlier entries
    /// were stored, folding in any count the error already carries.
    pub(crate) fn after_persisted(self, persisted: usize) -> Self {
        match self {
            Self::PartialBatch {
                persisted: inner,
                source,
            } => Self::PartialBatch {
                persisted: persisted + inner,
                source,
            },
            other => Self::PartialBatch {
                persisted,
                source: Box::new(other),
            },
        }
    }

    /// Strips batch bookkeeping, returning the error that stopped the write.
    pub(crate) fn into_cause(self) -> Self {
        match self {
            Self::PartialBatch { source, .. } => source.into_cause(),
            other => other,
        }
    }
}
