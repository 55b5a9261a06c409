//! Write path: synchronous batches and the write-behind queue.

pub mod queue;

pub use queue::{QueueStats, WriteQueue};

use crate::backend::Backend;
use crate::codec;
use crate::error::Result;
use crate::model::BatchEntry;
use tracing::debug;

/// Writes `entries` in chunks of `batch_size` through the backend's bulk
/// path, returning the number of entries written.
///
/// Every entry is validated before the first chunk is written, so a codec
/// error never leaves a batch half applied. A backend failure stops at the
/// failing chunk with `PartialBatch` counting the entries persisted so far.
pub fn write_chunked(
    backend: &dyn Backend,
    entries: &[BatchEntry],
    batch_size: usize,
) -> Result<usize> {
    for entry in entries {
        codec::validate(&entry.sample)?;
    }

    let mut persisted = 0;
    for chunk in entries.chunks(batch_size.max(1)) {
        backend
            .write_batch(chunk)
            .map_err(|err| err.after_persisted(persisted))?;
        persisted += chunk.len();
    }
    debug!(
        "Wrote {} samples in chunks of {}",
        persisted,
        batch_size.max(1)
    );
    Ok(persisted)
}
