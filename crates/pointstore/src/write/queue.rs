//! Write-behind queue for asynchronous inserts.
//!
//! A single worker thread drains the queue in FIFO batches, so samples of one
//! series reach the backend in the order they were enqueued. Failures are
//! recorded and reported by the next [`WriteQueue::flush`].

use crate::backend::Backend;
use crate::error::{Result, StoreError};
use crate::model::BatchEntry;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

/// Queue metrics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Samples waiting for the worker.
    pub pending: usize,
    /// Samples handed to the backend in the current batch.
    pub in_flight: usize,
    /// Samples accepted since the queue started.
    pub enqueued: u64,
    /// Samples the backend confirmed.
    pub written: u64,
    /// Samples known not to be persisted.
    pub failed: u64,
}

/// Failures since the previous flush.
struct FailureState {
    first: StoreError,
    unconfirmed: u64,
}

struct QueueState {
    pending: VecDeque<BatchEntry>,
    in_flight: usize,
    shutdown: bool,
    failure: Option<FailureState>,
    stats: QueueStats,
}

struct QueueInner {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    drained: Condvar,
    space: Condvar,
    backend: Arc<dyn Backend>,
    batch_size: usize,
    capacity: usize,
}

impl QueueInner {
    fn record(&self, attempted: usize, outcome: std::result::Result<(), StoreError>) {
        let mut state = self.state.lock();
        state.in_flight = 0;
        match outcome {
            Ok(()) => state.stats.written += attempted as u64,
            Err(err) => {
                let persisted = err.persisted_of(attempted);
                let lost = (attempted - persisted) as u64;
                error!(
                    "Background write of {} samples failed, {} not persisted: {}",
                    attempted, lost, err
                );
                state.stats.written += persisted as u64;
                state.stats.failed += lost;
                match state.failure.as_mut() {
                    Some(failure) => failure.unconfirmed += lost,
                    None => {
                        state.failure = Some(FailureState {
                            first: err.into_cause(),
                            unconfirmed: lost,
                        })
                    }
                }
            }
        }
        if state.pending.is_empty() {
            self.drained.notify_all();
        }
    }
}

/// Bounded FIFO of samples persisted by a background worker.
pub struct WriteQueue {
    inner: Arc<QueueInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Starts the worker thread writing to `backend`.
    pub fn start(backend: Arc<dyn Backend>, batch_size: usize, capacity: usize) -> Result<Self> {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: 0,
                shutdown: false,
                failure: None,
                stats: QueueStats::default(),
            }),
            work_ready: Condvar::new(),
            drained: Condvar::new(),
            space: Condvar::new(),
            backend,
            batch_size: batch_size.max(1),
            capacity: capacity.max(1),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("pointstore-writer".into())
            .spawn(move || worker_loop(&worker_inner))?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueues one entry, blocking while the queue is full.
    pub fn enqueue(&self, entry: BatchEntry) -> Result<()> {
        let mut state = self.inner.state.lock();
        while !state.shutdown && state.pending.len() >= self.inner.capacity {
            self.inner.space.wait(&mut state);
        }
        if state.shutdown {
            return Err(StoreError::QueueClosed);
        }
        state.pending.push_back(entry);
        state.stats.enqueued += 1;
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Blocks until every previously enqueued entry was handed to the
    /// backend, then reports failures since the previous flush.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while !state.pending.is_empty() || state.in_flight > 0 {
            self.inner.drained.wait(&mut state);
        }
        match state.failure.take() {
            Some(failure) => Err(StoreError::Flush {
                unconfirmed: failure.unconfirmed,
                source: Box::new(failure.first),
            }),
            None => Ok(()),
        }
    }

    /// Returns a snapshot of queue metrics.
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            pending: state.pending.len(),
            in_flight: state.in_flight,
            ..state.stats
        }
    }

    /// Stops accepting entries, drains what is queued and joins the worker.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.work_ready.notify_all();
            self.inner.space.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Write queue worker panicked");
            }
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &QueueInner) {
    loop {
        let batch: Vec<BatchEntry> = {
            let mut state = inner.state.lock();
            loop {
                if !state.pending.is_empty() {
                    let n = state.pending.len().min(inner.batch_size);
                    let batch: Vec<_> = state.pending.drain(..n).collect();
                    state.in_flight = batch.len();
                    inner.space.notify_all();
                    break batch;
                }
                if state.shutdown {
                    return;
                }
                inner.work_ready.wait(&mut state);
            }
        };

        // A panicking backend must not kill the worker; flush() would hang.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            inner.backend.write_batch(&batch)
        }))
        .unwrap_or_else(|panic| {
            Err(StoreError::Backend {
                backend: inner.backend.selector().to_string(),
                message: format!(
                    "write panicked: {}",
                    panic.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
                ),
            })
        });
        debug!("Write queue flushed batch of {} samples", batch.len());
        inner.record(batch.len(), outcome);
    }
}
