//! Shard handle pool.
//!
//! The manager keeps at most `max_open_files` shards open. A shard is open
//! from the moment its segment is opened until it is evicted, and every
//! [`ShardHandle`] pins its shard against eviction until dropped.
//!
//! # Behavior
//!
//! - A request for an already open shard pins it and returns immediately.
//! - Otherwise, if the pool has spare capacity the shard is opened (or
//!   created) outside the pool lock. Concurrent requests for the same shard
//!   wait for the first opener.
//! - At capacity, the least recently released idle shard is evicted and
//!   closed. If every open shard is pinned, the request blocks until a handle
//!   is released, or fails with `ResourceExhausted` once the configured open
//!   timeout elapses.
//!
//! Callers hold at most one handle at a time, so a pool of any size cannot
//! deadlock.

use crate::config::{IoStrategy, StoreConfig, SyncMode};
use crate::error::{Result, StoreError};
use crate::model::ShardKey;
use crate::shard::layout::ShardLayout;
use crate::shard::segment::ShardSegment;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    /// Shards currently open.
    pub open: usize,
    /// Handles currently pinned.
    pub pinned: usize,
    /// Highest number of shards open at once.
    pub peak_open: usize,
    /// Segments opened from disk.
    pub opens: u64,
    /// Requests served by an already open shard.
    pub hits: u64,
    /// Idle shards closed to make room.
    pub evictions: u64,
    /// Requests that had to wait for a handle.
    pub waits: u64,
}

struct PoolEntry {
    segment: Arc<ShardSegment>,
    pins: usize,
    /// LRU tick at which the entry became idle.
    idle_since: Option<u64>,
}

#[derive(Default)]
struct HandlePool {
    entries: HashMap<ShardKey, PoolEntry>,
    /// Idle entries by release order, oldest first.
    idle: BTreeMap<u64, ShardKey>,
    /// Shards being opened outside the lock; each holds a slot.
    opening: HashSet<ShardKey>,
    tick: u64,
    stats: ShardStats,
}

impl HandlePool {
    fn occupied(&self) -> usize {
        self.entries.len() + self.opening.len()
    }

    fn pin(&mut self, key: ShardKey) -> Option<Arc<ShardSegment>> {
        let entry = self.entries.get_mut(&key)?;
        if let Some(tick) = entry.idle_since.take() {
            self.idle.remove(&tick);
        }
        entry.pins += 1;
        self.stats.pinned += 1;
        Some(Arc::clone(&entry.segment))
    }

    fn unpin(&mut self, key: ShardKey) {
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        entry.pins = entry.pins.saturating_sub(1);
        self.stats.pinned = self.stats.pinned.saturating_sub(1);
        if entry.pins == 0 {
            self.tick += 1;
            entry.idle_since = Some(self.tick);
            self.idle.insert(self.tick, key);
        }
    }

    fn evict_lru(&mut self) -> Option<Arc<ShardSegment>> {
        let (_, key) = self.idle.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.stats.evictions += 1;
        self.stats.open = self.entries.len();
        Some(entry.segment)
    }
}

/// LRU-bounded pool of open shards.
pub struct ShardManager {
    layout: ShardLayout,
    io_strategy: IoStrategy,
    sync_mode: SyncMode,
    max_open: usize,
    open_timeout: Option<Duration>,
    pool: Mutex<HandlePool>,
    released: Condvar,
}

impl ShardManager {
    /// Creates a manager for `layout` using the pool settings of `config`.
    pub fn new(layout: ShardLayout, config: &StoreConfig) -> Self {
        Self {
            layout,
            io_strategy: config.io_strategy,
            sync_mode: config.sync_mode,
            max_open: config.max_open_files.max(1),
            open_timeout: config.open_timeout,
            pool: Mutex::new(HandlePool::default()),
            released: Condvar::new(),
        }
    }

    /// Returns the shard layout.
    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    /// Returns the handle cap.
    pub fn max_open(&self) -> usize {
        self.max_open
    }

    /// Returns a snapshot of pool activity.
    pub fn stats(&self) -> ShardStats {
        self.pool.lock().stats
    }

    /// Opens a shard, creating it if it does not exist.
    pub fn open(&self, key: ShardKey) -> Result<ShardHandle<'_>> {
        self.acquire(key, true)?.ok_or_else(|| {
            StoreError::CorruptShard(format!("shard {} vanished while being created", key))
        })
    }

    /// Opens an existing shard, returning `None` if it has no files.
    pub fn open_existing(&self, key: ShardKey) -> Result<Option<ShardHandle<'_>>> {
        self.acquire(key, false)
    }

    fn acquire(&self, key: ShardKey, create: bool) -> Result<Option<ShardHandle<'_>>> {
        let started = Instant::now();
        let mut evicted = Vec::new();
        let mut pool = self.pool.lock();
        loop {
            if let Some(segment) = pool.pin(key) {
                pool.stats.hits += 1;
                return Ok(Some(ShardHandle {
                    manager: self,
                    segment,
                }));
            }
            if pool.opening.contains(&key) {
                self.wait(&mut pool, started)?;
                continue;
            }
            if pool.occupied() < self.max_open {
                pool.opening.insert(key);
                break;
            }
            if let Some(segment) = pool.evict_lru() {
                debug!("Evicting idle shard {}", segment.key());
                evicted.push(segment);
                continue;
            }
            pool.stats.waits += 1;
            self.wait(&mut pool, started)?;
        }
        drop(pool);
        // Close evicted shards before opening a new one.
        drop(evicted);

        let opened = ShardSegment::open(
            &self.layout,
            key,
            self.io_strategy,
            self.sync_mode,
            create,
        );

        let mut pool = self.pool.lock();
        pool.opening.remove(&key);
        let result = match opened {
            Ok(Some(segment)) => {
                let segment = Arc::new(segment);
                pool.entries.insert(
                    key,
                    PoolEntry {
                        segment: Arc::clone(&segment),
                        pins: 1,
                        idle_since: None,
                    },
                );
                pool.stats.opens += 1;
                pool.stats.pinned += 1;
                pool.stats.open = pool.entries.len();
                pool.stats.peak_open = pool.stats.peak_open.max(pool.entries.len());
                Ok(Some(ShardHandle {
                    manager: self,
                    segment,
                }))
            }
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };
        drop(pool);
        self.released.notify_all();
        result
    }

    fn wait(&self, pool: &mut MutexGuard<'_, HandlePool>, started: Instant) -> Result<()> {
        match self.open_timeout {
            None => {
                self.released.wait(pool);
                Ok(())
            }
            Some(timeout) => {
                let deadline = started + timeout;
                if self.released.wait_until(pool, deadline).timed_out() {
                    return Err(StoreError::ResourceExhausted {
                        max_open: self.max_open,
                        waited: started.elapsed(),
                    });
                }
                Ok(())
            }
        }
    }

    fn release(&self, key: ShardKey) {
        self.pool.lock().unpin(key);
        self.released.notify_all();
    }

    /// Closes a shard so its files can be deleted, waiting for outstanding
    /// handles to be released first.
    pub fn remove(&self, key: ShardKey) -> Result<()> {
        let started = Instant::now();
        let mut pool = self.pool.lock();
        loop {
            let busy = pool.opening.contains(&key)
                || pool.entries.get(&key).is_some_and(|entry| entry.pins > 0);
            if !busy {
                break;
            }
            self.wait(&mut pool, started)?;
        }
        let removed = pool.entries.remove(&key);
        if let Some(entry) = &removed {
            if let Some(tick) = entry.idle_since {
                pool.idle.remove(&tick);
            }
        }
        pool.stats.open = pool.entries.len();
        drop(pool);
        drop(removed);
        self.released.notify_all();
        Ok(())
    }

    /// Closes every idle shard.
    pub fn close_idle(&self) -> usize {
        let mut closed = Vec::new();
        {
            let mut pool = self.pool.lock();
            while let Some((_, key)) = pool.idle.pop_first() {
                if let Some(entry) = pool.entries.remove(&key) {
                    closed.push(entry.segment);
                }
            }
            pool.stats.open = pool.entries.len();
        }
        self.released.notify_all();
        closed.len()
    }
}

/// A pinned, open shard. Dropping the handle releases the pin; the shard
/// stays open in the pool until evicted.
pub struct ShardHandle<'a> {
    manager: &'a ShardManager,
    segment: Arc<ShardSegment>,
}

impl ShardHandle<'_> {
    /// Releases the handle. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Deref for ShardHandle<'_> {
    type Target = ShardSegment;

    fn deref(&self) -> &ShardSegment {
        &self.segment
    }
}

impl Drop for ShardHandle<'_> {
    fn drop(&mut self) {
        self.manager.release(self.segment.key());
    }
}
