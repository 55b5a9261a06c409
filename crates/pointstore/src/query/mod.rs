//! Query engine: lazy range and bookend queries over any backend.
//!
//! Every query returns an iterator. Backend scans load one shard or page at a
//! time and hold no resources between calls to `next`, so a caller may stop
//! consuming at any point and simply drop the result.

pub mod bookend;
pub mod merge;

pub use bookend::{BookendPosition, BookendScan, BookendValue};
pub use merge::KWayMerge;

use crate::backend::{Backend, SampleScan};
use crate::error::Result;
use crate::model::{QueryMode, QueryWindow, SeriesId, TaggedSample, TimeOrder};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

/// Lazy range query result, tagged by series.
pub struct RangeScan {
    inner: Box<dyn Iterator<Item = Result<TaggedSample>> + Send>,
}

impl Iterator for RangeScan {
    type Item = Result<TaggedSample>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// Per-point stream: each series in turn, opening its scan only once the
/// previous series is exhausted.
struct SeriesChain {
    backend: Arc<dyn Backend>,
    pending: VecDeque<SeriesId>,
    window: QueryWindow,
    order: TimeOrder,
    current: Option<(SeriesId, SampleScan)>,
    done: bool,
}

impl Iterator for SeriesChain {
    type Item = Result<TaggedSample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some((series, scan)) = self.current.as_mut() {
                match scan.next() {
                    Some(Ok(sample)) => {
                        return Some(Ok(TaggedSample {
                            series: *series,
                            sample,
                        }))
                    }
                    Some(Err(err)) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                    None => self.current = None,
                }
            }

            let Some(series) = self.pending.pop_front() else {
                self.done = true;
                return None;
            };
            match self.backend.scan(series, self.window, self.order) {
                Ok(scan) => self.current = Some((series, scan)),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Runs queries against one backend.
#[derive(Clone)]
pub struct QueryEngine {
    backend: Arc<dyn Backend>,
}

impl QueryEngine {
    /// Creates an engine over `backend`.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Range query over `series`.
    ///
    /// `Combined` merges all series into one stream ordered by
    /// `(timestamp, series)`; `PerPoint` yields each series completely, in
    /// ascending series order.
    pub fn range_query(
        &self,
        series: &[SeriesId],
        window: QueryWindow,
        order: TimeOrder,
        mode: QueryMode,
    ) -> Result<RangeScan> {
        let series = normalize_series(series);
        let inner: Box<dyn Iterator<Item = Result<TaggedSample>> + Send> = match mode {
            QueryMode::Combined => {
                let sources = self.open_scans(&series, window, order)?;
                Box::new(KWayMerge::new(sources, order))
            }
            QueryMode::PerPoint => Box::new(SeriesChain {
                backend: Arc::clone(&self.backend),
                pending: series.into(),
                window,
                order,
                current: None,
                done: false,
            }),
        };
        Ok(RangeScan { inner })
    }

    /// Per-point range query as one independent stream per series.
    pub fn range_query_per_series(
        &self,
        series: &[SeriesId],
        window: QueryWindow,
        order: TimeOrder,
    ) -> Result<Vec<(SeriesId, SampleScan)>> {
        self.open_scans(&normalize_series(series), window, order)
    }

    /// Bookend query over `series`; values are time ascending.
    pub fn bookend_query(
        &self,
        series: &[SeriesId],
        window: QueryWindow,
        mode: QueryMode,
    ) -> Result<BookendScan> {
        Ok(BookendScan::new(
            Arc::clone(&self.backend),
            normalize_series(series),
            window,
            mode,
        ))
    }

    fn open_scans(
        &self,
        series: &[SeriesId],
        window: QueryWindow,
        order: TimeOrder,
    ) -> Result<Vec<(SeriesId, SampleScan)>> {
        series
            .iter()
            .map(|s| Ok((*s, self.backend.scan(*s, window, order)?)))
            .collect()
    }
}

/// De-duplicates the requested series and orders them by id.
fn normalize_series(series: &[SeriesId]) -> Vec<SeriesId> {
    series.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}
