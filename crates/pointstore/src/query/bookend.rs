//! Bookend queries: in-window samples plus the nearest sample on each side.

use crate::backend::Backend;
use crate::error::Result;
use crate::model::{QueryMode, QueryWindow, Sample, SeriesId, TaggedSample, TimeOrder};
use crate::query::merge::KWayMerge;
use std::collections::VecDeque;
use std::sync::Arc;

/// Where a bookend query result lies relative to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookendPosition {
    /// Latest sample before the window start.
    Before,
    /// Sample inside the window.
    Within,
    /// Earliest sample at or after the window end.
    After,
}

/// One element of a bookend query result.
#[derive(Debug, Clone, PartialEq)]
pub struct BookendValue {
    /// Position relative to the window.
    pub position: BookendPosition,
    /// Owning series.
    pub series: SeriesId,
    /// The sample.
    pub sample: Sample,
}

impl BookendValue {
    fn within(tagged: TaggedSample) -> Self {
        Self {
            position: BookendPosition::Within,
            series: tagged.series,
            sample: tagged.sample,
        }
    }
}

enum Step {
    Before(SeriesId),
    Values(SeriesId),
    Merged,
    After(SeriesId),
}

type ValueStream = Box<dyn Iterator<Item = Result<TaggedSample>> + Send>;

/// Lazy bookend query result.
///
/// Combined mode yields every `Before` value in series order, then the
/// in-window samples of all series merged by time, then every `After` value.
/// Per-point mode yields `Before`, values and `After` for one series before
/// moving to the next. Missing bookends are skipped.
pub struct BookendScan {
    backend: Arc<dyn Backend>,
    window: QueryWindow,
    series: Vec<SeriesId>,
    steps: VecDeque<Step>,
    current: Option<ValueStream>,
    done: bool,
}

impl BookendScan {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        series: Vec<SeriesId>,
        window: QueryWindow,
        mode: QueryMode,
    ) -> Self {
        let steps = match mode {
            QueryMode::Combined => series
                .iter()
                .map(|s| Step::Before(*s))
                .chain(std::iter::once(Step::Merged))
                .chain(series.iter().map(|s| Step::After(*s)))
                .collect(),
            QueryMode::PerPoint => series
                .iter()
                .flat_map(|s| [Step::Before(*s), Step::Values(*s), Step::After(*s)])
                .collect(),
        };
        Self {
            backend,
            window,
            series,
            steps,
            current: None,
            done: false,
        }
    }

    /// Runs one step, returning a bookend value if the step produced one.
    fn run(&mut self, step: Step) -> Result<Option<BookendValue>> {
        let bookend = |position, series, sample: Option<Sample>| {
            sample.map(|sample| BookendValue {
                position,
                series,
                sample,
            })
        };
        match step {
            Step::Before(series) => {
                let sample = self.backend.latest_before(series, self.window.start)?;
                Ok(bookend(BookendPosition::Before, series, sample))
            }
            Step::After(series) => {
                let sample = self.backend.earliest_at_or_after(series, self.window.end)?;
                Ok(bookend(BookendPosition::After, series, sample))
            }
            Step::Values(series) => {
                let scan = self.backend.scan(series, self.window, TimeOrder::Ascending)?;
                self.current = Some(Box::new(scan.map(move |sample| {
                    sample.map(|sample| TaggedSample { series, sample })
                })));
                Ok(None)
            }
            Step::Merged => {
                let mut sources = Vec::with_capacity(self.series.len());
                for series in &self.series {
                    let scan = self
                        .backend
                        .scan(*series, self.window, TimeOrder::Ascending)?;
                    sources.push((*series, scan));
                }
                self.current = Some(Box::new(KWayMerge::new(sources, TimeOrder::Ascending)));
                Ok(None)
            }
        }
    }
}

impl Iterator for BookendScan {
    type Item = Result<BookendValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(Ok(tagged)) => return Some(Ok(BookendValue::within(tagged))),
                    Some(Err(err)) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                    None => self.current = None,
                }
            }

            let Some(step) = self.steps.pop_front() else {
                self.done = true;
                return None;
            };
            match self.run(step) {
                Ok(Some(value)) => return Some(Ok(value)),
                Ok(None) => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
