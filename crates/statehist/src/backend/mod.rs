//! Interval storage backends.
//!
//! Three backends share one contract: [`InMemoryBackend`],
//! [`HistoryTreeBackend`] and [`ThreadedHistoryTreeBackend`]. They form a
//! closed set, so they are wrapped in the [`Backend`] enum rather than
//! exposed through an open trait.
//!
//! Contract:
//! - `insert_past_state` appends one interval; intervals arrive in
//!   non-decreasing end-time order.
//! - `finished_building` closes the store; later inserts fail.
//! - Queries are valid for `start_time() <= t <= end_time()`.
//! - After `dispose`, every operation fails with [`StateError::Disposed`].

pub mod history_tree;
pub mod in_memory;
pub mod threaded;

pub use history_tree::HistoryTreeBackend;
pub use in_memory::InMemoryBackend;
pub use threaded::{ThreadedConfig, ThreadedHistoryTreeBackend, DEFAULT_QUEUE_SIZE};

use crate::attribute::{AttributeTree, Quark};
use crate::error::{Result, StateError};
use crate::interval::StateInterval;
use crate::value::StateValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation signal for long-running queries.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A state history backend.
#[derive(Debug)]
pub enum Backend {
    /// Fully resident, per-attribute interval lists.
    InMemory(InMemoryBackend),
    /// Synchronous disk-backed history tree.
    HistoryTree(HistoryTreeBackend),
    /// History tree built by a dedicated worker thread.
    Threaded(ThreadedHistoryTreeBackend),
}

macro_rules! dispatch {
    ($self:ident, $backend:ident => $call:expr) => {
        match $self {
            Backend::InMemory($backend) => $call,
            Backend::HistoryTree($backend) => $call,
            Backend::Threaded($backend) => $call,
        }
    };
}

impl Backend {
    /// Earliest time of the store.
    pub fn start_time(&self) -> i64 {
        dispatch!(self, b => b.start_time())
    }

    /// Latest end time inserted so far, or the final end once built.
    pub fn end_time(&self) -> i64 {
        dispatch!(self, b => b.end_time())
    }

    /// Appends one interval.
    pub fn insert_past_state(
        &self,
        start: i64,
        end: i64,
        quark: Quark,
        value: StateValue,
    ) -> Result<()> {
        dispatch!(self, b => b.insert_past_state(start, end, quark, value))
    }

    /// Closes the store at `max(end, last inserted end)`.
    pub fn finished_building(&self, end: i64) -> Result<()> {
        dispatch!(self, b => b.finished_building(end))
    }

    /// Every interval covering `t`, indexed by quark.
    ///
    /// The returned vector may be shorter than the number of attributes.
    pub fn do_query(&self, t: i64) -> Result<Vec<Option<StateInterval>>> {
        dispatch!(self, b => b.do_query(t))
    }

    /// The interval of `quark` covering `t`.
    pub fn do_singular_query(&self, t: i64, quark: Quark) -> Result<StateInterval> {
        dispatch!(self, b => b.do_singular_query(t, quark))
    }

    /// Intervals of `quark` intersecting `[range_start, range_end]`.
    ///
    /// See [`query_range_with`] for the resolution semantics.
    pub fn do_query_range(
        &self,
        quark: Quark,
        range_start: i64,
        range_end: i64,
        resolution: Option<i64>,
        cancel: Option<&CancelFlag>,
    ) -> Result<Vec<StateInterval>> {
        query_range_with(
            range_start,
            range_end,
            self.start_time(),
            self.end_time(),
            resolution,
            cancel,
            |t| self.do_singular_query(t, quark),
        )
    }

    /// Persists the attribute tree next to the intervals, when supported.
    pub fn store_attribute_tree(&self, tree: &AttributeTree) -> Result<()> {
        match self {
            Backend::InMemory(_) => Ok(()),
            Backend::HistoryTree(b) => b.store_attribute_tree(tree),
            Backend::Threaded(b) => b.store_attribute_tree(tree),
        }
    }

    /// Loads a persisted attribute tree, if the store has one.
    pub fn load_attribute_tree(&self) -> Result<Option<AttributeTree>> {
        match self {
            Backend::InMemory(_) => Ok(None),
            Backend::HistoryTree(b) => b.load_attribute_tree(),
            Backend::Threaded(b) => b.load_attribute_tree(),
        }
    }

    /// Releases resources. Later operations fail with `Disposed`.
    pub fn dispose(&self) {
        dispatch!(self, b => b.dispose())
    }
}

impl From<InMemoryBackend> for Backend {
    fn from(backend: InMemoryBackend) -> Self {
        Backend::InMemory(backend)
    }
}

impl From<HistoryTreeBackend> for Backend {
    fn from(backend: HistoryTreeBackend) -> Self {
        Backend::HistoryTree(backend)
    }
}

impl From<ThreadedHistoryTreeBackend> for Backend {
    fn from(backend: ThreadedHistoryTreeBackend) -> Self {
        Backend::Threaded(backend)
    }
}

/// Walks `[range_start, range_end]` with single-point queries.
///
/// The range is clamped to `[store_start, store_end]`. Without a resolution,
/// every interval intersecting the range is returned, in order and without
/// gaps. With a resolution `r`, the next probe is at least `r` after the
/// previous one, but never beyond the range end, so the first and last
/// covering intervals are always exact.
pub fn query_range_with<F>(
    range_start: i64,
    range_end: i64,
    store_start: i64,
    store_end: i64,
    resolution: Option<i64>,
    cancel: Option<&CancelFlag>,
    mut query: F,
) -> Result<Vec<StateInterval>>
where
    F: FnMut(i64) -> Result<StateInterval>,
{
    if range_start > range_end {
        return Err(StateError::InvalidInterval {
            start: range_start,
            end: range_end,
        });
    }
    let start = range_start.max(store_start);
    let end = range_end.min(store_end);
    if start > end {
        return Err(StateError::TimeRange {
            time: range_start,
            start: store_start,
            end: store_end,
        });
    }

    let step = resolution.filter(|r| *r > 1);
    let mut intervals = Vec::new();
    let mut t = start;
    loop {
        if cancel.is_some_and(CancelFlag::is_cancelled) {
            return Err(StateError::Cancelled);
        }
        let interval = query(t)?;
        let interval_end = interval.end();
        intervals.push(interval);
        if interval_end >= end {
            return Ok(intervals);
        }
        t = match step {
            Some(r) => (interval_end + 1).max(t.saturating_add(r)).min(end),
            None => interval_end + 1,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Attribute 0 changes value every 10 time units.
    fn tenths(t: i64) -> Result<StateInterval> {
        let start = t - t.rem_euclid(10);
        Ok(StateInterval::new(start, start + 9, 0, StateValue::Long(start / 10)))
    }

    #[test]
    fn test_range_is_contiguous() {
        let intervals = query_range_with(5, 42, 0, 99, None, None, tenths).unwrap();
        let starts: Vec<i64> = intervals.iter().map(|iv| iv.start()).collect();
        assert_eq!(starts, vec![0, 10, 20, 30, 40]);
        for pair in intervals.windows(2) {
            assert_eq!(pair[0].end() + 1, pair[1].start());
        }
    }

    #[test]
    fn test_range_with_resolution_keeps_bounds() {
        let intervals = query_range_with(5, 95, 0, 99, Some(35), None, tenths).unwrap();
        assert_eq!(intervals.first().unwrap().start(), 0);
        assert_eq!(intervals.last().unwrap().end(), 99);
        assert!(intervals.len() < 10);
        for pair in intervals.windows(2) {
            assert!(pair[0].end() < pair[1].start());
        }
    }

    #[test]
    fn test_range_is_clamped() {
        let intervals = query_range_with(-50, 500, 0, 29, None, None, tenths).unwrap();
        assert_eq!(intervals.len(), 3);

        let result = query_range_with(100, 200, 0, 29, None, None, tenths);
        assert!(matches!(result, Err(StateError::TimeRange { .. })));

        let result = query_range_with(20, 10, 0, 29, None, None, tenths);
        assert!(matches!(result, Err(StateError::InvalidInterval { .. })));
    }

    #[test]
    fn test_range_cancellation() {
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let mut calls = 0;
        let result = query_range_with(0, 99, 0, 99, None, Some(&cancel), |t| {
            calls += 1;
            if calls == 3 {
                trigger.cancel();
            }
            tenths(t)
        });
        assert!(matches!(result, Err(StateError::Cancelled)));
        assert_eq!(calls, 3);
    }
}
