//! Fully resident backend.
//!
//! Keeps one end-time-ordered interval list per attribute. Point queries
//! are a binary search on end time. Memory grows without bound, which is
//! fine for short-lived analyses.

use crate::attribute::Quark;
use crate::error::{Result, StateError};
use crate::interval::StateInterval;
use crate::value::StateValue;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
struct Intervals {
    by_attribute: Vec<Vec<StateInterval>>,
    end_time: i64,
    finished: bool,
}

/// In-memory interval store.
#[derive(Debug)]
pub struct InMemoryBackend {
    start_time: i64,
    inner: RwLock<Intervals>,
    disposed: AtomicBool,
}

impl InMemoryBackend {
    /// Creates an empty store starting at `start_time`.
    pub fn new(start_time: i64) -> Self {
        Self {
            start_time,
            inner: RwLock::new(Intervals {
                by_attribute: Vec::new(),
                end_time: start_time,
                finished: false,
            }),
            disposed: AtomicBool::new(false),
        }
    }

    /// Earliest time of the store.
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Latest end time.
    pub fn end_time(&self) -> i64 {
        self.inner.read().end_time
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StateError::Disposed);
        }
        Ok(())
    }

    fn check_time(&self, t: i64, end_time: i64) -> Result<()> {
        if t < self.start_time || t > end_time {
            return Err(StateError::TimeRange {
                time: t,
                start: self.start_time,
                end: end_time,
            });
        }
        Ok(())
    }

    /// Appends one interval.
    pub fn insert_past_state(
        &self,
        start: i64,
        end: i64,
        quark: Quark,
        value: StateValue,
    ) -> Result<()> {
        self.check_disposed()?;
        if start > end {
            return Err(StateError::InvalidInterval { start, end });
        }

        let mut inner = self.inner.write();
        if inner.finished {
            return Err(StateError::BuildingFinished);
        }
        if start < self.start_time {
            return Err(StateError::TimeRange {
                time: start,
                start: self.start_time,
                end: inner.end_time,
            });
        }

        let slot = quark as usize;
        if slot >= inner.by_attribute.len() {
            inner.by_attribute.resize_with(slot + 1, Vec::new);
        }
        let list = &mut inner.by_attribute[slot];
        let pos = list.partition_point(|iv| iv.end() <= end);
        list.insert(pos, StateInterval::new(start, end, quark, value));
        inner.end_time = inner.end_time.max(end);
        Ok(())
    }

    /// Fixes the end time; later inserts fail.
    pub fn finished_building(&self, end: i64) -> Result<()> {
        self.check_disposed()?;
        let mut inner = self.inner.write();
        if inner.finished {
            return Err(StateError::BuildingFinished);
        }
        inner.end_time = inner.end_time.max(end);
        inner.finished = true;
        Ok(())
    }

    /// Every interval covering `t`, indexed by quark.
    pub fn do_query(&self, t: i64) -> Result<Vec<Option<StateInterval>>> {
        self.check_disposed()?;
        let inner = self.inner.read();
        self.check_time(t, inner.end_time)?;
        Ok(inner
            .by_attribute
            .iter()
            .map(|list| find_covering(list, t).cloned())
            .collect())
    }

    /// The interval of `quark` covering `t`.
    pub fn do_singular_query(&self, t: i64, quark: Quark) -> Result<StateInterval> {
        self.check_disposed()?;
        let inner = self.inner.read();
        self.check_time(t, inner.end_time)?;
        inner
            .by_attribute
            .get(quark as usize)
            .and_then(|list| find_covering(list, t))
            .cloned()
            .ok_or_else(|| StateError::AttributeNotFound(format!("quark {quark} at time {t}")))
    }

    /// Drops all intervals.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.inner.write().by_attribute.clear();
    }
}

fn find_covering(list: &[StateInterval], t: i64) -> Option<&StateInterval> {
    let idx = list.partition_point(|iv| iv.end() < t);
    list.get(idx).filter(|iv| iv.start() <= t)
}
