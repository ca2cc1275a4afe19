//! Ongoing attribute values not yet committed to a backend.
//!
//! Each attribute has one ongoing value and the time it started. A state
//! change commits the previous value as a finished interval
//! `[ongoing start, t - 1]` and starts a new ongoing value at `t`. Closing
//! the transient state commits every ongoing value up to the end time.

use crate::attribute::Quark;
use crate::backend::Backend;
use crate::error::{Result, StateError};
use crate::interval::StateInterval;
use crate::value::StateValue;

#[derive(Debug, Clone)]
struct Ongoing {
    value: StateValue,
    start: i64,
}

/// Ongoing values of every attribute.
#[derive(Debug)]
pub struct TransientState {
    ongoing: Vec<Ongoing>,
    start_time: i64,
    latest_time: i64,
    active: bool,
}

impl TransientState {
    /// Creates an empty, active transient state.
    pub fn new(start_time: i64) -> Self {
        Self {
            ongoing: Vec::new(),
            start_time,
            latest_time: start_time,
            active: true,
        }
    }

    /// Creates an inactive transient state for an already built history.
    pub fn inactive(start_time: i64, attribute_count: usize) -> Self {
        let mut state = Self::new(start_time);
        state.ongoing = vec![
            Ongoing {
                value: StateValue::Null,
                start: start_time,
            };
            attribute_count
        ];
        state.active = false;
        state
    }

    /// Returns true while building.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Latest state change time seen.
    pub fn latest_time(&self) -> i64 {
        self.latest_time
    }

    /// Registers a new attribute: `Null` since the start of the history.
    pub fn add_empty_entry(&mut self) {
        self.ongoing.push(Ongoing {
            value: StateValue::Null,
            start: self.start_time,
        });
    }

    fn entry(&self, quark: Quark) -> Result<&Ongoing> {
        self.ongoing
            .get(quark as usize)
            .ok_or_else(|| StateError::AttributeNotFound(format!("quark {quark}")))
    }

    fn entry_mut(&mut self, quark: Quark) -> Result<&mut Ongoing> {
        self.ongoing
            .get_mut(quark as usize)
            .ok_or_else(|| StateError::AttributeNotFound(format!("quark {quark}")))
    }

    /// Ongoing value of `quark`.
    pub fn ongoing_value(&self, quark: Quark) -> Result<&StateValue> {
        Ok(&self.entry(quark)?.value)
    }

    /// Time at which the ongoing value of `quark` started.
    pub fn ongoing_start(&self, quark: Quark) -> Result<i64> {
        Ok(self.entry(quark)?.start)
    }

    /// Replaces the ongoing value without committing anything.
    pub fn change_ongoing_value(&mut self, quark: Quark, value: StateValue) -> Result<()> {
        self.entry_mut(quark)?.value = value;
        Ok(())
    }

    /// The ongoing interval of `quark`, ending at the latest time seen.
    pub fn ongoing_interval(&self, quark: Quark) -> Result<StateInterval> {
        let entry = self.entry(quark)?;
        Ok(StateInterval::new(
            entry.start,
            self.latest_time.max(entry.start),
            quark,
            entry.value.clone(),
        ))
    }

    /// The ongoing interval of `quark` if it covers `t`.
    pub fn interval_at(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>> {
        let entry = self.entry(quark)?;
        if !self.active || t < entry.start {
            return Ok(None);
        }
        Ok(Some(StateInterval::new(
            entry.start,
            self.latest_time.max(t),
            quark,
            entry.value.clone(),
        )))
    }

    /// Fills the slots of `state_info` covered by ongoing values at `t`.
    pub fn do_query(&self, state_info: &mut [Option<StateInterval>], t: i64) {
        if !self.active {
            return;
        }
        for (quark, (slot, entry)) in state_info.iter_mut().zip(&self.ongoing).enumerate() {
            if t >= entry.start {
                *slot = Some(StateInterval::new(
                    entry.start,
                    self.latest_time.max(t),
                    quark as Quark,
                    entry.value.clone(),
                ));
            }
        }
    }

    /// Applies a state change of `quark` to `value` at time `t`.
    ///
    /// An unchanged value is a no-op. Otherwise the previous value is
    /// committed to `backend` as `[ongoing start, t - 1]`.
    pub fn process_state_change(
        &mut self,
        t: i64,
        value: StateValue,
        quark: Quark,
        backend: &Backend,
    ) -> Result<()> {
        if !self.active {
            return Err(StateError::BuildingFinished);
        }
        if t < self.start_time {
            return Err(StateError::TimeRange {
                time: t,
                start: self.start_time,
                end: self.latest_time,
            });
        }

        let entry = self
            .ongoing
            .get_mut(quark as usize)
            .ok_or_else(|| StateError::AttributeNotFound(format!("quark {quark}")))?;
        if entry.value == value {
            return Ok(());
        }
        if entry.start < t {
            backend.insert_past_state(entry.start, t - 1, quark, entry.value.clone())?;
            entry.start = t;
        }
        entry.value = value;
        self.latest_time = self.latest_time.max(t);
        Ok(())
    }

    /// Commits every ongoing value as ending at `end` and deactivates.
    ///
    /// Values that start after `end` are dropped.
    pub fn close(&mut self, end: i64, backend: &Backend) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        for (quark, entry) in self.ongoing.iter().enumerate() {
            if entry.start <= end {
                backend.insert_past_state(entry.start, end, quark as Quark, entry.value.clone())?;
            }
        }
        self.active = false;
        Ok(())
    }
}
