//! State system: the façade over an attribute tree and a backend.
//!
//! Producers resolve attribute paths to quarks and report state changes;
//! the state system keeps ongoing values in a [`TransientState`] and
//! commits finished intervals to its [`Backend`]. Queries merge the
//! transient state with the backend, so they are valid while building.
//!
//! # Stack attributes
//!
//! A stack is a base attribute holding the current depth as an `Int`
//! (`Null` when empty), with one child attribute per level named `"1"`,
//! `"2"`, and so on. [`StateSystem::push_attribute`] and
//! [`StateSystem::pop_attribute`] maintain that layout.

use crate::attribute::{AttributeTree, Quark};
use crate::backend::{query_range_with, Backend, CancelFlag, HistoryTreeBackend};
use crate::error::{Result, StateError};
use crate::htree::ProviderVersionCheck;
use crate::interval::StateInterval;
use crate::transient::TransientState;
use crate::value::StateValue;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Maximum depth of a stack attribute.
pub const MAX_STACK_DEPTH: usize = 100_000;

/// Pattern element matching every child attribute.
pub const WILDCARD: &str = "*";

/// Pattern element moving to the parent attribute.
pub const PARENT: &str = "..";

/// Time-indexed state of a set of attributes.
#[derive(Debug)]
pub struct StateSystem {
    backend: Backend,
    attributes: RwLock<AttributeTree>,
    transient: RwLock<TransientState>,
    built: Mutex<bool>,
    built_cond: Condvar,
    disposed: AtomicBool,
}

impl StateSystem {
    /// Creates a state system that builds into `backend`.
    pub fn new(backend: impl Into<Backend>) -> Self {
        let backend = backend.into();
        let transient = TransientState::new(backend.start_time());
        Self {
            backend,
            attributes: RwLock::new(AttributeTree::new()),
            transient: RwLock::new(transient),
            built: Mutex::new(false),
            built_cond: Condvar::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Reopens a finished history tree file, with its attribute tree.
    pub fn open_existing(path: impl AsRef<Path>, check: ProviderVersionCheck) -> Result<Self> {
        let backend = HistoryTreeBackend::open_existing(path, check)?;
        let attributes = backend.load_attribute_tree()?.unwrap_or_default();
        let transient = TransientState::inactive(backend.start_time(), attributes.len());
        debug!(
            "Reopened state system with {} attributes, range [{}, {}]",
            attributes.len(),
            backend.start_time(),
            backend.end_time()
        );
        Ok(Self {
            backend: Backend::HistoryTree(backend),
            attributes: RwLock::new(attributes),
            transient: RwLock::new(transient),
            built: Mutex::new(true),
            built_cond: Condvar::new(),
            disposed: AtomicBool::new(false),
        })
    }

    /// The backend holding committed intervals.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StateError::Disposed);
        }
        Ok(())
    }

    fn attributes(&self) -> Result<RwLockReadGuard<'_, AttributeTree>> {
        self.check_disposed()?;
        Ok(self.attributes.read())
    }

    // ------------------------------------------------------------------
    // Attribute tree
    // ------------------------------------------------------------------

    /// Number of attributes.
    pub fn nb_attributes(&self) -> Result<usize> {
        Ok(self.attributes()?.len())
    }

    /// Resolves an absolute path, creating missing attributes.
    pub fn quark_absolute_and_add(&self, path: &[&str]) -> Result<Quark> {
        self.add_with(|tree| tree.quark_and_add(path))
    }

    /// Resolves a relative path, creating missing attributes.
    pub fn quark_relative_and_add(&self, parent: Quark, path: &[&str]) -> Result<Quark> {
        self.add_with(|tree| tree.quark_relative_and_add(parent, path))
    }

    fn add_with<F>(&self, resolve: F) -> Result<Quark>
    where
        F: FnOnce(&mut AttributeTree) -> Result<Quark>,
    {
        self.check_disposed()?;
        let mut tree = self.attributes.write();
        let before = tree.len();
        let quark = resolve(&mut tree)?;
        if tree.len() > before {
            let mut transient = self.transient.write();
            for _ in before..tree.len() {
                transient.add_empty_entry();
            }
        }
        Ok(quark)
    }

    /// Resolves an absolute path.
    pub fn quark_absolute(&self, path: &[&str]) -> Result<Quark> {
        self.attributes()?.quark(path)
    }

    /// Resolves a path relative to `parent`.
    pub fn quark_relative(&self, parent: Quark, path: &[&str]) -> Result<Quark> {
        self.attributes()?.quark_relative(parent, path)
    }

    /// Resolves an absolute path, `None` if it does not exist.
    pub fn opt_quark_absolute(&self, path: &[&str]) -> Result<Option<Quark>> {
        Ok(self.attributes()?.opt_quark(path))
    }

    /// Resolves a relative path, `None` if it does not exist.
    pub fn opt_quark_relative(&self, parent: Quark, path: &[&str]) -> Result<Option<Quark>> {
        Ok(self.attributes()?.opt_quark_relative(parent, path))
    }

    /// Children of `quark` (top-level attributes for `None`).
    pub fn sub_attributes(&self, quark: Option<Quark>, recursive: bool) -> Result<Vec<Quark>> {
        self.attributes()?.sub_attributes(quark, recursive)
    }

    /// Descendants of `quark` whose name matches a glob pattern.
    pub fn child_quarks(
        &self,
        quark: Option<Quark>,
        pattern: &str,
        recursive: bool,
    ) -> Result<Vec<Quark>> {
        self.attributes()?.child_quarks(quark, pattern, recursive)
    }

    /// Quarks matching a path pattern from the root.
    ///
    /// Each element is a literal name, [`WILDCARD`] or [`PARENT`].
    pub fn quarks(&self, pattern: &[&str]) -> Result<Vec<Quark>> {
        self.quarks_from(None, pattern)
    }

    /// Quarks matching a path pattern from `start`.
    pub fn quarks_from(&self, start: Option<Quark>, pattern: &[&str]) -> Result<Vec<Quark>> {
        let tree = self.attributes()?;
        let mut out = Vec::new();
        collect_quarks(&tree, start, pattern, &mut out)?;
        Ok(out)
    }

    /// Name of `quark`.
    pub fn attribute_name(&self, quark: Quark) -> Result<String> {
        self.attributes()?.name(quark).map(str::to_string)
    }

    /// Full path of `quark`.
    pub fn full_attribute_path(&self, quark: Quark) -> Result<String> {
        self.attributes()?.full_path(quark)
    }

    /// Parent of `quark`, `None` for top-level attributes.
    pub fn parent_attribute_quark(&self, quark: Quark) -> Result<Option<Quark>> {
        self.attributes()?.parent(quark)
    }

    // ------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------

    /// Sets `quark` to `value` from time `t` on.
    pub fn modify_attribute(&self, t: i64, value: StateValue, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        self.transient
            .write()
            .process_state_change(t, value, quark, &self.backend)
    }

    /// Replaces the ongoing value of `quark` without creating an interval.
    pub fn update_ongoing_state(&self, value: StateValue, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        self.transient.write().change_ongoing_value(quark, value)
    }

    /// Sets `quark` and its whole subtree to `Null` from time `t` on.
    pub fn remove_attribute(&self, t: i64, quark: Quark) -> Result<()> {
        let children = self.sub_attributes(Some(quark), true)?;
        for child in children {
            self.modify_attribute(t, StateValue::Null, child)?;
        }
        self.modify_attribute(t, StateValue::Null, quark)
    }

    fn ongoing_depth(&self, base: Quark) -> Result<usize> {
        match self.query_ongoing(base)? {
            StateValue::Null => Ok(0),
            StateValue::Int(depth) => Ok(depth.max(0) as usize),
            other => Err(StateError::StateValueType {
                expected: "int",
                actual: other.type_name(),
            }),
        }
    }

    /// Pushes `value` on the stack attribute `base` at time `t`.
    pub fn push_attribute(&self, t: i64, value: StateValue, base: Quark) -> Result<()> {
        let depth = self.ongoing_depth(base)?;
        if depth >= MAX_STACK_DEPTH {
            return Err(StateError::StackTooDeep(depth + 1));
        }
        let depth = depth + 1;
        let sub = self.quark_relative_and_add(base, &[&depth.to_string()])?;
        self.modify_attribute(t, StateValue::Int(depth as i32), base)?;
        self.modify_attribute(t, value, sub)
    }

    /// Pops the top of the stack attribute `base` at time `t`.
    ///
    /// Returns `None` if the stack is empty.
    pub fn pop_attribute(&self, t: i64, base: Quark) -> Result<Option<StateValue>> {
        let depth = self.ongoing_depth(base)?;
        if depth == 0 {
            return Ok(None);
        }
        let sub = self.quark_relative(base, &[&depth.to_string()])?;
        let popped = self.query_ongoing(sub)?;

        let next = match depth - 1 {
            0 => StateValue::Null,
            d => StateValue::Int(d as i32),
        };
        self.modify_attribute(t, next, base)?;
        self.remove_attribute(t, sub)?;
        Ok(Some(popped))
    }

    /// Commits all ongoing values and finishes the backend.
    ///
    /// The history ends at `max(end, backend end)`. Waiters blocked in
    /// [`StateSystem::wait_until_built`] are released even on failure.
    pub fn close_history(&self, end: i64) -> Result<()> {
        let result = self.finish(end);
        self.mark_built();
        result
    }

    fn finish(&self, end: i64) -> Result<()> {
        self.check_disposed()?;
        let real_end = end.max(self.backend.end_time());
        self.transient.write().close(real_end, &self.backend)?;
        self.backend.finished_building(real_end)?;
        let attributes = self.attributes.read();
        self.backend.store_attribute_tree(&attributes)?;
        debug!(
            "Closed state history at {} with {} attributes",
            real_end,
            attributes.len()
        );
        Ok(())
    }

    fn mark_built(&self) {
        let mut built = self.built.lock();
        *built = true;
        self.built_cond.notify_all();
    }

    /// Returns true once the history is closed (or disposed).
    pub fn is_built(&self) -> bool {
        *self.built.lock()
    }

    /// Blocks until the history is closed.
    pub fn wait_until_built(&self) {
        let mut built = self.built.lock();
        while !*built {
            self.built_cond.wait(&mut built);
        }
    }

    /// Blocks until the history is closed or `timeout` elapses.
    ///
    /// Returns true if the history is built.
    pub fn wait_until_built_timeout(&self, timeout: Duration) -> bool {
        let mut built = self.built.lock();
        if !*built {
            let _ = self.built_cond.wait_for(&mut built, timeout);
        }
        *built
    }

    /// Releases the backend. Every later call fails with `Disposed`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.backend.dispose();
        self.mark_built();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Earliest time of the history.
    pub fn start_time(&self) -> i64 {
        self.backend.start_time()
    }

    /// Latest time known, including ongoing values.
    pub fn current_end_time(&self) -> i64 {
        self.backend
            .end_time()
            .max(self.transient.read().latest_time())
    }

    fn check_time(&self, t: i64) -> Result<()> {
        let (start, end) = (self.start_time(), self.current_end_time());
        if t < start || t > end {
            return Err(StateError::TimeRange {
                time: t,
                start,
                end,
            });
        }
        Ok(())
    }

    /// Ongoing value of `quark`.
    pub fn query_ongoing(&self, quark: Quark) -> Result<StateValue> {
        self.check_disposed()?;
        self.transient.read().ongoing_value(quark).cloned()
    }

    /// Start time of the ongoing value of `quark`.
    pub fn ongoing_start_time(&self, quark: Quark) -> Result<i64> {
        self.check_disposed()?;
        self.transient.read().ongoing_start(quark)
    }

    /// The ongoing interval of `quark`, ending at the latest time seen.
    pub fn query_ongoing_interval(&self, quark: Quark) -> Result<StateInterval> {
        self.check_disposed()?;
        self.transient.read().ongoing_interval(quark)
    }

    /// The interval of `quark` covering `t`.
    pub fn query_single_state(&self, t: i64, quark: Quark) -> Result<StateInterval> {
        self.attributes()?.check(quark)?;
        self.check_time(t)?;
        if let Some(interval) = self.transient.read().interval_at(t, quark)? {
            return Ok(interval);
        }
        self.backend.do_singular_query(t, quark)
    }

    /// The covering interval of every attribute at `t`, indexed by quark.
    pub fn query_full_state(&self, t: i64) -> Result<Vec<StateInterval>> {
        self.check_disposed()?;
        self.check_time(t)?;
        let nb_attributes = self.nb_attributes()?;

        let mut state_info = if t <= self.backend.end_time() {
            self.backend.do_query(t)?
        } else {
            Vec::new()
        };
        state_info.resize(nb_attributes, None);
        self.transient.read().do_query(&mut state_info, t);

        state_info
            .into_iter()
            .enumerate()
            .map(|(quark, interval)| {
                interval.ok_or_else(|| {
                    StateError::Corrupted(format!("no interval for quark {quark} at time {t}"))
                })
            })
            .collect()
    }

    /// The interval of the top element of stack `base` at `t`, `None` when
    /// the stack is empty.
    pub fn query_single_stack_top(&self, t: i64, base: Quark) -> Result<Option<StateInterval>> {
        let depth = match self.query_single_state(t, base)?.into_value() {
            StateValue::Null => return Ok(None),
            StateValue::Int(depth) if depth <= 0 => return Ok(None),
            StateValue::Int(depth) => depth,
            other => {
                return Err(StateError::StateValueType {
                    expected: "int",
                    actual: other.type_name(),
                })
            }
        };
        let sub = self.quark_relative(base, &[&depth.to_string()])?;
        self.query_single_state(t, sub).map(Some)
    }

    /// Intervals of `quark` intersecting `[t1, t2]`.
    ///
    /// With a `resolution`, only one interval per step is returned, plus
    /// the exact first and last ones. The range is clamped to the history.
    pub fn query_history_range(
        &self,
        quark: Quark,
        t1: i64,
        t2: i64,
        resolution: Option<i64>,
        cancel: Option<&CancelFlag>,
    ) -> Result<Vec<StateInterval>> {
        self.attributes()?.check(quark)?;
        query_range_with(
            t1,
            t2,
            self.start_time(),
            self.current_end_time(),
            resolution,
            cancel,
            |t| self.query_single_state(t, quark),
        )
    }

    /// Every interval of `quarks` intersecting `[t1, t2]`, grouped by quark.
    pub fn query_2d(&self, quarks: &[Quark], t1: i64, t2: i64) -> Result<Vec<StateInterval>> {
        let mut out = Vec::new();
        for &quark in quarks {
            out.extend(self.query_history_range(quark, t1, t2, None, None)?);
        }
        Ok(out)
    }
}

fn collect_quarks(
    tree: &AttributeTree,
    quark: Option<Quark>,
    pattern: &[&str],
    out: &mut Vec<Quark>,
) -> Result<()> {
    let Some((element, rest)) = pattern.split_first() else {
        out.extend(quark);
        return Ok(());
    };
    match *element {
        WILDCARD => {
            for sub in tree.sub_attributes(quark, false)? {
                collect_quarks(tree, Some(sub), rest, out)?;
            }
        }
        PARENT => {
            if let Some(q) = quark {
                collect_quarks(tree, tree.parent(q)?, rest, out)?;
            }
        }
        name => {
            let sub = match quark {
                Some(q) => tree.opt_quark_relative(q, &[name]),
                None => tree.opt_quark(&[name]),
            };
            if let Some(sub) = sub {
                collect_quarks(tree, Some(sub), rest, out)?;
            }
        }
    }
    Ok(())
}
