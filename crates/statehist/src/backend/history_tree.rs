//! Synchronous history tree backend.

use crate::attribute::{AttributeTree, Quark};
use crate::error::{Result, StateError};
use crate::htree::{
    HistoryTree, HistoryTreeConfig, ProviderVersionCheck, DEFAULT_NODE_CACHE_SIZE,
};
use crate::interval::StateInterval;
use crate::value::StateValue;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Backend writing intervals into a [`HistoryTree`] on the caller's thread.
///
/// One thread builds; any number of threads may query concurrently.
#[derive(Debug)]
pub struct HistoryTreeBackend {
    tree: HistoryTree,
    finished: AtomicBool,
    disposed: AtomicBool,
}

impl HistoryTreeBackend {
    /// Creates a new tree file for building.
    pub fn new_for_building(config: HistoryTreeConfig) -> Result<Self> {
        Ok(Self {
            tree: HistoryTree::create(config)?,
            finished: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Reopens a finished tree file for querying.
    pub fn open_existing(path: impl AsRef<Path>, check: ProviderVersionCheck) -> Result<Self> {
        let tree = HistoryTree::open(path.as_ref(), check, DEFAULT_NODE_CACHE_SIZE)?;
        Ok(Self {
            tree,
            finished: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
        })
    }

    /// The underlying tree.
    pub fn tree(&self) -> &HistoryTree {
        &self.tree
    }

    /// Earliest time of the store.
    pub fn start_time(&self) -> i64 {
        self.tree.start_time()
    }

    /// Latest end time.
    pub fn end_time(&self) -> i64 {
        self.tree.end_time()
    }

    /// Returns true once building is over.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StateError::Disposed);
        }
        Ok(())
    }

    fn check_time(&self, t: i64) -> Result<()> {
        let (start, end) = (self.start_time(), self.end_time());
        if t < start || t > end {
            return Err(StateError::TimeRange {
                time: t,
                start,
                end,
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
        self.insert_interval(StateInterval::new(start, end, quark, value))
    }

    /// Appends an already built interval.
    pub fn insert_interval(&self, interval: StateInterval) -> Result<()> {
        self.check_disposed()?;
        self.tree.insert(interval)
    }

    /// Closes the tree file.
    pub fn finished_building(&self, end: i64) -> Result<()> {
        self.check_disposed()?;
        self.tree.close(end)?;
        self.finished.store(true, Ordering::Release);
        Ok(())
    }

    /// Every interval covering `t`, indexed by quark.
    pub fn do_query(&self, t: i64) -> Result<Vec<Option<StateInterval>>> {
        self.check_disposed()?;
        self.check_time(t)?;
        let mut state_info = Vec::new();
        self.tree.query_full(t, &mut state_info)?;
        Ok(state_info)
    }

    /// The interval of `quark` covering `t`.
    pub fn do_singular_query(&self, t: i64, quark: Quark) -> Result<StateInterval> {
        self.check_disposed()?;
        self.check_time(t)?;
        self.tree
            .query_single(t, quark)?
            .ok_or_else(|| StateError::AttributeNotFound(format!("quark {quark} at time {t}")))
    }

    /// Appends the attribute tree after the node blocks of a finished tree.
    pub fn store_attribute_tree(&self, attributes: &AttributeTree) -> Result<()> {
        self.check_disposed()?;
        let mut buf = Vec::new();
        attributes.write_to(&mut buf)?;
        self.tree.write_trailer(&buf)?;
        debug!(
            "Stored {} attributes at offset {}",
            attributes.len(),
            self.tree.trailer_offset()
        );
        Ok(())
    }

    /// Reads the attribute tree stored after the node blocks, if any.
    pub fn load_attribute_tree(&self) -> Result<Option<AttributeTree>> {
        self.check_disposed()?;
        match self.tree.read_trailer()? {
            Some(data) => Ok(Some(AttributeTree::read_from(&mut data.as_slice())?)),
            None => Ok(None),
        }
    }

    /// Releases the file. An unfinished tree file is deleted.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.is_finished() {
            self.tree.close_file();
        } else {
            warn!(
                "Disposing unfinished history tree, deleting {}",
                self.tree.config().path.display()
            );
            if let Err(e) = self.tree.delete_file() {
                warn!("Failed to delete history tree file: {:?}", e);
            }
        }
    }
}
