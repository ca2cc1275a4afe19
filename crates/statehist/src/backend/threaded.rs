//! History tree backend built by a dedicated worker thread.
//!
//! Inserts are pushed onto a bounded channel and applied by a single
//! builder thread; a full channel blocks the producer. Every other call is
//! shipped to the same worker as a task, so all tree access is serialized
//! and a query always observes the inserts enqueued before it.
//!
//! An insert that fails on the worker cannot be reported to the call that
//! enqueued it. The failure is kept and reported exactly once, wrapped in
//! [`StateError::PriorBuildFailure`], by the next call on this backend.
//! After that, building calls return [`StateError::BuildAborted`] while
//! queries keep working.

use crate::attribute::{AttributeTree, Quark};
use crate::backend::history_tree::HistoryTreeBackend;
use crate::error::{Result, StateError};
use crate::htree::HistoryTreeConfig;
use crate::interval::StateInterval;
use crate::value::StateValue;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Default capacity of the insertion queue.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

const WORKER_THREAD_NAME: &str = "statehist-builder";

/// Configuration of the builder worker.
#[derive(Debug, Clone)]
pub struct ThreadedConfig {
    /// Capacity of the insertion queue.
    pub queue_size: usize,
}

impl Default for ThreadedConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl ThreadedConfig {
    /// Sets the queue capacity. Zero makes every insert a rendezvous.
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }
}

type Task = Box<dyn FnOnce(&HistoryTreeBackend) + Send + 'static>;

enum Request {
    Insert(StateInterval),
    Task(Task),
}

#[derive(Debug, Default)]
enum BuildHealth {
    #[default]
    Healthy,
    Failed(StateError),
    Reported,
}

/// History tree backend with an asynchronous builder.
#[derive(Debug)]
pub struct ThreadedHistoryTreeBackend {
    start_time: i64,
    end_time: Arc<AtomicI64>,
    sender: Mutex<Option<Sender<Request>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    health: Arc<Mutex<BuildHealth>>,
}

impl ThreadedHistoryTreeBackend {
    /// Creates the tree file and starts the builder thread.
    pub fn new_for_building(config: HistoryTreeConfig, threaded: ThreadedConfig) -> Result<Self> {
        let start_time = config.start_time;
        let backend = HistoryTreeBackend::new_for_building(config)?;
        let (sender, receiver) = bounded(threaded.queue_size);
        let health = Arc::new(Mutex::new(BuildHealth::Healthy));

        let worker_health = Arc::clone(&health);
        let worker = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || Self::worker_loop(backend, receiver, worker_health))?;
        debug!("Started {} (queue size {})", WORKER_THREAD_NAME, threaded.queue_size);

        Ok(Self {
            start_time,
            end_time: Arc::new(AtomicI64::new(start_time)),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            health,
        })
    }

    /// Worker thread main loop.
    fn worker_loop(
        backend: HistoryTreeBackend,
        receiver: Receiver<Request>,
        health: Arc<Mutex<BuildHealth>>,
    ) {
        for request in receiver.iter() {
            match request {
                Request::Insert(interval) => {
                    if !matches!(*health.lock(), BuildHealth::Healthy) {
                        continue;
                    }
                    if let Err(e) = backend.insert_interval(interval) {
                        warn!("Asynchronous insertion failed: {}", e);
                        *health.lock() = BuildHealth::Failed(e);
                    }
                }
                Request::Task(task) => task(&backend),
            }
        }
        backend.dispose();
        debug!("Stopped {}", WORKER_THREAD_NAME);
    }

    /// Earliest time of the store.
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Latest end time enqueued so far, or the final end once built.
    pub fn end_time(&self) -> i64 {
        self.end_time.load(Ordering::Acquire)
    }

    /// Reports a pending worker failure, once.
    fn check_prior_failure(&self) -> Result<()> {
        let mut health = self.health.lock();
        if matches!(*health, BuildHealth::Failed(_)) {
            if let BuildHealth::Failed(e) = std::mem::replace(&mut *health, BuildHealth::Reported) {
                return Err(StateError::PriorBuildFailure(Box::new(e)));
            }
        }
        Ok(())
    }

    /// Like [`Self::check_prior_failure`], and also rejects building after
    /// a failure was reported.
    fn check_can_build(&self) -> Result<()> {
        self.check_prior_failure()?;
        if matches!(*self.health.lock(), BuildHealth::Reported) {
            return Err(StateError::BuildAborted);
        }
        Ok(())
    }

    fn send(&self, request: Request) -> Result<()> {
        let sender = self.sender.lock().clone().ok_or(StateError::Disposed)?;
        sender.send(request).map_err(|_| StateError::Disposed)
    }

    /// Runs `f` on the worker after every previously enqueued request.
    fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&HistoryTreeBackend) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(Request::Task(Box::new(move |backend: &HistoryTreeBackend| {
            let _ = reply_tx.send(f(backend));
        })))?;
        reply_rx.recv().map_err(|_| StateError::Disposed)?
    }

    /// Enqueues one interval, blocking while the queue is full.
    ///
    /// Errors raised while applying it surface on a later call.
    pub fn insert_past_state(
        &self,
        start: i64,
        end: i64,
        quark: Quark,
        value: StateValue,
    ) -> Result<()> {
        self.check_can_build()?;
        self.send(Request::Insert(StateInterval::new(start, end, quark, value)))?;
        self.end_time.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    /// Drains the queue, then closes the tree.
    pub fn finished_building(&self, end: i64) -> Result<()> {
        self.check_can_build()?;
        let health = Arc::clone(&self.health);
        let result = self.call(move |backend| {
            if !matches!(*health.lock(), BuildHealth::Healthy) {
                return Err(StateError::BuildAborted);
            }
            backend.finished_building(end)?;
            Ok(backend.end_time())
        });
        // A failure raised while draining takes precedence.
        self.check_prior_failure()?;
        let tree_end = result?;
        self.end_time.store(tree_end, Ordering::Release);
        Ok(())
    }

    /// Every interval covering `t`, indexed by quark.
    pub fn do_query(&self, t: i64) -> Result<Vec<Option<StateInterval>>> {
        self.check_prior_failure()?;
        self.call(move |backend| backend.do_query(t))
    }

    /// The interval of `quark` covering `t`.
    pub fn do_singular_query(&self, t: i64, quark: Quark) -> Result<StateInterval> {
        self.check_prior_failure()?;
        self.call(move |backend| backend.do_singular_query(t, quark))
    }

    /// Appends the attribute tree to the finished file.
    pub fn store_attribute_tree(&self, attributes: &AttributeTree) -> Result<()> {
        self.check_prior_failure()?;
        let mut buf = Vec::new();
        attributes.write_to(&mut buf)?;
        self.call(move |backend| {
            let restored = AttributeTree::read_from(&mut buf.as_slice())?;
            backend.store_attribute_tree(&restored)
        })
    }

    /// Reads the attribute tree stored in the file, if any.
    pub fn load_attribute_tree(&self) -> Result<Option<AttributeTree>> {
        self.check_prior_failure()?;
        self.call(|backend| backend.load_attribute_tree())
    }

    /// Stops the worker and releases the file.
    pub fn dispose(&self) {
        // Dropping the sender ends the worker loop once the queue is drained.
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("{} panicked", WORKER_THREAD_NAME);
            }
        }
    }
}

impl Drop for ThreadedHistoryTreeBackend {
    fn drop(&mut self) {
        self.dispose();
    }
}
