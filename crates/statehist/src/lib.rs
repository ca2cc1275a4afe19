//! Statehist - Alopex State History Store
//!
//! This crate records how the values of a hierarchy of attributes change
//! over time and answers "what was the value of X at time t" queries.
//!
//! # Components
//!
//! - [`AttributeTree`]: Hierarchical attribute names mapped to quarks
//! - [`StateSystem`]: Building and querying façade with ongoing state
//! - [`Backend`]: In-memory, history tree and threaded interval stores
//! - [`HistoryTree`]: Disk-backed, append-only node file
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_statehist::{HistoryTreeBackend, HistoryTreeConfig, StateSystem, StateValue};
//!
//! let config = HistoryTreeConfig::new("trace.ht", 1, start_ts);
//! let ss = StateSystem::new(HistoryTreeBackend::new_for_building(config)?);
//!
//! // Resolve attribute paths once, then report state changes
//! let cpu0 = ss.quark_absolute_and_add(&["CPUs", "0", "Status"])?;
//! ss.modify_attribute(ts, StateValue::from("running"), cpu0)?;
//!
//! // Commit everything and persist the attribute tree
//! ss.close_history(end_ts)?;
//!
//! let interval = ss.query_single_state(ts, cpu0)?;
//! ```

#![deny(missing_docs)]

pub mod attribute;
pub mod backend;
pub mod error;
pub mod htree;
pub mod interval;
pub mod state_system;
pub mod transient;
pub mod value;

pub use attribute::{AttributeTree, Quark};
pub use backend::{
    Backend, CancelFlag, HistoryTreeBackend, InMemoryBackend, ThreadedConfig,
    ThreadedHistoryTreeBackend,
};
pub use error::{Result, StateError};
pub use htree::{HistoryTree, HistoryTreeConfig, ProviderVersionCheck};
pub use interval::StateInterval;
pub use state_system::StateSystem;
pub use value::StateValue;
