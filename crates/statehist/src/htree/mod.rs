//! Disk-backed history tree.
//!
//! This module provides the node-structured, append-only interval file used
//! by the history tree backends:
//!
//! - [`HistoryTreeConfig`]: file location, block geometry and provider version
//! - [`HtNode`]: core and leaf nodes with their block encoding
//! - [`HtIo`]: block I/O with a cache of closed nodes
//! - [`HistoryTree`]: insertion, node splitting, depth growth and queries

pub mod config;
pub mod io;
pub mod node;
pub mod tree;

pub use config::{
    HistoryTreeConfig, ProviderVersionCheck, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_CHILDREN,
    DEFAULT_NODE_CACHE_SIZE,
};
pub use io::HtIo;
pub use node::{ChildRef, HtNode, NodeKind};
pub use tree::{HistoryTree, TreeHeader, HISTORY_TREE_MAGIC, TREE_HEADER_SIZE};
