//! History tree configuration.

use crate::error::{Result, StateError};
use crate::htree::node::{core_header_size, COMMON_HEADER_SIZE};
use crate::interval::INTERVAL_FIXED_SIZE;
use std::path::{Path, PathBuf};

/// Default size of one node block in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default maximum number of children of a core node.
pub const DEFAULT_MAX_CHILDREN: usize = 50;

/// Default number of closed nodes kept in the read cache.
pub const DEFAULT_NODE_CACHE_SIZE: usize = 256;

/// How the provider version stored in a file is checked on reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderVersionCheck {
    /// The stored version must equal this one.
    Exact(u32),
    /// Accept any version. Meant for inspection tooling only.
    Ignore,
}

/// Configuration of a history tree file.
#[derive(Debug, Clone)]
pub struct HistoryTreeConfig {
    /// Path of the tree file.
    pub path: PathBuf,
    /// Size of each node block in bytes.
    pub block_size: usize,
    /// Maximum number of children per core node.
    pub max_children: usize,
    /// Version of the state provider that produces the intervals.
    pub provider_version: u32,
    /// Earliest time the tree accepts.
    pub start_time: i64,
    /// Number of closed nodes cached in memory for queries.
    pub node_cache_size: usize,
}

impl HistoryTreeConfig {
    /// Creates a configuration with default sizing.
    pub fn new(path: impl AsRef<Path>, provider_version: u32, start_time: i64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            block_size: DEFAULT_BLOCK_SIZE,
            max_children: DEFAULT_MAX_CHILDREN,
            provider_version,
            start_time,
            node_cache_size: DEFAULT_NODE_CACHE_SIZE,
        }
    }

    /// Sets the node block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the maximum number of children per core node.
    pub fn with_max_children(mut self, max_children: usize) -> Self {
        self.max_children = max_children;
        self
    }

    /// Sets the closed-node cache capacity.
    pub fn with_node_cache_size(mut self, node_cache_size: usize) -> Self {
        self.node_cache_size = node_cache_size;
        self
    }

    /// Bytes available for intervals in an empty leaf node.
    pub fn leaf_capacity(&self) -> usize {
        self.block_size.saturating_sub(COMMON_HEADER_SIZE)
    }

    /// Bytes available for intervals in an empty core node.
    pub fn core_capacity(&self) -> usize {
        self.block_size.saturating_sub(core_header_size(self.max_children))
    }

    /// Checks that the sizing is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_children < 2 {
            return Err(StateError::InvalidConfig(format!(
                "max_children must be at least 2, got {}",
                self.max_children
            )));
        }
        if self.max_children > u32::MAX as usize || self.block_size > u32::MAX as usize {
            return Err(StateError::InvalidConfig("tree sizing exceeds u32 range".into()));
        }
        let minimum = core_header_size(self.max_children) + INTERVAL_FIXED_SIZE + 8;
        if self.block_size < minimum {
            return Err(StateError::InvalidConfig(format!(
                "block size {} too small, need at least {minimum}",
                self.block_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_builders() {
        let config = HistoryTreeConfig::new("/tmp/x.ht", 3, 100)
            .with_block_size(4096)
            .with_max_children(8)
            .with_node_cache_size(16);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.max_children, 8);
        assert_eq!(config.node_cache_size, 16);
        assert_eq!(config.provider_version, 3);
        assert_eq!(config.start_time, 100);
        assert!(config.validate().is_ok());

        let defaults = HistoryTreeConfig::new("/tmp/y.ht", 0, 0);
        assert_eq!(defaults.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(defaults.max_children, DEFAULT_MAX_CHILDREN);
        assert!(defaults.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sizing() {
        let config = HistoryTreeConfig::new("/tmp/x.ht", 0, 0).with_max_children(1);
        assert!(config.validate().is_err());

        let config = HistoryTreeConfig::new("/tmp/x.ht", 0, 0).with_block_size(64);
        assert!(config.validate().is_err());
    }
}
