//! The history tree: an append-only, node-structured interval file.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Tree Header (TREE_HEADER_SIZE = 4096 bytes, zero padded)    │
//! │  - Magic: u32 = 0x05FFA900                                   │
//! │  - File version: u32                                         │
//! │  - Provider version: u32                                     │
//! │  - Block size: u32                                           │
//! │  - Max children: u32                                         │
//! │  - Node count: u32                                           │
//! │  - Root sequence number: u32                                 │
//! │  - Tree start: i64                                           │
//! │  - Tree end: i64                                             │
//! │  - Header CRC32: u32                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Node blocks, one per sequence number                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Trailing metadata (optional, e.g. attribute tree)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Insertion
//!
//! Intervals are inserted into the open nodes of the *latest branch*, the
//! path from the root to the newest leaf. An interval goes to the deepest
//! node of that branch whose start does not exceed the interval's start.
//! When that node is full, it is closed together with everything below it
//! and replaced by fresh siblings. If the parent has no room for another
//! child, the split moves one level up; if the root itself is full, a new
//! root is created and the tree grows one level deeper.

use crate::attribute::Quark;
use crate::error::{Result, StateError};
use crate::htree::config::{HistoryTreeConfig, ProviderVersionCheck};
use crate::htree::io::HtIo;
use crate::htree::node::{ChildRef, HtNode};
use crate::interval::{StateInterval, MAX_INTERVAL_SIZE};
use parking_lot::RwLock;
use std::fmt;
use std::io::{Read, Write};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Magic number at the start of every history tree file.
pub const HISTORY_TREE_MAGIC: u32 = 0x05FF_A900;

/// Current file format version.
pub const FILE_VERSION: u32 = 1;

/// Space reserved for the tree header.
pub const TREE_HEADER_SIZE: usize = 4096;

/// Encoded size of [`TreeHeader`].
pub const TREE_HEADER_ENCODED_SIZE: usize = 48;

/// Header of a history tree file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    /// Version of the state provider.
    pub provider_version: u32,
    /// Node block size in bytes.
    pub block_size: u32,
    /// Maximum children per core node.
    pub max_children: u32,
    /// Number of nodes in the file.
    pub node_count: u32,
    /// Sequence number of the root node.
    pub root_seq: u32,
    /// Earliest time covered by the tree.
    pub start_time: i64,
    /// Latest time covered by the tree.
    pub end_time: i64,
}

impl TreeHeader {
    /// Writes the header.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(TREE_HEADER_ENCODED_SIZE);

        // Magic (4 bytes)
        buf.extend_from_slice(&HISTORY_TREE_MAGIC.to_le_bytes());

        // File version (4 bytes)
        buf.extend_from_slice(&FILE_VERSION.to_le_bytes());

        // Provider version (4 bytes)
        buf.extend_from_slice(&self.provider_version.to_le_bytes());

        // Geometry (8 bytes)
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.max_children.to_le_bytes());

        // Node count and root (8 bytes)
        buf.extend_from_slice(&self.node_count.to_le_bytes());
        buf.extend_from_slice(&self.root_seq.to_le_bytes());

        // Time range (16 bytes)
        buf.extend_from_slice(&self.start_time.to_le_bytes());
        buf.extend_from_slice(&self.end_time.to_le_bytes());

        // CRC32 (4 bytes)
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        writer.write_all(&buf)?;
        Ok(())
    }

    /// Reads and validates a header.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; TREE_HEADER_ENCODED_SIZE];
        reader.read_exact(&mut buf)?;

        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != HISTORY_TREE_MAGIC {
            return Err(StateError::InvalidMagic(magic));
        }

        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != FILE_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }

        let expected = u32::from_le_bytes(buf[44..48].try_into().unwrap());
        let actual = crc32fast::hash(&buf[..44]);
        if expected != actual {
            return Err(StateError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            provider_version: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            block_size: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            max_children: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            node_count: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            root_seq: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            start_time: i64::from_le_bytes(buf[28..36].try_into().unwrap()),
            end_time: i64::from_le_bytes(buf[36..44].try_into().unwrap()),
        })
    }
}

#[derive(Debug)]
struct TreeState {
    latest_branch: Vec<HtNode>,
    node_count: u32,
    tree_end: i64,
    closed: bool,
    /// Set when a split or close failed half-way; the branch is unusable.
    failed: bool,
}

impl TreeState {
    fn branch_node(&self, seq: u32) -> Option<&HtNode> {
        self.latest_branch.iter().find(|node| node.seq() == seq)
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.node_count;
        self.node_count += 1;
        seq
    }
}

/// A node borrowed from the latest branch or shared from the node cache.
enum NodeRef<'a> {
    Branch(&'a HtNode),
    Stored(Arc<HtNode>),
}

impl Deref for NodeRef<'_> {
    type Target = HtNode;

    fn deref(&self) -> &HtNode {
        match self {
            NodeRef::Branch(node) => node,
            NodeRef::Stored(node) => node,
        }
    }
}

/// Disk-backed interval tree.
///
/// Inserts take the write side of the latest-branch lock; queries take the
/// read side and fetch closed nodes through the node cache.
#[derive(Debug)]
pub struct HistoryTree {
    config: HistoryTreeConfig,
    io: HtIo,
    state: RwLock<TreeState>,
}

impl HistoryTree {
    /// Creates a new, empty tree file.
    pub fn create(config: HistoryTreeConfig) -> Result<Self> {
        config.validate()?;
        let io = HtIo::create(
            &config.path,
            config.block_size,
            config.max_children,
            config.node_cache_size,
        )?;
        let root = HtNode::new_leaf(0, None, config.start_time, config.block_size);
        debug!(
            "New history tree: block_size={}, max_children={}, start={}",
            config.block_size, config.max_children, config.start_time
        );

        let state = TreeState {
            latest_branch: vec![root],
            node_count: 1,
            tree_end: config.start_time,
            closed: false,
            failed: false,
        };
        Ok(Self {
            config,
            io,
            state: RwLock::new(state),
        })
    }

    /// Reopens a finished tree file.
    pub fn open(path: &Path, check: ProviderVersionCheck, node_cache_size: usize) -> Result<Self> {
        let mut io = HtIo::open(path, node_cache_size)?;

        let mut raw = [0u8; TREE_HEADER_ENCODED_SIZE];
        io.read_at(0, &mut raw)?;
        let header = TreeHeader::read_from(&mut raw.as_slice())?;

        if let ProviderVersionCheck::Exact(expected) = check {
            if header.provider_version != expected {
                return Err(StateError::ProviderVersionMismatch {
                    expected,
                    actual: header.provider_version,
                });
            }
        }

        let config = HistoryTreeConfig {
            path: path.to_path_buf(),
            block_size: header.block_size as usize,
            max_children: header.max_children as usize,
            provider_version: header.provider_version,
            start_time: header.start_time,
            node_cache_size,
        };
        config.validate()?;
        if header.root_seq >= header.node_count {
            return Err(StateError::Corrupted(format!(
                "root {} beyond node count {}",
                header.root_seq, header.node_count
            )));
        }
        io.set_geometry(config.block_size, config.max_children);

        let latest_branch = Self::rebuild_latest_branch(&io, header.root_seq)?;
        if latest_branch[0].start() != header.start_time {
            return Err(StateError::Corrupted(format!(
                "root starts at {}, header says {}",
                latest_branch[0].start(),
                header.start_time
            )));
        }

        debug!(
            "Opened history tree {}: {} nodes, range [{}, {}]",
            path.display(),
            header.node_count,
            header.start_time,
            header.end_time
        );

        let state = TreeState {
            latest_branch,
            node_count: header.node_count,
            tree_end: header.end_time,
            closed: true,
            failed: false,
        };
        Ok(Self {
            config,
            io,
            state: RwLock::new(state),
        })
    }

    fn rebuild_latest_branch(io: &HtIo, root_seq: u32) -> Result<Vec<HtNode>> {
        let mut branch = vec![io.read_node(root_seq)?.as_ref().clone()];
        while let Some(last) = branch.last().and_then(|node| node.children().last()) {
            let child = io.read_node(last.seq)?;
            branch.push(child.as_ref().clone());
        }
        Ok(branch)
    }

    /// Configuration of this tree.
    pub fn config(&self) -> &HistoryTreeConfig {
        &self.config
    }

    /// Earliest time covered by the tree.
    pub fn start_time(&self) -> i64 {
        self.config.start_time
    }

    /// Latest end time inserted so far (or fixed at close).
    pub fn end_time(&self) -> i64 {
        self.state.read().tree_end
    }

    /// Number of nodes allocated so far.
    pub fn node_count(&self) -> u32 {
        self.state.read().node_count
    }

    /// Number of levels, i.e. the length of the latest branch.
    pub fn depth(&self) -> usize {
        self.state.read().latest_branch.len()
    }

    /// Sequence number of the root.
    pub fn root_seq(&self) -> u32 {
        self.state.read().latest_branch[0].seq()
    }

    /// Sequence numbers of the latest branch, root first.
    pub fn latest_branch_seqs(&self) -> Vec<u32> {
        self.state
            .read()
            .latest_branch
            .iter()
            .map(HtNode::seq)
            .collect()
    }

    /// Returns true once the tree has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Returns a copy of node `seq`, open or closed.
    pub fn read_node(&self, seq: u32) -> Result<HtNode> {
        let state = self.state.read();
        Ok(self.node_ref(&state, seq)?.deref().clone())
    }

    fn node_ref<'a>(&self, state: &'a TreeState, seq: u32) -> Result<NodeRef<'a>> {
        if seq >= state.node_count {
            return Err(StateError::Corrupted(format!(
                "node {seq} does not exist ({} nodes)",
                state.node_count
            )));
        }
        match state.branch_node(seq) {
            Some(node) => Ok(NodeRef::Branch(node)),
            None => Ok(NodeRef::Stored(self.io.read_node(seq)?)),
        }
    }

    /// Inserts one interval.
    pub fn insert(&self, interval: StateInterval) -> Result<()> {
        if interval.start() > interval.end() {
            return Err(StateError::InvalidInterval {
                start: interval.start(),
                end: interval.end(),
            });
        }
        let capacity = self.config.core_capacity().min(MAX_INTERVAL_SIZE);
        if interval.size_on_disk() > capacity {
            return Err(StateError::IntervalTooLarge {
                size: interval.size_on_disk(),
                capacity,
            });
        }

        let mut state = self.state.write();
        if state.closed {
            return Err(StateError::BuildingFinished);
        }
        if state.failed {
            return Err(StateError::BuildAborted);
        }
        if interval.start() < self.config.start_time {
            return Err(StateError::TimeRange {
                time: interval.start(),
                start: self.config.start_time,
                end: state.tree_end,
            });
        }

        let mut index = state.latest_branch.len() - 1;
        loop {
            let node = &state.latest_branch[index];
            if interval.size_on_disk() > node.free_space() {
                if let Err(e) = self.add_sibling(&mut state, index) {
                    warn!("History tree split failed, aborting build: {}", e);
                    state.failed = true;
                    return Err(e);
                }
                index = state.latest_branch.len() - 1;
            } else if interval.start() < node.start() {
                // Belongs to an ancestor; the root always starts at the tree start.
                index = index.checked_sub(1).ok_or_else(|| {
                    StateError::Corrupted("interval starts before the root node".into())
                })?;
            } else {
                state.tree_end = state.tree_end.max(interval.end());
                state.latest_branch[index].add_interval(interval);
                return Ok(());
            }
        }
    }

    /// Closes the node at `index` and everything below it, replacing them
    /// with fresh siblings.
    fn add_sibling(&self, state: &mut TreeState, index: usize) -> Result<()> {
        if index == 0 {
            return self.add_new_root(state);
        }
        if state.latest_branch[index - 1].is_full_of_children() {
            return self.add_sibling(state, index - 1);
        }

        let split_time = state.tree_end;
        for i in index..state.latest_branch.len() {
            state.latest_branch[i].close(split_time);
            self.io.write_node(&state.latest_branch[i])?;

            let seq = state.next_seq();
            let parent_seq = state.latest_branch[i - 1].seq();
            let sibling = state.latest_branch[i].new_sibling(seq, Some(parent_seq), split_time + 1);
            state.latest_branch[i - 1].link_child(ChildRef {
                seq,
                start: split_time + 1,
            })?;
            state.latest_branch[i] = sibling;
        }

        debug!(
            "Split history tree at level {} (time {}), {} nodes",
            index, split_time, state.node_count
        );
        Ok(())
    }

    /// Installs a new root above the current one and rebuilds the latest
    /// branch one level deeper.
    fn add_new_root(&self, state: &mut TreeState) -> Result<()> {
        let split_time = state.tree_end;
        let depth = state.latest_branch.len();

        let old_root_seq = state.latest_branch[0].seq();
        let old_root_start = state.latest_branch[0].start();
        let new_root_seq = state.next_seq();
        let mut new_root = HtNode::new_core(
            new_root_seq,
            None,
            self.config.start_time,
            self.config.block_size,
            self.config.max_children,
        );

        state.latest_branch[0].set_parent_seq(new_root_seq);
        for node in state.latest_branch.iter_mut() {
            node.close(split_time);
            self.io.write_node(node)?;
        }
        new_root.link_child(ChildRef {
            seq: old_root_seq,
            start: old_root_start,
        })?;

        let mut branch = Vec::with_capacity(depth + 1);
        branch.push(new_root);
        for level in 1..=depth {
            let seq = state.next_seq();
            let parent = &mut branch[level - 1];
            parent.link_child(ChildRef {
                seq,
                start: split_time + 1,
            })?;
            let parent_seq = Some(parent.seq());
            let node = if level == depth {
                HtNode::new_leaf(seq, parent_seq, split_time + 1, self.config.block_size)
            } else {
                HtNode::new_core(
                    seq,
                    parent_seq,
                    split_time + 1,
                    self.config.block_size,
                    self.config.max_children,
                )
            };
            branch.push(node);
        }
        state.latest_branch = branch;

        debug!(
            "History tree grew to depth {} at time {}, new root {}",
            depth + 1,
            split_time,
            new_root_seq
        );
        Ok(())
    }

    /// Closes every open node at `max(end, tree end)` and writes the header.
    ///
    /// Returns the file offset right after the last node block, where
    /// trailing metadata may be appended.
    pub fn close(&self, end: i64) -> Result<u64> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StateError::BuildingFinished);
        }
        if state.failed {
            return Err(StateError::BuildAborted);
        }
        match self.write_closed_tree(&mut state, end) {
            Ok(offset) => Ok(offset),
            Err(e) => {
                warn!("History tree close failed, aborting build: {}", e);
                state.failed = true;
                Err(e)
            }
        }
    }

    fn write_closed_tree(&self, state: &mut TreeState, end: i64) -> Result<u64> {
        state.tree_end = state.tree_end.max(end);
        let tree_end = state.tree_end;

        for node in state.latest_branch.iter_mut() {
            node.close(tree_end);
            self.io.write_node(node)?;
        }

        let header = TreeHeader {
            provider_version: self.config.provider_version,
            block_size: self.config.block_size as u32,
            max_children: self.config.max_children as u32,
            node_count: state.node_count,
            root_seq: state.latest_branch[0].seq(),
            start_time: self.config.start_time,
            end_time: tree_end,
        };
        let mut buf = Vec::with_capacity(TREE_HEADER_ENCODED_SIZE);
        header.write_to(&mut buf)?;
        self.io.write_at(0, &buf)?;
        self.io.sync()?;
        state.closed = true;

        debug!(
            "Closed history tree {}: {} nodes, depth {}, range [{}, {}]",
            self.config.path.display(),
            state.node_count,
            state.latest_branch.len(),
            self.config.start_time,
            tree_end
        );
        Ok(self.io.node_offset(state.node_count))
    }

    /// Offset right after the last node block.
    pub fn trailer_offset(&self) -> u64 {
        self.io.node_offset(self.state.read().node_count)
    }

    /// Appends trailing metadata after the node blocks of a closed tree.
    pub fn write_trailer(&self, data: &[u8]) -> Result<()> {
        let state = self.state.read();
        if !state.closed {
            return Err(StateError::Corrupted(
                "trailer can only be written to a closed tree".into(),
            ));
        }
        self.io.write_at(self.io.node_offset(state.node_count), data)?;
        self.io.sync()
    }

    /// Reads the trailing metadata, if any.
    pub fn read_trailer(&self) -> Result<Option<Vec<u8>>> {
        let data = self.io.read_from_offset(self.trailer_offset())?;
        Ok((!data.is_empty()).then_some(data))
    }

    /// Size of the tree file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        self.io.file_size()
    }

    /// Returns the interval of `quark` covering `t`, searching every node
    /// on the descent from the root.
    pub fn query_single(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>> {
        let state = self.state.read();
        let mut node = NodeRef::Branch(&state.latest_branch[0]);
        loop {
            if let Some(interval) = node.relevant_interval(quark, t) {
                return Ok(Some(interval.clone()));
            }
            match node.select_next_child(t) {
                Some(seq) => node = self.node_ref(&state, seq)?,
                None => return Ok(None),
            }
        }
    }

    /// Fills `state_info` (indexed by quark) with every interval covering
    /// `t`, in one descent.
    pub fn query_full(&self, t: i64, state_info: &mut Vec<Option<StateInterval>>) -> Result<()> {
        let state = self.state.read();
        let mut node = NodeRef::Branch(&state.latest_branch[0]);
        loop {
            node.write_info(state_info, t);
            match node.select_next_child(t) {
                Some(seq) => node = self.node_ref(&state, seq)?,
                None => return Ok(()),
            }
        }
    }

    /// Releases the file handle.
    pub fn close_file(&self) {
        self.io.close();
    }

    /// Releases the file handle and deletes the file.
    pub fn delete_file(&self) -> Result<()> {
        self.io.delete()
    }
}

impl fmt::Display for HistoryTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        writeln!(
            f,
            "History tree {}: {} nodes, depth {}, range [{}, {}], latest branch {:?}",
            self.config.path.display(),
            state.node_count,
            state.latest_branch.len(),
            self.config.start_time,
            state.tree_end,
            state.latest_branch.iter().map(HtNode::seq).collect::<Vec<_>>()
        )?;
        for seq in 0..state.node_count {
            let node = self.node_ref(&state, seq).map_err(|_| fmt::Error)?;
            let end = node
                .end()
                .map_or_else(|| "open".to_string(), |end| end.to_string());
            writeln!(
                f,
                "  {} node {} (parent {:?}): [{}, {}], {} intervals, {} children, {} bytes free",
                if node.is_leaf() { "leaf" } else { "core" },
                node.seq(),
                node.parent_seq(),
                node.start(),
                end,
                node.intervals().len(),
                node.children().len(),
                node.free_space()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StateValue;
    use tempfile::TempDir;

    fn small_tree(dir: &TempDir, max_children: usize) -> HistoryTree {
        let config = HistoryTreeConfig::new(dir.path().join("test.ht"), 1, 0)
            .with_block_size(256)
            .with_max_children(max_children);
        HistoryTree::create(config).unwrap()
    }

    #[test]
    fn test_header_validation() {
        let header = TreeHeader {
            provider_version: 4,
            block_size: 4096,
            max_children: 10,
            node_count: 3,
            root_seq: 1,
            start_time: -5,
            end_time: 500,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), TREE_HEADER_ENCODED_SIZE);
        assert_eq!(TreeHeader::read_from(&mut buf.as_slice()).unwrap(), header);

        let mut bad_magic = buf.clone();
        bad_magic[0] = 0;
        assert!(matches!(
            TreeHeader::read_from(&mut bad_magic.as_slice()),
            Err(StateError::InvalidMagic(_))
        ));

        let mut bad_version = buf.clone();
        bad_version[4] = 99;
        assert!(matches!(
            TreeHeader::read_from(&mut bad_version.as_slice()),
            Err(StateError::UnsupportedVersion(99))
        ));

        let mut bad_crc = buf;
        bad_crc[30] ^= 0x10;
        assert!(matches!(
            TreeHeader::read_from(&mut bad_crc.as_slice()),
            Err(StateError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_insert_and_query_in_root_leaf() {
        let dir = TempDir::new().unwrap();
        let tree = small_tree(&dir, 3);
        tree.insert(StateInterval::new(0, 9, 0, StateValue::Int(1))).unwrap();
        tree.insert(StateInterval::new(0, 14, 1, StateValue::Int(2))).unwrap();

        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.end_time(), 14);
        let found = tree.query_single(5, 1).unwrap().unwrap();
        assert_eq!(found.value(), &StateValue::Int(2));
        assert!(tree.query_single(12, 0).unwrap().is_none());
    }

    #[test]
    fn test_insert_validation() {
        let dir = TempDir::new().unwrap();
        let config = HistoryTreeConfig::new(dir.path().join("v.ht"), 1, 100)
            .with_block_size(256)
            .with_max_children(4);
        let tree = HistoryTree::create(config).unwrap();

        assert!(matches!(
            tree.insert(StateInterval::new(50, 150, 0, StateValue::Null)),
            Err(StateError::TimeRange { time: 50, .. })
        ));
        assert!(matches!(
            tree.insert(StateInterval::new(150, 120, 0, StateValue::Null)),
            Err(StateError::InvalidInterval { .. })
        ));
        let huge = StateValue::String("x".repeat(1000));
        assert!(matches!(
            tree.insert(StateInterval::new(100, 120, 0, huge)),
            Err(StateError::IntervalTooLarge { .. })
        ));
    }

    #[test]
    fn test_string_beyond_length_field_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.ht");
        let config = HistoryTreeConfig::new(&path, 1, 0)
            .with_block_size(1 << 20)
            .with_max_children(4);
        let tree = HistoryTree::create(config).unwrap();

        let too_long = StateValue::String("x".repeat(70_000));
        assert!(matches!(
            tree.insert(StateInterval::new(0, 10, 0, too_long)),
            Err(StateError::IntervalTooLarge { capacity: MAX_INTERVAL_SIZE, .. })
        ));
        assert_eq!(tree.end_time(), 0);

        let longest = "y".repeat(u16::MAX as usize);
        tree.insert(StateInterval::new(0, 10, 0, StateValue::String(longest.clone())))
            .unwrap();

        // Force the leaf holding the long string to be written out.
        let mut t = 11;
        while tree.node_count() == 1 {
            tree.insert(StateInterval::new(t, t, 1, StateValue::Int(1))).unwrap();
            t += 1;
        }
        tree.close(t).unwrap();

        let reopened = HistoryTree::open(&path, ProviderVersionCheck::Ignore, 0).unwrap();
        let found = reopened.query_single(5, 0).unwrap().unwrap();
        assert_eq!(found.value().unbox_str().unwrap(), longest);
    }

    #[test]
    fn test_failed_split_aborts_the_build() {
        let dir = TempDir::new().unwrap();
        let tree = small_tree(&dir, 3);
        tree.insert(StateInterval::new(0, 9, 0, StateValue::Int(1))).unwrap();
        tree.close_file();

        let mut failure = None;
        for i in 1..100 {
            let interval = StateInterval::new(i * 10, i * 10 + 9, 0, StateValue::Long(i));
            if let Err(e) = tree.insert(interval) {
                failure = Some(e);
                break;
            }
        }
        assert!(matches!(failure, Some(StateError::Disposed)));

        assert!(matches!(
            tree.insert(StateInterval::new(5000, 5009, 0, StateValue::Null)),
            Err(StateError::BuildAborted)
        ));
        assert!(matches!(tree.close(6000), Err(StateError::BuildAborted)));
        assert!(!tree.is_closed());
    }

    #[test]
    fn test_failed_close_aborts_the_build() {
        let dir = TempDir::new().unwrap();
        let tree = small_tree(&dir, 3);
        tree.insert(StateInterval::new(0, 9, 0, StateValue::Int(1))).unwrap();
        tree.close_file();

        assert!(matches!(tree.close(20), Err(StateError::Disposed)));
        assert!(matches!(tree.close(20), Err(StateError::BuildAborted)));
        assert!(matches!(
            tree.insert(StateInterval::new(10, 19, 0, StateValue::Null)),
            Err(StateError::BuildAborted)
        ));
    }

    #[test]
    fn test_early_start_goes_to_ancestor() {
        let dir = TempDir::new().unwrap();
        let tree = small_tree(&dir, 3);

        // Fill the root leaf with short intervals on attribute 0.
        let mut t = 0;
        while tree.node_count() == 1 {
            tree.insert(StateInterval::new(t, t + 1, 0, StateValue::Int(0))).unwrap();
            t += 2;
        }
        assert_eq!(tree.depth(), 2);

        // Attribute 1 has been constant since time 0: its interval belongs in the root.
        tree.insert(StateInterval::new(0, t + 5, 1, StateValue::Int(7))).unwrap();
        let root = tree.read_node(tree.root_seq()).unwrap();
        assert_eq!(root.intervals().len(), 1);

        let found = tree.query_single(1, 1).unwrap().unwrap();
        assert_eq!(found.value(), &StateValue::Int(7));
    }

    #[test]
    fn test_close_rejects_further_inserts() {
        let dir = TempDir::new().unwrap();
        let tree = small_tree(&dir, 3);
        tree.insert(StateInterval::new(0, 9, 0, StateValue::Int(1))).unwrap();
        let offset = tree.close(20).unwrap();

        assert_eq!(tree.end_time(), 20);
        assert_eq!(offset, (TREE_HEADER_SIZE + 256) as u64);
        assert!(matches!(
            tree.insert(StateInterval::new(21, 30, 0, StateValue::Null)),
            Err(StateError::BuildingFinished)
        ));
        assert!(matches!(tree.close(30), Err(StateError::BuildingFinished)));
    }

    #[test]
    fn test_display_lists_every_node() {
        let dir = TempDir::new().unwrap();
        let tree = small_tree(&dir, 2);
        for i in 0..40 {
            tree.insert(StateInterval::new(i * 10, i * 10 + 9, 0, StateValue::Long(i)))
                .unwrap();
        }
        let text = tree.to_string();
        assert_eq!(text.lines().count(), tree.node_count() as usize + 1);
    }
}
