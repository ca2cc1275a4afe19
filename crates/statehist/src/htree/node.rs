//! History tree nodes.
//!
//! A node is a fixed-size block holding intervals. Leaf nodes only hold
//! intervals; core nodes additionally hold references to their children,
//! whose time ranges partition the core node's range.
//!
//! ## Block Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Common Header (34 bytes)                                    │
//! │  - Kind: u8 (1 = core, 2 = leaf)                             │
//! │  - Node start: i64 (8 bytes)                                 │
//! │  - Node end: i64 (8 bytes)                                   │
//! │  - Sequence number: u32 (4 bytes)                            │
//! │  - Parent sequence number: u32 (u32::MAX for the root)       │
//! │  - Interval count: u32 (4 bytes)                             │
//! │  - Closed flag: u8 (1 byte)                                  │
//! │  - Block CRC32: u32 (4 bytes, computed with this field = 0)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Core Header (core nodes only)                               │
//! │  - Child count: u32 (4 bytes)                                │
//! │  - max_children × (child seq: u32, child start: i64)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Intervals, sorted by end time                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Zero padding up to the block size                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::attribute::Quark;
use crate::error::{Result, StateError};
use crate::interval::StateInterval;

/// Size of the header shared by all node kinds.
pub const COMMON_HEADER_SIZE: usize = 34;

/// Kind byte of a core node.
pub const NODE_KIND_CORE: u8 = 1;

/// Kind byte of a leaf node.
pub const NODE_KIND_LEAF: u8 = 2;

const NO_PARENT: u32 = u32::MAX;
const CRC_OFFSET: usize = 30;
const CHILD_ENTRY_SIZE: usize = 12;

/// Header size of a core node able to hold `max_children` children.
pub fn core_header_size(max_children: usize) -> usize {
    COMMON_HEADER_SIZE + 4 + max_children * CHILD_ENTRY_SIZE
}

/// Reference from a core node to one of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRef {
    /// Sequence number of the child.
    pub seq: u32,
    /// Start time of the child's range.
    pub start: i64,
}

/// Kind-specific part of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Inner node with ordered children.
    Core {
        /// Children in time order.
        children: Vec<ChildRef>,
        /// Capacity of the child table.
        max_children: usize,
    },
    /// Leaf node.
    Leaf,
}

/// One node of the history tree.
#[derive(Debug, Clone)]
pub struct HtNode {
    kind: NodeKind,
    seq: u32,
    parent_seq: Option<u32>,
    start: i64,
    end: Option<i64>,
    intervals: Vec<StateInterval>,
    data_size: usize,
    block_size: usize,
}

impl HtNode {
    /// Creates an open leaf node.
    pub fn new_leaf(seq: u32, parent_seq: Option<u32>, start: i64, block_size: usize) -> Self {
        Self::with_kind(NodeKind::Leaf, seq, parent_seq, start, block_size)
    }

    /// Creates an open core node.
    pub fn new_core(
        seq: u32,
        parent_seq: Option<u32>,
        start: i64,
        block_size: usize,
        max_children: usize,
    ) -> Self {
        let kind = NodeKind::Core {
            children: Vec::with_capacity(max_children),
            max_children,
        };
        Self::with_kind(kind, seq, parent_seq, start, block_size)
    }

    /// Creates an empty open node of the same kind as `self`.
    pub fn new_sibling(&self, seq: u32, parent_seq: Option<u32>, start: i64) -> Self {
        match &self.kind {
            NodeKind::Leaf => Self::new_leaf(seq, parent_seq, start, self.block_size),
            NodeKind::Core { max_children, .. } => {
                Self::new_core(seq, parent_seq, start, self.block_size, *max_children)
            }
        }
    }

    fn with_kind(
        kind: NodeKind,
        seq: u32,
        parent_seq: Option<u32>,
        start: i64,
        block_size: usize,
    ) -> Self {
        Self {
            kind,
            seq,
            parent_seq,
            start,
            end: None,
            intervals: Vec::new(),
            data_size: 0,
            block_size,
        }
    }

    /// Sequence number (stable identity of the node).
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Parent sequence number, `None` for the root.
    pub fn parent_seq(&self) -> Option<u32> {
        self.parent_seq
    }

    /// Re-parents the node. Only valid while it is open.
    pub fn set_parent_seq(&mut self, parent_seq: u32) {
        debug_assert!(!self.is_closed());
        self.parent_seq = Some(parent_seq);
    }

    /// Start of the node's range.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// End of the node's range, once closed.
    pub fn end(&self) -> Option<i64> {
        self.end
    }

    /// Returns true once the node has been closed.
    pub fn is_closed(&self) -> bool {
        self.end.is_some()
    }

    /// Returns true for leaf nodes.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf)
    }

    /// Kind-specific data.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Intervals stored in this node, sorted by end time.
    pub fn intervals(&self) -> &[StateInterval] {
        &self.intervals
    }

    /// Children of a core node; empty for leaves.
    pub fn children(&self) -> &[ChildRef] {
        match &self.kind {
            NodeKind::Core { children, .. } => children,
            NodeKind::Leaf => &[],
        }
    }

    /// Returns true if a core node cannot take another child.
    pub fn is_full_of_children(&self) -> bool {
        match &self.kind {
            NodeKind::Core {
                children,
                max_children,
            } => children.len() >= *max_children,
            NodeKind::Leaf => true,
        }
    }

    fn header_size(&self) -> usize {
        match &self.kind {
            NodeKind::Core { max_children, .. } => core_header_size(*max_children),
            NodeKind::Leaf => COMMON_HEADER_SIZE,
        }
    }

    /// Bytes still available for intervals.
    pub fn free_space(&self) -> usize {
        self.block_size.saturating_sub(self.header_size() + self.data_size)
    }

    /// Adds an interval, keeping intervals sorted by end time.
    ///
    /// The caller checks [`HtNode::free_space`] first.
    pub fn add_interval(&mut self, interval: StateInterval) {
        debug_assert!(!self.is_closed());
        debug_assert!(interval.size_on_disk() <= self.free_space());
        self.data_size += interval.size_on_disk();
        let pos = self
            .intervals
            .partition_point(|existing| existing.end() <= interval.end());
        self.intervals.insert(pos, interval);
    }

    /// Appends a child reference to a core node.
    pub fn link_child(&mut self, child: ChildRef) -> Result<()> {
        match &mut self.kind {
            NodeKind::Core {
                children,
                max_children,
            } if children.len() < *max_children => {
                children.push(child);
                Ok(())
            }
            NodeKind::Core { .. } => Err(StateError::Corrupted(format!(
                "core node {} has no room for child {}",
                self.seq, child.seq
            ))),
            NodeKind::Leaf => Err(StateError::Corrupted(format!(
                "cannot link child {} to leaf node {}",
                child.seq, self.seq
            ))),
        }
    }

    /// Closes the node at `end`. A node never ends before it starts.
    pub fn close(&mut self, end: i64) {
        debug_assert!(!self.is_closed());
        self.end = Some(end.max(self.start));
    }

    /// Picks the child whose range contains `t`: the last child starting at
    /// or before `t`. Returns `None` for leaves.
    pub fn select_next_child(&self, t: i64) -> Option<u32> {
        let children = self.children();
        let idx = children.partition_point(|child| child.start <= t);
        if idx == 0 {
            children.first().map(|child| child.seq)
        } else {
            Some(children[idx - 1].seq)
        }
    }

    /// The interval of `quark` covering `t`, if this node holds it.
    pub fn relevant_interval(&self, quark: Quark, t: i64) -> Option<&StateInterval> {
        let first = self.intervals.partition_point(|iv| iv.end() < t);
        self.intervals[first..]
            .iter()
            .find(|iv| iv.attribute() == quark && iv.start() <= t)
    }

    /// Fills `state_info` with every interval of this node covering `t`.
    ///
    /// Slots are indexed by quark; the vector grows as needed.
    pub fn write_info(&self, state_info: &mut Vec<Option<StateInterval>>, t: i64) {
        let first = self.intervals.partition_point(|iv| iv.end() < t);
        for interval in self.intervals[first..].iter().filter(|iv| iv.start() <= t) {
            let slot = interval.attribute() as usize;
            if slot >= state_info.len() {
                state_info.resize(slot + 1, None);
            }
            state_info[slot] = Some(interval.clone());
        }
    }

    /// Encodes the node into one block of `block_size` bytes.
    pub fn to_block(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.block_size);

        // Common header (34 bytes)
        let kind = match self.kind {
            NodeKind::Core { .. } => NODE_KIND_CORE,
            NodeKind::Leaf => NODE_KIND_LEAF,
        };
        buf.push(kind);
        buf.extend_from_slice(&self.start.to_le_bytes());
        buf.extend_from_slice(&self.end.unwrap_or(self.start).to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.parent_seq.unwrap_or(NO_PARENT).to_le_bytes());
        buf.extend_from_slice(&(self.intervals.len() as u32).to_le_bytes());
        buf.push(u8::from(self.is_closed()));
        buf.extend_from_slice(&0u32.to_le_bytes());

        // Core header
        if let NodeKind::Core {
            children,
            max_children,
        } = &self.kind
        {
            buf.extend_from_slice(&(children.len() as u32).to_le_bytes());
            for i in 0..*max_children {
                let child = children.get(i).copied().unwrap_or(ChildRef { seq: 0, start: 0 });
                buf.extend_from_slice(&child.seq.to_le_bytes());
                buf.extend_from_slice(&child.start.to_le_bytes());
            }
        }

        for interval in &self.intervals {
            interval.write_to(&mut buf)?;
        }

        if buf.len() > self.block_size {
            return Err(StateError::Corrupted(format!(
                "node {} overflows its block: {} > {}",
                self.seq,
                buf.len(),
                self.block_size
            )));
        }
        buf.resize(self.block_size, 0);

        let crc = crc32fast::hash(&buf);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a node from a block written by [`HtNode::to_block`].
    pub fn from_block(block: &[u8], max_children: usize) -> Result<Self> {
        if block.len() < COMMON_HEADER_SIZE {
            return Err(StateError::Corrupted(format!(
                "node block too short: {} bytes",
                block.len()
            )));
        }

        let expected = u32::from_le_bytes(block[CRC_OFFSET..CRC_OFFSET + 4].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&block[..CRC_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&block[CRC_OFFSET + 4..]);
        let actual = hasher.finalize();
        if expected != actual {
            return Err(StateError::ChecksumMismatch { expected, actual });
        }

        let kind_byte = block[0];
        let start = i64::from_le_bytes(block[1..9].try_into().unwrap());
        let end = i64::from_le_bytes(block[9..17].try_into().unwrap());
        let seq = u32::from_le_bytes(block[17..21].try_into().unwrap());
        let parent = u32::from_le_bytes(block[21..25].try_into().unwrap());
        let count = u32::from_le_bytes(block[25..29].try_into().unwrap());
        let closed = block[29] != 0;

        let parent_seq = (parent != NO_PARENT).then_some(parent);
        let mut node = match kind_byte {
            NODE_KIND_LEAF => Self::new_leaf(seq, parent_seq, start, block.len()),
            NODE_KIND_CORE => {
                if core_header_size(max_children) > block.len() {
                    return Err(StateError::Corrupted(format!(
                        "core node {seq} header does not fit its block"
                    )));
                }
                let mut node =
                    Self::new_core(seq, parent_seq, start, block.len(), max_children);
                let base = COMMON_HEADER_SIZE;
                let nb_children =
                    u32::from_le_bytes(block[base..base + 4].try_into().unwrap()) as usize;
                if nb_children > max_children {
                    return Err(StateError::Corrupted(format!(
                        "core node {seq} declares {nb_children} children"
                    )));
                }
                for i in 0..nb_children {
                    let off = base + 4 + i * CHILD_ENTRY_SIZE;
                    let child_seq = u32::from_le_bytes(block[off..off + 4].try_into().unwrap());
                    let child_start =
                        i64::from_le_bytes(block[off + 4..off + 12].try_into().unwrap());
                    node.link_child(ChildRef {
                        seq: child_seq,
                        start: child_start,
                    })?;
                }
                node
            }
            other => {
                return Err(StateError::Corrupted(format!(
                    "unknown node kind {other} for node {seq}"
                )))
            }
        };

        let mut reader = &block[node.header_size()..];
        for _ in 0..count {
            let interval = StateInterval::read_from(&mut reader)?;
            node.data_size += interval.size_on_disk();
            node.intervals.push(interval);
        }
        if closed {
            node.end = Some(end);
        }
        Ok(node)
    }
}
