//! Block-level access to a history tree file.
//!
//! Nodes live at `TREE_HEADER_SIZE + seq * block_size`. Closed nodes are
//! immutable, so decoded nodes are shared through a bounded cache keyed by
//! sequence number.

use crate::error::{Result, StateError};
use crate::htree::node::HtNode;
use crate::htree::tree::TREE_HEADER_SIZE;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// FIFO cache of decoded closed nodes.
#[derive(Debug)]
struct NodeCache {
    capacity: usize,
    nodes: HashMap<u32, Arc<HtNode>>,
    order: VecDeque<u32>,
}

impl NodeCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    fn get(&self, seq: u32) -> Option<Arc<HtNode>> {
        self.nodes.get(&seq).cloned()
    }

    fn put(&mut self, node: Arc<HtNode>) {
        if self.capacity == 0 {
            return;
        }
        let seq = node.seq();
        if self.nodes.insert(seq, node).is_none() {
            self.order.push_back(seq);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.nodes.remove(&evicted);
            }
        }
    }
}

/// File handle plus node cache for one history tree.
#[derive(Debug)]
pub struct HtIo {
    path: PathBuf,
    block_size: usize,
    max_children: usize,
    file: Mutex<Option<File>>,
    cache: Mutex<NodeCache>,
}

impl HtIo {
    /// Creates (or truncates) a tree file for writing.
    pub fn create(
        path: &Path,
        block_size: usize,
        max_children: usize,
        cache_size: usize,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        debug!("Created history tree file: {}", path.display());
        Ok(Self::with_file(path, file, block_size, max_children, cache_size))
    }

    /// Opens an existing tree file read-only.
    ///
    /// The block geometry is not known until the header has been read, so
    /// it is supplied afterwards with [`HtIo::set_geometry`].
    pub fn open(path: &Path, cache_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self::with_file(path, file, 0, 0, cache_size))
    }

    fn with_file(
        path: &Path,
        file: File,
        block_size: usize,
        max_children: usize,
        cache_size: usize,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            block_size,
            max_children,
            file: Mutex::new(Some(file)),
            cache: Mutex::new(NodeCache::new(cache_size)),
        }
    }

    /// Sets block size and child capacity after reading a header.
    pub fn set_geometry(&mut self, block_size: usize, max_children: usize) {
        self.block_size = block_size;
        self.max_children = max_children;
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of node `seq`.
    pub fn node_offset(&self, seq: u32) -> u64 {
        TREE_HEADER_SIZE as u64 + u64::from(seq) * self.block_size as u64
    }

    /// Writes a closed node to its block and caches it.
    pub fn write_node(&self, node: &HtNode) -> Result<()> {
        let block = node.to_block()?;
        self.write_at(self.node_offset(node.seq()), &block)?;
        self.cache.lock().put(Arc::new(node.clone()));
        Ok(())
    }

    /// Reads a closed node, from the cache when possible.
    pub fn read_node(&self, seq: u32) -> Result<Arc<HtNode>> {
        if let Some(node) = self.cache.lock().get(seq) {
            return Ok(node);
        }

        let mut block = vec![0u8; self.block_size];
        self.read_at(self.node_offset(seq), &mut block)?;
        let node = HtNode::from_block(&block, self.max_children)?;
        if node.seq() != seq {
            return Err(StateError::Corrupted(format!(
                "block {seq} holds node {}",
                node.seq()
            )));
        }

        let node = Arc::new(node);
        self.cache.lock().put(Arc::clone(&node));
        Ok(node)
    }

    /// Writes `data` at `offset`.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StateError::Disposed)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Fills `buf` from `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StateError::Disposed)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Reads everything from `offset` to the end of the file.
    pub fn read_from_offset(&self, offset: u64) -> Result<Vec<u8>> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StateError::Disposed)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Current file size in bytes.
    pub fn file_size(&self) -> Result<u64> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(StateError::Disposed)?;
        Ok(file.metadata()?.len())
    }

    /// Flushes pending writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(StateError::Disposed)?;
        file.sync_all()?;
        Ok(())
    }

    /// Releases the file handle. Later accesses fail with `Disposed`.
    pub fn close(&self) {
        self.file.lock().take();
    }

    /// Releases the file handle and removes the file.
    pub fn delete(&self) -> Result<()> {
        self.close();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
