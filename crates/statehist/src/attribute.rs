//! Attribute tree: the quark namespace.
//!
//! Attributes form a hierarchy of named segments (for example
//! `Threads/1234/Status`). Every attribute is identified by a dense integer
//! [`Quark`], assigned in creation order and never reused within a session.
//!
//! ## Persistence Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Magic: "QRKS" (4 bytes)                     │
//! │  Attribute count: u32 (4 bytes)              │
//! ├──────────────────────────────────────────────┤
//! │  Per attribute, in quark order:              │
//! │  - Parent quark: u32 (u32::MAX for root)     │
//! │  - Name length: u16, then UTF-8 name bytes   │
//! ├──────────────────────────────────────────────┤
//! │  CRC32 of everything above: u32 (4 bytes)    │
//! └──────────────────────────────────────────────┘
//! ```

use crate::error::{Result, StateError};
use regex::Regex;
use std::collections::HashMap;
use std::io::{Read, Write};

/// Integer identifier of an attribute.
pub type Quark = u32;

/// Magic bytes of a persisted attribute tree.
pub const ATTRIBUTE_TREE_MAGIC: [u8; 4] = *b"QRKS";

const NO_PARENT: u32 = u32::MAX;

#[derive(Debug, Default)]
struct AttributeNode {
    name: String,
    parent: Option<Quark>,
    children: Vec<Quark>,
    by_name: HashMap<String, Quark>,
}

/// Hierarchical path to quark mapping.
#[derive(Debug, Default)]
pub struct AttributeTree {
    root: AttributeNode,
    nodes: Vec<AttributeNode>,
}

impl AttributeTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no attribute has been created.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolves an absolute path, creating missing segments.
    pub fn quark_and_add(&mut self, path: &[&str]) -> Result<Quark> {
        self.resolve_and_add(None, path)
    }

    /// Resolves a path relative to `parent`, creating missing segments.
    pub fn quark_relative_and_add(&mut self, parent: Quark, path: &[&str]) -> Result<Quark> {
        self.resolve_and_add(Some(parent), path)
    }

    /// Resolves an absolute path.
    ///
    /// Fails with [`StateError::AttributeNotFound`] if any segment is missing.
    pub fn quark(&self, path: &[&str]) -> Result<Quark> {
        self.resolve(None, path)
    }

    /// Resolves a path relative to `parent`.
    pub fn quark_relative(&self, parent: Quark, path: &[&str]) -> Result<Quark> {
        self.resolve(Some(parent), path)
    }

    /// Resolves an absolute path, returning `None` if it does not exist.
    pub fn opt_quark(&self, path: &[&str]) -> Option<Quark> {
        self.resolve(None, path).ok()
    }

    /// Resolves a relative path, returning `None` if it does not exist.
    pub fn opt_quark_relative(&self, parent: Quark, path: &[&str]) -> Option<Quark> {
        self.resolve(Some(parent), path).ok()
    }

    /// Last path segment of `quark`.
    pub fn name(&self, quark: Quark) -> Result<&str> {
        Ok(&self.get(quark)?.name)
    }

    /// Parent of `quark`, or `None` for a top-level attribute.
    pub fn parent(&self, quark: Quark) -> Result<Option<Quark>> {
        Ok(self.get(quark)?.parent)
    }

    /// Full `/`-separated path of `quark`.
    pub fn full_path(&self, quark: Quark) -> Result<String> {
        let mut segments = Vec::new();
        let mut current = Some(quark);
        while let Some(q) = current {
            let node = self.get(q)?;
            segments.push(node.name.as_str());
            current = node.parent;
        }
        segments.reverse();
        Ok(segments.join("/"))
    }

    /// Children of `quark` (or of the root when `None`), in creation order.
    ///
    /// With `recursive`, the whole subtree is returned depth-first.
    pub fn sub_attributes(&self, quark: Option<Quark>, recursive: bool) -> Result<Vec<Quark>> {
        let mut out = Vec::new();
        self.collect_children(self.node_or_root(quark)?, recursive, &mut |_| true, &mut out);
        Ok(out)
    }

    /// Descendants of `quark` whose own name matches a glob `pattern`.
    ///
    /// `*` matches any sequence of characters; everything else is literal.
    pub fn child_quarks(
        &self,
        quark: Option<Quark>,
        pattern: &str,
        recursive: bool,
    ) -> Result<Vec<Quark>> {
        let regex = glob_regex(pattern)?;
        let mut out = Vec::new();
        self.collect_children(
            self.node_or_root(quark)?,
            recursive,
            &mut |node| regex.is_match(&node.name),
            &mut out,
        );
        Ok(out)
    }

    /// Returns an error if `quark` has not been assigned.
    pub fn check(&self, quark: Quark) -> Result<()> {
        self.get(quark).map(|_| ())
    }

    /// Serializes the tree.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + self.nodes.len() * 16);

        // Magic (4 bytes)
        buf.extend_from_slice(&ATTRIBUTE_TREE_MAGIC);

        // Attribute count (4 bytes)
        buf.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());

        for node in &self.nodes {
            buf.extend_from_slice(&node.parent.unwrap_or(NO_PARENT).to_le_bytes());
            let len = u16::try_from(node.name.len()).map_err(|_| {
                StateError::Corrupted(format!("attribute name too long: {}", node.name.len()))
            })?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(node.name.as_bytes());
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        writer.write_all(&buf)?;
        Ok(())
    }

    /// Deserializes a tree written by [`AttributeTree::write_to`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut hasher = crc32fast::Hasher::new();
        let mut head = [0u8; 8];
        reader.read_exact(&mut head)?;
        hasher.update(&head);

        let magic: [u8; 4] = head[0..4].try_into().unwrap();
        if magic != ATTRIBUTE_TREE_MAGIC {
            return Err(StateError::Corrupted(format!(
                "invalid attribute tree magic {magic:?}"
            )));
        }
        let count = u32::from_le_bytes(head[4..8].try_into().unwrap());

        let mut tree = Self::new();
        for quark in 0..count {
            let mut entry = [0u8; 6];
            reader.read_exact(&mut entry)?;
            hasher.update(&entry);
            let parent = u32::from_le_bytes(entry[0..4].try_into().unwrap());
            let len = u16::from_le_bytes(entry[4..6].try_into().unwrap()) as usize;

            let mut name = vec![0u8; len];
            reader.read_exact(&mut name)?;
            hasher.update(&name);
            let name = String::from_utf8(name)
                .map_err(|e| StateError::Corrupted(format!("invalid attribute name: {e}")))?;

            let parent = if parent == NO_PARENT {
                None
            } else if parent < quark {
                Some(parent)
            } else {
                return Err(StateError::Corrupted(format!(
                    "attribute {quark} refers to later parent {parent}"
                )));
            };
            tree.insert_child(parent, name);
        }

        let mut crc = [0u8; 4];
        reader.read_exact(&mut crc)?;
        let expected = u32::from_le_bytes(crc);
        let actual = hasher.finalize();
        if expected != actual {
            return Err(StateError::ChecksumMismatch { expected, actual });
        }

        Ok(tree)
    }

    fn get(&self, quark: Quark) -> Result<&AttributeNode> {
        self.nodes
            .get(quark as usize)
            .ok_or_else(|| StateError::AttributeNotFound(format!("quark {quark}")))
    }

    fn node_or_root(&self, quark: Option<Quark>) -> Result<&AttributeNode> {
        match quark {
            Some(q) => self.get(q),
            None => Ok(&self.root),
        }
    }

    fn node_or_root_mut(&mut self, quark: Option<Quark>) -> &mut AttributeNode {
        match quark {
            Some(q) => &mut self.nodes[q as usize],
            None => &mut self.root,
        }
    }

    fn resolve(&self, parent: Option<Quark>, path: &[&str]) -> Result<Quark> {
        let mut current = parent;
        for segment in path {
            let node = self.node_or_root(current)?;
            match node.by_name.get(*segment) {
                Some(&q) => current = Some(q),
                None => return Err(self.not_found(parent, path)),
            }
        }
        current.ok_or_else(|| self.not_found(parent, path))
    }

    fn resolve_and_add(&mut self, parent: Option<Quark>, path: &[&str]) -> Result<Quark> {
        if let Some(q) = parent {
            self.check(q)?;
        }
        let mut current = parent;
        for segment in path {
            let existing = self.node_or_root(current)?.by_name.get(*segment).copied();
            current = Some(match existing {
                Some(q) => q,
                None => self.insert_child(current, segment.to_string()),
            });
        }
        current.ok_or_else(|| self.not_found(parent, path))
    }

    fn insert_child(&mut self, parent: Option<Quark>, name: String) -> Quark {
        let quark = self.nodes.len() as Quark;
        self.nodes.push(AttributeNode {
            name: name.clone(),
            parent,
            ..Default::default()
        });
        let parent_node = self.node_or_root_mut(parent);
        parent_node.children.push(quark);
        parent_node.by_name.insert(name, quark);
        quark
    }

    fn collect_children(
        &self,
        node: &AttributeNode,
        recursive: bool,
        filter: &mut dyn FnMut(&AttributeNode) -> bool,
        out: &mut Vec<Quark>,
    ) {
        for &child in &node.children {
            let child_node = &self.nodes[child as usize];
            if filter(child_node) {
                out.push(child);
            }
            if recursive {
                self.collect_children(child_node, true, filter, out);
            }
        }
    }

    fn not_found(&self, parent: Option<Quark>, path: &[&str]) -> StateError {
        let prefix = parent
            .and_then(|q| self.full_path(q).ok())
            .map(|p| format!("{p}/"))
            .unwrap_or_default();
        StateError::AttributeNotFound(format!("{prefix}{}", path.join("/")))
    }
}

fn glob_regex(pattern: &str) -> Result<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
        .map_err(|e| StateError::AttributeNotFound(format!("invalid pattern {pattern}: {e}")))
}
