use super::inner::InnerNode;
use super::leaf::LeafNode;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use byteorder::{ByteOrder, LittleEndian};

/// Tag stored in the first two bytes of every node page.
pub const LEAF_TAG: u16 = 1;
pub const INNER_TAG: u16 = 2;
pub const META_TAG: u16 = 3;

/// Bound on descent depth. Reaching it means the parent/child links form a
/// cycle or are otherwise corrupt.
pub const MAX_DEPTH: usize = 50;

/// Read the node tag from a raw page buffer.
pub fn page_tag(data: &[u8]) -> u16 {
    LittleEndian::read_u16(&data[0..2])
}

pub(crate) fn check_depth(depth: usize) -> StorageResult<()> {
    if depth > MAX_DEPTH {
        return Err(StorageError::corruption(format!(
            "descent exceeded the maximum depth of {}",
            MAX_DEPTH
        )));
    }
    Ok(())
}

/// What a child asks of its parent after a structural change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdjustmentAction<K> {
    /// Entries moved into the next leaf; the separator in front of it is now `key`.
    UpdateKey { key: K },
    /// The child split. `page_id` holds everything from `key` upwards.
    InsertNewNode { key: K, page_id: PageId },
}

/// A page-backed tree node. The variant is decided by the page tag.
pub enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    Inner(InnerNode<K, V>),
}

impl<K, V> Clone for Node<K, V> {
    fn clone(&self) -> Self {
        match self {
            Node::Leaf(leaf) => Node::Leaf(leaf.clone()),
            Node::Inner(inner) => Node::Inner(inner.clone()),
        }
    }
}

impl<K, V> Node<K, V> {
    pub fn id(&self) -> PageId {
        match self {
            Node::Leaf(leaf) => leaf.id(),
            Node::Inner(inner) => inner.id(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn ensure_valid(&self) -> StorageResult<()> {
        match self {
            Node::Leaf(leaf) => leaf.ensure_valid(),
            Node::Inner(inner) => inner.ensure_valid(),
        }
    }

    pub fn insert(&self, key: &K, value: &V, depth: usize) -> StorageResult<Option<AdjustmentAction<K>>> {
        check_depth(depth)?;
        match self {
            Node::Leaf(leaf) => leaf.insert(key, value),
            Node::Inner(inner) => inner.insert(key, value, depth),
        }
    }

    /// Descend to the leftmost leaf that may hold `key`, or the leftmost leaf
    /// of the subtree when `key` is `None`.
    pub fn find_leaf(&self, key: Option<&K>) -> StorageResult<LeafNode<K, V>> {
        let mut node = self.clone();
        let mut depth = 0;
        loop {
            check_depth(depth)?;
            match node {
                Node::Leaf(leaf) => return Ok(leaf),
                Node::Inner(inner) => {
                    let index = match key {
                        Some(key) => inner.child_index_for_lookup(key)?,
                        None => 0,
                    };
                    node = inner.load_child(index)?;
                }
            }
            depth += 1;
        }
    }

    /// Check ordering inside this subtree. Keys must lie in `[lower, upper]`.
    pub fn check_structure(&self, lower: Option<&K>, upper: Option<&K>, depth: usize) -> StorageResult<()> {
        check_depth(depth)?;
        match self {
            Node::Leaf(leaf) => leaf.check_bounds(lower, upper),
            Node::Inner(inner) => inner.check_structure(lower, upper, depth),
        }
    }

    pub fn destroy(self) -> StorageResult<()> {
        match self {
            Node::Leaf(leaf) => leaf.destroy(),
            Node::Inner(inner) => inner.destroy(),
        }
    }
}
