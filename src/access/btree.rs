//! Paged B-tree multimap.
//!
//! The tree maps fixed-length keys to fixed-length values and allows any
//! number of values per key. Every node lives in one page of a
//! [`ResourceManager`]; nodes refer to each other by page id only.
//!
//! Page 1 of the resource is the meta page recording the root, the depth and
//! the number of entries, so a tree can be reopened from its file alone.

pub mod inner;
pub mod iterator;
pub mod leaf;
pub mod node;
pub mod store;

pub use self::inner::InnerNode;
pub use self::iterator::{merge_ranges, KeyRange, LeafIter, TreeIter};
pub use self::leaf::LeafNode;
pub use self::node::{AdjustmentAction, Node};
pub use self::store::NodeStore;

use self::node::{page_tag, MAX_DEPTH, META_TAG};
use crate::access::comparator::KeyComparator;
use crate::access::serializer::FixedLengthSerializer;
use crate::storage::config::TreeConfig;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PageRef};
use crate::storage::resource::ResourceManager;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::cmp::Ordering;
use std::sync::Arc;

/// Page holding the tree's own bookkeeping. It is the first page created
/// after the resource is cleared.
pub const META_PAGE_ID: PageId = PageId(1);

// Meta page layout:
// | tag (2) | root page id (4) | depth (4) | entry count (8) |
const META_ROOT_OFFSET: usize = 2;
const META_DEPTH_OFFSET: usize = 6;
const META_ENTRIES_OFFSET: usize = 10;

pub struct BTree<K, V> {
    store: Arc<NodeStore<K, V>>,
    root: Option<Node<K, V>>,
    meta: Option<PageRef>,
    /// Levels from the root down to the leaves, inclusive
    depth: usize,
    num_entries: usize,
}

impl<K: Clone, V> BTree<K, V> {
    /// Create an unopened tree over `manager`. Call [`BTree::open`],
    /// [`BTree::initialize`] or [`BTree::load`] before using it.
    pub fn new<S, T, C>(
        manager: Arc<dyn ResourceManager>,
        key_serializer: S,
        value_serializer: T,
        comparator: C,
        config: TreeConfig,
    ) -> StorageResult<Self>
    where
        S: FixedLengthSerializer<K> + 'static,
        T: FixedLengthSerializer<V> + 'static,
        C: KeyComparator<K> + 'static,
    {
        let store = NodeStore::new(
            manager,
            Arc::new(key_serializer),
            Arc::new(value_serializer),
            Arc::new(comparator),
            config,
        )?;

        Ok(Self {
            store,
            root: None,
            meta: None,
            depth: 0,
            num_entries: 0,
        })
    }

    pub fn manager(&self) -> &Arc<dyn ResourceManager> {
        self.store.manager()
    }

    pub fn store(&self) -> &Arc<NodeStore<K, V>> {
        &self.store
    }

    /// Load the tree if the resource already holds one, otherwise start an
    /// empty tree.
    pub fn open(&mut self) -> StorageResult<()> {
        if self.manager().num_pages()? > 1 {
            self.load()
        } else {
            self.initialize()
        }
    }

    /// Discard everything in the resource and start an empty tree.
    pub fn initialize(&mut self) -> StorageResult<()> {
        self.invalidate();
        self.manager().clear()?;

        let meta = self.manager().create_page()?;
        let meta_id = meta.read().id();
        if meta_id != META_PAGE_ID {
            return Err(StorageError::InvalidState(format!(
                "cleared resource handed out page {} for the meta page, expected {}",
                meta_id, META_PAGE_ID
            )));
        }

        let root = self.store.create_leaf()?;
        self.meta = Some(meta);
        self.root = Some(Node::Leaf(root));
        self.depth = 1;
        self.num_entries = 0;
        self.write_meta()?;

        info!(
            "initialized tree (leaf capacity {}, inner capacity {})",
            self.store.max_leaf_entries(),
            self.store.max_inner_keys()
        );
        Ok(())
    }

    /// Read the tree recorded in the meta page.
    pub fn load(&mut self) -> StorageResult<()> {
        self.invalidate();

        let meta = self.manager().get_page(META_PAGE_ID)?;
        let (root_id, depth, num_entries) = {
            let page = meta.read();
            let data = page.data();
            if page_tag(data) != META_TAG {
                return Err(StorageError::corruption(format!(
                    "page {} is not a tree meta page (tag {})",
                    META_PAGE_ID,
                    page_tag(data)
                )));
            }
            (
                LittleEndian::read_u32(&data[META_ROOT_OFFSET..]),
                LittleEndian::read_u32(&data[META_DEPTH_OFFSET..]) as usize,
                LittleEndian::read_u64(&data[META_ENTRIES_OFFSET..]) as usize,
            )
        };

        let root_id = PageId::from_raw(root_id)
            .ok_or_else(|| StorageError::corruption("meta page records no root"))?;
        if depth == 0 || depth > MAX_DEPTH {
            return Err(StorageError::corruption(format!("meta page records depth {}", depth)));
        }

        let root = self.store.load_node(root_id)?;
        if root.is_leaf() != (depth == 1) {
            return Err(StorageError::corruption(format!(
                "root {} does not match recorded depth {}",
                root_id, depth
            )));
        }

        self.meta = Some(meta);
        self.root = Some(root);
        self.depth = depth;
        self.num_entries = num_entries;

        info!(
            "loaded tree with {} entries, depth {}, root {}",
            num_entries, depth, root_id
        );
        Ok(())
    }

    /// Remove every entry. Equivalent to [`BTree::initialize`].
    pub fn clear(&mut self) -> StorageResult<()> {
        self.initialize()
    }

    /// Persist the meta page and flush the resource.
    pub fn sync(&self) -> StorageResult<()> {
        self.write_meta()?;
        self.manager().sync()
    }

    /// Flush and close the resource. The tree is invalid afterwards even when
    /// flushing fails.
    pub fn close(&mut self) -> StorageResult<()> {
        let flushed = if self.is_valid() { self.sync() } else { Ok(()) };
        self.invalidate();
        let closed = self.manager().close();
        flushed.and(closed)
    }

    pub fn is_valid(&self) -> bool {
        self.root.is_some()
    }

    pub fn size(&self) -> usize {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn root_id(&self) -> Option<PageId> {
        self.root.as_ref().map(Node::id)
    }

    /// Insert one entry.
    ///
    /// Returns `true` only when the root split and the tree grew by one
    /// level. Every other outcome returns `false`, including a plain insert
    /// and a redistribution whose separator update was absorbed on the way
    /// up.
    pub fn add(&mut self, key: K, value: V) -> StorageResult<bool> {
        let root = self.root()?.clone();
        let action = root.insert(&key, &value, 0)?;
        self.num_entries += 1;

        let grew = match action {
            None => false,
            Some(AdjustmentAction::InsertNewNode { key: separator, page_id }) => {
                let new_root = self.store.create_inner()?;
                new_root.init_root_state(&separator, root.id(), page_id)?;
                debug!(
                    "root {} split, new root {} over {} and {}",
                    root.id(),
                    new_root.id(),
                    root.id(),
                    page_id
                );
                self.root = Some(Node::Inner(new_root));
                self.depth += 1;
                true
            }
            Some(AdjustmentAction::UpdateKey { .. }) => {
                // Only the rightmost path can hand an update this far up and
                // its leaf has no successor to redistribute into.
                warn!("separator update reached the root of the tree");
                false
            }
        };

        self.write_meta()?;
        Ok(grew)
    }

    /// All values stored under `key`.
    pub fn get(&self, key: &K) -> StorageResult<Vec<V>> {
        let mut values = Vec::new();
        self.visit_candidate_leaves(key, |leaf| {
            values.extend(leaf.get(key)?);
            Ok(false)
        })?;
        Ok(values)
    }

    pub fn contains_key(&self, key: &K) -> StorageResult<bool> {
        let mut found = false;
        self.visit_candidate_leaves(key, |leaf| {
            found = leaf.contains_key(key)?;
            Ok(found)
        })?;
        Ok(found)
    }

    /// Remove every value stored under `key`. Returns how many were removed.
    pub fn remove(&mut self, key: &K) -> StorageResult<usize> {
        let mut removed = 0;
        self.visit_candidate_leaves(key, |leaf| {
            removed += leaf.remove(key)?;
            Ok(false)
        })?;
        self.record_removed(removed)?;
        Ok(removed)
    }

    /// Remove every entry equal to `(key, value)`. Returns how many were removed.
    pub fn remove_value(&mut self, key: &K, value: &V) -> StorageResult<usize>
    where
        V: PartialEq,
    {
        let mut removed = 0;
        self.visit_candidate_leaves(key, |leaf| {
            removed += leaf.remove_value(key, value)?;
            Ok(false)
        })?;
        self.record_removed(removed)?;
        Ok(removed)
    }

    /// Every value in key order.
    pub fn iter(&self) -> StorageResult<TreeIter<K, V>> {
        self.iter_ranges(&[])
    }

    /// Values whose keys lie in `[from, to]`. A missing bound is unbounded.
    pub fn iter_range(&self, from: Option<K>, to: Option<K>) -> StorageResult<TreeIter<K, V>> {
        self.iter_ranges(&[KeyRange::new(from, to)])
    }

    /// Values whose keys lie in any of `ranges`, in key order and without
    /// repeats where ranges overlap. No ranges means the whole tree.
    pub fn iter_ranges(&self, ranges: &[KeyRange<K>]) -> StorageResult<TreeIter<K, V>> {
        let root = self.root()?.clone();
        let store = self.store.clone();
        let merged = merge_ranges(ranges, |a, b| store.compare(a, b));
        TreeIter::new(store, root, merged)
    }

    /// Replace the contents of an empty tree with presorted `pairs`, packing
    /// leaves full and building the inner levels bottom-up.
    pub fn bulk_initialize(&mut self, pairs: &[(K, V)]) -> StorageResult<()> {
        if !self.is_empty() {
            return Err(StorageError::InvalidState(format!(
                "bulk initialization needs an empty tree, this one holds {} entries",
                self.num_entries
            )));
        }
        if let Some(pos) = pairs
            .windows(2)
            .position(|w| self.store.compare(&w[0].0, &w[1].0) == Ordering::Greater)
        {
            return Err(StorageError::InvalidState(format!(
                "bulk input is not sorted at position {}",
                pos + 1
            )));
        }

        self.initialize()?;
        if pairs.is_empty() {
            return Ok(());
        }

        let Some(Node::Leaf(mut leaf)) = self.root.clone() else {
            return Err(StorageError::corruption("fresh tree has no root leaf"));
        };

        let mut level: Vec<(K, PageId)> = Vec::new();
        let mut pos = 0;
        loop {
            let stored = leaf.bulk_initialize(&pairs[pos..])?;
            level.push((pairs[pos].0.clone(), leaf.id()));
            pos += stored;
            if pos >= pairs.len() {
                break;
            }
            let next = self.store.create_leaf()?;
            leaf.set_next_leaf_id(Some(next.id()))?;
            leaf = next;
        }

        let mut depth = 1;
        let fanout = self.store.max_inner_keys() + 1;
        while level.len() > 1 {
            // Spread children evenly so no inner node ends up with one child.
            let groups = (level.len() + fanout - 1) / fanout;
            let base = level.len() / groups;
            let extra = level.len() % groups;

            let mut parents = Vec::with_capacity(groups);
            let mut start = 0;
            for group in 0..groups {
                let size = if group < extra { base + 1 } else { base };
                let children = &level[start..start + size];
                let inner = self.store.create_inner()?;
                inner.fill(children)?;
                parents.push((children[0].0.clone(), inner.id()));
                start += size;
            }

            level = parents;
            depth += 1;
        }

        let root_id = level[0].1;
        self.root = Some(self.store.load_node(root_id)?);
        self.depth = depth;
        self.num_entries = pairs.len();
        self.write_meta()?;

        info!("bulk loaded {} entries, depth {}", pairs.len(), depth);
        Ok(())
    }

    /// Walk the whole tree and verify ordering, bounds, the leaf chain, the
    /// recorded depth and the recorded entry count.
    pub fn check_structure(&self) -> StorageResult<()> {
        let root = self.root()?;
        root.check_structure(None, None, 0)?;

        let mut measured = 1;
        let mut node = root.clone();
        while let Node::Inner(inner) = node {
            node = inner.load_child(0)?;
            measured += 1;
            if measured > MAX_DEPTH {
                return Err(StorageError::corruption("leftmost path exceeds the maximum depth"));
            }
        }
        if measured != self.depth {
            return Err(StorageError::corruption(format!(
                "tree records depth {} but the leftmost path has {} levels",
                self.depth, measured
            )));
        }

        let max_hops = self.manager().num_pages()?;
        let mut leaf = root.find_leaf(None)?;
        let mut previous: Option<K> = None;
        let mut counted = 0;
        let mut hops = 0;
        loop {
            leaf.check_structure()?;
            if let (Some(previous), Some(first)) = (previous.as_ref(), leaf.first_key()?) {
                if self.store.compare(previous, &first) == Ordering::Greater {
                    return Err(StorageError::corruption(format!(
                        "leaf {} starts below the end of its predecessor",
                        leaf.id()
                    )));
                }
            }
            if let Some(last) = leaf.last_key()? {
                previous = Some(last);
            }
            counted += leaf.num_entries();

            let Some(next) = leaf.next_leaf_id() else {
                break;
            };
            hops += 1;
            if hops > max_hops {
                return Err(StorageError::corruption(format!(
                    "leaf chain revisits pages (at leaf {})",
                    next
                )));
            }
            leaf = self.store.load_leaf(next)?;
        }

        if counted != self.num_entries {
            return Err(StorageError::corruption(format!(
                "tree records {} entries but the leaves hold {}",
                self.num_entries, counted
            )));
        }
        Ok(())
    }

    fn root(&self) -> StorageResult<&Node<K, V>> {
        self.root
            .as_ref()
            .ok_or_else(|| StorageError::InvalidState("tree is not initialized".to_string()))
    }

    fn invalidate(&mut self) {
        self.root = None;
        self.meta = None;
        self.depth = 0;
        self.num_entries = 0;
    }

    /// Call `visit` on every leaf that may hold `key`, left to right, until
    /// it returns `true` or a leaf ends above `key`.
    fn visit_candidate_leaves(
        &self,
        key: &K,
        mut visit: impl FnMut(&LeafNode<K, V>) -> StorageResult<bool>,
    ) -> StorageResult<()> {
        let root = self.root()?;
        let max_hops = self.manager().num_pages()?;
        let mut leaf = root.find_leaf(Some(key))?;
        let mut hops = 0;
        loop {
            // Read before visiting, the visitor may remove entries.
            let last = leaf.last_key()?;
            if visit(&leaf)? {
                return Ok(());
            }
            if let Some(last) = last {
                if self.store.compare(&last, key) == Ordering::Greater {
                    return Ok(());
                }
            }

            let Some(next) = leaf.next_leaf_id() else {
                return Ok(());
            };
            hops += 1;
            if hops > max_hops {
                return Err(StorageError::corruption(format!(
                    "leaf chain revisits pages (at leaf {})",
                    next
                )));
            }
            leaf = self.store.load_leaf(next)?;
        }
    }

    fn record_removed(&mut self, removed: usize) -> StorageResult<()> {
        if removed == 0 {
            return Ok(());
        }
        self.num_entries = self.num_entries.saturating_sub(removed);
        self.write_meta()
    }

    fn write_meta(&self) -> StorageResult<()> {
        let (Some(meta), Some(root)) = (self.meta.as_ref(), self.root.as_ref()) else {
            return Err(StorageError::InvalidState("tree is not initialized".to_string()));
        };

        {
            let mut page = meta.write();
            let data = page.data_mut();
            data.fill(0);
            LittleEndian::write_u16(&mut data[0..2], META_TAG);
            LittleEndian::write_u32(&mut data[META_ROOT_OFFSET..], root.id().0);
            LittleEndian::write_u32(&mut data[META_DEPTH_OFFSET..], self.depth as u32);
            LittleEndian::write_u64(&mut data[META_ENTRIES_OFFSET..], self.num_entries as u64);
        }
        self.manager().write_page(meta)
    }
}
