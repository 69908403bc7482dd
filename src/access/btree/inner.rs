use super::node::{page_tag, AdjustmentAction, Node, INNER_TAG};
use super::store::NodeStore;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PageRef};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::cmp::Ordering;
use std::sync::Arc;

// Inner page layout:
// | tag (2) | key count (4) | child count (4) | child 0 | key 0 | child 1 | ... | key n-1 | child n |
pub(crate) const INNER_HEADER_SIZE: usize = 10;
pub(crate) const CHILD_ID_SIZE: usize = 4;
const KEY_COUNT_OFFSET: usize = 2;
const CHILD_COUNT_OFFSET: usize = 6;

/// Separator keys and child page ids.
///
/// Child `i` holds keys in `[key[i-1], key[i]]`. Both ends are inclusive
/// because a run of equal keys may continue across a leaf boundary.
pub struct InnerNode<K, V> {
    store: Arc<NodeStore<K, V>>,
    page: PageRef,
    id: PageId,
}

impl<K, V> Clone for InnerNode<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            page: self.page.clone(),
            id: self.id,
        }
    }
}

impl<K, V> InnerNode<K, V> {
    pub(crate) fn initialize(store: Arc<NodeStore<K, V>>, page: PageRef) -> StorageResult<Self> {
        let id = page.read().id();
        {
            let mut guard = page.write();
            let data = guard.data_mut();
            data.fill(0);
            LittleEndian::write_u16(&mut data[0..2], INNER_TAG);
        }

        let node = Self { store, page, id };
        node.sync()?;
        Ok(node)
    }

    pub(crate) fn load(store: Arc<NodeStore<K, V>>, page: PageRef) -> StorageResult<Self> {
        let id = page.read().id();
        let node = Self { store, page, id };
        node.ensure_valid()?;
        Ok(node)
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn ensure_valid(&self) -> StorageResult<()> {
        let page = self.page.read();
        if page.len() != self.store.page_size() {
            return Err(StorageError::WrongPageSize {
                expected: self.store.page_size(),
                actual: page.len(),
            });
        }

        let tag = page_tag(page.data());
        if tag != INNER_TAG {
            return Err(StorageError::corruption(format!(
                "page {} is not an inner node (tag {})",
                self.id, tag
            )));
        }

        let keys = LittleEndian::read_u32(&page.data()[KEY_COUNT_OFFSET..]) as usize;
        let children = LittleEndian::read_u32(&page.data()[CHILD_COUNT_OFFSET..]) as usize;
        if keys > self.store.max_inner_keys() {
            return Err(StorageError::corruption(format!(
                "inner node {} claims {} keys, at most {} fit",
                self.id,
                keys,
                self.store.max_inner_keys()
            )));
        }
        if children != 0 && children != keys + 1 {
            return Err(StorageError::corruption(format!(
                "inner node {} has {} keys but {} children",
                self.id, keys, children
            )));
        }
        Ok(())
    }

    pub fn num_keys(&self) -> usize {
        LittleEndian::read_u32(&self.page.read().data()[KEY_COUNT_OFFSET..]) as usize
    }

    pub fn num_children(&self) -> usize {
        LittleEndian::read_u32(&self.page.read().data()[CHILD_COUNT_OFFSET..]) as usize
    }

    pub fn max_keys(&self) -> usize {
        self.store.max_inner_keys()
    }

    pub fn is_full(&self) -> bool {
        self.num_keys() >= self.max_keys()
    }

    fn slot_width(&self) -> usize {
        CHILD_ID_SIZE + self.store.key_len()
    }

    fn child_offset(&self, index: usize) -> usize {
        INNER_HEADER_SIZE + index * self.slot_width()
    }

    fn key_offset(&self, index: usize) -> usize {
        self.child_offset(index) + CHILD_ID_SIZE
    }

    fn read_key(&self, index: usize) -> StorageResult<K> {
        let offset = self.key_offset(index);
        let page = self.page.read();
        self.store
            .key_serializer()
            .deserialize(&page.data()[offset..offset + self.store.key_len()])
    }

    pub fn key_at(&self, index: usize) -> StorageResult<K> {
        let count = self.num_keys();
        if index >= count {
            return Err(StorageError::InvalidState(format!(
                "key {} is out of range for inner node {} with {} keys",
                index, self.id, count
            )));
        }
        self.read_key(index)
    }

    pub fn child_at(&self, index: usize) -> StorageResult<PageId> {
        let count = self.num_children();
        if index >= count {
            return Err(StorageError::InvalidState(format!(
                "child {} is out of range for inner node {} with {} children",
                index, self.id, count
            )));
        }

        let offset = self.child_offset(index);
        let raw = LittleEndian::read_u32(&self.page.read().data()[offset..]);
        PageId::from_raw(raw).ok_or_else(|| {
            StorageError::corruption(format!("inner node {} has no page for child {}", self.id, index))
        })
    }

    pub(crate) fn load_child(&self, index: usize) -> StorageResult<Node<K, V>> {
        self.store.load_node(self.child_at(index)?)
    }

    /// Replace separator `index` and write the page through.
    pub fn set_key_at(&self, index: usize, key: &K) -> StorageResult<()> {
        let count = self.num_keys();
        if index >= count {
            return Err(StorageError::InvalidState(format!(
                "key {} is out of range for inner node {} with {} keys",
                index, self.id, count
            )));
        }

        let bytes = self.store.key_serializer().serialize(key)?;
        {
            let offset = self.key_offset(index);
            let mut page = self.page.write();
            page.data_mut()[offset..offset + bytes.len()].copy_from_slice(&bytes);
        }
        self.sync()
    }

    /// First separator index for which `accept(separator)` holds, or the key count.
    fn first_key_where(&self, accept: impl Fn(Ordering) -> bool, key: &K) -> StorageResult<usize> {
        let (mut lo, mut hi) = (0, self.num_keys());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if accept(self.store.compare(&self.read_key(mid)?, key)) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// Child an insert of `key` descends into: the one before the first
    /// separator strictly greater than `key`.
    pub fn child_index_for_insert(&self, key: &K) -> StorageResult<usize> {
        self.first_key_where(|ord| ord == Ordering::Greater, key)
    }

    /// Leftmost child that may hold `key`: the one before the first
    /// separator not less than `key`.
    pub fn child_index_for_lookup(&self, key: &K) -> StorageResult<usize> {
        self.first_key_where(|ord| ord != Ordering::Less, key)
    }

    pub fn get_child_for(&self, key: &K) -> StorageResult<PageId> {
        self.child_at(self.child_index_for_insert(key)?)
    }

    /// Turn this node into a root with one separator and two children.
    pub fn init_root_state(&self, key: &K, left: PageId, right: PageId) -> StorageResult<()> {
        let key_bytes = self.store.key_serializer().serialize(key)?;
        self.write_entries(&[key_bytes], &[left, right])
    }

    pub(crate) fn insert(&self, key: &K, value: &V, depth: usize) -> StorageResult<Option<AdjustmentAction<K>>> {
        self.ensure_valid()?;
        let index = self.child_index_for_insert(key)?;
        let child = self.load_child(index)?;
        let action = child.insert(key, value, depth + 1)?;
        self.absorb(index, action)
    }

    /// Apply a child's adjustment. Returns whatever must travel further up.
    fn absorb(&self, index: usize, action: Option<AdjustmentAction<K>>) -> StorageResult<Option<AdjustmentAction<K>>> {
        match action {
            None => Ok(None),
            Some(AdjustmentAction::UpdateKey { key }) => {
                if index < self.num_keys() {
                    self.set_key_at(index, &key)?;
                    Ok(None)
                } else {
                    // The separator in front of our right neighbour lives in an ancestor.
                    Ok(Some(AdjustmentAction::UpdateKey { key }))
                }
            }
            Some(AdjustmentAction::InsertNewNode { key, page_id }) => self.insert_separator(index, &key, page_id),
        }
    }

    /// Insert `key` and `child` to the right of child `index`, splitting this
    /// node if it has no room left.
    pub fn insert_separator(
        &self,
        index: usize,
        key: &K,
        child: PageId,
    ) -> StorageResult<Option<AdjustmentAction<K>>> {
        let count = self.num_keys();
        if index > count {
            return Err(StorageError::InvalidState(format!(
                "child {} is out of range for inner node {} with {} keys",
                index, self.id, count
            )));
        }

        let key_bytes = self.store.key_serializer().serialize(key)?;

        if count < self.max_keys() {
            let width = self.slot_width();
            let start = self.key_offset(index);
            let end = self.child_offset(count) + CHILD_ID_SIZE;
            {
                let mut page = self.page.write();
                let data = page.data_mut();
                data.copy_within(start..end, start + width);
                data[start..start + key_bytes.len()].copy_from_slice(&key_bytes);
                LittleEndian::write_u32(&mut data[start + key_bytes.len()..], child.0);
                LittleEndian::write_u32(&mut data[KEY_COUNT_OFFSET..], (count + 1) as u32);
                LittleEndian::write_u32(&mut data[CHILD_COUNT_OFFSET..], (count + 2) as u32);
            }
            self.sync()?;
            return Ok(None);
        }

        let (mut keys, mut children) = self.read_entries()?;
        keys.insert(index, key_bytes);
        children.insert(index + 1, child);

        let mid = keys.len() / 2;
        let right_keys = keys.split_off(mid + 1);
        let promoted = keys.pop().ok_or_else(|| {
            StorageError::corruption(format!("inner node {} split without keys", self.id))
        })?;
        let right_children = children.split_off(mid + 1);

        let right = self.store.create_inner()?;
        right.write_entries(&right_keys, &right_children)?;
        self.write_entries(&keys, &children)?;
        debug!(
            "split inner node {} ({} keys) into {} ({} keys)",
            self.id,
            keys.len(),
            right.id,
            right_keys.len()
        );

        Ok(Some(AdjustmentAction::InsertNewNode {
            key: self.store.key_serializer().deserialize(&promoted)?,
            page_id: right.id,
        }))
    }

    /// Fill this node from child ids and the first key of every child.
    /// The first child's key is not stored.
    pub(crate) fn fill(&self, children: &[(K, PageId)]) -> StorageResult<()> {
        let mut keys = Vec::with_capacity(children.len().saturating_sub(1));
        for (key, _) in children.iter().skip(1) {
            keys.push(self.store.key_serializer().serialize(key)?);
        }
        let ids: Vec<PageId> = children.iter().map(|(_, id)| *id).collect();
        self.write_entries(&keys, &ids)
    }

    fn read_entries(&self) -> StorageResult<(Vec<Vec<u8>>, Vec<PageId>)> {
        let keys = self.num_keys();
        let key_len = self.store.key_len();
        let mut key_bytes = Vec::with_capacity(keys + 1);
        let mut children = Vec::with_capacity(keys + 2);

        for index in 0..self.num_children() {
            children.push(self.child_at(index)?);
        }
        let page = self.page.read();
        for index in 0..keys {
            let offset = self.key_offset(index);
            key_bytes.push(page.data()[offset..offset + key_len].to_vec());
        }
        Ok((key_bytes, children))
    }

    /// Rewrite the whole body and sync.
    fn write_entries(&self, keys: &[Vec<u8>], children: &[PageId]) -> StorageResult<()> {
        if children.len() != keys.len() + 1 || keys.len() > self.max_keys() {
            return Err(StorageError::InvalidState(format!(
                "inner node {} cannot hold {} keys and {} children",
                self.id,
                keys.len(),
                children.len()
            )));
        }

        {
            let mut page = self.page.write();
            let data = page.data_mut();
            data[INNER_HEADER_SIZE..].fill(0);
            for (index, child) in children.iter().enumerate() {
                let offset = self.child_offset(index);
                LittleEndian::write_u32(&mut data[offset..], child.0);
            }
            for (index, key) in keys.iter().enumerate() {
                let offset = self.key_offset(index);
                data[offset..offset + key.len()].copy_from_slice(key);
            }
            LittleEndian::write_u32(&mut data[KEY_COUNT_OFFSET..], keys.len() as u32);
            LittleEndian::write_u32(&mut data[CHILD_COUNT_OFFSET..], children.len() as u32);
        }
        self.sync()
    }

    /// Check separator order and recurse into every child with its bounds.
    pub(crate) fn check_structure(&self, lower: Option<&K>, upper: Option<&K>, depth: usize) -> StorageResult<()> {
        self.ensure_valid()?;
        let count = self.num_keys();
        if count == 0 || self.num_children() != count + 1 {
            return Err(StorageError::corruption(format!(
                "inner node {} has {} keys and {} children",
                self.id,
                count,
                self.num_children()
            )));
        }

        let mut keys = Vec::with_capacity(count);
        for index in 0..count {
            let key = self.read_key(index)?;
            if let Some(previous) = keys.last() {
                if self.store.compare(previous, &key) == Ordering::Greater {
                    return Err(StorageError::corruption(format!(
                        "inner node {} separators out of order at {}",
                        self.id, index
                    )));
                }
            }
            keys.push(key);
        }

        let out_of_bounds = |key: &K| {
            lower.map_or(false, |lower| self.store.compare(key, lower) == Ordering::Less)
                || upper.map_or(false, |upper| self.store.compare(key, upper) == Ordering::Greater)
        };
        if out_of_bounds(&keys[0]) || out_of_bounds(&keys[count - 1]) {
            return Err(StorageError::corruption(format!(
                "inner node {} separators leave the parent's bounds",
                self.id
            )));
        }

        for index in 0..=count {
            let child_lower = if index == 0 { lower } else { Some(&keys[index - 1]) };
            let child_upper = if index == count { upper } else { Some(&keys[index]) };
            self.load_child(index)?
                .check_structure(child_lower, child_upper, depth + 1)?;
        }
        Ok(())
    }

    /// Release the backing page. Children are left alone.
    pub fn destroy(self) -> StorageResult<()> {
        self.store.manager().remove_page(self.id)
    }

    fn sync(&self) -> StorageResult<()> {
        self.store.manager().write_page(&self.page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::comparator::NaturalOrder;
    use crate::access::serializer::I32Serializer;
    use crate::storage::config::TreeConfig;
    use crate::storage::disk::FileResourceManager;
    use crate::storage::resource::ResourceManager;
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    // 128 byte pages hold (128 - 14) / 8 = 14 keys.
    const PAGE: usize = 128;
    const MAX_KEYS: usize = 14;

    fn create_test_store() -> Result<(Arc<NodeStore<i32, i32>>, TempDir)> {
        let dir = tempdir()?;
        let manager = FileResourceManager::new(dir.path().join("test.db"), PAGE, false)?;
        manager.open()?;
        let store = NodeStore::new(
            Arc::new(manager),
            Arc::new(I32Serializer),
            Arc::new(I32Serializer),
            Arc::new(NaturalOrder),
            TreeConfig::default(),
        )?;
        Ok((store, dir))
    }

    fn keys_of(node: &InnerNode<i32, i32>) -> Result<Vec<i32>> {
        let mut keys = Vec::new();
        for index in 0..node.num_keys() {
            keys.push(node.key_at(index)?);
        }
        Ok(keys)
    }

    fn children_of(node: &InnerNode<i32, i32>) -> Result<Vec<u32>> {
        let mut children = Vec::new();
        for index in 0..node.num_children() {
            children.push(node.child_at(index)?.0);
        }
        Ok(children)
    }

    #[test]
    fn test_init_root_state() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let root = store.create_inner()?;
        root.init_root_state(&10, PageId(7), PageId(8))?;

        assert_eq!(root.num_keys(), 1);
        assert_eq!(root.num_children(), 2);
        assert_eq!(root.max_keys(), MAX_KEYS);
        assert_eq!(root.get_child_for(&9)?, PageId(7));
        assert_eq!(root.get_child_for(&10)?, PageId(8));
        assert_eq!(root.get_child_for(&11)?, PageId(8));

        let reloaded = store.load_inner(root.id())?;
        assert_eq!(keys_of(&reloaded)?, vec![10]);

        Ok(())
    }

    #[test]
    fn test_routing_with_equal_separators() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let node = store.create_inner()?;
        node.init_root_state(&10, PageId(100), PageId(101))?;
        node.insert_separator(1, &10, PageId(102))?;
        node.insert_separator(2, &20, PageId(103))?;

        assert_eq!(keys_of(&node)?, vec![10, 10, 20]);
        assert_eq!(children_of(&node)?, vec![100, 101, 102, 103]);

        // Inserts go right of every equal separator, lookups start left of them.
        assert_eq!(node.child_index_for_insert(&10)?, 2);
        assert_eq!(node.child_index_for_lookup(&10)?, 0);
        assert_eq!(node.child_index_for_lookup(&15)?, 2);
        assert_eq!(node.child_index_for_lookup(&25)?, 3);

        Ok(())
    }

    #[test]
    fn test_insert_separator_in_the_middle() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let node = store.create_inner()?;
        node.init_root_state(&10, PageId(1), PageId(2))?;

        assert_eq!(node.insert_separator(0, &5, PageId(3))?, None);
        assert_eq!(keys_of(&node)?, vec![5, 10]);
        assert_eq!(children_of(&node)?, vec![1, 3, 2]);

        Ok(())
    }

    #[test]
    fn test_set_key_at() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let node = store.create_inner()?;
        node.init_root_state(&10, PageId(1), PageId(2))?;

        node.set_key_at(0, &12)?;
        assert_eq!(store.load_inner(node.id())?.key_at(0)?, 12);
        assert!(node.set_key_at(1, &0).is_err());

        Ok(())
    }

    #[test]
    fn test_split_when_full() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let node = store.create_inner()?;
        node.init_root_state(&0, PageId(1000), PageId(1001))?;
        for i in 1..MAX_KEYS as i32 {
            assert_eq!(node.insert_separator(i as usize, &(i * 10), PageId(1001 + i as u32))?, None);
        }
        assert!(node.is_full());

        let action = node.insert_separator(MAX_KEYS, &(MAX_KEYS as i32 * 10), PageId(2000))?;
        let Some(AdjustmentAction::InsertNewNode { key, page_id }) = action.clone() else {
            panic!("expected a split, got {:?}", action);
        };

        let right = store.load_inner(page_id)?;
        let left_keys = keys_of(&node)?;
        let right_keys = keys_of(&right)?;
        assert_eq!(left_keys.len() + right_keys.len() + 1, MAX_KEYS + 1);
        assert!(left_keys.iter().all(|k| *k < key));
        assert!(right_keys.iter().all(|k| *k > key));
        assert_eq!(node.num_children(), left_keys.len() + 1);
        assert_eq!(right.num_children(), right_keys.len() + 1);
        assert_eq!(children_of(&right)?.last(), Some(&2000));

        Ok(())
    }

    #[test]
    fn test_last_child_update_reaches_grandparent() -> Result<()> {
        let (store, _dir) = create_test_store()?;

        let leaves = [
            (0..14).collect::<Vec<i32>>(),
            (20..34).collect(),
            vec![100],
            vec![200],
        ];
        let mut ids = Vec::new();
        for keys in &leaves {
            let leaf = store.create_leaf()?;
            let pairs: Vec<(i32, i32)> = keys.iter().map(|k| (*k, *k)).collect();
            leaf.bulk_initialize(&pairs)?;
            ids.push(leaf.id());
        }
        for pair in ids.windows(2) {
            store.load_leaf(pair[0])?.set_next_leaf_id(Some(pair[1]))?;
        }

        let left = store.create_inner()?;
        left.fill(&[(0, ids[0]), (20, ids[1])])?;
        let right = store.create_inner()?;
        right.fill(&[(100, ids[2]), (200, ids[3])])?;
        let root = store.create_inner()?;
        root.fill(&[(0, left.id()), (100, right.id())])?;

        // 25 lands in the full last leaf under `left`, which hands six
        // entries to the first leaf under `right`.
        assert_eq!(root.insert(&25, &25, 0)?, None);

        assert_eq!(keys_of(&root)?, vec![28]);
        assert_eq!(keys_of(&store.load_inner(left.id())?)?, vec![20]);
        assert_eq!(store.load_leaf(ids[1])?.last_key()?, Some(27));
        assert_eq!(store.load_leaf(ids[2])?.first_key()?, Some(28));
        root.check_structure(None, None, 0)?;

        Ok(())
    }

    #[test]
    fn test_load_rejects_leaf_page() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;

        assert!(matches!(
            store.load_inner(leaf.id()),
            Err(StorageError::StructuralCorruption(_))
        ));

        Ok(())
    }
}
