use super::iterator::LeafIter;
use super::node::{page_tag, AdjustmentAction, LEAF_TAG};
use super::store::NodeStore;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PageRef};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::cmp::Ordering;
use std::sync::Arc;

// Leaf page layout:
// | tag (2) | entry count (4) | next leaf id (4) | key | value | key | value | ...
pub(crate) const LEAF_HEADER_SIZE: usize = 10;
const COUNT_OFFSET: usize = 2;
const NEXT_OFFSET: usize = 6;

/// Sorted key/value entries packed into a single page.
///
/// The node keeps no copy of its header: every accessor reads the page, so
/// two handles sharing one page instance never disagree. Handles loaded
/// separately through a manager that hands out copies (no cache, or the LRU
/// cache after an eviction) go stale when the other one is mutated; reload
/// them after such a change. Every mutating operation writes the page
/// through the manager before returning.
pub struct LeafNode<K, V> {
    store: Arc<NodeStore<K, V>>,
    page: PageRef,
    id: PageId,
}

impl<K, V> Clone for LeafNode<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            page: self.page.clone(),
            id: self.id,
        }
    }
}

impl<K, V> LeafNode<K, V> {
    pub(crate) fn initialize(store: Arc<NodeStore<K, V>>, page: PageRef) -> StorageResult<Self> {
        let id = page.read().id();
        {
            let mut guard = page.write();
            let data = guard.data_mut();
            data.fill(0);
            LittleEndian::write_u16(&mut data[0..2], LEAF_TAG);
        }

        let leaf = Self { store, page, id };
        leaf.sync()?;
        Ok(leaf)
    }

    pub(crate) fn load(store: Arc<NodeStore<K, V>>, page: PageRef) -> StorageResult<Self> {
        let id = page.read().id();
        let leaf = Self { store, page, id };
        leaf.ensure_valid()?;
        Ok(leaf)
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Fail unless the page still holds a well-formed leaf header.
    pub fn ensure_valid(&self) -> StorageResult<()> {
        let page = self.page.read();
        if page.len() != self.store.page_size() {
            return Err(StorageError::WrongPageSize {
                expected: self.store.page_size(),
                actual: page.len(),
            });
        }

        let tag = page_tag(page.data());
        if tag != LEAF_TAG {
            return Err(StorageError::corruption(format!(
                "page {} is not a leaf (tag {})",
                self.id, tag
            )));
        }

        let count = LittleEndian::read_u32(&page.data()[COUNT_OFFSET..]) as usize;
        if count > self.store.max_leaf_entries() {
            return Err(StorageError::corruption(format!(
                "leaf {} claims {} entries, at most {} fit",
                self.id,
                count,
                self.store.max_leaf_entries()
            )));
        }
        Ok(())
    }

    pub fn num_entries(&self) -> usize {
        LittleEndian::read_u32(&self.page.read().data()[COUNT_OFFSET..]) as usize
    }

    pub fn max_entries(&self) -> usize {
        self.store.max_leaf_entries()
    }

    pub fn remaining_entries(&self) -> usize {
        self.max_entries().saturating_sub(self.num_entries())
    }

    pub fn is_full(&self) -> bool {
        self.num_entries() >= self.max_entries()
    }

    pub fn next_leaf_id(&self) -> Option<PageId> {
        PageId::from_raw(LittleEndian::read_u32(&self.page.read().data()[NEXT_OFFSET..]))
    }

    pub fn set_next_leaf_id(&self, next: Option<PageId>) -> StorageResult<()> {
        self.write_next(next);
        self.sync()
    }

    fn write_next(&self, next: Option<PageId>) {
        let mut page = self.page.write();
        LittleEndian::write_u32(&mut page.data_mut()[NEXT_OFFSET..], PageId::to_raw(next));
    }

    fn write_count(data: &mut [u8], count: usize) {
        LittleEndian::write_u32(&mut data[COUNT_OFFSET..], count as u32);
    }

    fn entry_offset(&self, pos: usize) -> usize {
        LEAF_HEADER_SIZE + pos * self.store.entry_len()
    }

    fn read_key(&self, pos: usize) -> StorageResult<K> {
        let offset = self.entry_offset(pos);
        let page = self.page.read();
        self.store
            .key_serializer()
            .deserialize(&page.data()[offset..offset + self.store.key_len()])
    }

    fn read_value(&self, pos: usize) -> StorageResult<V> {
        let offset = self.entry_offset(pos) + self.store.key_len();
        let page = self.page.read();
        self.store
            .value_serializer()
            .deserialize(&page.data()[offset..offset + self.store.value_len()])
    }

    fn check_position(&self, pos: usize) -> StorageResult<()> {
        let count = self.num_entries();
        if pos >= count {
            return Err(StorageError::InvalidState(format!(
                "position {} is out of range for leaf {} with {} entries",
                pos, self.id, count
            )));
        }
        Ok(())
    }

    pub fn key_at(&self, pos: usize) -> StorageResult<K> {
        self.check_position(pos)?;
        self.read_key(pos)
    }

    pub fn value_at(&self, pos: usize) -> StorageResult<V> {
        self.check_position(pos)?;
        self.read_value(pos)
    }

    pub fn first_key(&self) -> StorageResult<Option<K>> {
        if self.num_entries() == 0 {
            return Ok(None);
        }
        self.read_key(0).map(Some)
    }

    pub fn last_key(&self) -> StorageResult<Option<K>> {
        match self.num_entries() {
            0 => Ok(None),
            count => self.read_key(count - 1).map(Some),
        }
    }

    /// First position whose key is not less than `key`.
    pub(crate) fn lower_bound(&self, key: &K) -> StorageResult<usize> {
        let (mut lo, mut hi) = (0, self.num_entries());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.store.compare(&self.read_key(mid)?, key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// First position whose key is greater than `key`.
    fn upper_bound(&self, key: &K) -> StorageResult<usize> {
        let (mut lo, mut hi) = (0, self.num_entries());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.store.compare(&self.read_key(mid)?, key) != Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    pub fn contains_key(&self, key: &K) -> StorageResult<bool> {
        self.ensure_valid()?;
        let pos = self.lower_bound(key)?;
        if pos >= self.num_entries() {
            return Ok(false);
        }
        Ok(self.store.compare(&self.read_key(pos)?, key) == Ordering::Equal)
    }

    /// All values stored under `key`, in storage order.
    pub fn get(&self, key: &K) -> StorageResult<Vec<V>> {
        self.ensure_valid()?;
        let start = self.lower_bound(key)?;
        let mut values = Vec::new();
        for pos in start..self.num_entries() {
            if self.store.compare(&self.read_key(pos)?, key) != Ordering::Equal {
                break;
            }
            values.push(self.read_value(pos)?);
        }
        Ok(values)
    }

    /// Insert one entry. Duplicates are kept; a new entry goes in front of
    /// existing entries with the same key.
    ///
    /// A full leaf first tries to hand its upper entries to the next leaf and
    /// reports [`AdjustmentAction::UpdateKey`]; failing that it splits and
    /// reports [`AdjustmentAction::InsertNewNode`].
    pub fn insert(&self, key: &K, value: &V) -> StorageResult<Option<AdjustmentAction<K>>> {
        self.ensure_valid()?;

        if !self.is_full() {
            self.add_entry(key, value)?;
            self.sync()?;
            return Ok(None);
        }

        if let Some(next_id) = self.next_leaf_id() {
            let next = self.store.load_leaf(next_id)?;
            if next.remaining_entries() >= self.min_free_to_move() {
                let moved = next.remaining_entries() / 2;
                next.prepend_from(self, moved)?;
                debug!("moved {} entries from leaf {} to leaf {}", moved, self.id, next.id);

                if self.goes_right(key)? {
                    next.add_entry(key, value)?;
                } else {
                    self.add_entry(key, value)?;
                }
                self.sync()?;
                next.sync()?;

                let first = next.required_first_key()?;
                return Ok(Some(AdjustmentAction::UpdateKey { key: first }));
            }
        }

        let new_leaf = self.store.create_leaf()?;
        new_leaf.write_next(self.next_leaf_id());
        self.write_next(Some(new_leaf.id));

        new_leaf.prepend_from(self, self.num_entries() / 2)?;
        if self.goes_right(key)? {
            new_leaf.add_entry(key, value)?;
        } else {
            self.add_entry(key, value)?;
        }
        self.sync()?;
        new_leaf.sync()?;
        debug!(
            "split leaf {} ({} entries) into leaf {} ({} entries)",
            self.id,
            self.num_entries(),
            new_leaf.id,
            new_leaf.num_entries()
        );

        let first = new_leaf.required_first_key()?;
        Ok(Some(AdjustmentAction::InsertNewNode {
            key: first,
            page_id: new_leaf.id,
        }))
    }

    /// Free slots the next leaf needs before entries are moved into it
    /// instead of splitting: a quarter of the capacity, plus two.
    fn min_free_to_move(&self) -> usize {
        self.max_entries() / 4 + 2
    }

    fn goes_right(&self, key: &K) -> StorageResult<bool> {
        Ok(match self.last_key()? {
            Some(last) => self.store.compare(key, &last) == Ordering::Greater,
            None => false,
        })
    }

    fn required_first_key(&self) -> StorageResult<K> {
        self.first_key()?
            .ok_or_else(|| StorageError::corruption(format!("leaf {} is unexpectedly empty", self.id)))
    }

    /// Place one entry at its sorted position. Does not sync.
    fn add_entry(&self, key: &K, value: &V) -> StorageResult<()> {
        let key_len = self.store.key_len();
        let width = self.store.entry_len();
        let mut entry = vec![0u8; width];
        self.store.key_serializer().serialize_into(key, &mut entry[..key_len])?;
        self.store.value_serializer().serialize_into(value, &mut entry[key_len..])?;

        let count = self.num_entries();
        if count >= self.max_entries() {
            return Err(StorageError::InvalidState(format!("leaf {} is full", self.id)));
        }

        let pos = self.lower_bound(key)?;
        let start = self.entry_offset(pos);
        let end = self.entry_offset(count);

        let mut page = self.page.write();
        let data = page.data_mut();
        data.copy_within(start..end, start + width);
        data[start..start + width].copy_from_slice(&entry);
        Self::write_count(data, count + 1);
        Ok(())
    }

    /// Move the last `num` entries of `source` to the front of this leaf.
    /// Does not sync either page.
    fn prepend_from(&self, source: &LeafNode<K, V>, num: usize) -> StorageResult<()> {
        if num == 0 {
            return Ok(());
        }

        let source_count = source.num_entries();
        let count = self.num_entries();
        if num > source_count {
            return Err(StorageError::InvalidState(format!(
                "leaf {} has {} entries, cannot move {}",
                source.id, source_count, num
            )));
        }
        if count + num > self.max_entries() {
            return Err(StorageError::InvalidState(format!(
                "leaf {} has no room for {} more entries",
                self.id, num
            )));
        }
        if count > 0 {
            if let Some(last) = source.last_key()? {
                if self.store.compare(&last, &self.read_key(0)?) == Ordering::Greater {
                    return Err(StorageError::corruption(format!(
                        "moving entries from leaf {} into leaf {} would break key order",
                        source.id, self.id
                    )));
                }
            }
        }

        let size = num * self.store.entry_len();
        let source_start = source.entry_offset(source_count - num);
        let moved = source.page.read().data()[source_start..source_start + size].to_vec();

        {
            let used_end = self.entry_offset(count);
            let mut page = self.page.write();
            let data = page.data_mut();
            data.copy_within(LEAF_HEADER_SIZE..used_end, LEAF_HEADER_SIZE + size);
            data[LEAF_HEADER_SIZE..LEAF_HEADER_SIZE + size].copy_from_slice(&moved);
            Self::write_count(data, count + num);
        }

        let mut page = source.page.write();
        let data = page.data_mut();
        data[source_start..source_start + size].fill(0);
        Self::write_count(data, source_count - num);
        Ok(())
    }

    /// Remove every entry stored under `key`. Returns how many were removed.
    pub fn remove(&self, key: &K) -> StorageResult<usize> {
        self.ensure_valid()?;
        self.remove_matching(key, |_| Ok(true))
    }

    /// Remove the entries stored under `key` whose value equals `value`.
    pub fn remove_value(&self, key: &K, value: &V) -> StorageResult<usize>
    where
        V: PartialEq,
    {
        self.ensure_valid()?;
        self.remove_matching(key, |pos| Ok(self.read_value(pos)? == *value))
    }

    fn remove_matching(
        &self,
        key: &K,
        mut matches: impl FnMut(usize) -> StorageResult<bool>,
    ) -> StorageResult<usize> {
        let start = self.lower_bound(key)?;
        let end = self.upper_bound(key)?;

        let mut doomed = Vec::new();
        for pos in start..end {
            if matches(pos)? {
                doomed.push(pos);
            }
        }
        if doomed.is_empty() {
            return Ok(0);
        }

        let count = self.num_entries();
        let width = self.store.entry_len();
        {
            let mut page = self.page.write();
            let data = page.data_mut();
            let mut write = self.entry_offset(start);
            let mut doomed_iter = doomed.iter().copied().peekable();
            for pos in start..count {
                if doomed_iter.peek() == Some(&pos) {
                    doomed_iter.next();
                    continue;
                }
                let read = self.entry_offset(pos);
                if read != write {
                    data.copy_within(read..read + width, write);
                }
                write += width;
            }
            let used_end = self.entry_offset(count);
            data[write..used_end].fill(0);
            Self::write_count(data, count - doomed.len());
        }

        self.sync()?;
        Ok(doomed.len())
    }

    /// Values from the first key not less than `from` while keys stay at or
    /// below `to`. Never leaves this leaf.
    pub fn iter(&self, from: Option<&K>, to: Option<K>) -> StorageResult<LeafIter<K, V>> {
        self.ensure_valid()?;
        let start = match from {
            Some(key) => self.lower_bound(key)?,
            None => 0,
        };
        Ok(LeafIter::new(self.clone(), start, to))
    }

    pub(crate) fn compare_key_at(&self, pos: usize, key: &K) -> StorageResult<Option<Ordering>> {
        if pos >= self.num_entries() {
            return Ok(None);
        }
        Ok(Some(self.store.compare(&self.read_key(pos)?, key)))
    }

    /// Replace the contents with as many of the presorted `pairs` as fit.
    /// The next-leaf link is cleared. Returns the number of entries stored.
    pub fn bulk_initialize(&self, pairs: &[(K, V)]) -> StorageResult<usize> {
        let take = pairs.len().min(self.max_entries());
        let key_len = self.store.key_len();
        let width = self.store.entry_len();

        let mut body = vec![0u8; take * width];
        for (chunk, (key, value)) in body.chunks_mut(width).zip(pairs) {
            self.store.key_serializer().serialize_into(key, &mut chunk[..key_len])?;
            self.store.value_serializer().serialize_into(value, &mut chunk[key_len..])?;
        }

        {
            let mut page = self.page.write();
            let data = page.data_mut();
            data.fill(0);
            LittleEndian::write_u16(&mut data[0..2], LEAF_TAG);
            Self::write_count(data, take);
            data[LEAF_HEADER_SIZE..LEAF_HEADER_SIZE + body.len()].copy_from_slice(&body);
        }

        self.sync()?;
        Ok(take)
    }

    /// Verify that keys are in ascending order.
    pub fn check_structure(&self) -> StorageResult<()> {
        self.ensure_valid()?;
        let count = self.num_entries();
        if count == 0 {
            return Ok(());
        }

        let mut previous = self.read_key(0)?;
        for pos in 1..count {
            let key = self.read_key(pos)?;
            if self.store.compare(&previous, &key) == Ordering::Greater {
                return Err(StorageError::corruption(format!(
                    "leaf {} keys out of order at position {}",
                    self.id, pos
                )));
            }
            previous = key;
        }
        Ok(())
    }

    /// Like [`check_structure`](Self::check_structure), and additionally
    /// require every key to lie within `[lower, upper]`.
    pub(crate) fn check_bounds(&self, lower: Option<&K>, upper: Option<&K>) -> StorageResult<()> {
        self.check_structure()?;

        if let (Some(lower), Some(first)) = (lower, self.first_key()?) {
            if self.store.compare(&first, lower) == Ordering::Less {
                return Err(StorageError::corruption(format!(
                    "leaf {} holds a key below its separator",
                    self.id
                )));
            }
        }
        if let (Some(upper), Some(last)) = (upper, self.last_key()?) {
            if self.store.compare(&last, upper) == Ordering::Greater {
                return Err(StorageError::corruption(format!(
                    "leaf {} holds a key above its separator",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Release the backing page.
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

    // 128 byte pages hold (128 - 10) / 8 = 14 entries.
    const PAGE: usize = 128;
    const MAX: usize = 14;

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

    fn keys_of(leaf: &LeafNode<i32, i32>) -> Result<Vec<i32>> {
        let mut keys = Vec::new();
        for pos in 0..leaf.num_entries() {
            keys.push(leaf.key_at(pos)?);
        }
        Ok(keys)
    }

    #[test]
    fn test_new_leaf_is_empty() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;

        assert_eq!(leaf.num_entries(), 0);
        assert_eq!(leaf.max_entries(), MAX);
        assert_eq!(leaf.next_leaf_id(), None);
        assert_eq!(leaf.first_key()?, None);
        assert!(leaf.get(&1)?.is_empty());

        Ok(())
    }

    #[test]
    fn test_insert_keeps_keys_sorted() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;

        for key in [5, 1, 9, 3, 7] {
            assert_eq!(leaf.insert(&key, &(key * 10))?, None);
        }

        assert_eq!(keys_of(&leaf)?, vec![1, 3, 5, 7, 9]);
        assert_eq!(leaf.get(&7)?, vec![70]);
        assert!(leaf.contains_key(&9)?);
        assert!(!leaf.contains_key(&4)?);
        leaf.check_structure()?;

        Ok(())
    }

    #[test]
    fn test_duplicates_are_contiguous() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;

        leaf.insert(&2, &1)?;
        leaf.insert(&1, &0)?;
        leaf.insert(&3, &0)?;
        leaf.insert(&2, &2)?;

        assert_eq!(keys_of(&leaf)?, vec![1, 2, 2, 3]);
        let mut values = leaf.get(&2)?;
        values.sort();
        assert_eq!(values, vec![1, 2]);

        Ok(())
    }

    #[test]
    fn test_changes_reach_the_page_on_disk() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;
        leaf.insert(&4, &40)?;

        let reloaded = store.load_leaf(leaf.id())?;
        assert_eq!(reloaded.get(&4)?, vec![40]);

        Ok(())
    }

    #[test]
    fn test_split_when_full() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;

        for key in 0..MAX as i32 {
            assert_eq!(leaf.insert(&key, &key)?, None);
        }
        assert!(leaf.is_full());

        let action = leaf.insert(&(MAX as i32), &0)?;
        let Some(AdjustmentAction::InsertNewNode { key, page_id }) = action.clone() else {
            panic!("expected a split, got {:?}", action);
        };

        let right = store.load_leaf(page_id)?;
        assert_eq!(leaf.next_leaf_id(), Some(page_id));
        assert_eq!(right.first_key()?, Some(key));
        assert_eq!(leaf.num_entries() + right.num_entries(), MAX + 1);

        let left_last = leaf.last_key()?.unwrap();
        let right_first = right.first_key()?.unwrap();
        assert!(left_last < right_first);
        assert_eq!(right.last_key()?, Some(MAX as i32));

        Ok(())
    }

    #[test]
    fn test_split_splices_into_chain() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;
        let tail = store.create_leaf()?;
        // A full neighbour leaves no room to move entries.
        let fill: Vec<(i32, i32)> = (100..100 + MAX as i32).map(|k| (k, k)).collect();
        tail.bulk_initialize(&fill)?;
        leaf.set_next_leaf_id(Some(tail.id()))?;

        for key in 0..MAX as i32 {
            leaf.insert(&key, &key)?;
        }
        let Some(AdjustmentAction::InsertNewNode { page_id, .. }) = leaf.insert(&3, &3)? else {
            panic!("expected a split");
        };

        assert_eq!(leaf.next_leaf_id(), Some(page_id));
        assert_eq!(store.load_leaf(page_id)?.next_leaf_id(), Some(tail.id()));
        assert_eq!(leaf.get(&3)?.len(), 2);

        Ok(())
    }

    #[test]
    fn test_redistribute_into_next_leaf() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;
        let next = store.create_leaf()?;

        let fill: Vec<(i32, i32)> = (0..MAX as i32).map(|k| (k, k)).collect();
        assert_eq!(leaf.bulk_initialize(&fill)?, MAX);
        next.bulk_initialize(&[(100, 100)])?;
        leaf.set_next_leaf_id(Some(next.id()))?;

        // next has 13 free slots, half of them (6) are filled from this leaf
        let action = leaf.insert(&5, &55)?;
        assert_eq!(action, Some(AdjustmentAction::UpdateKey { key: 8 }));

        // The neighbour was changed through its own copy of the page.
        let next = store.load_leaf(next.id())?;
        assert_eq!(keys_of(&leaf)?, vec![0, 1, 2, 3, 4, 5, 5, 6, 7]);
        assert_eq!(keys_of(&next)?, vec![8, 9, 10, 11, 12, 13, 100]);
        leaf.check_structure()?;
        next.check_structure()?;

        Ok(())
    }

    #[test]
    fn test_redistribute_puts_large_key_right() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;
        let next = store.create_leaf()?;

        let fill: Vec<(i32, i32)> = (0..MAX as i32).map(|k| (k * 2, k)).collect();
        leaf.bulk_initialize(&fill)?;
        leaf.set_next_leaf_id(Some(next.id()))?;

        // Empty neighbour: 14 free slots, 7 entries move over.
        let action = leaf.insert(&15, &0)?;
        assert_eq!(action, Some(AdjustmentAction::UpdateKey { key: 14 }));
        assert_eq!(leaf.last_key()?, Some(12));
        let next = store.load_leaf(next.id())?;
        assert_eq!(keys_of(&next)?, vec![14, 15, 16, 18, 20, 22, 24, 26]);

        Ok(())
    }

    #[test]
    fn test_remove_all_values_of_key() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;

        for (key, value) in [(1, 1), (2, 1), (2, 2), (2, 3), (3, 1)] {
            leaf.insert(&key, &value)?;
        }

        assert_eq!(leaf.remove(&2)?, 3);
        assert_eq!(keys_of(&leaf)?, vec![1, 3]);
        assert_eq!(leaf.remove(&2)?, 0);
        assert_eq!(store.load_leaf(leaf.id())?.num_entries(), 2);

        Ok(())
    }

    #[test]
    fn test_remove_single_value() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;

        leaf.insert(&1, &10)?;
        leaf.insert(&1, &20)?;
        leaf.insert(&0, &10)?;

        assert_eq!(leaf.remove_value(&1, &10)?, 1);
        assert_eq!(leaf.get(&1)?, vec![20]);
        assert_eq!(leaf.get(&0)?, vec![10]);
        assert_eq!(leaf.remove_value(&1, &99)?, 0);

        Ok(())
    }

    #[test]
    fn test_iter_bounds() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;
        for key in 0..10 {
            leaf.insert(&key, &(key * 10))?;
        }

        let all: Vec<i32> = leaf.iter(None, None)?.collect::<StorageResult<_>>()?;
        assert_eq!(all, (0..10).map(|k| k * 10).collect::<Vec<_>>());

        let mut ranged = leaf.iter(Some(&3), Some(5))?;
        let values: Vec<i32> = ranged.by_ref().collect::<StorageResult<_>>()?;
        assert_eq!(values, vec![30, 40, 50]);
        assert!(ranged.passed_upper_bound());

        let mut tail = leaf.iter(Some(&8), Some(100))?;
        assert_eq!(tail.by_ref().count(), 2);
        assert!(!tail.passed_upper_bound());

        Ok(())
    }

    #[test]
    fn test_bulk_initialize_caps_at_capacity() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;
        leaf.insert(&-1, &-1)?;

        let pairs: Vec<(i32, i32)> = (0..20).map(|k| (k, k)).collect();
        assert_eq!(leaf.bulk_initialize(&pairs)?, MAX);
        assert_eq!(leaf.first_key()?, Some(0));
        assert_eq!(leaf.last_key()?, Some(MAX as i32 - 1));

        Ok(())
    }

    #[test]
    fn test_check_structure_detects_disorder() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;

        leaf.bulk_initialize(&[(5, 0), (1, 0)])?;
        assert!(matches!(
            leaf.check_structure(),
            Err(StorageError::StructuralCorruption(_))
        ));

        Ok(())
    }

    #[test]
    fn test_destroy_releases_page() -> Result<()> {
        let (store, _dir) = create_test_store()?;
        let leaf = store.create_leaf()?;
        let id = leaf.id();

        leaf.destroy()?;
        assert!(!store.manager().has_page(id)?);

        Ok(())
    }
}
