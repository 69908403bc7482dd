use anyhow::Result;
use pagetree::access::btree::{AdjustmentAction, BTree, KeyRange, NodeStore};
use pagetree::access::comparator::{NaturalOrder, ReverseOrder};
use pagetree::access::serializer::{FixedStringSerializer, I32Serializer, I64Serializer};
use pagetree::storage::{
    CacheMode, FileResourceManager, ReferenceCachedResourceManager, ResourceManager,
    ResourceManagerBuilder, StorageError, StorageResult, TreeConfig,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const PAGE_SIZE: usize = 128;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_tree(path: &Path, cache: CacheMode) -> Result<BTree<i32, i32>> {
    let manager = ResourceManagerBuilder::new(path)
        .page_size(PAGE_SIZE)
        .cache(cache)
        .open()?;
    let mut tree = BTree::new(manager, I32Serializer, I32Serializer, NaturalOrder, TreeConfig::default())?;
    tree.open()?;
    Ok(tree)
}

fn collect<K: Clone, V>(tree: &BTree<K, V>) -> StorageResult<Vec<V>> {
    tree.iter()?.collect()
}

#[test]
fn test_round_trip_across_reopen() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = dir.path().join("test.db");

    {
        let mut tree = open_tree(&path, CacheMode::default())?;
        for i in 0..500 {
            tree.add(i, i * 3)?;
        }
        tree.add(42, -1)?;
        tree.close()?;
    }

    let tree = open_tree(&path, CacheMode::default())?;
    assert_eq!(tree.size(), 501);
    assert!(tree.depth() > 1);
    tree.check_structure()?;

    for i in 0..500 {
        assert!(tree.get(&i)?.contains(&(i * 3)), "missing value for key {}", i);
    }
    let mut values = tree.get(&42)?;
    values.sort();
    assert_eq!(values, vec![-1, 126]);

    Ok(())
}

#[test]
fn test_sort_invariant_holds_after_every_insert() -> Result<()> {
    init_logger();
    let dir = tempdir()?;

    let mut ascending = open_tree(&dir.path().join("asc.db"), CacheMode::Disabled)?;
    let mut descending = open_tree(&dir.path().join("desc.db"), CacheMode::Lru { capacity: 8 })?;
    for i in 0..300 {
        ascending.add(i, i)?;
        ascending.check_structure()?;
        descending.add(299 - i, i)?;
        descending.check_structure()?;
    }

    assert_eq!(collect(&ascending)?, (0..300).collect::<Vec<_>>());
    assert_eq!(collect(&descending)?, (0..300).rev().collect::<Vec<_>>());

    Ok(())
}

#[test]
fn test_random_order_iterates_ascending() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let mut tree = open_tree(&dir.path().join("test.db"), CacheMode::default())?;

    let mut keys: Vec<i32> = (0..1000).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(42));
    for &key in &keys {
        tree.add(key, key)?;
    }

    tree.check_structure()?;
    assert_eq!(tree.size(), 1000);
    assert_eq!(collect(&tree)?, (0..1000).collect::<Vec<_>>());

    Ok(())
}

#[test]
fn test_overlapping_ranges_are_merged() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let mut tree = open_tree(&dir.path().join("test.db"), CacheMode::default())?;

    for i in 0..100 {
        tree.add(i, i)?;
    }

    let ranges = [
        KeyRange::between(-5, 5),
        KeyRange::between(50, 55),
        KeyRange::between(52, 53),
        KeyRange::between(49, 53),
        KeyRange::between(52, 56),
        KeyRange::between(95, 1000),
    ];
    let values: Vec<i32> = tree.iter_ranges(&ranges)?.collect::<StorageResult<_>>()?;

    let expected: Vec<i32> = (0..=5).chain(49..=56).chain(95..=99).collect();
    assert_eq!(values, expected);

    Ok(())
}

#[test]
fn test_remove_single_duplicate() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let mut tree = open_tree(&dir.path().join("test.db"), CacheMode::default())?;

    tree.add(5, 100)?;
    tree.add(5, 200)?;
    assert_eq!(tree.remove_value(&5, &100)?, 1);
    assert_eq!(tree.get(&5)?, vec![200]);
    assert_eq!(tree.size(), 1);

    Ok(())
}

#[test]
fn test_leaf_split_signal() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let manager: Arc<dyn ResourceManager> =
        Arc::new(FileResourceManager::new(dir.path().join("test.db"), PAGE_SIZE, false)?);
    manager.open()?;

    let store: Arc<NodeStore<i32, i32>> = NodeStore::new(
        manager,
        Arc::new(I32Serializer),
        Arc::new(I32Serializer),
        Arc::new(NaturalOrder),
        TreeConfig::default(),
    )?;
    let leaf = store.create_leaf()?;
    let max = leaf.max_entries() as i32;

    let mut signals = Vec::new();
    for i in 0..=max {
        if let Some(action) = leaf.insert(&i, &i)? {
            signals.push(action);
        }
    }
    assert_eq!(signals.len(), 1);

    let AdjustmentAction::InsertNewNode { key, page_id } = signals[0].clone() else {
        panic!("expected a split, got {:?}", signals[0]);
    };
    let right = store.load_leaf(page_id)?;
    assert_eq!(leaf.next_leaf_id(), Some(page_id));
    assert_eq!(right.first_key()?, Some(key));

    let left_last = leaf.last_key()?.unwrap_or(i32::MIN);
    assert!(left_last < key);
    assert_eq!(left_last + 1, key);
    assert_eq!(leaf.num_entries() + right.num_entries(), max as usize + 1);

    Ok(())
}

#[test]
fn test_identity_cache_under_tree() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let file = FileResourceManager::new(dir.path().join("test.db"), PAGE_SIZE, false)?;
    let cache = Arc::new(ReferenceCachedResourceManager::new(file, 4));
    let manager: Arc<dyn ResourceManager> = cache.clone();
    manager.open()?;

    let mut tree: BTree<i32, i32> = BTree::new(manager.clone(), I32Serializer, I32Serializer, NaturalOrder, TreeConfig::default())?;
    tree.open()?;
    for i in 0..200 {
        tree.add(i, i)?;
    }
    tree.check_structure()?;

    let root_id = tree.root_id().ok_or_else(|| anyhow::anyhow!("tree has no root"))?;
    let first = manager.get_page(root_id)?;
    let second = manager.get_page(root_id)?;
    assert!(Arc::ptr_eq(&first, &second));

    let content = first.read().data().to_vec();
    drop(second);
    drop(first);
    cache.evict(root_id);

    let reloaded = manager.get_page(root_id)?;
    assert_eq!(reloaded.read().data(), content.as_slice());

    assert_eq!(collect(&tree)?, (0..200).collect::<Vec<_>>());

    Ok(())
}

#[test]
fn test_string_keys_in_reverse_order() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let manager = ResourceManagerBuilder::new(dir.path().join("test.db"))
        .page_size(256)
        .open()?;

    let mut tree: BTree<String, i64> = BTree::new(
        manager,
        FixedStringSerializer::new(12),
        I64Serializer,
        ReverseOrder,
        TreeConfig::default(),
    )?;
    tree.open()?;

    let words = ["pear", "apple", "fig", "kiwi", "banana", "cherry", "date", "grape"];
    for (i, word) in words.iter().enumerate() {
        tree.add(word.to_string(), i as i64)?;
    }
    tree.check_structure()?;

    // Reverse order: "pear" first, "apple" last.
    let values: Vec<i64> = tree.iter()?.collect::<StorageResult<_>>()?;
    assert_eq!(values, vec![0, 3, 7, 2, 6, 5, 4, 1]);
    assert_eq!(tree.get(&"kiwi".to_string())?, vec![3]);

    let result = tree.add("much too long for the key".to_string(), 99);
    assert!(matches!(result, Err(StorageError::SerializationOverflow { .. })));

    Ok(())
}

#[test]
fn test_closed_tree_is_invalid() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let mut tree = open_tree(&dir.path().join("test.db"), CacheMode::default())?;

    tree.add(1, 1)?;
    tree.close()?;
    assert!(!tree.is_valid());
    assert!(matches!(tree.add(2, 2), Err(StorageError::InvalidState(_))));
    // Closing again is harmless.
    tree.close()?;

    Ok(())
}

#[test]
fn test_bulk_loaded_tree_survives_reopen() -> Result<()> {
    init_logger();
    let dir = tempdir()?;
    let path = dir.path().join("test.db");

    let pairs: Vec<(i32, i32)> = (0..2000).map(|i| (i, -i)).collect();
    {
        let mut tree = open_tree(&path, CacheMode::Reference { capacity: 16 })?;
        tree.bulk_initialize(&pairs)?;
        tree.check_structure()?;
        tree.close()?;
    }

    let tree = open_tree(&path, CacheMode::Disabled)?;
    assert_eq!(tree.size(), 2000);
    tree.check_structure()?;
    assert_eq!(tree.get(&1234)?, vec![-1234]);

    let values: Vec<i32> = tree.iter_range(Some(10), Some(14))?.collect::<StorageResult<_>>()?;
    assert_eq!(values, vec![-10, -11, -12, -13, -14]);

    Ok(())
}
