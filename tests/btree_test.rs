//! Integration tests for the B+ tree index

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use sable::buffer::BufferPoolManager;
use sable::common::{PageId, RecordId};
use sable::index::{BPlusTree, BTreeNodeRef, U32Comparator};
use sable::storage::disk::DiskManager;
use tempfile::NamedTempFile;

fn create_bpm(pool_size: usize) -> (Arc<BufferPoolManager>, NamedTempFile) {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    (Arc::new(BufferPoolManager::new(pool_size, 2, dm)), temp_file)
}

fn rid(key: u32) -> RecordId {
    RecordId::new(PageId::new(key / 8), key % 8)
}

#[test]
fn test_insert_and_get() {
    let (bpm, _temp) = create_bpm(16);
    let mut tree = BPlusTree::new("basic", bpm, U32Comparator, 4, 4).unwrap();

    assert!(tree.is_empty());
    assert_eq!(tree.get_value(10).unwrap(), None);

    assert!(tree.insert(10, rid(10)).unwrap());
    assert!(!tree.is_empty());
    assert_eq!(tree.get_value(10).unwrap(), Some(rid(10)));
    assert_eq!(tree.get_value(11).unwrap(), None);
}

#[test]
fn test_duplicate_insert_rejected() {
    let (bpm, _temp) = create_bpm(16);
    let mut tree = BPlusTree::new("dups", bpm, U32Comparator, 4, 4).unwrap();

    assert!(tree.insert(7, rid(7)).unwrap());
    assert!(!tree.insert(7, RecordId::new(PageId::new(99), 99)).unwrap());

    // The original mapping is untouched.
    assert_eq!(tree.get_value(7).unwrap(), Some(rid(7)));
}

#[test]
fn test_descending_inserts_split_to_height_two() {
    // Leaf fanout 4, internal fanout 4: five descending inserts overflow
    // the root leaf and leave a two-level tree.
    let (bpm, _temp) = create_bpm(16);
    let mut tree = BPlusTree::new("split", Arc::clone(&bpm), U32Comparator, 4, 4).unwrap();

    for key in [5u32, 4, 3, 2, 1] {
        assert!(tree.insert(key, rid(key)).unwrap());
    }

    // Root is internal, all of its children are leaves.
    let root_id = tree.root_page_id();
    let guard = bpm.checked_read_page(root_id).unwrap().unwrap();
    let root = BTreeNodeRef::new(guard.data());
    assert!(!root.is_leaf());
    for i in 0..root.size() as usize {
        let child_guard = bpm.checked_read_page(root.child_at(i)).unwrap().unwrap();
        let child = BTreeNodeRef::new(child_guard.data());
        assert!(child.is_leaf());
        assert_eq!(child.parent_page_id(), root_id);
    }
    drop(guard);

    for key in 1..=5u32 {
        assert_eq!(tree.get_value(key).unwrap(), Some(rid(key)), "key {}", key);
    }
}

#[test]
fn test_delete_merges_and_collapses_root() {
    let (bpm, _temp) = create_bpm(16);
    let mut tree = BPlusTree::new("merge", Arc::clone(&bpm), U32Comparator, 4, 4).unwrap();

    for key in [5u32, 4, 3, 2, 1] {
        tree.insert(key, rid(key)).unwrap();
    }

    tree.remove(5).unwrap();
    tree.remove(4).unwrap();
    tree.remove(3).unwrap();

    // The leaves merged and the root collapsed back to a single leaf.
    let guard = bpm.checked_read_page(tree.root_page_id()).unwrap().unwrap();
    let root = BTreeNodeRef::new(guard.data());
    assert!(root.is_leaf());
    drop(guard);

    assert_eq!(tree.get_value(1).unwrap(), Some(rid(1)));
    assert_eq!(tree.get_value(2).unwrap(), Some(rid(2)));
    assert_eq!(tree.get_value(3).unwrap(), None);
}

#[test]
fn test_delete_to_empty_and_reuse() {
    let (bpm, _temp) = create_bpm(16);
    let mut tree = BPlusTree::new("drain", bpm, U32Comparator, 4, 4).unwrap();

    for key in 1..=10u32 {
        tree.insert(key, rid(key)).unwrap();
    }
    for key in 1..=10u32 {
        tree.remove(key).unwrap();
    }

    assert!(tree.is_empty());
    assert_eq!(tree.get_value(5).unwrap(), None);
    assert_eq!(tree.iter().unwrap().count(), 0);

    // An emptied tree starts over cleanly.
    assert!(tree.insert(42, rid(42)).unwrap());
    assert_eq!(tree.get_value(42).unwrap(), Some(rid(42)));
}

#[test]
fn test_remove_absent_key_is_noop() {
    let (bpm, _temp) = create_bpm(16);
    let mut tree = BPlusTree::new("noop", bpm, U32Comparator, 4, 4).unwrap();

    tree.remove(1).unwrap(); // empty tree

    tree.insert(1, rid(1)).unwrap();
    tree.insert(2, rid(2)).unwrap();
    tree.remove(3).unwrap(); // absent key

    assert_eq!(tree.get_value(1).unwrap(), Some(rid(1)));
    assert_eq!(tree.get_value(2).unwrap(), Some(rid(2)));
}

#[test]
fn test_iterator_yields_sorted_sequence() {
    // Keys 1..=100 inserted shuffled come back in order exactly once.
    let (bpm, _temp) = create_bpm(32);
    let mut tree = BPlusTree::new("scan", bpm, U32Comparator, 4, 4).unwrap();

    let mut keys: Vec<u32> = (1..=100).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5ab1e);
    keys.shuffle(&mut rng);

    for &key in &keys {
        assert!(tree.insert(key, rid(key)).unwrap());
    }

    let scanned: Vec<(u32, RecordId)> = tree
        .iter()
        .unwrap()
        .collect::<sable::Result<Vec<_>>>()
        .unwrap();
    let expected: Vec<(u32, RecordId)> = (1..=100).map(|k| (k, rid(k))).collect();
    assert_eq!(scanned, expected);
}

#[test]
fn test_iterator_from_key() {
    let (bpm, _temp) = create_bpm(32);
    let mut tree = BPlusTree::new("seek", bpm, U32Comparator, 4, 4).unwrap();

    for key in 1..=100u32 {
        tree.insert(key, rid(key)).unwrap();
    }

    // Positioned exactly at the probe key.
    let from_50: Vec<u32> = tree
        .iter_from(50)
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(from_50, (50..=100).collect::<Vec<u32>>());

    // An absent probe starts at the smallest key above it.
    tree.remove(50).unwrap();
    let after_gap: Vec<u32> = tree
        .iter_from(50)
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(after_gap, (51..=100).collect::<Vec<u32>>());

    // Past the largest key the iterator is immediately exhausted.
    assert_eq!(tree.iter_from(101).unwrap().count(), 0);
}

#[test]
fn test_interleaved_inserts_and_deletes_round_trip() {
    // Whatever the order of operations, the final scan must equal the net
    // key set.
    let (bpm, _temp) = create_bpm(32);
    let mut tree = BPlusTree::new("churn", bpm, U32Comparator, 4, 4).unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(0xc0ffee);
    let mut keys: Vec<u32> = (1..=200).collect();
    keys.shuffle(&mut rng);

    let mut expected = BTreeSet::new();
    for &key in &keys {
        tree.insert(key, rid(key)).unwrap();
        expected.insert(key);
    }

    keys.shuffle(&mut rng);
    for &key in keys.iter().take(140) {
        tree.remove(key).unwrap();
        expected.remove(&key);
    }

    for &key in &keys {
        assert_eq!(
            tree.get_value(key).unwrap().is_some(),
            expected.contains(&key),
            "membership mismatch for {}",
            key
        );
    }

    let scanned: Vec<u32> = tree
        .iter()
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    let expected_sorted: Vec<u32> = expected.iter().copied().collect();
    assert_eq!(scanned, expected_sorted);
}

#[test]
fn test_tree_survives_reopen() {
    let temp_file = NamedTempFile::new().unwrap();

    let root_before = {
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(16, 2, dm));
        let mut tree =
            BPlusTree::new("persistent", Arc::clone(&bpm), U32Comparator, 4, 4).unwrap();
        for key in 1..=30u32 {
            tree.insert(key, rid(key)).unwrap();
        }
        bpm.flush_all_pages().unwrap();
        tree.root_page_id()
    };

    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(16, 2, dm));
    let tree = BPlusTree::new("persistent", bpm, U32Comparator, 4, 4).unwrap();

    // The header record hands back the old root.
    assert_eq!(tree.root_page_id(), root_before);
    for key in 1..=30u32 {
        assert_eq!(tree.get_value(key).unwrap(), Some(rid(key)), "key {}", key);
    }
}

#[test]
fn test_two_indexes_share_header_page() {
    let (bpm, _temp) = create_bpm(32);

    let mut orders = BPlusTree::new("orders", Arc::clone(&bpm), U32Comparator, 4, 4).unwrap();
    let mut users = BPlusTree::new("users", Arc::clone(&bpm), U32Comparator, 4, 4).unwrap();

    for key in 1..=20u32 {
        orders.insert(key, rid(key)).unwrap();
        users.insert(key * 1000, rid(key)).unwrap();
    }

    assert_eq!(orders.get_value(7).unwrap(), Some(rid(7)));
    assert_eq!(orders.get_value(7000).unwrap(), None);
    assert_eq!(users.get_value(7000).unwrap(), Some(rid(7)));
    assert_ne!(orders.root_page_id(), users.root_page_id());
}

#[test]
fn test_leaf_chain_stays_sorted_under_churn() {
    // Invariant: after any mix of operations the leaf chain enumerates all
    // keys ascending with no duplicates.
    let (bpm, _temp) = create_bpm(32);
    let mut tree = BPlusTree::new("chain", bpm, U32Comparator, 5, 4).unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut keys: Vec<u32> = (0..150).map(|i| i * 3).collect();
    keys.shuffle(&mut rng);

    for (round, &key) in keys.iter().enumerate() {
        tree.insert(key, rid(key)).unwrap();
        if round % 3 == 2 {
            // Periodically delete the round's key again to churn siblings.
            tree.remove(key).unwrap();
        }
    }

    let scanned: Vec<u32> = tree
        .iter()
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    let mut sorted = scanned.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(scanned, sorted, "leaf chain out of order or duplicated");
}
