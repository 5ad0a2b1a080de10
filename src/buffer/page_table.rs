use log::debug;
use parking_lot::Mutex;

use crate::common::{FrameId, PageId};

/// Hash used to address the directory. Integer-like keys hash to their own
/// value, so the directory consults the key's literal low bits.
pub trait BucketKey: Copy + Eq {
    fn bucket_hash(&self) -> u64;
}

impl BucketKey for PageId {
    fn bucket_hash(&self) -> u64 {
        self.as_u32() as u64
    }
}

impl BucketKey for FrameId {
    fn bucket_hash(&self) -> u64 {
        self.as_u32() as u64
    }
}

impl BucketKey for u32 {
    fn bucket_hash(&self) -> u64 {
        *self as u64
    }
}

impl BucketKey for u64 {
    fn bucket_hash(&self) -> u64 {
        *self
    }
}

#[derive(Debug)]
struct Bucket<K, V> {
    /// Number of low hash bits this bucket is responsible for
    local_depth: u32,
    items: Vec<(K, V)>,
}

impl<K: BucketKey, V: Copy> Bucket<K, V> {
    fn new(local_depth: u32) -> Self {
        Self {
            local_depth,
            items: Vec::new(),
        }
    }
}

struct TableInner<K, V> {
    /// Number of low hash bits the directory consults
    global_depth: u32,
    /// Count of distinct buckets
    num_buckets: usize,
    /// Directory of 2^global_depth slots, each an index into `buckets`
    directory: Vec<usize>,
    /// Bucket storage; splitting reuses the old slot for the zero-bit half
    /// and appends the one-bit half
    buckets: Vec<Bucket<K, V>>,
}

/// Extendible hash table mapping keys to values, used by the buffer pool as
/// its page table (page id to frame id). The directory doubles on demand and
/// a full bucket splits in place, so growth never rehashes the whole table.
///
/// A single mutex serializes reads and writes.
pub struct ExtendibleHashTable<K, V> {
    /// Capacity of one bucket
    bucket_size: usize,
    inner: Mutex<TableInner<K, V>>,
}

impl<K: BucketKey, V: Copy> ExtendibleHashTable<K, V> {
    /// Creates a table with global depth 0: a one-slot directory pointing at
    /// a single empty bucket of the given capacity.
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        Self {
            bucket_size,
            inner: Mutex::new(TableInner {
                global_depth: 0,
                num_buckets: 1,
                directory: vec![0],
                buckets: vec![Bucket::new(0)],
            }),
        }
    }

    /// Looks up the value stored under `key`.
    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let bucket = &inner.buckets[inner.directory[Self::dir_index(&inner, key)]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|&(_, v)| v)
    }

    /// Removes the entry stored under `key`. Returns whether it existed.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let slot = inner.directory[Self::dir_index(&inner, key)];
        let bucket = &mut inner.buckets[slot];
        match bucket.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                bucket.items.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Inserts `key -> value`, overwriting any existing entry for the key.
    /// A full target bucket splits (doubling the directory when its local
    /// depth has caught up with the global depth) until the key fits.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        let slot = inner.directory[Self::dir_index(&inner, &key)];
        if let Some(entry) = inner.buckets[slot].items.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return;
        }

        loop {
            let dir_index = Self::dir_index(&inner, &key);
            let slot = inner.directory[dir_index];
            if inner.buckets[slot].items.len() < self.bucket_size {
                break;
            }

            if inner.buckets[slot].local_depth == inner.global_depth {
                // The directory is too coarse to tell the two halves apart;
                // double it, with each new slot aliasing its low-bits twin.
                let old_size = inner.directory.len();
                inner.global_depth += 1;
                for i in 0..old_size {
                    let twin = inner.directory[i];
                    inner.directory.push(twin);
                }
                debug!(
                    "hash directory doubled to {} slots (global depth {})",
                    inner.directory.len(),
                    inner.global_depth
                );
            }

            self.split_bucket(&mut inner, dir_index);
        }

        let dir_index = Self::dir_index(&inner, &key);
        let slot = inner.directory[dir_index];
        inner.buckets[slot].items.push((key, value));
    }

    /// Splits the bucket behind `dir_index`. The old slot keeps the entries
    /// whose split bit is 0; a fresh bucket takes the rest; every directory
    /// slot that aliased the old bucket is rebound by its split bit.
    fn split_bucket(&self, inner: &mut TableInner<K, V>, dir_index: usize) {
        let zero_slot = inner.directory[dir_index];
        let old_depth = inner.buckets[zero_slot].local_depth;
        let split_bit = 1usize << old_depth;
        let new_depth = old_depth + 1;

        let one_slot = inner.buckets.len();
        inner.buckets.push(Bucket::new(new_depth));
        inner.buckets[zero_slot].local_depth = new_depth;

        let items = std::mem::take(&mut inner.buckets[zero_slot].items);
        for (k, v) in items {
            if k.bucket_hash() as usize & split_bit != 0 {
                inner.buckets[one_slot].items.push((k, v));
            } else {
                inner.buckets[zero_slot].items.push((k, v));
            }
        }

        let signature = dir_index & (split_bit - 1);
        let mut i = signature;
        while i < inner.directory.len() {
            inner.directory[i] = if i & split_bit != 0 { one_slot } else { zero_slot };
            i += split_bit;
        }

        inner.num_buckets += 1;
    }

    fn dir_index(inner: &TableInner<K, V>, key: &K) -> usize {
        let mask = (1usize << inner.global_depth) - 1;
        key.bucket_hash() as usize & mask
    }

    /// Number of low hash bits the directory consults.
    pub fn global_depth(&self) -> u32 {
        self.inner.lock().global_depth
    }

    /// Number of low hash bits the bucket behind `dir_index` consults.
    pub fn local_depth(&self, dir_index: usize) -> u32 {
        let inner = self.inner.lock();
        inner.buckets[inner.directory[dir_index]].local_depth
    }

    /// Count of distinct buckets.
    pub fn num_buckets(&self) -> usize {
        self.inner.lock().num_buckets
    }

    /// Number of directory slots (2^global_depth).
    pub fn dir_size(&self) -> usize {
        self.inner.lock().directory.len()
    }

    /// Total number of stored entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        let mut seen = vec![false; inner.buckets.len()];
        let mut count = 0;
        for &slot in &inner.directory {
            if !seen[slot] {
                seen[slot] = true;
                count += inner.buckets[slot].items.len();
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry, used by the buffer pool to walk resident
    /// pages under its own latch.
    pub fn entries(&self) -> Vec<(K, V)> {
        let inner = self.inner.lock();
        let mut seen = vec![false; inner.buckets.len()];
        let mut out = Vec::new();
        for &slot in &inner.directory {
            if !seen[slot] {
                seen[slot] = true;
                out.extend(inner.buckets[slot].items.iter().copied());
            }
        }
        out
    }
}
