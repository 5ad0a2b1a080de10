//! Sable - the storage-engine core of an embedded disk-backed database
//!
//! The crate caches fixed-size disk pages in a bounded buffer pool and
//! builds an ordered key index on top of the cached pages.
//!
//! # Architecture
//!
//! - **Storage Layer** (`storage`): disk I/O and page bookkeeping
//!   - `DiskManager`: reads, writes, allocates, and frees pages of a single
//!     database file
//!   - `DiskScheduler`: background-thread disk I/O with synchronous
//!     completion
//!   - `HeaderPage`: the page-0 catalog of `(index name, root page id)`
//!     records
//!
//! - **Buffer Pool** (`buffer`): memory management for database pages
//!   - `BufferPoolManager`: pins pages into frames and arbitrates eviction
//!   - `LruKReplacer`: LRU-K victim selection
//!   - `ExtendibleHashTable`: the page table mapping resident page ids to
//!     frames
//!   - `ReadPageGuard`/`WritePageGuard`: RAII pins over a frame's bytes
//!
//! - **Index** (`index`): a disk-resident B+ tree
//!   - `BPlusTree`: unique key to record-id map with ordered iteration
//!   - `BTreeIterator`: leaf-chain scan in key order
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sable::buffer::BufferPoolManager;
//! use sable::common::{PageId, RecordId};
//! use sable::index::{BPlusTree, U32Comparator};
//! use sable::storage::disk::DiskManager;
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, 2, disk_manager));
//!
//! let mut index = BPlusTree::new("demo", bpm, U32Comparator, 32, 32).unwrap();
//! index.insert(42, RecordId::new(PageId::new(7), 0)).unwrap();
//! assert!(index.get_value(42).unwrap().is_some());
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{PageId, RecordId, Result, SableError};
