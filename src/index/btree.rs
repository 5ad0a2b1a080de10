use std::sync::Arc;

use log::debug;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{
    PageId, RecordId, Result, SableError, HEADER_PAGE_ID, INVALID_PAGE_ID,
};
use crate::storage::page::{HeaderPage, HeaderPageRef};

use super::btree_page::{BTreeNode, BTreeNodeRef, INTERNAL_CAPACITY, LEAF_CAPACITY};
use super::index_iterator::BTreeIterator;
use super::key_comparator::{IndexKey, KeyComparator};

/// A rebalance that still has to run against an ancestor: remove `key` from
/// `page_id`, then rebalance that node in turn.
struct PendingRemoval {
    page_id: PageId,
    key: IndexKey,
}

/// What one rebalance step decided: pages to hand back to the pool (merged
/// nodes, collapsed roots) and an optional next step up the tree.
struct StepOutcome {
    freed: Vec<PageId>,
    reparent: Vec<(PageId, PageId)>,
    next: Option<PendingRemoval>,
}

impl StepOutcome {
    fn done() -> Self {
        Self {
            freed: Vec::new(),
            reparent: Vec::new(),
            next: None,
        }
    }
}

/// Disk-resident B+ tree mapping fixed-width keys to record ids, with every
/// node living in a buffer-pool page.
///
/// `leaf_max_size` is the leaf fanout: a leaf holds at most
/// `leaf_max_size - 1` entries. `internal_max_size` bounds an internal
/// node's child count. The tree registers `(name, root_page_id)` in the
/// header page at page 0 and rewrites that record on every root change, so
/// reopening a database finds its indexes again.
///
/// Mutating operations take `&mut self`; shared use goes behind the caller's
/// lock, which is what gives each top-level operation its atomicity.
pub struct BPlusTree<C: KeyComparator> {
    index_name: String,
    root_page_id: PageId,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    leaf_max_size: u32,
    internal_max_size: u32,
}

impl<C: KeyComparator> BPlusTree<C> {
    /// Opens the index named `name`, creating its header record when absent.
    /// An existing record's root page id is adopted, reattaching to a tree
    /// persisted by an earlier run.
    pub fn new(
        name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        let index_name = name.into();
        assert!(
            (3..=LEAF_CAPACITY as u32).contains(&leaf_max_size),
            "leaf fanout out of range"
        );
        assert!(
            (3..=INTERNAL_CAPACITY as u32).contains(&internal_max_size),
            "internal fanout out of range"
        );

        let existing = {
            let guard = bpm
                .checked_read_page(HEADER_PAGE_ID)?
                .ok_or(SableError::PageNotFound(HEADER_PAGE_ID))?;
            HeaderPageRef::new(guard.data()).root_page_id(&index_name)
        };

        let root_page_id = match existing {
            Some(root) => root,
            None => {
                let mut guard = bpm
                    .checked_write_page(HEADER_PAGE_ID)?
                    .ok_or(SableError::PageNotFound(HEADER_PAGE_ID))?;
                let mut header = HeaderPage::new(guard.data_mut());
                if !header.insert_record(&index_name, INVALID_PAGE_ID) {
                    return Err(SableError::HeaderPageFull);
                }
                INVALID_PAGE_ID
            }
        };

        Ok(Self {
            index_name,
            root_page_id,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    pub fn name(&self) -> &str {
        &self.index_name
    }

    /// Point lookup.
    pub fn get_value(&self, key: IndexKey) -> Result<Option<RecordId>> {
        if self.is_empty() {
            return Ok(None);
        }

        let guard = self.find_leaf_guard(key)?;
        let node = BTreeNodeRef::new(guard.data());
        Ok(match node.leaf_lookup(key, &self.comparator) {
            Ok(index) => Some(node.rid_at(index)),
            Err(_) => None,
        })
    }

    /// Inserts a unique key. Returns false (without mutating anything) when
    /// the key already exists. Pages allocated by an attempt that fails are
    /// handed back to the pool before the error propagates.
    pub fn insert(&mut self, key: IndexKey, rid: RecordId) -> Result<bool> {
        let mut allocated = Vec::new();
        match self.insert_inner(key, rid, &mut allocated) {
            Ok(inserted) => Ok(inserted),
            Err(e) => {
                for page_id in allocated {
                    let _ = self.bpm.delete_page(page_id);
                }
                Err(e)
            }
        }
    }

    /// Removes a key; absent keys are a no-op.
    pub fn remove(&mut self, key: IndexKey) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        let leaf_id = self.find_leaf_guard(key)?.page_id();

        let mut pending = Some(PendingRemoval {
            page_id: leaf_id,
            key,
        });
        while let Some(step) = pending.take() {
            let outcome = self.remove_entry_step(step)?;
            for (child, new_parent) in outcome.reparent {
                let mut guard = self
                    .bpm
                    .checked_write_page(child)?
                    .ok_or(SableError::PageNotFound(child))?;
                BTreeNode::new(guard.data_mut()).set_parent_page_id(new_parent);
            }
            for page_id in outcome.freed {
                self.bpm.delete_page(page_id)?;
            }
            pending = outcome.next;
        }
        Ok(())
    }

    /// Iterator over the whole tree in ascending key order.
    pub fn iter(&self) -> Result<BTreeIterator> {
        if self.is_empty() {
            return Ok(BTreeIterator::end(Arc::clone(&self.bpm)));
        }

        // Walk the zero'th child pointers down to the leftmost leaf,
        // pinning each child before letting go of its parent.
        let mut guard = self
            .bpm
            .checked_read_page(self.root_page_id)?
            .ok_or(SableError::PageNotFound(self.root_page_id))?;
        loop {
            let child = {
                let node = BTreeNodeRef::new(guard.data());
                if node.is_leaf() {
                    None
                } else {
                    Some(node.child_at(0))
                }
            };
            match child {
                None => return Ok(BTreeIterator::new(Arc::clone(&self.bpm), guard.page_id(), 0)),
                Some(child_id) => {
                    let child_guard = self
                        .bpm
                        .checked_read_page(child_id)?
                        .ok_or(SableError::PageNotFound(child_id))?;
                    guard = child_guard;
                }
            }
        }
    }

    /// Iterator positioned at the smallest key that is >= `key`.
    pub fn iter_from(&self, key: IndexKey) -> Result<BTreeIterator> {
        if self.is_empty() {
            return Ok(BTreeIterator::end(Arc::clone(&self.bpm)));
        }

        let guard = self.find_leaf_guard(key)?;
        let node = BTreeNodeRef::new(guard.data());
        let index = match node.leaf_lookup(key, &self.comparator) {
            Ok(index) => index,
            Err(index) => index,
        };
        Ok(BTreeIterator::new(
            Arc::clone(&self.bpm),
            guard.page_id(),
            index,
        ))
    }

    /// Descends to the leaf covering `key`, pinning each child before
    /// unpinning its parent, and returns the leaf's guard.
    fn find_leaf_guard(&self, key: IndexKey) -> Result<ReadPageGuard> {
        let mut guard = self
            .bpm
            .checked_read_page(self.root_page_id)?
            .ok_or(SableError::PageNotFound(self.root_page_id))?;
        loop {
            let child = {
                let node = BTreeNodeRef::new(guard.data());
                if node.is_leaf() {
                    None
                } else {
                    Some(node.child_at(node.child_index_for(key, &self.comparator)))
                }
            };
            match child {
                None => return Ok(guard),
                Some(child_id) => {
                    let child_guard = self
                        .bpm
                        .checked_read_page(child_id)?
                        .ok_or(SableError::PageNotFound(child_id))?;
                    guard = child_guard;
                }
            }
        }
    }

    fn insert_inner(
        &mut self,
        key: IndexKey,
        rid: RecordId,
        allocated: &mut Vec<PageId>,
    ) -> Result<bool> {
        if self.is_empty() {
            let mut guard = self.bpm.new_page()?;
            let page_id = guard.page_id();
            allocated.push(page_id);

            let mut node = BTreeNode::new(guard.data_mut());
            node.init_leaf(page_id, self.leaf_max_size);
            node.leaf_insert(key, rid, &self.comparator);
            drop(guard);

            self.set_root_page_id(page_id)?;
            debug!("{}: started tree at leaf {}", self.index_name, page_id);
            return Ok(true);
        }

        let leaf_id = self.find_leaf_guard(key)?.page_id();

        let mut leaf_guard = self
            .bpm
            .checked_write_page(leaf_id)?
            .ok_or(SableError::PageNotFound(leaf_id))?;
        let mut node = BTreeNode::new(leaf_guard.data_mut());

        if node.leaf_lookup(key, &self.comparator).is_ok() {
            return Ok(false);
        }

        if node.size() < self.leaf_max_size - 1 {
            node.leaf_insert(key, rid, &self.comparator);
            return Ok(true);
        }

        // Leaf overflow: build the sorted union, keep the first half here,
        // move the rest to a fresh right sibling spliced into the chain.
        let mut entries = node.leaf_entries();
        let pos = entries
            .binary_search_by(|(k, _)| self.comparator.compare(k, &key))
            .unwrap_err();
        entries.insert(pos, (key, rid));

        let split = (entries.len() + 1) / 2;
        let separator = entries[split].0;
        let next_id = node.next_page_id();
        let parent_id = node.parent_page_id();

        let mut sibling_guard = self.bpm.new_page()?;
        let sibling_id = sibling_guard.page_id();
        allocated.push(sibling_id);

        let mut sibling = BTreeNode::new(sibling_guard.data_mut());
        sibling.init_leaf(sibling_id, self.leaf_max_size);
        sibling.set_leaf_entries(&entries[split..]);
        sibling.set_parent_page_id(parent_id);
        sibling.set_next_page_id(next_id);

        node.set_leaf_entries(&entries[..split]);
        node.set_next_page_id(sibling_id);

        drop(sibling_guard);
        drop(leaf_guard);

        debug!(
            "{}: split leaf {} -> {} at key {}",
            self.index_name, leaf_id, sibling_id, separator
        );
        self.insert_into_parent(leaf_id, separator, sibling_id, allocated)?;
        Ok(true)
    }

    /// Hangs `right_id` next to `left_id` under their parent, growing a new
    /// root or splitting the parent when it is already at capacity.
    fn insert_into_parent(
        &mut self,
        left_id: PageId,
        key: IndexKey,
        right_id: PageId,
        allocated: &mut Vec<PageId>,
    ) -> Result<()> {
        let parent_id = {
            let guard = self
                .bpm
                .checked_read_page(left_id)?
                .ok_or(SableError::PageNotFound(left_id))?;
            BTreeNodeRef::new(guard.data()).parent_page_id()
        };

        if parent_id == INVALID_PAGE_ID {
            // left was the root: the tree grows a level
            let mut root_guard = self.bpm.new_page()?;
            let root_id = root_guard.page_id();
            allocated.push(root_id);

            let mut root = BTreeNode::new(root_guard.data_mut());
            root.init_internal(root_id, self.internal_max_size);
            root.set_internal_entries(&[(0, left_id), (key, right_id)]);
            drop(root_guard);

            for child_id in [left_id, right_id] {
                let mut guard = self
                    .bpm
                    .checked_write_page(child_id)?
                    .ok_or(SableError::PageNotFound(child_id))?;
                BTreeNode::new(guard.data_mut()).set_parent_page_id(root_id);
            }

            self.set_root_page_id(root_id)?;
            debug!("{}: new root {}", self.index_name, root_id);
            return Ok(());
        }

        let mut parent_guard = self
            .bpm
            .checked_write_page(parent_id)?
            .ok_or(SableError::PageNotFound(parent_id))?;
        let mut parent = BTreeNode::new(parent_guard.data_mut());

        if parent.size() < self.internal_max_size {
            parent.internal_insert(key, right_id, &self.comparator);
            drop(parent_guard);

            let mut guard = self
                .bpm
                .checked_write_page(right_id)?
                .ok_or(SableError::PageNotFound(right_id))?;
            BTreeNode::new(guard.data_mut()).set_parent_page_id(parent_id);
            return Ok(());
        }

        // Parent overflow: scratch union of its entries plus the new one;
        // the first ceil((M+1)/2) stay, the middle key moves up, its child
        // leads a fresh right sibling that takes the tail.
        let mut entries = parent.internal_entries();
        let mut pos = 1;
        while pos < entries.len()
            && self.comparator.compare(&entries[pos].0, &key) != std::cmp::Ordering::Greater
        {
            pos += 1;
        }
        entries.insert(pos, (key, right_id));

        let split = (entries.len() + 1) / 2;
        let promoted = entries[split].0;
        let grandparent_id = parent.parent_page_id();

        parent.set_internal_entries(&entries[..split]);
        drop(parent_guard);

        let mut sibling_guard = self.bpm.new_page()?;
        let sibling_id = sibling_guard.page_id();
        allocated.push(sibling_id);

        let mut sibling_entries = vec![(0, entries[split].1)];
        sibling_entries.extend_from_slice(&entries[split + 1..]);

        let mut sibling = BTreeNode::new(sibling_guard.data_mut());
        sibling.init_internal(sibling_id, self.internal_max_size);
        sibling.set_internal_entries(&sibling_entries);
        sibling.set_parent_page_id(grandparent_id);
        drop(sibling_guard);

        for &(_, child_id) in &sibling_entries {
            let mut guard = self
                .bpm
                .checked_write_page(child_id)?
                .ok_or(SableError::PageNotFound(child_id))?;
            BTreeNode::new(guard.data_mut()).set_parent_page_id(sibling_id);
        }

        debug!(
            "{}: split internal {} -> {} promoting {}",
            self.index_name, parent_id, sibling_id, promoted
        );
        self.insert_into_parent(parent_id, promoted, sibling_id, allocated)
    }

    /// One rebalance step: remove `step.key` from `step.page_id`, then
    /// collapse the root or merge/redistribute with a sibling as needed.
    /// Every page guard is dropped before the outcome is returned, so the
    /// caller can free pages and recurse up without lock re-entry.
    fn remove_entry_step(&mut self, step: PendingRemoval) -> Result<StepOutcome> {
        let mut guard = self
            .bpm
            .checked_write_page(step.page_id)?
            .ok_or(SableError::PageNotFound(step.page_id))?;
        let mut node = BTreeNode::new(guard.data_mut());
        let is_leaf = node.is_leaf();

        if is_leaf {
            if !node.leaf_remove(step.key, &self.comparator) {
                return Ok(StepOutcome::done());
            }
        } else if node.internal_remove_key(step.key, &self.comparator).is_none() {
            return Err(SableError::IndexCorrupted(format!(
                "separator {} missing from internal {}",
                step.key, step.page_id
            )));
        }

        let size = node.size();
        let parent_id = node.parent_page_id();

        if parent_id == INVALID_PAGE_ID {
            let only_child = (!is_leaf && size == 1).then(|| node.child_at(0));
            drop(node);
            drop(guard);
            return self.collapse_root(step.page_id, is_leaf, size, only_child);
        }

        let min_size = if is_leaf {
            // ceil((L - 1) / 2)
            self.leaf_max_size / 2
        } else {
            // ceil(M / 2)
            (self.internal_max_size + 1) / 2
        };
        if size >= min_size {
            return Ok(StepOutcome::done());
        }

        // Underflow: consult the parent for a sibling. Prefer the immediate
        // left sibling; fall back to the right one for the leftmost child.
        let mut parent_guard = self
            .bpm
            .checked_write_page(parent_id)?
            .ok_or(SableError::PageNotFound(parent_id))?;
        let mut parent = BTreeNode::new(parent_guard.data_mut());

        let child_index = parent.internal_find_child(step.page_id).ok_or_else(|| {
            SableError::IndexCorrupted(format!(
                "{} not among children of its parent {}",
                step.page_id, parent_id
            ))
        })?;

        let node_is_right = child_index > 0;
        let (sibling_id, separator_index) = if node_is_right {
            (parent.child_at(child_index - 1), child_index)
        } else {
            (parent.child_at(child_index + 1), child_index + 1)
        };
        let separator = parent.internal_key_at(separator_index);

        let mut sibling_guard = self
            .bpm
            .checked_write_page(sibling_id)?
            .ok_or(SableError::PageNotFound(sibling_id))?;
        let mut sibling = BTreeNode::new(sibling_guard.data_mut());

        let capacity = if is_leaf {
            self.leaf_max_size - 1
        } else {
            self.internal_max_size
        };

        let mut outcome = StepOutcome::done();

        if sibling.size() + size <= capacity {
            // Merge into the left-of-the-two and push the separator removal
            // up to the parent.
            let (mut left, right, right_id) = if node_is_right {
                (sibling, node, step.page_id)
            } else {
                (node, sibling, sibling_id)
            };

            if is_leaf {
                let mut merged = left.leaf_entries();
                merged.extend(right.leaf_entries());
                left.set_leaf_entries(&merged);
                left.set_next_page_id(right.next_page_id());
            } else {
                let left_id = left.page_id();
                let right_entries = right.internal_entries();
                let mut merged = left.internal_entries();
                merged.push((separator, right_entries[0].1));
                merged.extend_from_slice(&right_entries[1..]);
                left.set_internal_entries(&merged);
                for &(_, child) in &right_entries {
                    outcome.reparent.push((child, left_id));
                }
            }

            debug!(
                "{}: merged {} into {}",
                self.index_name,
                right_id,
                if node_is_right { sibling_id } else { step.page_id }
            );
            outcome.freed.push(right_id);
            outcome.next = Some(PendingRemoval {
                page_id: parent_id,
                key: separator,
            });
        } else if node_is_right {
            // Borrow the left sibling's last entry; the boundary key in the
            // parent becomes the moved entry's key.
            if is_leaf {
                let mut donor = sibling.leaf_entries();
                let (moved_key, moved_rid) = donor.pop().unwrap();
                sibling.set_leaf_entries(&donor);

                let mut entries = node.leaf_entries();
                entries.insert(0, (moved_key, moved_rid));
                node.set_leaf_entries(&entries);

                parent.set_internal_key_at(separator_index, moved_key);
            } else {
                let mut donor = sibling.internal_entries();
                let (moved_key, moved_child) = donor.pop().unwrap();
                sibling.set_internal_entries(&donor);

                let mut entries = node.internal_entries();
                entries[0].0 = separator;
                entries.insert(0, (0, moved_child));
                node.set_internal_entries(&entries);
                outcome.reparent.push((moved_child, step.page_id));

                parent.set_internal_key_at(separator_index, moved_key);
            }
        } else {
            // Borrow the right sibling's first entry; the parent separator
            // becomes the right sibling's new minimum.
            if is_leaf {
                let mut donor = sibling.leaf_entries();
                let (moved_key, moved_rid) = donor.remove(0);
                sibling.set_leaf_entries(&donor);

                let mut entries = node.leaf_entries();
                entries.push((moved_key, moved_rid));
                node.set_leaf_entries(&entries);

                parent.set_internal_key_at(separator_index, donor[0].0);
            } else {
                let mut donor = sibling.internal_entries();
                let moved_child = donor[0].1;
                // The promoted key is the right sibling's former leftmost
                // separator, not the moved entry's key.
                let promoted = donor[1].0;
                donor.remove(0);
                donor[0].0 = 0;
                sibling.set_internal_entries(&donor);

                let mut entries = node.internal_entries();
                entries.push((separator, moved_child));
                node.set_internal_entries(&entries);
                outcome.reparent.push((moved_child, step.page_id));

                parent.set_internal_key_at(separator_index, promoted);
            }
        }

        Ok(outcome)
    }

    /// Root post-deletion handling: an internal root left with a single
    /// child hands the tree to that child; an emptied leaf root empties the
    /// tree.
    fn collapse_root(
        &mut self,
        root_id: PageId,
        is_leaf: bool,
        size: u32,
        only_child: Option<PageId>,
    ) -> Result<StepOutcome> {
        let mut outcome = StepOutcome::done();

        if is_leaf && size == 0 {
            self.set_root_page_id(INVALID_PAGE_ID)?;
            outcome.freed.push(root_id);
            debug!("{}: tree emptied", self.index_name);
        } else if let Some(child_id) = only_child {
            {
                let mut guard = self
                    .bpm
                    .checked_write_page(child_id)?
                    .ok_or(SableError::PageNotFound(child_id))?;
                BTreeNode::new(guard.data_mut()).set_parent_page_id(INVALID_PAGE_ID);
            }
            self.set_root_page_id(child_id)?;
            outcome.freed.push(root_id);
            debug!("{}: root collapsed into {}", self.index_name, child_id);
        }

        Ok(outcome)
    }

    /// Rewrites the tree's record in the header page; every root change goes
    /// through here.
    fn set_root_page_id(&mut self, page_id: PageId) -> Result<()> {
        let mut guard = self
            .bpm
            .checked_write_page(HEADER_PAGE_ID)?
            .ok_or(SableError::PageNotFound(HEADER_PAGE_ID))?;
        let mut header = HeaderPage::new(guard.data_mut());
        if !header.update_record(&self.index_name, page_id) {
            return Err(SableError::IndexNotFound(self.index_name.clone()));
        }
        self.root_page_id = page_id;
        Ok(())
    }
}
