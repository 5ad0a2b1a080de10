use std::collections::LinkedList;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::common::{FrameId, PageId, Result, SableError, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::page_guard::IdleHook;
use super::{ExtendibleHashTable, FrameHeader, LruKReplacer, ReadPageGuard, WritePageGuard};

/// Internal state that can be shared across threads
struct BufferPoolState {
    /// The buffer pool frames
    frames: Vec<Arc<FrameHeader>>,
    /// Page table: maps resident page IDs to frame IDs
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Free list: frames that are not currently in use
    free_list: Mutex<LinkedList<FrameId>>,
    /// LRU-K replacer for eviction decisions
    replacer: LruKReplacer,
    /// Pool-level latch serializing victim selection and mapping installs.
    /// Never held across disk I/O.
    latch: Mutex<()>,
}

/// BufferPoolManager caches a bounded number of disk pages in memory,
/// assigning each resident page an exclusive frame and arbitrating eviction
/// through the LRU-K replacer.
///
/// Every successful page access hands the caller a guard carrying one pin;
/// dropping the guard is the unpin. A frame with outstanding pins is never
/// an eviction victim, and a dirty victim is written back before its frame
/// is reused.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    /// Capacity of one page-table bucket
    bucket_size: usize,
    /// Shared state
    state: Arc<BufferPoolState>,
    /// Disk scheduler for I/O
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given pool size, k value for
    /// LRU-K, and disk manager.
    pub fn new(pool_size: usize, k: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::with_bucket_size(pool_size, k, crate::common::DEFAULT_BUCKET_SIZE, disk_manager)
    }

    /// Same as [`BufferPoolManager::new`] with an explicit page-table bucket
    /// capacity.
    pub fn with_bucket_size(
        pool_size: usize,
        k: usize,
        bucket_size: usize,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = LinkedList::new();

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let state = Arc::new(BufferPoolState {
            frames,
            page_table: ExtendibleHashTable::new(bucket_size),
            free_list: Mutex::new(free_list),
            replacer: LruKReplacer::new(k, pool_size),
            latch: Mutex::new(()),
        });

        Self {
            pool_size,
            bucket_size,
            state,
            disk_scheduler: DiskScheduler::new(disk_manager),
        }
    }

    /// Allocates a fresh page and returns a write guard holding its pin.
    /// The victim frame's old page is written back first if it was dirty.
    /// Fails with `BufferPoolFull` when every frame is pinned.
    pub fn new_page(&self) -> Result<WritePageGuard> {
        let meta = self.state.latch.lock();

        let frame_id = self.take_victim()?;
        let frame = &self.state.frames[frame_id.as_usize()];

        // A victim has no pins, so nothing can hold its data lock.
        let mut data = frame.data.write();

        let write_back = self.detach_old_page(frame, &data);

        let page_id = self.disk_scheduler.disk_manager().allocate_page()?;
        data.fill(0);
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.pin();

        self.state.page_table.insert(page_id, frame_id);
        self.state.replacer.record_access(frame_id)?;
        self.state.replacer.set_evictable(frame_id, false);

        drop(data);
        drop(meta);

        if let Some((old_id, old_data)) = write_back {
            trace!("evicting dirty {} for new {}", old_id, page_id);
            if let Err(e) = self.disk_scheduler.schedule_write_sync(old_id, &old_data[..]) {
                self.rollback_frame(page_id, frame_id);
                let _ = self.disk_scheduler.disk_manager().deallocate_page(page_id);
                return Err(e);
            }
        }

        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(WritePageGuard::acquire(frame, self.idle_hook()))
    }

    /// Fetches a page for read access.
    pub fn checked_read_page(&self, page_id: PageId) -> Result<Option<ReadPageGuard>> {
        if page_id == INVALID_PAGE_ID {
            return Err(SableError::InvalidPageId(page_id));
        }

        let frame_id = self.fetch_frame(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);

        Ok(Some(ReadPageGuard::acquire(frame, self.idle_hook())))
    }

    /// Fetches a page for write access.
    pub fn checked_write_page(&self, page_id: PageId) -> Result<Option<WritePageGuard>> {
        if page_id == INVALID_PAGE_ID {
            return Err(SableError::InvalidPageId(page_id));
        }

        let frame_id = self.fetch_frame(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);

        Ok(Some(WritePageGuard::acquire(frame, self.idle_hook())))
    }

    /// Writes a resident page to disk unconditionally and clears its dirty
    /// flag. Returns false when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(SableError::InvalidPageId(page_id));
        }

        let meta = self.state.latch.lock();

        let Some(frame_id) = self.state.page_table.find(&page_id) else {
            return Ok(false);
        };
        let frame = &self.state.frames[frame_id.as_usize()];

        let mut data = [0u8; PAGE_SIZE];
        frame.copy_to(&mut data);
        drop(meta);

        self.disk_scheduler.schedule_write_sync(page_id, &data)?;
        frame.set_dirty(false);

        Ok(true)
    }

    /// Flushes every resident page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let entries = {
            let _meta = self.state.latch.lock();
            self.state.page_table.entries()
        };

        for (page_id, frame_id) in entries {
            let frame = &self.state.frames[frame_id.as_usize()];

            let mut data = [0u8; PAGE_SIZE];
            frame.copy_to(&mut data);

            self.disk_scheduler.schedule_write_sync(page_id, &data)?;
            frame.set_dirty(false);
        }

        Ok(())
    }

    /// Drops a page from the buffer pool and deallocates it on disk.
    /// Returns true when the page was deleted or was not resident to begin
    /// with; false when it is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(SableError::InvalidPageId(page_id));
        }

        let meta = self.state.latch.lock();

        let Some(frame_id) = self.state.page_table.find(&page_id) else {
            return Ok(true);
        };
        let frame = &self.state.frames[frame_id.as_usize()];

        if frame.pin_count() > 0 {
            return Ok(false);
        }

        self.state.page_table.remove(&page_id);
        self.state.replacer.remove(frame_id)?;
        frame.reset();
        self.state.free_list.lock().push_back(frame_id);
        drop(meta);

        self.disk_scheduler.disk_manager().deallocate_page(page_id)?;
        Ok(true)
    }

    /// Returns the pin count for a resident page.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        self.state
            .page_table
            .find(&page_id)
            .map(|frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    /// Returns the pool size.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Capacity of one page-table bucket.
    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Returns the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.state.free_list.lock().len()
    }

    /// Number of unpinned resident frames, as tracked by the replacer.
    pub fn evictable_count(&self) -> usize {
        self.state.replacer.size()
    }

    /// Number of resident pages.
    pub fn resident_count(&self) -> usize {
        self.state.page_table.len()
    }

    /// Pins the frame holding `page_id`, reading the page from disk into a
    /// victim frame on a miss. The returned frame carries one pin owed to
    /// the caller.
    fn fetch_frame(&self, page_id: PageId) -> Result<FrameId> {
        let meta = self.state.latch.lock();

        if let Some(frame_id) = self.state.page_table.find(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];
            frame.pin();
            self.state.replacer.record_access(frame_id)?;
            self.state.replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.take_victim()?;
        let frame = &self.state.frames[frame_id.as_usize()];

        // Holding the frame's data lock across the read below makes late
        // fetchers of the same page block on guard construction instead of
        // observing a half-filled frame.
        let mut data = frame.data.write();

        let write_back = self.detach_old_page(frame, &data);

        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.pin();

        self.state.page_table.insert(page_id, frame_id);
        self.state.replacer.record_access(frame_id)?;
        self.state.replacer.set_evictable(frame_id, false);

        drop(meta);

        let io: Result<()> = (|| {
            if let Some((old_id, old_data)) = write_back {
                trace!("evicting dirty {} for {}", old_id, page_id);
                self.disk_scheduler
                    .schedule_write_sync(old_id, &old_data[..])?;
            }
            self.disk_scheduler
                .schedule_read_sync(page_id, &mut data[..])?;
            Ok(())
        })();
        drop(data);

        if let Err(e) = io {
            self.rollback_frame(page_id, frame_id);
            return Err(e);
        }

        Ok(frame_id)
    }

    /// Pops a free frame, or evicts one. Caller must hold the pool latch.
    fn take_victim(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.state.free_list.lock().pop_front() {
            return Ok(frame_id);
        }
        self.state
            .replacer
            .evict()
            .ok_or(SableError::BufferPoolFull)
    }

    /// Unmaps the victim frame's current page and snapshots its bytes when a
    /// write-back is owed. Caller must hold the pool latch and the frame's
    /// data lock.
    fn detach_old_page(
        &self,
        frame: &FrameHeader,
        data: &[u8; PAGE_SIZE],
    ) -> Option<(PageId, Box<[u8; PAGE_SIZE]>)> {
        if !frame.is_occupied() {
            return None;
        }

        let old_id = frame.page_id();
        self.state.page_table.remove(&old_id);

        if frame.is_dirty() {
            let mut snapshot = Box::new([0u8; PAGE_SIZE]);
            snapshot.copy_from_slice(data);
            Some((old_id, snapshot))
        } else {
            None
        }
    }

    /// Backs out a frame whose disk I/O failed mid-install, returning it to
    /// the free list so the pool state looks as if the call never happened.
    fn rollback_frame(&self, page_id: PageId, frame_id: FrameId) {
        let _meta = self.state.latch.lock();

        self.state.page_table.remove(&page_id);
        self.state.replacer.set_evictable(frame_id, true);
        let _ = self.state.replacer.remove(frame_id);

        let frame = &self.state.frames[frame_id.as_usize()];
        frame.reset();
        self.state.free_list.lock().push_back(frame_id);
    }

    /// Guards handle the pin and dirty accounting against the frame
    /// themselves; the pool only supplies what happens when the last pin
    /// goes away.
    fn idle_hook(&self) -> IdleHook {
        let state = Arc::clone(&self.state);
        Box::new(move |frame_id| state.replacer.set_evictable(frame_id, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = BufferPoolManager::new(pool_size, 2, dm);
        (bpm, temp_file)
    }

    #[test]
    fn test_buffer_pool_manager_new() {
        let (bpm, _temp) = create_bpm(10);
        assert_eq!(bpm.pool_size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
        assert_eq!(bpm.resident_count(), 0);
    }

    #[test]
    fn test_buffer_pool_manager_new_page_is_pinned() {
        let (bpm, _temp) = create_bpm(10);

        let guard = bpm.new_page().unwrap();
        let page_id = guard.page_id();
        assert_eq!(page_id, PageId::new(1)); // Page 0 is the header page
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);

        drop(guard);
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
    }

    #[test]
    fn test_buffer_pool_manager_read_write() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 42;
            guard.data_mut()[100] = 255;
            guard.page_id()
        };

        assert_eq!(bpm.get_pin_count(page_id), Some(0));

        let guard = bpm.checked_read_page(page_id).unwrap().unwrap();
        assert_eq!(guard.data()[0], 42);
        assert_eq!(guard.data()[100], 255);
    }

    #[test]
    fn test_buffer_pool_manager_flush() {
        let (bpm, temp) = create_bpm(10);

        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 42;
            guard.page_id()
        };

        bpm.flush_page(page_id).unwrap();

        // Verify the data persisted by reading through a fresh pool
        drop(bpm);

        let dm = Arc::new(DiskManager::new(temp.path()).unwrap());
        let bpm2 = BufferPoolManager::new(10, 2, dm);

        let guard = bpm2.checked_read_page(page_id).unwrap().unwrap();
        assert_eq!(guard.data()[0], 42);
    }

    #[test]
    fn test_buffer_pool_manager_eviction_writes_back() {
        let (bpm, _temp) = create_bpm(3);

        let mut page_ids = Vec::new();
        for i in 0..3u8 {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = i;
            page_ids.push(guard.page_id());
        }
        assert_eq!(bpm.free_frame_count(), 0);
        assert_eq!(bpm.evictable_count(), 3);

        // Fills a fourth page: some dirty page gets evicted and written back.
        let extra = bpm.new_page().unwrap();
        assert_eq!(extra.page_id(), PageId::new(4));
        drop(extra);

        // Every original page still reads back its marker byte.
        for (i, &pid) in page_ids.iter().enumerate() {
            let guard = bpm.checked_read_page(pid).unwrap().unwrap();
            assert_eq!(guard.data()[0], i as u8);
        }
    }

    #[test]
    fn test_buffer_pool_manager_delete_page() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap().page_id();

        {
            let _guard = bpm.checked_read_page(page_id).unwrap().unwrap();
            assert!(!bpm.delete_page(page_id).unwrap());
        }

        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.get_pin_count(page_id), None);
        assert_eq!(bpm.free_frame_count(), 10);

        // Deleting a non-resident page is a no-op success.
        assert!(bpm.delete_page(PageId::new(999)).unwrap());
    }

    #[test]
    fn test_buffer_pool_manager_full() {
        let (bpm, _temp) = create_bpm(2);

        let _guard1 = bpm.new_page().unwrap();
        let _guard2 = bpm.new_page().unwrap();

        assert!(matches!(bpm.new_page(), Err(SableError::BufferPoolFull)));
    }

    #[test]
    fn test_buffer_pool_manager_evictable_accounting() {
        let (bpm, _temp) = create_bpm(4);

        let g1 = bpm.new_page().unwrap();
        let g2 = bpm.new_page().unwrap();
        assert_eq!(bpm.evictable_count(), 0);

        drop(g1);
        assert_eq!(bpm.evictable_count(), 1);
        drop(g2);
        assert_eq!(bpm.evictable_count(), 2);
        assert_eq!(bpm.resident_count(), 2);
    }
}
