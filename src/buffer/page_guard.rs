use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::common::{FrameId, PageId, PAGE_SIZE};

use super::FrameHeader;

/// Runs once when a guard's release drops the frame's last pin, letting the
/// buffer pool hand the frame back to the replacer.
pub(crate) type IdleHook = Box<dyn FnOnce(FrameId) + Send + Sync>;

/// Owned lock guards over the frame's bytes. Owning the lock through the
/// `Arc` unties the guard from the frame's borrow, so callers can hold it
/// across scopes without any lifetime juggling.
type PageDataRead = ArcRwLockReadGuard<RawRwLock, Box<[u8; PAGE_SIZE]>>;
type PageDataWrite = ArcRwLockWriteGuard<RawRwLock, Box<[u8; PAGE_SIZE]>>;

/// Shared-access pin on a page. While any guard is alive the frame cannot be
/// evicted; dropping the last one returns the frame to the replacer.
pub struct ReadPageGuard {
    frame: Arc<FrameHeader>,
    /// Held in an Option so the lock can be released ahead of the pin.
    data: Option<PageDataRead>,
    on_idle: Option<IdleHook>,
}

impl ReadPageGuard {
    /// Takes over one pin that the pool already charged to `frame`.
    pub(crate) fn acquire(frame: Arc<FrameHeader>, on_idle: IdleHook) -> Self {
        let data = frame.data.read_arc();
        Self {
            frame,
            data: Some(data),
            on_idle: Some(on_idle),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.frame.page_id()
    }

    pub fn data(&self) -> &[u8] {
        &self.data.as_ref().unwrap()[..]
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Lock first, pin second: nobody may observe the frame unpinned
        // while its bytes are still locked.
        self.data = None;
        if let Some(0) = self.frame.unpin() {
            if let Some(hook) = self.on_idle.take() {
                hook(self.frame.frame_id());
            }
        }
    }
}

/// Exclusive-access pin on a page. The guard tracks whether its bytes were
/// handed out mutably and folds that into the frame's dirty flag on release,
/// so a mutated page always reaches disk before its frame is reused.
pub struct WritePageGuard {
    frame: Arc<FrameHeader>,
    data: Option<PageDataWrite>,
    /// Set on the first `data_mut` call
    dirtied: bool,
    on_idle: Option<IdleHook>,
}

impl WritePageGuard {
    /// Takes over one pin that the pool already charged to `frame`.
    pub(crate) fn acquire(frame: Arc<FrameHeader>, on_idle: IdleHook) -> Self {
        let data = frame.data.write_arc();
        Self {
            frame,
            data: Some(data),
            dirtied: false,
            on_idle: Some(on_idle),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.frame.page_id()
    }

    pub fn data(&self) -> &[u8] {
        &self.data.as_ref().unwrap()[..]
    }

    /// Mutable view of the page bytes; marks the guard dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirtied = true;
        &mut self.data.as_mut().unwrap()[..]
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // The dirty flag must land while the pin still shields the frame
        // from eviction.
        if self.dirtied {
            self.frame.set_dirty(true);
        }
        self.data = None;
        if let Some(0) = self.frame.unpin() {
            if let Some(hook) = self.on_idle.take() {
                hook(self.frame.frame_id());
            }
        }
    }
}
