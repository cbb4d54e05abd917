use std::mem::{self, ManuallyDrop};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use log::error;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::buffer_manager::BufferManager;
use crate::buffer::buffer_pool::{BufferPool, FrameId};

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;

pub const INVALID_PAGE_ID: PageId = 0;
pub const PAGE_SIZE: usize = 4096;

/// Shared latch + pin on one buffer frame. The page cannot be evicted or
/// written while the guard lives; dropping it releases the latch and unpins.
#[derive(Debug)]
pub struct ReadPageGuard {
    bpm: Arc<BufferManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    guard: ManuallyDrop<RwLockReadGuard<'static, ()>>,
}

impl ReadPageGuard {
    pub fn page_id(&self) -> PageId {
        self.pool.frame_meta(self.frame_id).page_id
    }

    pub fn pin_count(&self) -> u32 {
        self.pool.frame_meta(self.frame_id).pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.pool.frame_meta(self.frame_id).is_dirty
    }

    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        let page_id = self.pool.frame_meta(self.frame_id).page_id;
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if let Err(e) = self.bpm.complete_unpin(page_id) {
            error!("failed to unpin page {} on read guard drop: {}", page_id, e);
        }
    }
}

/// Exclusive latch + pin on one buffer frame.
#[derive(Debug)]
pub struct WritePageGuard {
    bpm: Arc<BufferManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    guard: ManuallyDrop<RwLockWriteGuard<'static, ()>>,
}

impl WritePageGuard {
    pub fn page_id(&self) -> PageId {
        self.pool.frame_meta(self.frame_id).page_id
    }

    pub fn pin_count(&self) -> u32 {
        self.pool.frame_meta(self.frame_id).pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.pool.frame_meta(self.frame_id).is_dirty
    }

    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { self.pool.frame_slice_mut(self.frame_id) }
    }

    pub fn mark_dirty(&mut self) {
        self.pool.frame_meta(self.frame_id).is_dirty = true;
    }

    /// Install a full page image and mark the frame dirty.
    pub fn overwrite(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let slice = unsafe { self.pool.frame_slice_mut(self.frame_id) };
        slice.copy_from_slice(data);
        self.mark_dirty();
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        let page_id = self.pool.frame_meta(self.frame_id).page_id;
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if let Err(e) = self.bpm.complete_unpin(page_id) {
            error!("failed to unpin page {} on write guard drop: {}", page_id, e);
        }
    }
}

pub(crate) fn new_read_guard(bpm: Arc<BufferManager>, frame_id: FrameId) -> ReadPageGuard {
    let pool = bpm.buffer_pool();
    let lock = pool.frame_lock(frame_id);
    let guard = lock.read();
    // The latch lives inside `pool`, which the guard keeps alive.
    let guard_static: RwLockReadGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockReadGuard<'_, ()>, RwLockReadGuard<'static, ()>>(guard) };
    ReadPageGuard {
        bpm,
        pool,
        frame_id,
        guard: ManuallyDrop::new(guard_static),
    }
}

pub(crate) fn new_write_guard(bpm: Arc<BufferManager>, frame_id: FrameId) -> WritePageGuard {
    let pool = bpm.buffer_pool();
    let lock = pool.frame_lock(frame_id);
    let guard = lock.write();
    let guard_static: RwLockWriteGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockWriteGuard<'_, ()>, RwLockWriteGuard<'static, ()>>(guard) };
    WritePageGuard {
        bpm,
        pool,
        frame_id,
        guard: ManuallyDrop::new(guard_static),
    }
}
