use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::buffer::page::{PageId, PAGE_SIZE};
use crate::error::VellumResult;
use crate::storage::disk_manager::DiskManager;

pub type FrameId = usize;

#[derive(Debug, Clone, Default)]
pub struct FrameMeta {
    pub page_id: PageId,
    pub pin_count: u32,
    pub is_dirty: bool,
}

/// Fixed arena of page frames. Each frame carries its own latch and
/// metadata; frame bytes are reached through raw slices whose contract is
/// that the caller holds the frame latch (or otherwise has exclusive
/// access, e.g. an unmapped frame).
#[derive(Debug)]
pub struct BufferPool {
    data: UnsafeCell<Box<[u8]>>,
    latches: Vec<RwLock<()>>,
    metas: Vec<Mutex<FrameMeta>>,
    page_table: DashMap<PageId, FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
    disk_manager: Arc<DiskManager>,
    capacity: usize,
}

unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub fn new(capacity: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut latches = Vec::with_capacity(capacity);
        let mut metas = Vec::with_capacity(capacity);
        let mut free_list = VecDeque::with_capacity(capacity);
        for frame_id in 0..capacity {
            latches.push(RwLock::new(()));
            metas.push(Mutex::new(FrameMeta::default()));
            free_list.push_back(frame_id);
        }
        Self {
            data: UnsafeCell::new(vec![0u8; capacity * PAGE_SIZE].into_boxed_slice()),
            latches,
            metas,
            page_table: DashMap::new(),
            free_list: Mutex::new(free_list),
            disk_manager,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    pub fn frame_lock(&self, frame_id: FrameId) -> &RwLock<()> {
        &self.latches[frame_id]
    }

    pub fn frame_meta(&self, frame_id: FrameId) -> MutexGuard<'_, FrameMeta> {
        self.metas[frame_id].lock()
    }

    /// # Safety
    /// The caller must hold the frame latch (shared or exclusive).
    pub unsafe fn frame_slice(&self, frame_id: FrameId) -> &[u8] {
        let base = (*self.data.get()).as_ptr();
        std::slice::from_raw_parts(base.add(frame_id * PAGE_SIZE), PAGE_SIZE)
    }

    /// # Safety
    /// The caller must hold the frame latch exclusively.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_slice_mut(&self, frame_id: FrameId) -> &mut [u8] {
        let base = (*self.data.get()).as_mut_ptr();
        std::slice::from_raw_parts_mut(base.add(frame_id * PAGE_SIZE), PAGE_SIZE)
    }

    /// Zero a frame. Caller must have exclusive access to it (unmapped, or
    /// newly allocated and not yet shared).
    pub fn reset_frame(&self, frame_id: FrameId) {
        let slice = unsafe { self.frame_slice_mut(frame_id) };
        slice.fill(0);
    }

    pub fn lookup_frame(&self, page_id: PageId) -> Option<FrameId> {
        self.page_table.get(&page_id).map(|entry| *entry)
    }

    pub fn insert_mapping(&self, page_id: PageId, frame_id: FrameId) {
        self.page_table.insert(page_id, frame_id);
    }

    pub fn remove_mapping(&self, page_id: PageId) {
        self.page_table.remove(&page_id);
    }

    /// Remove the mapping only if it still points at `frame_id`.
    pub fn remove_mapping_if(&self, page_id: PageId, frame_id: FrameId) -> bool {
        self.page_table
            .remove_if(&page_id, |_, mapped| *mapped == frame_id)
            .is_some()
    }

    pub fn mapped_page_ids(&self) -> Vec<PageId> {
        self.page_table.iter().map(|entry| *entry.key()).collect()
    }

    pub fn pop_free_frame(&self) -> Option<FrameId> {
        self.free_list.lock().pop_front()
    }

    pub fn push_free_frame(&self, frame_id: FrameId) {
        self.free_list.lock().push_back(frame_id);
    }

    pub fn has_free_frame(&self) -> bool {
        !self.free_list.lock().is_empty()
    }

    /// Read a page image from disk into an unmapped frame.
    pub fn load_page_into_frame(&self, page_id: PageId, frame_id: FrameId) -> VellumResult<()> {
        let image = self.disk_manager.read_page(page_id)?;
        let slice = unsafe { self.frame_slice_mut(frame_id) };
        slice.copy_from_slice(&image);
        Ok(())
    }

    pub fn write_page_to_disk(&self, page_id: PageId, data: Bytes) -> VellumResult<()> {
        self.disk_manager.write_page(page_id, data)
    }

    pub fn allocate_page_id(&self) -> VellumResult<PageId> {
        self.disk_manager.allocate_page()
    }

    pub fn deallocate_page_id(&self, page_id: PageId) -> VellumResult<()> {
        self.disk_manager.deallocate_page(page_id)
    }
}
