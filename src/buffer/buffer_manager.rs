use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::buffer::buffer_pool::{BufferPool, FrameId, FrameMeta};
use crate::buffer::page::{self, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID};
use crate::config::BufferPoolConfig;
use crate::error::{VellumError, VellumResult};
use crate::storage::disk_manager::DiskManager;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;

/// Coordinates frame allocation, pinning, eviction, and dirty write-back
/// over a shared [`BufferPool`]. This is the page-access interface the
/// B+Tree consumes: pages are only ever reached through pinned, latched
/// guards.
#[derive(Debug)]
pub struct BufferManager {
    pool: Arc<BufferPool>,
    replacer: Arc<RwLock<LRUKReplacer>>,
    inflight_loads: DashMap<PageId, Arc<Mutex<()>>>,
}

impl BufferManager {
    pub fn new(num_pages: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::new_with_config(
            BufferPoolConfig {
                buffer_pool_size: num_pages,
                ..Default::default()
            },
            disk_manager,
        )
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_manager: Arc<DiskManager>) -> Self {
        let pool = Arc::new(BufferPool::new(config.buffer_pool_size, disk_manager));
        let replacer = Arc::new(RwLock::new(LRUKReplacer::with_k(
            pool.capacity(),
            config.lru_k_k,
        )));
        Self {
            pool,
            replacer,
            inflight_loads: DashMap::new(),
        }
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    /// Allocate a fresh, zeroed page and return it pinned and write-latched.
    pub fn new_page(self: &Arc<Self>) -> VellumResult<WritePageGuard> {
        if !self.pool.has_free_frame() && self.replacer.read().size() == 0 {
            return Err(VellumError::Storage(
                "cannot allocate page: buffer pool is full and no frame is evictable".to_string(),
            ));
        }

        let frame_id = self.allocate_frame()?;
        let page_id = self.pool.allocate_page_id()?;
        self.pool.insert_mapping(page_id, frame_id);
        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.page_id = page_id;
            meta.pin_count = 1;
            meta.is_dirty = false;
        }
        self.pool.reset_frame(frame_id);
        self.replacer_record_access(frame_id);
        self.mark_non_evictable(frame_id);
        debug!("buffer: new page {} in frame {}", page_id, frame_id);
        Ok(page::new_write_guard(Arc::clone(self), frame_id))
    }

    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> VellumResult<ReadPageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumError::Storage(
                "fetch_page_read: invalid page id".to_string(),
            ));
        }
        let frame_id = self.pin_frame(page_id)?;
        Ok(page::new_read_guard(Arc::clone(self), frame_id))
    }

    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> VellumResult<WritePageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumError::Storage(
                "fetch_page_write: invalid page id".to_string(),
            ));
        }
        let frame_id = self.pin_frame(page_id)?;
        Ok(page::new_write_guard(Arc::clone(self), frame_id))
    }

    /// Called by guard drops after the latch is released.
    pub fn complete_unpin(&self, page_id: PageId) -> VellumResult<()> {
        if let Some(frame_id) = self.pool.lookup_frame(page_id) {
            let mut meta = self.pool.frame_meta(frame_id);
            if meta.pin_count > 0 {
                meta.pin_count -= 1;
            }
            if meta.pin_count == 0 {
                drop(meta);
                self.mark_evictable(frame_id);
            }
        }
        Ok(())
    }

    pub fn flush_page(&self, page_id: PageId) -> VellumResult<bool> {
        let Some(frame_id) = self.pool.lookup_frame(page_id) else {
            return Ok(false);
        };
        if !self.pool.frame_meta(frame_id).is_dirty {
            return Ok(false);
        }
        let bytes = {
            let _latch = self.pool.frame_lock(frame_id).read();
            Bytes::copy_from_slice(unsafe { self.pool.frame_slice(frame_id) })
        };
        self.pool.write_page_to_disk(page_id, bytes)?;
        self.pool.frame_meta(frame_id).is_dirty = false;
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> VellumResult<()> {
        for page_id in self.pool.mapped_page_ids() {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drop a page from the pool and return its id to the disk free list.
    /// Refuses pinned pages (returns `Ok(false)`).
    pub fn delete_page(&self, page_id: PageId) -> VellumResult<bool> {
        let (load_lock, created_here) = self.inflight_lock(page_id);
        let guard = load_lock.lock();
        let result = self.delete_page_inner(page_id);
        drop(guard);
        if created_here {
            self.inflight_loads.remove(&page_id);
        }
        result
    }

    fn delete_page_inner(&self, page_id: PageId) -> VellumResult<bool> {
        if let Some(frame_id) = self.pool.lookup_frame(page_id) {
            {
                let Some(latch) = self.pool.frame_lock(frame_id).try_write() else {
                    return Ok(false);
                };
                drop(latch);
            }
            {
                let meta = self.pool.frame_meta(frame_id);
                if meta.page_id != page_id {
                    drop(meta);
                    self.pool.remove_mapping_if(page_id, frame_id);
                    return self.delete_page_inner(page_id);
                }
                if meta.pin_count > 0 {
                    return Ok(false);
                }
            }
            if !self.pool.remove_mapping_if(page_id, frame_id) {
                return self.delete_page_inner(page_id);
            }
            self.pool.reset_frame(frame_id);
            *self.pool.frame_meta(frame_id) = FrameMeta::default();
            {
                let mut replacer = self.replacer.write();
                let _ = replacer.set_evictable(frame_id, true);
                replacer.remove(frame_id);
            }
            self.pool.push_free_frame(frame_id);
            self.pool.deallocate_page_id(page_id)?;
            debug!("buffer: deleted page {} (frame {})", page_id, frame_id);
            Ok(true)
        } else {
            self.pool.deallocate_page_id(page_id)?;
            Ok(true)
        }
    }

    /// Resolve the page to a frame and pin it, rechecking that the frame
    /// was not recycled by a concurrent eviction between the lookup and
    /// the pin.
    fn pin_frame(&self, page_id: PageId) -> VellumResult<FrameId> {
        loop {
            let frame_id = self.ensure_frame(page_id)?;
            {
                let mut meta = self.pool.frame_meta(frame_id);
                if meta.page_id == page_id {
                    meta.pin_count += 1;
                    drop(meta);
                    self.mark_non_evictable(frame_id);
                    return Ok(frame_id);
                }
            }
        }
    }

    fn inflight_lock(&self, page_id: PageId) -> (Arc<Mutex<()>>, bool) {
        if let Some(existing) = self.inflight_loads.get(&page_id) {
            (existing.clone(), false)
        } else {
            let lock = Arc::new(Mutex::new(()));
            self.inflight_loads.insert(page_id, lock.clone());
            (lock, true)
        }
    }

    fn ensure_frame(&self, page_id: PageId) -> VellumResult<FrameId> {
        if let Some(frame_id) = self.pool.lookup_frame(page_id) {
            self.replacer_record_access(frame_id);
            return Ok(frame_id);
        }

        let (load_lock, created_here) = self.inflight_lock(page_id);
        let guard = load_lock.lock();

        let result = (|| {
            if let Some(frame_id) = self.pool.lookup_frame(page_id) {
                self.replacer_record_access(frame_id);
                return Ok(frame_id);
            }
            let frame_id = self.allocate_frame()?;
            if let Err(e) = self.pool.load_page_into_frame(page_id, frame_id) {
                self.pool.push_free_frame(frame_id);
                return Err(e);
            }
            self.pool.insert_mapping(page_id, frame_id);
            {
                let mut meta = self.pool.frame_meta(frame_id);
                meta.page_id = page_id;
                meta.pin_count = 0;
                meta.is_dirty = false;
            }
            self.replacer_record_access(frame_id);
            Ok(frame_id)
        })();

        drop(guard);
        if created_here {
            self.inflight_loads.remove(&page_id);
        }
        result
    }

    fn allocate_frame(&self) -> VellumResult<FrameId> {
        if let Some(frame_id) = self.pool.pop_free_frame() {
            return Ok(frame_id);
        }
        self.evict_victim_frame()
    }

    fn evict_victim_frame(&self) -> VellumResult<FrameId> {
        loop {
            let victim = {
                let mut replacer = self.replacer.write();
                match replacer.evict() {
                    Some(frame_id) => frame_id,
                    None => {
                        return Err(VellumError::Storage(
                            "cannot allocate frame: buffer pool is full".to_string(),
                        ))
                    }
                }
            };

            {
                // hold the meta lock across the flush + unmap so a racing
                // pin (which also takes it) cannot adopt a dying frame
                let mut meta = self.pool.frame_meta(victim);
                if meta.pin_count > 0 {
                    drop(meta);
                    self.replacer_record_access(victim);
                    self.mark_non_evictable(victim);
                    continue;
                }
                let page_id = meta.page_id;
                if page_id != INVALID_PAGE_ID {
                    if meta.is_dirty {
                        let bytes =
                            Bytes::copy_from_slice(unsafe { self.pool.frame_slice(victim) });
                        self.pool.write_page_to_disk(page_id, bytes)?;
                    }
                    self.pool.remove_mapping(page_id);
                    debug!("buffer: evicted page {} from frame {}", page_id, victim);
                }
                *meta = FrameMeta::default();
            }
            self.pool.reset_frame(victim);
            return Ok(victim);
        }
    }

    fn replacer_record_access(&self, frame_id: FrameId) {
        let _ = self.replacer.write().record_access(frame_id);
    }

    fn mark_evictable(&self, frame_id: FrameId) {
        let _ = self.replacer.write().set_evictable(frame_id, true);
    }

    fn mark_non_evictable(&self, frame_id: FrameId) {
        let _ = self.replacer.write().set_evictable(frame_id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    fn setup_manager(num_pages: usize) -> (TempDir, Arc<BufferManager>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager =
            Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let manager = Arc::new(BufferManager::new(num_pages, disk_manager));
        (temp_dir, manager)
    }

    #[test]
    fn new_page_initializes_frame() {
        let (_tmp, manager) = setup_manager(2);
        let guard = manager.new_page().unwrap();
        let page_id = guard.page_id();
        let frame_id = guard.frame_id();

        assert!(guard.data().iter().all(|b| *b == 0));
        assert!(!guard.is_dirty());
        drop(guard);

        let meta = manager.buffer_pool().frame_meta(frame_id).clone();
        assert_eq!(meta.page_id, page_id);
        assert_eq!(meta.pin_count, 0);
        assert!(!meta.is_dirty);
    }

    #[test]
    fn fetch_page_read_increments_pin_and_resets_on_drop() {
        let (_tmp, manager) = setup_manager(2);
        let guard = manager.new_page().unwrap();
        let page_id = guard.page_id();
        let frame_id = guard.frame_id();
        drop(guard);

        {
            let read_guard = manager.fetch_page_read(page_id).unwrap();
            assert_eq!(read_guard.pin_count(), 1);
            assert_eq!(read_guard.frame_id(), frame_id);
        }

        let meta = manager.buffer_pool().frame_meta(frame_id).clone();
        assert_eq!(meta.pin_count, 0);
    }

    #[test]
    fn write_guard_marks_dirty_and_survives_eviction() {
        let (_tmp, manager) = setup_manager(2);
        let page_id = {
            let mut guard = manager.new_page().unwrap();
            guard.data_mut()[0] = 42;
            guard.mark_dirty();
            guard.page_id()
        };

        // fill the pool so the dirty page gets evicted and written back
        let spare = manager.new_page().unwrap();
        drop(spare);
        let spare = manager.new_page().unwrap();
        drop(spare);
        let spare = manager.new_page().unwrap();
        drop(spare);

        let read_guard = manager.fetch_page_read(page_id).unwrap();
        assert_eq!(read_guard.data()[0], 42);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let (_tmp, manager) = setup_manager(3);
        let _g1 = manager.new_page().unwrap();
        let _g2 = manager.new_page().unwrap();
        let _g3 = manager.new_page().unwrap();
        assert!(manager.new_page().is_err());

        drop(_g1);
        assert!(manager.new_page().is_ok());
    }

    #[test]
    fn delete_page_releases_frame_and_refuses_pinned() {
        let (_tmp, manager) = setup_manager(2);
        let guard = manager.new_page().unwrap();
        let page_id = guard.page_id();

        // still pinned by the guard
        assert!(!manager.delete_page(page_id).unwrap());
        drop(guard);

        assert!(manager.delete_page(page_id).unwrap());
        assert!(manager.buffer_pool().lookup_frame(page_id).is_none());
        assert!(manager.buffer_pool().has_free_frame());
    }

    #[test]
    fn concurrent_reads_do_not_leak_pins() {
        const THREADS: usize = 8;
        let (_tmp, manager) = setup_manager(4);
        let (page_id, frame_id) = {
            let mut guard = manager.new_page().unwrap();
            guard.data_mut()[0] = 42;
            guard.mark_dirty();
            (guard.page_id(), guard.frame_id())
        };

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::with_capacity(THREADS);
        for _ in 0..THREADS {
            let manager = manager.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let guard = manager.fetch_page_read(page_id).expect("read page");
                    assert_eq!(guard.data()[0], 42);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let meta = manager.buffer_pool().frame_meta(frame_id).clone();
        assert_eq!(meta.pin_count, 0);
        assert_eq!(meta.page_id, page_id);
    }
}
