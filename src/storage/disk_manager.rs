use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Bytes, BytesMut};
use log::debug;
use parking_lot::Mutex;

use crate::buffer::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{VellumError, VellumResult};

/// Page-granular I/O over a single database file.
///
/// Page ids start at 1; id 0 is reserved as `INVALID_PAGE_ID`. Deallocated
/// ids are recycled from an in-memory free list before the high-water mark
/// is bumped.
#[derive(Debug)]
pub struct DiskManager {
    db_file: Mutex<File>,
    db_path: PathBuf,
    next_page_id: AtomicU32,
    free_list: Mutex<Vec<PageId>>,
}

impl DiskManager {
    pub fn try_new(db_path: impl Into<PathBuf>) -> VellumResult<Self> {
        let db_path = db_path.into();
        let db_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&db_path)?;

        let file_len = db_file.metadata()?.len() as usize;
        let num_pages = file_len.div_ceil(PAGE_SIZE);
        // page 0 is never handed out
        let next_page_id = num_pages.max(1) as PageId;

        Ok(Self {
            db_file: Mutex::new(db_file),
            db_path,
            next_page_id: AtomicU32::new(next_page_id),
            free_list: Mutex::new(Vec::new()),
        })
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Hand out a page id without touching the file; the page materializes
    /// on first write. Reads of never-written pages yield zeroed images.
    pub fn allocate_page(&self) -> VellumResult<PageId> {
        if let Some(page_id) = self.free_list.lock().pop() {
            debug!("disk: reallocated page {} from free list", page_id);
            return Ok(page_id);
        }
        let page_id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        Ok(page_id)
    }

    pub fn deallocate_page(&self, page_id: PageId) -> VellumResult<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumError::Storage(
                "cannot deallocate the invalid page id".to_string(),
            ));
        }
        self.free_list.lock().push(page_id);
        Ok(())
    }

    pub fn read_page(&self, page_id: PageId) -> VellumResult<BytesMut> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumError::Storage(
                "cannot read the invalid page id".to_string(),
            ));
        }
        let mut buf = BytesMut::zeroed(PAGE_SIZE);
        let mut file = self.db_file.lock();
        let offset = page_id as u64 * PAGE_SIZE as u64;
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            // allocated but never written
            return Ok(buf);
        }
        file.seek(SeekFrom::Start(offset))?;
        match file.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            // a short tail page reads as partially zeroed
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(buf),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_page(&self, page_id: PageId, data: Bytes) -> VellumResult<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumError::Storage(
                "cannot write the invalid page id".to_string(),
            ));
        }
        if data.len() != PAGE_SIZE {
            return Err(VellumError::Storage(format!(
                "page image is {} bytes instead of {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(&data)?;
        Ok(())
    }

    pub fn sync(&self) -> VellumResult<()> {
        self.db_file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let disk = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let page_id = disk.allocate_page().unwrap();
        assert_ne!(page_id, INVALID_PAGE_ID);

        let mut image = vec![0u8; PAGE_SIZE];
        image[0] = 0xab;
        image[PAGE_SIZE - 1] = 0xcd;
        disk.write_page(page_id, Bytes::from(image.clone())).unwrap();

        let read_back = disk.read_page(page_id).unwrap();
        assert_eq!(&read_back[..], &image[..]);
    }

    #[test]
    fn unwritten_page_reads_zeroed() {
        let temp_dir = TempDir::new().unwrap();
        let disk = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let page_id = disk.allocate_page().unwrap();
        let data = disk.read_page(page_id).unwrap();
        assert!(data.iter().all(|b| *b == 0));
    }

    #[test]
    fn deallocated_page_id_is_recycled() {
        let temp_dir = TempDir::new().unwrap();
        let disk = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let first = disk.allocate_page().unwrap();
        let second = disk.allocate_page().unwrap();
        assert_ne!(first, second);

        disk.deallocate_page(first).unwrap();
        assert_eq!(disk.allocate_page().unwrap(), first);
    }
}
