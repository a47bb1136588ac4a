use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager handles the actual disk I/O: synchronous, in-order reads and
/// writes of fixed-size pages, plus page allocation and deallocation.
///
/// Page 0 is reserved for the index header page; fresh allocations start at 1
/// and deallocated ids are reused before the file grows.
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicU32,
    free_pages: Mutex<Vec<PageId>>,
}

impl DiskManager {
    /// Open (or create) the database file at `db_path`
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        let file_size = file.metadata()?.len();
        let next_page_id = ((file_size / PAGE_SIZE as u64) as PageId).max(1);

        Ok(Self {
            db_file: Mutex::new(file),
            next_page_id: AtomicU32::new(next_page_id),
            free_pages: Mutex::new(Vec::new()),
        })
    }

    /// Read a page from disk. Reading past the end of the file yields a
    /// zeroed page, so freshly allocated pages are readable before their
    /// first write-back.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut buffer = [0u8; PAGE_SIZE];

        {
            let mut file = self.db_file.lock();
            let file_size = file.metadata()?.len();

            if offset + PAGE_SIZE as u64 > file_size {
                page.reset();
                page.page_id = page_id;
                return Ok(());
            }

            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buffer)?;
        }

        page.data.copy_from_slice(&buffer);
        page.page_id = page_id;

        Ok(())
    }

    /// Write a page to disk
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = Self::page_offset(page.page_id);

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data)?;
        file.flush()?;

        Ok(())
    }

    /// Hand out a page id: a previously deallocated id if one is available,
    /// otherwise the next unused id.
    pub fn allocate_page(&self) -> PageId {
        if let Some(page_id) = self.free_pages.lock().pop() {
            return page_id;
        }
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Return a page id to the allocator for reuse. Idempotent: deleting a
    /// page that is already free must not hand the id out twice.
    pub fn deallocate_page(&self, page_id: PageId) {
        if page_id == INVALID_PAGE_ID || page_id == 0 {
            return;
        }
        let mut free_pages = self.free_pages.lock();
        if !free_pages.contains(&page_id) {
            free_pages.push(page_id);
        }
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id as u64 * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_then_read_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(file.path()).unwrap();

        let page_id = dm.allocate_page();
        let mut page = Page::new(page_id);
        page.data[0..5].copy_from_slice(b"tarim");
        dm.write_page(&page).unwrap();

        let mut read_back = Page::new(INVALID_PAGE_ID);
        dm.read_page(page_id, &mut read_back).unwrap();
        assert_eq!(read_back.page_id, page_id);
        assert_eq!(&read_back.data[0..5], b"tarim");
    }

    #[test]
    fn test_read_past_eof_is_zeroed() {
        let file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(file.path()).unwrap();

        let mut page = Page::new(INVALID_PAGE_ID);
        page.data[10] = 0xAB;
        dm.read_page(42, &mut page).unwrap();
        assert_eq!(page.page_id, 42);
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_deallocated_ids_are_reused() {
        let file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(file.path()).unwrap();

        let a = dm.allocate_page();
        let b = dm.allocate_page();
        assert_ne!(a, b);

        dm.deallocate_page(a);
        assert_eq!(dm.allocate_page(), a);
    }

    #[test]
    fn test_invalid_page_id_rejected() {
        let file = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(file.path()).unwrap();

        let mut page = Page::new(INVALID_PAGE_ID);
        assert!(dm.read_page(INVALID_PAGE_ID, &mut page).is_err());
        assert!(dm.write_page(&page).is_err());
    }
}
