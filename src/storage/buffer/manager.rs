use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::types::{Frame, FrameId, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;

/// Buffer pool manager: brokers all access to disk-resident pages.
///
/// A single latch (`inner`) serialises every structural change: the page
/// table, the free list, per-frame pin counts and dirty flags, and the
/// replacer. Page bytes are accessed by callers under the per-page latch,
/// and all disk I/O happens outside the pool latch.
pub struct BufferPoolManager {
    pool_size: usize,
    disk_manager: Arc<DiskManager>,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruReplacer,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);

        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            frames.push(Frame::new());
            free_list.push_back(i as FrameId);
        }

        Ok(Self {
            pool_size,
            disk_manager,
            inner: Mutex::new(PoolInner {
                frames,
                page_table: HashMap::new(),
                free_list,
                replacer: LruReplacer::new(pool_size),
            }),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Fetch a page, reading it from disk on a miss. The returned page is
    /// pinned; the caller must balance this with exactly one `unpin_page`.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let (page_ptr, write_back) = {
            let mut inner = self.inner.lock();

            if let Some(&frame_id) = inner.page_table.get(&page_id) {
                let frame = &mut inner.frames[frame_id as usize];
                frame.pin_count += 1;
                let ptr = frame.page.clone();
                inner.replacer.pin(frame_id);
                return Ok(ptr);
            }

            let frame_id = Self::pick_victim(&mut inner)?;
            let old_page_id = inner.frames[frame_id as usize].page_id;
            let write_back = old_page_id != INVALID_PAGE_ID
                && inner.frames[frame_id as usize].is_dirty;
            if old_page_id != INVALID_PAGE_ID {
                inner.page_table.remove(&old_page_id);
                debug!("evicting page {} from frame {}", old_page_id, frame_id);
            }

            let frame = &mut inner.frames[frame_id as usize];
            frame.page_id = page_id;
            frame.pin_count = 1;
            frame.is_dirty = false;
            let ptr = frame.page.clone();
            inner.page_table.insert(page_id, frame_id);
            (ptr, write_back)
        };

        // Disk I/O outside the pool latch, under the page latch. The page
        // still carries the evicted page's id and bytes at this point.
        let io_result = (|| -> Result<(), BufferPoolError> {
            let mut page = page_ptr.write();
            if write_back {
                self.disk_manager.write_page(&page)?;
            }
            self.disk_manager.read_page(page_id, &mut page)?;
            Ok(())
        })();

        if let Err(e) = io_result {
            self.discard_installed(page_id);
            return Err(e);
        }

        Ok(page_ptr)
    }

    /// Allocate a brand-new zeroed page. The returned page is pinned.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let page_id = self.disk_manager.allocate_page();

        let (page_ptr, write_back) = {
            let mut inner = self.inner.lock();

            let frame_id = match Self::pick_victim(&mut inner) {
                Ok(frame_id) => frame_id,
                Err(e) => {
                    drop(inner);
                    self.disk_manager.deallocate_page(page_id);
                    return Err(e);
                }
            };
            let old_page_id = inner.frames[frame_id as usize].page_id;
            let write_back = old_page_id != INVALID_PAGE_ID
                && inner.frames[frame_id as usize].is_dirty;
            if old_page_id != INVALID_PAGE_ID {
                inner.page_table.remove(&old_page_id);
                debug!("evicting page {} from frame {}", old_page_id, frame_id);
            }

            let frame = &mut inner.frames[frame_id as usize];
            frame.page_id = page_id;
            frame.pin_count = 1;
            frame.is_dirty = false;
            let ptr = frame.page.clone();
            inner.page_table.insert(page_id, frame_id);
            (ptr, write_back)
        };

        let io_result = (|| -> Result<(), BufferPoolError> {
            let mut page = page_ptr.write();
            if write_back {
                self.disk_manager.write_page(&page)?;
            }
            page.reset();
            page.page_id = page_id;
            Ok(())
        })();

        if let Err(e) = io_result {
            self.discard_installed(page_id);
            self.disk_manager.deallocate_page(page_id);
            return Err(e);
        }

        Ok((page_ptr, page_id))
    }

    /// Drop one pin on a page, optionally marking it dirty. Unpinning a page
    /// that is not in the pool is a no-op. The dirty flag is sticky: it is
    /// OR-ed in, never cleared here.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();

        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(()),
        };

        let frame = &mut inner.frames[frame_id as usize];
        if is_dirty {
            frame.is_dirty = true;
        }
        if frame.pin_count == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }
        frame.pin_count -= 1;
        let now_unpinned = frame.pin_count == 0;

        if now_unpinned {
            inner.replacer.unpin(frame_id);
        }
        Ok(())
    }

    /// Write a page to disk if it is dirty. The dirty bit is not cleared:
    /// callers relying on clean-after-flush must re-flush after later writes.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let page_ptr = {
            let inner = self.inner.lock();
            let &frame_id = inner
                .page_table
                .get(&page_id)
                .ok_or(BufferPoolError::PageNotFound(page_id))?;
            let frame = &inner.frames[frame_id as usize];
            if !frame.is_dirty {
                return Ok(());
            }
            frame.page.clone()
        };

        let page = page_ptr.read();
        self.disk_manager.write_page(&page)?;
        Ok(())
    }

    /// Write every dirty page to disk
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let dirty_pages: Vec<PagePtr> = {
            let inner = self.inner.lock();
            inner
                .frames
                .iter()
                .filter(|f| f.page_id != INVALID_PAGE_ID && f.is_dirty)
                .map(|f| f.page.clone())
                .collect()
        };

        for page_ptr in dirty_pages {
            let page = page_ptr.read();
            self.disk_manager.write_page(&page)?;
        }
        Ok(())
    }

    /// Remove a page from the pool and deallocate it on disk. Fails if the
    /// page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        {
            let mut inner = self.inner.lock();

            let frame_id = match inner.page_table.get(&page_id) {
                Some(&frame_id) => frame_id,
                None => {
                    drop(inner);
                    self.disk_manager.deallocate_page(page_id);
                    return Ok(());
                }
            };

            if inner.frames[frame_id as usize].pin_count > 0 {
                return Err(BufferPoolError::PagePinned(page_id));
            }

            inner.page_table.remove(&page_id);
            let frame = &mut inner.frames[frame_id as usize];
            frame.page_id = INVALID_PAGE_ID;
            frame.is_dirty = false;
            frame.pin_count = 0;
            inner.replacer.pin(frame_id);
            inner.free_list.push_back(frame_id);
        }

        debug!("deleted page {}", page_id);
        self.disk_manager.deallocate_page(page_id);
        Ok(())
    }

    /// Current pin count of a page, if it is resident. Inspection hook for
    /// tests and debugging.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.inner.lock();
        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| inner.frames[frame_id as usize].pin_count)
    }

    fn pick_victim(inner: &mut PoolInner) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }
        inner.replacer.victim().ok_or(BufferPoolError::BufferPoolFull)
    }

    /// Undo a mapping installed by fetch/new after the I/O step failed
    fn discard_installed(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        if let Some(frame_id) = inner.page_table.remove(&page_id) {
            let frame = &mut inner.frames[frame_id as usize];
            frame.page_id = INVALID_PAGE_ID;
            frame.pin_count = 0;
            frame.is_dirty = false;
            inner.free_list.push_back(frame_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_pool(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let pool = BufferPoolManager::new(pool_size, file.path()).unwrap();
        (pool, file)
    }

    #[test]
    fn test_unpin_absent_page_is_noop() {
        let (pool, _file) = test_pool(4);
        assert!(pool.unpin_page(99, true).is_ok());
    }

    #[test]
    fn test_unpin_below_zero_fails() {
        let (pool, _file) = test_pool(4);
        let (_, page_id) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false).unwrap();
        assert!(matches!(
            pool.unpin_page(page_id, false),
            Err(BufferPoolError::PageNotPinned(_))
        ));
    }

    #[test]
    fn test_dirty_flag_is_sticky() {
        let (pool, _file) = test_pool(4);
        let (_, page_id) = pool.new_page().unwrap();
        pool.unpin_page(page_id, true).unwrap();

        // A later clean unpin must not clear the dirty bit
        pool.fetch_page(page_id).unwrap();
        pool.unpin_page(page_id, false).unwrap();

        let inner = pool.inner.lock();
        let frame_id = inner.page_table[&page_id];
        assert!(inner.frames[frame_id as usize].is_dirty);
    }

    #[test]
    fn test_delete_pinned_page_fails() {
        let (pool, _file) = test_pool(4);
        let (_, page_id) = pool.new_page().unwrap();
        assert!(matches!(
            pool.delete_page(page_id),
            Err(BufferPoolError::PagePinned(_))
        ));
        // and the pool latch was released on the failure path
        pool.unpin_page(page_id, false).unwrap();
        assert!(pool.delete_page(page_id).is_ok());
    }

    #[test]
    fn test_all_pinned_pool_is_full() {
        let (pool, _file) = test_pool(2);
        pool.new_page().unwrap();
        pool.new_page().unwrap();
        assert!(matches!(pool.new_page(), Err(BufferPoolError::BufferPoolFull)));
    }

    #[test]
    fn test_replacer_tracks_exactly_unpinned_resident_frames() {
        let (pool, _file) = test_pool(4);
        let (_, a) = pool.new_page().unwrap();
        let (_, b) = pool.new_page().unwrap();

        {
            let inner = pool.inner.lock();
            assert_eq!(inner.replacer.len(), 0);
        }

        pool.unpin_page(a, false).unwrap();
        {
            let inner = pool.inner.lock();
            assert_eq!(inner.replacer.len(), 1);
        }

        // re-pinning removes the frame from the replacer again
        pool.fetch_page(a).unwrap();
        {
            let inner = pool.inner.lock();
            assert_eq!(inner.replacer.len(), 0);
        }

        pool.unpin_page(a, false).unwrap();
        pool.unpin_page(b, false).unwrap();
        {
            let inner = pool.inner.lock();
            assert_eq!(inner.replacer.len(), 2);
            assert_eq!(inner.page_table.len(), 2);
        }
    }

    #[test]
    fn test_eviction_prefers_free_list_then_lru() {
        let (pool, _file) = test_pool(2);
        let (_, a) = pool.new_page().unwrap();
        pool.unpin_page(a, true).unwrap();
        let (_, b) = pool.new_page().unwrap();
        pool.unpin_page(b, true).unwrap();

        // Pool is at capacity with both pages unpinned; the next allocation
        // must evict the least-recently-unpinned page (a).
        let (_, c) = pool.new_page().unwrap();
        {
            let inner = pool.inner.lock();
            assert!(!inner.page_table.contains_key(&a));
            assert!(inner.page_table.contains_key(&b));
            assert!(inner.page_table.contains_key(&c));
        }

        // a's dirty bytes were written back; fetching it evicts b
        pool.unpin_page(c, false).unwrap();
        let page = pool.fetch_page(a).unwrap();
        assert_eq!(page.read().page_id, a);
    }
}
