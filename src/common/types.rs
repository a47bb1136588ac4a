use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Page size in bytes (8KB)
pub const PAGE_SIZE: usize = 8192;

/// Page ID type
pub type PageId = u32;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Transaction ID type; lower ids are older transactions
pub type TxnId = u32;

/// Sentinel meaning "no page"
pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// Page 0 holds the index-name -> root-page-id records
pub const HEADER_PAGE_ID: PageId = 0;

/// Row identifier: the page a tuple lives on plus its slot number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot_num)
    }
}

/// Page structure: a fixed-size byte buffer plus its identity
#[derive(Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    /// Zero the byte buffer
    pub fn reset(&mut self) {
        self.data.fill(0);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").field("page_id", &self.page_id).finish()
    }
}

/// Smart pointer to a page; the `RwLock` is the page latch
pub type PagePtr = Arc<RwLock<Page>>;

/// Buffer pool frame: one page's bytes plus replacement metadata.
/// Metadata fields are mutated only under the buffer pool's latch.
#[derive(Debug)]
pub struct Frame {
    pub page: PagePtr,
    pub page_id: PageId,
    pub pin_count: u32,
    pub is_dirty: bool,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            page: Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}
