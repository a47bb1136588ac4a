use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock};
use serde::{Deserialize, Serialize};

use crate::common::types::{Page, PageId, PagePtr, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::header;
use crate::index::btree::node::{BTreeNode, LeafNode};
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use crate::storage::buffer::BufferPoolManager;

pub(crate) type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
pub(crate) type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

pub(crate) enum LatchKind {
    Read(PageReadGuard),
    Write(PageWriteGuard),
}

/// A pinned, latched page. Dropping releases the latch and then the pin, so
/// every exit path (including `?` propagation) unwinds cleanly.
pub(crate) struct PageLatch {
    buffer_pool: Arc<BufferPoolManager>,
    page_id: PageId,
    guard: Option<LatchKind>,
    dirty: bool,
}

impl PageLatch {
    pub(crate) fn read(
        buffer_pool: &Arc<BufferPoolManager>,
        page_id: PageId,
    ) -> Result<Self, BTreeError> {
        let page = buffer_pool.fetch_page(page_id)?;
        let guard = page.read_arc();
        Ok(Self {
            buffer_pool: Arc::clone(buffer_pool),
            page_id,
            guard: Some(LatchKind::Read(guard)),
            dirty: false,
        })
    }

    pub(crate) fn write(
        buffer_pool: &Arc<BufferPoolManager>,
        page_id: PageId,
    ) -> Result<Self, BTreeError> {
        let page = buffer_pool.fetch_page(page_id)?;
        let guard = page.write_arc();
        Ok(Self {
            buffer_pool: Arc::clone(buffer_pool),
            page_id,
            guard: Some(LatchKind::Write(guard)),
            dirty: false,
        })
    }

    /// Wrap a page freshly returned (already pinned) by `new_page`
    pub(crate) fn from_new(
        buffer_pool: &Arc<BufferPoolManager>,
        page: PagePtr,
        page_id: PageId,
    ) -> Self {
        let guard = page.write_arc();
        Self {
            buffer_pool: Arc::clone(buffer_pool),
            page_id,
            guard: Some(LatchKind::Write(guard)),
            dirty: false,
        }
    }

    pub(crate) fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Decode the node stored in this page
    pub(crate) fn node<K>(&self) -> Result<BTreeNode<K>, BTreeError>
    where
        K: for<'de> Deserialize<'de> + Clone + Ord,
    {
        let page: &Page = match &self.guard {
            Some(LatchKind::Read(guard)) => guard,
            Some(LatchKind::Write(guard)) => guard,
            None => {
                return Err(BTreeError::Corrupted(format!(
                    "page {} accessed after its latch was released",
                    self.page_id
                )))
            }
        };
        deserialize_node(page)
    }

    /// Encode `node` into this page and mark the pin dirty
    pub(crate) fn write_node<K>(&mut self, node: &BTreeNode<K>) -> Result<(), BTreeError>
    where
        K: Serialize + Clone + Ord,
    {
        let page: &mut Page = match &mut self.guard {
            Some(LatchKind::Write(guard)) => guard,
            _ => {
                return Err(BTreeError::Corrupted(format!(
                    "page {} written without a write latch",
                    self.page_id
                )))
            }
        };
        serialize_node(node, page)?;
        self.dirty = true;
        Ok(())
    }
}

impl Drop for PageLatch {
    fn drop(&mut self) {
        // latch first, pin second
        self.guard.take();
        let _ = self.buffer_pool.unpin_page(self.page_id, self.dirty);
    }
}

/// Which structural operation a write descent is serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessOp {
    Insert,
    Remove,
}

/// Where a read descent should land
#[derive(Clone, Copy)]
pub(crate) enum LeafTarget<'a, K> {
    Leftmost,
    Rightmost,
    Key(&'a K),
}

/// Concurrent B+tree index over buffer-pool pages.
///
/// Lookups descend with read-latch crabbing; inserts and removals descend
/// with write latches, releasing every ancestor as soon as the child below it
/// is proven safe for the pending operation.
pub struct BPlusTree<K> {
    pub(crate) name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    root_page_id: AtomicU32,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    /// Serialises the empty-tree transition on insert
    pub(crate) tree_latch: Mutex<()>,
    _phantom: PhantomData<K>,
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + std::fmt::Debug + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Open the index named `name`, reading its root from the header page.
    /// An index that has never been written starts empty.
    pub fn new(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        let name = name.into();

        let page = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let root = {
            let guard = page.read();
            header::get_record(&guard, &name)
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, false)?;

        Ok(Self {
            name,
            buffer_pool,
            root_page_id: AtomicU32::new(root.unwrap_or(INVALID_PAGE_ID)),
            leaf_max_size,
            internal_max_size,
            tree_latch: Mutex::new(()),
            _phantom: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    pub(crate) fn root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_root_page_id(&self, page_id: PageId) {
        self.root_page_id.store(page_id, Ordering::SeqCst);
    }

    /// Record the current root in the header page
    pub(crate) fn update_root_record(&self) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let result = {
            let mut guard = page.write();
            header::upsert_record(&mut guard, &self.name, self.root_page_id())
        };
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        result
    }

    /// Point lookup. Returns the rids stored under `key` (at most one, since
    /// keys are unique).
    pub fn get_value(&self, key: &K) -> Result<Vec<Rid>, BTreeError> {
        let leaf_latch = match self.find_leaf_read(LeafTarget::Key(key))? {
            Some(latch) => latch,
            None => return Ok(Vec::new()),
        };
        match leaf_latch.node()? {
            BTreeNode::Leaf(leaf) => Ok(leaf.lookup(key).into_iter().collect()),
            BTreeNode::Internal(_) => Err(BTreeError::Corrupted(format!(
                "descent ended on internal page {}",
                leaf_latch.page_id()
            ))),
        }
    }

    /// Latch the root, re-checking its identity afterwards: a concurrent
    /// split or root adjustment may have moved the root while we waited.
    fn latch_root(&self, write: bool) -> Result<Option<PageLatch>, BTreeError> {
        loop {
            let root = self.root_page_id();
            if root == INVALID_PAGE_ID {
                return Ok(None);
            }
            let latch = if write {
                PageLatch::write(&self.buffer_pool, root)?
            } else {
                PageLatch::read(&self.buffer_pool, root)?
            };
            if self.root_page_id() == root {
                return Ok(Some(latch));
            }
        }
    }

    /// Read-crabbing descent: the child is latched before the parent latch
    /// is released, and search never restructures.
    pub(crate) fn find_leaf_read(
        &self,
        target: LeafTarget<'_, K>,
    ) -> Result<Option<PageLatch>, BTreeError> {
        let mut current = match self.latch_root(false)? {
            Some(latch) => latch,
            None => return Ok(None),
        };

        loop {
            match current.node()? {
                BTreeNode::Leaf(_) => return Ok(Some(current)),
                BTreeNode::Internal(internal) => {
                    let child_id = match target {
                        LeafTarget::Leftmost => internal.child_at(0),
                        LeafTarget::Rightmost => internal.child_at(internal.size() - 1),
                        LeafTarget::Key(key) => internal.lookup(key),
                    };
                    // acquiring the child drops the parent latch afterwards
                    current = PageLatch::read(&self.buffer_pool, child_id)?;
                }
            }
        }
    }

    /// Write-crabbing descent for insert/remove. Returns the root-first
    /// chain of write-latched pages ending at the leaf; every ancestor above
    /// the last unsafe node has already been released. An empty vec means
    /// the tree was empty.
    pub(crate) fn find_leaf_write(
        &self,
        key: &K,
        op: AccessOp,
    ) -> Result<Vec<PageLatch>, BTreeError> {
        let mut path: Vec<PageLatch> = Vec::new();
        let mut current = match self.latch_root(true)? {
            Some(latch) => latch,
            None => return Ok(path),
        };
        let mut depth = 0usize;

        loop {
            let node: BTreeNode<K> = current.node()?;
            let is_root = depth == 0;
            let safe = match op {
                AccessOp::Insert => node.is_insert_safe(),
                AccessOp::Remove => node.is_delete_safe(is_root),
            };
            if safe {
                // ancestors can no longer be touched by this operation
                path.clear();
            }

            match node {
                BTreeNode::Leaf(_) => {
                    path.push(current);
                    return Ok(path);
                }
                BTreeNode::Internal(internal) => {
                    let child_id = internal.lookup(key);
                    path.push(current);
                    current = PageLatch::write(&self.buffer_pool, child_id)?;
                    depth += 1;
                }
            }
        }
    }

    /// Fetch every child in `children` and point its parent at `parent_id`.
    /// Used after internal-node moves, which relocate whole child subtrees.
    pub(crate) fn reparent_children(
        &self,
        children: &[PageId],
        parent_id: PageId,
    ) -> Result<(), BTreeError> {
        for &child_id in children {
            let mut latch = PageLatch::write(&self.buffer_pool, child_id)?;
            let mut node: BTreeNode<K> = latch.node()?;
            node.set_parent_page_id(parent_id);
            latch.write_node(&node)?;
        }
        Ok(())
    }

    /// Read an owned copy of a leaf for iteration; the pin and latch are
    /// released before returning.
    pub(crate) fn read_leaf(
        &self,
        target: LeafTarget<'_, K>,
    ) -> Result<Option<(PageId, LeafNode<K>)>, BTreeError> {
        let latch = match self.find_leaf_read(target)? {
            Some(latch) => latch,
            None => return Ok(None),
        };
        match latch.node()? {
            BTreeNode::Leaf(leaf) => Ok(Some((latch.page_id(), leaf))),
            BTreeNode::Internal(_) => Err(BTreeError::Corrupted(format!(
                "descent ended on internal page {}",
                latch.page_id()
            ))),
        }
    }
}
