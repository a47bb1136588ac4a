use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, LeafNode};
use crate::storage::buffer::BufferPoolManager;
use super::base::{BPlusTree, LeafTarget, PageLatch};

/// Ordered scan position over the leaf chain.
///
/// The iterator works on an owned snapshot of the current leaf; advancing
/// past the end of a leaf follows the next-leaf link through the buffer
/// pool. Ordering across leaves is guaranteed by the leaf chain.
pub struct TreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    page_id: PageId,
    leaf: Option<LeafNode<K>>,
    index: usize,
}

impl<K> TreeIterator<K>
where
    K: Clone + Ord + std::fmt::Debug + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    fn new(
        buffer_pool: Arc<BufferPoolManager>,
        position: Option<(PageId, LeafNode<K>)>,
        index: usize,
    ) -> Self {
        match position {
            Some((page_id, leaf)) => Self {
                buffer_pool,
                page_id,
                leaf: Some(leaf),
                index,
            },
            None => Self {
                buffer_pool,
                page_id: INVALID_PAGE_ID,
                leaf: None,
                index: 0,
            },
        }
    }

    /// True when the scan is past the last entry of the last leaf
    pub fn is_end(&self) -> bool {
        match &self.leaf {
            Some(leaf) => self.index >= leaf.size() && leaf.next_page_id == INVALID_PAGE_ID,
            None => true,
        }
    }

    fn load_leaf(&self, page_id: PageId) -> Result<LeafNode<K>, BTreeError> {
        let latch = PageLatch::read(&self.buffer_pool, page_id)?;
        match latch.node()? {
            BTreeNode::Leaf(leaf) => Ok(leaf),
            BTreeNode::Internal(_) => Err(BTreeError::Corrupted(format!(
                "leaf chain led to internal page {}",
                page_id
            ))),
        }
    }
}

impl<K> Iterator for TreeIterator<K>
where
    K: Clone + Ord + std::fmt::Debug + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.leaf.as_ref()?;
            if self.index < leaf.size() {
                let item = (leaf.keys[self.index].clone(), leaf.values[self.index]);
                self.index += 1;
                return Some(item);
            }
            if leaf.next_page_id == INVALID_PAGE_ID {
                self.leaf = None;
                return None;
            }
            let next_page_id = leaf.next_page_id;
            match self.load_leaf(next_page_id) {
                Ok(next_leaf) => {
                    self.page_id = next_page_id;
                    self.leaf = Some(next_leaf);
                    self.index = 0;
                }
                Err(e) => {
                    warn!("iterator stopped at page {}: {}", next_page_id, e);
                    self.leaf = None;
                    return None;
                }
            }
        }
    }
}

impl<K> PartialEq for TreeIterator<K> {
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id && self.index == other.index
    }
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + std::fmt::Debug + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Iterator positioned at the first entry of the tree
    pub fn begin(&self) -> Result<TreeIterator<K>, BTreeError> {
        let position = self.read_leaf(LeafTarget::Leftmost)?;
        Ok(TreeIterator::new(Arc::clone(&self.buffer_pool), position, 0))
    }

    /// Iterator positioned at the first entry whose key is >= `key`
    pub fn begin_at(&self, key: &K) -> Result<TreeIterator<K>, BTreeError> {
        let position = self.read_leaf(LeafTarget::Key(key))?;
        let index = position
            .as_ref()
            .map(|(_, leaf)| leaf.key_index(key))
            .unwrap_or(0);
        Ok(TreeIterator::new(Arc::clone(&self.buffer_pool), position, index))
    }

    /// One-past-last position of the rightmost leaf
    pub fn end(&self) -> Result<TreeIterator<K>, BTreeError> {
        let position = self.read_leaf(LeafTarget::Rightmost)?;
        let index = position.as_ref().map(|(_, leaf)| leaf.size()).unwrap_or(0);
        Ok(TreeIterator::new(Arc::clone(&self.buffer_pool), position, index))
    }
}
