use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, InternalNode, LeafNode};
use super::base::{AccessOp, BPlusTree, PageLatch};

impl<K> BPlusTree<K>
where
    K: Clone + Ord + std::fmt::Debug + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Insert a key/value pair. Returns false if the key already exists
    /// (keys are unique).
    pub fn insert(&self, key: K, value: Rid) -> Result<bool, BTreeError> {
        let mut path = loop {
            {
                let _tree_guard = self.tree_latch.lock();
                if self.is_empty() {
                    self.start_new_tree(key, value)?;
                    return Ok(true);
                }
            }
            let path = self.find_leaf_write(&key, AccessOp::Insert)?;
            if !path.is_empty() {
                break path;
            }
            // the tree emptied out between the check and the descent
        };

        let mut leaf_latch = match path.pop() {
            Some(latch) => latch,
            None => return Err(BTreeError::Corrupted("descent returned no leaf".into())),
        };
        let mut leaf = match leaf_latch.node()? {
            BTreeNode::Leaf(leaf) => leaf,
            BTreeNode::Internal(_) => {
                return Err(BTreeError::Corrupted(format!(
                    "descent ended on internal page {}",
                    leaf_latch.page_id()
                )))
            }
        };

        if leaf.lookup(&key).is_some() {
            return Ok(false);
        }

        leaf.insert(key, value);
        if leaf.size() >= self.leaf_max_size {
            self.split_leaf(path, leaf_latch, leaf)?;
        } else {
            leaf_latch.write_node(&BTreeNode::Leaf(leaf))?;
        }
        Ok(true)
    }

    /// First insert into an empty tree: allocate a root leaf and register it
    /// in the header page. Caller holds the tree latch.
    fn start_new_tree(&self, key: K, value: Rid) -> Result<(), BTreeError> {
        let (page, root_id) = self.buffer_pool.new_page()?;
        let mut latch = PageLatch::from_new(&self.buffer_pool, page, root_id);

        let mut leaf = LeafNode::new(self.leaf_max_size);
        leaf.insert(key, value);
        latch.write_node(&BTreeNode::Leaf(leaf))?;

        self.set_root_page_id(root_id);
        self.update_root_record()?;
        debug!("{}: started new tree at root page {}", self.name, root_id);
        Ok(())
    }

    /// Split a full leaf into itself plus a new right sibling, then push the
    /// separator into the parent.
    fn split_leaf(
        &self,
        path: Vec<PageLatch>,
        mut leaf_latch: PageLatch,
        mut leaf: LeafNode<K>,
    ) -> Result<(), BTreeError> {
        let (page, sibling_id) = self.buffer_pool.new_page()?;
        let mut sibling_latch = PageLatch::from_new(&self.buffer_pool, page, sibling_id);

        let mut sibling = LeafNode::new(self.leaf_max_size);
        leaf.move_half_to(&mut sibling);
        sibling.parent_page_id = leaf.parent_page_id;
        leaf.next_page_id = sibling_id;

        let separator = sibling.keys[0].clone();
        debug!(
            "{}: split leaf {} -> sibling {} at {:?}",
            self.name,
            leaf_latch.page_id(),
            sibling_id,
            separator
        );

        leaf_latch.write_node(&BTreeNode::Leaf(leaf))?;
        sibling_latch.write_node(&BTreeNode::Leaf(sibling))?;
        self.insert_into_parent(path, leaf_latch, separator, sibling_latch)
    }

    /// Insert `separator`/right into the parent of left, splitting upward as
    /// long as parents overflow. `path` holds the still-latched unsafe
    /// ancestors, ending with left's parent.
    fn insert_into_parent(
        &self,
        mut path: Vec<PageLatch>,
        mut left_latch: PageLatch,
        mut separator: K,
        mut right_latch: PageLatch,
    ) -> Result<(), BTreeError> {
        loop {
            let left_id = left_latch.page_id();
            let right_id = right_latch.page_id();

            let mut parent_latch = match path.pop() {
                Some(latch) => latch,
                None => {
                    // left was the root: grow the tree by one level
                    let (page, root_id) = self.buffer_pool.new_page()?;
                    let mut root_latch = PageLatch::from_new(&self.buffer_pool, page, root_id);
                    let root = InternalNode::new_root(
                        left_id,
                        separator,
                        right_id,
                        self.internal_max_size,
                    );
                    root_latch.write_node(&BTreeNode::Internal(root))?;

                    self.set_parent(&mut left_latch, root_id)?;
                    self.set_parent(&mut right_latch, root_id)?;
                    self.set_root_page_id(root_id);
                    self.update_root_record()?;
                    debug!("{}: new root page {}", self.name, root_id);
                    return Ok(());
                }
            };

            let mut parent = match parent_latch.node()? {
                BTreeNode::Internal(parent) => parent,
                BTreeNode::Leaf(_) => {
                    return Err(BTreeError::Corrupted(format!(
                        "leaf page {} latched as an ancestor",
                        parent_latch.page_id()
                    )))
                }
            };

            let new_size = parent
                .insert_node_after(left_id, separator, right_id)
                .ok_or_else(|| {
                    BTreeError::Corrupted(format!(
                        "page {} is not a child of its recorded parent {}",
                        left_id,
                        parent_latch.page_id()
                    ))
                })?;

            // the split halves are final; release them before going up
            drop(left_latch);
            drop(right_latch);

            // an internal node splits only once it exceeds its capacity
            if new_size <= self.internal_max_size {
                parent_latch.write_node(&BTreeNode::Internal(parent))?;
                return Ok(());
            }

            // parent overflows: split it and carry the promoted key upward
            let (page, sibling_id) = self.buffer_pool.new_page()?;
            let mut sibling_latch = PageLatch::from_new(&self.buffer_pool, page, sibling_id);

            let mut sibling = InternalNode::new(self.internal_max_size);
            let promoted = parent.move_half_to(&mut sibling);
            sibling.parent_page_id = parent.parent_page_id;
            self.reparent_children(&sibling.children, sibling_id)?;

            debug!(
                "{}: split internal {} -> sibling {}",
                self.name,
                parent_latch.page_id(),
                sibling_id
            );

            parent_latch.write_node(&BTreeNode::Internal(parent))?;
            sibling_latch.write_node(&BTreeNode::Internal(sibling))?;

            left_latch = parent_latch;
            right_latch = sibling_latch;
            separator = promoted;
        }
    }

    /// Rewrite a node's parent pointer in place
    fn set_parent(&self, latch: &mut PageLatch, parent_id: PageId) -> Result<(), BTreeError> {
        let mut node: BTreeNode<K> = latch.node()?;
        node.set_parent_page_id(parent_id);
        latch.write_node(&node)
    }
}

impl BPlusTree<i64> {
    /// Bulk insert: one integer key per whitespace-separated token. The rid
    /// is derived from the key. Intended for test driving.
    pub fn insert_from_file(&self, path: impl AsRef<Path>) -> Result<(), BTreeError> {
        for line in BufReader::new(File::open(path)?).lines() {
            for token in line?.split_whitespace() {
                if let Ok(key) = token.parse::<i64>() {
                    let rid = Rid::new((key >> 32) as u32, key as u32);
                    self.insert(key, rid)?;
                }
            }
        }
        Ok(())
    }

    /// Bulk remove: one integer key per whitespace-separated token
    pub fn remove_from_file(&self, path: impl AsRef<Path>) -> Result<(), BTreeError> {
        for line in BufReader::new(File::open(path)?).lines() {
            for token in line?.split_whitespace() {
                if let Ok(key) = token.parse::<i64>() {
                    self.remove(&key)?;
                }
            }
        }
        Ok(())
    }
}
