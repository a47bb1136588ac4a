use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::common::types::INVALID_PAGE_ID;
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, InternalNode};
use super::base::{AccessOp, BPlusTree, PageLatch};

impl<K> BPlusTree<K>
where
    K: Clone + Ord + std::fmt::Debug + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Remove `key` from the tree. Removing an absent key is a no-op.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let mut path = self.find_leaf_write(key, AccessOp::Remove)?;
        let mut leaf_latch = match path.pop() {
            Some(latch) => latch,
            None => return Ok(()), // empty tree
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

        if leaf.remove(key).is_none() {
            return Ok(()); // key absent; latches release clean
        }

        let is_root = leaf_latch.page_id() == self.root_page_id();
        let node = BTreeNode::Leaf(leaf);
        if node.needs_rebalance(is_root) {
            self.coalesce_or_redistribute(&mut path, leaf_latch, node)
        } else {
            leaf_latch.write_node(&node)?;
            Ok(())
        }
    }

    /// Restore the minimum-size invariant for an underfull node: merge it
    /// with a sibling when both fit in one page, otherwise borrow a single
    /// entry. The root is adjusted instead.
    fn coalesce_or_redistribute(
        &self,
        path: &mut Vec<PageLatch>,
        mut node_latch: PageLatch,
        mut node: BTreeNode<K>,
    ) -> Result<(), BTreeError> {
        if node_latch.page_id() == self.root_page_id() {
            return self.adjust_root(node_latch, node);
        }

        let mut parent_latch = match path.pop() {
            Some(latch) => latch,
            None => {
                return Err(BTreeError::Corrupted(format!(
                    "underfull page {} has no latched parent",
                    node_latch.page_id()
                )))
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

        let index = parent.value_index(node_latch.page_id()).ok_or_else(|| {
            BTreeError::Corrupted(format!(
                "page {} is not a child of its recorded parent {}",
                node_latch.page_id(),
                parent_latch.page_id()
            ))
        })?;
        // prefer the left sibling; the leftmost child pairs with its right one
        let sibling_index = if index == 0 { 1 } else { index - 1 };
        let sibling_id = parent.child_at(sibling_index);
        let mut sibling_latch = PageLatch::write(&self.buffer_pool, sibling_id)?;
        let mut sibling = sibling_latch.node()?;

        // the pair fits in one node: for leaves that means staying below the
        // split threshold, for internal nodes filling it exactly is fine
        let fits = match &node {
            BTreeNode::Leaf(_) => sibling.size() + node.size() < node.max_size(),
            BTreeNode::Internal(_) => sibling.size() + node.size() <= node.max_size(),
        };
        if fits {
            // coalesce: fold the right node of the pair into the left one,
            // releasing the surviving node before walking up (a later root
            // adjustment may need to latch it again)
            if index == 0 {
                self.merge_into(&mut parent, &mut node_latch, &mut node, sibling_latch, sibling, 1)?;
                drop(node_latch);
            } else {
                self.merge_into(&mut parent, &mut sibling_latch, &mut sibling, node_latch, node, index)?;
                drop(sibling_latch);
            }

            let parent_is_root = parent_latch.page_id() == self.root_page_id();
            let parent = BTreeNode::Internal(parent);
            if parent.needs_rebalance(parent_is_root) {
                parent_latch.write_node(&parent)?;
                self.coalesce_or_redistribute(path, parent_latch, parent)
            } else {
                parent_latch.write_node(&parent)?;
                Ok(())
            }
        } else {
            // redistribute: borrow one entry across the boundary
            self.redistribute(&mut parent, &mut node_latch, &mut node, &mut sibling_latch, &mut sibling, index)?;
            parent_latch.write_node(&BTreeNode::Internal(parent))?;
            Ok(())
        }
    }

    /// Merge `right` into `left` (its left sibling in key order), drop the
    /// parent's separator slot, and delete the emptied page.
    fn merge_into(
        &self,
        parent: &mut InternalNode<K>,
        left_latch: &mut PageLatch,
        left: &mut BTreeNode<K>,
        right_latch: PageLatch,
        right: BTreeNode<K>,
        parent_slot: usize,
    ) -> Result<(), BTreeError> {
        let middle_key = parent.key_at(parent_slot).clone();

        match (&mut *left, right) {
            (BTreeNode::Leaf(left), BTreeNode::Leaf(mut right)) => {
                right.move_all_to(left);
            }
            (BTreeNode::Internal(left), BTreeNode::Internal(mut right)) => {
                let moved = right.children.clone();
                right.move_all_to(left, middle_key);
                self.reparent_children(&moved, left_latch.page_id())?;
            }
            _ => {
                return Err(BTreeError::Corrupted(format!(
                    "sibling pages {} and {} disagree on node kind",
                    left_latch.page_id(),
                    right_latch.page_id()
                )))
            }
        }
        parent.remove_at(parent_slot);
        left_latch.write_node(left)?;

        debug!(
            "{}: coalesced page {} into {}",
            self.name,
            right_latch.page_id(),
            left_latch.page_id()
        );

        let right_id = right_latch.page_id();
        drop(right_latch);
        if let Err(e) = self.buffer_pool.delete_page(right_id) {
            warn!("{}: could not delete merged page {}: {}", self.name, right_id, e);
        }
        Ok(())
    }

    /// Borrow a single entry from `sibling` into `node`, updating the
    /// parent's separator to the new boundary.
    fn redistribute(
        &self,
        parent: &mut InternalNode<K>,
        node_latch: &mut PageLatch,
        node: &mut BTreeNode<K>,
        sibling_latch: &mut PageLatch,
        sibling: &mut BTreeNode<K>,
        index: usize,
    ) -> Result<(), BTreeError> {
        match (node, sibling) {
            (BTreeNode::Leaf(node), BTreeNode::Leaf(sibling)) => {
                if index == 0 {
                    // right sibling: its first entry moves to our end
                    sibling.move_first_to_end_of(node);
                    parent.set_key_at(1, sibling.keys[0].clone());
                } else {
                    // left sibling: its last entry moves to our front
                    sibling.move_last_to_front_of(node);
                    parent.set_key_at(index, node.keys[0].clone());
                }
                node_latch.write_node(&BTreeNode::Leaf(node.clone()))?;
                sibling_latch.write_node(&BTreeNode::Leaf(sibling.clone()))?;
            }
            (BTreeNode::Internal(node), BTreeNode::Internal(sibling)) => {
                if index == 0 {
                    let middle_key = parent.key_at(1).clone();
                    let (moved_child, new_separator) =
                        sibling.move_first_to_end_of(node, middle_key);
                    parent.set_key_at(1, new_separator);
                    self.reparent_children(&[moved_child], node_latch.page_id())?;
                } else {
                    let middle_key = parent.key_at(index).clone();
                    let (moved_child, new_separator) =
                        sibling.move_last_to_front_of(node, middle_key);
                    parent.set_key_at(index, new_separator);
                    self.reparent_children(&[moved_child], node_latch.page_id())?;
                }
                node_latch.write_node(&BTreeNode::Internal(node.clone()))?;
                sibling_latch.write_node(&BTreeNode::Internal(sibling.clone()))?;
            }
            _ => {
                return Err(BTreeError::Corrupted(format!(
                    "sibling pages {} and {} disagree on node kind",
                    node_latch.page_id(),
                    sibling_latch.page_id()
                )))
            }
        }

        debug!(
            "{}: redistributed between pages {} and {}",
            self.name,
            node_latch.page_id(),
            sibling_latch.page_id()
        );
        Ok(())
    }

    /// The root is exempt from the minimum-size rule but still shrinks the
    /// tree: an empty leaf root empties the tree, an internal root with a
    /// single child promotes that child.
    fn adjust_root(
        &self,
        mut root_latch: PageLatch,
        node: BTreeNode<K>,
    ) -> Result<(), BTreeError> {
        match node {
            BTreeNode::Leaf(leaf) => {
                if leaf.size() > 0 {
                    root_latch.write_node(&BTreeNode::Leaf(leaf))?;
                    return Ok(());
                }
                // last entry of the whole tree removed
                let old_root = root_latch.page_id();
                self.set_root_page_id(INVALID_PAGE_ID);
                self.update_root_record()?;
                drop(root_latch);
                if let Err(e) = self.buffer_pool.delete_page(old_root) {
                    warn!("{}: could not delete old root {}: {}", self.name, old_root, e);
                }
                debug!("{}: tree is now empty", self.name);
                Ok(())
            }
            BTreeNode::Internal(internal) => {
                if internal.size() > 1 {
                    root_latch.write_node(&BTreeNode::Internal(internal))?;
                    return Ok(());
                }
                // promote the only child as the new root
                let child_id = internal.child_at(0);
                {
                    let mut child_latch = PageLatch::write(&self.buffer_pool, child_id)?;
                    let mut child: BTreeNode<K> = child_latch.node()?;
                    child.set_parent_page_id(INVALID_PAGE_ID);
                    child_latch.write_node(&child)?;
                }
                self.set_root_page_id(child_id);
                self.update_root_record()?;

                let old_root = root_latch.page_id();
                drop(root_latch);
                if let Err(e) = self.buffer_pool.delete_page(old_root) {
                    warn!("{}: could not delete old root {}: {}", self.name, old_root, e);
                }
                debug!("{}: root collapsed into page {}", self.name, child_id);
                Ok(())
            }
        }
    }
}
