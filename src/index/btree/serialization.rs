use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::common::types::{Page, Rid, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, InternalNode, LeafNode};

// Header layout:
// - page type: u8 (1 = leaf, 2 = internal)
// - parent page id: u32
// - next leaf page id: u32 (INVALID_PAGE_ID for internal nodes)
// - max size: u16
// - key count: u16
// - values offset: u16
const PAGE_TYPE_LEAF: u8 = 1;
const PAGE_TYPE_INTERNAL: u8 = 2;
const HEADER_SIZE: usize = 15;

/// Serialize a B+tree node into a page
pub fn serialize_node<K>(node: &BTreeNode<K>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Serialize + Clone + Ord,
{
    page.reset();

    let (page_type, parent, next, max_size, keys) = match node {
        BTreeNode::Leaf(leaf) => (
            PAGE_TYPE_LEAF,
            leaf.parent_page_id,
            leaf.next_page_id,
            leaf.max_size,
            &leaf.keys,
        ),
        BTreeNode::Internal(internal) => (
            PAGE_TYPE_INTERNAL,
            internal.parent_page_id,
            crate::common::types::INVALID_PAGE_ID,
            internal.max_size,
            &internal.keys,
        ),
    };

    page.data[0] = page_type;
    LittleEndian::write_u32(&mut page.data[1..5], parent);
    LittleEndian::write_u32(&mut page.data[5..9], next);
    LittleEndian::write_u16(&mut page.data[9..11], max_size as u16);
    LittleEndian::write_u16(&mut page.data[11..13], keys.len() as u16);

    let mut offset = HEADER_SIZE;
    for key in keys {
        let key_bytes = bincode::serialize(key)
            .map_err(|e| BTreeError::Serialization(e.to_string()))?;
        if offset + 2 + key_bytes.len() > PAGE_SIZE {
            return Err(BTreeError::NodeTooLarge);
        }
        LittleEndian::write_u16(&mut page.data[offset..offset + 2], key_bytes.len() as u16);
        offset += 2;
        page.data[offset..offset + key_bytes.len()].copy_from_slice(&key_bytes);
        offset += key_bytes.len();
    }

    LittleEndian::write_u16(&mut page.data[13..15], offset as u16);

    match node {
        BTreeNode::Leaf(leaf) => {
            for value in &leaf.values {
                if offset + 8 > PAGE_SIZE {
                    return Err(BTreeError::NodeTooLarge);
                }
                LittleEndian::write_u32(&mut page.data[offset..offset + 4], value.page_id);
                LittleEndian::write_u32(&mut page.data[offset + 4..offset + 8], value.slot_num);
                offset += 8;
            }
        }
        BTreeNode::Internal(internal) => {
            for &child in &internal.children {
                if offset + 4 > PAGE_SIZE {
                    return Err(BTreeError::NodeTooLarge);
                }
                LittleEndian::write_u32(&mut page.data[offset..offset + 4], child);
                offset += 4;
            }
        }
    }

    Ok(())
}

/// Deserialize a B+tree node from a page
pub fn deserialize_node<K>(page: &Page) -> Result<BTreeNode<K>, BTreeError>
where
    K: for<'de> Deserialize<'de> + Clone + Ord,
{
    let page_type = page.data[0];
    let parent = LittleEndian::read_u32(&page.data[1..5]);
    let next = LittleEndian::read_u32(&page.data[5..9]);
    let max_size = LittleEndian::read_u16(&page.data[9..11]) as usize;
    let key_count = LittleEndian::read_u16(&page.data[11..13]) as usize;
    let values_offset = LittleEndian::read_u16(&page.data[13..15]) as usize;

    let mut offset = HEADER_SIZE;
    let mut keys = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        let key_len = LittleEndian::read_u16(&page.data[offset..offset + 2]) as usize;
        offset += 2;
        let key = bincode::deserialize(&page.data[offset..offset + key_len])
            .map_err(|e| BTreeError::Deserialization(e.to_string()))?;
        keys.push(key);
        offset += key_len;
    }

    let mut offset = values_offset;
    match page_type {
        PAGE_TYPE_LEAF => {
            let mut values = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                let page_id = LittleEndian::read_u32(&page.data[offset..offset + 4]);
                let slot_num = LittleEndian::read_u32(&page.data[offset + 4..offset + 8]);
                values.push(Rid::new(page_id, slot_num));
                offset += 8;
            }
            Ok(BTreeNode::Leaf(LeafNode {
                parent_page_id: parent,
                next_page_id: next,
                max_size,
                keys,
                values,
            }))
        }
        PAGE_TYPE_INTERNAL => {
            // internal nodes store one more child slot than keys
            let mut children = Vec::with_capacity(key_count + 1);
            for _ in 0..key_count + 1 {
                children.push(LittleEndian::read_u32(&page.data[offset..offset + 4]));
                offset += 4;
            }
            Ok(BTreeNode::Internal(InternalNode {
                parent_page_id: parent,
                max_size,
                keys,
                children,
            }))
        }
        other => Err(BTreeError::Deserialization(format!(
            "invalid page type byte {} in page {}",
            other, page.page_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    #[test]
    fn test_leaf_node_round_trip() {
        let mut leaf = LeafNode::new(16);
        leaf.parent_page_id = 3;
        leaf.next_page_id = 9;
        leaf.insert(5, Rid::new(1, 50));
        leaf.insert(10, Rid::new(1, 51));

        let mut page = Page::new(7);
        serialize_node(&BTreeNode::Leaf(leaf.clone()), &mut page).unwrap();
        let decoded = deserialize_node::<i64>(&page).unwrap();

        assert_eq!(decoded, BTreeNode::Leaf(leaf));
    }

    #[test]
    fn test_internal_node_round_trip() {
        let mut internal = InternalNode::new(16);
        internal.parent_page_id = INVALID_PAGE_ID;
        internal.keys = vec![10i64, 20, 30];
        internal.children = vec![100, 200, 300, 400];

        let mut page = Page::new(8);
        serialize_node(&BTreeNode::Internal(internal.clone()), &mut page).unwrap();
        let decoded = deserialize_node::<i64>(&page).unwrap();

        assert_eq!(decoded, BTreeNode::Internal(internal));
    }

    #[test]
    fn test_string_keys() {
        let mut leaf = LeafNode::new(16);
        leaf.insert("apple".to_string(), Rid::new(2, 1));
        leaf.insert("banana".to_string(), Rid::new(2, 2));

        let mut page = Page::new(9);
        serialize_node(&BTreeNode::Leaf(leaf.clone()), &mut page).unwrap();
        let decoded = deserialize_node::<String>(&page).unwrap();

        assert_eq!(decoded, BTreeNode::Leaf(leaf));
    }

    #[test]
    fn test_zeroed_page_is_rejected() {
        let page = Page::new(1);
        assert!(matches!(
            deserialize_node::<i64>(&page),
            Err(BTreeError::Deserialization(_))
        ));
    }
}
