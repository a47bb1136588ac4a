//! Header page (page 0): a record table mapping index names to their root
//! page ids. Written through the buffer pool like any other page and marked
//! dirty whenever a root changes.

use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};
use crate::index::btree::error::BTreeError;

// Layout: record count u16, then per record:
// name length u16, name bytes, root page id u32.

/// Look up the root page id recorded for `name`
pub fn get_record(page: &Page, name: &str) -> Option<PageId> {
    decode_records(page)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, root)| root)
}

/// Insert a record for `name`. Fails if the name is already recorded or the
/// page is full.
pub fn insert_record(page: &mut Page, name: &str, root: PageId) -> Result<(), BTreeError> {
    let mut records = decode_records(page);
    if records.iter().any(|(n, _)| n == name) {
        return Err(BTreeError::Corrupted(format!(
            "index {} is already registered in the header page",
            name
        )));
    }
    records.push((name.to_string(), root));
    encode_records(page, &records)
}

/// Update the record for `name`. Fails if the name is not recorded.
pub fn update_record(page: &mut Page, name: &str, root: PageId) -> Result<(), BTreeError> {
    let mut records = decode_records(page);
    let record = records
        .iter_mut()
        .find(|(n, _)| n == name)
        .ok_or_else(|| {
            BTreeError::Corrupted(format!("index {} is missing from the header page", name))
        })?;
    record.1 = root;
    encode_records(page, &records)
}

/// Update `name`'s record, inserting it if absent
pub fn upsert_record(page: &mut Page, name: &str, root: PageId) -> Result<(), BTreeError> {
    if get_record(page, name).is_some() {
        update_record(page, name, root)
    } else {
        insert_record(page, name, root)
    }
}

fn decode_records(page: &Page) -> Vec<(String, PageId)> {
    let count = LittleEndian::read_u16(&page.data[0..2]) as usize;
    let mut records = Vec::with_capacity(count);
    let mut offset = 2;
    for _ in 0..count {
        let name_len = LittleEndian::read_u16(&page.data[offset..offset + 2]) as usize;
        offset += 2;
        let name = String::from_utf8_lossy(&page.data[offset..offset + name_len]).into_owned();
        offset += name_len;
        let root = LittleEndian::read_u32(&page.data[offset..offset + 4]);
        offset += 4;
        records.push((name, root));
    }
    records
}

fn encode_records(page: &mut Page, records: &[(String, PageId)]) -> Result<(), BTreeError> {
    let needed: usize = 2 + records.iter().map(|(n, _)| 2 + n.len() + 4).sum::<usize>();
    if needed > PAGE_SIZE {
        return Err(BTreeError::HeaderFull);
    }

    page.reset();
    LittleEndian::write_u16(&mut page.data[0..2], records.len() as u16);
    let mut offset = 2;
    for (name, root) in records {
        LittleEndian::write_u16(&mut page.data[offset..offset + 2], name.len() as u16);
        offset += 2;
        page.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        offset += name.len();
        LittleEndian::write_u32(&mut page.data[offset..offset + 4], *root);
        offset += 4;
    }
    Ok(())
}
