//! Pointer map: per-page reverse-lookup table used exclusively by vacuum.
//!
//! Page 2 is the first pointer-map page; pointer-map pages recur every
//! `entries_per_page + 1` pages thereafter, each holding a packed array of
//! 5-byte `(type, back_ptr)` entries after an 8-byte reserved prefix.

use crate::error::{Error, Result};
use crate::page::{PageId, NULL_PAGE};

pub const FIRST_PTRMAP_PAGE: PageId = 2;
pub const ENTRY_SIZE: usize = 5;
pub const RESERVED_PREFIX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrMapType {
    TreeNode = 1,
    TreeRoot = 2,
    OverflowHead = 3,
    OverflowLink = 4,
    FreelistLink = 5,
}

impl PtrMapType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => PtrMapType::TreeNode,
            2 => PtrMapType::TreeRoot,
            3 => PtrMapType::OverflowHead,
            4 => PtrMapType::OverflowLink,
            5 => PtrMapType::FreelistLink,
            _ => return Err(Error::corruption("bad pointer-map entry type")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrMapEntry {
    pub entry_type: PtrMapType,
    pub back_ptr: PageId,
}

fn entries_per_page(page_size: usize) -> u32 {
    ((page_size - RESERVED_PREFIX) / ENTRY_SIZE) as u32
}

fn cycle_len(page_size: usize) -> u32 {
    entries_per_page(page_size) + 1
}

/// True if `id` is itself a pointer-map page.
pub fn is_pointer_map_page(id: PageId, page_size: usize) -> bool {
    if id < FIRST_PTRMAP_PAGE {
        return false;
    }
    (id - FIRST_PTRMAP_PAGE) % cycle_len(page_size) == 0
}

/// The pointer-map page that would hold `id`'s entry. `id` must not be the
/// root page (page 1 has no entry: it is the schema tree root, addressed
/// structurally, not via the pointer map) nor a pointer-map page itself.
pub fn page_for(id: PageId, page_size: usize) -> PageId {
    debug_assert!(id > 1);
    let c = cycle_len(page_size);
    let off = id - FIRST_PTRMAP_PAGE;
    let group = off / c;
    FIRST_PTRMAP_PAGE + group * c
}

/// Byte offset of `id`'s entry within its pointer-map page's content.
fn entry_offset(id: PageId, page_size: usize) -> usize {
    let c = cycle_len(page_size);
    let off = id - FIRST_PTRMAP_PAGE;
    let index = (off % c) - 1;
    RESERVED_PREFIX + index as usize * ENTRY_SIZE
}

/// Decode the entry for `id` out of its pointer-map page's raw bytes.
pub fn read_entry(ptrmap_page: &[u8], id: PageId, page_size: usize) -> Result<Option<PtrMapEntry>> {
    let off = entry_offset(id, page_size);
    let type_byte = ptrmap_page[off];
    if type_byte == 0 {
        return Ok(None);
    }
    let back_ptr = u32::from_le_bytes(ptrmap_page[off + 1..off + 5].try_into().unwrap());
    Ok(Some(PtrMapEntry {
        entry_type: PtrMapType::from_u8(type_byte)?,
        back_ptr,
    }))
}

/// Encode the entry for `id` into its pointer-map page's raw bytes.
pub fn write_entry(ptrmap_page: &mut [u8], id: PageId, entry: PtrMapEntry, page_size: usize) {
    let off = entry_offset(id, page_size);
    ptrmap_page[off] = entry.entry_type as u8;
    ptrmap_page[off + 1..off + 5].copy_from_slice(&entry.back_ptr.to_le_bytes());
}

pub fn clear_entry(ptrmap_page: &mut [u8], id: PageId, page_size: usize) {
    let off = entry_offset(id, page_size);
    ptrmap_page[off] = 0;
    ptrmap_page[off + 1..off + 5].copy_from_slice(&NULL_PAGE.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_2_is_first_pointer_map_page() {
        assert!(is_pointer_map_page(2, 512));
        assert!(!is_pointer_map_page(1, 512));
        assert!(!is_pointer_map_page(3, 512));
    }

    #[test]
    fn pointer_map_pages_recur_at_fixed_cycle() {
        let page_size = 512usize;
        let epp = entries_per_page(page_size);
        let next = FIRST_PTRMAP_PAGE + epp + 1;
        assert!(is_pointer_map_page(next, page_size));
        for id in (FIRST_PTRMAP_PAGE + 1)..next {
            assert!(!is_pointer_map_page(id, page_size));
            assert_eq!(page_for(id, page_size), FIRST_PTRMAP_PAGE);
        }
    }

    #[test]
    fn entry_round_trips() {
        let page_size = 512usize;
        let mut page = vec![0u8; page_size];
        let e = PtrMapEntry {
            entry_type: PtrMapType::OverflowLink,
            back_ptr: 42,
        };
        write_entry(&mut page, 5, e, page_size);
        let back = read_entry(&page, 5, page_size).unwrap().unwrap();
        assert_eq!(back, e);
    }
}
