//! B+-tree node layout: cells, node header, local/overflow split.
//!
//! A page is a header plus packed records (a slotted page). Rather than
//! maintaining an in-place cell-pointer freelist and fragment-byte count
//! for *incremental* edits, this implementation always fully repacks
//! ("defragments") a node's cells on every [`Node::serialize`] call —
//! every node mutation in `tree.rs` goes through parse -> mutate the owned
//! `Vec<Cell>` -> serialize, never an in-place byte patch. This keeps
//! `free_total`/`frag_count` always reporting the post-defragment truth
//! (frag_count is always 0) and trades a little copying for not having to
//! reimplement a slotted-page allocator's free-block list. Recorded as an
//! open-question resolution in DESIGN.md.

use crate::error::{Error, Result};
use crate::file_header::FILE_HEADER_SIZE;
use crate::page::{PageId, NULL_PAGE};

pub const NODE_HEADER_SIZE: usize = 18;
pub const CELL_PTR_SIZE: usize = 2;

/// Offset at which a node's own header begins within its page buffer: the
/// root page carries the file header first.
pub fn header_offset(page_id: PageId) -> usize {
    if page_id == crate::page::ROOT_PAGE {
        FILE_HEADER_SIZE
    } else {
        0
    }
}

fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn get_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut v: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        v |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((v, i + 1));
        }
    }
    Err(Error::corruption("varint truncated or too long"))
}

/// One B+-tree record, decoded with its *local* payload only: the full key
/// (and, for external cells, value) may continue into an overflow chain
/// reached through `overflow`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Left-child page id; `NULL_PAGE` for external (leaf) cells.
    pub left_child: PageId,
    pub key_size: usize,
    /// Logical value length; always 0 for internal cells.
    pub value_size: usize,
    /// First `local_size` bytes of `key` (internal cells) or `key ++ value`
    /// (external cells).
    pub local: Vec<u8>,
    pub overflow: PageId,
    /// Set on an external cell whose value is a nested bucket's root page
    /// id rather than an ordinary value. Always `false` for internal
    /// (separator) cells, which carry no value at all.
    pub is_bucket: bool,
}

impl Cell {
    pub fn is_external(&self) -> bool {
        self.left_child == NULL_PAGE
    }

    /// How many of `local`'s leading bytes belong to the key (the rest, for
    /// an external cell, is the start of the value).
    pub fn local_key_len(&self) -> usize {
        self.key_size.min(self.local.len())
    }

    pub fn local_key(&self) -> &[u8] {
        &self.local[..self.local_key_len()]
    }

    pub fn has_overflow(&self) -> bool {
        self.overflow != NULL_PAGE
    }

    /// Value-size varint as actually stored: the is-bucket flag rides in
    /// the low bit, the real length shifted up one,
    /// so a non-bucket cell's length still round-trips through an ordinary
    /// varint and only crosses a byte boundary one length value earlier.
    fn stored_value_size(&self) -> u64 {
        ((self.value_size as u64) << 1) | self.is_bucket as u64
    }

    pub(crate) fn encoded_len(&self) -> usize {
        let mut len = 0usize;
        if !self.is_external() {
            len += 4;
        } else {
            len += varint_len(self.stored_value_size());
        }
        len += varint_len(self.key_size as u64);
        len += self.local.len();
        if self.has_overflow() {
            len += 4;
        }
        len
    }

    fn encode(&self, out: &mut Vec<u8>) {
        if !self.is_external() {
            out.extend_from_slice(&self.left_child.to_le_bytes());
        } else {
            put_varint(out, self.stored_value_size());
        }
        put_varint(out, self.key_size as u64);
        out.extend_from_slice(&self.local);
        if self.has_overflow() {
            out.extend_from_slice(&self.overflow.to_le_bytes());
        }
    }

    /// Decode a cell starting at `buf[0..]`. `local_size` is not stored
    /// explicitly: it is recomputed from `key_size`/`value_size`/`page_size`
    /// via [`split_local`], the same deterministic function used to choose
    /// it when the cell was built, so encoder and decoder always agree.
    fn decode(buf: &[u8], is_external: bool, page_size: usize) -> Result<(Cell, usize)> {
        let mut off = 0usize;
        let left_child;
        let value_size;
        let is_bucket;
        if is_external {
            left_child = NULL_PAGE;
            let (v, n) = get_varint(&buf[off..])?;
            value_size = (v >> 1) as usize;
            is_bucket = v & 1 != 0;
            off += n;
        } else {
            if buf.len() < 4 {
                return Err(Error::corruption("cell truncated (left child)"));
            }
            left_child = u32::from_le_bytes(buf[0..4].try_into().unwrap());
            value_size = 0;
            is_bucket = false;
            off += 4;
        }
        let (k, n) = get_varint(&buf[off..])?;
        let key_size = k as usize;
        off += n;
        let local_size = split_local(key_size, value_size, page_size, is_external);
        if buf.len() < off + local_size {
            return Err(Error::corruption("cell truncated (local payload)"));
        }
        let local = buf[off..off + local_size].to_vec();
        off += local_size;
        let has_overflow = local_size < key_size + value_size;
        let overflow = if has_overflow {
            if buf.len() < off + 4 {
                return Err(Error::corruption("cell truncated (overflow id)"));
            }
            let id = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
            id
        } else {
            NULL_PAGE
        };
        Ok((
            Cell {
                left_child,
                key_size,
                value_size,
                local,
                overflow,
                is_bucket,
            },
            off,
        ))
    }
}

fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Usable content bytes available to cells on a node page (header + cell
/// pointers excluded), feeding the `min_local`/`max_local` formula.
fn usable_size(page_size: usize, page_id: PageId) -> usize {
    page_size - header_offset(page_id) - NODE_HEADER_SIZE
}

/// `min_local = (page_size-header)*32/256 - header_overhead`, `max_local =
/// ... *64/256 - header_overhead`. `header_overhead` accounts
/// for the worst-case fixed cell overhead (left-child/value-size varint,
/// key-size varint, overflow id) so a cell at either bound always leaves
/// room for a sibling's cell pointer.
const HEADER_OVERHEAD: usize = 23;

pub fn min_local(page_size: usize) -> usize {
    (page_size * 32 / 256).saturating_sub(HEADER_OVERHEAD)
}

pub fn max_local(page_size: usize) -> usize {
    (page_size * 64 / 256).saturating_sub(HEADER_OVERHEAD)
}

/// Compute the local/overflow split for a cell, given the page size the
/// node lives on. Used both to
/// size a new cell and, by [`Cell::decode`], to recover how many of an
/// existing cell's bytes are local — the two must agree, since the format
/// stores no explicit `local_size` field.
pub fn split_local(key_size: usize, value_size: usize, page_size: usize, is_external: bool) -> usize {
    let max_local = max_local(page_size);
    let min_local = min_local(page_size);
    let total = if is_external { key_size + value_size } else { key_size };
    if total <= max_local {
        return total;
    }
    if key_size >= max_local {
        // The key alone doesn't fit locally: local holds only key bytes, up
        // to max_local, the rest of the key and all of the value overflow.
        return max_local;
    }
    // Key fits; keep the whole key local and as much value as fits.
    (key_size + value_size).min(max_local).max(min_local.min(total))
}

#[derive(Debug, Clone)]
pub struct Node {
    pub page_id: PageId,
    pub is_external: bool,
    /// Leaf: right sibling. Internal: right-most child.
    pub next_id: PageId,
    /// Leaf: left sibling. Unused (0) on internal nodes.
    pub prev_id: PageId,
    pub cells: Vec<Cell>,
}

impl Node {
    pub fn new_leaf(page_id: PageId) -> Self {
        Node {
            page_id,
            is_external: true,
            next_id: NULL_PAGE,
            prev_id: NULL_PAGE,
            cells: Vec::new(),
        }
    }

    pub fn new_internal(page_id: PageId) -> Self {
        Node {
            page_id,
            is_external: false,
            next_id: NULL_PAGE,
            prev_id: NULL_PAGE,
            cells: Vec::new(),
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn content_capacity(&self, page_size: usize) -> usize {
        usable_size(page_size, self.page_id)
    }

    /// Bytes the current cell set would occupy (pointer array + cell
    /// bodies), used by `tree.rs` to decide whether an insert overflows the
    /// page.
    pub fn used_bytes(&self) -> usize {
        self.cells.len() * CELL_PTR_SIZE + self.cells.iter().map(Cell::encoded_len).sum::<usize>()
    }

    pub fn free_bytes(&self, page_size: usize) -> usize {
        self.content_capacity(page_size).saturating_sub(self.used_bytes())
    }

    pub fn parse(page_id: PageId, data: &[u8], page_size: usize) -> Result<Node> {
        let base = header_offset(page_id);
        if data.len() < base + NODE_HEADER_SIZE {
            return Err(Error::corruption("node header truncated"));
        }
        let h = &data[base..];
        let is_external = h[0] != 0;
        let next_id = u32::from_le_bytes(h[1..5].try_into().unwrap());
        let prev_id = u32::from_le_bytes(h[5..9].try_into().unwrap());
        let cell_count = u16::from_le_bytes(h[9..11].try_into().unwrap()) as usize;
        // h[11..13] cell_start, h[13..15] free_start, h[15..17] free_total,
        // h[17] frag_count are derived on serialize; not needed to decode.
        let ptr_base = base + NODE_HEADER_SIZE;
        let mut cells = Vec::with_capacity(cell_count);
        for i in 0..cell_count {
            let p = ptr_base + i * CELL_PTR_SIZE;
            if data.len() < p + CELL_PTR_SIZE {
                return Err(Error::corruption("cell pointer truncated"));
            }
            let offset = u16::from_le_bytes(data[p..p + CELL_PTR_SIZE].try_into().unwrap()) as usize;
            if offset >= data.len() {
                return Err(Error::corruption("cell pointer out of range"));
            }
            let (cell, _) = Cell::decode(&data[offset..], is_external, page_size)?;
            cells.push(cell);
        }
        debug_assert!(page_size >= base + NODE_HEADER_SIZE);
        Ok(Node {
            page_id,
            is_external,
            next_id,
            prev_id,
            cells,
        })
    }

    /// Pack header + cell-pointer array + defragmented cell bodies into a
    /// fresh `page_size`-byte buffer.
    pub fn serialize(&self, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        let base = header_offset(self.page_id);
        let ptr_base = base + NODE_HEADER_SIZE;
        let mut bodies: Vec<Vec<u8>> = Vec::with_capacity(self.cells.len());
        for cell in &self.cells {
            let mut b = Vec::with_capacity(cell.encoded_len());
            cell.encode(&mut b);
            bodies.push(b);
        }
        let total_body: usize = bodies.iter().map(Vec::len).sum();
        let mut cursor = page_size - total_body;
        let mut offsets = Vec::with_capacity(bodies.len());
        for body in &bodies {
            buf[cursor..cursor + body.len()].copy_from_slice(body);
            offsets.push(cursor as u16);
            cursor += body.len();
        }
        let cell_start = page_size - total_body;
        let free_start = ptr_base + self.cells.len() * CELL_PTR_SIZE;
        let free_total = cell_start.saturating_sub(free_start);

        let h = &mut buf[base..];
        h[0] = self.is_external as u8;
        h[1..5].copy_from_slice(&self.next_id.to_le_bytes());
        h[5..9].copy_from_slice(&self.prev_id.to_le_bytes());
        h[9..11].copy_from_slice(&(self.cells.len() as u16).to_le_bytes());
        h[11..13].copy_from_slice(&(cell_start as u16).to_le_bytes());
        h[13..15].copy_from_slice(&(free_start as u16).to_le_bytes());
        h[15..17].copy_from_slice(&(free_total as u16).to_le_bytes());
        h[17] = 0; // frag_count: always 0, every serialize defragments.

        for (i, off) in offsets.into_iter().enumerate() {
            let p = ptr_base + i * CELL_PTR_SIZE;
            buf[p..p + CELL_PTR_SIZE].copy_from_slice(&off.to_le_bytes());
        }
        buf
    }

    /// Binary search by key-prefix comparison: exact
    /// matches and insertion points are both reported; `Ordering::Equal`
    /// from a truncated (overflowing) key is only a *candidate* match —
    /// `tree.rs` resolves ties definitively by reading the overflow chain.
    pub fn search_prefix(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.cells.binary_search_by(|cell| {
            let local = cell.local_key();
            let n = local.len().min(key.len());
            local[..n].cmp(&key[..n]).then(local.len().cmp(&key.len()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(key: &[u8], value: &[u8]) -> Cell {
        Cell {
            left_child: NULL_PAGE,
            key_size: key.len(),
            value_size: value.len(),
            local: [key, value].concat(),
            overflow: NULL_PAGE,
            is_bucket: false,
        }
    }

    #[test]
    fn leaf_round_trips_through_bytes() {
        let mut n = Node::new_leaf(5);
        n.cells.push(cell(b"a", b"1"));
        n.cells.push(cell(b"b", b"22"));
        n.cells.push(cell(b"c", b"333"));
        let buf = n.serialize(512);
        let back = Node::parse(5, &buf, 512).unwrap();
        assert_eq!(back.cells.len(), 3);
        assert_eq!(back.cells[1].local, cell(b"b", b"22").local);
    }

    #[test]
    fn root_page_node_header_follows_file_header() {
        let mut n = Node::new_leaf(crate::page::ROOT_PAGE);
        n.cells.push(cell(b"k", b"v"));
        let buf = n.serialize(512);
        let back = Node::parse(crate::page::ROOT_PAGE, &buf, 512).unwrap();
        assert_eq!(back.cells.len(), 1);
    }

    #[test]
    fn search_prefix_finds_exact_and_insertion_point() {
        let mut n = Node::new_leaf(9);
        for k in [b"b", b"d", b"f"] {
            n.cells.push(cell(k, b"x"));
        }
        assert_eq!(n.search_prefix(b"d"), Ok(1));
        assert_eq!(n.search_prefix(b"c"), Err(1));
        assert_eq!(n.search_prefix(b"z"), Err(3));
    }

    #[test]
    fn split_local_keeps_whole_key_when_it_fits() {
        let page_size = 512;
        let local = split_local(10, 5, page_size, true);
        assert_eq!(local, 15);
    }

    #[test]
    fn is_bucket_flag_round_trips_without_disturbing_value_size() {
        let mut bucket_cell = cell(b"sub", &42u32.to_le_bytes());
        bucket_cell.is_bucket = true;
        let mut n = Node::new_leaf(5);
        n.cells.push(cell(b"plain", b"value"));
        n.cells.push(bucket_cell);
        let buf = n.serialize(512);
        let back = Node::parse(5, &buf, 512).unwrap();
        assert!(!back.cells[0].is_bucket);
        assert_eq!(back.cells[0].value_size, 5);
        assert!(back.cells[1].is_bucket);
        assert_eq!(back.cells[1].value_size, 4);
    }

    #[test]
    fn split_local_truncates_huge_value() {
        let page_size = 512;
        let local = split_local(10, 10_000, page_size, true);
        assert!(local < 10 + 10_000);
        assert!(local >= 10);
    }
}
