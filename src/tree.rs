//! B+-tree operations: search, insert, delete, overflow chains, and the
//! vacuum relocation step.
//!
//! Descend, mutate, then bubble a split/merge back up. Every mutation here
//! goes parse -> edit the owned `Vec<Cell>` ->
//! [`crate::pager::Pager::write_node`], never an in-place byte patch, so a
//! node is never held mutably borrowed from the pager while a sibling or
//! parent page is also being touched.
//!
//! A node's key may continue into an overflow chain; [`Node::search_prefix`]
//! only compares the local prefix, so every place that needs a *definitive*
//! answer (an exact-match hit, or the key to promote into a parent
//! separator) calls [`full_key_bytes`] to read the rest from overflow
//! before trusting it.

use crate::error::{Error, Result};
use crate::node::{split_local, Cell, Node, CELL_PTR_SIZE};
use crate::pager::Pager;
use crate::page::{PageId, NULL_PAGE};
use crate::pointer_map::{PtrMapEntry, PtrMapType};

/// A B+-tree rooted at `root`, addressing pages through a borrowed
/// [`Pager`]. One `Tree` exists per bucket (plus one for the schema tree,
/// rooted at page 1) for the lifetime of a single `get`/`put`/`erase` call;
/// nothing here is held across calls, so cursors built on top of `Tree`
/// re-search by key every time rather than caching a path.
pub struct Tree<'p> {
    pager: &'p mut Pager,
    pub root: PageId,
}

impl<'p> Tree<'p> {
    pub fn new(pager: &'p mut Pager, root: PageId) -> Self {
        Tree { pager, root }
    }

    // ---- Point lookups ----

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.get_with_flag(key)?.and_then(|(v, is_bucket)| if is_bucket { None } else { Some(v) }))
    }

    /// Look up `key` along with whether its cell is flagged as a nested
    /// bucket root rather than an ordinary value.
    pub fn get_with_flag(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, bool)>> {
        if key.is_empty() {
            return Err(Error::invalid_argument("empty key"));
        }
        let mut id = self.root;
        loop {
            let (slot, node) = self.pager.read_node(id)?;
            if node.is_external {
                self.pager.release(slot);
                return match tree_search(self.pager, &node, key)? {
                    Ok(i) => {
                        let cell = &node.cells[i];
                        let is_bucket = cell.is_bucket;
                        Ok(Some((full_value_bytes(self.pager, cell)?, is_bucket)))
                    }
                    Err(_) => Ok(None),
                };
            }
            let next = child_at(&node, child_index_for(&node, key));
            self.pager.release(slot);
            id = next;
        }
    }

    /// Whether `key` names a nested bucket, `None` if it doesn't exist at
    /// all.
    pub fn is_bucket_key(&mut self, key: &[u8]) -> Result<Option<bool>> {
        Ok(self.get_with_flag(key)?.map(|(_, f)| f))
    }

    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    // ---- Cursor-facing traversal (always a fresh descent) ----

    pub fn seek_first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut id = self.root;
        loop {
            let (slot, node) = self.pager.read_node(id)?;
            if node.is_external {
                self.pager.release(slot);
                return match node.cells.first() {
                    Some(c) => Ok(Some((full_key_bytes(self.pager, c)?, full_value_bytes(self.pager, c)?))),
                    None => Ok(None),
                };
            }
            let next = child_at(&node, 0);
            self.pager.release(slot);
            id = next;
        }
    }

    pub fn seek_last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut id = self.root;
        loop {
            let (slot, node) = self.pager.read_node(id)?;
            if node.is_external {
                self.pager.release(slot);
                return match node.cells.last() {
                    Some(c) => Ok(Some((full_key_bytes(self.pager, c)?, full_value_bytes(self.pager, c)?))),
                    None => Ok(None),
                };
            }
            let next = child_at(&node, node.cells.len());
            self.pager.release(slot);
            id = next;
        }
    }

    /// Smallest stored key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let leaf_id = *self.descend_path(key)?.last().unwrap();
        let (slot, node) = self.pager.read_node(leaf_id)?;
        self.pager.release(slot);
        let idx = tree_search(self.pager, &node, key)?.unwrap_or_else(|e| e);
        if idx < node.cells.len() {
            let c = &node.cells[idx];
            return Ok(Some((full_key_bytes(self.pager, c)?, full_value_bytes(self.pager, c)?)));
        }
        self.first_cell_from_leaf(node.next_id)
    }

    /// Smallest stored key strictly `> key`.
    pub fn next_after(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let leaf_id = *self.descend_path(key)?.last().unwrap();
        let (slot, node) = self.pager.read_node(leaf_id)?;
        self.pager.release(slot);
        let idx = match tree_search(self.pager, &node, key)? {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        if idx < node.cells.len() {
            let c = &node.cells[idx];
            return Ok(Some((full_key_bytes(self.pager, c)?, full_value_bytes(self.pager, c)?)));
        }
        self.first_cell_from_leaf(node.next_id)
    }

    /// Largest stored key strictly `< key`.
    pub fn prev_before(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let leaf_id = *self.descend_path(key)?.last().unwrap();
        let (slot, node) = self.pager.read_node(leaf_id)?;
        self.pager.release(slot);
        let idx = tree_search(self.pager, &node, key)?.unwrap_or_else(|e| e);
        if idx > 0 {
            let c = &node.cells[idx - 1];
            return Ok(Some((full_key_bytes(self.pager, c)?, full_value_bytes(self.pager, c)?)));
        }
        self.last_cell_from_leaf(node.prev_id)
    }

    fn first_cell_from_leaf(&mut self, mut id: PageId) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        while id != NULL_PAGE {
            let (slot, node) = self.pager.read_node(id)?;
            self.pager.release(slot);
            if let Some(c) = node.cells.first() {
                return Ok(Some((full_key_bytes(self.pager, c)?, full_value_bytes(self.pager, c)?)));
            }
            id = node.next_id;
        }
        Ok(None)
    }

    fn last_cell_from_leaf(&mut self, mut id: PageId) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        while id != NULL_PAGE {
            let (slot, node) = self.pager.read_node(id)?;
            self.pager.release(slot);
            if let Some(c) = node.cells.last() {
                return Ok(Some((full_key_bytes(self.pager, c)?, full_value_bytes(self.pager, c)?)));
            }
            id = node.prev_id;
        }
        Ok(None)
    }

    // ---- Mutation ----

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_inner(key, value, false)
    }

    /// Insert or overwrite `key` with `root` as a nested bucket's root page
    /// id, flagging the cell so a later lookup can tell a bucket apart from
    /// an ordinary value.
    pub fn put_bucket(&mut self, key: &[u8], root: PageId) -> Result<()> {
        self.put_inner(key, &root.to_le_bytes(), true)
    }

    fn put_inner(&mut self, key: &[u8], value: &[u8], is_bucket: bool) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid_argument("empty key"));
        }
        let path = self.descend_path(key)?;
        let leaf_id = *path.last().unwrap();
        let (slot, mut leaf) = self.pager.read_node(leaf_id)?;
        self.pager.release(slot);
        let overwrite = match tree_search(self.pager, &leaf, key)? {
            Ok(i) => {
                if leaf.cells[i].has_overflow() {
                    destroy_overflow_chain(self.pager, leaf.cells[i].overflow)?;
                }
                leaf.cells.remove(i);
                true
            }
            Err(_) => false,
        };
        let cell = make_cell(self.pager, NULL_PAGE, key, value, true, is_bucket)?;
        let idx = leaf.search_prefix(key).unwrap_or_else(|e| e);
        leaf.cells.insert(idx, cell);
        self.write_and_resolve_overflow(path, leaf)?;
        if !overwrite {
            self.pager.bump_record_count(1);
        }
        Ok(())
    }

    pub fn erase(&mut self, key: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::invalid_argument("empty key"));
        }
        let path = self.descend_path(key)?;
        let leaf_id = *path.last().unwrap();
        let (slot, mut leaf) = self.pager.read_node(leaf_id)?;
        self.pager.release(slot);
        let idx = match tree_search(self.pager, &leaf, key)? {
            Ok(i) => i,
            Err(_) => return Ok(false),
        };
        let removed = leaf.cells.remove(idx);
        if removed.has_overflow() {
            destroy_overflow_chain(self.pager, removed.overflow)?;
        }
        self.write_and_resolve_underflow(path, leaf)?;
        self.pager.bump_record_count(-1);
        Ok(true)
    }

    // ---- Descent ----

    /// Root-to-leaf path of page ids for `key`.
    fn descend_path(&mut self, key: &[u8]) -> Result<Vec<PageId>> {
        let mut path = vec![self.root];
        let mut id = self.root;
        loop {
            let (slot, node) = self.pager.read_node(id)?;
            if node.is_external {
                self.pager.release(slot);
                return Ok(path);
            }
            let next = child_at(&node, child_index_for(&node, key));
            self.pager.release(slot);
            path.push(next);
            id = next;
        }
    }

    fn persist_node(&mut self, node: &Node) -> Result<()> {
        let slot = self.pager.acquire(node.page_id)?;
        self.pager.write_node(slot, node)?;
        self.pager.release(slot);
        Ok(())
    }

    fn mark_ptrmap_node(&mut self, id: PageId, parent: PageId) -> Result<()> {
        let entry = if parent == NULL_PAGE {
            PtrMapEntry {
                entry_type: PtrMapType::TreeRoot,
                back_ptr: NULL_PAGE,
            }
        } else {
            PtrMapEntry {
                entry_type: PtrMapType::TreeNode,
                back_ptr: parent,
            }
        };
        self.pager.ptrmap_put(id, entry)
    }

    /// Write `node` back, splitting it (and cascading up `path`) as many
    /// times as needed until every page on the path fits. `path` is root-to-`node` inclusive.
    fn write_and_resolve_overflow(&mut self, mut path: Vec<PageId>, mut node: Node) -> Result<()> {
        let page_size = self.pager.page_size() as usize;
        let mut new_root: Option<Node> = None;
        loop {
            if node.used_bytes() <= node.content_capacity(page_size) {
                self.persist_node(&node)?;
                let parent = if path.len() >= 2 { path[path.len() - 2] } else { NULL_PAGE };
                self.mark_ptrmap_node(node.page_id, parent)?;
                if let Some(root) = new_root.take() {
                    self.persist_node(&root)?;
                    self.mark_ptrmap_node(root.page_id, NULL_PAGE)?;
                }
                return Ok(());
            }

            if path.len() == 1 {
                // Splitting the root: relocate its entire (still overflowing)
                // content to a fresh child page, leave the root empty and
                // internal, then loop so the ordinary non-root split below
                // handles the real split.
                let new_child_id = self.pager.allocate_page()?;
                let mut child = node.clone();
                child.page_id = new_child_id;
                if !child.is_external {
                    retarget_children(self.pager, &child, new_child_id)?;
                }
                let mut root = Node::new_internal(node.page_id);
                root.next_id = new_child_id;
                new_root = Some(root);
                path = vec![node.page_id, new_child_id];
                node = child;
                continue;
            }

            let parent_id = path[path.len() - 2];
            let (right, sep) = self.split_node(&mut node)?;
            self.persist_node(&node)?;
            self.persist_node(&right)?;
            self.mark_ptrmap_node(node.page_id, parent_id)?;
            self.mark_ptrmap_node(right.page_id, parent_id)?;
            if !right.is_external {
                retarget_children(self.pager, &right, right.page_id)?;
            }

            let mut parent = if path.len() == 2 && new_root.is_some() {
                new_root.take().unwrap()
            } else {
                self.pager.read_node(parent_id)?.1
            };
            let idx = find_child_slot_by_id(&parent, node.page_id);
            let mut sep = sep;
            sep.left_child = node.page_id;
            if idx < parent.cells.len() {
                parent.cells[idx].left_child = right.page_id;
            } else {
                parent.next_id = right.page_id;
            }
            parent.cells.insert(idx, sep);

            path.pop();
            node = parent;
        }
    }

    /// Write `node` back, merging an emptied leaf into its parent (and
    /// cascading a root collapse) as needed. This
    /// only ever merges a leaf that became completely empty, never rotates
    /// or rebalances a merely-underfull node; see DESIGN.md.
    fn write_and_resolve_underflow(&mut self, mut path: Vec<PageId>, mut node: Node) -> Result<()> {
        loop {
            if path.len() == 1 {
                if !node.is_external && node.cells.is_empty() && node.next_id != NULL_PAGE {
                    let only_child = node.next_id;
                    let (_, mut promoted) = self.pager.read_node(only_child)?;
                    promoted.page_id = node.page_id;
                    self.pager.free_page(only_child)?;
                    self.pager.ptrmap_clear(only_child)?;
                    if !promoted.is_external {
                        retarget_children(self.pager, &promoted, promoted.page_id)?;
                    }
                    node = promoted;
                    continue;
                }
                self.persist_node(&node)?;
                self.mark_ptrmap_node(node.page_id, NULL_PAGE)?;
                return Ok(());
            }

            if node.is_external && node.cells.is_empty() {
                let (prev_id, next_id) = (node.prev_id, node.next_id);
                if prev_id != NULL_PAGE {
                    let (slot, mut p) = self.pager.read_node(prev_id)?;
                    p.next_id = next_id;
                    self.pager.write_node(slot, &p)?;
                    self.pager.release(slot);
                }
                if next_id != NULL_PAGE {
                    let (slot, mut n) = self.pager.read_node(next_id)?;
                    n.prev_id = prev_id;
                    self.pager.write_node(slot, &n)?;
                    self.pager.release(slot);
                }
                let empty_id = node.page_id;
                self.pager.free_page(empty_id)?;
                self.pager.ptrmap_clear(empty_id)?;

                let parent_id = path[path.len() - 2];
                let (_, mut parent) = self.pager.read_node(parent_id)?;
                let idx = find_child_slot_by_id(&parent, empty_id);
                if idx < parent.cells.len() {
                    parent.cells.remove(idx);
                } else if let Some(last) = parent.cells.pop() {
                    parent.next_id = last.left_child;
                } else {
                    parent.next_id = NULL_PAGE;
                }
                path.pop();
                node = parent;
                continue;
            }

            self.persist_node(&node)?;
            let parent_id = path[path.len() - 2];
            self.mark_ptrmap_node(node.page_id, parent_id)?;
            return Ok(());
        }
    }

    fn split_node(&mut self, node: &mut Node) -> Result<(Node, Cell)> {
        if node.is_external {
            self.split_leaf(node)
        } else {
            self.split_internal(node)
        }
    }

    /// Split an overflowing leaf. Fast-splits: when
    /// the overflow was caused by the cell at the right edge, the new right
    /// sibling holds only that one cell instead of rebalancing by count.
    fn split_leaf(&mut self, node: &mut Node) -> Result<(Node, Cell)> {
        if node.cells.len() < 2 {
            return Err(Error::corruption("leaf overflowed with fewer than 2 cells"));
        }
        let page_size = self.pager.page_size() as usize;
        let cap = node.content_capacity(page_size);
        let new_id = self.pager.allocate_page()?;
        let last_cost = node.cells.last().unwrap().encoded_len() + CELL_PTR_SIZE;
        let without_last = node.used_bytes().saturating_sub(last_cost);
        let right_cells = if without_last <= cap {
            vec![node.cells.pop().unwrap()]
        } else {
            let mid = node.cells.len() / 2;
            node.cells.split_off(mid)
        };
        let mut right = Node::new_leaf(new_id);
        right.next_id = node.next_id;
        right.prev_id = node.page_id;
        node.next_id = new_id;
        if right.next_id != NULL_PAGE {
            let (slot, mut further) = self.pager.read_node(right.next_id)?;
            further.prev_id = new_id;
            self.pager.write_node(slot, &further)?;
            self.pager.release(slot);
        }
        right.cells = right_cells;
        let sep_key = full_key_bytes(self.pager, &right.cells[0])?;
        let sep = make_cell(self.pager, NULL_PAGE, &sep_key, &[], false, false)?;
        Ok((right, sep))
    }

    /// Split an overflowing internal node: the middle cell is promoted into
    /// the parent and removed from both halves.
    fn split_internal(&mut self, node: &mut Node) -> Result<(Node, Cell)> {
        if node.cells.len() < 2 {
            return Err(Error::corruption("internal node overflowed with fewer than 2 cells"));
        }
        let new_id = self.pager.allocate_page()?;
        let mid = node.cells.len() / 2;
        let mut right_cells = node.cells.split_off(mid);
        let promoted = right_cells.remove(0);
        let mut right = Node::new_internal(new_id);
        right.next_id = node.next_id;
        node.next_id = promoted.left_child;
        right.cells = right_cells;
        let sep_key = full_key_bytes(self.pager, &promoted)?;
        let sep = make_cell(self.pager, NULL_PAGE, &sep_key, &[], false, false)?;
        if promoted.has_overflow() {
            destroy_overflow_chain(self.pager, promoted.overflow)?;
        }
        Ok((right, sep))
    }
}

// ---- Free helpers (no `&mut self`, so they can be shared by split/merge
// without fighting the borrow checker over `self.pager`) ----

fn child_at(node: &Node, idx: usize) -> PageId {
    if idx < node.cells.len() {
        node.cells[idx].left_child
    } else {
        node.next_id
    }
}

fn child_index_for(node: &Node, key: &[u8]) -> usize {
    match node.search_prefix(key) {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}

fn find_child_slot_by_id(node: &Node, child_id: PageId) -> usize {
    for (i, c) in node.cells.iter().enumerate() {
        if c.left_child == child_id {
            return i;
        }
    }
    node.cells.len()
}

/// Search `node` for `key`, resolving a same-prefix-length tie definitively
/// by reading the rest of an overflowing candidate's key.
fn tree_search(pager: &mut Pager, node: &Node, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
    match node.search_prefix(key) {
        Ok(i) => {
            let cell = &node.cells[i];
            if cell.key_size > cell.local_key_len() {
                let full = full_key_bytes(pager, cell)?;
                if full != key {
                    return Ok(Err(i));
                }
            }
            Ok(Ok(i))
        }
        Err(i) => Ok(Err(i)),
    }
}

/// Reconstruct a cell's full logical key, following overflow if the local
/// portion doesn't hold all of it.
fn full_key_bytes(pager: &mut Pager, cell: &Cell) -> Result<Vec<u8>> {
    let local_key_len = cell.local_key_len();
    if cell.key_size <= local_key_len {
        return Ok(cell.local[..local_key_len].to_vec());
    }
    let total_logical = cell.key_size + cell.value_size;
    let remaining = total_logical - cell.local.len();
    let overflow_bytes = read_overflow_chain(pager, cell.overflow, remaining)?;
    let need_from_overflow = cell.key_size - local_key_len;
    let mut out = Vec::with_capacity(cell.key_size);
    out.extend_from_slice(&cell.local[..local_key_len]);
    out.extend_from_slice(&overflow_bytes[..need_from_overflow]);
    Ok(out)
}

/// Reconstruct an external cell's full logical value, skipping over any
/// key bytes that share the same overflow chain.
fn full_value_bytes(pager: &mut Pager, cell: &Cell) -> Result<Vec<u8>> {
    debug_assert!(cell.is_external());
    let local_key_len = cell.local_key_len();
    let local_value_len = cell.local.len() - local_key_len;
    if cell.value_size <= local_value_len {
        return Ok(cell.local[local_key_len..local_key_len + cell.value_size].to_vec());
    }
    let total_logical = cell.key_size + cell.value_size;
    let remaining = total_logical - cell.local.len();
    let overflow_bytes = read_overflow_chain(pager, cell.overflow, remaining)?;
    let key_overflow_len = cell.key_size.saturating_sub(local_key_len);
    let mut out = Vec::with_capacity(cell.value_size);
    out.extend_from_slice(&cell.local[local_key_len..]);
    out.extend_from_slice(&overflow_bytes[key_overflow_len..]);
    Ok(out)
}

/// Build a cell for `key`/`value` (value empty for internal separators),
/// writing an overflow chain for whatever doesn't fit locally. `owner_page` is the page the cell will live in, used
/// only to tag a fresh overflow head's pointer-map back-reference; `left_child`
/// is the caller's concern entirely (it may patch it after the call, since
/// `is_external` — not `left_child` — decides the wire format).
fn make_cell(
    pager: &mut Pager,
    left_child: PageId,
    key: &[u8],
    value: &[u8],
    is_external: bool,
    is_bucket: bool,
) -> Result<Cell> {
    let page_size = pager.page_size() as usize;
    let local_size = split_local(key.len(), value.len(), page_size, is_external);
    let total: Vec<u8> = if is_external {
        let mut t = Vec::with_capacity(key.len() + value.len());
        t.extend_from_slice(key);
        t.extend_from_slice(value);
        t
    } else {
        key.to_vec()
    };
    let local = total[..local_size].to_vec();
    let overflow = if local_size < total.len() {
        write_overflow_chain(pager, &total[local_size..])?
    } else {
        NULL_PAGE
    };
    Ok(Cell {
        left_child,
        key_size: key.len(),
        value_size: if is_external { value.len() } else { 0 },
        local,
        overflow,
        is_bucket: is_external && is_bucket,
    })
}

/// Allocate and fill an overflow chain for `bytes`, newest page first.
fn write_overflow_chain(pager: &mut Pager, bytes: &[u8]) -> Result<PageId> {
    if bytes.is_empty() {
        return Ok(NULL_PAGE);
    }
    let page_size = pager.page_size() as usize;
    let payload_cap = page_size - 4;
    let pages_needed = (bytes.len() + payload_cap - 1) / payload_cap;
    let mut ids = Vec::with_capacity(pages_needed);
    for _ in 0..pages_needed {
        ids.push(pager.allocate_page()?);
    }
    let mut next = NULL_PAGE;
    for i in (0..pages_needed).rev() {
        let id = ids[i];
        let start = i * payload_cap;
        let end = (start + payload_cap).min(bytes.len());
        let chunk = &bytes[start..end];
        let slot = pager.acquire(id)?;
        {
            let data = pager.page_data_mut(slot)?;
            data[0..4].copy_from_slice(&next.to_le_bytes());
            data[4..4 + chunk.len()].copy_from_slice(chunk);
            for b in data[4 + chunk.len()..].iter_mut() {
                *b = 0;
            }
        }
        pager.release(slot);
        let (entry_type, back_ptr) = if i == 0 {
            (PtrMapType::OverflowHead, NULL_PAGE)
        } else {
            (PtrMapType::OverflowLink, ids[i - 1])
        };
        pager.ptrmap_put(id, PtrMapEntry { entry_type, back_ptr })?;
        next = id;
    }
    Ok(ids[0])
}

fn read_overflow_chain(pager: &mut Pager, mut page_id: PageId, mut remaining: usize) -> Result<Vec<u8>> {
    let page_size = pager.page_size() as usize;
    let payload_cap = page_size - 4;
    let mut out = Vec::with_capacity(remaining);
    while page_id != NULL_PAGE && remaining > 0 {
        let slot = pager.acquire(page_id)?;
        let data = pager.page_data(slot);
        let next = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let take = remaining.min(payload_cap);
        out.extend_from_slice(&data[4..4 + take]);
        pager.release(slot);
        remaining -= take;
        page_id = next;
    }
    if remaining > 0 {
        return Err(Error::corruption("overflow chain ended early"));
    }
    Ok(out)
}

/// Free every page in an overflow chain. Exposed for callers outside
/// `Tree` that delete a whole subtree's cells directly.
pub fn free_overflow_chain(pager: &mut Pager, page_id: PageId) -> Result<()> {
    destroy_overflow_chain(pager, page_id)
}

/// Free every page reachable from `root`, recursing into any nested
/// bucket found along the way. Shared
/// by `Schema::drop_bucket` (top-level buckets) and `Bucket::drop_bucket`
/// (buckets nested inside another bucket's tree).
pub fn free_bucket_subtree(pager: &mut Pager, root: PageId) -> Result<()> {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let (slot, node) = pager.read_node(id)?;
        pager.release(slot);
        if !node.is_external {
            for c in &node.cells {
                stack.push(c.left_child);
            }
            stack.push(node.next_id);
        }
        for c in &node.cells {
            if c.is_bucket {
                let value = full_value_bytes(pager, c)?;
                if value.len() != 4 {
                    return Err(Error::corruption("malformed nested bucket root"));
                }
                stack.push(u32::from_le_bytes(value.try_into().unwrap()));
            }
            if c.has_overflow() {
                destroy_overflow_chain(pager, c.overflow)?;
            }
        }
        pager.ptrmap_clear(id)?;
        pager.free_page(id)?;
    }
    Ok(())
}

fn destroy_overflow_chain(pager: &mut Pager, mut page_id: PageId) -> Result<()> {
    while page_id != NULL_PAGE {
        let slot = pager.acquire(page_id)?;
        let next = u32::from_le_bytes(pager.page_data(slot)[0..4].try_into().unwrap());
        pager.release(slot);
        pager.free_page(page_id)?;
        page_id = next;
    }
    Ok(())
}

/// Repoint every child of `node` (an internal node that just moved to
/// `new_parent`) so their pointer-map back-reference follows them.
fn retarget_children(pager: &mut Pager, node: &Node, new_parent: PageId) -> Result<()> {
    for c in &node.cells {
        pager.ptrmap_put(
            c.left_child,
            PtrMapEntry {
                entry_type: PtrMapType::TreeNode,
                back_ptr: new_parent,
            },
        )?;
    }
    pager.ptrmap_put(
        node.next_id,
        PtrMapEntry {
            entry_type: PtrMapType::TreeNode,
            back_ptr: new_parent,
        },
    )?;
    Ok(())
}

/// A page moved during [`vacuum_one`]'s single relocation step. `Root`
/// means the moved page was some bucket's root: the caller (`Tx`, via the
/// schema tree) must rewrite that bucket's stored root id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocatedPage {
    Root { old_id: PageId, new_id: PageId },
}

fn is_on_freelist(pager: &mut Pager, id: PageId) -> Result<bool> {
    Ok(matches!(
        pager.ptrmap_get(id)?,
        Some(PtrMapEntry {
            entry_type: PtrMapType::FreelistLink,
            ..
        })
    ))
}

fn unlink_freelist_entry(pager: &mut Pager, id: PageId) -> Result<()> {
    let entry = pager.ptrmap_get(id)?.expect("caller checked is_on_freelist");
    let slot = pager.acquire(id)?;
    let next = u32::from_le_bytes(pager.page_data(slot)[0..4].try_into().unwrap());
    pager.release(slot);
    if entry.back_ptr == NULL_PAGE {
        pager.set_freelist_head(next);
    } else {
        let pred_slot = pager.acquire(entry.back_ptr)?;
        let data = pager.page_data_mut(pred_slot)?;
        data[0..4].copy_from_slice(&next.to_le_bytes());
        pager.release(pred_slot);
    }
    if next != NULL_PAGE {
        pager.ptrmap_put(
            next,
            PtrMapEntry {
                entry_type: PtrMapType::FreelistLink,
                back_ptr: entry.back_ptr,
            },
        )?;
    }
    pager.ptrmap_clear(id)?;
    Ok(())
}

fn repair_back_reference(
    pager: &mut Pager,
    entry_type: PtrMapType,
    back_ptr: PageId,
    old_id: PageId,
    new_id: PageId,
) -> Result<()> {
    match entry_type {
        PtrMapType::TreeNode => {
            let (slot, mut parent) = pager.read_node(back_ptr)?;
            let mut changed = false;
            for c in parent.cells.iter_mut() {
                if c.left_child == old_id {
                    c.left_child = new_id;
                    changed = true;
                    break;
                }
            }
            if !changed && parent.next_id == old_id {
                parent.next_id = new_id;
            }
            pager.write_node(slot, &parent)?;
            pager.release(slot);
        }
        PtrMapType::OverflowHead => {
            let (slot, mut owner) = pager.read_node(back_ptr)?;
            for c in owner.cells.iter_mut() {
                if c.overflow == old_id {
                    c.overflow = new_id;
                    break;
                }
            }
            pager.write_node(slot, &owner)?;
            pager.release(slot);
        }
        PtrMapType::OverflowLink => {
            let slot = pager.acquire(back_ptr)?;
            let data = pager.page_data_mut(slot)?;
            data[0..4].copy_from_slice(&new_id.to_le_bytes());
            pager.release(slot);
        }
        PtrMapType::FreelistLink => {
            if back_ptr == NULL_PAGE {
                pager.set_freelist_head(new_id);
            } else {
                let slot = pager.acquire(back_ptr)?;
                let data = pager.page_data_mut(slot)?;
                data[0..4].copy_from_slice(&new_id.to_le_bytes());
                pager.release(slot);
            }
        }
        PtrMapType::TreeRoot => unreachable!("TreeRoot relocations are handled by the caller"),
    }
    Ok(())
}

/// Relocate the single highest-numbered page in the file into a lower,
/// free slot, shrinking the file by one page. Does
/// nothing if there is no free page to reclaim into. Called repeatedly by
/// `Tx::vacuum` until the freelist is empty.
pub fn vacuum_one(pager: &mut Pager) -> Result<Option<RelocatedPage>> {
    let page_count = pager.page_count();
    if page_count <= 1 {
        return Ok(None);
    }
    let last = page_count;

    if is_on_freelist(pager, last)? {
        unlink_freelist_entry(pager, last)?;
        pager.truncate_page_count(last - 1);
        return Ok(None);
    }
    if pager.freelist_head() == NULL_PAGE {
        return Ok(None);
    }

    let target = pager.allocate_page()?;
    debug_assert!(target < last);

    let src_slot = pager.acquire(last)?;
    let data = pager.page_data(src_slot).to_vec();
    pager.release(src_slot);
    let dst_slot = pager.acquire(target)?;
    pager.page_data_mut(dst_slot)?.copy_from_slice(&data);
    pager.release(dst_slot);

    let entry = pager.ptrmap_get(last)?;
    pager.ptrmap_clear(last)?;
    let outcome = match entry {
        Some(PtrMapEntry {
            entry_type: PtrMapType::TreeRoot,
            ..
        }) => {
            pager.ptrmap_put(
                target,
                PtrMapEntry {
                    entry_type: PtrMapType::TreeRoot,
                    back_ptr: NULL_PAGE,
                },
            )?;
            Some(RelocatedPage::Root { old_id: last, new_id: target })
        }
        Some(PtrMapEntry { entry_type, back_ptr }) => {
            pager.ptrmap_put(target, PtrMapEntry { entry_type, back_ptr })?;
            repair_back_reference(pager, entry_type, back_ptr, last, target)?;
            None
        }
        None => None,
    };
    pager.truncate_page_count(last - 1);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{ExponentialBackoff, PosixEnv};
    use crate::pager::bootstrap_fresh_database;
    use std::sync::Arc;

    fn open_pager(dir: &tempfile::TempDir, page_size: u32) -> Pager {
        let env = Arc::new(PosixEnv::new());
        let path = dir.path().join("t.db");
        let file = env.open(&path, true).unwrap();
        bootstrap_fresh_database(file.as_ref(), page_size).unwrap();
        let file: std::sync::Arc<dyn crate::env::EnvFile> = std::sync::Arc::from(file);
        let busy = Box::new(ExponentialBackoff { max_attempts: 10, env: env.clone() });
        let mut pager = Pager::open(env, &path, file, page_size, 64, busy).unwrap();
        pager.start_reader().unwrap();
        pager.start_writer().unwrap();
        pager
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir, 512);
        let mut tree = Tree::new(&mut pager, crate::page::ROOT_PAGE);
        tree.put(b"hello", b"world").unwrap();
        assert_eq!(tree.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(tree.get(b"missing").unwrap(), None);
    }

    #[test]
    fn overwrite_replaces_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir, 512);
        let mut tree = Tree::new(&mut pager, crate::page::ROOT_PAGE);
        tree.put(b"k", b"v1").unwrap();
        tree.put(b"k", b"v2").unwrap();
        assert_eq!(tree.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn many_inserts_force_a_split_and_stay_searchable() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir, 512);
        let mut tree = Tree::new(&mut pager, crate::page::ROOT_PAGE);
        for i in 0..200u32 {
            let key = format!("key-{i:04}");
            tree.put(key.as_bytes(), b"value").unwrap();
        }
        for i in 0..200u32 {
            let key = format!("key-{i:04}");
            assert_eq!(tree.get(key.as_bytes()).unwrap(), Some(b"value".to_vec()));
        }
    }

    #[test]
    fn large_value_spills_to_overflow_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir, 512);
        let mut tree = Tree::new(&mut pager, crate::page::ROOT_PAGE);
        let value = vec![0x5au8; 4000];
        tree.put(b"big", &value).unwrap();
        assert_eq!(tree.get(b"big").unwrap(), Some(value));
    }

    #[test]
    fn erase_removes_key_and_frees_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir, 512);
        let mut tree = Tree::new(&mut pager, crate::page::ROOT_PAGE);
        tree.put(b"a", b"1").unwrap();
        tree.put(b"b", &vec![0x11u8; 4000]).unwrap();
        assert!(tree.erase(b"b").unwrap());
        assert_eq!(tree.get(b"b").unwrap(), None);
        assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert!(!tree.erase(b"b").unwrap());
    }

    #[test]
    fn put_bucket_flags_the_cell_and_survives_a_plain_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir, 512);
        let mut tree = Tree::new(&mut pager, crate::page::ROOT_PAGE);
        tree.put(b"plain", b"value").unwrap();
        tree.put_bucket(b"sub", 7).unwrap();
        assert_eq!(tree.is_bucket_key(b"plain").unwrap(), Some(false));
        assert_eq!(tree.is_bucket_key(b"sub").unwrap(), Some(true));
        assert_eq!(tree.is_bucket_key(b"missing").unwrap(), None);
        let (value, is_bucket) = tree.get_with_flag(b"sub").unwrap().unwrap();
        assert!(is_bucket);
        assert_eq!(value, 7u32.to_le_bytes());
    }

    #[test]
    fn free_bucket_subtree_recurses_into_nested_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir, 512);
        let inner_root = pager.allocate_page().unwrap();
        {
            let slot = pager.acquire(inner_root).unwrap();
            pager.write_node(slot, &Node::new_leaf(inner_root)).unwrap();
            pager.release(slot);
            let mut inner = Tree::new(&mut pager, inner_root);
            inner.put(b"k", b"v").unwrap();
        }
        let outer_root = pager.allocate_page().unwrap();
        {
            let slot = pager.acquire(outer_root).unwrap();
            pager.write_node(slot, &Node::new_leaf(outer_root)).unwrap();
            pager.release(slot);
            let mut outer = Tree::new(&mut pager, outer_root);
            outer.put_bucket(b"nested", inner_root).unwrap();
        }
        free_bucket_subtree(&mut pager, outer_root).unwrap();
        // Both the outer bucket's page and the nested bucket's page are now
        // free; re-allocating should reuse one of them rather than growing
        // the file.
        let before = pager.page_count();
        pager.allocate_page().unwrap();
        assert!(pager.page_count() <= before);
    }

    #[test]
    fn cursor_traversal_visits_keys_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir, 512);
        let mut tree = Tree::new(&mut pager, crate::page::ROOT_PAGE);
        for k in ["b", "d", "f", "h"] {
            tree.put(k.as_bytes(), b"x").unwrap();
        }
        assert_eq!(tree.seek_first().unwrap().unwrap().0, b"b".to_vec());
        assert_eq!(tree.seek_last().unwrap().unwrap().0, b"h".to_vec());
        assert_eq!(tree.seek(b"c").unwrap().unwrap().0, b"d".to_vec());
        assert_eq!(tree.next_after(b"d").unwrap().unwrap().0, b"f".to_vec());
        assert_eq!(tree.prev_before(b"f").unwrap().unwrap().0, b"d".to_vec());
        assert_eq!(tree.prev_before(b"b").unwrap(), None);
        assert_eq!(tree.next_after(b"h").unwrap(), None);
    }
}
