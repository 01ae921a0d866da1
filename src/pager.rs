//! Transaction state machine, read/write paths, page allocation.
//!
//! One object owns the page cache and mediates every page touch, cycling
//! through an Open -> Read -> Write -> Dirty -> Error state ladder that
//! drives its interaction with [`crate::wal::Wal`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::env::{BusyHandler, Env, EnvFile, LockLevel};
use crate::error::{Error, Result};
use crate::file_header::{FileHeader, FILE_HEADER_SIZE, MAGIC};
use crate::node::{header_offset, Node};
use crate::page::{Bufmgr, PageId, NULL_PAGE, ROOT_PAGE};
use crate::pointer_map::{self, PtrMapEntry, PtrMapType};
use crate::wal::{ReaderSlot, Wal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerState {
    Open,
    Read,
    Write,
    Dirty,
    Error,
}

pub struct Pager {
    env: Arc<dyn Env>,
    file: Arc<dyn EnvFile>,
    wal: Wal,
    bufmgr: Bufmgr,
    busy: Box<dyn BusyHandler>,
    state: PagerState,
    page_size: u32,
    page_count: u32,
    saved_page_count: u32,
    record_count: u64,
    freelist_head: PageId,
    reader: Option<ReaderSlot>,
    last_seen_change: u32,
}

impl Pager {
    pub fn open(
        env: Arc<dyn Env>,
        db_path: &Path,
        file: Arc<dyn EnvFile>,
        page_size: u32,
        cache_size: usize,
        busy: Box<dyn BusyHandler>,
    ) -> Result<Self> {
        let wal_path: PathBuf = {
            let mut s = db_path.as_os_str().to_os_string();
            s.push("-wal");
            PathBuf::from(s)
        };
        let wal = Wal::open(env.clone(), file.clone(), wal_path, page_size)?;
        Ok(Pager {
            env,
            file,
            wal,
            bufmgr: Bufmgr::new(cache_size.max(16), page_size as usize),
            busy,
            state: PagerState::Open,
            page_size,
            page_count: 1,
            saved_page_count: 1,
            record_count: 0,
            freelist_head: NULL_PAGE,
            reader: None,
            last_seen_change: 0,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn bump_record_count(&mut self, delta: i64) {
        self.record_count = (self.record_count as i64 + delta).max(0) as u64;
    }

    pub fn freelist_head(&self) -> PageId {
        self.freelist_head
    }

    /// Count the pages currently on the freelist by walking its chain.
    /// O(freelist length); fine for an occasional stats query, not called
    /// from any hot path.
    pub fn freelist_len(&mut self) -> Result<u32> {
        let mut count = 0u32;
        let mut id = self.freelist_head;
        while id != NULL_PAGE {
            count += 1;
            let slot = self.acquire(id)?;
            let next = u32::from_le_bytes(self.page_data(slot)[0..4].try_into().unwrap());
            self.release(slot);
            id = next;
        }
        Ok(count)
    }

    /// Used by vacuum to repoint the freelist head when the page holding it
    /// is the one being relocated.
    pub fn set_freelist_head(&mut self, head: PageId) {
        self.freelist_head = head;
    }

    /// Shrink the logical page count after vacuum frees the file's last
    /// page; never grows it.
    pub fn truncate_page_count(&mut self, new_count: PageId) {
        debug_assert!(new_count <= self.page_count);
        self.page_count = new_count;
    }

    pub fn state(&self) -> PagerState {
        self.state
    }

    pub fn dirty_page_count(&self) -> usize {
        self.bufmgr.dirty_count()
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.wal.needs_checkpoint()
    }

    fn require(&self, allowed: &[PagerState], what: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::not_supported(format!(
                "{what} requires pager state in {allowed:?}, got {:?}",
                self.state
            )))
        }
    }

    // ---- Lifecycle ----

    pub fn start_reader(&mut self) -> Result<()> {
        self.require(&[PagerState::Open], "start_reader")?;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self.file.try_lock(LockLevel::Shared)? {
                break;
            }
            if !self.busy.handle(attempts) {
                return Err(Error::Busy);
            }
        }
        let (slot, changed) = match self.wal.start_reader(self.last_seen_change) {
            Ok(v) => v,
            Err(e) => {
                self.file.unlock(LockLevel::Unlocked)?;
                return Err(e);
            }
        };
        self.reader = Some(slot);
        self.last_seen_change = self.wal.change();
        if changed {
            self.bufmgr.purge();
        }
        self.state = PagerState::Read;
        self.refresh_root_header()?;
        Ok(())
    }

    pub fn start_writer(&mut self) -> Result<()> {
        self.require(&[PagerState::Read], "start_writer")?;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.wal.start_writer() {
                Ok(()) => break,
                Err(Error::Busy) => {
                    if !self.busy.handle(attempts) {
                        return Err(Error::Busy);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.state = PagerState::Write;
        Ok(())
    }

    pub fn finish(&mut self) {
        if matches!(self.state, PagerState::Dirty | PagerState::Error) {
            let _ = self.rollback();
        }
        if matches!(self.state, PagerState::Write | PagerState::Error) {
            self.wal.finish_writer();
        }
        if let Some(r) = self.reader.take() {
            self.wal.end_reader(r.slot);
        }
        if self.state != PagerState::Open {
            let _ = self.file.unlock(LockLevel::Unlocked);
        }
        self.bufmgr.purge();
        self.state = PagerState::Open;
    }

    fn refresh_root_header(&mut self) -> Result<()> {
        let slot = self.acquire(ROOT_PAGE)?;
        let data = self.bufmgr.frame(slot).data.clone();
        self.release(slot);
        if data[0..4] == MAGIC.to_le_bytes() {
            let hdr = FileHeader::read(&data[0..FILE_HEADER_SIZE])?;
            self.page_count = hdr.page_count;
            self.saved_page_count = hdr.page_count;
            self.freelist_head = hdr.freelist_head;
            self.record_count = hdr.record_count;
        }
        Ok(())
    }

    // ---- Page cache ----

    fn ensure_available_buffer(&mut self) -> Result<()> {
        if self.bufmgr.len() < self.bufmgr.capacity() {
            return Ok(());
        }
        let victim = self
            .bufmgr
            .next_victim()
            .ok_or_else(|| Error::corruption("cache exhausted: every frame pinned"))?;
        if self.bufmgr.frame(victim).dirty {
            let id = self.bufmgr.frame(victim).page_id;
            let data = self.bufmgr.frame(victim).data.clone();
            self.wal.write_evicted(id, &data)?;
            self.bufmgr.clear_dirty(victim);
        }
        let id = self.bufmgr.frame(victim).page_id;
        self.bufmgr.erase(id);
        Ok(())
    }

    fn visibility_watermark(&self) -> u32 {
        match self.state {
            PagerState::Write | PagerState::Dirty => self.wal.writer_watermark(),
            _ => self.reader.map(|r| r.max_frame).unwrap_or(0),
        }
    }

    /// Bring page `id` into cache, pinned once. Acquiring beyond the current
    /// logical page count is permitted only in a writer transaction and
    /// implicitly extends the size.
    pub fn acquire(&mut self, id: PageId) -> Result<usize> {
        if let Some(slot) = self.bufmgr.get(id) {
            self.bufmgr.ref_(slot);
            return Ok(slot);
        }
        let in_range = (id as u64) <= self.page_count as u64;
        if !in_range && !matches!(self.state, PagerState::Write | PagerState::Dirty) {
            return Err(Error::corruption("page id beyond current database size"));
        }
        let watermark = self.visibility_watermark();
        let mut buf = vec![0u8; self.page_size as usize];
        if in_range {
            if let Some(found) = self.wal.read(id, watermark)? {
                buf = found;
            } else {
                // A page allocated this session (freelist reuse aside) has
                // no image in the DB file until the next checkpoint; reading
                // past the file's physical length would just fail, so treat
                // it as a fresh zero page instead.
                let offset = (id as u64 - 1) * self.page_size as u64;
                if offset + self.page_size as u64 <= self.file.len()? {
                    self.file.read_at(&mut buf, offset)?;
                }
            }
        }
        self.ensure_available_buffer()?;
        let slot = self
            .bufmgr
            .register_page(id)
            .ok_or_else(|| Error::corruption("cache exhausted registering page"))?;
        self.bufmgr.frame_mut(slot).data.copy_from_slice(&buf);
        Ok(slot)
    }

    pub fn page_data(&self, slot: usize) -> &[u8] {
        &self.bufmgr.frame(slot).data
    }

    /// Mutable access, which always links the frame into the dirty list and
    /// drives Write -> Dirty.
    pub fn page_data_mut(&mut self, slot: usize) -> Result<&mut [u8]> {
        self.require(&[PagerState::Write, PagerState::Dirty], "mark_dirty")?;
        self.bufmgr.mark_dirty(slot);
        if self.state == PagerState::Write {
            self.state = PagerState::Dirty;
        }
        Ok(&mut self.bufmgr.frame_mut(slot).data)
    }

    pub fn release(&mut self, slot: usize) {
        self.bufmgr.unref(slot);
    }

    // ---- Allocation ----

    pub fn allocate_page(&mut self) -> Result<PageId> {
        if self.freelist_head != NULL_PAGE {
            let head = self.freelist_head;
            let slot = self.acquire(head)?;
            let next = u32::from_le_bytes(self.page_data(slot)[0..4].try_into().unwrap());
            self.release(slot);
            self.freelist_head = next;
            if next != NULL_PAGE {
                self.ptrmap_put(
                    next,
                    PtrMapEntry {
                        entry_type: PtrMapType::FreelistLink,
                        back_ptr: NULL_PAGE,
                    },
                )?;
            }
            self.ptrmap_clear(head)?;
            return Ok(head);
        }
        let mut candidate = self.page_count + 1;
        if pointer_map::is_pointer_map_page(candidate, self.page_size as usize) {
            let slot = self.acquire(candidate)?;
            self.page_data_mut(slot)?;
            self.release(slot);
            self.page_count = candidate;
            candidate += 1;
        }
        self.page_count = self.page_count.max(candidate);
        Ok(candidate)
    }

    pub fn free_page(&mut self, id: PageId) -> Result<()> {
        let old_head = self.freelist_head;
        {
            let slot = self.acquire(id)?;
            let data = self.page_data_mut(slot)?;
            for b in data.iter_mut() {
                *b = 0;
            }
            data[0..4].copy_from_slice(&old_head.to_le_bytes());
            self.release(slot);
        }
        self.ptrmap_put(
            id,
            PtrMapEntry {
                entry_type: PtrMapType::FreelistLink,
                back_ptr: NULL_PAGE,
            },
        )?;
        if old_head != NULL_PAGE {
            self.ptrmap_put(
                old_head,
                PtrMapEntry {
                    entry_type: PtrMapType::FreelistLink,
                    back_ptr: id,
                },
            )?;
        }
        self.freelist_head = id;
        Ok(())
    }

    // ---- Pointer map ----

    pub fn ptrmap_get(&mut self, id: PageId) -> Result<Option<PtrMapEntry>> {
        if id <= ROOT_PAGE || pointer_map::is_pointer_map_page(id, self.page_size as usize) {
            return Ok(None);
        }
        let pm_page = pointer_map::page_for(id, self.page_size as usize);
        let slot = self.acquire(pm_page)?;
        let entry = pointer_map::read_entry(self.page_data(slot), id, self.page_size as usize)?;
        self.release(slot);
        Ok(entry)
    }

    pub fn ptrmap_put(&mut self, id: PageId, entry: PtrMapEntry) -> Result<()> {
        if id <= ROOT_PAGE || pointer_map::is_pointer_map_page(id, self.page_size as usize) {
            return Ok(());
        }
        let pm_page = pointer_map::page_for(id, self.page_size as usize);
        let slot = self.acquire(pm_page)?;
        let data = self.page_data_mut(slot)?;
        pointer_map::write_entry(data, id, entry, self.page_size as usize);
        self.release(slot);
        Ok(())
    }

    pub fn ptrmap_clear(&mut self, id: PageId) -> Result<()> {
        if id <= ROOT_PAGE || pointer_map::is_pointer_map_page(id, self.page_size as usize) {
            return Ok(());
        }
        let pm_page = pointer_map::page_for(id, self.page_size as usize);
        let slot = self.acquire(pm_page)?;
        let data = self.page_data_mut(slot)?;
        pointer_map::clear_entry(data, id, self.page_size as usize);
        self.release(slot);
        Ok(())
    }

    // ---- Node access convenience, used throughout tree.rs ----

    pub fn read_node(&mut self, id: PageId) -> Result<(usize, Node)> {
        let slot = self.acquire(id)?;
        let node = Node::parse(id, self.page_data(slot), self.page_size as usize)?;
        Ok((slot, node))
    }

    pub fn write_node(&mut self, slot: usize, node: &Node) -> Result<()> {
        let bytes = node.serialize(self.page_size as usize);
        let data = self.page_data_mut(slot)?;
        data.copy_from_slice(&bytes);
        Ok(())
    }

    // ---- Commit / rollback ----

    pub fn commit(&mut self) -> Result<()> {
        if self.state == PagerState::Write {
            return Ok(());
        }
        self.require(&[PagerState::Dirty], "commit")?;
        if let Err(e) = self.commit_inner() {
            self.state = PagerState::Error;
            return Err(e);
        }
        Ok(())
    }

    fn commit_inner(&mut self) -> Result<()> {
        let root_slot = self.acquire(ROOT_PAGE)?;
        let mut hdr = self.root_header(root_slot)?;
        if hdr.page_count != self.page_count
            || hdr.freelist_head != self.freelist_head
            || hdr.record_count != self.record_count
        {
            hdr.page_count = self.page_count;
            hdr.freelist_head = self.freelist_head;
            hdr.record_count = self.record_count;
            hdr.commit_lsn += 1;
            let mut scratch = [0u8; FILE_HEADER_SIZE];
            hdr.finalize_crc(&mut scratch);
            let data = self.page_data_mut(root_slot)?;
            data[0..FILE_HEADER_SIZE].copy_from_slice(&scratch);
        }
        self.release(root_slot);

        // A pure header update still needs >=1 WAL frame to carry the
        // post-commit `db_size`.
        if self.bufmgr.dirty_count() == 0 {
            let slot = self.acquire(ROOT_PAGE)?;
            self.page_data_mut(slot)?;
            self.release(slot);
        }

        let dirty_slots = self.bufmgr.dirty_sorted();
        let mut batch = Vec::with_capacity(dirty_slots.len());
        for &slot in &dirty_slots {
            let id = self.bufmgr.frame(slot).page_id;
            batch.push((id, self.bufmgr.frame(slot).data.clone()));
        }
        self.wal.write_commit(&batch, self.page_count)?;
        for slot in dirty_slots {
            self.bufmgr.clear_dirty(slot);
        }
        self.saved_page_count = self.page_count;
        self.state = PagerState::Write;
        Ok(())
    }

    fn root_header(&mut self, root_slot: usize) -> Result<FileHeader> {
        let data = self.page_data(root_slot);
        if data[0..4] == MAGIC.to_le_bytes() {
            FileHeader::read(&data[0..FILE_HEADER_SIZE])
        } else {
            Err(Error::corruption("page 1 missing file header"))
        }
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.require(&[PagerState::Write, PagerState::Dirty, PagerState::Error], "rollback")?;
        self.wal.rollback()?;
        self.page_count = self.saved_page_count;
        self.bufmgr.purge();
        self.state = PagerState::Write;
        self.refresh_root_header()?;
        Ok(())
    }

    // ---- Checkpoint ----

    pub fn checkpoint(&mut self, reset: bool) -> Result<()> {
        self.require(&[PagerState::Open], "checkpoint")?;
        self.wal.checkpoint(reset)
    }

    pub fn close(&mut self) -> Result<()> {
        self.wal.close()
    }

    pub fn env(&self) -> &Arc<dyn Env> {
        &self.env
    }
}

/// Directly materialize a fresh, empty database: file header + an empty
/// schema-tree leaf node sharing page 1.
/// Bypasses the WAL entirely since there is nothing to recover yet; callers
/// hold the file's exclusive lock for the duration.
pub fn bootstrap_fresh_database(file: &dyn EnvFile, page_size: u32) -> Result<()> {
    let mut buf = vec![0u8; page_size as usize];
    let mut hdr = FileHeader::fresh(page_size);
    hdr.page_count = 1;
    let mut scratch = [0u8; FILE_HEADER_SIZE];
    hdr.finalize_crc(&mut scratch);
    buf[0..FILE_HEADER_SIZE].copy_from_slice(&scratch);
    let node = Node::new_leaf(ROOT_PAGE);
    let node_bytes = node.serialize(page_size as usize);
    let base = header_offset(ROOT_PAGE);
    debug_assert_eq!(base, FILE_HEADER_SIZE);
    buf[base..].copy_from_slice(&node_bytes[base..]);
    file.write_at(&buf, 0)?;
    file.set_len(page_size as u64)?;
    file.sync()?;
    Ok(())
}
