//! Write-ahead log: append-only frame file, shared-memory hash index, and
//! the reader/writer/checkpointer coordination protocol.
//!
//! Commit/rollback/recovery chain a checksum over each batch and fsync
//! before truncating on close; a grouped shared-memory hash index (rather
//! than a full linear rescan) maps page id to newest frame, using a
//! two-word Fletcher-style checksum.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::env::{shm_read_lock, Env, EnvFile, ShmRegion, SHM_CKPT_LOCK, SHM_READER_COUNT,
    SHM_RECOVER_LOCK, SHM_WRITE_LOCK};
use crate::error::{Error, Result};
use crate::page::PageId;

pub const WAL_MAGIC: u32 = 0x5CE7_3375;
pub const WAL_VERSION: u32 = 1;
pub const WAL_HEADER_SIZE: usize = 32;
pub const FRAME_HEADER_SIZE: usize = 24;

const K_HASH_PRIME: u32 = 383;
const K_N_INDEX_HASHES: u32 = 8192;
const K_N_INDEX_KEYS: u32 = 4096;
const HASH_INDEX_HDR_SIZE: usize = 48;
const CKPT_INFO_SIZE: usize = 4 + 4 * SHM_READER_COUNT + 8 /* locks byte-per-slot, rounded */ + 4 + 4;
const INDEX_HEADER_SIZE: usize = 2 * HASH_INDEX_HDR_SIZE + CKPT_INFO_SIZE;
const K_N_INDEX_KEYS0: u32 = K_N_INDEX_KEYS - (INDEX_HEADER_SIZE as u32) / 4;

/// Sentinel meaning "this reader slot is not currently claimed".
pub const READMARK_UNUSED: u32 = u32::MAX;

/// Two-word rolling checksum over 4-byte little-endian words.
pub fn checksum(data: &[u8], seed: [u32; 2]) -> [u32; 2] {
    debug_assert_eq!(data.len() % 8, 0);
    let mut s1 = seed[0];
    let mut s2 = seed[1];
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let w0 = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
        let w1 = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
        s1 = s1.wrapping_add(w0).wrapping_add(s2);
        s2 = s2.wrapping_add(w1).wrapping_add(s1);
    }
    [s1, s2]
}

#[derive(Debug, Clone, Copy)]
pub struct WalHeader {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub ckpt_number: u32,
    pub salt: [u32; 2],
    pub checksum: [u32; 2],
}

impl WalHeader {
    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.ckpt_number.to_le_bytes());
        buf[16..20].copy_from_slice(&self.salt[0].to_le_bytes());
        buf[20..24].copy_from_slice(&self.salt[1].to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum[0].to_le_bytes());
        buf[28..32].copy_from_slice(&self.checksum[1].to_le_bytes());
    }

    fn read(buf: &[u8]) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != WAL_MAGIC {
            return Err(Error::corruption("bad WAL header magic"));
        }
        Ok(WalHeader {
            magic,
            version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            page_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            ckpt_number: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            salt: [
                u32::from_le_bytes(buf[16..20].try_into().unwrap()),
                u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            ],
            checksum: [
                u32::from_le_bytes(buf[24..28].try_into().unwrap()),
                u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            ],
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    page_id: PageId,
    db_size: u32,
    salt: [u32; 2],
    checksum: [u32; 2],
}

impl FrameHeader {
    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.page_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.db_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.salt[0].to_le_bytes());
        buf[12..16].copy_from_slice(&self.salt[1].to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum[0].to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum[1].to_le_bytes());
    }

    fn read(buf: &[u8]) -> Self {
        FrameHeader {
            page_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            db_size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            salt: [
                u32::from_le_bytes(buf[8..12].try_into().unwrap()),
                u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            ],
            checksum: [
                u32::from_le_bytes(buf[16..20].try_into().unwrap()),
                u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            ],
        }
    }
}

/// In-memory mirror of the shared-memory index header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashIndexHdr {
    pub version: u32,
    pub change: u32,
    pub is_init: u32,
    pub page_size: u32,
    pub max_frame: u32,
    pub db_size: u32,
    pub frame_checksum: [u32; 2],
    pub salt: [u32; 2],
    pub checksum: [u32; 2],
}

impl HashIndexHdr {
    fn encode(&self) -> [u8; HASH_INDEX_HDR_SIZE] {
        let mut buf = [0u8; HASH_INDEX_HDR_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&self.change.to_le_bytes());
        buf[8..12].copy_from_slice(&self.is_init.to_le_bytes());
        buf[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.max_frame.to_le_bytes());
        buf[20..24].copy_from_slice(&self.db_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.frame_checksum[0].to_le_bytes());
        buf[28..32].copy_from_slice(&self.frame_checksum[1].to_le_bytes());
        buf[32..36].copy_from_slice(&self.salt[0].to_le_bytes());
        buf[36..40].copy_from_slice(&self.salt[1].to_le_bytes());
        let crc = crc32c::crc32c(&buf[0..40]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
        buf[44..48].copy_from_slice(&0u32.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        let crc = crc32c::crc32c(&buf[0..40]);
        let stored = u32::from_le_bytes(buf[40..44].try_into().unwrap());
        if crc != stored {
            return None;
        }
        Some(HashIndexHdr {
            version: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            change: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            is_init: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            page_size: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            max_frame: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            db_size: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            frame_checksum: [
                u32::from_le_bytes(buf[24..28].try_into().unwrap()),
                u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            ],
            salt: [
                u32::from_le_bytes(buf[32..36].try_into().unwrap()),
                u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            ],
            checksum: [stored, 0],
        })
    }
}

/// Shared-memory hash table mapping page id -> newest WAL frame number.
struct HashIndex {
    db_file: Arc<dyn EnvFile>,
}

impl HashIndex {
    fn new(db_file: Arc<dyn EnvFile>) -> Self {
        HashIndex { db_file }
    }

    fn group_region(&self, group: u32) -> Result<Arc<ShmRegion>> {
        self.db_file.shm_map(group as usize)
    }

    fn group_base(group: u32) -> u32 {
        if group == 0 {
            0
        } else {
            K_N_INDEX_KEYS0 + K_N_INDEX_KEYS * (group - 1)
        }
    }

    fn group_number(value: u32) -> u32 {
        (value - 1 + K_N_INDEX_KEYS - K_N_INDEX_KEYS0) / K_N_INDEX_KEYS
    }

    fn keys_offset(group: u32) -> usize {
        if group == 0 {
            INDEX_HEADER_SIZE
        } else {
            0
        }
    }

    fn key_capacity(group: u32) -> u32 {
        if group == 0 {
            K_N_INDEX_KEYS0
        } else {
            K_N_INDEX_KEYS
        }
    }

    fn hashes_offset(group: u32) -> usize {
        Self::keys_offset(group) + Self::key_capacity(group) as usize * 4
    }

    fn index_hash(key: u32) -> u32 {
        (key.wrapping_mul(K_HASH_PRIME)) & (K_N_INDEX_HASHES - 1)
    }

    fn next_hash(h: u32) -> u32 {
        (h + 1) & (K_N_INDEX_HASHES - 1)
    }

    fn read_key(region: &ShmRegion, group: u32, relative_index: u32) -> u32 {
        let off = Self::keys_offset(group) + relative_index as usize * 4;
        region.with_slice(|s| u32::from_le_bytes(s[off..off + 4].try_into().unwrap()))
    }

    fn write_key(region: &ShmRegion, group: u32, relative_index: u32, key: u32) {
        let off = Self::keys_offset(group) + relative_index as usize * 4;
        region.with_slice_mut(|s| s[off..off + 4].copy_from_slice(&key.to_le_bytes()));
    }

    fn read_hash(region: &ShmRegion, group: u32, slot: u32) -> u32 {
        let off = Self::hashes_offset(group) + slot as usize * 2;
        region.with_slice(|s| u16::from_le_bytes(s[off..off + 2].try_into().unwrap()) as u32)
    }

    fn write_hash(region: &ShmRegion, group: u32, slot: u32, relative: u32) {
        let off = Self::hashes_offset(group) + slot as usize * 2;
        region.with_slice_mut(|s| s[off..off + 2].copy_from_slice(&(relative as u16).to_le_bytes()));
    }

    /// Find the newest frame for `key` within `[lower, upper]`, newest first.
    fn lookup(&self, key: u32, lower: u32, upper: u32) -> Result<u32> {
        if upper == 0 {
            return Ok(0);
        }
        let lower = lower.max(1);
        let min_group = Self::group_number(lower);
        let mut out = 0u32;
        let mut n = Self::group_number(upper);
        loop {
            let region = self.group_region(n)?;
            let base = Self::group_base(n);
            let mut collisions = K_N_INDEX_HASHES;
            let mut h = Self::index_hash(key);
            loop {
                let relative = Self::read_hash(&region, n, h);
                if relative == 0 {
                    break;
                }
                if collisions == 0 {
                    return Err(Error::corruption("too many WAL index collisions"));
                }
                collisions -= 1;
                let absolute = base + relative;
                if absolute >= lower
                    && absolute <= upper
                    && Self::read_key(&region, n, relative - 1) == key
                {
                    out = out.max(absolute);
                }
                h = Self::next_hash(h);
            }
            if out != 0 || n <= min_group {
                break;
            }
            n -= 1;
        }
        Ok(out)
    }

    /// Record that `key` (a page id) now lives at frame `value`.
    fn assign(&self, key: u32, value: u32) -> Result<()> {
        let n = Self::group_number(value);
        let region = self.group_region(n)?;
        let base = Self::group_base(n);
        debug_assert!(base < value);
        let relative = value - base;
        if relative == 1 {
            // First entry in a fresh group: clear stale contents.
            region.with_slice_mut(|s| {
                let start = Self::keys_offset(n);
                for b in &mut s[start..] {
                    *b = 0;
                }
            });
        }
        Self::write_key(&region, n, relative - 1, key);
        let mut h = Self::index_hash(key);
        loop {
            if Self::read_hash(&region, n, h) == 0 {
                Self::write_hash(&region, n, h, relative);
                break;
            }
            h = Self::next_hash(h);
        }
        Ok(())
    }

    /// Key stored at absolute frame `value` (used by checkpoint/recovery).
    fn fetch(&self, value: u32) -> Result<u32> {
        let n = Self::group_number(value);
        let region = self.group_region(n)?;
        let base = Self::group_base(n);
        Ok(Self::read_key(&region, n, value - base - 1))
    }

    /// Zero hash slots whose frame exceeds `keep_max`.
    fn truncate(&self, old_max: u32, keep_max: u32) -> Result<()> {
        for frame in (keep_max + 1)..=old_max {
            let n = Self::group_number(frame);
            let region = self.group_region(n)?;
            let base = Self::group_base(n);
            let relative = frame - base;
            let key = Self::read_key(&region, n, relative - 1);
            if key == 0 {
                continue;
            }
            let mut h = Self::index_hash(key);
            loop {
                if Self::read_hash(&region, n, h) == relative {
                    Self::write_hash(&region, n, h, 0);
                    break;
                }
                if Self::read_hash(&region, n, h) == 0 {
                    break;
                }
                h = Self::next_hash(h);
            }
        }
        Ok(())
    }
}

/// Per-reader watermark bookkeeping.
struct ReadMarks;

impl ReadMarks {
    const OFFSET: usize = 2 * HASH_INDEX_HDR_SIZE + 4; // skip `backfill: u32`

    fn get(region: &ShmRegion, slot: usize) -> u32 {
        region.load_u32(Self::OFFSET + slot * 4)
    }

    fn set(region: &ShmRegion, slot: usize, value: u32) {
        region.store_u32(Self::OFFSET + slot * 4, value);
    }

    fn backfill(region: &ShmRegion) -> u32 {
        region.load_u32(2 * HASH_INDEX_HDR_SIZE)
    }

    fn set_backfill(region: &ShmRegion, value: u32) {
        region.store_u32(2 * HASH_INDEX_HDR_SIZE, value);
    }
}

/// State for one reader transaction's fixed snapshot watermark.
#[derive(Debug, Clone, Copy)]
pub struct ReaderSlot {
    pub slot: usize,
    pub max_frame: u32,
}

pub struct Wal {
    env: Arc<dyn Env>,
    wal_path: PathBuf,
    wal_file: Option<Box<dyn EnvFile>>,
    db_file: Arc<dyn EnvFile>,
    page_size: u32,
    hdr: HashIndexHdr,
    index: HashIndex,
    /// Pages written to the WAL so far in the *current* writer transaction,
    /// mapping page id -> frame number, so a page re-dirtied after a
    /// mid-transaction eviction flush overwrites its earlier frame in place
    /// instead of appending a second one.
    tx_frames: HashMap<PageId, u32>,
    running_checksum: [u32; 2],
    writer_locked: bool,
}

const NEEDS_CHECKPOINT_THRESHOLD: u32 = 1000;

impl Wal {
    pub fn open(env: Arc<dyn Env>, db_file: Arc<dyn EnvFile>, wal_path: PathBuf, page_size: u32) -> Result<Self> {
        let wal_file = Some(env.open(&wal_path, true)?);
        let index = HashIndex::new(db_file.clone());
        let mut wal = Wal {
            env,
            wal_path,
            wal_file,
            db_file,
            page_size,
            hdr: HashIndexHdr::default(),
            index,
            tx_frames: HashMap::new(),
            running_checksum: [0, 0],
            writer_locked: false,
        };
        wal.load_or_recover()?;
        Ok(wal)
    }

    fn header_region(&self) -> Result<Arc<ShmRegion>> {
        self.db_file.shm_map(0)
    }

    fn read_shared_hdr(&self) -> Result<Option<HashIndexHdr>> {
        let region = self.header_region()?;
        let mut buf0 = [0u8; HASH_INDEX_HDR_SIZE];
        region.with_slice(|s| buf0.copy_from_slice(&s[0..HASH_INDEX_HDR_SIZE]));
        let Some(h0) = HashIndexHdr::decode(&buf0) else {
            return Ok(None);
        };
        let mut buf1 = [0u8; HASH_INDEX_HDR_SIZE];
        region.with_slice(|s| {
            buf1.copy_from_slice(&s[HASH_INDEX_HDR_SIZE..2 * HASH_INDEX_HDR_SIZE])
        });
        let Some(h1) = HashIndexHdr::decode(&buf1) else {
            return Ok(None);
        };
        if h0 != h1 {
            return Ok(None);
        }
        Ok(Some(h0))
    }

    fn publish_hdr(&self) -> Result<()> {
        let region = self.header_region()?;
        let bytes = self.hdr.encode();
        // Write slot 1 (second copy) first, barrier, then slot 0: a reader
        // that sees slot 0's new value is guaranteed slot 1's is visible too.
        region.with_slice_mut(|s| {
            s[HASH_INDEX_HDR_SIZE..2 * HASH_INDEX_HDR_SIZE].copy_from_slice(&bytes)
        });
        self.db_file.shm_barrier();
        region.with_slice_mut(|s| s[0..HASH_INDEX_HDR_SIZE].copy_from_slice(&bytes));
        Ok(())
    }

    fn load_or_recover(&mut self) -> Result<()> {
        match self.read_shared_hdr()? {
            Some(h) if h.is_init != 0 => {
                self.hdr = h;
                self.running_checksum = h.frame_checksum;
                Ok(())
            }
            _ => self.recover(),
        }
    }

    /// Rebuild the shared-memory index by scanning the WAL file from the
    /// start, stopping at the first frame whose checksum or salt does not
    /// chain correctly.
    fn recover(&mut self) -> Result<()> {
        self.db_file.shm_lock(SHM_RECOVER_LOCK, 1, true, true)?;
        let result = self.recover_locked();
        self.db_file.shm_unlock(SHM_RECOVER_LOCK, 1);
        result
    }

    fn recover_locked(&mut self) -> Result<()> {
        let wal_file = self.wal_file.as_deref().unwrap();
        let len = wal_file.len()?;
        let mut hdr = HashIndexHdr {
            version: 1,
            change: 0,
            is_init: 1,
            page_size: self.page_size,
            max_frame: 0,
            db_size: 0,
            frame_checksum: [0, 0],
            salt: [0, 0],
            checksum: [0, 0],
        };
        if len < WAL_HEADER_SIZE as u64 {
            self.hdr = hdr;
            self.running_checksum = [0, 0];
            self.publish_hdr()?;
            return Ok(());
        }
        let mut hdr_buf = [0u8; WAL_HEADER_SIZE];
        wal_file.read_at(&mut hdr_buf, 0)?;
        let Ok(wal_hdr) = WalHeader::read(&hdr_buf) else {
            self.hdr = hdr;
            self.running_checksum = [0, 0];
            self.publish_hdr()?;
            return Ok(());
        };
        hdr.salt = wal_hdr.salt;
        let mut seed = wal_hdr.checksum;
        let frame_size = FRAME_HEADER_SIZE as u64 + self.page_size as u64;
        let mut offset = WAL_HEADER_SIZE as u64;
        let mut frame_no = 0u32;
        while offset + frame_size <= len {
            let mut fbuf = vec![0u8; FRAME_HEADER_SIZE];
            wal_file.read_at(&mut fbuf, offset)?;
            let fh = FrameHeader::read(&fbuf);
            if fh.salt != wal_hdr.salt {
                break;
            }
            let mut payload = vec![0u8; self.page_size as usize];
            wal_file.read_at(&mut payload, offset + FRAME_HEADER_SIZE as u64)?;
            let mut unit = Vec::with_capacity(8 + payload.len());
            unit.extend_from_slice(&fbuf[0..8]);
            unit.extend_from_slice(&payload);
            let computed = checksum(&unit, seed);
            if computed != fh.checksum {
                break;
            }
            seed = computed;
            frame_no += 1;
            self.index.assign(fh.page_id, frame_no)?;
            if fh.db_size > 0 {
                hdr.max_frame = frame_no;
                hdr.db_size = fh.db_size;
                hdr.frame_checksum = computed;
            }
            offset += frame_size;
        }
        self.hdr = hdr;
        self.running_checksum = hdr.frame_checksum;
        self.publish_hdr()?;
        Ok(())
    }

    pub fn page_count(&self) -> u32 {
        self.hdr.db_size
    }

    pub fn max_frame(&self) -> u32 {
        self.hdr.max_frame
    }

    /// Shared index header's change counter, used by [`crate::pager::Pager`]
    /// to detect a WAL state change since its last reader start.
    pub fn change(&self) -> u32 {
        self.hdr.change
    }

    /// Select a read-mark watermark fixed at this reader's start time.
    /// Returns the watermark and whether the shared index header changed
    /// since the caller's last observation (triggering a cache purge).
    pub fn start_reader(&mut self, last_seen_change: u32) -> Result<(ReaderSlot, bool)> {
        let shared = self.read_shared_hdr()?.ok_or_else(|| Error::Busy)?;
        if shared.is_init == 0 {
            self.recover()?;
        } else {
            self.hdr = shared;
        }
        let region = self.header_region()?;
        let max_frame = self.hdr.max_frame;
        // Slot 0 is the always-0 "fully backfilled" fast path.
        if max_frame == 0 {
            self.db_file
                .shm_lock(shm_read_lock(0), 1, false, true)?;
            let changed = last_seen_change != self.hdr.change;
            return Ok((ReaderSlot { slot: 0, max_frame: 0 }, changed));
        }
        let mut chosen: Option<usize> = None;
        for slot in 1..SHM_READER_COUNT {
            let mark = ReadMarks::get(&region, slot);
            if mark != READMARK_UNUSED && mark <= max_frame {
                chosen = Some(slot);
                break;
            }
        }
        let slot = match chosen {
            Some(s) => s,
            None => {
                let mut free_slot = 1;
                for slot in 1..SHM_READER_COUNT {
                    if ReadMarks::get(&region, slot) == READMARK_UNUSED {
                        free_slot = slot;
                        break;
                    }
                }
                ReadMarks::set(&region, free_slot, max_frame);
                free_slot
            }
        };
        self.db_file.shm_lock(shm_read_lock(slot), 1, false, true)?;
        let changed = last_seen_change != self.hdr.change;
        Ok((ReaderSlot { slot, max_frame }, changed))
    }

    pub fn end_reader(&self, slot: usize) {
        self.db_file.shm_unlock(shm_read_lock(slot), 1);
    }

    pub fn start_writer(&mut self) -> Result<()> {
        if !self.db_file.shm_lock(SHM_WRITE_LOCK, 1, true, false)? {
            return Err(Error::Busy);
        }
        let shared = self.read_shared_hdr()?;
        if shared != Some(self.hdr) {
            self.db_file.shm_unlock(SHM_WRITE_LOCK, 1);
            return Err(Error::Busy);
        }
        self.writer_locked = true;
        self.tx_frames.clear();
        Ok(())
    }

    fn end_writer(&mut self) {
        if self.writer_locked {
            self.db_file.shm_unlock(SHM_WRITE_LOCK, 1);
            self.writer_locked = false;
        }
        self.tx_frames.clear();
    }

    /// Read a page out of the WAL, bounded by `watermark`: `Ok(None)` means "not present in the WAL, fall back to
    /// the database file".
    pub fn read(&self, page_id: PageId, watermark: u32) -> Result<Option<Vec<u8>>> {
        let frame = self.index.lookup(page_id, 1, watermark)?;
        if frame == 0 {
            return Ok(None);
        }
        let offset = self.frame_offset(frame);
        let mut payload = vec![0u8; self.page_size as usize];
        self.wal_file
            .as_deref()
            .unwrap()
            .read_at(&mut payload, offset + FRAME_HEADER_SIZE as u64)?;
        Ok(Some(payload))
    }

    fn frame_offset(&self, frame_no: u32) -> u64 {
        WAL_HEADER_SIZE as u64 + (frame_no as u64 - 1) * (FRAME_HEADER_SIZE as u64 + self.page_size as u64)
    }

    fn ensure_header_written(&mut self) -> Result<()> {
        if self.hdr.max_frame != 0 {
            return Ok(());
        }
        let mut salt = self.hdr.salt;
        let ckpt_number = if self.hdr.salt == [0, 0] && self.hdr.change == 0 {
            0
        } else {
            1
        };
        if ckpt_number == 0 {
            let mut bytes = [0u8; 8];
            self.env.random_bytes(&mut bytes);
            salt = [
                u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
                u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            ];
        }
        let wal_hdr = WalHeader {
            magic: WAL_MAGIC,
            version: WAL_VERSION,
            page_size: self.page_size,
            ckpt_number,
            salt,
            checksum: [0, 0],
        };
        let mut buf = [0u8; WAL_HEADER_SIZE];
        wal_hdr.write(&mut buf);
        let cksum = checksum(&buf[0..24], [0, 0]);
        let mut wal_hdr = wal_hdr;
        wal_hdr.checksum = cksum;
        wal_hdr.write(&mut buf);
        let f = self.wal_file.as_deref().unwrap();
        f.write_at(&buf, 0)?;
        f.sync()?;
        self.hdr.salt = salt;
        self.running_checksum = cksum;
        Ok(())
    }

    /// Append (or, for a page already touched this transaction, overwrite
    /// in place) one frame. `is_commit` carries `db_size > 0`.
    fn write_one_frame(&mut self, page_id: PageId, data: &[u8], db_size: u32) -> Result<()> {
        self.ensure_header_written()?;
        let f = self.wal_file.as_deref().unwrap();
        if let Some(&existing_frame) = self.tx_frames.get(&page_id) {
            // Overwrite the earlier frame from this transaction in place,
            // then redo the checksum chain from there.
            let seed = if existing_frame == 1 {
                let mut hdr_buf = [0u8; WAL_HEADER_SIZE];
                f.read_at(&mut hdr_buf, 0)?;
                WalHeader::read(&hdr_buf)?.checksum
            } else {
                let prev_off = self.frame_offset(existing_frame - 1);
                let mut prev_hdr = [0u8; FRAME_HEADER_SIZE];
                f.read_at(&mut prev_hdr, prev_off)?;
                FrameHeader::read(&prev_hdr).checksum
            };
            self.write_frame_at(existing_frame, page_id, data, db_size, seed)?;
            self.rewrite_checksums_from(existing_frame + 1)?;
        } else {
            let frame_no = self.next_append_frame();
            self.write_frame_at(frame_no, page_id, data, db_size, self.running_checksum)?;
            self.index.assign(page_id, frame_no)?;
            self.tx_frames.insert(page_id, frame_no);
        }
        Ok(())
    }

    /// Next frame number to append, accounting for frames already appended
    /// earlier in this same transaction (`self.hdr.max_frame` only advances
    /// at commit, so we track the running count via `tx_frames`' highest
    /// appended slot instead).
    fn next_append_frame(&self) -> u32 {
        let appended_so_far = self.tx_frames.values().copied().max().unwrap_or(self.hdr.max_frame);
        appended_so_far.max(self.hdr.max_frame) + 1
    }

    fn write_frame_at(
        &mut self,
        frame_no: u32,
        page_id: PageId,
        data: &[u8],
        db_size: u32,
        seed: [u32; 2],
    ) -> Result<()> {
        let salt = self.hdr.salt;
        let mut header_prefix = [0u8; 8];
        header_prefix[0..4].copy_from_slice(&page_id.to_le_bytes());
        header_prefix[4..8].copy_from_slice(&db_size.to_le_bytes());
        let mut unit = Vec::with_capacity(8 + data.len());
        unit.extend_from_slice(&header_prefix);
        unit.extend_from_slice(data);
        let cksum = checksum(&unit, seed);
        let fh = FrameHeader {
            page_id,
            db_size,
            salt,
            checksum: cksum,
        };
        let mut buf = vec![0u8; FRAME_HEADER_SIZE + data.len()];
        fh.write(&mut buf[0..FRAME_HEADER_SIZE]);
        buf[FRAME_HEADER_SIZE..].copy_from_slice(data);
        let offset = self.frame_offset(frame_no);
        self.wal_file.as_deref().unwrap().write_at(&buf, offset)?;
        self.running_checksum = cksum;
        Ok(())
    }

    fn rewrite_checksums_from(&mut self, start_frame: u32) -> Result<()> {
        let end_frame = self.tx_frames.values().copied().max().unwrap_or(start_frame.saturating_sub(1));
        if start_frame > end_frame {
            return Ok(());
        }
        let f = self.wal_file.as_deref().unwrap();
        let mut seed = if start_frame == 1 {
            let mut hdr_buf = [0u8; WAL_HEADER_SIZE];
            f.read_at(&mut hdr_buf, 0)?;
            WalHeader::read(&hdr_buf)?.checksum
        } else {
            let prev_off = self.frame_offset(start_frame - 1);
            let mut prev_hdr = [0u8; FRAME_HEADER_SIZE];
            f.read_at(&mut prev_hdr, prev_off)?;
            FrameHeader::read(&prev_hdr).checksum
        };
        for frame_no in start_frame..=end_frame {
            let off = self.frame_offset(frame_no);
            let mut buf = vec![0u8; FRAME_HEADER_SIZE + self.page_size as usize];
            f.read_at(&mut buf, off)?;
            let mut fh = FrameHeader::read(&buf[0..FRAME_HEADER_SIZE]);
            let mut unit = Vec::with_capacity(8 + self.page_size as usize);
            unit.extend_from_slice(&buf[0..8]);
            unit.extend_from_slice(&buf[FRAME_HEADER_SIZE..]);
            let cksum = checksum(&unit, seed);
            fh.checksum = cksum;
            fh.write(&mut buf[0..FRAME_HEADER_SIZE]);
            f.write_at(&buf[0..FRAME_HEADER_SIZE], off)?;
            seed = cksum;
        }
        self.running_checksum = seed;
        Ok(())
    }

    /// Write a page-id-sorted batch of dirty pages as the WAL frames for
    /// one commit.
    pub fn write_commit(&mut self, pages: &[(PageId, Vec<u8>)], db_size: u32) -> Result<()> {
        debug_assert!(!pages.is_empty(), "a commit always carries >=1 frame");
        for (i, (page_id, data)) in pages.iter().enumerate() {
            let is_final = i + 1 == pages.len();
            let frame_db_size = if is_final { db_size } else { 0 };
            self.write_one_frame(*page_id, data, frame_db_size)?;
        }
        let max_frame = self.hdr.max_frame.max(self.tx_frames.values().copied().max().unwrap_or(0));
        self.hdr.max_frame = max_frame;
        self.hdr.db_size = db_size;
        self.hdr.change = self.hdr.change.wrapping_add(1);
        self.hdr.frame_checksum = self.running_checksum;
        self.hdr.is_init = 1;
        self.hdr.page_size = self.page_size;
        self.publish_hdr()?;
        self.tx_frames.clear();
        Ok(())
    }

    /// Write a single non-commit frame for a page evicted mid-transaction.
    pub fn write_evicted(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.write_one_frame(page_id, data, 0)?;
        let max_frame = self.tx_frames.values().copied().max().unwrap_or(self.hdr.max_frame);
        // Not yet a commit: advance the *local* visibility watermark so the
        // same writer can see its own uncommitted write, but do not publish
        // to the shared header.
        self.hdr.max_frame = self.hdr.max_frame.max(max_frame);
        Ok(())
    }

    /// Visibility watermark for the writer's own reads: every frame
    /// appended so far in this transaction, committed or not.
    pub fn writer_watermark(&self) -> u32 {
        self.tx_frames.values().copied().max().unwrap_or(self.hdr.max_frame)
    }

    /// Abort the current writer transaction.
    pub fn rollback(&mut self) -> Result<()> {
        let shared = self.read_shared_hdr()?.unwrap_or(self.hdr);
        let old_max = self.hdr.max_frame.max(self.tx_frames.values().copied().max().unwrap_or(0));
        if old_max > shared.max_frame {
            self.index.truncate(old_max, shared.max_frame)?;
        }
        self.hdr = shared;
        self.running_checksum = shared.frame_checksum;
        self.end_writer();
        Ok(())
    }

    pub fn finish_writer(&mut self) {
        self.end_writer();
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.hdr.max_frame > NEEDS_CHECKPOINT_THRESHOLD
    }

    /// Drain committed frames back into the database file, optionally
    /// resetting the WAL if every reader has moved past the backfilled
    /// point.
    pub fn checkpoint(&mut self, reset: bool) -> Result<()> {
        self.wal_file.as_deref().unwrap().sync()?;
        let region = self.header_region()?;
        let mut mx_safe = self.hdr.max_frame;
        for slot in 1..SHM_READER_COUNT {
            let mark = ReadMarks::get(&region, slot);
            if mark != READMARK_UNUSED && mark < mx_safe {
                mx_safe = mark;
            }
        }
        let backfill = ReadMarks::backfill(&region);
        let wal_file = self.wal_file.as_deref().unwrap();
        for frame in (backfill + 1)..=mx_safe {
            let key = self.index.fetch(frame)?;
            if key == 0 {
                continue;
            }
            let off = self.frame_offset(frame);
            let mut payload = vec![0u8; self.page_size as usize];
            wal_file.read_at(&mut payload, off + FRAME_HEADER_SIZE as u64)?;
            let db_off = (key as u64 - 1) * self.page_size as u64;
            self.db_file.write_at(&payload, db_off)?;
        }
        if mx_safe > backfill {
            ReadMarks::set_backfill(&region, mx_safe);
        }
        if reset && mx_safe == self.hdr.max_frame {
            let mut bytes = [0u8; 8];
            self.env.random_bytes(&mut bytes);
            self.hdr.salt = [
                u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
                u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            ];
            self.hdr.max_frame = 0;
            self.hdr.is_init = 1;
            ReadMarks::set_backfill(&region, 0);
            for slot in 1..SHM_READER_COUNT {
                ReadMarks::set(&region, slot, READMARK_UNUSED);
            }
            self.publish_hdr()?;
        }
        self.db_file.sync()?;
        Ok(())
    }

    /// Release shared-memory mappings; delete the WAL file if it never saw
    /// a committed frame.
    pub fn close(&mut self) -> Result<()> {
        self.db_file.shm_close(self.hdr.max_frame == 0 && self.hdr.change == 0);
        if self.hdr.max_frame == 0 {
            self.wal_file = None;
            self.env.remove(&self.wal_path)?;
        } else if let Some(f) = self.wal_file.as_deref() {
            f.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_chains_deterministically() {
        let a = checksum(&[1, 0, 0, 0, 2, 0, 0, 0], [0, 0]);
        let b = checksum(&[1, 0, 0, 0, 2, 0, 0, 0], [0, 0]);
        assert_eq!(a, b);
        let c = checksum(&[3, 0, 0, 0, 4, 0, 0, 0], a);
        assert_ne!(c, a);
    }

    #[test]
    fn hash_index_hdr_detects_corruption() {
        let hdr = HashIndexHdr {
            version: 1,
            max_frame: 5,
            ..Default::default()
        };
        let mut bytes = hdr.encode();
        assert_eq!(HashIndexHdr::decode(&bytes).unwrap().max_frame, 5);
        bytes[0] ^= 1;
        assert!(HashIndexHdr::decode(&bytes).is_none());
    }
}
