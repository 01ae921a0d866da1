//! Transaction handle: bucket lookup/creation plus commit, rollback and
//! vacuum, all delegating to the one [`Pager`] a [`crate::db::Db`] owns.
//!
//! A thin wrapper that pins the `Pager` into `Read` or `Write` state for
//! its lifetime and forwards bucket operations to the schema tree's named
//! buckets.

use crate::bucket::Bucket;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::page::ROOT_PAGE;
use crate::pager::Pager;
use crate::schema::Schema;

/// A live transaction against a [`crate::db::Db`]. Dropping a `Tx` without
/// calling [`Tx::commit`] rolls back every change made through it.
pub struct Tx<'db> {
    pager: &'db mut Pager,
    writable: bool,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(pager: &'db mut Pager, writable: bool) -> Self {
        Tx { pager, writable }
    }

    fn require_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::not_supported("operation requires a read-write transaction"));
        }
        Ok(())
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Number of live key/value records across every bucket, maintained
    /// incrementally as puts and erases land.
    pub fn record_count(&self) -> u64 {
        self.pager.record_count()
    }

    /// Open an existing bucket, or `None` if `name` hasn't been created.
    pub fn bucket(&mut self, name: &[u8]) -> Result<Option<Bucket<'_>>> {
        let root = {
            let mut schema = Schema::new(self.pager);
            schema.root_of(name)?
        };
        Ok(root.map(|r| Bucket::new(self.pager, r)))
    }

    /// Open `name`, creating it first if it doesn't already exist.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<Bucket<'_>> {
        self.require_writable()?;
        if name.is_empty() {
            return Err(Error::invalid_argument("empty bucket name"));
        }
        let root = {
            let mut schema = Schema::new(self.pager);
            schema.create_bucket(name)?
        };
        Ok(Bucket::new(self.pager, root))
    }

    /// Drop `name` and every page reachable from it, returning whether it
    /// existed.
    pub fn drop_bucket(&mut self, name: &[u8]) -> Result<bool> {
        self.require_writable()?;
        Schema::new(self.pager).drop_bucket(name)
    }

    /// Names of every bucket currently in the schema, in key order.
    pub fn list_buckets(&mut self) -> Result<Vec<Vec<u8>>> {
        Schema::new(self.pager).list_buckets()
    }

    /// A cursor over the schema tree itself, walking bucket names in order.
    pub fn schema_cursor(&mut self) -> Cursor<'_> {
        Cursor::new(self.pager, ROOT_PAGE)
    }

    /// Reclaim free pages at the end of the file by relocating the
    /// highest-numbered live page into the lowest-numbered hole, one step at
    /// a time, until the freelist is empty.
    pub fn vacuum(&mut self) -> Result<()> {
        self.require_writable()?;
        while Schema::new(self.pager).vacuum_step()? {}
        Ok(())
    }

    /// Flush every dirty page into the WAL as a commit batch. Calling `commit` again with nothing further written is a
    /// no-op, matching the underlying [`Pager`]'s idempotent commit.
    pub fn commit(&mut self) -> Result<()> {
        self.require_writable()?;
        self.pager.commit()
    }

    /// Discard every change made since the transaction began, or since the
    /// last `commit`.
    pub fn rollback(&mut self) -> Result<()> {
        self.require_writable()?;
        self.pager.rollback()
    }
}

impl<'db> Drop for Tx<'db> {
    fn drop(&mut self) {
        self.pager.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{ExponentialBackoff, PosixEnv};
    use crate::pager::bootstrap_fresh_database;
    use std::sync::Arc;

    fn open_pager(dir: &tempfile::TempDir) -> Pager {
        let env = Arc::new(PosixEnv::new());
        let path = dir.path().join("t.db");
        let file = env.open(&path, true).unwrap();
        bootstrap_fresh_database(file.as_ref(), 512).unwrap();
        let file: Arc<dyn crate::env::EnvFile> = Arc::from(file);
        let busy = Box::new(ExponentialBackoff { max_attempts: 10, env: env.clone() });
        let mut pager = Pager::open(env, &path, file, 512, 64, busy).unwrap();
        pager.start_reader().unwrap();
        pager.start_writer().unwrap();
        pager
    }

    /// Each `Tx` drop returns the pager to `Open` by design, so a fresh session has to re-acquire reader and
    /// writer locks before starting the next one.
    fn resume(pager: &mut Pager) {
        pager.start_reader().unwrap();
        pager.start_writer().unwrap();
    }

    #[test]
    fn create_bucket_then_put_then_commit_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        {
            let mut tx = Tx::new(&mut pager, true);
            let mut b = tx.create_bucket(b"fruits").unwrap();
            b.put(b"apple", b"red").unwrap();
            tx.commit().unwrap();
        }
        resume(&mut pager);
        let mut tx = Tx::new(&mut pager, true);
        let mut b = tx.bucket(b"fruits").unwrap().unwrap();
        assert_eq!(b.get(b"apple").unwrap(), Some(b"red".to_vec()));
    }

    #[test]
    fn dropping_an_uncommitted_tx_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        {
            let mut tx = Tx::new(&mut pager, true);
            let mut b = tx.create_bucket(b"fruits").unwrap();
            b.put(b"apple", b"red").unwrap();
            tx.commit().unwrap();
        }
        resume(&mut pager);
        {
            let mut tx = Tx::new(&mut pager, true);
            let mut b = tx.bucket(b"fruits").unwrap().unwrap();
            b.put(b"apple", b"green").unwrap();
            b.put(b"banana", b"yellow").unwrap();
            // tx dropped here without a commit: both writes above should
            // vanish.
        }
        resume(&mut pager);
        let mut tx = Tx::new(&mut pager, true);
        let mut b = tx.bucket(b"fruits").unwrap().unwrap();
        assert_eq!(b.get(b"apple").unwrap(), Some(b"red".to_vec()));
        assert_eq!(b.get(b"banana").unwrap(), None);
    }

    #[test]
    fn bucket_lookup_on_missing_name_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        let mut tx = Tx::new(&mut pager, true);
        assert!(tx.bucket(b"nope").unwrap().is_none());
    }

    #[test]
    fn read_only_tx_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        let mut tx = Tx::new(&mut pager, false);
        assert!(tx.create_bucket(b"fruits").is_err());
    }
}
