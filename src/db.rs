//! Top-level database handle: open/create/destroy lifecycle and the
//! `update`/`view` entry points that hand a caller a scoped [`Tx`].
//!
//! A single long-lived handle that owns the on-disk resources and the
//! WAL-backed [`Pager`], minting short-lived transaction objects on demand.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::config::{DbOptions, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::env::{Env, EnvFile, LockLevel};
use crate::error::{Error, Result};
use crate::pager::{bootstrap_fresh_database, Pager};
use crate::tx::Tx;

fn wal_path_for(db_path: &Path) -> PathBuf {
    let mut s = db_path.as_os_str().to_os_string();
    s.push("-wal");
    PathBuf::from(s)
}

fn shm_path_for(db_path: &Path) -> PathBuf {
    let mut s = db_path.as_os_str().to_os_string();
    s.push("-shm");
    PathBuf::from(s)
}

/// A handful of counters surfaced by [`Db::get_property`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub page_count: u32,
    pub record_count: u64,
    pub freelist_pages: u32,
}

/// An open connection to a CalicoDB file.
pub struct Db {
    env: Arc<dyn Env>,
    path: PathBuf,
    pager: Pager,
}

impl Db {
    /// Open (optionally creating) the database file at `path`.
    pub fn open(options: DbOptions, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if options.page_size < MIN_PAGE_SIZE
            || options.page_size > MAX_PAGE_SIZE
            || !options.page_size.is_power_of_two()
        {
            return Err(Error::invalid_argument(
                "page size must be a power of two between 512 and 65536",
            ));
        }

        let env = options.env();
        let existed = env.exists(&path);
        if existed && options.error_if_exists {
            return Err(Error::invalid_argument("database file already exists"));
        }
        if !existed && !options.create_if_missing {
            return Err(Error::NotFound);
        }

        let file: Arc<dyn EnvFile> = Arc::from(env.open(&path, options.create_if_missing)?);
        let is_fresh = file.len()? == 0;
        if is_fresh {
            debug!("bootstrapping fresh database at {}", path.display());
            file.try_lock(LockLevel::Exclusive)?;
            let result = bootstrap_fresh_database(file.as_ref(), options.page_size);
            file.unlock(LockLevel::Unlocked)?;
            result?;
            // An interrupted previous create could have left a WAL behind
            // that refers to a page size or layout the fresh header above
            // doesn't match; a brand new file can't have anything worth
            // recovering; log-page-size.
            let wal_path = wal_path_for(&path);
            if env.exists(&wal_path) {
                env.remove(&wal_path)?;
            }
            let shm_path = shm_path_for(&path);
            if env.exists(&shm_path) {
                env.remove(&shm_path)?;
            }
        }

        let page_size = read_page_size(file.as_ref())?;
        let busy = options.new_busy_handler(env.clone());
        let pager = Pager::open(env.clone(), &path, file, page_size, options.cache_size, busy)?;

        info!(
            "opened {} (page_size={}, cache_size={})",
            path.display(),
            page_size,
            options.cache_size
        );
        Ok(Db { env, path, pager })
    }

    /// Remove a database file and any WAL/shared-memory files beside it.
    /// Succeeds even if the file doesn't exist.
    pub fn destroy(options: DbOptions, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let env = options.env();
        if env.exists(path) {
            env.remove(path)?;
        }
        let wal_path = wal_path_for(path);
        if env.exists(&wal_path) {
            env.remove(&wal_path)?;
        }
        let shm_path = shm_path_for(path);
        if env.exists(&shm_path) {
            env.remove(&shm_path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn env(&self) -> &Arc<dyn Env> {
        &self.env
    }

    /// Run `f` against a fresh read-write transaction. `f`'s return value is
    /// the commit/rollback decision: `Ok` commits, `Err` rolls back.
    pub fn update<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T>,
    {
        self.pager.start_reader()?;
        self.pager.start_writer()?;
        let mut tx = Tx::new(&mut self.pager, true);
        let outcome = f(&mut tx);
        if outcome.is_ok() {
            tx.commit()?;
        }
        outcome
    }

    /// Run `f` against a read-only snapshot; any attempted mutation inside
    /// `f` fails with [`Error::NotSupported`].
    pub fn view<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T>,
    {
        self.pager.start_reader()?;
        let mut tx = Tx::new(&mut self.pager, false);
        f(&mut tx)
    }

    /// Move WAL frames back into the database file, optionally resetting
    /// the WAL to empty once every reader has released it.
    pub fn checkpoint(&mut self, reset: bool) -> Result<()> {
        self.pager.checkpoint(reset)
    }

    /// A small set of point-in-time counters.
    pub fn stats(&mut self) -> Result<Stats> {
        Ok(Stats {
            page_count: self.pager.page_count(),
            record_count: self.pager.record_count(),
            freelist_pages: self.pager.freelist_len()?,
        })
    }

    /// String-keyed status lookups, an escape hatch for ad hoc diagnostics.
    pub fn get_property(&mut self, name: &str) -> Option<String> {
        match name {
            "stats" => {
                let s = self.stats().ok()?;
                Some(format!(
                    "page_count={} record_count={} freelist_pages={}",
                    s.page_count, s.record_count, s.freelist_pages
                ))
            }
            "page_size" => Some(self.pager.page_size().to_string()),
            _ => None,
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.pager.close();
    }
}

fn read_page_size(file: &dyn EnvFile) -> Result<u32> {
    let mut buf = [0u8; crate::file_header::FILE_HEADER_SIZE];
    file.read_at(&mut buf, 0)?;
    let hdr = crate::file_header::FileHeader::read(&buf)?;
    Ok(hdr.page_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbOptions;

    #[test]
    fn open_create_put_get_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round_trip.db");

        let mut db = Db::open(DbOptions::default(), &path).unwrap();
        db.update(|tx| {
            let mut b = tx.create_bucket(b"fruits")?;
            b.put(b"apple", b"red")?;
            b.put(b"banana", b"yellow")?;
            Ok(())
        })
        .unwrap();
        drop(db);

        let mut opts = DbOptions::default();
        opts.create_if_missing = false;
        let mut db = Db::open(opts, &path).unwrap();
        db.view(|tx| {
            let mut b = tx.bucket(b"fruits")?.expect("bucket survives reopen");
            assert_eq!(b.get(b"apple")?, Some(b"red".to_vec()));
            assert_eq!(b.get(b"banana")?, Some(b"yellow".to_vec()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn update_rolls_back_when_closure_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollback.db");
        let mut db = Db::open(DbOptions::default(), &path).unwrap();

        db.update(|tx| {
            let mut b = tx.create_bucket(b"fruits")?;
            b.put(b"apple", b"red")?;
            Ok(())
        })
        .unwrap();

        let err = db.update(|tx| -> Result<()> {
            let mut b = tx.bucket(b"fruits")?.unwrap();
            b.put(b"apple", b"green")?;
            Err(Error::invalid_argument("force rollback"))
        });
        assert!(err.is_err());

        db.view(|tx| {
            let mut b = tx.bucket(b"fruits")?.unwrap();
            assert_eq!(b.get(b"apple")?, Some(b"red".to_vec()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn view_rejects_bucket_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readonly.db");
        let mut db = Db::open(DbOptions::default(), &path).unwrap();
        let err = db.view(|tx| tx.create_bucket(b"fruits").map(|_| ()));
        assert!(err.is_err());
    }

    #[test]
    fn open_missing_without_create_if_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let mut opts = DbOptions::default();
        opts.create_if_missing = false;
        assert!(Db::open(opts, &path).is_err());
    }

    #[test]
    fn error_if_exists_rejects_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exists.db");
        Db::open(DbOptions::default(), &path).unwrap();
        let mut opts = DbOptions::default();
        opts.error_if_exists = true;
        assert!(Db::open(opts, &path).is_err());
    }

    #[test]
    fn checkpoint_after_commit_does_not_lose_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.db");
        let mut db = Db::open(DbOptions::default(), &path).unwrap();
        db.update(|tx| {
            let mut b = tx.create_bucket(b"fruits")?;
            b.put(b"apple", b"red")?;
            Ok(())
        })
        .unwrap();
        db.checkpoint(true).unwrap();
        db.view(|tx| {
            let mut b = tx.bucket(b"fruits")?.unwrap();
            assert_eq!(b.get(b"apple")?, Some(b"red".to_vec()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn stats_freelist_pages_tracks_erased_overflow_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db");
        let mut opts = DbOptions::default();
        opts.page_size = 512;
        let mut db = Db::open(opts, &path).unwrap();

        db.update(|tx| {
            let mut b = tx.create_bucket(b"blobs")?;
            b.put(b"big", &vec![0xabu8; 4000])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.stats().unwrap().freelist_pages, 0);

        db.update(|tx| {
            let mut b = tx.bucket(b"blobs")?.unwrap();
            assert!(b.erase(b"big")?);
            Ok(())
        })
        .unwrap();

        assert!(db.stats().unwrap().freelist_pages > 0);
    }
}
