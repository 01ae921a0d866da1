//! An embedded, single-file, transactional key/value store.
//!
//! A [`Db`] owns one database file plus its write-ahead log; [`Db::update`]
//! and [`Db::view`] hand out a [`Tx`] scoped to a closure, committing or
//! rolling back when it returns. A `Tx` opens named [`Bucket`]s, each an
//! independent B+-tree; a [`Cursor`] walks a bucket's keys in order.
//!
//! ```no_run
//! use calicodb::{Db, DbOptions};
//!
//! let mut db = Db::open(DbOptions::default(), "example.db")?;
//! db.update(|tx| {
//!     let mut fruits = tx.create_bucket(b"fruits")?;
//!     fruits.put(b"apple", b"red")?;
//!     Ok(())
//! })?;
//! db.view(|tx| {
//!     let mut fruits = tx.bucket(b"fruits")?.expect("created above");
//!     assert_eq!(fruits.get(b"apple")?, Some(b"red".to_vec()));
//!     Ok(())
//! })?;
//! # Ok::<(), calicodb::Error>(())
//! ```

mod bucket;
mod config;
mod cursor;
mod db;
mod env;
mod error;
mod file_header;
mod node;
mod page;
mod pager;
mod pointer_map;
mod schema;
mod tree;
mod tx;
mod wal;

pub use bucket::Bucket;
pub use config::{DbOptions, LockMode, SyncMode};
pub use cursor::Cursor;
pub use db::{Db, Stats};
pub use env::{BusyHandler, Env, EnvFile, ExponentialBackoff, PosixEnv};
pub use error::{AbortReason, Error, Result};
pub use page::PageId;
pub use tx::Tx;
