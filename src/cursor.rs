//! Cursor over a bucket's key space.
//!
//! A cursor never holds a page pin or a cached tree path between calls: it
//! remembers only the last key it was positioned on and re-descends the
//! tree from the root on every `next`/`previous`/`seek`. That invariant holds *by construction* here —
//! there is no cached state for a split, merge, or vacuum to invalidate —
//! at the cost of an extra root-to-leaf descent per step compared to a
//! cursor that keeps its leaf pinned. Recorded as an Open Question
//! resolution in DESIGN.md.

use crate::error::{Error, Result};
use crate::pager::Pager;
use crate::tree::Tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Unpositioned,
    At,
    Exhausted,
}

pub struct Cursor<'p> {
    pager: &'p mut Pager,
    root: crate::page::PageId,
    position: Position,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl<'p> Cursor<'p> {
    pub(crate) fn new(pager: &'p mut Pager, root: crate::page::PageId) -> Self {
        Cursor {
            pager,
            root,
            position: Position::Unpositioned,
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    fn tree(&mut self) -> Tree<'_> {
        Tree::new(self.pager, self.root)
    }

    fn land(&mut self, found: Option<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        match found {
            Some((k, v)) => {
                self.key = k;
                self.value = v;
                self.position = Position::At;
            }
            None => {
                self.position = Position::Exhausted;
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.position == Position::At
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.is_valid().then_some(self.key.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.is_valid().then_some(self.value.as_slice())
    }

    pub fn seek_first(&mut self) -> Result<()> {
        let found = self.tree().seek_first()?;
        self.land(found)
    }

    pub fn seek_last(&mut self) -> Result<()> {
        let found = self.tree().seek_last()?;
        self.land(found)
    }

    /// Position on the smallest stored key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid_argument("empty key"));
        }
        let found = self.tree().seek(key)?;
        self.land(found)
    }

    /// Position exactly on `key`, or become invalid.
    pub fn find(&mut self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid_argument("empty key"));
        }
        let found = match self.tree().get(key)? {
            Some(v) => Some((key.to_vec(), v)),
            None => None,
        };
        self.land(found)
    }

    pub fn next(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::not_supported("cursor is not positioned"));
        }
        let key = self.key.clone();
        let found = self.tree().next_after(&key)?;
        self.land(found)
    }

    pub fn previous(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::not_supported("cursor is not positioned"));
        }
        let key = self.key.clone();
        let found = self.tree().prev_before(&key)?;
        self.land(found)
    }

    /// Whether the cursor's current entry is a nested bucket rather than an
    /// ordinary value. Looks the
    /// flag up fresh from the current key, matching this cursor's choice to
    /// never cache anything stronger than a key across calls.
    pub fn is_bucket(&mut self) -> Result<bool> {
        if !self.is_valid() {
            return Err(Error::not_supported("cursor is not positioned"));
        }
        let key = self.key.clone();
        Ok(self.tree().is_bucket_key(&key)?.unwrap_or(false))
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

    #[test]
    fn cursor_walks_forward_and_backward() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        {
            let mut tree = Tree::new(&mut pager, crate::page::ROOT_PAGE);
            for k in ["a", "b", "c"] {
                tree.put(k.as_bytes(), b"x").unwrap();
            }
        }
        let mut cursor = Cursor::new(&mut pager, crate::page::ROOT_PAGE);
        cursor.seek_first().unwrap();
        assert_eq!(cursor.key(), Some(b"a".as_slice()));
        cursor.next().unwrap();
        assert_eq!(cursor.key(), Some(b"b".as_slice()));
        cursor.previous().unwrap();
        assert_eq!(cursor.key(), Some(b"a".as_slice()));
    }

    #[test]
    fn is_bucket_reflects_the_cells_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        {
            let mut tree = Tree::new(&mut pager, crate::page::ROOT_PAGE);
            tree.put(b"plain", b"x").unwrap();
            tree.put_bucket(b"sub", 99).unwrap();
        }
        let mut cursor = Cursor::new(&mut pager, crate::page::ROOT_PAGE);
        cursor.find(b"plain").unwrap();
        assert!(!cursor.is_bucket().unwrap());
        cursor.find(b"sub").unwrap();
        assert!(cursor.is_bucket().unwrap());
    }

    #[test]
    fn find_on_missing_key_invalidates_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        let mut cursor = Cursor::new(&mut pager, crate::page::ROOT_PAGE);
        cursor.find(b"nope").unwrap();
        assert!(!cursor.is_valid());
    }
}
