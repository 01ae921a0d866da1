//! A bucket: one named B+-tree reachable from a [`crate::tx::Tx`].
//!
//! A handle that forwards key operations to the underlying tree; each
//! bucket carries its own root page id instead of assuming a single fixed
//! table.

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::page::PageId;
use crate::pager::Pager;
use crate::pointer_map::{PtrMapEntry, PtrMapType};
use crate::tree::{free_bucket_subtree, Tree};

fn decode_nested_root(value: &[u8]) -> Result<PageId> {
    if value.len() != 4 {
        return Err(Error::corruption("malformed nested bucket root"));
    }
    Ok(u32::from_le_bytes(value.try_into().unwrap()))
}

/// A handle onto one bucket's key space, borrowed for as long as it's in use
/// from the [`crate::tx::Tx`] that opened it.
pub struct Bucket<'tx> {
    pager: &'tx mut Pager,
    root: PageId,
}

impl<'tx> Bucket<'tx> {
    pub(crate) fn new(pager: &'tx mut Pager, root: PageId) -> Self {
        Bucket { pager, root }
    }

    pub(crate) fn root(&self) -> PageId {
        self.root
    }

    fn tree(&mut self) -> Tree<'_> {
        Tree::new(self.pager, self.root)
    }

    /// Look up `key`, returning its value if present.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Err(Error::invalid_argument("empty key"));
        }
        self.tree().get(key)
    }

    /// Insert or overwrite `key`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid_argument("empty key"));
        }
        self.tree().put(key, value)
    }

    /// Remove `key`, reporting whether it was present.
    pub fn erase(&mut self, key: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::invalid_argument("empty key"));
        }
        self.tree().erase(key)
    }

    /// Open a cursor over this bucket's key space.
    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor::new(self.pager, self.root)
    }

    /// Open a bucket nested inside this one, or `None` if `name` hasn't
    /// been created.
    pub fn bucket(&mut self, name: &[u8]) -> Result<Option<Bucket<'_>>> {
        if name.is_empty() {
            return Err(Error::invalid_argument("empty bucket name"));
        }
        match self.tree().get_with_flag(name)? {
            Some((value, true)) => Ok(Some(Bucket::new(self.pager, decode_nested_root(&value)?))),
            Some((_, false)) => Err(Error::invalid_argument("key exists but is not a bucket")),
            None => Ok(None),
        }
    }

    /// Open a bucket nested inside this one, creating it first if it
    /// doesn't already exist.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<Bucket<'_>> {
        if name.is_empty() {
            return Err(Error::invalid_argument("empty bucket name"));
        }
        let root = match self.tree().get_with_flag(name)? {
            Some((value, true)) => decode_nested_root(&value)?,
            Some((_, false)) => return Err(Error::invalid_argument("key exists but is not a bucket")),
            None => {
                let root = self.pager.allocate_page()?;
                let slot = self.pager.acquire(root)?;
                self.pager.write_node(slot, &Node::new_leaf(root))?;
                self.pager.release(slot);
                self.tree().put_bucket(name, root)?;
                self.pager.ptrmap_put(
                    root,
                    PtrMapEntry {
                        entry_type: PtrMapType::TreeRoot,
                        back_ptr: 0,
                    },
                )?;
                root
            }
        };
        Ok(Bucket::new(self.pager, root))
    }

    /// Drop a nested bucket and every page reachable from it, returning
    /// whether it existed.
    pub fn drop_bucket(&mut self, name: &[u8]) -> Result<bool> {
        if name.is_empty() {
            return Err(Error::invalid_argument("empty bucket name"));
        }
        match self.tree().get_with_flag(name)? {
            Some((value, true)) => {
                let root = decode_nested_root(&value)?;
                free_bucket_subtree(self.pager, root)?;
                self.tree().erase(name)?;
                Ok(true)
            }
            Some((_, false)) => Err(Error::invalid_argument("key exists but is not a bucket")),
            None => Ok(false),
        }
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
    fn create_bucket_nests_a_tree_inside_another() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        let mut outer = Bucket::new(&mut pager, crate::page::ROOT_PAGE);
        {
            let mut inner = outer.create_bucket(b"inner").unwrap();
            inner.put(b"k", b"v").unwrap();
        }
        let mut inner = outer.bucket(b"inner").unwrap().expect("nested bucket exists");
        assert_eq!(inner.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(outer.get(b"inner").unwrap(), None, "the nested root isn't an ordinary value");
    }

    #[test]
    fn bucket_lookup_on_missing_nested_name_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        let mut outer = Bucket::new(&mut pager, crate::page::ROOT_PAGE);
        assert!(outer.bucket(b"nope").unwrap().is_none());
    }

    #[test]
    fn put_on_a_nested_bucket_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        let mut outer = Bucket::new(&mut pager, crate::page::ROOT_PAGE);
        outer.create_bucket(b"inner").unwrap();
        assert!(outer.bucket(b"inner").is_ok());
        assert!(outer.create_bucket(b"inner").is_ok(), "re-creating an existing bucket is idempotent");
        outer.put(b"plain", b"x").unwrap();
        assert!(outer.create_bucket(b"plain").is_err());
    }

    #[test]
    fn drop_bucket_frees_nested_pages_and_erases_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        let mut outer = Bucket::new(&mut pager, crate::page::ROOT_PAGE);
        {
            let mut inner = outer.create_bucket(b"inner").unwrap();
            inner.put(b"a", &vec![0x22u8; 4000]).unwrap();
        }
        assert!(outer.drop_bucket(b"inner").unwrap());
        assert!(outer.bucket(b"inner").unwrap().is_none());
        assert!(!outer.drop_bucket(b"inner").unwrap());
    }
}
