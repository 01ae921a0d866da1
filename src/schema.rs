//! The schema tree: a B+-tree rooted at page 1 that maps bucket names to
//! their own root page id.
//!
//! Modeled as an ordinary `Tree` (so bucket lookups get the same
//! overflow/search machinery as user data) instead of a bespoke
//! fixed-layout catalog table.

use crate::error::{Error, Result};
use crate::node::Node;
use crate::page::{PageId, ROOT_PAGE};
use crate::pager::Pager;
use crate::tree::{free_bucket_subtree, vacuum_one, RelocatedPage, Tree};

/// Bucket value record stored in the schema tree: one flag byte (reserved
/// for future bucket options) followed by the root id, little-endian.
const RECORD_LEN: usize = 5;

fn encode_root(root: PageId) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[1..5].copy_from_slice(&root.to_le_bytes());
    buf
}

fn decode_root(bytes: &[u8]) -> Result<PageId> {
    if bytes.len() != RECORD_LEN {
        return Err(Error::corruption("malformed bucket record in schema tree"));
    }
    Ok(u32::from_le_bytes(bytes[1..5].try_into().unwrap()))
}

fn decode_nested_root(value: &[u8]) -> Result<PageId> {
    if value.len() != 4 {
        return Err(Error::corruption("malformed nested bucket root"));
    }
    Ok(u32::from_le_bytes(value.try_into().unwrap()))
}

/// Search every bucket nested (at any depth) under the tree rooted at
/// `tree_root` for one whose stored root id is `old_id`, rewriting it to
/// `new_id` if found.
/// `vacuum_one` marks every bucket root, nested or not, with the same
/// `PtrMapType::TreeRoot` entry, so a relocation can land on a root buried
/// arbitrarily deep; the schema tree alone only sees the top level.
fn find_and_fix_nested_root(
    pager: &mut Pager,
    tree_root: PageId,
    old_id: PageId,
    new_id: PageId,
) -> Result<bool> {
    let nested: Vec<(Vec<u8>, PageId)> = {
        let mut tree = Tree::new(pager, tree_root);
        let mut out = Vec::new();
        let mut cursor = tree.seek_first()?;
        while let Some((key, _)) = cursor {
            if tree.is_bucket_key(&key)?.unwrap_or(false) {
                let value = tree.get(&key)?.expect("key just seen by the cursor");
                out.push((key.clone(), decode_nested_root(&value)?));
            }
            cursor = tree.next_after(&key)?;
        }
        out
    };
    for (key, child_root) in nested {
        if child_root == old_id {
            Tree::new(pager, tree_root).put_bucket(&key, new_id)?;
            return Ok(true);
        }
        if find_and_fix_nested_root(pager, child_root, old_id, new_id)? {
            return Ok(true);
        }
    }
    Ok(false)
}

pub struct Schema<'p> {
    pager: &'p mut Pager,
}

impl<'p> Schema<'p> {
    pub fn new(pager: &'p mut Pager) -> Self {
        Schema { pager }
    }

    fn tree(&mut self) -> Tree<'_> {
        Tree::new(self.pager, ROOT_PAGE)
    }

    pub fn root_of(&mut self, name: &[u8]) -> Result<Option<PageId>> {
        match self.tree().get(name)? {
            Some(bytes) => Ok(Some(decode_root(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Create `name` if it doesn't already exist, returning its root page
    /// id either way.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<PageId> {
        if let Some(root) = self.root_of(name)? {
            return Ok(root);
        }
        let root = self.pager.allocate_page()?;
        // A freshly allocated page is a zeroed frame, not a valid node: its
        // first byte would parse as `is_external = false`, i.e. an internal
        // node with no cells and `next_id = 0`. Stamp it as an empty leaf
        // before anything can descend into it.
        let slot = self.pager.acquire(root)?;
        self.pager.write_node(slot, &Node::new_leaf(root))?;
        self.pager.release(slot);
        self.tree().put(name, &encode_root(root))?;
        self.pager.ptrmap_put(
            root,
            crate::pointer_map::PtrMapEntry {
                entry_type: crate::pointer_map::PtrMapType::TreeRoot,
                back_ptr: 0,
            },
        )?;
        Ok(root)
    }

    /// Drop `name` and every page reachable from its tree, including any
    /// buckets nested inside it. The freed pages land on the freelist; vacuum later
    /// reclaims the space they leave behind in the file.
    pub fn drop_bucket(&mut self, name: &[u8]) -> Result<bool> {
        let root = match self.root_of(name)? {
            Some(r) => r,
            None => return Ok(false),
        };
        free_bucket_subtree(self.pager, root)?;
        self.tree().erase(name)?;
        Ok(true)
    }

    pub fn list_buckets(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut names = Vec::new();
        let mut tree = self.tree();
        let mut cursor = tree.seek_first()?;
        while let Some((k, _)) = cursor {
            let next = tree.next_after(&k)?;
            names.push(k);
            cursor = next;
        }
        Ok(names)
    }

    /// Relocate one page during vacuum, fixing up the owning bucket's root
    /// record if the moved page was itself a root, wherever in the bucket
    /// nesting it lives.
    pub fn vacuum_step(&mut self) -> Result<bool> {
        match vacuum_one(self.pager)? {
            Some(RelocatedPage::Root { old_id, new_id }) => {
                self.retarget_root(old_id, new_id)?;
                Ok(true)
            }
            None => Ok(self.pager.freelist_head() != crate::page::NULL_PAGE),
        }
    }

    fn retarget_root(&mut self, old_id: PageId, new_id: PageId) -> Result<()> {
        let names = self.list_buckets()?;
        for name in &names {
            if self.root_of(name)? == Some(old_id) {
                self.tree().put(name, &encode_root(new_id))?;
                return Ok(());
            }
        }
        // Not a top-level bucket root: it may be a bucket nested inside one
        // of these, at any depth.
        for name in &names {
            if let Some(root) = self.root_of(name)? {
                if find_and_fix_nested_root(self.pager, root, old_id, new_id)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Bucket;
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
    fn vacuum_retargets_a_relocated_nested_bucket_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = open_pager(&dir);
        let outer_root = Schema::new(&mut pager).create_bucket(b"outer").unwrap();

        // Push the page count up with a throwaway bucket whose pages sit
        // below where the nested bucket will land.
        let junk_root = Schema::new(&mut pager).create_bucket(b"junk").unwrap();
        {
            let mut junk = Bucket::new(&mut pager, junk_root);
            for i in 0..100u32 {
                junk.put(format!("k{i:04}").as_bytes(), &vec![0x11u8; 200]).unwrap();
            }
        }

        // Nothing is allocated after this, so the nested bucket's root page
        // is the current highest page in the file.
        let inner_root_before = {
            let mut outer = Bucket::new(&mut pager, outer_root);
            let mut inner = outer.create_bucket(b"inner").unwrap();
            inner.put(b"k", b"v").unwrap();
            inner.root()
        };
        assert_eq!(inner_root_before, pager.page_count());

        // Dropping junk frees pages below the nested root, giving vacuum
        // somewhere to relocate it into.
        Schema::new(&mut pager).drop_bucket(b"junk").unwrap();

        let mut schema = Schema::new(&mut pager);
        while schema.vacuum_step().unwrap() {}

        assert!(pager.page_count() < inner_root_before, "the nested root's page should have moved down");

        let mut outer = Bucket::new(&mut pager, outer_root);
        let mut inner = outer.bucket(b"inner").unwrap().expect("nested bucket still reachable");
        assert_ne!(inner.root(), inner_root_before);
        assert_eq!(inner.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
