// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Deduplicating string dictionary with dense 32-bit ids, plus the
//! per-column search index built on top of it.
//!
//! Persistent shape (a `has_refs` parent):
//!
//! ```text
//! slot 0  strings leaf (id -> string, append only)
//! slot 1  id array sorted by string order (dedup + prefix ranges)
//! ```
//!
//! During a write transaction, freshly interned strings live in slab
//! nodes like any other CoW state; a per-transaction hash cache fronts
//! the binary search.

use crate::alloc::{Ref, SlabAlloc};
use crate::array::Array;
use crate::keys::ObjKey;
use crate::leaf::{BacklinkLeaf, LeafOps, StringLeaf};
use crate::node::NodeFlags;
use crate::value::Value;
use crate::{Error, Result};
use rustc_hash::FxHashMap;

/// Dense id of an interned string
pub type StringId = u32;

/// The group-wide string interner
#[derive(Debug)]
pub struct Interner {
    parent: Array,

    /// Per-transaction overlay so repeated interns skip the tree walk
    cache: FxHashMap<String, StringId>,
}

impl Interner {
    /// Creates an empty interner.
    pub fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        let strings = StringLeaf::create(alloc, false)?;
        let order = Array::create(alloc, NodeFlags::default(), 0, 0)?;

        let mut parent = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
        parent.push(alloc, strings.root() as i64)?;
        parent.push(alloc, order.root() as i64)?;

        Ok(Self {
            parent,
            cache: FxHashMap::default(),
        })
    }

    /// Attaches to an existing interner node.
    #[must_use]
    pub fn from_ref(root: Ref) -> Self {
        Self {
            parent: Array::from_ref(root),
            cache: FxHashMap::default(),
        }
    }

    /// Current root ref.
    #[must_use]
    pub fn root(&self) -> Ref {
        self.parent.root()
    }

    /// Number of interned strings.
    pub fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.strings(alloc)?.len(alloc)
    }

    /// Returns `true` if nothing is interned.
    pub fn is_empty(&self, alloc: &SlabAlloc) -> Result<bool> {
        Ok(self.len(alloc)? == 0)
    }

    fn strings(&self, alloc: &SlabAlloc) -> Result<StringLeaf> {
        Ok(StringLeaf::attach(self.parent.get_ref(alloc, 0)?, false))
    }

    fn order(&self, alloc: &SlabAlloc) -> Result<Array> {
        Ok(Array::from_ref(self.parent.get_ref(alloc, 1)?))
    }

    /// Resolves an id back to its string.
    pub fn resolve(&self, alloc: &SlabAlloc, id: StringId) -> Result<String> {
        match self.strings(alloc)?.get(alloc, id as usize)? {
            Value::String(s) => Ok(s),
            _ => Err(Error::corrupt("interner slot is not a string")),
        }
    }

    /// Position in the sorted order where `s` is (or would be inserted).
    fn order_position(
        &self,
        alloc: &SlabAlloc,
        s: &str,
    ) -> Result<std::result::Result<usize, usize>> {
        let order = self.order(alloc)?;
        let n = order.len(alloc)?;

        let mut left = 0usize;
        let mut right = n;
        while left < right {
            let mid = (left + right) / 2;
            let id = order.get(alloc, mid)? as StringId;
            if self.resolve(alloc, id)?.as_str() < s {
                left = mid + 1;
            } else {
                right = mid;
            }
        }

        if left < n {
            let id = order.get(alloc, left)? as StringId;
            if self.resolve(alloc, id)? == s {
                return Ok(Ok(left));
            }
        }

        Ok(Err(left))
    }

    /// Looks up a string without interning it.
    pub fn lookup(&self, alloc: &SlabAlloc, s: &str) -> Result<Option<StringId>> {
        if let Some(&id) = self.cache.get(s) {
            return Ok(Some(id));
        }

        match self.order_position(alloc, s)? {
            Ok(pos) => Ok(Some(self.order(alloc)?.get(alloc, pos)? as StringId)),
            Err(_) => Ok(None),
        }
    }

    /// Interns `s`, returning its dense id (existing id when already
    /// present).
    pub fn intern(&mut self, alloc: &mut SlabAlloc, s: &str) -> Result<StringId> {
        if let Some(&id) = self.cache.get(s) {
            return Ok(id);
        }

        let insert_at = match self.order_position(alloc, s)? {
            Ok(pos) => {
                let id = self.order(alloc)?.get(alloc, pos)? as StringId;
                self.cache.insert(s.to_owned(), id);
                return Ok(id);
            }
            Err(pos) => pos,
        };

        let mut strings = self.strings(alloc)?;
        let id = strings.len(alloc)? as StringId;
        strings.insert(alloc, id as usize, &Value::String(s.to_owned()))?;
        self.parent.set_ref(alloc, 0, strings.root())?;

        let mut order = self.order(alloc)?;
        order.insert(alloc, insert_at, i64::from(id))?;
        self.parent.set_ref(alloc, 1, order.root())?;

        self.cache.insert(s.to_owned(), id);
        log::trace!("interned {s:?} as id {id}");
        Ok(id)
    }

    /// All ids whose strings start with `prefix`, in string order.
    pub fn ids_with_prefix(&self, alloc: &SlabAlloc, prefix: &str) -> Result<Vec<StringId>> {
        let order = self.order(alloc)?;
        let n = order.len(alloc)?;

        let start = match self.order_position(alloc, prefix)? {
            Ok(pos) | Err(pos) => pos,
        };

        let mut out = Vec::new();
        for i in start..n {
            let id = order.get(alloc, i)? as StringId;
            if !self.resolve(alloc, id)?.starts_with(prefix) {
                break;
            }
            out.push(id);
        }
        Ok(out)
    }
}

/// Search index of one string column: interned string -> the set of
/// object keys holding it
///
/// Shape (a `has_refs` parent):
///
/// ```text
/// slot 0  sorted array of indexed string ids
/// slot 1  posting sets, parallel to slot 0 (same slot encoding as
///         backlink columns: none / tagged single key / key array)
/// ```
#[derive(Debug)]
pub struct SearchIndex {
    parent: Array,
}

impl SearchIndex {
    /// Creates an empty index.
    pub fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        let ids = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let posts = BacklinkLeaf::create(alloc)?;

        let mut parent = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
        parent.push(alloc, ids.root() as i64)?;
        parent.push(alloc, posts.root() as i64)?;

        Ok(Self { parent })
    }

    /// Attaches to an existing index node.
    #[must_use]
    pub fn from_ref(root: Ref) -> Self {
        Self {
            parent: Array::from_ref(root),
        }
    }

    /// Current root ref.
    #[must_use]
    pub fn root(&self) -> Ref {
        self.parent.root()
    }

    fn ids(&self, alloc: &SlabAlloc) -> Result<Array> {
        Ok(Array::from_ref(self.parent.get_ref(alloc, 0)?))
    }

    fn posts(&self, alloc: &SlabAlloc) -> Result<BacklinkLeaf> {
        Ok(BacklinkLeaf::attach(self.parent.get_ref(alloc, 1)?))
    }

    fn slot_of(&self, alloc: &SlabAlloc, id: StringId) -> Result<std::result::Result<usize, usize>> {
        let ids = self.ids(alloc)?;
        let n = ids.len(alloc)?;

        let mut left = 0usize;
        let mut right = n;
        while left < right {
            let mid = (left + right) / 2;
            if ids.get(alloc, mid)? < i64::from(id) {
                left = mid + 1;
            } else {
                right = mid;
            }
        }

        if left < n && ids.get(alloc, left)? == i64::from(id) {
            Ok(Ok(left))
        } else {
            Ok(Err(left))
        }
    }

    /// Records that `key` holds the string `id`.
    pub fn add(&mut self, alloc: &mut SlabAlloc, id: StringId, key: ObjKey) -> Result<()> {
        let slot = match self.slot_of(alloc, id)? {
            Ok(slot) => slot,
            Err(insert_at) => {
                let mut ids = self.ids(alloc)?;
                ids.insert(alloc, insert_at, i64::from(id))?;
                self.parent.set_ref(alloc, 0, ids.root())?;

                let mut posts = self.posts(alloc)?;
                posts.insert(alloc, insert_at, &Value::Null)?;
                self.parent.set_ref(alloc, 1, posts.root())?;

                insert_at
            }
        };

        let mut posts = self.posts(alloc)?;
        posts.add(alloc, slot, key)?;
        self.parent.set_ref(alloc, 1, posts.root())
    }

    /// Removes the record of `key` holding `id`.
    pub fn remove(&mut self, alloc: &mut SlabAlloc, id: StringId, key: ObjKey) -> Result<()> {
        let slot = match self.slot_of(alloc, id)? {
            Ok(slot) => slot,
            Err(_) => return Err(Error::corrupt("search index out of sync")),
        };

        let mut posts = self.posts(alloc)?;
        posts.remove(alloc, slot, key)?;

        if posts.count(alloc, slot)? == 0 {
            posts.erase(alloc, slot)?;
            self.parent.set_ref(alloc, 1, posts.root())?;

            let mut ids = self.ids(alloc)?;
            ids.erase(alloc, slot)?;
            self.parent.set_ref(alloc, 0, ids.root())?;
        } else {
            self.parent.set_ref(alloc, 1, posts.root())?;
        }

        Ok(())
    }

    /// All keys holding exactly `id`.
    pub fn find_exact(&self, alloc: &SlabAlloc, id: StringId) -> Result<Vec<ObjKey>> {
        match self.slot_of(alloc, id)? {
            Ok(slot) => self.posts(alloc)?.get_all(alloc, slot),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// All keys whose indexed string starts with `prefix`, in string
    /// order then key order.
    pub fn find_prefix(
        &self,
        alloc: &SlabAlloc,
        interner: &Interner,
        prefix: &str,
    ) -> Result<Vec<ObjKey>> {
        let mut out = Vec::new();
        for id in interner.ids_with_prefix(alloc, prefix)? {
            out.extend(self.find_exact(alloc, id)?);
        }
        Ok(out)
    }

    /// Destroys the index.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> Result<()> {
        self.parent.destroy_deep(alloc)
    }
}
