// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{merge_scalar, split_scalar, type_mismatch, CreateLike, LeafOps};
use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::array::{clone_deep, destroy_deep_ref, is_tagged, tag_int, untag_int, Array};
use crate::keys::ObjKey;
use crate::node::NodeFlags;
use crate::value::Value;
use crate::{Error, Result};

/// Forward-link column leaf: stores `key + 1` per row, zero meaning
/// "no target"
///
/// Link columns are always nullable in the sense that a row may point
/// nowhere; strength (weak/strong) lives in the `ColKey`, not here.
#[derive(Clone, Debug)]
pub struct LinkLeaf {
    arr: Array,
}

impl LinkLeaf {
    pub(crate) fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        Ok(Self {
            arr: Array::create(alloc, NodeFlags::default(), 0, 0)?,
        })
    }

    pub(crate) fn attach(root: Ref) -> Self {
        Self {
            arr: Array::from_ref(root),
        }
    }

    fn encode(value: &Value) -> Result<i64> {
        match value {
            Value::Link(key) => {
                if key.is_tombstone() {
                    return Err(Error::logic("cannot store a tombstone key"));
                }
                Ok(key.value() + 1)
            }
            Value::Null => Ok(0),
            other => Err(type_mismatch("link", other)),
        }
    }

    /// Smallest row pointing at `target`.
    pub fn find_target(&self, alloc: &SlabAlloc, target: ObjKey) -> Result<Option<usize>> {
        self.arr.find_first(
            alloc,
            crate::node::find::FindOp::Eq,
            target.value() + 1,
            0,
            self.arr.len(alloc)?,
        )
    }
}

impl LeafOps for LinkLeaf {
    fn root(&self) -> Ref {
        self.arr.root()
    }

    fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.arr.len(alloc)
    }

    fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Value> {
        match self.arr.get(alloc, idx)? {
            0 => Ok(Value::Null),
            v => Ok(Value::Link(ObjKey(v - 1))),
        }
    }

    fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let raw = Self::encode(value)?;
        self.arr.set(alloc, idx, raw)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let raw = Self::encode(value)?;
        self.arr.insert(alloc, idx, raw)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        self.arr.erase(alloc, idx)
    }

    fn split(&mut self, alloc: &mut SlabAlloc, at: usize) -> Result<Ref> {
        split_scalar(self, alloc, at)
    }

    fn merge_from(&mut self, alloc: &mut SlabAlloc, right: Ref) -> Result<()> {
        merge_scalar(self, alloc, right)
    }

    fn destroy(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.arr.destroy_deep(alloc)
    }
}

impl CreateLike for LinkLeaf {
    fn create_like(&self, alloc: &mut SlabAlloc) -> Result<Self> {
        Self::create(alloc)
    }

    fn attach_like(&self, root: Ref) -> Self {
        Self::attach(root)
    }
}

/// Backlink column leaf: per row, the set of origin keys pointing here
///
/// Storage per row, in a `has_refs` array:
/// * `0` — no backlinks
/// * tagged integer — exactly one origin key
/// * ref — an integer array of origin keys
#[derive(Clone, Debug)]
pub struct BacklinkLeaf {
    arr: Array,
}

impl BacklinkLeaf {
    pub(crate) fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        Ok(Self {
            arr: Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?,
        })
    }

    pub(crate) fn attach(root: Ref) -> Self {
        Self {
            arr: Array::from_ref(root),
        }
    }

    /// Records that `origin` now points at row `idx`.
    pub fn add(&mut self, alloc: &mut SlabAlloc, idx: usize, origin: ObjKey) -> Result<()> {
        let slot = self.arr.get(alloc, idx)?;

        if slot == 0 {
            return self.arr.set(alloc, idx, tag_int(origin.value()));
        }

        if is_tagged(slot) {
            let mut list = Array::create(alloc, NodeFlags::default(), 0, 0)?;
            list.push(alloc, untag_int(slot))?;
            list.push(alloc, origin.value())?;
            return self.arr.set_ref(alloc, idx, list.root());
        }

        let mut list = Array::from_ref(slot as Ref);
        list.push(alloc, origin.value())?;
        self.arr.set_ref(alloc, idx, list.root())
    }

    /// Removes the record of `origin` pointing at row `idx`.
    pub fn remove(&mut self, alloc: &mut SlabAlloc, idx: usize, origin: ObjKey) -> Result<()> {
        let slot = self.arr.get(alloc, idx)?;

        if is_tagged(slot) {
            if untag_int(slot) != origin.value() {
                return Err(Error::corrupt("backlink bookkeeping out of sync"));
            }
            return self.arr.set(alloc, idx, 0);
        }

        if slot == 0 {
            return Err(Error::corrupt("backlink bookkeeping out of sync"));
        }

        let mut list = Array::from_ref(slot as Ref);
        let n = list.len(alloc)?;
        let pos = list
            .find_first(alloc, crate::node::find::FindOp::Eq, origin.value(), 0, n)?
            .ok_or_else(|| Error::corrupt("backlink bookkeeping out of sync"))?;
        list.erase(alloc, pos)?;

        match list.len(alloc)? {
            0 => {
                list.destroy_deep(alloc)?;
                self.arr.set(alloc, idx, 0)
            }
            1 => {
                let survivor = list.get(alloc, 0)?;
                list.destroy_deep(alloc)?;
                self.arr.set(alloc, idx, tag_int(survivor))
            }
            _ => self.arr.set_ref(alloc, idx, list.root()),
        }
    }

    /// All origin keys pointing at row `idx`.
    pub fn get_all(&self, alloc: &SlabAlloc, idx: usize) -> Result<Vec<ObjKey>> {
        let slot = self.arr.get(alloc, idx)?;

        if slot == 0 {
            return Ok(Vec::new());
        }

        if is_tagged(slot) {
            return Ok(vec![ObjKey(untag_int(slot))]);
        }

        let list = Array::from_ref(slot as Ref);
        Ok(list.to_vec(alloc)?.into_iter().map(ObjKey).collect())
    }

    /// Number of origins pointing at row `idx`.
    pub fn count(&self, alloc: &SlabAlloc, idx: usize) -> Result<usize> {
        let slot = self.arr.get(alloc, idx)?;

        if slot == 0 {
            Ok(0)
        } else if is_tagged(slot) {
            Ok(1)
        } else {
            Array::from_ref(slot as Ref).len(alloc)
        }
    }
}

impl LeafOps for BacklinkLeaf {
    fn root(&self) -> Ref {
        self.arr.root()
    }

    fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.arr.len(alloc)
    }

    fn get(&self, _alloc: &SlabAlloc, _idx: usize) -> Result<Value> {
        Err(Error::logic("backlink columns are not readable as values"))
    }

    fn set(&mut self, _alloc: &mut SlabAlloc, _idx: usize, _value: &Value) -> Result<()> {
        Err(Error::logic("backlink columns are not writable as values"))
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        // new rows always start with an empty backlink slot
        if !value.is_null() {
            return Err(Error::logic("backlink columns are not writable as values"));
        }
        self.arr.insert(alloc, idx, 0)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        let slot = self.arr.get(alloc, idx)?;
        if slot != 0 && !is_tagged(slot) {
            destroy_deep_ref(alloc, slot as Ref)?;
        }
        self.arr.erase(alloc, idx)
    }

    fn split(&mut self, alloc: &mut SlabAlloc, at: usize) -> Result<Ref> {
        let n = self.arr.len(alloc)?;
        let mut right = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;

        for i in at..n {
            let slot = self.arr.get(alloc, i)?;
            let moved = if slot != 0 && !is_tagged(slot) {
                clone_deep(alloc, slot as Ref)? as i64
            } else {
                slot
            };
            right.push(alloc, moved)?;
        }

        for i in (at..n).rev() {
            self.erase(alloc, i)?;
        }

        Ok(right.root())
    }

    fn merge_from(&mut self, alloc: &mut SlabAlloc, right: Ref) -> Result<()> {
        let right_arr = Array::from_ref(right);
        let n = right_arr.len(alloc)?;

        for i in 0..n {
            let slot = right_arr.get(alloc, i)?;
            let moved = if slot != 0 && !is_tagged(slot) {
                clone_deep(alloc, slot as Ref)? as i64
            } else {
                slot
            };
            self.arr.push(alloc, moved)?;
        }

        let mut right_leaf = Self::attach(right);
        right_leaf.destroy(alloc)
    }

    fn destroy(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.arr.destroy_deep(alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{FileMap, OpenMode};
    use test_log::test;

    fn alloc() -> SlabAlloc {
        #[expect(clippy::expect_used)]
        let dir = tempfile::tempdir().expect("tempdir");
        #[expect(clippy::expect_used)]
        let (map, _) = FileMap::attach(&dir.path().join("a.tdb"), OpenMode::MemoryOnly, None)
            .expect("attach");
        SlabAlloc::for_writer(map)
    }

    #[test]
    fn links_store_keys() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = LinkLeaf::create(&mut alloc)?;

        leaf.insert(&mut alloc, 0, &Value::Link(ObjKey(0)))?;
        leaf.insert(&mut alloc, 1, &Value::Null)?;
        leaf.insert(&mut alloc, 2, &Value::Link(ObjKey(42)))?;

        assert_eq!(Value::Link(ObjKey(0)), leaf.get(&alloc, 0)?);
        assert_eq!(Value::Null, leaf.get(&alloc, 1)?);
        assert_eq!(Some(2), leaf.find_target(&alloc, ObjKey(42))?);
        assert_eq!(None, leaf.find_target(&alloc, ObjKey(7))?);

        Ok(())
    }

    #[test]
    fn backlinks_grow_from_slot_to_list() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = BacklinkLeaf::create(&mut alloc)?;

        leaf.insert(&mut alloc, 0, &Value::Null)?;
        assert_eq!(0, leaf.count(&alloc, 0)?);

        leaf.add(&mut alloc, 0, ObjKey(5))?;
        assert_eq!(vec![ObjKey(5)], leaf.get_all(&alloc, 0)?);

        leaf.add(&mut alloc, 0, ObjKey(9))?;
        leaf.add(&mut alloc, 0, ObjKey(12))?;
        assert_eq!(3, leaf.count(&alloc, 0)?);
        assert_eq!(
            vec![ObjKey(5), ObjKey(9), ObjKey(12)],
            leaf.get_all(&alloc, 0)?
        );

        leaf.remove(&mut alloc, 0, ObjKey(9))?;
        leaf.remove(&mut alloc, 0, ObjKey(5))?;
        assert_eq!(vec![ObjKey(12)], leaf.get_all(&alloc, 0)?);

        leaf.remove(&mut alloc, 0, ObjKey(12))?;
        assert_eq!(0, leaf.count(&alloc, 0)?);

        // removing an unknown origin is corruption, not a no-op
        assert!(leaf.remove(&mut alloc, 0, ObjKey(5)).is_err());

        Ok(())
    }
}
