// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Variable-length payload storage shared by string and binary leaves.
//!
//! Two tiers:
//!
//! * **medium** — parent `[pairs_ref, blob_ref]` with the context flag
//!   set; `pairs` holds an `(offset, length)` pair per row into the
//!   single blob child, length `-1` marking null.
//! * **big** — parent with one child blob ref per row, null ref marking
//!   null.
//!
//! A leaf upgrades medium → big when a value above the medium limit is
//! stored; downgrades never happen.

use super::{merge_scalar, null_rejected, split_scalar, type_mismatch, CreateLike, LeafOps};
use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::array::{destroy_deep_ref, Array};
use crate::node::NodeFlags;
use crate::value::Value;
use crate::{Error, Result};

/// Longest value kept in the medium tier
pub(crate) const MEDIUM_MAX: usize = 63;

/// Hard per-value limit (bounded by the node capacity field)
pub(crate) const VALUE_MAX: usize = 512 * 1024 - 64;

/// Blob bytes wasted by erases before the medium tier compacts
const COMPACT_SLACK: usize = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Tier {
    Medium,
    Big,
}

/// Tiered variable-length leaf (the storage behind string and binary
/// columns)
#[derive(Clone, Debug)]
pub(crate) struct VarLenLeaf {
    parent: Array,
    nullable: bool,
}

impl VarLenLeaf {
    pub(crate) fn create(alloc: &mut SlabAlloc, nullable: bool) -> Result<Self> {
        let pairs = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let blob = Array::create_blob(alloc, &[])?;

        let mut parent = Array::create(alloc, NodeFlags::HAS_REFS | NodeFlags::CONTEXT, 0, 0)?;
        parent.push(alloc, pairs.root() as i64)?;
        parent.push(alloc, blob.root() as i64)?;

        Ok(Self { parent, nullable })
    }

    pub(crate) fn attach(root: Ref, nullable: bool) -> Self {
        Self {
            parent: Array::from_ref(root),
            nullable,
        }
    }

    pub(crate) fn root(&self) -> Ref {
        self.parent.root()
    }

    fn tier(&self, alloc: &SlabAlloc) -> Result<Tier> {
        if self.parent.header(alloc)?.context_flag() {
            Ok(Tier::Medium)
        } else {
            Ok(Tier::Big)
        }
    }

    pub(crate) fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        match self.tier(alloc)? {
            Tier::Medium => Ok(Array::from_ref(self.parent.get_ref(alloc, 0)?).len(alloc)? / 2),
            Tier::Big => self.parent.len(alloc),
        }
    }

    pub(crate) fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Option<Vec<u8>>> {
        match self.tier(alloc)? {
            Tier::Medium => {
                let pairs = Array::from_ref(self.parent.get_ref(alloc, 0)?);
                let length = pairs.get(alloc, idx * 2 + 1)?;
                if length < 0 {
                    return Ok(None);
                }

                let offset = pairs.get(alloc, idx * 2)? as usize;
                let blob = Array::from_ref(self.parent.get_ref(alloc, 1)?);
                let bytes = blob.blob_bytes(alloc)?;

                bytes
                    .get(offset..offset + length as usize)
                    .map(<[u8]>::to_vec)
                    .map(Some)
                    .ok_or_else(|| Error::corrupt("varlen payload out of blob"))
            }
            Tier::Big => {
                let child = self.parent.get_ref(alloc, idx)?;
                if child == NULL_REF {
                    return Ok(None);
                }

                Ok(Some(Array::from_ref(child).blob_bytes(alloc)?.to_vec()))
            }
        }
    }

    pub(crate) fn set(
        &mut self,
        alloc: &mut SlabAlloc,
        idx: usize,
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.check_value(value)?;
        self.upgrade_if_needed(alloc, value)?;

        match self.tier(alloc)? {
            Tier::Medium => {
                let (offset, length) = self.medium_append(alloc, value)?;
                let mut pairs = Array::from_ref(self.parent.get_ref(alloc, 0)?);
                pairs.set(alloc, idx * 2, offset)?;
                pairs.set(alloc, idx * 2 + 1, length)?;
                self.parent.set_ref(alloc, 0, pairs.root())?;
                self.maybe_compact(alloc)
            }
            Tier::Big => {
                let old = self.parent.get_ref(alloc, idx)?;
                if old != NULL_REF {
                    destroy_deep_ref(alloc, old)?;
                }

                let child = Self::big_child(alloc, value)?;
                self.parent.set_ref(alloc, idx, child)
            }
        }
    }

    pub(crate) fn insert(
        &mut self,
        alloc: &mut SlabAlloc,
        idx: usize,
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.check_value(value)?;
        self.upgrade_if_needed(alloc, value)?;

        match self.tier(alloc)? {
            Tier::Medium => {
                let (offset, length) = self.medium_append(alloc, value)?;
                let mut pairs = Array::from_ref(self.parent.get_ref(alloc, 0)?);
                pairs.insert(alloc, idx * 2, offset)?;
                pairs.insert(alloc, idx * 2 + 1, length)?;
                self.parent.set_ref(alloc, 0, pairs.root())
            }
            Tier::Big => {
                let child = Self::big_child(alloc, value)?;
                self.parent.insert(alloc, idx, child as i64)
            }
        }
    }

    pub(crate) fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        match self.tier(alloc)? {
            Tier::Medium => {
                let mut pairs = Array::from_ref(self.parent.get_ref(alloc, 0)?);
                pairs.erase(alloc, idx * 2)?;
                pairs.erase(alloc, idx * 2)?;
                self.parent.set_ref(alloc, 0, pairs.root())?;
                self.maybe_compact(alloc)
            }
            Tier::Big => {
                let child = self.parent.get_ref(alloc, idx)?;
                if child != NULL_REF {
                    destroy_deep_ref(alloc, child)?;
                }
                self.parent.erase(alloc, idx)
            }
        }
    }

    pub(crate) fn destroy(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.parent.destroy_deep(alloc)
    }

    fn check_value(&self, value: Option<&[u8]>) -> Result<()> {
        match value {
            None if !self.nullable => Err(null_rejected("string/binary")),
            Some(v) if v.len() > VALUE_MAX => Err(Error::logic(format!(
                "value of {} bytes exceeds the {VALUE_MAX}-byte limit",
                v.len(),
            ))),
            _ => Ok(()),
        }
    }

    fn upgrade_if_needed(&mut self, alloc: &mut SlabAlloc, value: Option<&[u8]>) -> Result<()> {
        if self.tier(alloc)? == Tier::Big {
            return Ok(());
        }

        if value.is_none_or(|v| v.len() <= MEDIUM_MAX) {
            return Ok(());
        }

        log::trace!("upgrading varlen leaf {} to the big tier", self.root());

        let n = self.len(alloc)?;
        let mut big = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
        for i in 0..n {
            let v = self.get(alloc, i)?;
            let child = Self::big_child(alloc, v.as_deref())?;
            big.push(alloc, child as i64)?;
        }

        self.parent.destroy_deep(alloc)?;
        self.parent = big;
        Ok(())
    }

    fn big_child(alloc: &mut SlabAlloc, value: Option<&[u8]>) -> Result<Ref> {
        match value {
            None => Ok(NULL_REF),
            Some(bytes) => Ok(Array::create_blob(alloc, bytes)?.root()),
        }
    }

    /// Appends bytes to the medium blob, returning the stored
    /// `(offset, length)` pair.
    fn medium_append(&mut self, alloc: &mut SlabAlloc, value: Option<&[u8]>) -> Result<(i64, i64)> {
        match value {
            None => Ok((0, -1)),
            Some(bytes) => {
                let mut blob = Array::from_ref(self.parent.get_ref(alloc, 1)?);
                let offset = blob.blob_append(alloc, bytes)?;
                self.parent.set_ref(alloc, 1, blob.root())?;
                Ok((offset as i64, bytes.len() as i64))
            }
        }
    }

    /// Rewrites the medium blob once erases and overwrites have orphaned
    /// more than half of it.
    fn maybe_compact(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        let pairs = Array::from_ref(self.parent.get_ref(alloc, 0)?);
        let blob = Array::from_ref(self.parent.get_ref(alloc, 1)?);

        let blob_len = blob.len(alloc)?;
        let live: i64 = {
            let n = pairs.len(alloc)? / 2;
            let mut sum = 0;
            for i in 0..n {
                sum += pairs.get(alloc, i * 2 + 1)?.max(0);
            }
            sum
        };

        if blob_len <= COMPACT_SLACK || live as usize * 2 > blob_len {
            return Ok(());
        }

        log::trace!("compacting varlen blob: {live} live of {blob_len} bytes");

        let n = pairs.len(alloc)? / 2;
        let mut values = Vec::with_capacity(n);
        for i in 0..n {
            values.push(self.get(alloc, i)?);
        }

        let mut new_pairs = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let mut new_blob = Array::create_blob(alloc, &[])?;
        for v in &values {
            match v {
                None => {
                    new_pairs.push(alloc, 0)?;
                    new_pairs.push(alloc, -1)?;
                }
                Some(bytes) => {
                    let offset = new_blob.blob_append(alloc, bytes)?;
                    new_pairs.push(alloc, offset as i64)?;
                    new_pairs.push(alloc, bytes.len() as i64)?;
                }
            }
        }

        pairs.destroy_deep(alloc)?;
        blob.destroy_deep(alloc)?;

        self.parent.set_ref(alloc, 0, new_pairs.root())?;
        self.parent.set_ref(alloc, 1, new_blob.root())
    }
}

/// Binary column leaf
#[derive(Clone, Debug)]
pub struct BinaryLeaf {
    inner: VarLenLeaf,
}

impl BinaryLeaf {
    pub(crate) fn create(alloc: &mut SlabAlloc, nullable: bool) -> Result<Self> {
        Ok(Self {
            inner: VarLenLeaf::create(alloc, nullable)?,
        })
    }

    pub(crate) fn attach(root: Ref, nullable: bool) -> Self {
        Self {
            inner: VarLenLeaf::attach(root, nullable),
        }
    }

    fn encode<'a>(&self, value: &'a Value) -> Result<Option<&'a [u8]>> {
        match value {
            Value::Binary(v) => Ok(Some(v)),
            Value::Null => Ok(None),
            other => Err(type_mismatch("binary", other)),
        }
    }
}

impl LeafOps for BinaryLeaf {
    fn root(&self) -> Ref {
        self.inner.root()
    }

    fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.inner.len(alloc)
    }

    fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Value> {
        Ok(self
            .inner
            .get(alloc, idx)?
            .map_or(Value::Null, Value::Binary))
    }

    fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let bytes = self.encode(value)?;
        self.inner.set(alloc, idx, bytes)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let bytes = self.encode(value)?;
        self.inner.insert(alloc, idx, bytes)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        self.inner.erase(alloc, idx)
    }

    fn split(&mut self, alloc: &mut SlabAlloc, at: usize) -> Result<Ref> {
        split_scalar(self, alloc, at)
    }

    fn merge_from(&mut self, alloc: &mut SlabAlloc, right: Ref) -> Result<()> {
        merge_scalar(self, alloc, right)
    }

    fn destroy(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.inner.destroy(alloc)
    }
}

impl CreateLike for BinaryLeaf {
    fn create_like(&self, alloc: &mut SlabAlloc) -> Result<Self> {
        Self::create(alloc, self.inner.nullable)
    }

    fn attach_like(&self, root: Ref) -> Self {
        Self::attach(root, self.inner.nullable)
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
    fn medium_tier_roundtrip() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = BinaryLeaf::create(&mut alloc, true)?;

        leaf.insert(&mut alloc, 0, &Value::Binary(b"hello".to_vec()))?;
        leaf.insert(&mut alloc, 1, &Value::Null)?;
        leaf.insert(&mut alloc, 2, &Value::Binary(vec![]))?;

        assert_eq!(3, leaf.len(&alloc)?);
        assert_eq!(Value::Binary(b"hello".to_vec()), leaf.get(&alloc, 0)?);
        assert_eq!(Value::Null, leaf.get(&alloc, 1)?);
        assert_eq!(Value::Binary(vec![]), leaf.get(&alloc, 2)?);

        Ok(())
    }

    #[test]
    fn upgrade_to_big_preserves_rows() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = BinaryLeaf::create(&mut alloc, true)?;

        leaf.insert(&mut alloc, 0, &Value::Binary(b"small".to_vec()))?;
        leaf.insert(&mut alloc, 1, &Value::Null)?;

        let big = vec![0xCD; 10_000];
        leaf.insert(&mut alloc, 2, &Value::Binary(big.clone()))?;

        assert_eq!(Value::Binary(b"small".to_vec()), leaf.get(&alloc, 0)?);
        assert_eq!(Value::Null, leaf.get(&alloc, 1)?);
        assert_eq!(Value::Binary(big), leaf.get(&alloc, 2)?);

        Ok(())
    }

    #[test]
    fn erase_compacts_eventually() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = BinaryLeaf::create(&mut alloc, false)?;

        for i in 0..64 {
            leaf.insert(&mut alloc, i, &Value::Binary(vec![i as u8; 32]))?;
        }
        for _ in 0..63 {
            leaf.erase(&mut alloc, 1)?;
        }

        assert_eq!(1, leaf.len(&alloc)?);
        assert_eq!(Value::Binary(vec![0; 32]), leaf.get(&alloc, 0)?);

        // the blob shrank back to the surviving payload
        let blob = Array::from_ref(
            Array::from_ref(leaf.root()).get_ref(&alloc, 1)?,
        );
        assert!(blob.len(&alloc)? < 128);

        Ok(())
    }

    #[test]
    fn oversized_value_is_rejected() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = BinaryLeaf::create(&mut alloc, false)?;

        let huge = vec![0u8; VALUE_MAX + 1];
        assert!(leaf
            .insert(&mut alloc, 0, &Value::Binary(huge))
            .is_err());

        Ok(())
    }
}
