// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{merge_scalar, null_rejected, split_scalar, type_mismatch, CreateLike, LeafOps};
use crate::alloc::{Ref, SlabAlloc};
use crate::array::Array;
use crate::node::header::bits_for_value;
use crate::node::NodeFlags;
use crate::value::Value;
use crate::{Error, Result};

/// Null sentinel for a nullable integer leaf: the top of the width's
/// representable range.
fn null_sentinel(width_bits: usize) -> i64 {
    match width_bits {
        0 => 0,
        1 => 1,
        2 => 3,
        4 => 15,
        8 => i64::from(i8::MAX),
        16 => i64::from(i16::MAX),
        32 => i64::from(i32::MAX),
        _ => i64::MAX,
    }
}

fn next_width(width_bits: usize) -> usize {
    match width_bits {
        0 => 1,
        1 => 2,
        2 => 4,
        4 => 8,
        8 => 16,
        16 => 32,
        _ => 64,
    }
}

/// Integer column leaf
///
/// A nullable leaf reserves the top of its width's range as the null
/// marker and keeps the marker value itself in payload slot 0 (logical
/// rows start at slot 1), so null detection survives the commit-time
/// re-encodings, which preserve values but not the storage width.
/// Storing a value that collides with the marker widens the leaf first,
/// re-encoding existing nulls.
#[derive(Clone, Debug)]
pub struct IntLeaf {
    arr: Array,
    nullable: bool,
}

impl IntLeaf {
    pub(crate) fn create(alloc: &mut SlabAlloc, nullable: bool) -> Result<Self> {
        let mut arr = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        if nullable {
            arr.push(alloc, null_sentinel(1))?;
        }
        Ok(Self { arr, nullable })
    }

    pub(crate) fn attach(root: Ref, nullable: bool) -> Self {
        Self {
            arr: Array::from_ref(root),
            nullable,
        }
    }

    fn base(&self) -> usize {
        usize::from(self.nullable)
    }

    fn sentinel(&self, alloc: &SlabAlloc) -> Result<i64> {
        debug_assert!(self.nullable);
        self.arr.get(alloc, 0)
    }

    /// Widens so `value` can be stored without colliding with the null
    /// marker, re-encoding existing nulls and the marker slot.
    fn reserve_width(&mut self, alloc: &mut SlabAlloc, value: i64) -> Result<()> {
        if !self.nullable {
            return Ok(());
        }

        let old_sentinel = self.sentinel(alloc)?;
        if value != old_sentinel {
            return Ok(());
        }

        let mut width = bits_for_value(old_sentinel);
        loop {
            if width == 64 {
                return Err(Error::logic(
                    "i64::MAX is reserved as the null marker of nullable int columns",
                ));
            }
            width = next_width(width);
            if value != null_sentinel(width) {
                break;
            }
        }

        let new_sentinel = null_sentinel(width);
        log::trace!("widening nullable int leaf, marker {old_sentinel} -> {new_sentinel}");

        let values = self.arr.to_vec(alloc)?;
        let flags = self.arr.header(alloc)?.flags;

        let mut rebuilt = Array::create(alloc, flags, 0, 0)?;
        for v in values {
            let v = if v == old_sentinel { new_sentinel } else { v };
            rebuilt.push(alloc, v)?;
        }

        self.arr.destroy_deep(alloc)?;
        self.arr = rebuilt;
        Ok(())
    }

    fn encode(&mut self, alloc: &mut SlabAlloc, value: &Value) -> Result<i64> {
        match value {
            Value::Int(v) => {
                self.reserve_width(alloc, *v)?;
                Ok(*v)
            }
            Value::Null if self.nullable => self.sentinel(alloc),
            Value::Null => Err(null_rejected("int")),
            other => Err(type_mismatch("int", other)),
        }
    }
}

impl LeafOps for IntLeaf {
    fn root(&self) -> Ref {
        self.arr.root()
    }

    fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        Ok(self.arr.len(alloc)? - self.base())
    }

    fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Value> {
        let v = self.arr.get(alloc, idx + self.base())?;
        if self.nullable && v == self.sentinel(alloc)? {
            Ok(Value::Null)
        } else {
            Ok(Value::Int(v))
        }
    }

    fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        if idx >= self.len(alloc)? {
            return Err(Error::logic("row position out of leaf"));
        }
        let raw = self.encode(alloc, value)?;
        let base = self.base();
        self.arr.set(alloc, idx + base, raw)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        if idx > self.len(alloc)? {
            return Err(Error::logic("row position out of leaf"));
        }
        let raw = self.encode(alloc, value)?;
        let base = self.base();
        self.arr.insert(alloc, idx + base, raw)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        if idx >= self.len(alloc)? {
            return Err(Error::logic("row position out of leaf"));
        }
        let base = self.base();
        self.arr.erase(alloc, idx + base)
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

impl CreateLike for IntLeaf {
    fn create_like(&self, alloc: &mut SlabAlloc) -> Result<Self> {
        Self::create(alloc, self.nullable)
    }

    fn attach_like(&self, root: Ref) -> Self {
        Self::attach(root, self.nullable)
    }
}

/// Boolean column leaf: width 1, or width 2 with sentinel 2 when
/// nullable
#[derive(Clone, Debug)]
pub struct BoolLeaf {
    arr: Array,
    nullable: bool,
}

const BOOL_NULL: i64 = 2;

impl BoolLeaf {
    pub(crate) fn create(alloc: &mut SlabAlloc, nullable: bool) -> Result<Self> {
        Ok(Self {
            arr: Array::create(alloc, NodeFlags::default(), 0, 0)?,
            nullable,
        })
    }

    pub(crate) fn attach(root: Ref, nullable: bool) -> Self {
        Self {
            arr: Array::from_ref(root),
            nullable,
        }
    }

    fn encode(&self, value: &Value) -> Result<i64> {
        match value {
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::Null if self.nullable => Ok(BOOL_NULL),
            Value::Null => Err(null_rejected("bool")),
            other => Err(type_mismatch("bool", other)),
        }
    }
}

impl LeafOps for BoolLeaf {
    fn root(&self) -> Ref {
        self.arr.root()
    }

    fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.arr.len(alloc)
    }

    fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Value> {
        match self.arr.get(alloc, idx)? {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            BOOL_NULL if self.nullable => Ok(Value::Null),
            other => Err(Error::corrupt(format!("bad bool payload {other}"))),
        }
    }

    fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let raw = self.encode(value)?;
        self.arr.set(alloc, idx, raw)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let raw = self.encode(value)?;
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

impl CreateLike for BoolLeaf {
    fn create_like(&self, alloc: &mut SlabAlloc) -> Result<Self> {
        Self::create(alloc, self.nullable)
    }

    fn attach_like(&self, root: Ref) -> Self {
        Self::attach(root, self.nullable)
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
    fn nullable_int_sentinel_survives_widening() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = IntLeaf::create(&mut alloc, true)?;

        leaf.insert(&mut alloc, 0, &Value::Null)?;
        leaf.insert(&mut alloc, 1, &Value::Int(0))?;
        assert_eq!(Value::Null, leaf.get(&alloc, 0)?);
        assert_eq!(Value::Int(0), leaf.get(&alloc, 1)?);

        // storing the current marker value forces a widen; the null at
        // position 0 must stay null
        let colliding = leaf.sentinel(&alloc)?;
        leaf.insert(&mut alloc, 2, &Value::Int(colliding))?;

        assert_eq!(Value::Null, leaf.get(&alloc, 0)?);
        assert_eq!(Value::Int(0), leaf.get(&alloc, 1)?);
        assert_eq!(Value::Int(colliding), leaf.get(&alloc, 2)?);

        // repeat until the marker is pushed to the widest tier
        for round in 0..4 {
            let colliding = leaf.sentinel(&alloc)?;
            let at = leaf.len(&alloc)?;
            leaf.insert(&mut alloc, at, &Value::Int(colliding))?;
            assert_eq!(Value::Null, leaf.get(&alloc, 0)?, "round {round}");
            assert_eq!(Value::Int(colliding), leaf.get(&alloc, at)?, "round {round}");
        }

        // the pathological end: i64::MAX collides with the 64-bit marker
        // and is rejected rather than silently read back as null
        assert_eq!(i64::MAX, leaf.sentinel(&alloc)?);
        let at = leaf.len(&alloc)?;
        assert!(leaf.insert(&mut alloc, at, &Value::Int(i64::MAX)).is_err());

        Ok(())
    }

    #[test]
    fn non_nullable_int_allows_extremes() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = IntLeaf::create(&mut alloc, false)?;

        assert!(leaf.insert(&mut alloc, 0, &Value::Null).is_err());

        leaf.insert(&mut alloc, 0, &Value::Int(i64::MAX))?;
        leaf.insert(&mut alloc, 1, &Value::Int(i64::MIN))?;
        assert_eq!(Value::Int(i64::MAX), leaf.get(&alloc, 0)?);
        assert_eq!(Value::Int(i64::MIN), leaf.get(&alloc, 1)?);

        Ok(())
    }

    #[test]
    fn bool_leaf_with_nulls() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = BoolLeaf::create(&mut alloc, true)?;

        leaf.insert(&mut alloc, 0, &Value::Bool(true))?;
        leaf.insert(&mut alloc, 1, &Value::Null)?;
        leaf.insert(&mut alloc, 2, &Value::Bool(false))?;

        assert_eq!(Value::Bool(true), leaf.get(&alloc, 0)?);
        assert_eq!(Value::Null, leaf.get(&alloc, 1)?);
        assert_eq!(Value::Bool(false), leaf.get(&alloc, 2)?);

        leaf.set(&mut alloc, 1, &Value::Bool(true))?;
        assert_eq!(Value::Bool(true), leaf.get(&alloc, 1)?);

        Ok(())
    }

    #[test]
    fn split_and_merge() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = IntLeaf::create(&mut alloc, true)?;

        for i in 0..10 {
            leaf.insert(&mut alloc, i, &Value::Int(i as i64 * 100))?;
        }
        leaf.set(&mut alloc, 4, &Value::Null)?;

        let right_ref = leaf.split(&mut alloc, 6)?;
        assert_eq!(6, leaf.len(&alloc)?);

        let right = IntLeaf::attach(right_ref, true);
        assert_eq!(4, right.len(&alloc)?);
        assert_eq!(Value::Int(600), right.get(&alloc, 0)?);
        assert_eq!(Value::Null, leaf.get(&alloc, 4)?);

        leaf.merge_from(&mut alloc, right_ref)?;
        assert_eq!(10, leaf.len(&alloc)?);
        assert_eq!(Value::Int(900), leaf.get(&alloc, 9)?);

        Ok(())
    }

    #[test]
    fn nullable_int_insert_null_into_empty() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = IntLeaf::create(&mut alloc, true)?;

        leaf.insert(&mut alloc, 0, &Value::Null)?;
        assert_eq!(Value::Null, leaf.get(&alloc, 0)?);
        assert_eq!(1, leaf.len(&alloc)?);
        Ok(())
    }
}
