// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{merge_scalar, null_rejected, split_scalar, type_mismatch, CreateLike, LeafOps};
use crate::alloc::{Ref, SlabAlloc};
use crate::array::Array;
use crate::node::NodeFlags;
use crate::value::{Timestamp, Value};
use crate::Result;

/// Seconds value marking null
const TS_NULL_SECONDS: i64 = i64::MIN;

/// Timestamp column leaf: two parallel integer arrays (seconds,
/// nanoseconds) under a two-slot parent
#[derive(Clone, Debug)]
pub struct TimestampLeaf {
    parent: Array,
    nullable: bool,
}

impl TimestampLeaf {
    pub(crate) fn create(alloc: &mut SlabAlloc, nullable: bool) -> Result<Self> {
        let seconds = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let nanos = Array::create(alloc, NodeFlags::default(), 0, 0)?;

        let mut parent = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
        parent.push(alloc, seconds.root() as i64)?;
        parent.push(alloc, nanos.root() as i64)?;

        Ok(Self { parent, nullable })
    }

    pub(crate) fn attach(root: Ref, nullable: bool) -> Self {
        Self {
            parent: Array::from_ref(root),
            nullable,
        }
    }

    fn encode(&self, value: &Value) -> Result<(i64, i64)> {
        match value {
            Value::Timestamp(ts) => Ok((ts.seconds, i64::from(ts.nanoseconds))),
            Value::Null if self.nullable => Ok((TS_NULL_SECONDS, 0)),
            Value::Null => Err(null_rejected("timestamp")),
            other => Err(type_mismatch("timestamp", other)),
        }
    }

    fn children(&self, alloc: &SlabAlloc) -> Result<(Array, Array)> {
        Ok((
            Array::from_ref(self.parent.get_ref(alloc, 0)?),
            Array::from_ref(self.parent.get_ref(alloc, 1)?),
        ))
    }

    fn update_children(
        &mut self,
        alloc: &mut SlabAlloc,
        seconds: Array,
        nanos: Array,
    ) -> Result<()> {
        self.parent.set_ref(alloc, 0, seconds.root())?;
        self.parent.set_ref(alloc, 1, nanos.root())
    }
}

impl LeafOps for TimestampLeaf {
    fn root(&self) -> Ref {
        self.parent.root()
    }

    fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.children(alloc)?.0.len(alloc)
    }

    fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Value> {
        let (seconds, nanos) = self.children(alloc)?;

        let s = seconds.get(alloc, idx)?;
        if s == TS_NULL_SECONDS {
            return Ok(Value::Null);
        }

        Ok(Value::Timestamp(Timestamp {
            seconds: s,
            nanoseconds: nanos.get(alloc, idx)? as i32,
        }))
    }

    fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let (s, n) = self.encode(value)?;
        let (mut seconds, mut nanos) = self.children(alloc)?;

        seconds.set(alloc, idx, s)?;
        nanos.set(alloc, idx, n)?;
        self.update_children(alloc, seconds, nanos)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let (s, n) = self.encode(value)?;
        let (mut seconds, mut nanos) = self.children(alloc)?;

        seconds.insert(alloc, idx, s)?;
        nanos.insert(alloc, idx, n)?;
        self.update_children(alloc, seconds, nanos)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        let (mut seconds, mut nanos) = self.children(alloc)?;

        seconds.erase(alloc, idx)?;
        nanos.erase(alloc, idx)?;
        self.update_children(alloc, seconds, nanos)
    }

    fn split(&mut self, alloc: &mut SlabAlloc, at: usize) -> Result<Ref> {
        split_scalar(self, alloc, at)
    }

    fn merge_from(&mut self, alloc: &mut SlabAlloc, right: Ref) -> Result<()> {
        merge_scalar(self, alloc, right)
    }

    fn destroy(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.parent.destroy_deep(alloc)
    }
}

impl CreateLike for TimestampLeaf {
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
    fn roundtrip_with_nulls() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = TimestampLeaf::create(&mut alloc, true)?;

        let ts = Timestamp::new(1_700_000_000, 123_456_789);
        leaf.insert(&mut alloc, 0, &Value::Timestamp(ts))?;
        leaf.insert(&mut alloc, 1, &Value::Null)?;
        leaf.insert(&mut alloc, 2, &Value::Timestamp(Timestamp::new(-1, 999)))?;

        assert_eq!(Value::Timestamp(ts), leaf.get(&alloc, 0)?);
        assert_eq!(Value::Null, leaf.get(&alloc, 1)?);
        assert_eq!(
            Value::Timestamp(Timestamp::new(-1, 999)),
            leaf.get(&alloc, 2)?
        );

        leaf.erase(&mut alloc, 0)?;
        assert_eq!(Value::Null, leaf.get(&alloc, 0)?);
        assert_eq!(2, leaf.len(&alloc)?);

        Ok(())
    }
}
