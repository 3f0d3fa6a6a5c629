// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Dynamically typed column leaf.
//!
//! Parallel arrays under one parent: a discriminator array plus
//! per-type-family payload arrays. Every payload array has one slot per
//! row; only the one selected by the discriminator is meaningful.
//!
//! ```text
//! slot 0  discriminators
//! slot 1  integer payloads (int, bool, float/double bits, link, seconds)
//! slot 2  auxiliary integers (timestamp nanoseconds)
//! slot 3  byte payloads (string, binary, decimal, objectid, uuid)
//! ```

use super::varlen::VarLenLeaf;
use super::{merge_scalar, split_scalar, CreateLike, LeafOps};
use crate::alloc::{Ref, SlabAlloc};
use crate::array::Array;
use crate::keys::ObjKey;
use crate::node::NodeFlags;
use crate::value::{Decimal128, ObjectId, Timestamp, Uuid, Value};
use crate::{Error, Result};

// Discriminator values are part of the file format.
const DISC_NULL: i64 = 0;
const DISC_INT: i64 = 1;
const DISC_BOOL: i64 = 2;
const DISC_FLOAT: i64 = 3;
const DISC_DOUBLE: i64 = 4;
const DISC_STRING: i64 = 5;
const DISC_BINARY: i64 = 6;
const DISC_TIMESTAMP: i64 = 7;
const DISC_DECIMAL: i64 = 8;
const DISC_OBJECT_ID: i64 = 9;
const DISC_UUID: i64 = 10;
const DISC_LINK: i64 = 11;

/// Mixed (dynamically typed) column leaf
#[derive(Clone, Debug)]
pub struct MixedLeaf {
    parent: Array,
}

impl MixedLeaf {
    pub(crate) fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        let disc = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let ints = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let aux = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let blobs = VarLenLeaf::create(alloc, true)?;

        let mut parent = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
        parent.push(alloc, disc.root() as i64)?;
        parent.push(alloc, ints.root() as i64)?;
        parent.push(alloc, aux.root() as i64)?;
        parent.push(alloc, blobs.root() as i64)?;

        Ok(Self { parent })
    }

    pub(crate) fn attach(root: Ref) -> Self {
        Self {
            parent: Array::from_ref(root),
        }
    }

    fn parts(&self, alloc: &SlabAlloc) -> Result<(Array, Array, Array, VarLenLeaf)> {
        Ok((
            Array::from_ref(self.parent.get_ref(alloc, 0)?),
            Array::from_ref(self.parent.get_ref(alloc, 1)?),
            Array::from_ref(self.parent.get_ref(alloc, 2)?),
            VarLenLeaf::attach(self.parent.get_ref(alloc, 3)?, true),
        ))
    }

    fn update_parts(
        &mut self,
        alloc: &mut SlabAlloc,
        disc: Array,
        ints: Array,
        aux: Array,
        blobs: &VarLenLeaf,
    ) -> Result<()> {
        self.parent.set_ref(alloc, 0, disc.root())?;
        self.parent.set_ref(alloc, 1, ints.root())?;
        self.parent.set_ref(alloc, 2, aux.root())?;
        self.parent.set_ref(alloc, 3, blobs.root())
    }

    #[expect(clippy::type_complexity)]
    fn encode(value: &Value) -> Result<(i64, i64, i64, Option<Vec<u8>>)> {
        Ok(match value {
            Value::Null => (DISC_NULL, 0, 0, None),
            Value::Int(v) => (DISC_INT, *v, 0, None),
            Value::Bool(v) => (DISC_BOOL, i64::from(*v), 0, None),
            Value::Float(v) => (
                DISC_FLOAT,
                i64::from(Value::canonical_float_bits(*v)),
                0,
                None,
            ),
            Value::Double(v) => (
                DISC_DOUBLE,
                Value::canonical_double_bits(*v) as i64,
                0,
                None,
            ),
            Value::String(v) => (DISC_STRING, 0, 0, Some(v.as_bytes().to_vec())),
            Value::Binary(v) => (DISC_BINARY, 0, 0, Some(v.clone())),
            Value::Timestamp(ts) => (
                DISC_TIMESTAMP,
                ts.seconds,
                i64::from(ts.nanoseconds),
                None,
            ),
            Value::Decimal(d) => (DISC_DECIMAL, 0, 0, Some(d.0.to_vec())),
            Value::ObjectId(o) => (DISC_OBJECT_ID, 0, 0, Some(o.0.to_vec())),
            Value::Uuid(u) => (DISC_UUID, 0, 0, Some(u.0.to_vec())),
            Value::Link(key) => {
                if key.is_tombstone() {
                    return Err(Error::logic("cannot store a tombstone key"));
                }
                (DISC_LINK, key.value(), 0, None)
            }
        })
    }

    fn decode(disc: i64, int: i64, aux: i64, blob: Option<Vec<u8>>) -> Result<Value> {
        fn expect_blob(blob: Option<Vec<u8>>, len: usize, what: &str) -> Result<Vec<u8>> {
            let bytes =
                blob.ok_or_else(|| Error::corrupt(format!("missing {what} payload")))?;
            if bytes.len() != len {
                return Err(Error::corrupt(format!("bad {what} payload size")));
            }
            Ok(bytes)
        }

        Ok(match disc {
            DISC_NULL => Value::Null,
            DISC_INT => Value::Int(int),
            DISC_BOOL => Value::Bool(int != 0),
            DISC_FLOAT => Value::Float(f32::from_bits(int as u32)),
            DISC_DOUBLE => Value::Double(f64::from_bits(int as u64)),
            DISC_STRING => {
                let bytes = blob.ok_or_else(|| Error::corrupt("missing string payload"))?;
                Value::String(
                    String::from_utf8(bytes)
                        .map_err(|_| Error::corrupt("mixed string payload is not UTF-8"))?,
                )
            }
            DISC_BINARY => {
                Value::Binary(blob.ok_or_else(|| Error::corrupt("missing binary payload"))?)
            }
            DISC_TIMESTAMP => Value::Timestamp(Timestamp {
                seconds: int,
                nanoseconds: aux as i32,
            }),
            DISC_DECIMAL => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&expect_blob(blob, 16, "decimal")?);
                Value::Decimal(Decimal128(bytes))
            }
            DISC_OBJECT_ID => {
                let mut bytes = [0u8; 12];
                bytes.copy_from_slice(&expect_blob(blob, 12, "objectid")?);
                Value::ObjectId(ObjectId(bytes))
            }
            DISC_UUID => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&expect_blob(blob, 16, "uuid")?);
                Value::Uuid(Uuid(bytes))
            }
            DISC_LINK => Value::Link(ObjKey(int)),
            other => return Err(Error::corrupt(format!("unknown mixed discriminator {other}"))),
        })
    }
}

impl LeafOps for MixedLeaf {
    fn root(&self) -> Ref {
        self.parent.root()
    }

    fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.parts(alloc)?.0.len(alloc)
    }

    fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Value> {
        let (disc, ints, aux, blobs) = self.parts(alloc)?;

        Self::decode(
            disc.get(alloc, idx)?,
            ints.get(alloc, idx)?,
            aux.get(alloc, idx)?,
            blobs.get(alloc, idx)?,
        )
    }

    fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let (d, i, a, b) = Self::encode(value)?;
        let (mut disc, mut ints, mut aux, mut blobs) = self.parts(alloc)?;

        disc.set(alloc, idx, d)?;
        ints.set(alloc, idx, i)?;
        aux.set(alloc, idx, a)?;
        blobs.set(alloc, idx, b.as_deref())?;

        self.update_parts(alloc, disc, ints, aux, &blobs)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let (d, i, a, b) = Self::encode(value)?;
        let (mut disc, mut ints, mut aux, mut blobs) = self.parts(alloc)?;

        disc.insert(alloc, idx, d)?;
        ints.insert(alloc, idx, i)?;
        aux.insert(alloc, idx, a)?;
        blobs.insert(alloc, idx, b.as_deref())?;

        self.update_parts(alloc, disc, ints, aux, &blobs)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        let (mut disc, mut ints, mut aux, mut blobs) = self.parts(alloc)?;

        disc.erase(alloc, idx)?;
        ints.erase(alloc, idx)?;
        aux.erase(alloc, idx)?;
        blobs.erase(alloc, idx)?;

        self.update_parts(alloc, disc, ints, aux, &blobs)
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

impl CreateLike for MixedLeaf {
    fn create_like(&self, alloc: &mut SlabAlloc) -> Result<Self> {
        Self::create(alloc)
    }

    fn attach_like(&self, root: Ref) -> Self {
        Self::attach(root)
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
    fn every_variant_roundtrips() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = MixedLeaf::create(&mut alloc)?;

        let values = [
            Value::Null,
            Value::Int(-42),
            Value::Bool(true),
            Value::Float(2.5),
            Value::Double(-0.125),
            Value::String("mixed!".into()),
            Value::Binary(vec![1, 2, 3]),
            Value::Timestamp(Timestamp::new(1_700_000_000, 17)),
            Value::Decimal(Decimal128([9u8; 16])),
            Value::ObjectId(ObjectId([4u8; 12])),
            Value::Uuid(Uuid([8u8; 16])),
            Value::Link(ObjKey(77)),
        ];

        for (i, v) in values.iter().enumerate() {
            leaf.insert(&mut alloc, i, v)?;
        }

        for (i, v) in values.iter().enumerate() {
            assert_eq!(*v, leaf.get(&alloc, i)?, "variant {i}");
        }

        // overwrite with a different type
        leaf.set(&mut alloc, 1, &Value::String("was an int".into()))?;
        assert_eq!(Value::String("was an int".into()), leaf.get(&alloc, 1)?);

        leaf.erase(&mut alloc, 0)?;
        assert_eq!(values.len() - 1, leaf.len(&alloc)?);

        Ok(())
    }
}
