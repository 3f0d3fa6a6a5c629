// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{merge_scalar, null_rejected, split_scalar, type_mismatch, CreateLike, LeafOps};
use crate::alloc::{Ref, SlabAlloc};
use crate::array::Array;
use crate::value::{Value, NULL_DOUBLE_BITS, NULL_FLOAT_BITS};
use crate::Result;
use byteorder::{ByteOrder, LittleEndian};

/// 32-bit float column leaf; null is a reserved NaN bit pattern
#[derive(Clone, Debug)]
pub struct FloatLeaf {
    arr: Array,
    nullable: bool,
}

impl FloatLeaf {
    pub(crate) fn create(alloc: &mut SlabAlloc, nullable: bool) -> Result<Self> {
        Ok(Self {
            arr: Array::create_bytes(alloc, 4, 0)?,
            nullable,
        })
    }

    pub(crate) fn attach(root: Ref, nullable: bool) -> Self {
        Self {
            arr: Array::from_ref(root),
            nullable,
        }
    }

    fn encode(&self, value: &Value) -> Result<[u8; 4]> {
        let bits = match value {
            Value::Float(v) => Value::canonical_float_bits(*v),
            Value::Null if self.nullable => NULL_FLOAT_BITS,
            Value::Null => return Err(null_rejected("float")),
            other => return Err(type_mismatch("float", other)),
        };

        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, bits);
        Ok(buf)
    }
}

impl LeafOps for FloatLeaf {
    fn root(&self) -> Ref {
        self.arr.root()
    }

    fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.arr.len(alloc)
    }

    fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Value> {
        let bits = LittleEndian::read_u32(self.arr.get_bytes(alloc, idx)?);
        if bits == NULL_FLOAT_BITS {
            Ok(Value::Null)
        } else {
            Ok(Value::Float(f32::from_bits(bits)))
        }
    }

    fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let buf = self.encode(value)?;
        self.arr.set_bytes(alloc, idx, &buf)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let buf = self.encode(value)?;
        self.arr.insert_bytes(alloc, idx, &buf)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        self.arr.erase_bytes(alloc, idx)
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

impl CreateLike for FloatLeaf {
    fn create_like(&self, alloc: &mut SlabAlloc) -> Result<Self> {
        Self::create(alloc, self.nullable)
    }

    fn attach_like(&self, root: Ref) -> Self {
        Self::attach(root, self.nullable)
    }
}

/// 64-bit float column leaf; null is a reserved NaN bit pattern
#[derive(Clone, Debug)]
pub struct DoubleLeaf {
    arr: Array,
    nullable: bool,
}

impl DoubleLeaf {
    pub(crate) fn create(alloc: &mut SlabAlloc, nullable: bool) -> Result<Self> {
        Ok(Self {
            arr: Array::create_bytes(alloc, 8, 0)?,
            nullable,
        })
    }

    pub(crate) fn attach(root: Ref, nullable: bool) -> Self {
        Self {
            arr: Array::from_ref(root),
            nullable,
        }
    }

    fn encode(&self, value: &Value) -> Result<[u8; 8]> {
        let bits = match value {
            Value::Double(v) => Value::canonical_double_bits(*v),
            Value::Null if self.nullable => NULL_DOUBLE_BITS,
            Value::Null => return Err(null_rejected("double")),
            other => return Err(type_mismatch("double", other)),
        };

        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, bits);
        Ok(buf)
    }
}

impl LeafOps for DoubleLeaf {
    fn root(&self) -> Ref {
        self.arr.root()
    }

    fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.arr.len(alloc)
    }

    fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Value> {
        let bits = LittleEndian::read_u64(self.arr.get_bytes(alloc, idx)?);
        if bits == NULL_DOUBLE_BITS {
            Ok(Value::Null)
        } else {
            Ok(Value::Double(f64::from_bits(bits)))
        }
    }

    fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let buf = self.encode(value)?;
        self.arr.set_bytes(alloc, idx, &buf)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let buf = self.encode(value)?;
        self.arr.insert_bytes(alloc, idx, &buf)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        self.arr.erase_bytes(alloc, idx)
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

impl CreateLike for DoubleLeaf {
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
    fn float_nulls_and_nans() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = FloatLeaf::create(&mut alloc, true)?;

        leaf.insert(&mut alloc, 0, &Value::Float(1.5))?;
        leaf.insert(&mut alloc, 1, &Value::Null)?;
        leaf.insert(&mut alloc, 2, &Value::Float(f32::NAN))?;

        assert_eq!(Value::Float(1.5), leaf.get(&alloc, 0)?);
        assert_eq!(Value::Null, leaf.get(&alloc, 1)?);

        // user NaN stays NaN, it does not read back as null
        match leaf.get(&alloc, 2)? {
            Value::Float(v) => assert!(v.is_nan()),
            other => panic!("expected NaN float, got {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn double_roundtrip() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = DoubleLeaf::create(&mut alloc, false)?;

        leaf.insert(&mut alloc, 0, &Value::Double(std::f64::consts::PI))?;
        leaf.insert(&mut alloc, 1, &Value::Double(-0.0))?;

        assert_eq!(Value::Double(std::f64::consts::PI), leaf.get(&alloc, 0)?);
        assert_eq!(Value::Double(-0.0), leaf.get(&alloc, 1)?);
        assert!(leaf.set(&mut alloc, 0, &Value::Null).is_err());

        Ok(())
    }
}
