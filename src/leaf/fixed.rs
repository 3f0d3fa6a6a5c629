// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fixed-slot leaves: Decimal128 (16 bytes), ObjectId (12 bytes) and
//! UUID (16 bytes). All three are byte-packed `WidthMultiply` nodes with
//! a type-specific null sentinel.

use super::{merge_scalar, null_rejected, split_scalar, type_mismatch, CreateLike, LeafOps};
use crate::alloc::{Ref, SlabAlloc};
use crate::array::Array;
use crate::value::{Decimal128, ObjectId, Uuid, Value};
use crate::Result;

macro_rules! fixed_leaf {
    ($leaf:ident, $name:literal, $bytes:expr, $variant:ident, $inner:ty, $null_bytes:expr) => {
        #[doc = concat!("Column leaf of ", $name, " slots")]
        #[derive(Clone, Debug)]
        pub struct $leaf {
            arr: Array,
            nullable: bool,
        }

        impl $leaf {
            pub(crate) fn create(alloc: &mut SlabAlloc, nullable: bool) -> Result<Self> {
                Ok(Self {
                    arr: Array::create_bytes(alloc, $bytes, 0)?,
                    nullable,
                })
            }

            pub(crate) fn attach(root: Ref, nullable: bool) -> Self {
                Self {
                    arr: Array::from_ref(root),
                    nullable,
                }
            }

            fn encode(&self, value: &Value) -> Result<[u8; $bytes]> {
                match value {
                    Value::$variant(v) => Ok(v.0),
                    Value::Null if self.nullable => Ok($null_bytes),
                    Value::Null => Err(null_rejected($name)),
                    other => Err(type_mismatch($name, other)),
                }
            }
        }

        impl LeafOps for $leaf {
            fn root(&self) -> Ref {
                self.arr.root()
            }

            fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
                self.arr.len(alloc)
            }

            fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Value> {
                let mut bytes = [0u8; $bytes];
                bytes.copy_from_slice(self.arr.get_bytes(alloc, idx)?);

                let v = <$inner>::from_bytes(bytes);
                if self.nullable && v.is_leaf_null() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::$variant(v))
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

        impl CreateLike for $leaf {
            fn create_like(&self, alloc: &mut SlabAlloc) -> Result<Self> {
                Self::create(alloc, self.nullable)
            }

            fn attach_like(&self, root: Ref) -> Self {
                Self::attach(root, self.nullable)
            }
        }
    };
}

impl Decimal128 {
    fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    fn is_leaf_null(&self) -> bool {
        self.is_null()
    }
}

impl ObjectId {
    fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    fn is_leaf_null(&self) -> bool {
        self.is_null()
    }
}

impl Uuid {
    fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    fn is_leaf_null(&self) -> bool {
        self.is_null()
    }
}

fixed_leaf!(DecimalLeaf, "decimal", 16, Decimal, Decimal128, Decimal128::null().0);
fixed_leaf!(ObjectIdLeaf, "objectid", 12, ObjectId, ObjectId, [0u8; 12]);
fixed_leaf!(UuidLeaf, "uuid", 16, Uuid, Uuid, [0u8; 16]);

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
    fn object_id_roundtrip_with_nulls() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut leaf = ObjectIdLeaf::create(&mut alloc, true)?;

        let oid = ObjectId(*b"abcdefghijkl");
        leaf.insert(&mut alloc, 0, &Value::ObjectId(oid))?;
        leaf.insert(&mut alloc, 1, &Value::Null)?;

        assert_eq!(Value::ObjectId(oid), leaf.get(&alloc, 0)?);
        assert_eq!(Value::Null, leaf.get(&alloc, 1)?);

        Ok(())
    }

    #[test]
    fn uuid_and_decimal() -> crate::Result<()> {
        let mut alloc = alloc();

        let mut uuids = UuidLeaf::create(&mut alloc, false)?;
        let id = Uuid([7u8; 16]);
        uuids.insert(&mut alloc, 0, &Value::Uuid(id))?;
        assert_eq!(Value::Uuid(id), uuids.get(&alloc, 0)?);
        assert!(uuids.insert(&mut alloc, 1, &Value::Null).is_err());

        let mut decimals = DecimalLeaf::create(&mut alloc, true)?;
        let d = Decimal128([3u8; 16]);
        decimals.insert(&mut alloc, 0, &Value::Decimal(d))?;
        decimals.insert(&mut alloc, 1, &Value::Null)?;
        assert_eq!(Value::Decimal(d), decimals.get(&alloc, 0)?);
        assert_eq!(Value::Null, decimals.get(&alloc, 1)?);

        Ok(())
    }
}
