// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::varlen::VarLenLeaf;
use super::{merge_scalar, null_rejected, split_scalar, type_mismatch, CreateLike, LeafOps};
use crate::alloc::{Ref, SlabAlloc};
use crate::array::Array;
use crate::node::Encoding;
use crate::value::Value;
use crate::{Error, Result};

/// Longest string kept in the short (fixed-slot) tier
const SHORT_MAX: usize = 15;

/// Slot size of the short tier: 15 payload bytes plus a trailing length
/// marker
const SHORT_SLOT: usize = 16;

/// Length-marker value for null
const SHORT_NULL: u8 = 0xFF;

/// String column leaf
///
/// Starts in the short tier (fixed 16-byte slots); transitions to the
/// medium tier above 15 bytes and to the big tier above 63 bytes, never
/// back.
#[derive(Clone, Debug)]
pub struct StringLeaf {
    root: Ref,
    nullable: bool,
}

enum Repr {
    Short(Array),
    VarLen(VarLenLeaf),
}

impl StringLeaf {
    pub(crate) fn create(alloc: &mut SlabAlloc, nullable: bool) -> Result<Self> {
        Ok(Self {
            root: Array::create_bytes(alloc, SHORT_SLOT, 0)?.root(),
            nullable,
        })
    }

    pub(crate) fn attach(root: Ref, nullable: bool) -> Self {
        Self { root, nullable }
    }

    fn repr(&self, alloc: &SlabAlloc) -> Result<Repr> {
        let header = Array::from_ref(self.root).header(alloc)?;
        if header.encoding == Encoding::WidthMultiply {
            Ok(Repr::Short(Array::from_ref(self.root)))
        } else {
            Ok(Repr::VarLen(VarLenLeaf::attach(self.root, self.nullable)))
        }
    }

    fn encode<'a>(&self, value: &'a Value) -> Result<Option<&'a [u8]>> {
        match value {
            Value::String(v) => Ok(Some(v.as_bytes())),
            Value::Null if self.nullable => Ok(None),
            Value::Null => Err(null_rejected("string")),
            other => Err(type_mismatch("string", other)),
        }
    }

    fn short_slot(value: Option<&[u8]>) -> [u8; SHORT_SLOT] {
        let mut slot = [0u8; SHORT_SLOT];
        match value {
            None => slot[SHORT_SLOT - 1] = SHORT_NULL,
            Some(bytes) => {
                slot[..bytes.len()].copy_from_slice(bytes);
                slot[SHORT_SLOT - 1] = bytes.len() as u8;
            }
        }
        slot
    }

    fn decode_short(slot: &[u8]) -> Result<Option<&[u8]>> {
        match slot[SHORT_SLOT - 1] {
            SHORT_NULL => Ok(None),
            len if (len as usize) <= SHORT_MAX => Ok(Some(&slot[..len as usize])),
            len => Err(Error::corrupt(format!("bad short-string length {len}"))),
        }
    }

    /// Moves a short-tier leaf to the medium tier (the subsequent store
    /// may push it further to big).
    fn upgrade(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        let Repr::Short(short) = self.repr(alloc)? else {
            return Ok(());
        };

        log::trace!("upgrading string leaf {} out of the short tier", self.root);

        let n = short.len(alloc)?;
        let mut inner = VarLenLeaf::create(alloc, self.nullable)?;
        for i in 0..n {
            let slot = short.get_bytes(alloc, i)?;
            let value = Self::decode_short(slot)?.map(<[u8]>::to_vec);
            inner.insert(alloc, i, value.as_deref())?;
        }

        short.destroy_deep(alloc)?;
        self.root = inner.root();
        Ok(())
    }

    fn store(
        &mut self,
        alloc: &mut SlabAlloc,
        idx: usize,
        value: Option<&[u8]>,
        insert: bool,
    ) -> Result<()> {
        if value.is_some_and(|v| v.len() > SHORT_MAX) {
            self.upgrade(alloc)?;
        }

        match self.repr(alloc)? {
            Repr::Short(mut short) => {
                let slot = Self::short_slot(value);
                if insert {
                    short.insert_bytes(alloc, idx, &slot)?;
                } else {
                    short.set_bytes(alloc, idx, &slot)?;
                }
                self.root = short.root();
            }
            Repr::VarLen(mut inner) => {
                if insert {
                    inner.insert(alloc, idx, value)?;
                } else {
                    inner.set(alloc, idx, value)?;
                }
                self.root = inner.root();
            }
        }

        Ok(())
    }

    /// Returns the smallest row whose string equals `needle` (used by
    /// the search index and by primary-key lookups).
    pub fn find_first(&self, alloc: &SlabAlloc, needle: &str) -> Result<Option<usize>> {
        let n = self.len(alloc)?;
        for i in 0..n {
            if let Value::String(s) = self.get(alloc, i)? {
                if s == needle {
                    return Ok(Some(i));
                }
            }
        }
        Ok(None)
    }
}

impl LeafOps for StringLeaf {
    fn root(&self) -> Ref {
        self.root
    }

    fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        match self.repr(alloc)? {
            Repr::Short(short) => short.len(alloc),
            Repr::VarLen(inner) => inner.len(alloc),
        }
    }

    fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Value> {
        let bytes = match self.repr(alloc)? {
            Repr::Short(short) => Self::decode_short(short.get_bytes(alloc, idx)?)?
                .map(<[u8]>::to_vec),
            Repr::VarLen(inner) => inner.get(alloc, idx)?,
        };

        match bytes {
            None => Ok(Value::Null),
            Some(bytes) => String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|_| Error::corrupt("string payload is not UTF-8")),
        }
    }

    fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let bytes = self.encode(value)?;
        self.store(alloc, idx, bytes, false)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        let bytes = self.encode(value)?;
        self.store(alloc, idx, bytes, true)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        match self.repr(alloc)? {
            Repr::Short(mut short) => {
                short.erase_bytes(alloc, idx)?;
                self.root = short.root();
            }
            Repr::VarLen(mut inner) => {
                inner.erase(alloc, idx)?;
                self.root = inner.root();
            }
        }
        Ok(())
    }

    fn split(&mut self, alloc: &mut SlabAlloc, at: usize) -> Result<Ref> {
        split_scalar(self, alloc, at)
    }

    fn merge_from(&mut self, alloc: &mut SlabAlloc, right: Ref) -> Result<()> {
        merge_scalar(self, alloc, right)
    }

    fn destroy(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        match self.repr(alloc)? {
            Repr::Short(short) => short.destroy_deep(alloc),
            Repr::VarLen(mut inner) => inner.destroy(alloc),
        }
    }
}

impl CreateLike for StringLeaf {
    fn create_like(&self, alloc: &mut SlabAlloc) -> Result<Self> {
        Self::create(alloc, self.nullable)
    }

    fn attach_like(&self, root: Ref) -> Self {
        Self::attach(root, self.nullable)
    }
}
