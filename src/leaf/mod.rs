// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The variant leaf family: every column of a cluster is one of these,
//! all built on the same node layer.
//!
//! Dispatch is a tagged enum rather than virtual inheritance; the
//! cluster layer only sees [`LeafOps`].

pub mod collection;
pub mod fixed;
pub mod float;
pub mod int;
pub mod link;
pub mod mixed;
pub mod string;
pub mod timestamp;
pub mod varlen;

use crate::alloc::{Ref, SlabAlloc};
use crate::keys::{CollectionKind, ColumnType};
use crate::value::Value;
use crate::{Error, Result};
use enum_dispatch::enum_dispatch;

pub use collection::CollectionLeaf;
pub use fixed::{DecimalLeaf, ObjectIdLeaf, UuidLeaf};
pub use float::{DoubleLeaf, FloatLeaf};
pub use int::{BoolLeaf, IntLeaf};
pub use link::{BacklinkLeaf, LinkLeaf};
pub use mixed::MixedLeaf;
pub use string::StringLeaf;
pub use timestamp::TimestampLeaf;
pub use varlen::BinaryLeaf;

/// Uniform operations table of every column leaf
#[enum_dispatch]
pub trait LeafOps {
    /// Current root ref (changes on CoW; the owner re-references it).
    fn root(&self) -> Ref;

    /// Number of rows.
    fn len(&self, alloc: &SlabAlloc) -> Result<usize>;

    /// Reads the value at `idx`.
    fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<Value>;

    /// Overwrites the value at `idx`.
    fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()>;

    /// Inserts a value before `idx`.
    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()>;

    /// Removes the value at `idx`, releasing any payload nodes.
    fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()>;

    /// Moves rows `[at, len)` into a fresh sibling leaf; returns the
    /// sibling's root.
    fn split(&mut self, alloc: &mut SlabAlloc, at: usize) -> Result<Ref>;

    /// Appends all rows of the sibling leaf at `right` and destroys it.
    fn merge_from(&mut self, alloc: &mut SlabAlloc, right: Ref) -> Result<()>;

    /// Destroys the leaf and all payload nodes.
    fn destroy(&mut self, alloc: &mut SlabAlloc) -> Result<()>;
}

/// Construction counterpart of [`LeafOps`]: create or re-attach a leaf
/// with the same configuration
pub(crate) trait CreateLike: Sized {
    fn create_like(&self, alloc: &mut SlabAlloc) -> Result<Self>;
    fn attach_like(&self, root: Ref) -> Self;
}

/// Value-copying split shared by the scalar leaves.
pub(crate) fn split_scalar<L: LeafOps + CreateLike>(
    leaf: &mut L,
    alloc: &mut SlabAlloc,
    at: usize,
) -> Result<Ref> {
    let n = leaf.len(alloc)?;
    if at > n {
        return Err(Error::logic("split position out of bounds"));
    }

    let mut right = leaf.create_like(alloc)?;
    for i in at..n {
        let v = leaf.get(alloc, i)?;
        right.insert(alloc, i - at, &v)?;
    }

    for i in (at..n).rev() {
        leaf.erase(alloc, i)?;
    }

    Ok(right.root())
}

/// Value-copying merge shared by the scalar leaves.
pub(crate) fn merge_scalar<L: LeafOps + CreateLike>(
    leaf: &mut L,
    alloc: &mut SlabAlloc,
    right: Ref,
) -> Result<()> {
    let mut right = leaf.attach_like(right);
    let n = right.len(alloc)?;

    for i in 0..n {
        let v = right.get(alloc, i)?;
        let at = leaf.len(alloc)?;
        leaf.insert(alloc, at, &v)?;
    }

    right.destroy(alloc)
}

/// One column leaf of a cluster
#[enum_dispatch(LeafOps)]
#[derive(Clone, Debug)]
pub enum ColumnLeaf {
    /// Integer (optionally nullable via a width-dependent sentinel)
    Int(IntLeaf),
    /// Boolean
    Bool(BoolLeaf),
    /// 32-bit float
    Float(FloatLeaf),
    /// 64-bit float
    Double(DoubleLeaf),
    /// String (short / medium / big tier)
    String(StringLeaf),
    /// Binary blob
    Binary(BinaryLeaf),
    /// Timestamp (seconds + nanoseconds)
    Timestamp(TimestampLeaf),
    /// Decimal128
    Decimal(DecimalLeaf),
    /// ObjectId
    ObjectId(ObjectIdLeaf),
    /// UUID
    Uuid(UuidLeaf),
    /// Dynamically typed
    Mixed(MixedLeaf),
    /// Forward link
    Link(LinkLeaf),
    /// Reverse link bookkeeping
    Backlink(BacklinkLeaf),
    /// Per-row list / set / dictionary
    Collection(CollectionLeaf),
}

impl ColumnLeaf {
    /// Creates an empty leaf for a column.
    pub fn create(
        alloc: &mut SlabAlloc,
        col_type: ColumnType,
        kind: CollectionKind,
        nullable: bool,
    ) -> Result<Self> {
        if kind != CollectionKind::Scalar && col_type != ColumnType::Backlink {
            return Ok(Self::Collection(CollectionLeaf::create(
                alloc, col_type, kind, nullable,
            )?));
        }

        Ok(match col_type {
            ColumnType::Int => Self::Int(IntLeaf::create(alloc, nullable)?),
            ColumnType::Bool => Self::Bool(BoolLeaf::create(alloc, nullable)?),
            ColumnType::Float => Self::Float(FloatLeaf::create(alloc, nullable)?),
            ColumnType::Double => Self::Double(DoubleLeaf::create(alloc, nullable)?),
            ColumnType::String => Self::String(StringLeaf::create(alloc, nullable)?),
            ColumnType::Binary => Self::Binary(BinaryLeaf::create(alloc, nullable)?),
            ColumnType::Timestamp => Self::Timestamp(TimestampLeaf::create(alloc, nullable)?),
            ColumnType::Decimal => Self::Decimal(DecimalLeaf::create(alloc, nullable)?),
            ColumnType::ObjectId => Self::ObjectId(ObjectIdLeaf::create(alloc, nullable)?),
            ColumnType::Uuid => Self::Uuid(UuidLeaf::create(alloc, nullable)?),
            ColumnType::Mixed => Self::Mixed(MixedLeaf::create(alloc)?),
            ColumnType::Link => Self::Link(LinkLeaf::create(alloc)?),
            ColumnType::Backlink => Self::Backlink(BacklinkLeaf::create(alloc)?),
        })
    }

    /// Re-attaches a leaf accessor to an existing node.
    #[must_use]
    pub fn attach(
        root: Ref,
        col_type: ColumnType,
        kind: CollectionKind,
        nullable: bool,
    ) -> Self {
        if kind != CollectionKind::Scalar && col_type != ColumnType::Backlink {
            return Self::Collection(CollectionLeaf::attach(root, col_type, kind, nullable));
        }

        match col_type {
            ColumnType::Int => Self::Int(IntLeaf::attach(root, nullable)),
            ColumnType::Bool => Self::Bool(BoolLeaf::attach(root, nullable)),
            ColumnType::Float => Self::Float(FloatLeaf::attach(root, nullable)),
            ColumnType::Double => Self::Double(DoubleLeaf::attach(root, nullable)),
            ColumnType::String => Self::String(StringLeaf::attach(root, nullable)),
            ColumnType::Binary => Self::Binary(BinaryLeaf::attach(root, nullable)),
            ColumnType::Timestamp => Self::Timestamp(TimestampLeaf::attach(root, nullable)),
            ColumnType::Decimal => Self::Decimal(DecimalLeaf::attach(root, nullable)),
            ColumnType::ObjectId => Self::ObjectId(ObjectIdLeaf::attach(root, nullable)),
            ColumnType::Uuid => Self::Uuid(UuidLeaf::attach(root, nullable)),
            ColumnType::Mixed => Self::Mixed(MixedLeaf::attach(root)),
            ColumnType::Link => Self::Link(LinkLeaf::attach(root)),
            ColumnType::Backlink => Self::Backlink(BacklinkLeaf::attach(root)),
        }
    }

    /// Appends a value.
    pub fn push(&mut self, alloc: &mut SlabAlloc, value: &Value) -> Result<()> {
        let at = self.len(alloc)?;
        self.insert(alloc, at, value)
    }
}

pub(crate) fn null_rejected(what: &str) -> Error {
    Error::logic(format!("null value in non-nullable {what} column"))
}

pub(crate) fn type_mismatch(expected: &str, got: &Value) -> Error {
    Error::logic(format!("expected {expected} value, got {got:?}"))
}
