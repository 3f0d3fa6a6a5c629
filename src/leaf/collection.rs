// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{ColumnLeaf, LeafOps};
use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::array::{clone_deep, destroy_deep_ref, Array};
use crate::keys::{CollectionKind, ColumnType};
use crate::node::NodeFlags;
use crate::value::Value;
use crate::{Error, Result};

/// Column leaf of a collection column: one ref per row pointing at the
/// row's collection node (null ref = empty)
///
/// * list / set rows reference a scalar leaf of the element type
/// * dictionary rows reference a `[keys_ref, values_ref]` parent
#[derive(Clone, Debug)]
pub struct CollectionLeaf {
    arr: Array,
    elem_type: ColumnType,
    kind: CollectionKind,
    nullable: bool,
}

impl CollectionLeaf {
    pub(crate) fn create(
        alloc: &mut SlabAlloc,
        elem_type: ColumnType,
        kind: CollectionKind,
        nullable: bool,
    ) -> Result<Self> {
        Ok(Self {
            arr: Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?,
            elem_type,
            kind,
            nullable,
        })
    }

    pub(crate) fn attach(
        root: Ref,
        elem_type: ColumnType,
        kind: CollectionKind,
        nullable: bool,
    ) -> Self {
        Self {
            arr: Array::from_ref(root),
            elem_type,
            kind,
            nullable,
        }
    }

    /// Element type of the collection.
    #[must_use]
    pub fn elem_type(&self) -> ColumnType {
        self.elem_type
    }

    /// Collection kind of the column.
    #[must_use]
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// Whether elements may be null.
    #[must_use]
    pub fn elem_nullable(&self) -> bool {
        self.nullable
    }

    /// Ref of row `idx`'s collection node (null if the row's collection
    /// is empty).
    pub fn collection_ref(&self, alloc: &SlabAlloc, idx: usize) -> Result<Ref> {
        self.arr.get_ref(alloc, idx)
    }

    /// Re-references row `idx`'s collection node.
    pub fn set_collection_ref(
        &mut self,
        alloc: &mut SlabAlloc,
        idx: usize,
        ref_: Ref,
    ) -> Result<()> {
        self.arr.set_ref(alloc, idx, ref_)
    }

    /// Materializes row `idx`'s collection node if absent and returns it.
    pub fn ensure_collection(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<Ref> {
        let existing = self.collection_ref(alloc, idx)?;
        if existing != NULL_REF {
            return Ok(existing);
        }

        let fresh = match self.kind {
            CollectionKind::Dictionary => {
                let keys = ColumnLeaf::create(
                    alloc,
                    ColumnType::String,
                    CollectionKind::Scalar,
                    false,
                )?;
                let values = ColumnLeaf::create(
                    alloc,
                    self.elem_type,
                    CollectionKind::Scalar,
                    self.nullable,
                )?;

                let mut parent = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
                parent.push(alloc, keys.root() as i64)?;
                parent.push(alloc, values.root() as i64)?;
                parent.root()
            }
            CollectionKind::List | CollectionKind::Set => {
                ColumnLeaf::create(alloc, self.elem_type, CollectionKind::Scalar, self.nullable)?
                    .root()
            }
            CollectionKind::Scalar => {
                return Err(Error::logic("scalar column used as collection"))
            }
        };

        self.set_collection_ref(alloc, idx, fresh)?;
        Ok(fresh)
    }
}

impl LeafOps for CollectionLeaf {
    fn root(&self) -> Ref {
        self.arr.root()
    }

    fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.arr.len(alloc)
    }

    fn get(&self, _alloc: &SlabAlloc, _idx: usize) -> Result<Value> {
        Err(Error::logic(
            "collection columns are read through collection accessors",
        ))
    }

    fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        // assigning null clears the row's collection
        if !value.is_null() {
            return Err(Error::logic(
                "collection columns are written through collection accessors",
            ));
        }

        let existing = self.collection_ref(alloc, idx)?;
        if existing != NULL_REF {
            destroy_deep_ref(alloc, existing)?;
        }
        self.set_collection_ref(alloc, idx, NULL_REF)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: &Value) -> Result<()> {
        if !value.is_null() {
            return Err(Error::logic(
                "collection columns are written through collection accessors",
            ));
        }
        self.arr.insert(alloc, idx, 0)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        let existing = self.collection_ref(alloc, idx)?;
        if existing != NULL_REF {
            destroy_deep_ref(alloc, existing)?;
        }
        self.arr.erase(alloc, idx)
    }

    fn split(&mut self, alloc: &mut SlabAlloc, at: usize) -> Result<Ref> {
        let n = self.arr.len(alloc)?;
        let mut right = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;

        for i in at..n {
            let slot = self.collection_ref(alloc, i)?;
            let moved = if slot == NULL_REF {
                0
            } else {
                clone_deep(alloc, slot)? as i64
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
            let slot = right_arr.get_ref(alloc, i)?;
            let moved = if slot == NULL_REF {
                0
            } else {
                clone_deep(alloc, slot)? as i64
            };
            self.arr.push(alloc, moved)?;
        }

        destroy_deep_ref(alloc, right)
    }

    fn destroy(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.arr.destroy_deep(alloc)
    }
}
