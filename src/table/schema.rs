// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-table schema node.
//!
//! Shape (a `has_refs` parent referenced from the table root):
//!
//! ```text
//! slot 0  column name ids (interned)
//! slot 1  packed ColKeys
//! slot 2  link targets (TableKey + 1, or 0)
//! slot 3  paired column tags (backlink tag for links, origin tag for
//!         backlinks, or 0)
//! slot 4  per-column search index refs (0 = none)
//! slot 5  next column tag (tagged int)
//! ```

use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::array::Array;
use crate::cluster::ColumnSpec;
use crate::interner::StringId;
use crate::keys::{CollectionKind, ColKey, ColumnType, TableKey};
use crate::node::NodeFlags;
use crate::{Error, Result};

/// Accessor of a table's schema node
#[derive(Copy, Clone, Debug)]
pub struct TableSpec {
    parent: Array,
}

/// Full description of one column
#[derive(Copy, Clone, Debug)]
pub struct ColumnDesc {
    /// Interned name
    pub name_id: StringId,

    /// The packed key handed to callers
    pub key: ColKey,

    /// Link/backlink peer table
    pub target: Option<TableKey>,

    /// Tag of the paired column in the peer table
    pub paired_tag: u16,

    /// Search index node (null ref = none)
    pub index_ref: Ref,
}

impl TableSpec {
    /// Creates an empty schema node.
    pub fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        let names = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let keys = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let targets = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let paired = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let indexes = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;

        let mut parent = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
        parent.push(alloc, names.root() as i64)?;
        parent.push(alloc, keys.root() as i64)?;
        parent.push(alloc, targets.root() as i64)?;
        parent.push(alloc, paired.root() as i64)?;
        parent.push(alloc, indexes.root() as i64)?;
        parent.push(alloc, crate::array::tag_int(1))?;

        Ok(Self { parent })
    }

    /// Wraps an existing schema node.
    #[must_use]
    pub fn from_ref(root: Ref) -> Self {
        Self {
            parent: Array::from_ref(root),
        }
    }

    /// Current root ref.
    #[must_use]
    pub fn root(&self) -> Ref {
        self.parent.root()
    }

    fn slot(&self, alloc: &SlabAlloc, i: usize) -> Result<Array> {
        Ok(Array::from_ref(self.parent.get_ref(alloc, i)?))
    }

    /// Number of columns (including backlink columns).
    pub fn column_count(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.slot(alloc, 1)?.len(alloc)
    }

    /// Describes column `i`.
    pub fn column(&self, alloc: &SlabAlloc, i: usize) -> Result<ColumnDesc> {
        let key = ColKey(self.slot(alloc, 1)?.get(alloc, i)?);
        let raw_target = self.slot(alloc, 2)?.get(alloc, i)?;

        Ok(ColumnDesc {
            name_id: self.slot(alloc, 0)?.get(alloc, i)? as StringId,
            key,
            target: if raw_target == 0 {
                None
            } else {
                Some(TableKey((raw_target - 1) as u32))
            },
            paired_tag: self.slot(alloc, 3)?.get(alloc, i)? as u16,
            index_ref: self.slot(alloc, 4)?.get_ref(alloc, i)?,
        })
    }

    /// All columns in storage order.
    pub fn columns(&self, alloc: &SlabAlloc) -> Result<Vec<ColumnDesc>> {
        (0..self.column_count(alloc)?)
            .map(|i| self.column(alloc, i))
            .collect()
    }

    /// The cluster-layer storage specs, in storage order.
    pub fn column_specs(&self, alloc: &SlabAlloc) -> Result<Vec<ColumnSpec>> {
        self.columns(alloc)?
            .iter()
            .map(|desc| {
                Ok(ColumnSpec {
                    col_type: desc.key.column_type()?,
                    kind: desc.key.collection_kind()?,
                    nullable: desc.key.is_nullable(),
                })
            })
            .collect()
    }

    /// Finds a column by interned name (backlink columns are unnamed and
    /// never returned).
    pub fn find_by_name(&self, alloc: &SlabAlloc, name_id: StringId) -> Result<Option<ColumnDesc>> {
        for desc in self.columns(alloc)? {
            if desc.name_id == name_id && desc.key.column_type()? != ColumnType::Backlink {
                return Ok(Some(desc));
            }
        }
        Ok(None)
    }

    /// Finds a column by its tag (stable across removals of other
    /// columns).
    pub fn find_by_tag(&self, alloc: &SlabAlloc, tag: u16) -> Result<Option<(usize, ColumnDesc)>> {
        for i in 0..self.column_count(alloc)? {
            let desc = self.column(alloc, i)?;
            if desc.key.tag() == tag {
                return Ok(Some((i, desc)));
            }
        }
        Ok(None)
    }

    /// Validates a caller-supplied key against the live schema and
    /// returns the column's storage index.
    pub fn check_key(&self, alloc: &SlabAlloc, key: ColKey) -> Result<usize> {
        let i = key.index();
        if i < self.column_count(alloc)? && self.column(alloc, i)?.key == key {
            return Ok(i);
        }

        // columns shift left when an earlier column is removed; the tag
        // still identifies the survivor
        if let Some((j, desc)) = self.find_by_tag(alloc, key.tag())? {
            if desc.key.column_type()? == key.column_type()? {
                return Ok(j);
            }
        }

        Err(Error::KeyNotFound)
    }

    #[expect(clippy::too_many_arguments)]
    pub(crate) fn append_column(
        &mut self,
        alloc: &mut SlabAlloc,
        name_id: StringId,
        col_type: ColumnType,
        kind: CollectionKind,
        nullable: bool,
        strong: bool,
        target: Option<TableKey>,
        paired_tag: u16,
    ) -> Result<ColKey> {
        let index = self.column_count(alloc)?;
        let tag = self.take_tag(alloc)?;
        let key = ColKey::new(index, col_type, kind, nullable, strong, false, tag);

        let mut names = self.slot(alloc, 0)?;
        names.push(alloc, i64::from(name_id))?;
        self.parent.set_ref(alloc, 0, names.root())?;

        let mut keys = self.slot(alloc, 1)?;
        keys.push(alloc, key.0)?;
        self.parent.set_ref(alloc, 1, keys.root())?;

        let mut targets = self.slot(alloc, 2)?;
        targets.push(alloc, target.map_or(0, |t| i64::from(t.0) + 1))?;
        self.parent.set_ref(alloc, 2, targets.root())?;

        let mut paired = self.slot(alloc, 3)?;
        paired.push(alloc, i64::from(paired_tag))?;
        self.parent.set_ref(alloc, 3, paired.root())?;

        let mut indexes = self.slot(alloc, 4)?;
        indexes.push(alloc, 0)?;
        self.parent.set_ref(alloc, 4, indexes.root())?;

        Ok(key)
    }

    /// Removes column `i`'s metadata (the cluster tree is adjusted by
    /// the caller). Keys of later columns are re-packed with their new
    /// index but keep their tags.
    pub(crate) fn remove_column(&mut self, alloc: &mut SlabAlloc, i: usize) -> Result<()> {
        let desc = self.column(alloc, i)?;
        if desc.index_ref != NULL_REF {
            crate::interner::SearchIndex::from_ref(desc.index_ref).destroy(alloc)?;
        }

        for slot_idx in 0..5 {
            let mut arr = self.slot(alloc, slot_idx)?;
            arr.erase(alloc, i)?;
            self.parent.set_ref(alloc, slot_idx, arr.root())?;
        }

        // re-pack the shifted keys
        let mut keys = self.slot(alloc, 1)?;
        for j in i..keys.len(alloc)? {
            let old = ColKey(keys.get(alloc, j)?);
            let renumbered = ColKey::new(
                j,
                old.column_type()?,
                old.collection_kind()?,
                old.is_nullable(),
                old.is_strong_link(),
                old.is_indexed(),
                old.tag(),
            );
            keys.set(alloc, j, renumbered.0)?;
        }
        self.parent.set_ref(alloc, 1, keys.root())?;

        Ok(())
    }

    /// Stores the search-index ref of column `i` and re-packs its key
    /// with the indexed bit.
    pub(crate) fn set_index_ref(
        &mut self,
        alloc: &mut SlabAlloc,
        i: usize,
        index_ref: Ref,
    ) -> Result<ColKey> {
        let mut indexes = self.slot(alloc, 4)?;
        indexes.set(alloc, i, index_ref as i64)?;
        self.parent.set_ref(alloc, 4, indexes.root())?;

        let mut keys = self.slot(alloc, 1)?;
        let old = ColKey(keys.get(alloc, i)?);
        let updated = ColKey::new(
            i,
            old.column_type()?,
            old.collection_kind()?,
            old.is_nullable(),
            old.is_strong_link(),
            index_ref != NULL_REF,
            old.tag(),
        );
        keys.set(alloc, i, updated.0)?;
        self.parent.set_ref(alloc, 1, keys.root())?;

        Ok(updated)
    }

    /// Pairs column `i` with a peer column's tag (link/backlink
    /// symmetry bookkeeping).
    pub(crate) fn set_paired_tag(
        &mut self,
        alloc: &mut SlabAlloc,
        i: usize,
        paired_tag: u16,
    ) -> Result<()> {
        let mut paired = self.slot(alloc, 3)?;
        paired.set(alloc, i, i64::from(paired_tag))?;
        self.parent.set_ref(alloc, 3, paired.root())
    }

    fn take_tag(&mut self, alloc: &mut SlabAlloc) -> Result<u16> {
        let tag = self.parent.get_tagged(alloc, 5)?;
        self.parent.set_tagged(alloc, 5, tag + 1)?;
        Ok(tag as u16)
    }
}
