// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The group: the file's root object, mapping table names to table
//! roots and carrying the free-space ledger.
//!
//! Top array (10 `has_refs` slots):
//!
//! ```text
//! 0  table name ids (interned; -1 marks a dead slot)
//! 1  table root refs (parallel; 0 for dead slots)
//! 2  free positions
//! 3  free sizes
//! 4  free versions
//! 5  history ref (reserved for sync collaborators, null here)
//! 6  logical file size (tagged)
//! 7  version counter (tagged)
//! 8  interner ref
//! 9  table tags (parallel to 0; survives slot reuse)
//! ```

use crate::alloc::{FreeRange, Ref, SlabAlloc, NULL_REF};
use crate::array::{destroy_deep_ref, Array};
use crate::cluster::ClusterTree;
use crate::interner::{Interner, StringId};
use crate::keys::TableKey;
use crate::node::NodeFlags;
use crate::table::schema::TableSpec;
use crate::{Error, Result};

/// Number of slots in the group's top array
pub const GROUP_SLOTS: usize = 10;

pub(crate) const SLOT_NAMES: usize = 0;
pub(crate) const SLOT_REFS: usize = 1;
pub(crate) const SLOT_FREE_POSITIONS: usize = 2;
pub(crate) const SLOT_FREE_SIZES: usize = 3;
pub(crate) const SLOT_FREE_VERSIONS: usize = 4;
pub(crate) const SLOT_HISTORY: usize = 5;
pub(crate) const SLOT_FILE_SIZE: usize = 6;
pub(crate) const SLOT_VERSION: usize = 7;
pub(crate) const SLOT_INTERNER: usize = 8;
pub(crate) const SLOT_TABLE_TAGS: usize = 9;

/// Table kind
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableType {
    /// Ordinary top-level table
    TopLevel,

    /// Owned by a row of another table through a strong link column
    Embedded,
}

// Table root slots.
pub(crate) const TABLE_SLOT_SPEC: usize = 0;
pub(crate) const TABLE_SLOT_CLUSTERS: usize = 1;
pub(crate) const TABLE_SLOT_KEY_COUNTER: usize = 2;
pub(crate) const TABLE_SLOT_TYPE: usize = 3;

enum Repr {
    /// Virgin file (null top ref) seen by a reader
    Empty,

    /// Materialized group
    Loaded { top: Array, interner: Interner },
}

/// Accessor of the file root
pub struct Group {
    repr: Repr,
}

impl Group {
    /// Attaches to the group at `top_ref` (null = virgin file).
    #[must_use]
    pub fn attach(top_ref: Ref) -> Self {
        if top_ref == NULL_REF {
            return Self { repr: Repr::Empty };
        }

        Self {
            repr: Repr::Loaded {
                top: Array::from_ref(top_ref),
                interner: Interner::from_ref(NULL_REF),
            },
        }
    }

    /// Finishes attaching: resolves the interner accessor. Separate from
    /// [`Group::attach`] because it needs the allocator.
    pub fn bind(&mut self, alloc: &SlabAlloc) -> Result<()> {
        if let Repr::Loaded { top, interner } = &mut self.repr {
            *interner = Interner::from_ref(top.get_ref(alloc, SLOT_INTERNER)?);
        }
        Ok(())
    }

    /// Materializes a minimum valid group (first write transaction on a
    /// virgin file).
    pub fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        let names = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let refs = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
        let free_positions = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let free_sizes = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let free_versions = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        let interner = Interner::create(alloc)?;
        let tags = Array::create(alloc, NodeFlags::default(), 0, 0)?;

        let mut top = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
        top.push(alloc, names.root() as i64)?;
        top.push(alloc, refs.root() as i64)?;
        top.push(alloc, free_positions.root() as i64)?;
        top.push(alloc, free_sizes.root() as i64)?;
        top.push(alloc, free_versions.root() as i64)?;
        top.push(alloc, 0)?; // history
        top.push(alloc, crate::array::tag_int(0))?; // file size, fixed at commit
        top.push(alloc, crate::array::tag_int(0))?; // version counter
        top.push(alloc, interner.root() as i64)?;
        top.push(alloc, tags.root() as i64)?;

        debug_assert_eq!(GROUP_SLOTS, top.len(alloc)?);

        Ok(Self {
            repr: Repr::Loaded { top, interner },
        })
    }

    /// Returns `true` if this is the virgin-file placeholder.
    #[must_use]
    pub fn is_empty_placeholder(&self) -> bool {
        matches!(self.repr, Repr::Empty)
    }

    fn loaded(&self) -> Result<(&Array, &Interner)> {
        match &self.repr {
            Repr::Loaded { top, interner } => Ok((top, interner)),
            Repr::Empty => Err(Error::logic("group not materialized")),
        }
    }

    fn loaded_mut(&mut self) -> Result<(&mut Array, &mut Interner)> {
        match &mut self.repr {
            Repr::Loaded { top, interner } => Ok((top, interner)),
            Repr::Empty => Err(Error::logic("group not materialized")),
        }
    }

    /// The top node's current ref.
    pub fn top_ref(&self) -> Result<Ref> {
        Ok(self.loaded()?.0.root())
    }

    fn slot_array(&self, alloc: &SlabAlloc, slot: usize) -> Result<Array> {
        let (top, _) = self.loaded()?;
        Ok(Array::from_ref(top.get_ref(alloc, slot)?))
    }

    fn update_slot(&mut self, alloc: &mut SlabAlloc, slot: usize, root: Ref) -> Result<()> {
        let (top, _) = self.loaded_mut()?;
        top.set_ref(alloc, slot, root)
    }

    /// Interns a string through the group, keeping the top slot fresh.
    pub fn intern(&mut self, alloc: &mut SlabAlloc, s: &str) -> Result<StringId> {
        let (_, interner) = self.loaded_mut()?;
        let id = interner.intern(alloc, s)?;
        let root = interner.root();
        self.update_slot(alloc, SLOT_INTERNER, root)?;
        Ok(id)
    }

    /// Read-only interner access.
    pub fn interner(&self) -> Result<&Interner> {
        Ok(self.loaded()?.1)
    }

    /// Looks a string up without interning.
    pub fn lookup_string(&self, alloc: &SlabAlloc, s: &str) -> Result<Option<StringId>> {
        if self.is_empty_placeholder() {
            return Ok(None);
        }
        self.loaded()?.1.lookup(alloc, s)
    }

    /// Resolves an interned id.
    pub fn resolve_string(&self, alloc: &SlabAlloc, id: StringId) -> Result<String> {
        self.loaded()?.1.resolve(alloc, id)
    }

    // ---- table directory -------------------------------------------------

    /// Live tables as `(name_id, key)` pairs, in slot order.
    pub fn tables(&self, alloc: &SlabAlloc) -> Result<Vec<(StringId, TableKey)>> {
        if self.is_empty_placeholder() {
            return Ok(Vec::new());
        }

        let names = self.slot_array(alloc, SLOT_NAMES)?;
        let tags = self.slot_array(alloc, SLOT_TABLE_TAGS)?;

        let mut out = Vec::new();
        for i in 0..names.len(alloc)? {
            let name = names.get(alloc, i)?;
            if name >= 0 {
                let tag = tags.get(alloc, i)? as u32;
                out.push((name as StringId, TableKey::new(i, tag)));
            }
        }
        Ok(out)
    }

    /// Finds a live table by interned name.
    pub fn find_table(&self, alloc: &SlabAlloc, name_id: StringId) -> Result<Option<TableKey>> {
        Ok(self
            .tables(alloc)?
            .into_iter()
            .find(|&(id, _)| id == name_id)
            .map(|(_, key)| key))
    }

    /// Adds a table, reusing the first dead directory slot.
    pub fn add_table(
        &mut self,
        alloc: &mut SlabAlloc,
        name_id: StringId,
        table_type: TableType,
    ) -> Result<TableKey> {
        if self.find_table(alloc, name_id)?.is_some() {
            return Err(Error::ConstraintViolation("duplicate table name".into()));
        }

        let spec = TableSpec::create(alloc)?;
        let clusters = ClusterTree::create(alloc, &[])?;

        let mut table_root = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
        table_root.push(alloc, spec.root() as i64)?;
        table_root.push(alloc, clusters.root() as i64)?;
        table_root.push(alloc, crate::array::tag_int(0))?;
        table_root.push(
            alloc,
            crate::array::tag_int(i64::from(table_type == TableType::Embedded)),
        )?;

        let mut names = self.slot_array(alloc, SLOT_NAMES)?;
        let mut refs = self.slot_array(alloc, SLOT_REFS)?;
        let mut tags = self.slot_array(alloc, SLOT_TABLE_TAGS)?;

        // reuse the first dead slot, bumping its tag
        let mut index = None;
        for i in 0..names.len(alloc)? {
            if names.get(alloc, i)? < 0 {
                index = Some(i);
                break;
            }
        }

        let (index, tag) = match index {
            Some(i) => {
                let tag = (tags.get(alloc, i)? as u32).wrapping_add(1);
                names.set(alloc, i, i64::from(name_id))?;
                refs.set_ref(alloc, i, table_root.root())?;
                tags.set(alloc, i, i64::from(tag))?;
                (i, tag)
            }
            None => {
                let i = names.len(alloc)?;
                names.push(alloc, i64::from(name_id))?;
                refs.push(alloc, table_root.root() as i64)?;
                tags.push(alloc, 0)?;
                (i, 0)
            }
        };

        self.update_slot(alloc, SLOT_NAMES, names.root())?;
        self.update_slot(alloc, SLOT_REFS, refs.root())?;
        self.update_slot(alloc, SLOT_TABLE_TAGS, tags.root())?;

        log::debug!("added table (name id {name_id}) at slot {index}");
        Ok(TableKey::new(index, tag))
    }

    fn check_table(&self, alloc: &SlabAlloc, key: TableKey) -> Result<usize> {
        let names = self.slot_array(alloc, SLOT_NAMES)?;
        let tags = self.slot_array(alloc, SLOT_TABLE_TAGS)?;

        let i = key.index();
        if i >= names.len(alloc)? || names.get(alloc, i)? < 0 {
            return Err(Error::KeyNotFound);
        }
        if tags.get(alloc, i)? as u32 & 0xFFFF != u32::from(key.tag() as u16) {
            return Err(Error::KeyNotFound);
        }

        Ok(i)
    }

    /// Root ref of a table.
    pub fn table_root(&self, alloc: &SlabAlloc, key: TableKey) -> Result<Ref> {
        let i = self.check_table(alloc, key)?;
        self.slot_array(alloc, SLOT_REFS)?.get_ref(alloc, i)
    }

    /// Re-references a table root after CoW relocation.
    pub fn set_table_root(&mut self, alloc: &mut SlabAlloc, key: TableKey, root: Ref) -> Result<()> {
        let i = self.check_table(alloc, key)?;
        let mut refs = self.slot_array(alloc, SLOT_REFS)?;
        refs.set_ref(alloc, i, root)?;
        self.update_slot(alloc, SLOT_REFS, refs.root())
    }

    /// Interned name id of a table.
    pub fn table_name_id(&self, alloc: &SlabAlloc, key: TableKey) -> Result<StringId> {
        let i = self.check_table(alloc, key)?;
        Ok(self.slot_array(alloc, SLOT_NAMES)?.get(alloc, i)? as StringId)
    }

    /// Renames a live table.
    pub fn rename_table(
        &mut self,
        alloc: &mut SlabAlloc,
        key: TableKey,
        new_name_id: StringId,
    ) -> Result<()> {
        if self.find_table(alloc, new_name_id)?.is_some() {
            return Err(Error::ConstraintViolation("duplicate table name".into()));
        }

        let i = self.check_table(alloc, key)?;
        let mut names = self.slot_array(alloc, SLOT_NAMES)?;
        names.set(alloc, i, i64::from(new_name_id))?;
        self.update_slot(alloc, SLOT_NAMES, names.root())
    }

    /// Removes a table, destroying its whole subtree.
    pub fn remove_table(&mut self, alloc: &mut SlabAlloc, key: TableKey) -> Result<()> {
        let i = self.check_table(alloc, key)?;

        let refs = self.slot_array(alloc, SLOT_REFS)?;
        let root = refs.get_ref(alloc, i)?;
        destroy_deep_ref(alloc, root)?;

        let mut refs = refs;
        refs.set(alloc, i, 0)?;
        self.update_slot(alloc, SLOT_REFS, refs.root())?;

        let mut names = self.slot_array(alloc, SLOT_NAMES)?;
        names.set(alloc, i, -1)?;
        self.update_slot(alloc, SLOT_NAMES, names.root())
    }

    /// Whether the table is embedded.
    pub fn table_type(&self, alloc: &SlabAlloc, key: TableKey) -> Result<TableType> {
        let root = Array::from_ref(self.table_root(alloc, key)?);
        if root.get_tagged(alloc, TABLE_SLOT_TYPE)? == 0 {
            Ok(TableType::TopLevel)
        } else {
            Ok(TableType::Embedded)
        }
    }

    // ---- free-space ledger ----------------------------------------------

    /// Loads the persistent free-space ledger.
    pub fn load_free_space(&self, alloc: &SlabAlloc) -> Result<Vec<FreeRange>> {
        if self.is_empty_placeholder() {
            return Ok(Vec::new());
        }

        let positions = self.slot_array(alloc, SLOT_FREE_POSITIONS)?;
        let sizes = self.slot_array(alloc, SLOT_FREE_SIZES)?;
        let versions = self.slot_array(alloc, SLOT_FREE_VERSIONS)?;

        let n = positions.len(alloc)?;
        if sizes.len(alloc)? != n || versions.len(alloc)? != n {
            return Err(Error::corrupt("free-space arrays disagree on length"));
        }

        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(FreeRange {
                position: positions.get(alloc, i)? as u64,
                size: sizes.get(alloc, i)? as u64,
                version: versions.get(alloc, i)? as u64,
            });
        }
        Ok(out)
    }

    // ---- counters --------------------------------------------------------

    /// Version of the commit that wrote this group.
    pub fn version(&self, alloc: &SlabAlloc) -> Result<u64> {
        if self.is_empty_placeholder() {
            return Ok(0);
        }
        Ok(self.loaded()?.0.get_tagged(alloc, SLOT_VERSION)? as u64)
    }

    /// Logical file size recorded at the last commit.
    pub fn file_size(&self, alloc: &SlabAlloc) -> Result<u64> {
        if self.is_empty_placeholder() {
            return Ok(0);
        }
        Ok(self.loaded()?.0.get_tagged(alloc, SLOT_FILE_SIZE)? as u64)
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
    fn table_directory_lifecycle() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut group = Group::create(&mut alloc)?;

        let people_id = group.intern(&mut alloc, "people")?;
        let pets_id = group.intern(&mut alloc, "pets")?;

        let people = group.add_table(&mut alloc, people_id, TableType::TopLevel)?;
        let pets = group.add_table(&mut alloc, pets_id, TableType::Embedded)?;

        assert_eq!(Some(people), group.find_table(&alloc, people_id)?);
        assert_eq!(TableType::Embedded, group.table_type(&alloc, pets)?);
        assert_eq!(2, group.tables(&alloc)?.len());

        // duplicate name
        assert!(group
            .add_table(&mut alloc, people_id, TableType::TopLevel)
            .is_err());

        // rename
        let folks_id = group.intern(&mut alloc, "folks")?;
        group.rename_table(&mut alloc, people, folks_id)?;
        assert_eq!(None, group.find_table(&alloc, people_id)?);
        assert_eq!(Some(people), group.find_table(&alloc, folks_id)?);

        // removal invalidates the key, slot reuse bumps the tag
        group.remove_table(&mut alloc, people)?;
        assert!(matches!(
            group.table_root(&alloc, people),
            Err(Error::KeyNotFound)
        ));

        let reborn_id = group.intern(&mut alloc, "reborn")?;
        let reborn = group.add_table(&mut alloc, reborn_id, TableType::TopLevel)?;
        assert_eq!(people.index(), reborn.index());
        assert_ne!(people.tag(), reborn.tag());
        assert!(matches!(
            group.table_root(&alloc, people),
            Err(Error::KeyNotFound)
        ));
        assert!(group.table_root(&alloc, reborn).is_ok());

        Ok(())
    }

    #[test]
    fn empty_placeholder_reads() -> crate::Result<()> {
        let alloc = alloc();
        let group = Group::attach(NULL_REF);

        assert!(group.is_empty_placeholder());
        assert!(group.tables(&alloc)?.is_empty());
        assert_eq!(0, group.version(&alloc)?);
        assert!(group.load_free_space(&alloc)?.is_empty());

        Ok(())
    }
}
