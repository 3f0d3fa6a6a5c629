// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::alloc::{Ref, SlabAlloc};
use crate::array::Array;
use crate::keys::{CollectionKind, ColumnType, ObjKey};
use crate::leaf::{ColumnLeaf, LeafOps};
use crate::node::NodeFlags;
use crate::value::Value;
use crate::{Error, Result};

/// Storage configuration of one column, derived from the table spec
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ColumnSpec {
    /// Storage type
    pub col_type: ColumnType,

    /// Scalar or collection
    pub kind: CollectionKind,

    /// Whether values may be null
    pub nullable: bool,
}

impl ColumnSpec {
    /// The value a fresh row starts with in this column.
    #[must_use]
    pub fn default_value(&self) -> Value {
        if self.nullable || self.kind != CollectionKind::Scalar {
            return Value::Null;
        }

        match self.col_type {
            ColumnType::Int => Value::Int(0),
            ColumnType::Bool => Value::Bool(false),
            ColumnType::Float => Value::Float(0.0),
            ColumnType::Double => Value::Double(0.0),
            ColumnType::String => Value::String(String::new()),
            ColumnType::Binary => Value::Binary(Vec::new()),
            ColumnType::Timestamp => Value::Timestamp(crate::value::Timestamp::new(0, 0)),
            ColumnType::Decimal => Value::Decimal(crate::value::Decimal128([0; 16])),
            ColumnType::ObjectId => Value::ObjectId(crate::value::ObjectId([0; 12])),
            ColumnType::Uuid => Value::Uuid(crate::value::Uuid([0; 16])),
            // links, mixed, backlinks start out pointing nowhere
            ColumnType::Mixed | ColumnType::Link | ColumnType::Backlink => Value::Null,
        }
    }
}

/// A cluster: a column-major bundle of up to `CLUSTER_MAX` rows
///
/// Layout (a `has_refs` parent array):
///
/// ```text
/// slot 0       sorted ObjKey array
/// slot 1 + i   column i's leaf
/// ```
#[derive(Copy, Clone, Debug)]
pub struct ClusterLeaf {
    parent: Array,
}

impl ClusterLeaf {
    /// Creates an empty cluster with one leaf per column.
    pub fn create(alloc: &mut SlabAlloc, cols: &[ColumnSpec]) -> Result<Self> {
        let keys = Array::create(alloc, NodeFlags::default(), 0, 0)?;

        let mut parent = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
        parent.push(alloc, keys.root() as i64)?;

        for spec in cols {
            let leaf = ColumnLeaf::create(alloc, spec.col_type, spec.kind, spec.nullable)?;
            parent.push(alloc, leaf.root() as i64)?;
        }

        Ok(Self { parent })
    }

    /// Wraps an existing cluster node.
    #[must_use]
    pub fn from_ref(root: Ref) -> Self {
        Self {
            parent: Array::from_ref(root),
        }
    }

    /// The cluster's current ref.
    #[must_use]
    pub fn root(&self) -> Ref {
        self.parent.root()
    }

    /// Number of rows.
    pub fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        self.keys(alloc)?.len(alloc)
    }

    /// Returns `true` if the cluster holds no rows.
    pub fn is_empty(&self, alloc: &SlabAlloc) -> Result<bool> {
        Ok(self.len(alloc)? == 0)
    }

    /// The sorted key array.
    pub fn keys(&self, alloc: &SlabAlloc) -> Result<Array> {
        Ok(Array::from_ref(self.parent.get_ref(alloc, 0)?))
    }

    /// Key of the row at `pos`.
    pub fn key_at(&self, alloc: &SlabAlloc, pos: usize) -> Result<ObjKey> {
        Ok(ObjKey(self.keys(alloc)?.get(alloc, pos)?))
    }

    /// Smallest key in the cluster.
    pub fn first_key(&self, alloc: &SlabAlloc) -> Result<ObjKey> {
        self.key_at(alloc, 0)
    }

    /// Binary search for `key`: `Ok(pos)` when present, `Err(insert_pos)`
    /// when absent.
    pub fn find_key(
        &self,
        alloc: &SlabAlloc,
        key: ObjKey,
    ) -> Result<std::result::Result<usize, usize>> {
        let keys = self.keys(alloc)?;
        let n = keys.len(alloc)?;

        let mut left = 0usize;
        let mut right = n;
        while left < right {
            let mid = (left + right) / 2;
            if keys.get(alloc, mid)? < key.value() {
                left = mid + 1;
            } else {
                right = mid;
            }
        }

        if left < n && keys.get(alloc, left)? == key.value() {
            Ok(Ok(left))
        } else {
            Ok(Err(left))
        }
    }

    /// Attaches column `i`'s leaf accessor.
    pub fn column(&self, alloc: &SlabAlloc, cols: &[ColumnSpec], i: usize) -> Result<ColumnLeaf> {
        let spec = cols
            .get(i)
            .ok_or_else(|| Error::logic(format!("column index {i} out of range")))?;

        Ok(ColumnLeaf::attach(
            self.parent.get_ref(alloc, 1 + i)?,
            spec.col_type,
            spec.kind,
            spec.nullable,
        ))
    }

    /// Raw root ref of column `i`'s leaf (for leaves, like backlink
    /// columns, that are driven outside the [`ColumnLeaf`] value
    /// interface).
    pub fn column_root(&self, alloc: &SlabAlloc, i: usize) -> Result<Ref> {
        self.parent.get_ref(alloc, 1 + i)
    }

    /// Re-references column `i`'s leaf after it relocated.
    pub fn update_column(&mut self, alloc: &mut SlabAlloc, i: usize, root: Ref) -> Result<()> {
        self.parent.set_ref(alloc, 1 + i, root)
    }

    /// Inserts a row with `key` at its sorted position; every column gets
    /// its default value. Returns the position.
    pub fn insert_row(
        &mut self,
        alloc: &mut SlabAlloc,
        cols: &[ColumnSpec],
        key: ObjKey,
    ) -> Result<usize> {
        let pos = match self.find_key(alloc, key)? {
            Ok(_) => {
                return Err(Error::ConstraintViolation(format!(
                    "duplicate object key {key}"
                )))
            }
            Err(pos) => pos,
        };

        let mut keys = self.keys(alloc)?;
        keys.insert(alloc, pos, key.value())?;
        self.parent.set_ref(alloc, 0, keys.root())?;

        for (i, spec) in cols.iter().enumerate() {
            let mut leaf = self.column(alloc, cols, i)?;
            leaf.insert(alloc, pos, &spec.default_value())?;
            self.update_column(alloc, i, leaf.root())?;
        }

        Ok(pos)
    }

    /// Removes the row at `pos`, releasing per-row payload.
    pub fn erase_row(
        &mut self,
        alloc: &mut SlabAlloc,
        cols: &[ColumnSpec],
        pos: usize,
    ) -> Result<()> {
        let mut keys = self.keys(alloc)?;
        keys.erase(alloc, pos)?;
        self.parent.set_ref(alloc, 0, keys.root())?;

        for i in 0..cols.len() {
            let mut leaf = self.column(alloc, cols, i)?;
            leaf.erase(alloc, pos)?;
            self.update_column(alloc, i, leaf.root())?;
        }

        Ok(())
    }

    /// Reads column `i` of the row at `pos`.
    pub fn get_value(
        &self,
        alloc: &SlabAlloc,
        cols: &[ColumnSpec],
        i: usize,
        pos: usize,
    ) -> Result<Value> {
        self.column(alloc, cols, i)?.get(alloc, pos)
    }

    /// Writes column `i` of the row at `pos`.
    pub fn set_value(
        &mut self,
        alloc: &mut SlabAlloc,
        cols: &[ColumnSpec],
        i: usize,
        pos: usize,
        value: &Value,
    ) -> Result<()> {
        let mut leaf = self.column(alloc, cols, i)?;
        let idx = idx_checked(alloc, &leaf, pos)?;
        leaf.set(alloc, idx, value)?;
        self.update_column(alloc, i, leaf.root())
    }

    /// Moves rows `[at, len)` into a new sibling cluster; returns it.
    pub fn split(
        &mut self,
        alloc: &mut SlabAlloc,
        cols: &[ColumnSpec],
        at: usize,
    ) -> Result<ClusterLeaf> {
        let n = self.len(alloc)?;

        let mut keys = self.keys(alloc)?;
        let mut right_keys = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        for i in at..n {
            let k = keys.get(alloc, i)?;
            right_keys.push(alloc, k)?;
        }
        keys.truncate(alloc, at)?;
        self.parent.set_ref(alloc, 0, keys.root())?;

        let mut right_parent = Array::create(alloc, NodeFlags::HAS_REFS, 0, 0)?;
        right_parent.push(alloc, right_keys.root() as i64)?;

        for i in 0..cols.len() {
            let mut leaf = self.column(alloc, cols, i)?;
            let right_leaf = leaf.split(alloc, at)?;
            self.update_column(alloc, i, leaf.root())?;
            right_parent.push(alloc, right_leaf as i64)?;
        }

        Ok(ClusterLeaf {
            parent: right_parent,
        })
    }

    /// Appends all rows of `right` and destroys it.
    pub fn merge_from(
        &mut self,
        alloc: &mut SlabAlloc,
        cols: &[ColumnSpec],
        right: &ClusterLeaf,
    ) -> Result<()> {
        let right_keys = right.keys(alloc)?;
        let n = right_keys.len(alloc)?;

        let mut keys = self.keys(alloc)?;
        for i in 0..n {
            let k = right_keys.get(alloc, i)?;
            keys.push(alloc, k)?;
        }
        self.parent.set_ref(alloc, 0, keys.root())?;

        for i in 0..cols.len() {
            let mut leaf = self.column(alloc, cols, i)?;
            let right_col = right.parent.get_ref(alloc, 1 + i)?;
            leaf.merge_from(alloc, right_col)?;
            self.update_column(alloc, i, leaf.root())?;
        }

        // the right parent's children were consumed; free keys + parent
        right_keys.destroy_deep(alloc)?;

        let header = right.parent.header(alloc)?;
        alloc.free(right.parent.root(), header.capacity);
        Ok(())
    }

    /// Appends an empty column leaf (for `add_column` on a populated
    /// table), filled with the column's default.
    pub fn push_column(&mut self, alloc: &mut SlabAlloc, spec: ColumnSpec) -> Result<()> {
        let n = self.len(alloc)?;
        let mut leaf = ColumnLeaf::create(alloc, spec.col_type, spec.kind, spec.nullable)?;

        for i in 0..n {
            leaf.insert(alloc, i, &spec.default_value())?;
        }

        self.parent.push(alloc, leaf.root() as i64)
    }

    /// Destroys column `i`'s leaf and removes its slot.
    pub fn remove_column(
        &mut self,
        alloc: &mut SlabAlloc,
        cols: &[ColumnSpec],
        i: usize,
    ) -> Result<()> {
        let mut leaf = self.column(alloc, cols, i)?;
        leaf.destroy(alloc)?;
        self.parent.erase(alloc, 1 + i)
    }

    /// Destroys the cluster including all payload.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> Result<()> {
        self.parent.destroy_deep(alloc)
    }
}

fn idx_checked(alloc: &SlabAlloc, leaf: &ColumnLeaf, pos: usize) -> Result<usize> {
    if pos >= leaf.len(alloc)? {
        return Err(Error::logic(format!("row position {pos} out of cluster")));
    }
    Ok(pos)
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

    fn cols() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec {
                col_type: ColumnType::Int,
                kind: CollectionKind::Scalar,
                nullable: false,
            },
            ColumnSpec {
                col_type: ColumnType::String,
                kind: CollectionKind::Scalar,
                nullable: true,
            },
        ]
    }

    #[test]
    fn rows_stay_sorted_by_key() -> crate::Result<()> {
        let mut alloc = alloc();
        let cols = cols();
        let mut cluster = ClusterLeaf::create(&mut alloc, &cols)?;

        cluster.insert_row(&mut alloc, &cols, ObjKey(30))?;
        cluster.insert_row(&mut alloc, &cols, ObjKey(10))?;
        cluster.insert_row(&mut alloc, &cols, ObjKey(20))?;

        assert_eq!(3, cluster.len(&alloc)?);
        assert_eq!(ObjKey(10), cluster.key_at(&alloc, 0)?);
        assert_eq!(ObjKey(20), cluster.key_at(&alloc, 1)?);
        assert_eq!(ObjKey(30), cluster.key_at(&alloc, 2)?);

        assert_eq!(Ok(1), cluster.find_key(&alloc, ObjKey(20))?);
        assert_eq!(Err(1), cluster.find_key(&alloc, ObjKey(15))?);

        // duplicate keys are refused
        assert!(matches!(
            cluster.insert_row(&mut alloc, &cols, ObjKey(20)),
            Err(Error::ConstraintViolation(_))
        ));

        Ok(())
    }

    #[test]
    fn new_rows_get_defaults() -> crate::Result<()> {
        let mut alloc = alloc();
        let cols = cols();
        let mut cluster = ClusterLeaf::create(&mut alloc, &cols)?;

        let pos = cluster.insert_row(&mut alloc, &cols, ObjKey(1))?;
        assert_eq!(Value::Int(0), cluster.get_value(&alloc, &cols, 0, pos)?);
        assert_eq!(Value::Null, cluster.get_value(&alloc, &cols, 1, pos)?);

        cluster.set_value(&mut alloc, &cols, 0, pos, &Value::Int(99))?;
        cluster.set_value(&mut alloc, &cols, 1, pos, &Value::String("x".into()))?;
        assert_eq!(Value::Int(99), cluster.get_value(&alloc, &cols, 0, pos)?);

        Ok(())
    }

    #[test]
    fn split_and_merge_preserve_columns() -> crate::Result<()> {
        let mut alloc = alloc();
        let cols = cols();
        let mut cluster = ClusterLeaf::create(&mut alloc, &cols)?;

        for i in 0..10i64 {
            let pos = cluster.insert_row(&mut alloc, &cols, ObjKey(i))?;
            cluster.set_value(&mut alloc, &cols, 0, pos, &Value::Int(i * 7))?;
            cluster.set_value(
                &mut alloc,
                &cols,
                1,
                pos,
                &Value::String(format!("row{i}")),
            )?;
        }

        let right = cluster.split(&mut alloc, &cols, 6)?;
        assert_eq!(6, cluster.len(&alloc)?);
        assert_eq!(4, right.len(&alloc)?);
        assert_eq!(ObjKey(6), right.first_key(&alloc)?);
        assert_eq!(Value::Int(42), right.get_value(&alloc, &cols, 0, 0)?);
        assert_eq!(
            Value::String("row9".into()),
            right.get_value(&alloc, &cols, 1, 3)?
        );

        cluster.merge_from(&mut alloc, &cols, &right)?;
        assert_eq!(10, cluster.len(&alloc)?);
        assert_eq!(Value::Int(63), cluster.get_value(&alloc, &cols, 0, 9)?);

        Ok(())
    }

    #[test]
    fn add_and_remove_columns() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut cols = cols();
        let mut cluster = ClusterLeaf::create(&mut alloc, &cols)?;

        cluster.insert_row(&mut alloc, &cols, ObjKey(1))?;
        cluster.insert_row(&mut alloc, &cols, ObjKey(2))?;

        let new_spec = ColumnSpec {
            col_type: ColumnType::Bool,
            kind: CollectionKind::Scalar,
            nullable: false,
        };
        cluster.push_column(&mut alloc, new_spec)?;
        cols.push(new_spec);

        assert_eq!(Value::Bool(false), cluster.get_value(&alloc, &cols, 2, 1)?);

        cluster.remove_column(&mut alloc, &cols, 1)?;
        cols.remove(1);
        assert_eq!(Value::Bool(false), cluster.get_value(&alloc, &cols, 1, 0)?);

        Ok(())
    }
}
