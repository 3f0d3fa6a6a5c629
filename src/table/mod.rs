// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tables and rows over the cluster tree, including link/backlink
//! symmetry, cascades and search-index maintenance.

pub mod collections;
pub mod object;
pub mod schema;

pub use collections::{Dictionary, List, SetCollection};
pub use object::Object;

use crate::array::Array;
use crate::cluster::{ClusterTree, ColumnSpec};
use crate::group::{TableType, TABLE_SLOT_CLUSTERS, TABLE_SLOT_KEY_COUNTER, TABLE_SLOT_SPEC};
use crate::interner::SearchIndex;
use crate::keys::{CollectionKind, ColKey, ColumnType, ObjKey, TableKey};
use crate::leaf::{BacklinkLeaf, LeafOps};
use crate::transaction::{Transaction, TxnState};
use crate::value::Value;
use crate::{Error, Result};
use schema::{ColumnDesc, TableSpec};

/// Accessor of one table within a transaction
///
/// Not thread-safe (like every accessor); each thread works through its
/// own transaction.
pub struct Table<'t> {
    txn: &'t Transaction,
    key: TableKey,
}

impl<'t> Table<'t> {
    pub(crate) fn new(txn: &'t Transaction, key: TableKey) -> Self {
        Self { txn, key }
    }

    /// The table's stable key.
    #[must_use]
    pub fn key(&self) -> TableKey {
        self.key
    }

    /// The table's name.
    pub fn name(&self) -> Result<String> {
        let state = self.txn.state.borrow();
        let name_id = state.group.table_name_id(&state.alloc, self.key)?;
        state.group.resolve_string(&state.alloc, name_id)
    }

    /// Whether the table is embedded (owned by rows of another table).
    pub fn is_embedded(&self) -> Result<bool> {
        let state = self.txn.state.borrow();
        Ok(state.group.table_type(&state.alloc, self.key)? == TableType::Embedded)
    }

    /// Number of rows.
    pub fn size(&self) -> Result<u64> {
        let state = self.txn.state.borrow();
        tree(&state, self.key)?.size(&state.alloc)
    }

    /// Adds a scalar column.
    pub fn add_column(&self, name: &str, col_type: ColumnType, nullable: bool) -> Result<ColKey> {
        if matches!(col_type, ColumnType::Link | ColumnType::Backlink) {
            return Err(Error::logic("link columns are added via add_link_column"));
        }
        self.add_column_impl(name, col_type, CollectionKind::Scalar, nullable)
    }

    /// Adds a list / set / dictionary column of `elem_type` elements.
    pub fn add_collection_column(
        &self,
        name: &str,
        elem_type: ColumnType,
        kind: CollectionKind,
        nullable: bool,
    ) -> Result<ColKey> {
        if kind == CollectionKind::Scalar {
            return Err(Error::logic("use add_column for scalar columns"));
        }
        if matches!(elem_type, ColumnType::Link | ColumnType::Backlink) {
            return Err(Error::logic("link collections are not supported"));
        }
        self.add_column_impl(name, elem_type, kind, nullable)
    }

    fn add_column_impl(
        &self,
        name: &str,
        col_type: ColumnType,
        kind: CollectionKind,
        nullable: bool,
    ) -> Result<ColKey> {
        let state = &mut *self.txn.state.borrow_mut();
        check_writable(state)?;

        let name_id = state.group.intern(&mut state.alloc, name)?;

        let mut spec = spec(state, self.key)?;
        if spec.find_by_name(&state.alloc, name_id)?.is_some() {
            return Err(Error::ConstraintViolation(format!(
                "duplicate column name {name:?}"
            )));
        }

        let key = spec.append_column(
            &mut state.alloc,
            name_id,
            col_type,
            kind,
            nullable,
            false,
            None,
            0,
        )?;

        let column_spec = ColumnSpec {
            col_type,
            kind,
            nullable,
        };
        let mut t = tree(state, self.key)?;
        t.for_each_leaf_mut(&mut state.alloc, &mut |alloc, leaf| {
            leaf.push_column(alloc, column_spec)
        })?;

        save_parts(state, self.key, &spec, &t)?;
        Ok(key)
    }

    /// Adds a forward link column to `target`, plus the paired backlink
    /// column inside the target table.
    pub fn add_link_column(&self, name: &str, target: TableKey, strong: bool) -> Result<ColKey> {
        let state = &mut *self.txn.state.borrow_mut();
        check_writable(state)?;

        let target_embedded =
            state.group.table_type(&state.alloc, target)? == TableType::Embedded;

        if target_embedded {
            if !strong {
                return Err(Error::CrossTableLinkTarget);
            }

            // an embedded table has exactly one owning column
            let target_spec = spec(state, target)?;
            for desc in target_spec.columns(&state.alloc)? {
                if desc.key.column_type()? == ColumnType::Backlink {
                    return Err(Error::CrossTableLinkTarget);
                }
            }
        }

        let name_id = state.group.intern(&mut state.alloc, name)?;

        let mut fwd_spec = spec(state, self.key)?;
        if fwd_spec.find_by_name(&state.alloc, name_id)?.is_some() {
            return Err(Error::ConstraintViolation(format!(
                "duplicate column name {name:?}"
            )));
        }

        let fwd_key = fwd_spec.append_column(
            &mut state.alloc,
            name_id,
            ColumnType::Link,
            CollectionKind::Scalar,
            true,
            strong,
            Some(target),
            0,
        )?;

        let mut fwd_tree = tree(state, self.key)?;
        fwd_tree.for_each_leaf_mut(&mut state.alloc, &mut |alloc, leaf| {
            leaf.push_column(
                alloc,
                ColumnSpec {
                    col_type: ColumnType::Link,
                    kind: CollectionKind::Scalar,
                    nullable: true,
                },
            )
        })?;
        save_parts(state, self.key, &fwd_spec, &fwd_tree)?;

        // the paired backlink column in the target table (for
        // self-links this re-reads the spec we just saved)
        let mut back_spec = spec(state, target)?;
        let back_key = back_spec.append_column(
            &mut state.alloc,
            name_id,
            ColumnType::Backlink,
            CollectionKind::Scalar,
            false,
            false,
            Some(self.key),
            fwd_key.tag(),
        )?;

        let mut back_tree = tree(state, target)?;
        back_tree.for_each_leaf_mut(&mut state.alloc, &mut |alloc, leaf| {
            leaf.push_column(
                alloc,
                ColumnSpec {
                    col_type: ColumnType::Backlink,
                    kind: CollectionKind::Scalar,
                    nullable: false,
                },
            )
        })?;
        save_parts(state, target, &back_spec, &back_tree)?;

        // pair the forward column with the backlink's tag
        let mut fwd_spec = spec(state, self.key)?;
        let fwd_index = fwd_spec.check_key(&state.alloc, fwd_key)?;
        fwd_spec.set_paired_tag(&mut state.alloc, fwd_index, back_key.tag())?;
        let t = tree(state, self.key)?;
        save_parts(state, self.key, &fwd_spec, &t)?;

        Ok(fwd_key)
    }

    /// Removes a column (link columns also drop their paired backlink
    /// column after clearing all links).
    pub fn remove_column(&self, key: ColKey) -> Result<()> {
        let state = &mut *self.txn.state.borrow_mut();
        check_writable(state)?;

        if key.column_type()? == ColumnType::Backlink {
            return Err(Error::logic("backlink columns are managed internally"));
        }

        let i = {
            let spec = spec(state, self.key)?;
            spec.check_key(&state.alloc, key)?
        };

        if key.column_type()? == ColumnType::Link {
            // clear every link so backlinks stay symmetric
            let cols = spec_cols_cache(state, self.key)?;
            let mut keys = Vec::new();
            {
                let t = tree(state, self.key)?;
                t.for_each(&state.alloc, |obj_key, leaf, pos| {
                    if !leaf.get_value(&state.alloc, &cols, i, pos)?.is_null() {
                        keys.push(obj_key);
                    }
                    Ok(true)
                })?;
            }
            for obj_key in keys {
                set_value(state, self.key, obj_key, key, &Value::Null)?;
            }

            // drop the paired backlink column in the target table
            let desc = {
                let spec = spec(state, self.key)?;
                spec.column(&state.alloc, i)?
            };
            let target = desc
                .target
                .ok_or_else(|| Error::corrupt("link without target"))?;

            let back = {
                let target_spec = spec(state, target)?;
                target_spec.find_by_tag(&state.alloc, desc.paired_tag)?
            };
            if let Some((back_idx, _)) = back {
                remove_column_at(state, target, back_idx)?;
            }
        }

        // positions may have shifted when the backlink column lived in
        // this same table (self-link); re-resolve by tag
        let (i, _) = spec(state, self.key)?
            .find_by_tag(&state.alloc, key.tag())?
            .ok_or(Error::KeyNotFound)?;
        remove_column_at(state, self.key, i)
    }

    /// The key of column `name`.
    pub fn col_key(&self, name: &str) -> Result<ColKey> {
        let state = self.txn.state.borrow();

        let name_id = state
            .group
            .lookup_string(&state.alloc, name)?
            .ok_or(Error::KeyNotFound)?;

        let spec = spec(&state, self.key)?;
        spec.find_by_name(&state.alloc, name_id)?
            .map(|desc| desc.key)
            .ok_or(Error::KeyNotFound)
    }

    /// All user-visible columns as `(name, key)` pairs.
    pub fn columns(&self) -> Result<Vec<(String, ColKey)>> {
        let state = self.txn.state.borrow();
        let spec = spec(&state, self.key)?;

        let mut out = Vec::new();
        for desc in spec.columns(&state.alloc)? {
            if desc.key.column_type()? == ColumnType::Backlink {
                continue;
            }
            out.push((
                state.group.resolve_string(&state.alloc, desc.name_id)?,
                desc.key,
            ));
        }
        Ok(out)
    }

    /// Creates a row with an automatically assigned key.
    pub fn create_object(&self) -> Result<Object<'t>> {
        self.create_object_inner(None, false)
    }

    /// Creates a row with a caller-chosen (primary) key.
    pub fn create_object_with_key(&self, key: ObjKey) -> Result<Object<'t>> {
        self.create_object_inner(Some(key), false)
    }

    pub(crate) fn create_object_inner(
        &self,
        key_hint: Option<ObjKey>,
        allow_embedded: bool,
    ) -> Result<Object<'t>> {
        let obj_key = {
            let state = &mut *self.txn.state.borrow_mut();
            check_writable(state)?;

            if !allow_embedded
                && state.group.table_type(&state.alloc, self.key)? == TableType::Embedded
            {
                return Err(Error::logic(
                    "embedded objects are created through their owning link",
                ));
            }

            if let Some(hint) = key_hint {
                if hint.is_tombstone() {
                    return Err(Error::logic("object keys are non-negative"));
                }
            }

            let mut root = root_array(state, self.key)?;
            let counter = root.get_tagged(&state.alloc, TABLE_SLOT_KEY_COUNTER)?;
            let obj_key = key_hint.unwrap_or(ObjKey(counter));

            let cols = spec_cols_cache(state, self.key)?;
            let mut t = tree(state, self.key)?;
            t.insert(&mut state.alloc, &cols, obj_key)?;

            root.set_tagged(
                &mut state.alloc,
                TABLE_SLOT_KEY_COUNTER,
                counter.max(obj_key.value() + 1),
            )?;
            root.set_ref(&mut state.alloc, TABLE_SLOT_CLUSTERS, t.root())?;
            state
                .group
                .set_table_root(&mut state.alloc, self.key, root.root())?;

            // indexed string columns see the default value
            index_row_defaults(state, self.key, obj_key)?;

            obj_key
        };

        Ok(Object::new(self.txn, self.key, obj_key))
    }

    /// Looks a row up by key.
    pub fn try_object(&self, key: ObjKey) -> Result<Option<Object<'t>>> {
        let state = self.txn.state.borrow();
        let t = tree(&state, self.key)?;
        Ok(t.find(&state.alloc, key)?
            .map(|_| Object::new(self.txn, self.key, key)))
    }

    /// Looks a row up by key, failing when absent.
    pub fn object(&self, key: ObjKey) -> Result<Object<'t>> {
        self.try_object(key)?.ok_or(Error::KeyNotFound)
    }

    /// Removes a row, maintaining link symmetry (weak links are
    /// nullified, strong links cascade).
    pub fn remove_object(&self, key: ObjKey) -> Result<()> {
        let state = &mut *self.txn.state.borrow_mut();
        check_writable(state)?;

        let mut removing = Vec::new();
        remove_object_rec(state, self.key, key, &mut removing)
    }

    /// Visits every row in key order; the visitor returns `false` to
    /// stop.
    pub fn for_each(&self, mut visitor: impl FnMut(Object<'t>) -> Result<bool>) -> Result<()> {
        let keys = {
            let state = self.txn.state.borrow();
            let t = tree(&state, self.key)?;
            let mut keys = Vec::new();
            t.for_each(&state.alloc, |key, _, _| {
                keys.push(key);
                Ok(true)
            })?;
            keys
        };

        for key in keys {
            if !visitor(Object::new(self.txn, self.key, key))? {
                break;
            }
        }
        Ok(())
    }

    /// Adds a search index to a scalar string column; returns the
    /// updated column key.
    pub fn add_search_index(&self, key: ColKey) -> Result<ColKey> {
        let state = &mut *self.txn.state.borrow_mut();
        check_writable(state)?;

        if key.column_type()? != ColumnType::String
            || key.collection_kind()? != CollectionKind::Scalar
        {
            return Err(Error::logic("search indexes require a scalar string column"));
        }

        let mut spec = spec(state, self.key)?;
        let i = spec.check_key(&state.alloc, key)?;
        if spec.column(&state.alloc, i)?.index_ref != 0 {
            return Ok(spec.column(&state.alloc, i)?.key);
        }

        let mut index = SearchIndex::create(&mut state.alloc)?;

        // back-fill from existing rows
        let cols = spec_cols_cache(state, self.key)?;
        let t = tree(state, self.key)?;
        let mut entries = Vec::new();
        t.for_each(&state.alloc, |obj_key, leaf, pos| {
            if let Value::String(s) = leaf.get_value(&state.alloc, &cols, i, pos)? {
                entries.push((obj_key, s));
            }
            Ok(true)
        })?;

        for (obj_key, s) in entries {
            let id = state.group.intern(&mut state.alloc, &s)?;
            index.add(&mut state.alloc, id, obj_key)?;
        }

        let new_key = spec.set_index_ref(&mut state.alloc, i, index.root())?;
        let t = tree(state, self.key)?;
        save_parts(state, self.key, &spec, &t)?;

        log::debug!("indexed column {i} of table {:?}", self.key);
        Ok(new_key)
    }

    /// All rows whose string column equals `needle` (index-accelerated
    /// when available).
    pub fn find_string(&self, key: ColKey, needle: &str) -> Result<Vec<ObjKey>> {
        let state = self.txn.state.borrow();

        let spec = spec(&state, self.key)?;
        let i = spec.check_key(&state.alloc, key)?;
        let desc = spec.column(&state.alloc, i)?;

        if desc.index_ref != 0 {
            let Some(id) = state.group.lookup_string(&state.alloc, needle)? else {
                return Ok(Vec::new());
            };
            return SearchIndex::from_ref(desc.index_ref).find_exact(&state.alloc, id);
        }

        self.scan(&state, i, |v| matches!(v, Value::String(s) if s == needle))
    }

    /// All rows whose string column starts with `prefix`.
    pub fn find_prefix(&self, key: ColKey, prefix: &str) -> Result<Vec<ObjKey>> {
        let state = self.txn.state.borrow();

        let spec = spec(&state, self.key)?;
        let i = spec.check_key(&state.alloc, key)?;
        let desc = spec.column(&state.alloc, i)?;

        if desc.index_ref != 0 {
            return SearchIndex::from_ref(desc.index_ref).find_prefix(
                &state.alloc,
                state.group.interner()?,
                prefix,
            );
        }

        self.scan(&state, i, |v| {
            matches!(v, Value::String(s) if s.starts_with(prefix))
        })
    }

    /// First row whose column equals `value`, scanning in key order.
    pub fn find_first(&self, key: ColKey, value: &Value) -> Result<Option<ObjKey>> {
        let state = self.txn.state.borrow();
        let spec = spec(&state, self.key)?;
        let i = spec.check_key(&state.alloc, key)?;

        let hits = self.scan_bounded(&state, i, 1, |v| v == value)?;
        Ok(hits.into_iter().next())
    }

    fn scan(
        &self,
        state: &TxnState,
        col_index: usize,
        pred: impl Fn(&Value) -> bool,
    ) -> Result<Vec<ObjKey>> {
        self.scan_bounded(state, col_index, usize::MAX, pred)
    }

    fn scan_bounded(
        &self,
        state: &TxnState,
        col_index: usize,
        limit: usize,
        pred: impl Fn(&Value) -> bool,
    ) -> Result<Vec<ObjKey>> {
        let cols = spec_cols_cache(state, self.key)?;
        let t = tree(state, self.key)?;

        let mut hits = Vec::new();
        t.for_each(&state.alloc, |obj_key, leaf, pos| {
            let v = leaf.get_value(&state.alloc, &cols, col_index, pos)?;
            if pred(&v) {
                hits.push(obj_key);
            }
            Ok(hits.len() < limit)
        })?;
        Ok(hits)
    }
}

// ---- internal plumbing shared with Object / collections ------------------

pub(crate) fn check_writable(state: &TxnState) -> Result<()> {
    if state.writable {
        Ok(())
    } else {
        Err(Error::WrongTransactState)
    }
}

pub(crate) fn root_array(state: &TxnState, table: TableKey) -> Result<Array> {
    Ok(Array::from_ref(state.group.table_root(&state.alloc, table)?))
}

pub(crate) fn spec(state: &TxnState, table: TableKey) -> Result<TableSpec> {
    let root = root_array(state, table)?;
    Ok(TableSpec::from_ref(
        root.get_ref(&state.alloc, TABLE_SLOT_SPEC)?,
    ))
}

pub(crate) fn tree(state: &TxnState, table: TableKey) -> Result<ClusterTree> {
    let root = root_array(state, table)?;
    Ok(ClusterTree::from_ref(
        root.get_ref(&state.alloc, TABLE_SLOT_CLUSTERS)?,
    ))
}

pub(crate) fn spec_cols_cache(state: &TxnState, table: TableKey) -> Result<Vec<ColumnSpec>> {
    spec(state, table)?.column_specs(&state.alloc)
}

pub(crate) fn save_tree(state: &mut TxnState, table: TableKey, t: &ClusterTree) -> Result<()> {
    let mut root = root_array(state, table)?;
    root.set_ref(&mut state.alloc, TABLE_SLOT_CLUSTERS, t.root())?;
    state
        .group
        .set_table_root(&mut state.alloc, table, root.root())
}

pub(crate) fn save_parts(
    state: &mut TxnState,
    table: TableKey,
    spec: &TableSpec,
    t: &ClusterTree,
) -> Result<()> {
    let mut root = root_array(state, table)?;
    root.set_ref(&mut state.alloc, TABLE_SLOT_SPEC, spec.root())?;
    root.set_ref(&mut state.alloc, TABLE_SLOT_CLUSTERS, t.root())?;
    state
        .group
        .set_table_root(&mut state.alloc, table, root.root())
}

fn remove_column_at(state: &mut TxnState, table: TableKey, i: usize) -> Result<()> {
    let cols = spec_cols_cache(state, table)?;

    let mut t = tree(state, table)?;
    t.for_each_leaf_mut(&mut state.alloc, &mut |alloc, leaf| {
        leaf.remove_column(alloc, &cols, i)
    })?;

    let mut spec = spec(state, table)?;
    spec.remove_column(&mut state.alloc, i)?;

    save_parts(state, table, &spec, &t)
}

/// Reads one column of one row.
pub(crate) fn get_value(
    state: &TxnState,
    table: TableKey,
    obj_key: ObjKey,
    col: ColKey,
) -> Result<Value> {
    let spec = spec(state, table)?;
    let i = spec.check_key(&state.alloc, col)?;

    let cols = spec.column_specs(&state.alloc)?;
    let t = tree(state, table)?;
    let (leaf, pos) = t.find(&state.alloc, obj_key)?.ok_or(Error::KeyNotFound)?;
    leaf.get_value(&state.alloc, &cols, i, pos)
}

/// Writes one column of one row, maintaining backlinks and search
/// indexes.
pub(crate) fn set_value(
    state: &mut TxnState,
    table: TableKey,
    obj_key: ObjKey,
    col: ColKey,
    value: &Value,
) -> Result<()> {
    check_writable(state)?;

    let spec = spec(state, table)?;
    let i = spec.check_key(&state.alloc, col)?;
    let desc = spec.column(&state.alloc, i)?;

    if desc.key.column_type()? == ColumnType::Link {
        return set_link(state, table, obj_key, i, desc, value);
    }

    let old = if desc.index_ref != 0 {
        Some(get_value(state, table, obj_key, col)?)
    } else {
        None
    };

    write_raw(state, table, obj_key, i, value)?;

    if let Some(old) = old {
        index_swap(state, table, i, obj_key, &old, value)?;
    }

    Ok(())
}

/// Writes a cell without link or index side effects.
pub(crate) fn write_raw(
    state: &mut TxnState,
    table: TableKey,
    obj_key: ObjKey,
    col_index: usize,
    value: &Value,
) -> Result<()> {
    let cols = spec_cols_cache(state, table)?;
    let mut t = tree(state, table)?;
    t.with_leaf_mut(&mut state.alloc, obj_key, |alloc, leaf, pos| {
        leaf.set_value(alloc, &cols, col_index, pos, value)
    })?;
    save_tree(state, table, &t)
}

fn set_link(
    state: &mut TxnState,
    table: TableKey,
    obj_key: ObjKey,
    col_index: usize,
    desc: ColumnDesc,
    value: &Value,
) -> Result<()> {
    let target_table = desc
        .target
        .ok_or_else(|| Error::corrupt("link column without target"))?;

    let new_target = match value {
        Value::Null => None,
        Value::Link(key) => Some(*key),
        other => return Err(Error::logic(format!("expected link value, got {other:?}"))),
    };

    let old_target = {
        let cols = spec_cols_cache(state, table)?;
        let t = tree(state, table)?;
        let (leaf, pos) = t.find(&state.alloc, obj_key)?.ok_or(Error::KeyNotFound)?;
        match leaf.get_value(&state.alloc, &cols, col_index, pos)? {
            Value::Link(key) => Some(key),
            _ => None,
        }
    };

    if old_target == new_target {
        return Ok(());
    }

    if let Some(target) = new_target {
        // the target row must exist
        let t = tree(state, target_table)?;
        if t.find(&state.alloc, target)?.is_none() {
            return Err(Error::KeyNotFound);
        }

        // an embedded row has at most one owner
        if state.group.table_type(&state.alloc, target_table)? == TableType::Embedded
            && backlink_total(state, target_table, target)? > 0
        {
            return Err(Error::CrossTableLinkTarget);
        }
    }

    // unhook the old target first
    if let Some(old) = old_target {
        backlink_update(state, target_table, old, desc.paired_tag, obj_key, false)?;

        if desc.key.is_strong_link() && strong_owner_count(state, target_table, old)? == 0 {
            let mut removing = Vec::new();
            remove_object_rec(state, target_table, old, &mut removing)?;
        }
    }

    write_raw(state, table, obj_key, col_index, value)?;

    if let Some(new) = new_target {
        backlink_update(state, target_table, new, desc.paired_tag, obj_key, true)?;
    }

    Ok(())
}

/// Adds or removes one backlink entry in `table`'s backlink column with
/// `tag`, at the row `target`.
fn backlink_update(
    state: &mut TxnState,
    table: TableKey,
    target: ObjKey,
    tag: u16,
    origin: ObjKey,
    add: bool,
) -> Result<()> {
    let (col_index, _) = spec(state, table)?
        .find_by_tag(&state.alloc, tag)?
        .ok_or_else(|| Error::corrupt("paired backlink column missing"))?;

    let mut t = tree(state, table)?;
    t.with_leaf_mut(&mut state.alloc, target, |alloc, leaf, pos| {
        let slot = leaf.column_root(alloc, col_index)?;
        let mut backlinks = BacklinkLeaf::attach(slot);
        if add {
            backlinks.add(alloc, pos, origin)?;
        } else {
            backlinks.remove(alloc, pos, origin)?;
        }
        leaf.update_column(alloc, col_index, backlinks.root())
    })?;
    save_tree(state, table, &t)
}

/// Total number of rows pointing at `key` (any origin column).
pub(crate) fn backlink_total(state: &TxnState, table: TableKey, key: ObjKey) -> Result<usize> {
    let spec = spec(state, table)?;
    let t = tree(state, table)?;
    let (leaf, pos) = t.find(&state.alloc, key)?.ok_or(Error::KeyNotFound)?;

    let mut total = 0;
    for (i, desc) in spec.columns(&state.alloc)?.iter().enumerate() {
        if desc.key.column_type()? == ColumnType::Backlink {
            let backlinks = BacklinkLeaf::attach(leaf.column_root(&state.alloc, i)?);
            total += backlinks.count(&state.alloc, pos)?;
        }
    }
    Ok(total)
}

/// All rows pointing at `key` through the forward column `through` of
/// `origin_table`.
pub(crate) fn backlinks_through(
    state: &TxnState,
    table: TableKey,
    key: ObjKey,
    origin_table: TableKey,
    through: ColKey,
) -> Result<Vec<ObjKey>> {
    let origin_spec = spec(state, origin_table)?;
    let i = origin_spec.check_key(&state.alloc, through)?;
    let origin_desc = origin_spec.column(&state.alloc, i)?;

    if origin_desc.target != Some(table) {
        return Err(Error::logic("column does not link to this table"));
    }

    let (back_idx, _) = spec(state, table)?
        .find_by_tag(&state.alloc, origin_desc.paired_tag)?
        .ok_or_else(|| Error::corrupt("paired backlink column missing"))?;

    let t = tree(state, table)?;
    let (leaf, pos) = t.find(&state.alloc, key)?.ok_or(Error::KeyNotFound)?;
    let backlinks = BacklinkLeaf::attach(leaf.column_root(&state.alloc, back_idx)?);
    backlinks.get_all(&state.alloc, pos)
}

/// Number of rows pointing at `key` through *strong* link columns.
fn strong_owner_count(state: &TxnState, table: TableKey, key: ObjKey) -> Result<usize> {
    let table_spec = spec(state, table)?;
    let t = tree(state, table)?;
    let (leaf, pos) = t.find(&state.alloc, key)?.ok_or(Error::KeyNotFound)?;

    let mut total = 0;
    for (i, desc) in table_spec.columns(&state.alloc)?.iter().enumerate() {
        if desc.key.column_type()? != ColumnType::Backlink {
            continue;
        }

        let origin_table = desc
            .target
            .ok_or_else(|| Error::corrupt("backlink without origin table"))?;
        let origin_spec = spec(state, origin_table)?;
        let Some((_, origin_desc)) = origin_spec.find_by_tag(&state.alloc, desc.paired_tag)?
        else {
            continue;
        };

        if origin_desc.key.is_strong_link() {
            let backlinks = BacklinkLeaf::attach(leaf.column_root(&state.alloc, i)?);
            total += backlinks.count(&state.alloc, pos)?;
        }
    }
    Ok(total)
}

fn remove_object_rec(
    state: &mut TxnState,
    table: TableKey,
    key: ObjKey,
    removing: &mut Vec<(TableKey, ObjKey)>,
) -> Result<()> {
    if removing.contains(&(table, key)) {
        return Ok(());
    }
    removing.push((table, key));

    let columns = spec(state, table)?.columns(&state.alloc)?;

    // 1. nobody may hold this row through a strong link; weak origins
    //    are nullified
    for (i, desc) in columns.iter().enumerate() {
        if desc.key.column_type()? != ColumnType::Backlink {
            continue;
        }

        let origin_table = desc
            .target
            .ok_or_else(|| Error::corrupt("backlink without origin table"))?;

        let origins = {
            let t = tree(state, table)?;
            let (leaf, pos) = t.find(&state.alloc, key)?.ok_or(Error::KeyNotFound)?;
            let backlinks = BacklinkLeaf::attach(leaf.column_root(&state.alloc, i)?);
            backlinks.get_all(&state.alloc, pos)?
        };

        if origins.is_empty() {
            continue;
        }

        let (origin_idx, origin_desc) = spec(state, origin_table)?
            .find_by_tag(&state.alloc, desc.paired_tag)?
            .ok_or_else(|| Error::corrupt("paired forward column missing"))?;

        for origin in origins {
            if removing.contains(&(origin_table, origin)) {
                // the origin is going away in this same cascade
                continue;
            }

            if origin_desc.key.is_strong_link() {
                return Err(Error::ConstraintViolation(
                    "row is held by a strong link".into(),
                ));
            }

            // weak link: nullify the origin's forward slot
            write_raw(state, origin_table, origin, origin_idx, &Value::Null)?;
        }
    }

    // 2. drop this row's outgoing links
    for (i, desc) in columns.iter().enumerate() {
        if desc.key.column_type()? != ColumnType::Link {
            continue;
        }

        let target_table = desc
            .target
            .ok_or_else(|| Error::corrupt("link column without target"))?;

        let target = match get_value_at(state, table, key, i)? {
            Value::Link(target) => target,
            _ => continue,
        };

        if removing.contains(&(target_table, target)) {
            continue;
        }

        backlink_update(state, target_table, target, desc.paired_tag, key, false)?;

        if desc.key.is_strong_link() && strong_owner_count(state, target_table, target)? == 0 {
            remove_object_rec(state, target_table, target, removing)?;
        }
    }

    // 3. search indexes forget this row
    for (i, desc) in columns.iter().enumerate() {
        if desc.index_ref != 0 {
            let old = get_value_at(state, table, key, i)?;
            index_swap(state, table, i, key, &old, &Value::Null)?;
        }
    }

    // 4. the row itself
    let cols = spec_cols_cache(state, table)?;
    let mut t = tree(state, table)?;
    t.remove(&mut state.alloc, &cols, key)?;
    save_tree(state, table, &t)
}

fn get_value_at(
    state: &TxnState,
    table: TableKey,
    key: ObjKey,
    col_index: usize,
) -> Result<Value> {
    let cols = spec_cols_cache(state, table)?;
    let t = tree(state, table)?;
    let (leaf, pos) = t.find(&state.alloc, key)?.ok_or(Error::KeyNotFound)?;
    leaf.get_value(&state.alloc, &cols, col_index, pos)
}

/// Moves a row's index posting from `old` to `new` for column
/// `col_index` (only string values participate).
fn index_swap(
    state: &mut TxnState,
    table: TableKey,
    col_index: usize,
    key: ObjKey,
    old: &Value,
    new: &Value,
) -> Result<()> {
    let desc = spec(state, table)?.column(&state.alloc, col_index)?;
    if desc.index_ref == 0 {
        return Ok(());
    }

    let mut index = SearchIndex::from_ref(desc.index_ref);

    if let Value::String(s) = old {
        let id = state
            .group
            .lookup_string(&state.alloc, s)?
            .ok_or_else(|| Error::corrupt("indexed string missing from interner"))?;
        index.remove(&mut state.alloc, id, key)?;
    }

    if let Value::String(s) = new {
        let id = state.group.intern(&mut state.alloc, s)?;
        index.add(&mut state.alloc, id, key)?;
    }

    let mut table_spec = spec(state, table)?;
    table_spec.set_index_ref(&mut state.alloc, col_index, index.root())?;
    let t = tree(state, table)?;
    save_parts(state, table, &table_spec, &t)
}

/// Indexes the default values of a freshly created row.
fn index_row_defaults(state: &mut TxnState, table: TableKey, key: ObjKey) -> Result<()> {
    let columns = spec(state, table)?.columns(&state.alloc)?;

    for (i, desc) in columns.iter().enumerate() {
        if desc.index_ref == 0 {
            continue;
        }

        let default = get_value_at(state, table, key, i)?;
        index_swap(state, table, i, key, &Value::Null, &default)?;
    }
    Ok(())
}
