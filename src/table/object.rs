// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::collections::{Dictionary, List, SetCollection};
use super::{
    backlink_total, backlinks_through, check_writable, get_value, remove_object_rec, set_value,
};
use crate::keys::{CollectionKind, ColKey, ColumnType, ObjKey, TableKey};
use crate::transaction::Transaction;
use crate::value::Value;
use crate::{Error, Result};

/// Accessor of one row
#[derive(Copy, Clone)]
pub struct Object<'t> {
    txn: &'t Transaction,
    table: TableKey,
    key: ObjKey,
}

impl<'t> Object<'t> {
    pub(crate) fn new(txn: &'t Transaction, table: TableKey, key: ObjKey) -> Self {
        Self { txn, table, key }
    }

    /// The row's stable key.
    #[must_use]
    pub fn key(&self) -> ObjKey {
        self.key
    }

    /// The owning table's key.
    #[must_use]
    pub fn table_key(&self) -> TableKey {
        self.table
    }

    /// Reads a column.
    pub fn get(&self, col: ColKey) -> Result<Value> {
        let state = self.txn.state.borrow();
        get_value(&state, self.table, self.key, col)
    }

    /// Writes a column (maintaining backlinks and search indexes).
    pub fn set(&self, col: ColKey, value: impl Into<Value>) -> Result<()> {
        let state = &mut *self.txn.state.borrow_mut();
        set_value(state, self.table, self.key, col, &value.into())
    }

    /// Removes the row (weak inbound links are nullified, strong
    /// outbound links cascade).
    pub fn remove(self) -> Result<()> {
        let state = &mut *self.txn.state.borrow_mut();
        check_writable(state)?;

        let mut removing = Vec::new();
        remove_object_rec(state, self.table, self.key, &mut removing)
    }

    /// Creates a row in the embedded table targeted by the strong link
    /// column `col` and links it from this row.
    pub fn create_linked_object(&self, col: ColKey) -> Result<Object<'t>> {
        if col.column_type()? != ColumnType::Link {
            return Err(Error::logic("not a link column"));
        }

        let target_table = {
            let state = self.txn.state.borrow();
            let spec = super::spec(&state, self.table)?;
            let i = spec.check_key(&state.alloc, col)?;
            spec.column(&state.alloc, i)?
                .target
                .ok_or_else(|| Error::corrupt("link column without target"))?
        };

        let target = super::Table::new(self.txn, target_table)
            .create_object_inner(None, true)?;

        self.set(col, Value::Link(target.key()))?;
        Ok(target)
    }

    /// Number of rows pointing at this one (all link columns).
    pub fn backlink_count(&self) -> Result<usize> {
        let state = self.txn.state.borrow();
        backlink_total(&state, self.table, self.key)
    }

    /// Rows of `origin_table` pointing at this one through `col`.
    pub fn backlinks(&self, origin_table: TableKey, col: ColKey) -> Result<Vec<ObjKey>> {
        let state = self.txn.state.borrow();
        backlinks_through(&state, self.table, self.key, origin_table, col)
    }

    /// Opens the row's list at `col`.
    pub fn list(&self, col: ColKey) -> Result<List<'t>> {
        self.collection_kind_check(col, CollectionKind::List)?;
        Ok(List::new(self.txn, self.table, self.key, col))
    }

    /// Opens the row's set at `col`.
    pub fn set_collection(&self, col: ColKey) -> Result<SetCollection<'t>> {
        self.collection_kind_check(col, CollectionKind::Set)?;
        Ok(SetCollection::new(self.txn, self.table, self.key, col))
    }

    /// Opens the row's dictionary at `col`.
    pub fn dictionary(&self, col: ColKey) -> Result<Dictionary<'t>> {
        self.collection_kind_check(col, CollectionKind::Dictionary)?;
        Ok(Dictionary::new(self.txn, self.table, self.key, col))
    }

    fn collection_kind_check(&self, col: ColKey, kind: CollectionKind) -> Result<()> {
        if col.collection_kind()? != kind {
            return Err(Error::logic(format!(
                "column is not a {kind:?} collection"
            )));
        }

        // the column must belong to this table
        let state = self.txn.state.borrow();
        super::spec(&state, self.table)?.check_key(&state.alloc, col)?;
        Ok(())
    }
}
