// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! List / set / dictionary accessors over collection columns.
//!
//! Each accessor re-locates its row per operation, so it stays valid
//! across cluster splits caused by other writes in the transaction.

use super::{check_writable, save_tree, spec, spec_cols_cache, tree};
use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::array::Array;
use crate::keys::{CollectionKind, ColKey, ColumnType, ObjKey, TableKey};
use crate::leaf::{ColumnLeaf, LeafOps, StringLeaf};
use crate::transaction::{Transaction, TxnState};
use crate::value::Value;
use crate::{Error, Result};

#[derive(Copy, Clone)]
struct CollectionHandle<'t> {
    txn: &'t Transaction,
    table: TableKey,
    obj: ObjKey,
    col: ColKey,
}

impl<'t> CollectionHandle<'t> {
    fn elem_config(&self, state: &TxnState) -> Result<(usize, ColumnType, bool)> {
        let spec = spec(state, self.table)?;
        let i = spec.check_key(&state.alloc, self.col)?;
        Ok((i, self.col.column_type()?, self.col.is_nullable()))
    }

    /// Runs `f` against the row's (possibly absent) collection node
    /// without materializing it.
    fn read<T>(
        &self,
        f: impl FnOnce(&SlabAlloc, Option<Ref>, ColumnType, bool) -> Result<T>,
    ) -> Result<T> {
        let state = self.txn.state.borrow();
        let (i, elem_type, nullable) = self.elem_config(&state)?;

        let cols = spec_cols_cache(&state, self.table)?;
        let t = tree(&state, self.table)?;
        let (leaf, pos) = t
            .find(&state.alloc, self.obj)?
            .ok_or(Error::KeyNotFound)?;

        let coll = match leaf.column(&state.alloc, &cols, i)? {
            ColumnLeaf::Collection(c) => c,
            _ => return Err(Error::logic("not a collection column")),
        };

        let node = coll.collection_ref(&state.alloc, pos)?;
        let node = if node == NULL_REF { None } else { Some(node) };
        f(&state.alloc, node, elem_type, nullable)
    }

    /// Runs `f` against the row's materialized collection node and
    /// re-references the whole path.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut SlabAlloc, Ref, ColumnType, bool) -> Result<(Ref, T)>,
    ) -> Result<T> {
        let state = &mut *self.txn.state.borrow_mut();
        check_writable(state)?;

        let (i, elem_type, nullable) = self.elem_config(state)?;
        let cols = spec_cols_cache(state, self.table)?;

        let mut t = tree(state, self.table)?;
        let out = t.with_leaf_mut(&mut state.alloc, self.obj, |alloc, leaf, pos| {
            let mut coll = match leaf.column(alloc, &cols, i)? {
                ColumnLeaf::Collection(c) => c,
                _ => return Err(Error::logic("not a collection column")),
            };

            let node = coll.ensure_collection(alloc, pos)?;
            let (new_node, out) = f(alloc, node, elem_type, nullable)?;

            coll.set_collection_ref(alloc, pos, new_node)?;
            leaf.update_column(alloc, i, coll.root())?;
            Ok(out)
        })?;

        save_tree(state, self.table, &t)?;
        Ok(out)
    }
}

/// Ordered list of values in one row's collection column
#[derive(Copy, Clone)]
pub struct List<'t> {
    handle: CollectionHandle<'t>,
}

impl<'t> List<'t> {
    pub(crate) fn new(txn: &'t Transaction, table: TableKey, obj: ObjKey, col: ColKey) -> Self {
        Self {
            handle: CollectionHandle {
                txn,
                table,
                obj,
                col,
            },
        }
    }

    /// Number of elements.
    pub fn len(&self) -> Result<usize> {
        self.handle.read(|alloc, node, elem_type, nullable| {
            node.map_or(Ok(0), |node| {
                ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable).len(alloc)
            })
        })
    }

    /// Returns `true` if the list has no elements.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads the element at `idx`.
    pub fn get(&self, idx: usize) -> Result<Value> {
        self.handle.read(|alloc, node, elem_type, nullable| {
            let node = node.ok_or_else(|| Error::logic("list index out of bounds"))?;
            ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable).get(alloc, idx)
        })
    }

    /// All elements in order.
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        self.handle.read(|alloc, node, elem_type, nullable| {
            let Some(node) = node else {
                return Ok(Vec::new());
            };

            let leaf = ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable);
            (0..leaf.len(alloc)?).map(|i| leaf.get(alloc, i)).collect()
        })
    }

    /// Overwrites the element at `idx`.
    pub fn set(&self, idx: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.handle.write(move |alloc, node, elem_type, nullable| {
            let mut leaf = ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable);
            leaf.set(alloc, idx, &value)?;
            Ok((leaf.root(), ()))
        })
    }

    /// Inserts before `idx`.
    pub fn insert(&self, idx: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.handle.write(move |alloc, node, elem_type, nullable| {
            let mut leaf = ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable);
            leaf.insert(alloc, idx, &value)?;
            Ok((leaf.root(), ()))
        })
    }

    /// Appends.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.handle.write(move |alloc, node, elem_type, nullable| {
            let mut leaf = ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable);
            leaf.push(alloc, &value)?;
            Ok((leaf.root(), ()))
        })
    }

    /// Removes the element at `idx`.
    pub fn remove(&self, idx: usize) -> Result<()> {
        self.handle.write(|alloc, node, elem_type, nullable| {
            let mut leaf = ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable);
            leaf.erase(alloc, idx)?;
            Ok((leaf.root(), ()))
        })
    }

    /// Removes all elements.
    pub fn clear(&self) -> Result<()> {
        self.handle.write(|alloc, node, elem_type, nullable| {
            let mut leaf = ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable);
            leaf.destroy(alloc)?;
            let fresh = ColumnLeaf::create(alloc, elem_type, CollectionKind::Scalar, nullable)?;
            Ok((fresh.root(), ()))
        })
    }
}

/// Deduplicated unordered set of values in one row's collection column
#[derive(Copy, Clone)]
pub struct SetCollection<'t> {
    handle: CollectionHandle<'t>,
}

impl<'t> SetCollection<'t> {
    pub(crate) fn new(txn: &'t Transaction, table: TableKey, obj: ObjKey, col: ColKey) -> Self {
        Self {
            handle: CollectionHandle {
                txn,
                table,
                obj,
                col,
            },
        }
    }

    /// Number of elements.
    pub fn len(&self) -> Result<usize> {
        self.handle.read(|alloc, node, elem_type, nullable| {
            node.map_or(Ok(0), |node| {
                ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable).len(alloc)
            })
        })
    }

    /// Returns `true` if the set has no elements.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Membership test.
    pub fn contains(&self, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        self.handle.read(|alloc, node, elem_type, nullable| {
            let Some(node) = node else {
                return Ok(false);
            };

            let leaf = ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable);
            for i in 0..leaf.len(alloc)? {
                if leaf.get(alloc, i)? == value {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    /// Inserts; returns `false` if the value was already present.
    pub fn insert(&self, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        self.handle.write(move |alloc, node, elem_type, nullable| {
            let mut leaf = ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable);

            for i in 0..leaf.len(alloc)? {
                if leaf.get(alloc, i)? == value {
                    return Ok((leaf.root(), false));
                }
            }

            leaf.push(alloc, &value)?;
            Ok((leaf.root(), true))
        })
    }

    /// Removes; returns `false` if the value was absent.
    pub fn remove(&self, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        self.handle.write(move |alloc, node, elem_type, nullable| {
            let mut leaf = ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable);

            for i in 0..leaf.len(alloc)? {
                if leaf.get(alloc, i)? == value {
                    leaf.erase(alloc, i)?;
                    return Ok((leaf.root(), true));
                }
            }

            Ok((leaf.root(), false))
        })
    }

    /// All elements (storage order).
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        self.handle.read(|alloc, node, elem_type, nullable| {
            let Some(node) = node else {
                return Ok(Vec::new());
            };

            let leaf = ColumnLeaf::attach(node, elem_type, CollectionKind::Scalar, nullable);
            (0..leaf.len(alloc)?).map(|i| leaf.get(alloc, i)).collect()
        })
    }
}

/// String-keyed dictionary in one row's collection column
///
/// The collection node is a two-slot parent: a string leaf of keys and
/// a value leaf, kept parallel.
#[derive(Copy, Clone)]
pub struct Dictionary<'t> {
    handle: CollectionHandle<'t>,
}

fn dict_parts(alloc: &SlabAlloc, node: Ref, elem_type: ColumnType, nullable: bool) -> Result<(StringLeaf, ColumnLeaf)> {
    let parent = Array::from_ref(node);
    Ok((
        StringLeaf::attach(parent.get_ref(alloc, 0)?, false),
        ColumnLeaf::attach(
            parent.get_ref(alloc, 1)?,
            elem_type,
            CollectionKind::Scalar,
            nullable,
        ),
    ))
}

fn dict_store(
    alloc: &mut SlabAlloc,
    node: Ref,
    keys: &StringLeaf,
    values: &ColumnLeaf,
) -> Result<Ref> {
    let mut parent = Array::from_ref(node);
    parent.set_ref(alloc, 0, keys.root())?;
    parent.set_ref(alloc, 1, values.root())?;
    Ok(parent.root())
}

impl<'t> Dictionary<'t> {
    pub(crate) fn new(txn: &'t Transaction, table: TableKey, obj: ObjKey, col: ColKey) -> Self {
        Self {
            handle: CollectionHandle {
                txn,
                table,
                obj,
                col,
            },
        }
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize> {
        self.handle.read(|alloc, node, elem_type, nullable| {
            node.map_or(Ok(0), |node| {
                dict_parts(alloc, node, elem_type, nullable)?.0.len(alloc)
            })
        })
    }

    /// Returns `true` if the dictionary has no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Looks a key up.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.handle.read(|alloc, node, elem_type, nullable| {
            let Some(node) = node else {
                return Ok(None);
            };

            let (keys, values) = dict_parts(alloc, node, elem_type, nullable)?;
            match keys.find_first(alloc, key)? {
                Some(pos) => Ok(Some(values.get(alloc, pos)?)),
                None => Ok(None),
            }
        })
    }

    /// Inserts or overwrites an entry; returns `true` when the key was
    /// new.
    pub fn insert(&self, key: &str, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        self.handle.write(move |alloc, node, elem_type, nullable| {
            let (mut keys, mut values) = dict_parts(alloc, node, elem_type, nullable)?;

            let fresh = match keys.find_first(alloc, key)? {
                Some(pos) => {
                    values.set(alloc, pos, &value)?;
                    false
                }
                None => {
                    let at = keys.len(alloc)?;
                    keys.insert(alloc, at, &Value::String(key.into()))?;
                    values.insert(alloc, at, &value)?;
                    true
                }
            };

            Ok((dict_store(alloc, node, &keys, &values)?, fresh))
        })
    }

    /// Removes an entry; returns `false` when the key was absent.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.handle.write(|alloc, node, elem_type, nullable| {
            let (mut keys, mut values) = dict_parts(alloc, node, elem_type, nullable)?;

            let Some(pos) = keys.find_first(alloc, key)? else {
                return Ok((dict_store(alloc, node, &keys, &values)?, false));
            };

            keys.erase(alloc, pos)?;
            values.erase(alloc, pos)?;
            Ok((dict_store(alloc, node, &keys, &values)?, true))
        })
    }

    /// All keys (storage order).
    pub fn keys(&self) -> Result<Vec<String>> {
        self.handle.read(|alloc, node, elem_type, nullable| {
            let Some(node) = node else {
                return Ok(Vec::new());
            };

            let (keys, _) = dict_parts(alloc, node, elem_type, nullable)?;
            let mut out = Vec::new();
            for i in 0..keys.len(alloc)? {
                match keys.get(alloc, i)? {
                    Value::String(s) => out.push(s),
                    _ => return Err(Error::corrupt("dictionary key is not a string")),
                }
            }
            Ok(out)
        })
    }
}
