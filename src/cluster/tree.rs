// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The cluster tree: a B+tree of clusters keyed by ObjKey.
//!
//! Inner nodes carry separator keys and cumulative row counts
//! (`array::bptree`); leaves are column-major clusters. All mutation is
//! copy-on-write: recursion returns the (possibly relocated) child ref
//! and parents re-reference it on the way back up.

use super::leaf::{ClusterLeaf, ColumnSpec};
use super::{CLUSTER_MAX, CLUSTER_MIN, INNER_MAX};
use crate::alloc::{Ref, SlabAlloc};
use crate::array::bptree::InnerNode;
use crate::keys::ObjKey;
use crate::node::NodeHeader;
use crate::{Error, Result};

/// Root accessor of a table's cluster tree
#[derive(Copy, Clone, Debug)]
pub struct ClusterTree {
    root: Ref,
}

fn is_inner(alloc: &SlabAlloc, ref_: Ref) -> Result<bool> {
    Ok(NodeHeader::decode(alloc.translate(ref_)?)?.is_inner_bptree())
}

enum InsertUp {
    Done(Ref),
    Split {
        node: Ref,
        sep_key: i64,
        right: Ref,
        right_rows: u64,
    },
}

impl ClusterTree {
    /// Creates an empty tree (a single empty cluster).
    pub fn create(alloc: &mut SlabAlloc, cols: &[ColumnSpec]) -> Result<Self> {
        Ok(Self {
            root: ClusterLeaf::create(alloc, cols)?.root(),
        })
    }

    /// Wraps an existing tree root.
    #[must_use]
    pub fn from_ref(root: Ref) -> Self {
        Self { root }
    }

    /// The tree's current root ref.
    #[must_use]
    pub fn root(&self) -> Ref {
        self.root
    }

    /// Total number of rows.
    pub fn size(&self, alloc: &SlabAlloc) -> Result<u64> {
        if is_inner(alloc, self.root)? {
            InnerNode::from_ref(self.root).total_rows(alloc)
        } else {
            Ok(ClusterLeaf::from_ref(self.root).len(alloc)? as u64)
        }
    }

    /// Locates `key`: the containing cluster and in-cluster position.
    pub fn find(&self, alloc: &SlabAlloc, key: ObjKey) -> Result<Option<(ClusterLeaf, usize)>> {
        let mut node = self.root;

        while is_inner(alloc, node)? {
            let inner = InnerNode::from_ref(node);
            let k = inner.find_child_by_key(alloc, key.value())?;
            node = inner.child_ref(alloc, k)?;
        }

        let leaf = ClusterLeaf::from_ref(node);
        match leaf.find_key(alloc, key)? {
            Ok(pos) => Ok(Some((leaf, pos))),
            Err(_) => Ok(None),
        }
    }

    /// Locates the row at logical position `pos` (in key order).
    pub fn find_by_pos(&self, alloc: &SlabAlloc, pos: u64) -> Result<(ClusterLeaf, usize)> {
        let mut node = self.root;
        let mut pos = pos;

        while is_inner(alloc, node)? {
            let inner = InnerNode::from_ref(node);
            let (k, local) = inner.find_child_by_pos(alloc, pos)?;
            node = inner.child_ref(alloc, k)?;
            pos = local;
        }

        let leaf = ClusterLeaf::from_ref(node);
        if pos as usize >= leaf.len(alloc)? {
            return Err(Error::logic("row position out of table"));
        }
        Ok((leaf, pos as usize))
    }

    /// Inserts a new row with `key`, splitting on the way up as needed.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, cols: &[ColumnSpec], key: ObjKey) -> Result<()> {
        match Self::insert_rec(alloc, cols, self.root, key)? {
            InsertUp::Done(node) => {
                self.root = node;
            }
            InsertUp::Split {
                node,
                sep_key,
                right,
                right_rows,
            } => {
                // grow the tree by one level
                let left_rows = Self::rows_of(alloc, node)?;
                let left_key = Self::first_key_of(alloc, node)?;
                let new_root = InnerNode::create(
                    alloc,
                    &[
                        (left_key, node, left_rows),
                        (sep_key, right, right_rows),
                    ],
                )?;
                self.root = new_root.root();
            }
        }
        Ok(())
    }

    fn rows_of(alloc: &SlabAlloc, node: Ref) -> Result<u64> {
        if is_inner(alloc, node)? {
            InnerNode::from_ref(node).total_rows(alloc)
        } else {
            Ok(ClusterLeaf::from_ref(node).len(alloc)? as u64)
        }
    }

    fn first_key_of(alloc: &SlabAlloc, node: Ref) -> Result<i64> {
        if is_inner(alloc, node)? {
            InnerNode::from_ref(node).sep_key(alloc, 0)
        } else {
            let leaf = ClusterLeaf::from_ref(node);
            if leaf.is_empty(alloc)? {
                Ok(i64::MIN)
            } else {
                Ok(leaf.first_key(alloc)?.value())
            }
        }
    }

    fn insert_rec(
        alloc: &mut SlabAlloc,
        cols: &[ColumnSpec],
        node: Ref,
        key: ObjKey,
    ) -> Result<InsertUp> {
        if !is_inner(alloc, node)? {
            let mut leaf = ClusterLeaf::from_ref(node);
            leaf.insert_row(alloc, cols, key)?;

            if leaf.len(alloc)? <= CLUSTER_MAX {
                return Ok(InsertUp::Done(leaf.root()));
            }

            // split at the median; ties send the higher keys right
            let at = leaf.len(alloc)? / 2;
            let right = leaf.split(alloc, cols, at)?;
            let sep_key = right.first_key(alloc)?.value();
            let right_rows = right.len(alloc)? as u64;

            log::trace!("cluster split at key {sep_key}");

            return Ok(InsertUp::Split {
                node: leaf.root(),
                sep_key,
                right: right.root(),
                right_rows,
            });
        }

        let mut inner = InnerNode::from_ref(node);
        let k = inner.find_child_by_key(alloc, key.value())?;
        let child = inner.child_ref(alloc, k)?;

        match Self::insert_rec(alloc, cols, child, key)? {
            InsertUp::Done(new_child) => {
                inner.set_child_ref(alloc, k, new_child)?;
                inner.adjust_rows(alloc, k, 1)?;

                // a key below every separator must pull the first
                // separator down with it
                if k == 0 {
                    let sep = inner.sep_key(alloc, 0)?;
                    if key.value() < sep {
                        inner.set_sep_key(alloc, 0, key.value())?;
                    }
                }

                Ok(InsertUp::Done(inner.root()))
            }
            InsertUp::Split {
                node: new_child,
                sep_key,
                right,
                right_rows,
            } => {
                inner.set_child_ref(alloc, k, new_child)?;
                inner.adjust_rows(alloc, k, 1)?;
                inner.adjust_rows(alloc, k, -(right_rows as i64))?;
                inner.insert_child(alloc, k + 1, sep_key, right, right_rows)?;

                if k == 0 && key.value() < inner.sep_key(alloc, 0)? {
                    inner.set_sep_key(alloc, 0, key.value())?;
                }

                if inner.child_count(alloc)? <= INNER_MAX {
                    return Ok(InsertUp::Done(inner.root()));
                }

                // split the inner node itself
                let n = inner.child_count(alloc)?;
                let at = n / 2;

                let mut moved = Vec::with_capacity(n - at);
                for i in at..n {
                    moved.push((
                        inner.sep_key(alloc, i)?,
                        inner.child_ref(alloc, i)?,
                        inner.rows_through(alloc, i)? - inner.rows_before(alloc, i)?,
                    ));
                }

                for i in (at..n).rev() {
                    inner.remove_child(alloc, i)?;
                }

                let right_inner = InnerNode::create(alloc, &moved)?;
                let sep = moved
                    .first()
                    .map(|(key, _, _)| *key)
                    .ok_or_else(|| Error::corrupt("empty inner split"))?;

                Ok(InsertUp::Split {
                    node: inner.root(),
                    sep_key: sep,
                    right: right_inner.root(),
                    right_rows: right_inner.total_rows(alloc)?,
                })
            }
        }
    }

    /// Removes the row with `key`, rebalancing leaves that underflow.
    pub fn remove(&mut self, alloc: &mut SlabAlloc, cols: &[ColumnSpec], key: ObjKey) -> Result<()> {
        let new_root = Self::remove_rec(alloc, cols, self.root, key)?;
        self.root = new_root;

        // collapse a root inner node that is down to one child
        while is_inner(alloc, self.root)? {
            let inner = InnerNode::from_ref(self.root);
            if inner.child_count(alloc)? > 1 {
                break;
            }
            let only = inner.child_ref(alloc, 0)?;
            inner.destroy_shallow(alloc)?;
            self.root = only;
        }

        Ok(())
    }

    fn remove_rec(
        alloc: &mut SlabAlloc,
        cols: &[ColumnSpec],
        node: Ref,
        key: ObjKey,
    ) -> Result<Ref> {
        if !is_inner(alloc, node)? {
            let mut leaf = ClusterLeaf::from_ref(node);
            let pos = match leaf.find_key(alloc, key)? {
                Ok(pos) => pos,
                Err(_) => return Err(Error::KeyNotFound),
            };
            leaf.erase_row(alloc, cols, pos)?;
            return Ok(leaf.root());
        }

        let mut inner = InnerNode::from_ref(node);
        let k = inner.find_child_by_key(alloc, key.value())?;
        let child = inner.child_ref(alloc, k)?;

        let new_child = Self::remove_rec(alloc, cols, child, key)?;
        inner.set_child_ref(alloc, k, new_child)?;
        inner.adjust_rows(alloc, k, -1)?;

        Self::rebalance_child(alloc, cols, &mut inner, k)?;
        Ok(inner.root())
    }

    /// Merges or redistributes child `k` with a sibling when it is a
    /// leaf below `CLUSTER_MIN`. Inner children are only removed once
    /// empty; the leaf-size invariant is what matters.
    fn rebalance_child(
        alloc: &mut SlabAlloc,
        cols: &[ColumnSpec],
        inner: &mut InnerNode,
        k: usize,
    ) -> Result<()> {
        let child = inner.child_ref(alloc, k)?;

        if is_inner(alloc, child)? {
            let child_inner = InnerNode::from_ref(child);
            if child_inner.child_count(alloc)? == 0 {
                child_inner.destroy_shallow(alloc)?;
                inner.remove_child(alloc, k)?;
            }
            return Ok(());
        }

        let leaf = ClusterLeaf::from_ref(child);
        let len = leaf.len(alloc)?;
        if len >= CLUSTER_MIN {
            return Ok(());
        }

        let sibling_count = inner.child_count(alloc)?;
        if sibling_count <= 1 {
            // no sibling to borrow from; an underfull (even empty) only
            // child is collapsed by the caller when the tree shrinks
            if len == 0 {
                leaf.destroy(alloc)?;
                inner.remove_child(alloc, k)?;
            }
            return Ok(());
        }

        // prefer the left sibling
        let (left_idx, right_idx) = if k > 0 { (k - 1, k) } else { (k, k + 1) };

        let left_child = inner.child_ref(alloc, left_idx)?;
        let right_child = inner.child_ref(alloc, right_idx)?;

        // only leaf siblings take part; a mixed-depth neighbor means the
        // tree is unbalanced, which the cluster tree never produces
        if is_inner(alloc, left_child)? || is_inner(alloc, right_child)? {
            return Ok(());
        }

        let mut left = ClusterLeaf::from_ref(left_child);
        let right = ClusterLeaf::from_ref(right_child);

        let total = left.len(alloc)? + right.len(alloc)?;
        let right_rows = right.len(alloc)? as u64;

        left.merge_from(alloc, cols, &right)?;
        inner.set_child_ref(alloc, left_idx, left.root())?;
        inner.adjust_rows(alloc, left_idx, right_rows as i64)?;
        inner.adjust_rows(alloc, right_idx, -(right_rows as i64))?;
        inner.remove_child(alloc, right_idx)?;

        if total > CLUSTER_MAX {
            // the merged leaf is oversized: redistribute evenly
            let at = total / 2;
            let new_right = left.split(alloc, cols, at)?;
            let sep = new_right.first_key(alloc)?.value();
            let new_right_rows = new_right.len(alloc)? as u64;

            inner.set_child_ref(alloc, left_idx, left.root())?;
            inner.adjust_rows(alloc, left_idx, -(new_right_rows as i64))?;
            inner.insert_child(alloc, left_idx + 1, sep, new_right.root(), new_right_rows)?;
        }

        Ok(())
    }

    /// In-order traversal; the visitor returns `false` to stop early.
    pub fn for_each(
        &self,
        alloc: &SlabAlloc,
        mut visitor: impl FnMut(ObjKey, &ClusterLeaf, usize) -> Result<bool>,
    ) -> Result<()> {
        Self::for_each_rec(alloc, self.root, &mut visitor)?;
        Ok(())
    }

    fn for_each_rec(
        alloc: &SlabAlloc,
        node: Ref,
        visitor: &mut impl FnMut(ObjKey, &ClusterLeaf, usize) -> Result<bool>,
    ) -> Result<bool> {
        if is_inner(alloc, node)? {
            let inner = InnerNode::from_ref(node);
            let n = inner.child_count(alloc)?;
            for k in 0..n {
                let child = inner.child_ref(alloc, k)?;
                if !Self::for_each_rec(alloc, child, visitor)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        let leaf = ClusterLeaf::from_ref(node);
        let n = leaf.len(alloc)?;
        for pos in 0..n {
            let key = leaf.key_at(alloc, pos)?;
            if !visitor(key, &leaf, pos)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Descends to `key`'s leaf, applies `f` mutably, and re-references
    /// the whole path.
    pub fn with_leaf_mut<T>(
        &mut self,
        alloc: &mut SlabAlloc,
        key: ObjKey,
        f: impl FnOnce(&mut SlabAlloc, &mut ClusterLeaf, usize) -> Result<T>,
    ) -> Result<T> {
        let (new_root, out) = Self::with_leaf_rec(alloc, self.root, key, f)?;
        self.root = new_root;
        Ok(out)
    }

    fn with_leaf_rec<T>(
        alloc: &mut SlabAlloc,
        node: Ref,
        key: ObjKey,
        f: impl FnOnce(&mut SlabAlloc, &mut ClusterLeaf, usize) -> Result<T>,
    ) -> Result<(Ref, T)> {
        if !is_inner(alloc, node)? {
            let mut leaf = ClusterLeaf::from_ref(node);
            let pos = match leaf.find_key(alloc, key)? {
                Ok(pos) => pos,
                Err(_) => return Err(Error::KeyNotFound),
            };
            let out = f(alloc, &mut leaf, pos)?;
            return Ok((leaf.root(), out));
        }

        let mut inner = InnerNode::from_ref(node);
        let k = inner.find_child_by_key(alloc, key.value())?;
        let child = inner.child_ref(alloc, k)?;

        let (new_child, out) = Self::with_leaf_rec(alloc, child, key, f)?;
        inner.set_child_ref(alloc, k, new_child)?;
        Ok((inner.root(), out))
    }

    /// Applies `f` to every cluster leaf, re-referencing the path
    /// (used by column add/remove).
    pub fn for_each_leaf_mut(
        &mut self,
        alloc: &mut SlabAlloc,
        f: &mut impl FnMut(&mut SlabAlloc, &mut ClusterLeaf) -> Result<()>,
    ) -> Result<()> {
        self.root = Self::for_each_leaf_mut_rec(alloc, self.root, f)?;
        Ok(())
    }

    fn for_each_leaf_mut_rec(
        alloc: &mut SlabAlloc,
        node: Ref,
        f: &mut impl FnMut(&mut SlabAlloc, &mut ClusterLeaf) -> Result<()>,
    ) -> Result<Ref> {
        if !is_inner(alloc, node)? {
            let mut leaf = ClusterLeaf::from_ref(node);
            f(alloc, &mut leaf)?;
            return Ok(leaf.root());
        }

        let mut inner = InnerNode::from_ref(node);
        let n = inner.child_count(alloc)?;
        for k in 0..n {
            let child = inner.child_ref(alloc, k)?;
            let new_child = Self::for_each_leaf_mut_rec(alloc, child, f)?;
            inner.set_child_ref(alloc, k, new_child)?;
        }
        Ok(inner.root())
    }

    /// Destroys the whole tree including every cluster.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> Result<()> {
        Self::destroy_rec(alloc, self.root)
    }

    fn destroy_rec(alloc: &mut SlabAlloc, node: Ref) -> Result<()> {
        if is_inner(alloc, node)? {
            let inner = InnerNode::from_ref(node);
            let n = inner.child_count(alloc)?;
            for k in 0..n {
                Self::destroy_rec(alloc, inner.child_ref(alloc, k)?)?;
            }
            return inner.destroy_shallow(alloc);
        }

        ClusterLeaf::from_ref(node).destroy(alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{CollectionKind, ColumnType};
    use crate::mapper::{FileMap, OpenMode};
    use crate::value::Value;
    use rand::prelude::*;
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
        vec![ColumnSpec {
            col_type: ColumnType::Int,
            kind: CollectionKind::Scalar,
            nullable: false,
        }]
    }

    #[test]
    fn grows_past_one_leaf_and_stays_ordered() -> crate::Result<()> {
        let mut alloc = alloc();
        let cols = cols();
        let mut tree = ClusterTree::create(&mut alloc, &cols)?;

        let n = 3_000i64;
        for key in 0..n {
            tree.insert(&mut alloc, &cols, ObjKey(key))?;
        }
        assert_eq!(n as u64, tree.size(&alloc)?);

        // every key is findable
        for key in [0, 1, 17, 255, 256, 257, 1023, n - 1] {
            let (leaf, pos) = tree
                .find(&alloc, ObjKey(key))?
                .unwrap_or_else(|| panic!("key {key} missing"));
            assert_eq!(ObjKey(key), leaf.key_at(&alloc, pos)?);
        }
        assert!(tree.find(&alloc, ObjKey(n))?.is_none());

        // traversal yields keys in order
        let mut seen = Vec::new();
        tree.for_each(&alloc, |key, _, _| {
            seen.push(key.0);
            Ok(true)
        })?;
        let expected: Vec<i64> = (0..n).collect();
        assert_eq!(expected, seen);

        // position lookup agrees
        let (leaf, pos) = tree.find_by_pos(&alloc, 1_234)?;
        assert_eq!(ObjKey(1_234), leaf.key_at(&alloc, pos)?);

        Ok(())
    }

    #[test]
    fn random_insert_order() -> crate::Result<()> {
        let mut alloc = alloc();
        let cols = cols();
        let mut tree = ClusterTree::create(&mut alloc, &cols)?;

        let mut keys: Vec<i64> = (0..2_000).collect();
        let mut rng = StdRng::seed_from_u64(0xDB);
        keys.shuffle(&mut rng);

        for &key in &keys {
            tree.insert(&mut alloc, &cols, ObjKey(key))?;
        }

        let mut seen = Vec::new();
        tree.for_each(&alloc, |key, _, _| {
            seen.push(key.0);
            Ok(true)
        })?;
        let expected: Vec<i64> = (0..2_000).collect();
        assert_eq!(expected, seen);

        Ok(())
    }

    #[test]
    fn remove_rebalances_until_empty() -> crate::Result<()> {
        let mut alloc = alloc();
        let cols = cols();
        let mut tree = ClusterTree::create(&mut alloc, &cols)?;

        let n = 2_000i64;
        for key in 0..n {
            tree.insert(&mut alloc, &cols, ObjKey(key))?;
        }

        let mut keys: Vec<i64> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(7);
        keys.shuffle(&mut rng);

        for (i, &key) in keys.iter().enumerate() {
            tree.remove(&mut alloc, &cols, ObjKey(key))?;
            assert_eq!((n as u64) - (i as u64) - 1, tree.size(&alloc)?);
        }

        assert_eq!(0, tree.size(&alloc)?);
        assert!(tree.find(&alloc, ObjKey(0))?.is_none());

        // removing from the empty tree reports the missing key
        assert!(matches!(
            tree.remove(&mut alloc, &cols, ObjKey(0)),
            Err(Error::KeyNotFound)
        ));

        Ok(())
    }

    #[test]
    fn leaf_size_invariant_holds() -> crate::Result<()> {
        let mut alloc = alloc();
        let cols = cols();
        let mut tree = ClusterTree::create(&mut alloc, &cols)?;

        for key in 0..5_000i64 {
            tree.insert(&mut alloc, &cols, ObjKey(key))?;
        }
        for key in (0..5_000i64).step_by(2) {
            tree.remove(&mut alloc, &cols, ObjKey(key))?;
        }

        // gather leaf sizes; all but possibly the root leaf must be
        // within bounds
        let mut sizes = Vec::new();
        let mut last_leaf = None;
        tree.for_each(&alloc, |_, leaf, _| {
            if last_leaf != Some(leaf.root()) {
                last_leaf = Some(leaf.root());
                sizes.push(leaf.len(&alloc)?);
            }
            Ok(true)
        })?;

        if sizes.len() > 1 {
            for &size in &sizes {
                assert!(size >= CLUSTER_MIN, "leaf of {size} rows below minimum");
                assert!(size <= CLUSTER_MAX, "leaf of {size} rows above maximum");
            }
        }

        Ok(())
    }

    #[test]
    fn values_survive_splits() -> crate::Result<()> {
        let mut alloc = alloc();
        let cols = cols();
        let mut tree = ClusterTree::create(&mut alloc, &cols)?;

        for key in 0..1_000i64 {
            tree.insert(&mut alloc, &cols, ObjKey(key))?;
            tree.with_leaf_mut(&mut alloc, ObjKey(key), |alloc, leaf, pos| {
                leaf.set_value(alloc, &cols, 0, pos, &Value::Int(key * 3))
            })?;
        }

        for key in 0..1_000i64 {
            let (leaf, pos) = tree
                .find(&alloc, ObjKey(key))?
                .ok_or(Error::KeyNotFound)?;
            assert_eq!(Value::Int(key * 3), leaf.get_value(&alloc, &cols, 0, pos)?);
        }

        Ok(())
    }
}
