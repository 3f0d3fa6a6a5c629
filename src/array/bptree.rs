// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! B+tree inner-node layout.
//!
//! An inner node is a `has_refs | inner_bptree` array:
//!
//! ```text
//! elem 0        ref of the separator-key array (smallest key per child)
//! elem 1 + 2k   ref of child k
//! elem 2 + 2k   tagged cumulative row count through child k
//! ```
//!
//! The last cumulative entry is the subtree's total row count. Lookups by
//! logical position binary-search the tagged offsets; lookups by key
//! binary-search the separator array.

use super::Array;
use crate::alloc::{Ref, SlabAlloc};
use crate::node::NodeFlags;
use crate::{Error, Result};

/// Accessor for a B+tree inner node
#[derive(Copy, Clone, Debug)]
pub struct InnerNode {
    array: Array,
}

impl InnerNode {
    /// Wraps an existing inner node.
    #[must_use]
    pub fn from_ref(root: Ref) -> Self {
        Self {
            array: Array::from_ref(root),
        }
    }

    /// Creates an inner node over `children` (`(first_key, ref, rows)`
    /// triples, in key order).
    pub fn create(alloc: &mut SlabAlloc, children: &[(i64, Ref, u64)]) -> Result<Self> {
        let mut sep_keys = Array::create(alloc, NodeFlags::default(), 0, 0)?;
        for &(key, _, _) in children {
            sep_keys.push(alloc, key)?;
        }

        let mut array = Array::create(
            alloc,
            NodeFlags::HAS_REFS | NodeFlags::INNER_BPTREE,
            0,
            0,
        )?;
        array.push(alloc, sep_keys.root() as i64)?;

        let mut cum = 0u64;
        for &(_, child, rows) in children {
            cum += rows;
            array.push(alloc, child as i64)?;
            array.push(alloc, super::tag_int(cum as i64))?;
        }

        Ok(Self { array })
    }

    /// The node's current ref.
    #[must_use]
    pub fn root(&self) -> Ref {
        self.array.root()
    }

    /// The underlying array accessor.
    #[must_use]
    pub fn as_array(&self) -> Array {
        self.array
    }

    /// Number of children.
    pub fn child_count(&self, alloc: &SlabAlloc) -> Result<usize> {
        let len = self.array.len(alloc)?;
        if len == 0 || len % 2 == 0 {
            return Err(Error::corrupt(format!("malformed inner node ({len} slots)")));
        }
        Ok((len - 1) / 2)
    }

    /// Total rows in the subtree.
    pub fn total_rows(&self, alloc: &SlabAlloc) -> Result<u64> {
        if self.child_count(alloc)? == 0 {
            return Ok(0);
        }
        let len = self.array.len(alloc)?;
        Ok(self.array.get_tagged(alloc, len - 1)? as u64)
    }

    /// Ref of child `k`.
    pub fn child_ref(&self, alloc: &SlabAlloc, k: usize) -> Result<Ref> {
        self.array.get_ref(alloc, 1 + 2 * k)
    }

    /// Re-references child `k` (after the child was CoW-relocated).
    pub fn set_child_ref(&mut self, alloc: &mut SlabAlloc, k: usize, ref_: Ref) -> Result<()> {
        self.array.set_ref(alloc, 1 + 2 * k, ref_)
    }

    /// Smallest key in child `k`'s subtree.
    pub fn sep_key(&self, alloc: &SlabAlloc, k: usize) -> Result<i64> {
        self.sep_keys(alloc)?.get(alloc, k)
    }

    /// Cumulative row count through child `k`.
    pub fn rows_through(&self, alloc: &SlabAlloc, k: usize) -> Result<u64> {
        Ok(self.array.get_tagged(alloc, 2 + 2 * k)? as u64)
    }

    /// Rows strictly before child `k`.
    pub fn rows_before(&self, alloc: &SlabAlloc, k: usize) -> Result<u64> {
        if k == 0 {
            Ok(0)
        } else {
            self.rows_through(alloc, k - 1)
        }
    }

    /// Child whose subtree covers `key` (the last child whose separator
    /// is at or below it).
    pub fn find_child_by_key(&self, alloc: &SlabAlloc, key: i64) -> Result<usize> {
        let sep_keys = self.sep_keys(alloc)?;
        let n = sep_keys.len(alloc)?;

        let mut left = 0usize;
        let mut right = n;
        while left < right {
            let mid = (left + right) / 2;
            if sep_keys.get(alloc, mid)? <= key {
                left = mid + 1;
            } else {
                right = mid;
            }
        }

        Ok(left.saturating_sub(1))
    }

    /// Child covering logical row `pos`, plus the position inside it.
    pub fn find_child_by_pos(&self, alloc: &SlabAlloc, pos: u64) -> Result<(usize, u64)> {
        let n = self.child_count(alloc)?;

        let mut left = 0usize;
        let mut right = n;
        while left < right {
            let mid = (left + right) / 2;
            if self.rows_through(alloc, mid)? <= pos {
                left = mid + 1;
            } else {
                right = mid;
            }
        }

        if left >= n {
            return Err(Error::logic(format!("row position {pos} out of subtree")));
        }

        Ok((left, pos - self.rows_before(alloc, left)?))
    }

    /// Adds `delta` rows to child `k` and every cumulative count after
    /// it.
    pub fn adjust_rows(&mut self, alloc: &mut SlabAlloc, k: usize, delta: i64) -> Result<()> {
        let n = self.child_count(alloc)?;
        for i in k..n {
            let cum = self.array.get_tagged(alloc, 2 + 2 * i)?;
            self.array.set_tagged(alloc, 2 + 2 * i, cum + delta)?;
        }
        Ok(())
    }

    /// Replaces child `k`'s separator key.
    pub fn set_sep_key(&mut self, alloc: &mut SlabAlloc, k: usize, key: i64) -> Result<()> {
        let mut sep_keys = self.sep_keys(alloc)?;
        sep_keys.set(alloc, k, key)?;
        self.array.set_ref(alloc, 0, sep_keys.root())
    }

    /// Inserts a child at slot `k` holding `rows` rows.
    pub fn insert_child(
        &mut self,
        alloc: &mut SlabAlloc,
        k: usize,
        first_key: i64,
        child: Ref,
        rows: u64,
    ) -> Result<()> {
        let mut sep_keys = self.sep_keys(alloc)?;
        sep_keys.insert(alloc, k, first_key)?;
        self.array.set_ref(alloc, 0, sep_keys.root())?;

        let before = self.rows_before(alloc, k)?;
        self.array.insert(alloc, 1 + 2 * k, child as i64)?;
        self.array
            .insert(alloc, 2 + 2 * k, super::tag_int((before + rows) as i64))?;

        // the remaining cumulative counts shift up by the new child's rows
        self.adjust_rows(alloc, k + 1, rows as i64)
    }

    /// Removes child slot `k` (which must already account for zero rows
    /// or have its rows re-homed by the caller).
    pub fn remove_child(&mut self, alloc: &mut SlabAlloc, k: usize) -> Result<()> {
        let rows = self.rows_through(alloc, k)? - self.rows_before(alloc, k)?;

        let mut sep_keys = self.sep_keys(alloc)?;
        sep_keys.erase(alloc, k)?;
        self.array.set_ref(alloc, 0, sep_keys.root())?;

        self.array.erase(alloc, 1 + 2 * k)?;
        self.array.erase(alloc, 1 + 2 * k)?;

        self.adjust_rows(alloc, k, -(rows as i64))
    }

    /// Destroys only this node and its separator array, leaving the
    /// children alone.
    pub fn destroy_shallow(self, alloc: &mut SlabAlloc) -> Result<()> {
        let sep_keys = self.sep_keys(alloc)?;
        sep_keys.destroy_deep(alloc)?;

        let header = self.array.header(alloc)?;
        alloc.free(self.array.root(), header.capacity);
        Ok(())
    }

    fn sep_keys(&self, alloc: &SlabAlloc) -> Result<Array> {
        Ok(Array::from_ref(self.array.get_ref(alloc, 0)?))
    }
}

/// Returns `true` if the node at `ref_` is a B+tree inner node.
pub fn is_inner(alloc: &SlabAlloc, ref_: Ref) -> Result<bool> {
    let header = crate::node::NodeHeader::decode(alloc.translate(ref_)?)?;
    Ok(header.is_inner_bptree())
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

    fn leaf(alloc: &mut SlabAlloc) -> Ref {
        #[expect(clippy::expect_used)]
        Array::create(alloc, NodeFlags::default(), 0, 0)
            .expect("leaf")
            .root()
    }

    #[test]
    fn offsets_are_prefix_sums() -> crate::Result<()> {
        let mut alloc = alloc();

        let children = [
            (10, leaf(&mut alloc), 4),
            (50, leaf(&mut alloc), 2),
            (90, leaf(&mut alloc), 5),
        ];
        let node = InnerNode::create(&mut alloc, &children)?;

        assert_eq!(3, node.child_count(&alloc)?);
        assert_eq!(11, node.total_rows(&alloc)?);
        assert_eq!(4, node.rows_through(&alloc, 0)?);
        assert_eq!(6, node.rows_through(&alloc, 1)?);
        assert_eq!(0, node.rows_before(&alloc, 0)?);
        assert_eq!(6, node.rows_before(&alloc, 2)?);

        Ok(())
    }

    #[test]
    fn lookups() -> crate::Result<()> {
        let mut alloc = alloc();

        let children = [
            (10, leaf(&mut alloc), 4),
            (50, leaf(&mut alloc), 2),
            (90, leaf(&mut alloc), 5),
        ];
        let node = InnerNode::create(&mut alloc, &children)?;

        // by key: keys below the first separator land in child 0
        assert_eq!(0, node.find_child_by_key(&alloc, 3)?);
        assert_eq!(0, node.find_child_by_key(&alloc, 49)?);
        assert_eq!(1, node.find_child_by_key(&alloc, 50)?);
        assert_eq!(2, node.find_child_by_key(&alloc, 1000)?);

        // by position
        assert_eq!((0, 0), node.find_child_by_pos(&alloc, 0)?);
        assert_eq!((0, 3), node.find_child_by_pos(&alloc, 3)?);
        assert_eq!((1, 0), node.find_child_by_pos(&alloc, 4)?);
        assert_eq!((2, 4), node.find_child_by_pos(&alloc, 10)?);
        assert!(node.find_child_by_pos(&alloc, 11).is_err());

        Ok(())
    }

    #[test]
    fn insert_and_remove_children() -> crate::Result<()> {
        let mut alloc = alloc();

        let children = [(10, leaf(&mut alloc), 4), (90, leaf(&mut alloc), 5)];
        let mut node = InnerNode::create(&mut alloc, &children)?;

        let mid = leaf(&mut alloc);
        node.insert_child(&mut alloc, 1, 50, mid, 3)?;

        assert_eq!(3, node.child_count(&alloc)?);
        assert_eq!(12, node.total_rows(&alloc)?);
        assert_eq!(50, node.sep_key(&alloc, 1)?);
        assert_eq!(mid, node.child_ref(&alloc, 1)?);
        assert_eq!((1, 2), node.find_child_by_pos(&alloc, 6)?);

        node.remove_child(&mut alloc, 1)?;
        assert_eq!(2, node.child_count(&alloc)?);
        assert_eq!(9, node.total_rows(&alloc)?);
        assert_eq!((1, 0), node.find_child_by_pos(&alloc, 4)?);

        Ok(())
    }
}
