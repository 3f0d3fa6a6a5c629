// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod bptree;

use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::node::bitpack::{get_direct, set_direct};
use crate::node::find::FindOp;
use crate::node::header::{
    bits_for_value, code_for_bits, packed_byte_len, MAX_ELEMENT_COUNT, MAX_NODE_CAPACITY,
};
use crate::node::{encoded, find, Encoding, NodeFlags, NodeHeader, NODE_HEADER_SIZE};
use crate::{Error, Result};

/// Tags an integer for storage in a `has_refs` array (odd values are
/// payload, even values are child refs).
#[must_use]
pub fn tag_int(v: i64) -> i64 {
    (v << 1) | 1
}

/// Reverses [`tag_int`].
#[must_use]
pub fn untag_int(t: i64) -> i64 {
    t >> 1
}

/// Returns `true` if a `has_refs` element is a tagged integer.
#[must_use]
pub fn is_tagged(v: i64) -> bool {
    v & 1 == 1
}

fn capacity_for(count: usize, width_bits: usize) -> usize {
    let payload = packed_byte_len(count, width_bits);
    // slack so a few inserts do not immediately reallocate
    let slack = (payload / 2).min(4096);
    ((NODE_HEADER_SIZE + payload + slack + 7) & !7)
        .max(2 * NODE_HEADER_SIZE)
        .min(MAX_NODE_CAPACITY)
}

fn capacity_for_bytes(byte_len: usize) -> usize {
    let slack = (byte_len / 2).min(4096);
    ((NODE_HEADER_SIZE + byte_len + slack + 7) & !7)
        .max(2 * NODE_HEADER_SIZE)
        .min(MAX_NODE_CAPACITY)
}

/// Accessor for a persistent node: a copy-on-write vector of integers,
/// refs or fixed-size byte slots
///
/// The accessor holds only the node's ref; every operation translates
/// through the allocator. Mutations may relocate the node (CoW, widening,
/// capacity growth) and update `root` — the owner is responsible for
/// re-referencing the new root in the parent slot.
#[derive(Copy, Clone, Debug)]
pub struct Array {
    root: Ref,
}

impl Array {
    /// Wraps an existing node.
    #[must_use]
    pub fn from_ref(root: Ref) -> Self {
        Self { root }
    }

    /// The node's current ref.
    #[must_use]
    pub fn root(&self) -> Ref {
        self.root
    }

    /// Creates a bit-packed integer node filled with `init_value`.
    pub fn create(
        alloc: &mut SlabAlloc,
        flags: NodeFlags,
        init_size: usize,
        init_value: i64,
    ) -> Result<Self> {
        let width = bits_for_value(init_value);
        let capacity = capacity_for(init_size, width);
        let root = alloc.alloc(capacity)?;

        let header = NodeHeader {
            count: init_size,
            capacity,
            flags,
            encoding: Encoding::WidthBits,
            width_code: code_for_bits(width),
        };
        write_header(alloc, root, &header)?;

        if init_value != 0 {
            let payload = payload_mut(alloc, root, capacity)?;
            for i in 0..init_size {
                set_direct(payload, width, i, init_value);
            }
        }

        Ok(Self { root })
    }

    /// Creates a byte-packed node of `init_size` zeroed fixed-width
    /// elements.
    pub fn create_bytes(
        alloc: &mut SlabAlloc,
        elem_bytes: usize,
        init_size: usize,
    ) -> Result<Self> {
        if elem_bytes == 0 || elem_bytes > u8::MAX as usize {
            return Err(Error::logic(format!("bad element size {elem_bytes}")));
        }

        let capacity = capacity_for_bytes(elem_bytes * init_size);
        let root = alloc.alloc(capacity)?;

        write_header(
            alloc,
            root,
            &NodeHeader {
                count: init_size,
                capacity,
                flags: NodeFlags::default(),
                encoding: Encoding::WidthMultiply,
                width_code: elem_bytes as u8,
            },
        )?;

        Ok(Self { root })
    }

    /// Creates a blob node (byte elements) holding `bytes`.
    pub fn create_blob(alloc: &mut SlabAlloc, bytes: &[u8]) -> Result<Self> {
        let arr = Self::create_bytes(alloc, 1, bytes.len())?;
        if !bytes.is_empty() {
            let capacity = arr.header(alloc)?.capacity;
            payload_mut(alloc, arr.root, capacity)?[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(arr)
    }

    /// Decodes the node header.
    pub fn header(&self, alloc: &SlabAlloc) -> Result<NodeHeader> {
        NodeHeader::decode(alloc.translate(self.root)?)
    }

    /// Number of elements.
    pub fn len(&self, alloc: &SlabAlloc) -> Result<usize> {
        Ok(self.header(alloc)?.count)
    }

    /// Returns `true` if the node has no elements.
    pub fn is_empty(&self, alloc: &SlabAlloc) -> Result<bool> {
        Ok(self.len(alloc)? == 0)
    }

    /// Reads the `idx`-th integer, sign extended to 64 bits.
    pub fn get(&self, alloc: &SlabAlloc, idx: usize) -> Result<i64> {
        let header = self.header(alloc)?;
        if idx >= header.count {
            return Err(Error::logic(format!(
                "index {idx} out of bounds ({} elements)",
                header.count,
            )));
        }

        match header.encoding {
            Encoding::WidthBits => {
                let payload = payload_ref(alloc, self.root, &header)?;
                Ok(get_direct(payload, header.width_bits(), idx))
            }
            Encoding::WidthIgnore => Ok(0),
            Encoding::Packed | Encoding::Flex | Encoding::Delta => {
                let payload = payload_ref(alloc, self.root, &header)?;
                encoded::get(header.encoding, header.width_code, payload, idx)
            }
            Encoding::WidthMultiply => Err(Error::logic("byte node read as integer")),
        }
    }

    /// Reads all integers.
    pub fn to_vec(&self, alloc: &SlabAlloc) -> Result<Vec<i64>> {
        let header = self.header(alloc)?;
        match header.encoding {
            Encoding::WidthBits => {
                let payload = payload_ref(alloc, self.root, &header)?;
                let width = header.width_bits();
                Ok((0..header.count)
                    .map(|i| get_direct(payload, width, i))
                    .collect())
            }
            Encoding::WidthIgnore => Ok(vec![0; header.count]),
            Encoding::Packed | Encoding::Flex | Encoding::Delta => {
                let payload = payload_ref(alloc, self.root, &header)?;
                encoded::decode_all(header.encoding, header.width_code, payload, header.count)
            }
            Encoding::WidthMultiply => Err(Error::logic("byte node read as integer")),
        }
    }

    /// Writes the `idx`-th integer, widening the node if needed.
    pub fn set(&mut self, alloc: &mut SlabAlloc, idx: usize, value: i64) -> Result<()> {
        self.make_plain_writable(alloc, Some(value))?;

        let header = self.header(alloc)?;
        if idx >= header.count {
            return Err(Error::logic(format!(
                "index {idx} out of bounds ({} elements)",
                header.count,
            )));
        }

        let width = header.width_bits();
        let payload = payload_mut(alloc, self.root, header.capacity)?;
        set_direct(payload, width, idx, value);
        Ok(())
    }

    /// Inserts `value` before position `idx`.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, idx: usize, value: i64) -> Result<()> {
        self.make_plain_writable(alloc, Some(value))?;

        let header = self.header(alloc)?;
        if idx > header.count {
            return Err(Error::logic(format!(
                "insert at {idx} out of bounds ({} elements)",
                header.count,
            )));
        }

        if header.count >= MAX_ELEMENT_COUNT {
            return Err(Error::logic("node element count exhausted"));
        }

        let width = header.width_bits();
        let needed = packed_byte_len(header.count + 1, width);

        if needed > header.capacity - NODE_HEADER_SIZE {
            self.grow(alloc, header.count + 1)?;
        }

        let mut header = self.header(alloc)?;
        let payload = payload_mut(alloc, self.root, header.capacity)?;

        for i in (idx..header.count).rev() {
            let v = get_direct(payload, width, i);
            set_direct(payload, width, i + 1, v);
        }
        set_direct(payload, width, idx, value);

        header.count += 1;
        write_header(alloc, self.root, &header)?;
        Ok(())
    }

    /// Appends `value`.
    pub fn push(&mut self, alloc: &mut SlabAlloc, value: i64) -> Result<()> {
        let len = self.len(alloc)?;
        self.insert(alloc, len, value)
    }

    /// Removes the element at `idx`.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        self.make_plain_writable(alloc, None)?;

        let mut header = self.header(alloc)?;
        if idx >= header.count {
            return Err(Error::logic(format!(
                "erase at {idx} out of bounds ({} elements)",
                header.count,
            )));
        }

        let width = header.width_bits();
        let payload = payload_mut(alloc, self.root, header.capacity)?;

        for i in idx..header.count - 1 {
            let v = get_direct(payload, width, i + 1);
            set_direct(payload, width, i, v);
        }

        header.count -= 1;
        write_header(alloc, self.root, &header)?;
        Ok(())
    }

    /// Shrinks to the first `len` elements. Child nodes of dropped ref
    /// slots are not destroyed; owners do that explicitly.
    pub fn truncate(&mut self, alloc: &mut SlabAlloc, len: usize) -> Result<()> {
        self.make_plain_writable(alloc, None)?;

        let mut header = self.header(alloc)?;
        if len > header.count {
            return Err(Error::logic("truncate beyond length"));
        }

        header.count = len;
        write_header(alloc, self.root, &header)?;
        Ok(())
    }

    /// Removes all elements.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.truncate(alloc, 0)
    }

    /// Reads a child ref slot.
    pub fn get_ref(&self, alloc: &SlabAlloc, idx: usize) -> Result<Ref> {
        let v = self.get(alloc, idx)?;
        if is_tagged(v) {
            return Err(Error::corrupt(format!("ref slot {idx} holds a tagged int")));
        }
        Ok(v as Ref)
    }

    /// Writes a child ref slot.
    pub fn set_ref(&mut self, alloc: &mut SlabAlloc, idx: usize, ref_: Ref) -> Result<()> {
        self.set(alloc, idx, ref_ as i64)
    }

    /// Reads a tagged integer slot of a `has_refs` array.
    pub fn get_tagged(&self, alloc: &SlabAlloc, idx: usize) -> Result<i64> {
        let v = self.get(alloc, idx)?;
        if !is_tagged(v) {
            return Err(Error::corrupt(format!("slot {idx} holds a ref, not an int")));
        }
        Ok(untag_int(v))
    }

    /// Writes a tagged integer slot of a `has_refs` array.
    pub fn set_tagged(&mut self, alloc: &mut SlabAlloc, idx: usize, value: i64) -> Result<()> {
        self.set(alloc, idx, tag_int(value))
    }

    /// Smallest position in `[start, end)` matching `op target`.
    pub fn find_first(
        &self,
        alloc: &SlabAlloc,
        op: FindOp,
        target: i64,
        start: usize,
        end: usize,
    ) -> Result<Option<usize>> {
        let header = self.header(alloc)?;
        let end = end.min(header.count);
        if start >= end {
            return Ok(None);
        }

        match header.encoding {
            Encoding::WidthBits | Encoding::WidthIgnore => {
                let payload = payload_ref(alloc, self.root, &header)?;
                let width = if header.encoding == Encoding::WidthIgnore {
                    0
                } else {
                    header.width_bits()
                };
                Ok(find::find_first(payload, width, op, target, start, end))
            }
            Encoding::Packed | Encoding::Flex | Encoding::Delta => {
                let payload = payload_ref(alloc, self.root, &header)?;
                for i in start..end {
                    let v = encoded::get(header.encoding, header.width_code, payload, i)?;
                    if op.matches(v, target) {
                        return Ok(Some(i));
                    }
                }
                Ok(None)
            }
            Encoding::WidthMultiply => Err(Error::logic("byte node scanned as integer")),
        }
    }

    /// Sum over `[start, end)`.
    pub fn sum(&self, alloc: &SlabAlloc, start: usize, end: usize) -> Result<i64> {
        self.fold_plain(alloc, start, end, |payload, width, s, e| {
            find::sum(payload, width, s, e)
        })
    }

    /// Minimum over `[start, end)`.
    pub fn min(&self, alloc: &SlabAlloc, start: usize, end: usize) -> Result<Option<i64>> {
        self.fold_plain(alloc, start, end, |payload, width, s, e| {
            find::min(payload, width, s, e)
        })
    }

    /// Maximum over `[start, end)`.
    pub fn max(&self, alloc: &SlabAlloc, start: usize, end: usize) -> Result<Option<i64>> {
        self.fold_plain(alloc, start, end, |payload, width, s, e| {
            find::max(payload, width, s, e)
        })
    }

    /// Count of elements matching `op target` in `[start, end)`.
    pub fn count_matching(
        &self,
        alloc: &SlabAlloc,
        op: FindOp,
        target: i64,
        start: usize,
        end: usize,
    ) -> Result<usize> {
        self.fold_plain(alloc, start, end, |payload, width, s, e| {
            find::count(payload, width, op, target, s, e)
        })
    }

    fn fold_plain<T>(
        &self,
        alloc: &SlabAlloc,
        start: usize,
        end: usize,
        f: impl Fn(&[u8], usize, usize, usize) -> T,
    ) -> Result<T> {
        let header = self.header(alloc)?;
        let end = end.min(header.count);
        let start = start.min(end);

        match header.encoding {
            Encoding::WidthBits => {
                let payload = payload_ref(alloc, self.root, &header)?;
                Ok(f(payload, header.width_bits(), start, end))
            }
            Encoding::WidthIgnore => Ok(f(&[], 0, start, end)),
            Encoding::Packed | Encoding::Flex | Encoding::Delta => {
                // decode then aggregate on a scratch buffer
                let values = self.to_vec(alloc)?;
                let mut scratch = vec![0u8; values.len() * 8];
                for (i, &v) in values.iter().enumerate() {
                    set_direct(&mut scratch, 64, i, v);
                }
                Ok(f(&scratch, 64, start, end))
            }
            Encoding::WidthMultiply => Err(Error::logic("byte node aggregated as integer")),
        }
    }

    /// Borrows the `idx`-th fixed-width byte slot.
    pub fn get_bytes<'a>(&self, alloc: &'a SlabAlloc, idx: usize) -> Result<&'a [u8]> {
        let header = self.byte_header(alloc, idx)?;
        let elem = header.width_bytes();
        let payload = payload_ref(alloc, self.root, &header)?;
        payload
            .get(idx * elem..(idx + 1) * elem)
            .ok_or_else(|| Error::corrupt("byte slot out of payload"))
    }

    /// Overwrites the `idx`-th fixed-width byte slot.
    pub fn set_bytes(&mut self, alloc: &mut SlabAlloc, idx: usize, bytes: &[u8]) -> Result<()> {
        self.ensure_writable(alloc)?;

        let header = self.byte_header(alloc, idx)?;
        let elem = header.width_bytes();
        if bytes.len() != elem {
            return Err(Error::logic(format!(
                "slot size mismatch: {} vs {elem}",
                bytes.len(),
            )));
        }

        let payload = payload_mut(alloc, self.root, header.capacity)?;
        payload[idx * elem..(idx + 1) * elem].copy_from_slice(bytes);
        Ok(())
    }

    /// Inserts a fixed-width byte slot before `idx`.
    pub fn insert_bytes(&mut self, alloc: &mut SlabAlloc, idx: usize, bytes: &[u8]) -> Result<()> {
        self.ensure_writable(alloc)?;

        let header = self.header(alloc)?;
        if header.encoding != Encoding::WidthMultiply {
            return Err(Error::logic("integer node written as bytes"));
        }

        let elem = header.width_bytes();
        if bytes.len() != elem {
            return Err(Error::logic("slot size mismatch"));
        }
        if idx > header.count {
            return Err(Error::logic("insert out of bounds"));
        }

        if (header.count + 1) * elem > header.capacity - NODE_HEADER_SIZE {
            self.grow_bytes(alloc, header.count + 1)?;
        }

        let mut header = self.header(alloc)?;
        let payload = payload_mut(alloc, self.root, header.capacity)?;
        payload.copy_within(idx * elem..header.count * elem, (idx + 1) * elem);
        payload[idx * elem..(idx + 1) * elem].copy_from_slice(bytes);

        header.count += 1;
        write_header(alloc, self.root, &header)?;
        Ok(())
    }

    /// Removes the `idx`-th fixed-width byte slot.
    pub fn erase_bytes(&mut self, alloc: &mut SlabAlloc, idx: usize) -> Result<()> {
        self.ensure_writable(alloc)?;

        let mut header = self.byte_header(alloc, idx)?;
        let elem = header.width_bytes();

        let payload = payload_mut(alloc, self.root, header.capacity)?;
        payload.copy_within((idx + 1) * elem..header.count * elem, idx * elem);

        header.count -= 1;
        write_header(alloc, self.root, &header)?;
        Ok(())
    }

    /// Borrows the whole payload of a blob node.
    pub fn blob_bytes<'a>(&self, alloc: &'a SlabAlloc) -> Result<&'a [u8]> {
        let header = self.header(alloc)?;
        if header.encoding != Encoding::WidthMultiply || header.width_bytes() != 1 {
            return Err(Error::logic("node is not a blob"));
        }
        let payload = payload_ref(alloc, self.root, &header)?;
        payload
            .get(..header.count)
            .ok_or_else(|| Error::corrupt("blob payload out of capacity"))
    }

    /// Appends bytes to a blob node, returning the offset the bytes
    /// landed at.
    pub fn blob_append(&mut self, alloc: &mut SlabAlloc, bytes: &[u8]) -> Result<usize> {
        self.ensure_writable(alloc)?;

        let header = self.header(alloc)?;
        let offset = header.count;

        if offset + bytes.len() > header.capacity - NODE_HEADER_SIZE {
            self.grow_bytes(alloc, offset + bytes.len())?;
        }

        let mut header = self.header(alloc)?;
        let payload = payload_mut(alloc, self.root, header.capacity)?;
        payload[offset..offset + bytes.len()].copy_from_slice(bytes);

        header.count = offset + bytes.len();
        write_header(alloc, self.root, &header)?;
        Ok(offset)
    }

    /// Recursively destroys this node and, for `has_refs` nodes, every
    /// descendant reachable through untagged ref slots.
    pub fn destroy_deep(self, alloc: &mut SlabAlloc) -> Result<()> {
        destroy_deep_ref(alloc, self.root)
    }

    /// Clones a file-region or compressed node into plain writable slab
    /// form (no-op when already plain and writable).
    pub fn ensure_writable(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        let header = self.header(alloc)?;
        match header.encoding {
            Encoding::Packed | Encoding::Flex | Encoding::Delta => {
                self.make_plain_writable(alloc, None)
            }
            _ => {
                if alloc.is_read_only(self.root) {
                    self.cow_clone(alloc)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn byte_header(&self, alloc: &SlabAlloc, idx: usize) -> Result<NodeHeader> {
        let header = self.header(alloc)?;
        if header.encoding != Encoding::WidthMultiply {
            return Err(Error::logic("integer node accessed as bytes"));
        }
        if idx >= header.count {
            return Err(Error::logic(format!(
                "index {idx} out of bounds ({} elements)",
                header.count,
            )));
        }
        Ok(header)
    }

    /// CoW + decompress + widen so that `value` (if given) fits.
    fn make_plain_writable(&mut self, alloc: &mut SlabAlloc, value: Option<i64>) -> Result<()> {
        let header = self.header(alloc)?;

        match header.encoding {
            Encoding::Packed | Encoding::Flex | Encoding::Delta | Encoding::WidthIgnore => {
                let values = self.to_vec(alloc)?;
                let width = values
                    .iter()
                    .copied()
                    .chain(value)
                    .map(bits_for_value)
                    .max()
                    .unwrap_or(0);

                let new = Self::rebuild(alloc, header.flags, &values, width)?;
                self.replace_with(alloc, new, header.capacity)?;
                Ok(())
            }
            Encoding::WidthMultiply => Err(Error::logic("byte node written as integer")),
            Encoding::WidthBits => {
                if alloc.is_read_only(self.root) {
                    self.cow_clone(alloc)?;
                }

                if let Some(v) = value {
                    let have = self.header(alloc)?.width_bits();
                    if bits_for_value(v) > have {
                        self.widen(alloc, bits_for_value(v))?;
                    }
                }

                Ok(())
            }
        }
    }

    fn cow_clone(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        let header = self.header(alloc)?;
        let bytes = alloc
            .translate(self.root)?
            .get(..header.capacity)
            .ok_or_else(|| Error::corrupt("node bytes out of mapping"))?
            .to_vec();

        let new_ref = alloc.alloc(header.capacity)?;
        alloc.translate_mut(new_ref)?[..header.capacity].copy_from_slice(&bytes);

        log::trace!("cow {} -> {new_ref}", self.root);
        alloc.free(self.root, header.capacity);
        self.root = new_ref;
        Ok(())
    }

    fn widen(&mut self, alloc: &mut SlabAlloc, new_width: usize) -> Result<()> {
        let header = self.header(alloc)?;
        let values = self.to_vec(alloc)?;
        let new = Self::rebuild(alloc, header.flags, &values, new_width)?;
        self.replace_with(alloc, new, header.capacity)
    }

    fn grow(&mut self, alloc: &mut SlabAlloc, want_count: usize) -> Result<()> {
        let header = self.header(alloc)?;
        let width = header.width_bits();
        let values = self.to_vec(alloc)?;

        let capacity = capacity_for(want_count + want_count / 2, width);
        if packed_byte_len(want_count, width) > capacity - NODE_HEADER_SIZE {
            return Err(Error::logic("node capacity exhausted"));
        }

        let new = Self::rebuild_with_capacity(alloc, header.flags, &values, width, capacity)?;
        self.replace_with(alloc, new, header.capacity)
    }

    fn grow_bytes(&mut self, alloc: &mut SlabAlloc, want_bytes_or_count: usize) -> Result<()> {
        let header = self.header(alloc)?;
        let elem = header.width_bytes();
        let want_payload = want_bytes_or_count * elem + want_bytes_or_count * elem / 2;

        let capacity = capacity_for_bytes(want_payload);
        if want_bytes_or_count * elem > capacity - NODE_HEADER_SIZE {
            return Err(Error::logic("node capacity exhausted"));
        }

        let new_ref = alloc.alloc(capacity)?;

        let old_payload_len = header.count * elem;
        let old_bytes = payload_ref(alloc, self.root, &header)?
            .get(..old_payload_len)
            .ok_or_else(|| Error::corrupt("payload out of capacity"))?
            .to_vec();

        let mut new_header = header;
        new_header.capacity = capacity;
        write_header(alloc, new_ref, &new_header)?;
        payload_mut(alloc, new_ref, capacity)?[..old_payload_len].copy_from_slice(&old_bytes);

        alloc.free(self.root, header.capacity);
        self.root = new_ref;
        Ok(())
    }

    fn rebuild(
        alloc: &mut SlabAlloc,
        flags: NodeFlags,
        values: &[i64],
        width: usize,
    ) -> Result<Ref> {
        let capacity = capacity_for(values.len() + values.len() / 2, width);
        Self::rebuild_with_capacity(alloc, flags, values, width, capacity)
    }

    fn rebuild_with_capacity(
        alloc: &mut SlabAlloc,
        flags: NodeFlags,
        values: &[i64],
        width: usize,
        capacity: usize,
    ) -> Result<Ref> {
        let root = alloc.alloc(capacity)?;

        write_header(
            alloc,
            root,
            &NodeHeader {
                count: values.len(),
                capacity,
                flags,
                encoding: Encoding::WidthBits,
                width_code: code_for_bits(width),
            },
        )?;

        let payload = payload_mut(alloc, root, capacity)?;
        for (i, &v) in values.iter().enumerate() {
            set_direct(payload, width, i, v);
        }

        Ok(root)
    }

    fn replace_with(&mut self, alloc: &mut SlabAlloc, new_ref: Ref, old_capacity: usize) -> Result<()> {
        alloc.free(self.root, old_capacity);
        self.root = new_ref;
        Ok(())
    }
}

/// Deep-copies the node at `ref_` (and, through ref slots, its whole
/// subtree) into fresh slab nodes; returns the copy's root.
pub fn clone_deep(alloc: &mut SlabAlloc, ref_: Ref) -> Result<Ref> {
    let header = NodeHeader::decode(alloc.translate(ref_)?)?;
    let bytes = alloc
        .translate(ref_)?
        .get(..header.capacity)
        .ok_or_else(|| Error::corrupt("node bytes out of mapping"))?
        .to_vec();

    let new_ref = alloc.alloc(header.capacity)?;
    alloc.translate_mut(new_ref)?[..header.capacity].copy_from_slice(&bytes);

    if header.has_refs() {
        let mut arr = Array::from_ref(new_ref);
        for i in 0..header.count {
            let v = arr.get(alloc, i)?;
            if v != 0 && !is_tagged(v) {
                let child = clone_deep(alloc, v as Ref)?;
                arr.set_ref(alloc, i, child)?;
            }
        }
    }

    Ok(new_ref)
}

/// See [`Array::destroy_deep`].
pub fn destroy_deep_ref(alloc: &mut SlabAlloc, ref_: Ref) -> Result<()> {
    if ref_ == NULL_REF {
        return Ok(());
    }

    let header = NodeHeader::decode(alloc.translate(ref_)?)?;

    if header.has_refs() {
        let arr = Array::from_ref(ref_);
        for i in 0..header.count {
            let v = arr.get(alloc, i)?;
            if v != 0 && !is_tagged(v) {
                destroy_deep_ref(alloc, v as Ref)?;
            }
        }
    }

    alloc.free(ref_, header.capacity);
    Ok(())
}

fn write_header(alloc: &mut SlabAlloc, ref_: Ref, header: &NodeHeader) -> Result<()> {
    let bytes = alloc.translate_mut(ref_)?;
    bytes
        .get_mut(..NODE_HEADER_SIZE)
        .ok_or_else(|| Error::corrupt("node bytes out of mapping"))?
        .copy_from_slice(&header.encode());
    Ok(())
}

fn payload_ref<'a>(alloc: &'a SlabAlloc, ref_: Ref, header: &NodeHeader) -> Result<&'a [u8]> {
    alloc
        .translate(ref_)?
        .get(NODE_HEADER_SIZE..header.capacity)
        .ok_or_else(|| Error::corrupt("node payload out of mapping"))
}

fn payload_mut<'a>(alloc: &'a mut SlabAlloc, ref_: Ref, capacity: usize) -> Result<&'a mut [u8]> {
    alloc
        .translate_mut(ref_)?
        .get_mut(NODE_HEADER_SIZE..capacity)
        .ok_or_else(|| Error::corrupt("node payload out of mapping"))
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
    fn create_get_set() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut arr = Array::create(&mut alloc, NodeFlags::default(), 4, 1)?;

        assert_eq!(4, arr.len(&alloc)?);
        assert_eq!(1, arr.get(&alloc, 3)?);

        arr.set(&mut alloc, 2, 0)?;
        assert_eq!(0, arr.get(&alloc, 2)?);

        // widening: 1-bit array takes a large value
        arr.set(&mut alloc, 0, 1_000_000)?;
        assert_eq!(1_000_000, arr.get(&alloc, 0)?);
        assert_eq!(1, arr.get(&alloc, 1)?);
        assert_eq!(0, arr.get(&alloc, 2)?);

        // and a negative one
        arr.set(&mut alloc, 1, -17)?;
        assert_eq!(-17, arr.get(&alloc, 1)?);

        Ok(())
    }

    #[test]
    fn insert_erase_shift() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut arr = Array::create(&mut alloc, NodeFlags::default(), 0, 0)?;

        for v in [10, 20, 30] {
            arr.push(&mut alloc, v)?;
        }
        arr.insert(&mut alloc, 1, 15)?;

        assert_eq!(vec![10, 15, 20, 30], arr.to_vec(&alloc)?);

        arr.erase(&mut alloc, 2)?;
        assert_eq!(vec![10, 15, 30], arr.to_vec(&alloc)?);

        arr.truncate(&mut alloc, 1)?;
        assert_eq!(vec![10], arr.to_vec(&alloc)?);

        Ok(())
    }

    #[test]
    fn many_inserts_grow_capacity() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut arr = Array::create(&mut alloc, NodeFlags::default(), 0, 0)?;

        for i in 0..10_000i64 {
            arr.push(&mut alloc, i * i)?;
        }

        assert_eq!(10_000, arr.len(&alloc)?);
        assert_eq!(9999 * 9999, arr.get(&alloc, 9999)?);
        assert_eq!(0, arr.get(&alloc, 0)?);

        Ok(())
    }

    #[test]
    fn tagged_ints_and_refs() -> crate::Result<()> {
        let mut alloc = alloc();

        let child = Array::create(&mut alloc, NodeFlags::default(), 2, 7)?;
        let mut parent = Array::create(&mut alloc, NodeFlags::HAS_REFS, 0, 0)?;

        parent.push(&mut alloc, child.root() as i64)?;
        parent.push(&mut alloc, tag_int(42))?;

        assert_eq!(child.root(), parent.get_ref(&alloc, 0)?);
        assert_eq!(42, parent.get_tagged(&alloc, 1)?);
        assert!(parent.get_ref(&alloc, 1).is_err());
        assert!(parent.get_tagged(&alloc, 0).is_err());

        parent.destroy_deep(&mut alloc)?;
        Ok(())
    }

    #[test]
    fn find_and_aggregates() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut arr = Array::create(&mut alloc, NodeFlags::default(), 0, 0)?;

        for v in [5, -3, 12, 5, 0] {
            arr.push(&mut alloc, v)?;
        }

        assert_eq!(Some(0), arr.find_first(&alloc, FindOp::Eq, 5, 0, 5)?);
        assert_eq!(Some(3), arr.find_first(&alloc, FindOp::Eq, 5, 1, 5)?);
        assert_eq!(Some(1), arr.find_first(&alloc, FindOp::Lt, 0, 0, 5)?);
        assert_eq!(None, arr.find_first(&alloc, FindOp::Gt, 100, 0, 5)?);

        assert_eq!(19, arr.sum(&alloc, 0, 5)?);
        assert_eq!(Some(-3), arr.min(&alloc, 0, 5)?);
        assert_eq!(Some(12), arr.max(&alloc, 0, 5)?);
        assert_eq!(2, arr.count_matching(&alloc, FindOp::Eq, 5, 0, 5)?);

        Ok(())
    }

    #[test]
    fn byte_slots() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut arr = Array::create_bytes(&mut alloc, 12, 2)?;

        arr.set_bytes(&mut alloc, 0, b"aaaaaaaaaaaa")?;
        arr.set_bytes(&mut alloc, 1, b"bbbbbbbbbbbb")?;
        arr.insert_bytes(&mut alloc, 1, b"cccccccccccc")?;

        assert_eq!(3, arr.len(&alloc)?);
        assert_eq!(b"aaaaaaaaaaaa", arr.get_bytes(&alloc, 0)?);
        assert_eq!(b"cccccccccccc", arr.get_bytes(&alloc, 1)?);
        assert_eq!(b"bbbbbbbbbbbb", arr.get_bytes(&alloc, 2)?);

        arr.erase_bytes(&mut alloc, 1)?;
        assert_eq!(2, arr.len(&alloc)?);
        assert_eq!(b"bbbbbbbbbbbb", arr.get_bytes(&alloc, 1)?);

        Ok(())
    }

    #[test]
    fn blobs() -> crate::Result<()> {
        let mut alloc = alloc();
        let mut blob = Array::create_blob(&mut alloc, b"hello")?;

        assert_eq!(b"hello", blob.blob_bytes(&alloc)?);

        let offset = blob.blob_append(&mut alloc, b", world")?;
        assert_eq!(5, offset);
        assert_eq!(b"hello, world", blob.blob_bytes(&alloc)?);

        Ok(())
    }

    #[test]
    fn compressed_nodes_decompress_on_write() -> crate::Result<()> {
        let mut alloc = alloc();

        let values: Vec<i64> = (0..100).map(|i| 1_000_000 + i).collect();
        let mut arr = Array::create(&mut alloc, NodeFlags::default(), 0, 0)?;
        for &v in &values {
            arr.push(&mut alloc, v)?;
        }

        // build a compressed clone the way the commit path does
        let header = arr.header(&alloc)?;
        #[expect(clippy::expect_used)]
        let compressed = encoded::try_compress(&values, header.capacity - NODE_HEADER_SIZE)
            .expect("clustered values must compress");

        let capacity = ((NODE_HEADER_SIZE + compressed.payload.len() + 7) & !7).max(16);
        let new_ref = alloc.alloc(capacity)?;
        write_header(
            &mut alloc,
            new_ref,
            &NodeHeader {
                count: values.len(),
                capacity,
                flags: NodeFlags::default(),
                encoding: compressed.encoding,
                width_code: compressed.width_code,
            },
        )?;
        payload_mut(&mut alloc, new_ref, capacity)?[..compressed.payload.len()]
            .copy_from_slice(&compressed.payload);

        let mut compressed_arr = Array::from_ref(new_ref);
        assert_eq!(values, compressed_arr.to_vec(&alloc)?);
        assert_eq!(
            Some(17),
            compressed_arr.find_first(&alloc, FindOp::Eq, 1_000_017, 0, 100)?
        );

        // mutation falls back to plain WidthBits
        compressed_arr.set(&mut alloc, 0, -5)?;
        assert_eq!(-5, compressed_arr.get(&alloc, 0)?);
        assert_eq!(1_000_001, compressed_arr.get(&alloc, 1)?);
        assert_eq!(
            Encoding::WidthBits,
            compressed_arr.header(&alloc)?.encoding
        );

        Ok(())
    }
}
