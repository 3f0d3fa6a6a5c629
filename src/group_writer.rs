// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Commit serialization: relocates the transaction's slab nodes into
//! file free space (bottom-up, rewriting child refs), rebuilds the
//! free-space arrays and the top node, and flips the selector.
//!
//! Data nodes reuse eligible free ranges first-fit; the metadata nodes
//! (free arrays + top) are appended past the end of file so their
//! placement cannot invalidate the ledger they serialize. Old metadata
//! is freed into the next version's ledger, so the file stays
//! append-mostly rather than append-only.

use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::array::{is_tagged, tag_int, Array};
use crate::file_header::{FileHeader, HEADER_SIZE};
use crate::group::{
    Group, GROUP_SLOTS, SLOT_FREE_POSITIONS, SLOT_FREE_SIZES, SLOT_FREE_VERSIONS, SLOT_HISTORY,
    SLOT_INTERNER, SLOT_NAMES, SLOT_REFS, SLOT_TABLE_TAGS,
};
use crate::node::bitpack::set_direct;
use crate::node::header::{code_for_bits, packed_byte_len};
use crate::node::{encoded, Encoding, NodeFlags, NodeHeader, NODE_HEADER_SIZE};
use crate::{Error, Result};

/// Whether the durability barriers run
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Durability {
    /// fsync at both barriers
    Full,

    /// No barriers (bulk loads; a crash while unsynced commits are in
    /// flight may require discarding the file)
    Unsafe,
}

/// Outcome of a successful commit
#[derive(Copy, Clone, Debug)]
pub struct CommitResult {
    /// New live top ref
    pub top_ref: Ref,

    /// New logical file size
    pub file_size: u64,

    /// The committed version
    pub version: u64,
}

/// Integer leaves below this many elements are not worth compressing
const COMPRESS_MIN_COUNT: usize = 16;

pub(crate) struct GroupWriter<'a> {
    alloc: &'a mut SlabAlloc,
    oldest_live_version: u64,
}

impl<'a> GroupWriter<'a> {
    pub(crate) fn new(alloc: &'a mut SlabAlloc, oldest_live_version: u64) -> Self {
        Self {
            alloc,
            oldest_live_version,
        }
    }

    /// Runs the §4.10 pipeline for one write transaction.
    pub(crate) fn commit(
        mut self,
        group: &Group,
        header: FileHeader,
        new_version: u64,
        durability: Durability,
    ) -> Result<CommitResult> {
        // old persistent metadata becomes free space of the new version
        let old_meta = [
            group.top_ref()?,
            Array::from_ref(group.top_ref()?).get_ref(self.alloc, SLOT_FREE_POSITIONS)?,
            Array::from_ref(group.top_ref()?).get_ref(self.alloc, SLOT_FREE_SIZES)?,
            Array::from_ref(group.top_ref()?).get_ref(self.alloc, SLOT_FREE_VERSIONS)?,
        ];
        for ref_ in old_meta {
            if ref_ != NULL_REF && self.alloc.is_read_only(ref_) {
                let capacity = NodeHeader::decode(self.alloc.translate(ref_)?)?.capacity;
                self.alloc.free(ref_, capacity);
            }
        }

        // relocate all content subtrees into the file
        let top = Array::from_ref(group.top_ref()?);
        let names_ref = self.write_node(top.get_ref(self.alloc, SLOT_NAMES)?)?;
        let refs_ref = self.write_node(top.get_ref(self.alloc, SLOT_REFS)?)?;
        let history_ref = {
            let r = top.get_ref(self.alloc, SLOT_HISTORY)?;
            if r == NULL_REF {
                NULL_REF
            } else {
                self.write_node(r)?
            }
        };
        let interner_ref = self.write_node(top.get_ref(self.alloc, SLOT_INTERNER)?)?;
        let tags_ref = self.write_node(top.get_ref(self.alloc, SLOT_TABLE_TAGS)?)?;

        // fold this transaction's frees into the ledger
        self.alloc.merge_pending_free(self.oldest_live_version);

        // metadata goes past the current end of file
        let free_space = self.alloc.free_space().to_vec();
        let n = free_space.len();
        let free_array_size = (NODE_HEADER_SIZE + 8 * n + 7) & !7;
        let top_size = NODE_HEADER_SIZE + 8 * GROUP_SLOTS;

        let map_len = self.alloc.file_map()?.len();
        let positions_at = map_len;
        let sizes_at = positions_at + free_array_size as u64;
        let versions_at = sizes_at + free_array_size as u64;
        let top_at = versions_at + free_array_size as u64;
        let file_size = top_at + top_size as u64;

        self.alloc.file_map_mut()?.remap(file_size)?;

        self.write_plain_i64_node(
            positions_at,
            free_array_size,
            NodeFlags::default(),
            &free_space.iter().map(|r| r.position as i64).collect::<Vec<_>>(),
        )?;
        self.write_plain_i64_node(
            sizes_at,
            free_array_size,
            NodeFlags::default(),
            &free_space.iter().map(|r| r.size as i64).collect::<Vec<_>>(),
        )?;
        self.write_plain_i64_node(
            versions_at,
            free_array_size,
            NodeFlags::default(),
            &free_space.iter().map(|r| r.version as i64).collect::<Vec<_>>(),
        )?;

        self.write_plain_i64_node(
            top_at,
            top_size,
            NodeFlags::HAS_REFS,
            &[
                names_ref as i64,
                refs_ref as i64,
                positions_at as i64,
                sizes_at as i64,
                versions_at as i64,
                history_ref as i64,
                tag_int(file_size as i64),
                tag_int(new_version as i64),
                interner_ref as i64,
                tags_ref as i64,
            ],
        )?;

        // new top ref into the inactive slot, then the barriers
        let new_selector = 1 - header.selector;
        let mut new_header = header;
        new_header.selector = new_selector;
        if new_selector == 0 {
            new_header.top_ref_a = top_at;
        } else {
            new_header.top_ref_b = top_at;
        }

        let slot_offset = if new_selector == 0 { 0 } else { 8 };
        let map = self.alloc.file_map_mut()?;
        map.write_at(slot_offset, &top_at.to_le_bytes())?;

        if durability == Durability::Full {
            map.sync()?;
        }

        map.write_selector(new_selector)?;

        if durability == Durability::Full {
            map.sync()?;
        }

        log::debug!(
            "committed version {new_version}: top ref {top_at}, file size {file_size}"
        );

        Ok(CommitResult {
            top_ref: top_at,
            file_size,
            version: new_version,
        })
    }

    /// Relocates the slab subtree rooted at `ref_` into file space and
    /// returns its new ref. File-resident nodes are already durable and
    /// pass through unchanged.
    fn write_node(&mut self, ref_: Ref) -> Result<Ref> {
        if ref_ == NULL_REF || self.alloc.is_read_only(ref_) {
            return Ok(ref_);
        }

        let header = NodeHeader::decode(self.alloc.translate(ref_)?)?;

        if header.has_refs() {
            let mut arr = Array::from_ref(ref_);
            for i in 0..header.count {
                let v = arr.get(self.alloc, i)?;
                if v != 0 && !is_tagged(v) {
                    let child = self.write_node(v as Ref)?;
                    if child != v as Ref {
                        arr.set_ref(self.alloc, i, child)?;
                    }
                }
            }
            return self.serialize_leaf(arr.root());
        }

        self.serialize_leaf(ref_)
    }

    /// Writes one slab node into file space (tightly packed, optionally
    /// compressed) and frees the slab copy.
    fn serialize_leaf(&mut self, ref_: Ref) -> Result<Ref> {
        let header = NodeHeader::decode(self.alloc.translate(ref_)?)?;

        let payload_len = match header.encoding {
            Encoding::WidthBits => packed_byte_len(header.count, header.width_bits()),
            Encoding::WidthMultiply => header.count * header.width_bytes(),
            Encoding::WidthIgnore => 0,
            Encoding::Packed | Encoding::Flex | Encoding::Delta => {
                // compressed nodes are produced here, never mutated, so a
                // slab node cannot carry one
                return Err(Error::corrupt("compressed node in slab space"));
            }
        };

        let mut out_header = header;
        let mut payload: Vec<u8>;

        // commit-time integer compression
        let compressible = header.encoding == Encoding::WidthBits
            && !header.has_refs()
            && header.count >= COMPRESS_MIN_COUNT;

        let compressed = if compressible {
            let values = Array::from_ref(ref_).to_vec(self.alloc)?;
            encoded::try_compress(&values, payload_len)
        } else {
            None
        };

        if let Some(c) = compressed {
            log::trace!(
                "compressed node {ref_}: {payload_len} -> {} bytes ({:?})",
                c.payload.len(),
                c.encoding,
            );
            out_header.encoding = c.encoding;
            out_header.width_code = c.width_code;
            payload = c.payload;
        } else {
            payload = self
                .alloc
                .translate(ref_)?
                .get(NODE_HEADER_SIZE..NODE_HEADER_SIZE + payload_len)
                .ok_or_else(|| Error::corrupt("node payload out of mapping"))?
                .to_vec();
        }

        let capacity = (NODE_HEADER_SIZE + payload.len() + 7) & !7;
        out_header.capacity = capacity;
        payload.resize(capacity - NODE_HEADER_SIZE, 0);

        let position = self.allocate_file_space(capacity as u64)?;

        let map = self.alloc.file_map_mut()?;
        map.write_at(position, &out_header.encode())?;
        map.write_at(position + NODE_HEADER_SIZE as u64, &payload)?;

        self.alloc.free(ref_, header.capacity);
        Ok(position)
    }

    fn allocate_file_space(&mut self, size: u64) -> Result<u64> {
        if let Some(position) = self.alloc.take_file_space(size, self.oldest_live_version) {
            return Ok(position);
        }
        self.alloc.extend_file(size)
    }

    /// Serializes a width-64 integer node at a fixed position (used for
    /// the metadata nodes whose sizes must be known up front).
    fn write_plain_i64_node(
        &mut self,
        position: u64,
        capacity: usize,
        flags: NodeFlags,
        values: &[i64],
    ) -> Result<()> {
        debug_assert!(NODE_HEADER_SIZE + values.len() * 8 <= capacity);

        let header = NodeHeader {
            count: values.len(),
            capacity,
            flags,
            encoding: Encoding::WidthBits,
            width_code: code_for_bits(64),
        };

        let mut bytes = vec![0u8; capacity];
        bytes[..NODE_HEADER_SIZE].copy_from_slice(&header.encode());
        for (i, &v) in values.iter().enumerate() {
            set_direct(&mut bytes[NODE_HEADER_SIZE..], 64, i, v);
        }

        self.alloc.file_map_mut()?.write_at(position, &bytes)
    }
}

/// Reads the file header through a writer allocator.
pub(crate) fn read_header(alloc: &SlabAlloc) -> Result<FileHeader> {
    FileHeader::decode(alloc.file_map()?.slice(0, HEADER_SIZE)?)
}
