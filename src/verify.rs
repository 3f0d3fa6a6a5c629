// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Snapshot consistency check: walks the reachable-ref closure and
//! validates it against the free-space ledger.

use crate::alloc::{Ref, SlabAlloc};
use crate::array::{is_tagged, Array};
use crate::file_header::HEADER_SIZE;
use crate::group::Group;
use crate::node::NodeHeader;
use crate::{Error, Result};

/// Checks one committed snapshot:
///
/// * every reachable node has a sane header, is 8-byte aligned and lies
///   inside the snapshot's logical file size
/// * reachable nodes do not overlap each other or the free ledger
/// * reachable nodes plus free ranges cover the payload region exactly
///   (no leaks, no double accounting)
pub(crate) fn verify_snapshot(alloc: &SlabAlloc, group: &Group) -> Result<()> {
    if group.is_empty_placeholder() {
        return Ok(());
    }

    let file_size = group.file_size(alloc)?;

    let mut intervals: Vec<(u64, u64)> = Vec::new();
    walk(alloc, group.top_ref()?, file_size, &mut intervals)?;

    for range in group.load_free_space(alloc)? {
        if range.position + range.size > file_size {
            return Err(Error::corrupt("free range beyond logical file size"));
        }
        intervals.push((range.position, range.size));
    }

    intervals.sort_unstable();

    let mut cursor = HEADER_SIZE as u64;
    for (position, size) in intervals {
        if position < cursor {
            return Err(Error::corrupt(format!(
                "overlapping accounting at offset {position}"
            )));
        }
        if position > cursor {
            return Err(Error::corrupt(format!(
                "leaked bytes in [{cursor}, {position})"
            )));
        }
        cursor = position + size;
    }

    if cursor != file_size {
        return Err(Error::corrupt(format!(
            "accounting ends at {cursor}, logical file size is {file_size}"
        )));
    }

    Ok(())
}

fn walk(
    alloc: &SlabAlloc,
    ref_: Ref,
    file_size: u64,
    intervals: &mut Vec<(u64, u64)>,
) -> Result<()> {
    if ref_ % 8 != 0 {
        return Err(Error::corrupt(format!("misaligned ref {ref_}")));
    }
    if ref_ >= file_size {
        return Err(Error::corrupt(format!(
            "ref {ref_} beyond logical file size {file_size}"
        )));
    }

    let header = NodeHeader::decode(alloc.translate(ref_)?)?;
    if ref_ + header.capacity as u64 > file_size {
        return Err(Error::corrupt(format!("node at {ref_} overruns the file")));
    }

    intervals.push((ref_, header.capacity as u64));

    if header.has_refs() {
        let arr = Array::from_ref(ref_);
        for i in 0..header.count {
            let v = arr.get(alloc, i)?;
            if v != 0 && !is_tagged(v) {
                walk(alloc, v as Ref, file_size, intervals)?;
            }
        }
    }

    Ok(())
}
