// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::mapper::{FileMap, ReadView};
use crate::{Error, Result};

/// Identifies a persistent node: a 64-bit, 8-byte-aligned offset into
/// the union of the file region and the in-memory slab region
pub type Ref = u64;

/// The reserved null ref
pub const NULL_REF: Ref = 0;

/// First slab allocated for a write transaction
const INITIAL_SLAB_SIZE: usize = 16 * 1024;

/// Slabs stop growing exponentially at this size
const MAX_SLAB_SIZE: usize = 16 * 1024 * 1024;

/// File growth granularity
const FILE_EXTEND_ALIGNMENT: u64 = 1024 * 1024;

/// A currently-free byte range of the file region
///
/// `version` is the snapshot version in which the range became free; it
/// must not be reused while any live reader is pinned before it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FreeRange {
    /// File offset
    pub position: u64,

    /// Length in bytes
    pub size: u64,

    /// Version at which the range was freed
    pub version: u64,
}

struct Slab {
    start: Ref,
    buf: Box<[u8]>,
    used: usize,
}

impl Slab {
    fn end(&self) -> Ref {
        self.start + self.buf.len() as u64
    }
}

enum Backing {
    /// Read transaction: immutable view pinned at `begin_read`
    Reader(ReadView),

    /// Write transaction: the process's read-write mapping
    Writer(FileMap),
}

/// Hands out refs whose address space is the mapped file prefix
/// (`[0, baseline)`) plus a union of in-memory slabs (`[baseline, ..)`)
///
/// Nodes in the file region are immutable; mutating one clones it into
/// slab space first (copy-on-write). Slab nodes exist only until commit
/// relocates them into file free space.
pub struct SlabAlloc {
    backing: Backing,
    baseline: u64,
    slabs: Vec<Slab>,
    slab_freelist: Vec<(Ref, usize)>,
    next_slab_size: usize,

    /// Persistent free-space ledger (write transactions only)
    free_space: Vec<FreeRange>,

    /// File ranges freed by this transaction, merged into the ledger at
    /// commit
    pending_free: Vec<FreeRange>,

    /// Version tag applied to file-region frees (the writer's version)
    free_version: u64,
}

impl SlabAlloc {
    /// Binds an allocator to a reader snapshot.
    ///
    /// `baseline` is the snapshot's logical file size; refs at or beyond
    /// it cannot occur in a committed tree.
    #[must_use]
    pub fn for_reader(view: ReadView, baseline: u64) -> Self {
        Self {
            backing: Backing::Reader(view),
            baseline,
            slabs: Vec::new(),
            slab_freelist: Vec::new(),
            next_slab_size: INITIAL_SLAB_SIZE,
            free_space: Vec::new(),
            pending_free: Vec::new(),
            free_version: 0,
        }
    }

    /// Binds an allocator to the writer mapping for a write transaction.
    #[must_use]
    pub fn for_writer(map: FileMap) -> Self {
        let baseline = map.len();
        Self {
            backing: Backing::Writer(map),
            baseline,
            slabs: Vec::new(),
            slab_freelist: Vec::new(),
            next_slab_size: INITIAL_SLAB_SIZE,
            free_space: Vec::new(),
            pending_free: Vec::new(),
            free_version: 0,
        }
    }

    /// Sets the version tag applied to subsequent file-region frees.
    pub fn set_free_version(&mut self, version: u64) {
        self.free_version = version;
    }

    /// Boundary between the file-backed and slab-backed regions.
    #[must_use]
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// Returns `true` if `ref_` lives in the immutable file region.
    #[must_use]
    pub fn is_read_only(&self, ref_: Ref) -> bool {
        ref_ < self.baseline
    }

    /// Installs the persistent free-space ledger (loaded from the group
    /// at the start of a write transaction).
    pub fn set_free_space(&mut self, ranges: Vec<FreeRange>) {
        self.free_space = ranges;
    }

    /// The persistent free-space ledger.
    #[must_use]
    pub fn free_space(&self) -> &[FreeRange] {
        &self.free_space
    }

    /// File ranges freed by the running transaction.
    #[must_use]
    pub fn pending_free(&self) -> &[FreeRange] {
        &self.pending_free
    }

    /// Allocates `size` bytes of fresh slab space.
    ///
    /// The returned ref is 8-byte aligned and the memory is zeroed.
    pub fn alloc(&mut self, size: usize) -> Result<Ref> {
        if size == 0 || size % 8 != 0 {
            return Err(Error::logic(format!("bad allocation size {size}")));
        }

        // first fit over returned slab space
        if let Some(i) = self
            .slab_freelist
            .iter()
            .position(|&(_, free_size)| free_size >= size)
        {
            let (ref_, free_size) = self.slab_freelist.swap_remove(i);
            if free_size > size {
                self.slab_freelist
                    .push((ref_ + size as u64, free_size - size));
            }
            self.zero(ref_, size)?;
            return Ok(ref_);
        }

        // bump the newest slab
        if let Some(slab) = self.slabs.last_mut() {
            if slab.buf.len() - slab.used >= size {
                let ref_ = slab.start + slab.used as u64;
                slab.used += size;
                return Ok(ref_);
            }
        }

        // grow the slab table
        let slab_size = self.next_slab_size.max(size.next_power_of_two());
        self.next_slab_size = (self.next_slab_size * 2).min(MAX_SLAB_SIZE);

        let start = self
            .slabs
            .last()
            .map_or_else(|| align_up(self.baseline, 8), Slab::end);

        log::trace!("new slab of {slab_size} bytes at ref {start}");

        self.slabs.push(Slab {
            start,
            buf: vec![0u8; slab_size].into_boxed_slice(),
            used: size,
        });

        Ok(start)
    }

    /// Releases a node.
    ///
    /// File-region refs are queued for the free-space ledger, tagged with
    /// the writer's version; slab refs are returned to the slab freelist.
    pub fn free(&mut self, ref_: Ref, size: usize) {
        if ref_ < self.baseline {
            self.pending_free.push(FreeRange {
                position: ref_,
                size: size as u64,
                version: self.free_version,
            });
        } else {
            self.slab_freelist.push((ref_, size));
        }
    }

    fn zero(&mut self, ref_: Ref, size: usize) -> Result<()> {
        let bytes = self.translate_mut(ref_)?;
        bytes
            .get_mut(..size)
            .ok_or_else(|| Error::corrupt("slab range missing"))?
            .fill(0);
        Ok(())
    }

    /// Translates a ref into the bytes from that address to the end of
    /// its region (file prefix or containing slab).
    pub fn translate(&self, ref_: Ref) -> Result<&[u8]> {
        if ref_ == NULL_REF {
            return Err(Error::corrupt("translate of null ref"));
        }

        if ref_ % 2 != 0 {
            return Err(Error::corrupt(format!("misaligned ref {ref_}")));
        }

        if ref_ < self.baseline {
            let len = (self.baseline - ref_) as usize;
            return match &self.backing {
                Backing::Reader(view) => view.slice(ref_, len),
                Backing::Writer(map) => map.slice(ref_, len),
            };
        }

        let slab = self.find_slab(ref_)?;
        let offset = (ref_ - slab.start) as usize;
        slab.buf
            .get(offset..)
            .ok_or_else(|| Error::corrupt("slab range missing"))
    }

    /// Mutable translation; only valid for slab refs.
    pub fn translate_mut(&mut self, ref_: Ref) -> Result<&mut [u8]> {
        if ref_ < self.baseline {
            return Err(Error::logic(format!(
                "attempt to mutate file-region ref {ref_}"
            )));
        }

        let i = self.find_slab_index(ref_)?;
        let slab = &mut self.slabs[i];
        let offset = (ref_ - slab.start) as usize;
        slab.buf
            .get_mut(offset..)
            .ok_or_else(|| Error::corrupt("slab range missing"))
    }

    fn find_slab_index(&self, ref_: Ref) -> Result<usize> {
        // slabs are sorted by start; binary search the containing one
        let i = self.slabs.partition_point(|s| s.end() <= ref_);
        if i < self.slabs.len() && self.slabs[i].start <= ref_ {
            Ok(i)
        } else {
            Err(Error::corrupt(format!("ref {ref_} is not in any slab")))
        }
    }

    fn find_slab(&self, ref_: Ref) -> Result<&Slab> {
        self.find_slab_index(ref_).map(|i| &self.slabs[i])
    }

    /// The writer's read-write mapping.
    pub fn file_map_mut(&mut self) -> Result<&mut FileMap> {
        match &mut self.backing {
            Backing::Writer(map) => Ok(map),
            Backing::Reader(_) => Err(Error::WrongTransactState),
        }
    }

    /// The writer's read-write mapping (shared).
    pub fn file_map(&self) -> Result<&FileMap> {
        match &self.backing {
            Backing::Writer(map) => Ok(map),
            Backing::Reader(_) => Err(Error::WrongTransactState),
        }
    }

    /// Takes `size` bytes of eligible (non-pinned) file free space,
    /// first fit; `None` if no eligible range is large enough.
    pub fn take_file_space(&mut self, size: u64, oldest_live_version: u64) -> Option<u64> {
        let i = self
            .free_space
            .iter()
            .position(|r| r.version <= oldest_live_version && r.size >= size)?;

        let range = &mut self.free_space[i];
        let position = range.position;

        if range.size == size {
            self.free_space.remove(i);
        } else {
            range.position += size;
            range.size -= size;
        }

        Some(position)
    }

    /// Grows the file so at least `size` contiguous bytes exist past the
    /// old end; returns the offset of the new space.
    ///
    /// Growth is `max(size, file_size / 8)`, aligned up to 1 MiB, so the
    /// number of remappings stays logarithmic in the final size.
    pub fn extend_file(&mut self, size: u64) -> Result<u64> {
        let map = match &mut self.backing {
            Backing::Writer(map) => map,
            Backing::Reader(_) => return Err(Error::WrongTransactState),
        };

        let old_len = map.len();
        let grow = align_up(size.max(old_len / 8), FILE_EXTEND_ALIGNMENT);
        map.remap(old_len + grow)?;

        // the surplus is ordinary free space, immediately reusable
        if grow > size {
            self.free_space.push(FreeRange {
                position: old_len + size,
                size: grow - size,
                version: 0,
            });
        }

        Ok(old_len)
    }

    /// Folds this transaction's pending frees into the persistent
    /// ledger: sort by position, merge adjacent ranges of equal version,
    /// then coalesce with neighbors whose versions are both at or below
    /// the oldest live reader.
    pub fn merge_pending_free(&mut self, oldest_live_version: u64) {
        if self.pending_free.is_empty() {
            return;
        }

        let mut merged = std::mem::take(&mut self.free_space);
        merged.append(&mut self.pending_free);
        merged.sort_unstable_by_key(|r| r.position);

        let mut out: Vec<FreeRange> = Vec::with_capacity(merged.len());
        for range in merged {
            if let Some(last) = out.last_mut() {
                debug_assert!(last.position + last.size <= range.position, "overlapping free ranges");

                let adjacent = last.position + last.size == range.position;
                let both_unpinned =
                    last.version <= oldest_live_version && range.version <= oldest_live_version;

                if adjacent && (last.version == range.version || both_unpinned) {
                    last.size += range.size;
                    last.version = last.version.max(range.version);
                    continue;
                }
            }
            out.push(range);
        }

        log::debug!("free-space ledger now holds {} ranges", out.len());
        self.free_space = out;
    }

    /// Discards all slabs and rebases onto the newly committed file
    /// prefix (called after a successful commit).
    pub fn rebase(&mut self, new_baseline: u64) {
        self.baseline = new_baseline;
        self.detach_slabs();
    }

    /// Releases all slab memory.
    pub fn detach_slabs(&mut self) {
        self.slabs.clear();
        self.slab_freelist.clear();
        self.pending_free.clear();
        self.next_slab_size = INITIAL_SLAB_SIZE;
    }
}

pub(crate) fn align_up(v: u64, alignment: u64) -> u64 {
    v.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::OpenMode;
    use test_log::test;

    fn writer_alloc() -> SlabAlloc {
        #[expect(clippy::expect_used)]
        let dir = tempfile::tempdir().expect("tempdir");
        #[expect(clippy::expect_used)]
        let (map, _) = FileMap::attach(&dir.path().join("a.tdb"), OpenMode::MemoryOnly, None)
            .expect("attach");
        SlabAlloc::for_writer(map)
    }

    #[test]
    fn alloc_refs_are_aligned_and_disjoint() -> crate::Result<()> {
        let mut alloc = writer_alloc();

        let a = alloc.alloc(64)?;
        let b = alloc.alloc(128)?;
        let c = alloc.alloc(8)?;

        assert!(a >= alloc.baseline());
        assert_eq!(0, a % 8);
        assert_eq!(0, b % 8);
        assert!(b >= a + 64);
        assert!(c >= b + 128 || c < a);

        alloc.translate_mut(a)?[..64].fill(0xAB);
        assert_eq!(0xAB, alloc.translate(a)?[63]);
        assert_ne!(0xAB, alloc.translate(b)?[0]);

        Ok(())
    }

    #[test]
    fn slab_freelist_reuse() -> crate::Result<()> {
        let mut alloc = writer_alloc();

        let a = alloc.alloc(64)?;
        alloc.free(a, 64);

        let b = alloc.alloc(64)?;
        assert_eq!(a, b);

        // reused memory is zeroed
        assert!(alloc.translate(b)?[..64].iter().all(|&x| x == 0));

        Ok(())
    }

    #[test]
    fn file_region_free_is_pending() {
        let mut alloc = writer_alloc();
        let baseline = alloc.baseline();
        assert!(baseline >= 24);

        alloc.set_free_version(7);
        alloc.free(8, 16);

        assert_eq!(
            &[FreeRange {
                position: 8,
                size: 16,
                version: 7,
            }],
            alloc.pending_free()
        );
    }

    #[test]
    fn pending_merge_respects_pinned_versions() {
        let mut alloc = writer_alloc();

        alloc.set_free_space(vec![FreeRange {
            position: 0,
            size: 8,
            version: 1,
        }]);

        alloc.set_free_version(5);
        alloc.free(8, 8);
        alloc.free(16, 8);
        alloc.set_free_version(2);
        alloc.free(32, 8);

        // oldest live reader at version 3: the two version-5 ranges merge
        // with each other (equal version) but not with the version-1 one
        alloc.merge_pending_free(3);

        assert_eq!(
            &[
                FreeRange {
                    position: 0,
                    size: 8,
                    version: 1,
                },
                FreeRange {
                    position: 8,
                    size: 16,
                    version: 5,
                },
                FreeRange {
                    position: 32,
                    size: 8,
                    version: 2,
                },
            ],
            alloc.free_space()
        );

        // with no reader older than version 5 everything coalesces
        alloc.set_free_version(5);
        alloc.free(24, 8);
        alloc.merge_pending_free(5);

        assert_eq!(
            &[FreeRange {
                position: 0,
                size: 40,
                version: 5,
            }],
            alloc.free_space()
        );
    }

    #[test]
    fn take_file_space_skips_pinned_ranges() {
        let mut alloc = writer_alloc();

        alloc.set_free_space(vec![
            FreeRange {
                position: 100,
                size: 64,
                version: 9,
            },
            FreeRange {
                position: 400,
                size: 64,
                version: 2,
            },
        ]);

        // a reader is pinned at version 5: the version-9 range is off limits
        assert_eq!(Some(400), alloc.take_file_space(32, 5));

        // the remainder was split off
        assert_eq!(
            Some(FreeRange {
                position: 432,
                size: 32,
                version: 2,
            }),
            alloc.free_space().iter().copied().find(|r| r.version == 2)
        );

        assert_eq!(None, alloc.take_file_space(64, 5));
        assert_eq!(Some(100), alloc.take_file_space(64, 9));
    }
}
