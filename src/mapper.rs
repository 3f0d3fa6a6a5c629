// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::codec::{PageCodec, CODEC_BLOCK_SIZE};
use crate::file_header::{FileHeader, HEADER_SIZE, SELECTOR_OFFSET};
use crate::{Error, Result};
use rustc_hash::FxHashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::Arc;

/// How a database file is attached
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Existing file, no writes
    ReadOnly,

    /// Create if missing, allow write transactions
    ReadWrite,

    /// Anonymous backing file, discarded on close
    MemoryOnly,
}

fn open_file(path: &Path, mode: OpenMode) -> Result<File> {
    match mode {
        OpenMode::ReadOnly => Ok(File::open(path)?),
        OpenMode::ReadWrite => Ok(File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?),
        OpenMode::MemoryOnly => Ok(tempfile::tempfile()?),
    }
}

enum ReadViewInner {
    Mapped(memmap2::Mmap),
    Buffered(Vec<u8>),
}

/// Immutable, stable view of a file prefix
///
/// A reader clones the view `Arc` when its transaction begins and
/// translates refs against it without any locking. The view stays valid
/// for the whole transaction because the file only ever grows.
#[derive(Clone)]
pub struct ReadView {
    inner: Arc<ReadViewInner>,
    len: u64,
}

impl ReadView {
    /// Length of the viewed prefix.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrows `[offset, offset + len)` of the viewed prefix.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::corrupt("ref range overflows"))?;

        if end > self.len {
            return Err(Error::corrupt(format!(
                "read of [{offset}, {end}) beyond mapped length {}",
                self.len,
            )));
        }

        let bytes = match &*self.inner {
            ReadViewInner::Mapped(mmap) => &mmap[..],
            ReadViewInner::Buffered(buf) => buf.as_slice(),
        };

        bytes
            .get(offset as usize..end as usize)
            .ok_or_else(|| Error::corrupt("mapped range missing"))
    }
}

fn read_cleartext(file: &File, len: u64, codec: &dyn PageCodec) -> Result<Vec<u8>> {
    let mut handle = file;
    handle.seek(SeekFrom::Start(0))?;

    let block_count = (len as usize).div_ceil(CODEC_BLOCK_SIZE);
    let mut buf = vec![0u8; block_count * CODEC_BLOCK_SIZE];
    handle.read_exact(&mut buf[..len as usize])?;

    for (index, chunk) in buf.chunks_exact_mut(CODEC_BLOCK_SIZE).enumerate() {
        let block: &mut [u8; CODEC_BLOCK_SIZE] =
            chunk.try_into().map_err(|_| Error::corrupt("short block"))?;
        codec.decode_block(index as u64, block)?;
    }

    buf.truncate(len as usize);
    Ok(buf)
}

enum WriteMapping {
    Mapped(memmap2::MmapMut),
    Buffered {
        buf: Vec<u8>,
        dirty_blocks: FxHashSet<u64>,
    },
}

/// The process's handle to a database file: owns the descriptor, hands
/// out [`ReadView`]s and carries the single writer mapping
///
/// Growing the file replaces the mapping and bumps the generation
/// counter; readers keep translating against the view they pinned.
pub struct FileMap {
    file: File,
    mode: OpenMode,
    codec: Option<Arc<dyn PageCodec>>,
    mapping: WriteMapping,
    len: u64,
    generation: AtomicU64,
}

impl FileMap {
    /// Opens (or, in read-write mode, creates) the database file and
    /// validates its stamp.
    ///
    /// A brand-new file gets a fresh header with null top refs; the
    /// first group materializes at the first commit.
    pub fn attach(
        path: &Path,
        mode: OpenMode,
        codec: Option<Arc<dyn PageCodec>>,
    ) -> Result<(Self, FileHeader)> {
        let mut file = open_file(path, mode)?;
        let mut len = file.metadata()?.len();

        let header = if len == 0 {
            if mode == OpenMode::ReadOnly {
                return Err(Error::corrupt("empty file opened read-only"));
            }

            log::debug!("initializing fresh database file at {path:?}");

            let header = FileHeader::new_file();
            let mut stamp = [0u8; CODEC_BLOCK_SIZE];
            stamp[..HEADER_SIZE].copy_from_slice(&header.encode());

            if let Some(codec) = &codec {
                let block: &mut [u8; CODEC_BLOCK_SIZE] = (&mut stamp)
                    .try_into()
                    .map_err(|_| Error::corrupt("short block"))?;
                codec.encode_block(0, block)?;
                file.write_all(&stamp)?;
                len = CODEC_BLOCK_SIZE as u64;
            } else {
                file.write_all(&stamp[..HEADER_SIZE])?;
                len = HEADER_SIZE as u64;
            }

            if mode == OpenMode::ReadWrite {
                file.sync_all()?;
            }

            header
        } else {
            if len < HEADER_SIZE as u64 {
                return Err(Error::corrupt(format!("file too short: {len} bytes")));
            }

            let mut stamp = vec![0u8; HEADER_SIZE.max(CODEC_BLOCK_SIZE).min(len as usize)];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut stamp)?;

            if let Some(codec) = &codec {
                let block: &mut [u8; CODEC_BLOCK_SIZE] = stamp
                    .as_mut_slice()
                    .try_into()
                    .map_err(|_| Error::corrupt("encrypted file not block aligned"))?;
                codec.decode_block(0, block)?;
            }

            FileHeader::decode(&stamp)?
        };

        let mapping = Self::map_file(&file, len, mode, codec.as_deref())?;

        Ok((
            Self {
                file,
                mode,
                codec,
                mapping,
                len,
                generation: AtomicU64::new(0),
            },
            header,
        ))
    }

    fn map_file(
        file: &File,
        len: u64,
        mode: OpenMode,
        codec: Option<&dyn PageCodec>,
    ) -> Result<WriteMapping> {
        if let Some(codec) = codec {
            return Ok(WriteMapping::Buffered {
                buf: read_cleartext(file, len, codec)?,
                dirty_blocks: FxHashSet::default(),
            });
        }

        // SAFETY: the mapping aliases file bytes that other processes may
        // mutate through the commit protocol; every mutation of shared
        // regions is confined to free space no live snapshot references,
        // and the header selector is a single aligned byte
        #[expect(unsafe_code, reason = "memory mapping is inherently unsafe")]
        let mmap = unsafe {
            let mut options = memmap2::MmapOptions::new();
            options.len(len as usize);

            if mode == OpenMode::ReadOnly {
                // private mapping; never written to, never flushed
                options.map_copy(file)?
            } else {
                options.map_mut(file)?
            }
        };

        Ok(WriteMapping::Mapped(mmap))
    }

    /// Mapped length.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Monotonic counter, bumped whenever the base mapping is replaced.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(SeqCst)
    }

    /// Extends the file to `new_len` and replaces the mapping.
    ///
    /// Cached base pointers (read views) stay valid; they cover a prefix
    /// of the grown file.
    pub fn remap(&mut self, new_len: u64) -> Result<()> {
        if new_len < self.len {
            return Err(Error::logic("file shrink is not supported"));
        }

        if new_len == self.len {
            return Ok(());
        }

        log::debug!("growing file {} -> {} bytes", self.len, new_len);

        self.file.set_len(new_len)?;

        match &mut self.mapping {
            WriteMapping::Buffered { buf, .. } => {
                buf.resize(new_len as usize, 0);
            }
            WriteMapping::Mapped(_) => {
                self.mapping = Self::map_file(&self.file, new_len, self.mode, None)?;
            }
        }

        self.len = new_len;
        self.generation.fetch_add(1, SeqCst);
        Ok(())
    }

    /// Borrows `[offset, offset + len)` of the mapped prefix.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::corrupt("ref range overflows"))?;

        if end > self.len {
            return Err(Error::corrupt(format!(
                "read of [{offset}, {end}) beyond file length {}",
                self.len,
            )));
        }

        let bytes = match &self.mapping {
            WriteMapping::Mapped(mmap) => &mmap[..],
            WriteMapping::Buffered { buf, .. } => buf.as_slice(),
        };

        bytes
            .get(offset as usize..end as usize)
            .ok_or_else(|| Error::corrupt("mapped range missing"))
    }

    /// Writes `bytes` at `offset` through the mapping.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = offset + bytes.len() as u64;
        if end > self.len {
            return Err(Error::logic(format!(
                "write of [{offset}, {end}) beyond file length {}",
                self.len,
            )));
        }

        match &mut self.mapping {
            WriteMapping::Mapped(mmap) => {
                mmap.get_mut(offset as usize..end as usize)
                    .ok_or_else(|| Error::corrupt("mapped range missing"))?
                    .copy_from_slice(bytes);
            }
            WriteMapping::Buffered { buf, dirty_blocks } => {
                buf.get_mut(offset as usize..end as usize)
                    .ok_or_else(|| Error::corrupt("buffered range missing"))?
                    .copy_from_slice(bytes);

                let first = offset / CODEC_BLOCK_SIZE as u64;
                let last = (end - 1) / CODEC_BLOCK_SIZE as u64;
                for block in first..=last {
                    dirty_blocks.insert(block);
                }
            }
        }

        Ok(())
    }

    /// Writes the selector byte. This is the commit linearization point,
    /// a single aligned one-byte store.
    pub fn write_selector(&mut self, selector: u8) -> Result<()> {
        self.write_at(SELECTOR_OFFSET as u64, &[selector])
    }

    /// Flushes mapped pages and file metadata; returns only after both
    /// are durable.
    pub fn sync(&mut self) -> Result<()> {
        if self.mode == OpenMode::MemoryOnly {
            return Ok(());
        }

        match &mut self.mapping {
            WriteMapping::Mapped(mmap) => {
                mmap.flush()?;
            }
            WriteMapping::Buffered { buf, dirty_blocks } => {
                let len = buf.len() as u64;

                let codec = self
                    .codec
                    .as_deref()
                    .ok_or_else(|| Error::logic("buffered mapping without codec"))?;

                let mut blocks: Vec<u64> = dirty_blocks.drain().collect();
                blocks.sort_unstable();

                for index in blocks {
                    let start = (index * CODEC_BLOCK_SIZE as u64) as usize;
                    let mut block = [0u8; CODEC_BLOCK_SIZE];
                    let avail = (buf.len() - start).min(CODEC_BLOCK_SIZE);
                    block[..avail].copy_from_slice(&buf[start..start + avail]);

                    codec.encode_block(index, &mut block)?;

                    self.file.seek(SeekFrom::Start(start as u64))?;
                    self.file.write_all(&block)?;
                }

                // the on-disk file is block aligned in codec mode
                let disk_len = len.div_ceil(CODEC_BLOCK_SIZE as u64) * CODEC_BLOCK_SIZE as u64;
                if self.file.metadata()?.len() < disk_len {
                    self.file.set_len(disk_len)?;
                }
            }
        }

        self.file.sync_all()?;
        Ok(())
    }

    /// Creates an immutable view of the current file prefix for readers.
    pub fn read_view(&self) -> Result<ReadView> {
        let inner = if let Some(codec) = &self.codec {
            match &self.mapping {
                // cheaper than re-reading + decrypting the file
                WriteMapping::Buffered { buf, .. } => ReadViewInner::Buffered(buf.clone()),
                WriteMapping::Mapped(_) => {
                    ReadViewInner::Buffered(read_cleartext(&self.file, self.len, codec.as_ref())?)
                }
            }
        } else {
            // SAFETY: see map_file
            #[expect(unsafe_code, reason = "memory mapping is inherently unsafe")]
            let mmap = unsafe {
                let mut options = memmap2::MmapOptions::new();
                options.len(self.len as usize);
                options.map(&self.file)?
            };

            ReadViewInner::Mapped(mmap)
        };

        Ok(ReadView {
            inner: Arc::new(inner),
            len: self.len,
        })
    }

    /// Re-reads the file stamp (used when advancing a read transaction).
    pub fn read_header(&self) -> Result<FileHeader> {
        FileHeader::decode(self.slice(0, HEADER_SIZE)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    #[expect(clippy::unwrap_used)]
    fn attach_initializes_stamp() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db.tdb");

        let (map, header) = FileMap::attach(&path, OpenMode::ReadWrite, None)?;
        assert_eq!(0, header.live_top_ref());
        assert_eq!(HEADER_SIZE as u64, map.len());
        drop(map);

        // reopening validates the stamp
        let (_, header) = FileMap::attach(&path, OpenMode::ReadOnly, None)?;
        assert_eq!(0, header.top_ref_a);
        assert_eq!(0, header.selector);

        // corrupting the selector makes open fail without mutating the file
        {
            let mut file = File::options().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(SELECTOR_OFFSET as u64)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        assert!(matches!(
            FileMap::attach(&path, OpenMode::ReadOnly, None),
            Err(Error::InvalidDatabase(_))
        ));

        Ok(())
    }

    #[test]
    fn remap_grows_and_bumps_generation() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db.tdb");

        let (mut map, _) = FileMap::attach(&path, OpenMode::ReadWrite, None)?;
        let generation = map.generation();

        map.remap(4096)?;
        assert_eq!(4096, map.len());
        assert!(map.generation() > generation);

        map.write_at(1000, b"hello")?;
        assert_eq!(b"hello", map.slice(1000, 5)?);

        let view = map.read_view()?;
        assert_eq!(b"hello", view.slice(1000, 5)?);

        Ok(())
    }

    #[test]
    fn memory_only_needs_no_path_reuse() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("scratch");

        let (mut map, _) = FileMap::attach(&path, OpenMode::MemoryOnly, None)?;
        map.remap(8192)?;
        map.write_at(100, b"x")?;
        map.sync()?;

        // the backing file is anonymous; the named path is untouched
        assert!(!path.exists());

        Ok(())
    }
}
