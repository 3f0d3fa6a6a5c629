// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The lockfile: a sibling file mapped into every participating
//! process, hosting the reader registry and commit publication state.
//!
//! The write mutex is a separate `fs4` file lock (cross-process) paired
//! with an in-process flag (file locks do not exclude threads of one
//! process). The control mutex guarding the reader ring is a shared
//! spin word. Commit signalling is an in-process condvar plus bounded
//! polling of the shared version counter for other processes; the
//! externally observable contract (a waiter wakes after a commit within
//! a bounded delay) matches a process-shared condvar.

use crate::format_version::CURRENT_FORMAT_VERSION;
use crate::{Error, Result};
use fs4::fs_std::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{
    AtomicU32, AtomicU64,
    Ordering::{Acquire, Relaxed, Release, SeqCst},
};
use std::time::Duration;

/// Reader-ring capacity; a newcomer blocks while the ring is full
pub const READER_RING_CAPACITY: usize = 256;

/// Minimum size of the mapped region (rounded up to the system page
/// size so every process maps the same whole pages)
const LOCKFILE_MIN_SIZE: usize = 8192;

fn lockfile_size() -> usize {
    LOCKFILE_MIN_SIZE.div_ceil(page_size::get()) * page_size::get()
}

#[repr(C)]
struct ReaderEntry {
    version: AtomicU64,
    ref_count: AtomicU32,
    pid_tag: AtomicU32,
}

#[repr(C)]
struct SharedInfo {
    /// Layout + format fingerprint; processes with a different one
    /// refuse to share
    fingerprint: AtomicU64,

    /// 0 raw, 1 initializing, 2 ready
    init: AtomicU32,

    /// Spin word guarding the reader ring and the publication triple
    control: AtomicU32,

    /// Last committed version
    current_version: AtomicU64,

    /// Top ref of the last committed version
    current_top_ref: AtomicU64,

    /// Logical file size of the last committed version
    current_file_size: AtomicU64,

    /// Live reader registrations
    num_readers: AtomicU32,

    _pad: AtomicU32,

    entries: [ReaderEntry; READER_RING_CAPACITY],
}

fn fingerprint() -> u64 {
    let tag = format!("tdb-lockfile-v{}", u8::from(CURRENT_FORMAT_VERSION));
    xxhash_rust::xxh3::xxh3_64(tag.as_bytes())
}

/// A consistent snapshot of the publication triple
#[derive(Copy, Clone, Debug)]
pub struct Publication {
    /// Committed version
    pub version: u64,

    /// Its top ref
    pub top_ref: u64,

    /// Its logical file size
    pub file_size: u64,
}

/// Registration of one read transaction; release via
/// [`LockFile::release_reader`]
#[derive(Copy, Clone, Debug)]
pub struct ReaderSlot {
    index: usize,

    /// The pinned version
    pub version: u64,
}

/// The mapped lockfile
pub struct LockFile {
    path: PathBuf,
    _file: File,
    map: memmap2::MmapMut,
    write_lock_file: File,
}

// The raw mapping is shared across threads; every access goes through
// the atomics of SharedInfo.
#[expect(unsafe_code, reason = "SharedInfo is all atomics")]
unsafe impl Send for LockFile {}
#[expect(unsafe_code, reason = "SharedInfo is all atomics")]
unsafe impl Sync for LockFile {}

impl LockFile {
    /// Opens (creating and initializing if needed) the lockfile next to
    /// `db_path`, plus the write-lock sibling.
    ///
    /// Holding the exclusive init lock proves no other process is
    /// attached, so a leftover registry from a crashed process is wiped.
    pub fn open(db_path: &Path) -> Result<Self> {
        let path = sibling(db_path, "lock");
        let write_lock_path = sibling(db_path, "wlock");

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let write_lock_file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&write_lock_path)?;

        let got_exclusive = file.try_lock_exclusive()?;

        if got_exclusive {
            file.set_len(lockfile_size() as u64)?;
        } else {
            // another process is attached; wait for its initialization
            file.lock_shared()?;
        }

        // SAFETY: the mapping stays alive as long as self; all accesses
        // go through atomics
        #[expect(unsafe_code, reason = "memory mapping is inherently unsafe")]
        let map = unsafe {
            memmap2::MmapOptions::new()
                .len(lockfile_size())
                .map_mut(&file)?
        };

        let lockfile = Self {
            path,
            _file: file,
            map,
            write_lock_file,
        };

        if got_exclusive {
            let info = lockfile.info();
            info.init.store(1, SeqCst);
            info.fingerprint.store(fingerprint(), SeqCst);
            info.control.store(0, SeqCst);
            info.current_version.store(0, SeqCst);
            info.current_top_ref.store(0, SeqCst);
            info.current_file_size.store(0, SeqCst);
            info.num_readers.store(0, SeqCst);
            for entry in &info.entries {
                entry.version.store(0, SeqCst);
                entry.ref_count.store(0, SeqCst);
                entry.pid_tag.store(0, SeqCst);
            }
            info.init.store(2, SeqCst);

            // downgrade so other processes can attach
            FileExt::unlock(&lockfile._file)?;
            lockfile._file.lock_shared()?;

            log::debug!("initialized lockfile {:?}", lockfile.path);
        } else {
            // spin until the initializer finishes
            let mut tries = 0u32;
            while lockfile.info().init.load(SeqCst) != 2 {
                std::thread::sleep(Duration::from_millis(1));
                tries += 1;
                if tries > 10_000 {
                    return Err(Error::corrupt("lockfile never finished initializing"));
                }
            }

            if lockfile.info().fingerprint.load(SeqCst) != fingerprint() {
                log::warn!("lockfile fingerprint mismatch at {:?}", lockfile.path);
                return Err(Error::UnsupportedFileFormat(u8::from(
                    CURRENT_FORMAT_VERSION,
                )));
            }
        }

        Ok(lockfile)
    }

    fn info(&self) -> &SharedInfo {
        debug_assert!(self.map.len() >= std::mem::size_of::<SharedInfo>());

        // SAFETY: the mapping is page aligned, at least as large as
        // SharedInfo, and SharedInfo is repr(C) made of atomics only
        #[expect(unsafe_code, reason = "overlaying the shared-memory struct")]
        unsafe {
            &*self.map.as_ptr().cast::<SharedInfo>()
        }
    }

    fn lock_control(&self) -> ControlGuard<'_> {
        let control = &self.info().control;
        let mut spins = 0u32;

        while control
            .compare_exchange_weak(0, 1, Acquire, Relaxed)
            .is_err()
        {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }

        ControlGuard { control }
    }

    /// Seeds the publication triple on first attach (when no commit has
    /// been published since the lockfile was initialized).
    pub fn seed_publication(&self, seed: Publication) {
        let _guard = self.lock_control();
        let info = self.info();

        if info.current_file_size.load(Relaxed) == 0 {
            info.current_version.store(seed.version, Relaxed);
            info.current_top_ref.store(seed.top_ref, Relaxed);
            info.current_file_size.store(seed.file_size, Relaxed);
        }
    }

    /// Reads the publication triple consistently.
    pub fn publication(&self) -> Publication {
        let _guard = self.lock_control();
        let info = self.info();

        Publication {
            version: info.current_version.load(Relaxed),
            top_ref: info.current_top_ref.load(Relaxed),
            file_size: info.current_file_size.load(Relaxed),
        }
    }

    /// Publishes a commit (called after the selector flip).
    pub fn publish(&self, publication: Publication) {
        let _guard = self.lock_control();
        let info = self.info();

        info.current_version.store(publication.version, Relaxed);
        info.current_top_ref.store(publication.top_ref, Relaxed);
        info.current_file_size
            .store(publication.file_size, Relaxed);
    }

    /// Registers a read transaction at the current version, blocking
    /// while the ring is full.
    pub fn acquire_reader(&self) -> Result<(ReaderSlot, Publication)> {
        loop {
            {
                let _guard = self.lock_control();
                let info = self.info();

                let publication = Publication {
                    version: info.current_version.load(Relaxed),
                    top_ref: info.current_top_ref.load(Relaxed),
                    file_size: info.current_file_size.load(Relaxed),
                };

                // share an existing entry for the same version
                let mut free = None;
                let mut found = None;
                for (i, entry) in info.entries.iter().enumerate() {
                    let refs = entry.ref_count.load(Relaxed);
                    if refs == 0 {
                        if free.is_none() {
                            free = Some(i);
                        }
                    } else if entry.version.load(Relaxed) == publication.version {
                        found = Some(i);
                        break;
                    }
                }

                let index = match (found, free) {
                    (Some(i), _) => {
                        let entry = &info.entries[i];
                        entry.ref_count.fetch_add(1, Relaxed);
                        Some(i)
                    }
                    (None, Some(i)) => {
                        let entry = &info.entries[i];
                        entry.version.store(publication.version, Relaxed);
                        entry.ref_count.store(1, Relaxed);
                        entry.pid_tag.store(std::process::id(), Relaxed);
                        Some(i)
                    }
                    (None, None) => None,
                };

                if let Some(index) = index {
                    info.num_readers.fetch_add(1, Relaxed);
                    return Ok((
                        ReaderSlot {
                            index,
                            version: publication.version,
                        },
                        publication,
                    ));
                }
            }

            // ring full: overflow blocks rather than corrupts
            log::warn!("reader ring full; waiting for a slot");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Re-registers a live reader at the newest version (advance-read).
    pub fn advance_reader(&self, slot: ReaderSlot) -> Result<(ReaderSlot, Publication)> {
        self.release_reader(slot);
        self.acquire_reader()
    }

    /// Drops a reader registration.
    pub fn release_reader(&self, slot: ReaderSlot) {
        let _guard = self.lock_control();
        let info = self.info();

        let entry = &info.entries[slot.index];
        debug_assert!(entry.ref_count.load(Relaxed) > 0);
        entry.ref_count.fetch_sub(1, Relaxed);
        info.num_readers.fetch_sub(1, Relaxed);
    }

    /// The oldest version any live reader is pinned at (the current
    /// version when nobody reads).
    pub fn oldest_live_version(&self) -> u64 {
        let _guard = self.lock_control();
        let info = self.info();

        let mut oldest = info.current_version.load(Relaxed);
        for entry in &info.entries {
            if entry.ref_count.load(Relaxed) > 0 {
                oldest = oldest.min(entry.version.load(Relaxed));
            }
        }
        oldest
    }

    /// Number of live reader registrations.
    pub fn num_readers(&self) -> u32 {
        self.info().num_readers.load(Acquire)
    }

    /// Last committed version (unlocked peek; used by change waiters).
    pub fn current_version(&self) -> u64 {
        self.info().current_version.load(Acquire)
    }

    /// Acquires the cross-process write lock (blocking).
    pub fn lock_writer_cross_process(&self) -> Result<()> {
        self.write_lock_file.lock_exclusive()?;
        Ok(())
    }

    /// Tries to acquire the cross-process write lock.
    pub fn try_lock_writer_cross_process(&self) -> Result<bool> {
        Ok(self.write_lock_file.try_lock_exclusive()?)
    }

    /// Releases the cross-process write lock.
    pub fn unlock_writer_cross_process(&self) -> Result<()> {
        FileExt::unlock(&self.write_lock_file)?;
        Ok(())
    }
}

fn sibling(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map_or_else(|| "db".into(), std::ffi::OsStr::to_os_string);
    name.push(".");
    name.push(suffix);
    db_path.with_file_name(name)
}

struct ControlGuard<'a> {
    control: &'a AtomicU32,
}

impl Drop for ControlGuard<'_> {
    fn drop(&mut self) {
        self.control.store(0, Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn reader_registry_tracks_oldest() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let lockfile = LockFile::open(&dir.path().join("db.tdb"))?;

        lockfile.publish(Publication {
            version: 5,
            top_ref: 24,
            file_size: 1024,
        });

        let (a, p) = lockfile.acquire_reader()?;
        assert_eq!(5, p.version);
        assert_eq!(1, lockfile.num_readers());

        lockfile.publish(Publication {
            version: 6,
            top_ref: 48,
            file_size: 2048,
        });

        let (b, p) = lockfile.acquire_reader()?;
        assert_eq!(6, p.version);
        assert_eq!(5, lockfile.oldest_live_version());

        lockfile.release_reader(a);
        assert_eq!(6, lockfile.oldest_live_version());

        lockfile.release_reader(b);
        assert_eq!(0, lockfile.num_readers());
        assert_eq!(6, lockfile.oldest_live_version());

        Ok(())
    }

    #[test]
    fn same_version_readers_share_an_entry() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let lockfile = LockFile::open(&dir.path().join("db.tdb"))?;

        lockfile.publish(Publication {
            version: 3,
            top_ref: 24,
            file_size: 512,
        });

        let (a, _) = lockfile.acquire_reader()?;
        let (b, _) = lockfile.acquire_reader()?;
        assert_eq!(a.index, b.index);
        assert_eq!(2, lockfile.num_readers());

        lockfile.release_reader(a);
        lockfile.release_reader(b);
        Ok(())
    }

    #[test]
    fn write_lock_excludes() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db.tdb");

        let lockfile = LockFile::open(&path)?;
        assert!(lockfile.try_lock_writer_cross_process()?);

        // a second handle (same fd rules as another process would see)
        // cannot take it
        let second = LockFile::open(&path)?;
        assert!(!second.try_lock_writer_cross_process()?);

        lockfile.unlock_writer_cross_process()?;
        assert!(second.try_lock_writer_cross_process()?);
        second.unlock_writer_cross_process()?;

        Ok(())
    }

    #[test]
    fn advance_moves_the_pin() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let lockfile = LockFile::open(&dir.path().join("db.tdb"))?;

        lockfile.publish(Publication {
            version: 1,
            top_ref: 24,
            file_size: 100,
        });
        let (slot, _) = lockfile.acquire_reader()?;

        lockfile.publish(Publication {
            version: 2,
            top_ref: 48,
            file_size: 200,
        });

        let (slot, p) = lockfile.advance_reader(slot)?;
        assert_eq!(2, p.version);
        assert_eq!(2, lockfile.oldest_live_version());

        lockfile.release_reader(slot);
        Ok(())
    }
}
