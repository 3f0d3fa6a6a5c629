// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::alloc::SlabAlloc;
use crate::codec::PageCodec;
use crate::file_header::HEADER_SIZE;
use crate::group::Group;
use crate::group_writer::Durability;
use crate::lockfile::{LockFile, Publication};
use crate::mapper::{FileMap, OpenMode};
use crate::transaction::{ReadTransaction, Transaction, TxnState, Version, WriteTransaction};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Builder for opening a [`Database`]
pub struct Config {
    path: PathBuf,
    read_only: bool,
    in_memory: bool,
    allow_upgrade: bool,
    durability: Durability,
    codec: Option<Arc<dyn PageCodec>>,
}

impl Config {
    /// Starts a configuration for the database at `path`.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            read_only: false,
            in_memory: false,
            allow_upgrade: true,
            durability: Durability::Full,
            codec: None,
        }
    }

    /// Opens the file read-only; write transactions are refused.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Backs the database by an unnamed temporary file that vanishes on
    /// close; durability barriers are skipped.
    #[must_use]
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    /// Whether an older (in-window) file format may be upgraded in
    /// place by the first write transaction.
    #[must_use]
    pub fn allow_upgrade(mut self, allow: bool) -> Self {
        self.allow_upgrade = allow;
        self
    }

    /// Skips the commit durability barriers (bulk loads).
    #[must_use]
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Installs a page codec (encryption at rest) beneath the mapper.
    #[must_use]
    pub fn page_codec(mut self, codec: Arc<dyn PageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Opens the database.
    pub fn open(self) -> Result<Database> {
        Database::open_with(self)
    }
}

pub(crate) struct DbInner {
    data_path: PathBuf,

    /// Keeps the backing file of an in-memory database alive (and
    /// deletes it on drop)
    _temp: Option<tempfile::TempDir>,

    read_only: bool,
    allow_upgrade: bool,
    durability: Durability,
    codec: Option<Arc<dyn PageCodec>>,

    lockfile: LockFile,

    /// In-process writer exclusion (the file lock only excludes other
    /// processes)
    writer_busy: Mutex<bool>,
    writer_cv: Condvar,

    /// In-process commit signalling; other processes observe the shared
    /// version counter
    commit_mutex: Mutex<()>,
    commit_cv: Condvar,
}

impl DbInner {
    pub(crate) fn lockfile(&self) -> &LockFile {
        &self.lockfile
    }

    pub(crate) fn durability(&self) -> Durability {
        self.durability
    }

    fn reader_mode(&self) -> OpenMode {
        // readers always attach read-only; in-memory databases keep a
        // real (temporary) file so this works uniformly
        OpenMode::ReadOnly
    }

    pub(crate) fn reader_state(&self, publication: &Publication) -> Result<(SlabAlloc, Group)> {
        let (map, _header) =
            FileMap::attach(&self.data_path, self.reader_mode(), self.codec.clone())?;
        let view = map.read_view()?;

        // the allocator's baseline is the snapshot's logical size, even
        // if the file has since grown
        let alloc = SlabAlloc::for_reader(view, publication.file_size);
        let mut group = Group::attach(publication.top_ref);
        group.bind(&alloc)?;
        Ok((alloc, group))
    }

    fn acquire_writer(&self) -> Result<()> {
        let mut busy = self.writer_busy.lock();
        while *busy {
            self.writer_cv.wait(&mut busy);
        }
        *busy = true;
        drop(busy);

        if let Err(e) = self.lockfile.lock_writer_cross_process() {
            *self.writer_busy.lock() = false;
            self.writer_cv.notify_one();
            return Err(e);
        }
        Ok(())
    }

    fn try_acquire_writer(&self) -> Result<()> {
        let mut busy = self.writer_busy.lock();
        if *busy {
            return Err(Error::Locked);
        }

        if !self.lockfile.try_lock_writer_cross_process()? {
            return Err(Error::Locked);
        }

        *busy = true;
        Ok(())
    }

    pub(crate) fn release_writer(&self) {
        if let Err(e) = self.lockfile.unlock_writer_cross_process() {
            log::warn!("failed to release the write lock: {e}");
        }

        let mut busy = self.writer_busy.lock();
        *busy = false;
        self.writer_cv.notify_one();
    }

    pub(crate) fn signal_commit(&self) {
        let _guard = self.commit_mutex.lock();
        self.commit_cv.notify_all();
    }
}

/// An embedded, single-file object database
///
/// Cheap to clone-by-open: all handles for one path within a process
/// share a coordinator, so they also share the lockfile state.
pub struct Database {
    inner: Arc<DbInner>,
}

fn registry() -> &'static Mutex<FxHashMap<PathBuf, Weak<DbInner>>> {
    static REGISTRY: OnceLock<Mutex<FxHashMap<PathBuf, Weak<DbInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(FxHashMap::default()))
}

fn registry_key(path: &Path) -> PathBuf {
    // canonicalize where possible so two spellings of one path share a
    // coordinator
    path.canonicalize().unwrap_or_else(|_| {
        match (path.parent().and_then(|p| p.canonicalize().ok()), path.file_name()) {
            (Some(parent), Some(name)) => parent.join(name),
            _ => path.to_path_buf(),
        }
    })
}

impl Database {
    /// Opens (creating if missing) the database at `path` with default
    /// configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Config::new(path).open()
    }

    fn open_with(config: Config) -> Result<Self> {
        let (data_path, temp) = if config.in_memory {
            let dir = tempfile::TempDir::new()?;
            (dir.path().join("mem.tdb"), Some(dir))
        } else {
            (config.path.clone(), None)
        };

        // same-process opens of one path share the coordinator
        if !config.in_memory {
            let key = registry_key(&data_path);
            let mut map = registry().lock();
            if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
                log::debug!("sharing existing coordinator for {key:?}");
                return Ok(Self { inner: existing });
            }
            map.retain(|_, weak| weak.strong_count() > 0);
        }

        let lockfile = LockFile::open(&data_path)?;

        let mode = if config.read_only {
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWrite
        };
        let durability = if config.in_memory {
            Durability::Unsafe
        } else {
            config.durability
        };

        // validate the stamp and seed the publication triple
        let (map, header) = FileMap::attach(&data_path, mode, config.codec.clone())?;

        if header.needs_upgrade() && (!config.allow_upgrade || config.read_only) {
            return Err(Error::UnsupportedFileFormat(header.version.into()));
        }

        let seed = {
            let view = map.read_view()?;
            let len = view.len();
            let alloc = SlabAlloc::for_reader(view, len);
            let mut group = Group::attach(header.live_top_ref());
            group.bind(&alloc)?;

            let file_size = if group.is_empty_placeholder() {
                len.max(HEADER_SIZE as u64)
            } else {
                group.file_size(&alloc)?
            };

            Publication {
                version: group.version(&alloc)?,
                top_ref: header.live_top_ref(),
                file_size,
            }
        };
        lockfile.seed_publication(seed);
        drop(map);

        let inner = Arc::new(DbInner {
            data_path: data_path.clone(),
            _temp: temp,
            read_only: config.read_only,
            allow_upgrade: config.allow_upgrade,
            durability,
            codec: config.codec,
            lockfile,
            writer_busy: Mutex::new(false),
            writer_cv: Condvar::new(),
            commit_mutex: Mutex::new(()),
            commit_cv: Condvar::new(),
        });

        if !config.in_memory {
            registry()
                .lock()
                .insert(registry_key(&data_path), Arc::downgrade(&inner));
        }

        log::debug!("opened database at {data_path:?}");
        Ok(Self { inner })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.data_path
    }

    /// Begins a read transaction pinned at the latest committed version.
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        let (slot, publication) = self.inner.lockfile.acquire_reader()?;

        let (alloc, group) = match self.inner.reader_state(&publication) {
            Ok(pair) => pair,
            Err(e) => {
                self.inner.lockfile.release_reader(slot);
                return Err(e);
            }
        };

        let txn = Transaction {
            db: self.inner.clone(),
            state: RefCell::new(TxnState {
                alloc,
                group,
                version: publication.version,
                writable: false,
            }),
        };

        Ok(ReadTransaction::new(txn, slot))
    }

    /// Begins the write transaction (blocking until it is available).
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        if self.inner.read_only {
            return Err(Error::WrongTransactState);
        }

        self.inner.acquire_writer()?;
        self.start_write()
    }

    /// Non-blocking [`Database::begin_write`]; fails with
    /// [`Error::Locked`] when another writer is active.
    pub fn try_begin_write(&self) -> Result<WriteTransaction> {
        if self.inner.read_only {
            return Err(Error::WrongTransactState);
        }

        self.inner.try_acquire_writer()?;
        self.start_write()
    }

    fn start_write(&self) -> Result<WriteTransaction> {
        let built = (|| {
            let (map, header) =
                FileMap::attach(&self.inner.data_path, OpenMode::ReadWrite, self.inner.codec.clone())?;

            let map_len = map.len();
            let mut alloc = SlabAlloc::for_writer(map);

            let mut group = Group::attach(header.live_top_ref());
            group.bind(&alloc)?;

            let version = group.version(&alloc)?;
            alloc.set_free_version(version + 1);

            let mut free_space = group.load_free_space(&alloc)?;

            // padding past the logical size (fresh files, codec block
            // rounding) is ordinary free space
            let logical = if group.is_empty_placeholder() {
                HEADER_SIZE as u64
            } else {
                group.file_size(&alloc)?
            };
            if map_len > logical {
                free_space.push(crate::alloc::FreeRange {
                    position: logical,
                    size: map_len - logical,
                    version: 0,
                });
            }
            alloc.set_free_space(free_space);

            if group.is_empty_placeholder() {
                group = Group::create(&mut alloc)?;
            }

            if header.needs_upgrade() {
                if !self.inner.allow_upgrade {
                    return Err(Error::UnsupportedFileFormat(header.version.into()));
                }
                // in-place upgrade hook: with a single supported format
                // version the commit simply rewrites the current stamp
                log::debug!("upgrading file format in place");
            }

            Ok(TxnState {
                alloc,
                group,
                version: version + 1,
                writable: true,
            })
        })();

        match built {
            Ok(state) => Ok(WriteTransaction::new(Transaction {
                db: self.inner.clone(),
                state: RefCell::new(state),
            })),
            Err(e) => {
                self.inner.release_writer();
                Err(e)
            }
        }
    }

    /// Latest committed version.
    #[must_use]
    pub fn latest_version(&self) -> Version {
        self.inner.lockfile.current_version()
    }

    /// Number of live reader registrations (all processes).
    #[must_use]
    pub fn num_readers(&self) -> u32 {
        self.inner.lockfile.num_readers()
    }

    /// Blocks until a version newer than `since` is committed.
    ///
    /// Commits by this process wake waiters immediately; commits by
    /// other processes are observed within a bounded polling delay.
    pub fn wait_for_change(&self, since: Version) {
        let mut guard = self.inner.commit_mutex.lock();
        while self.inner.lockfile.current_version() <= since {
            self.inner
                .commit_cv
                .wait_for(&mut guard, Duration::from_millis(10));
        }
    }

    /// Like [`Database::wait_for_change`] with a deadline; returns
    /// `false` on timeout.
    pub fn wait_for_change_timeout(&self, since: Version, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.inner.commit_mutex.lock();

        while self.inner.lockfile.current_version() <= since {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let step = (deadline - now).min(Duration::from_millis(10));
            self.inner.commit_cv.wait_for(&mut guard, step);
        }
        true
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
