// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::alloc::SlabAlloc;
use crate::db::DbInner;
use crate::group::{Group, TableType};
use crate::group_writer::{read_header, GroupWriter};
use crate::keys::TableKey;
use crate::lockfile::ReaderSlot;
use crate::table::Table;
use crate::{Error, Result};
use std::cell::RefCell;
use std::sync::Arc;

/// A committed snapshot version
pub type Version = u64;

pub(crate) struct TxnState {
    pub alloc: SlabAlloc,
    pub group: Group,

    /// For readers: the pinned version. For writers: the version this
    /// transaction will commit.
    pub version: Version,

    pub writable: bool,
}

/// Shared behavior of read and write transactions
///
/// Accessor handles ([`Table`], [`crate::Object`], collections) borrow
/// the transaction and are not thread-safe; each thread opens its own
/// transaction.
pub struct Transaction {
    pub(crate) db: Arc<DbInner>,
    pub(crate) state: RefCell<TxnState>,
}

impl Transaction {
    /// The snapshot (reader) or target (writer) version.
    pub fn version(&self) -> Version {
        self.state.borrow().version
    }

    /// Opens the table `name`.
    pub fn table(&self, name: &str) -> Result<Table<'_>> {
        let state = self.state.borrow();
        let name_id = state
            .group
            .lookup_string(&state.alloc, name)?
            .ok_or(Error::KeyNotFound)?;
        let key = state
            .group
            .find_table(&state.alloc, name_id)?
            .ok_or(Error::KeyNotFound)?;
        drop(state);

        Ok(Table::new(self, key))
    }

    /// Opens a table by key.
    pub fn table_by_key(&self, key: TableKey) -> Result<Table<'_>> {
        let state = self.state.borrow();
        state.group.table_root(&state.alloc, key)?;
        drop(state);

        Ok(Table::new(self, key))
    }

    /// All live tables.
    pub fn tables(&self) -> Result<Vec<Table<'_>>> {
        let state = self.state.borrow();
        let keys: Vec<TableKey> = state
            .group
            .tables(&state.alloc)?
            .into_iter()
            .map(|(_, key)| key)
            .collect();
        drop(state);

        Ok(keys.into_iter().map(|key| Table::new(self, key)).collect())
    }

    /// All live table names.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let state = self.state.borrow();
        state
            .group
            .tables(&state.alloc)?
            .into_iter()
            .map(|(name_id, _)| state.group.resolve_string(&state.alloc, name_id))
            .collect()
    }

    /// Adds a top-level table (write transactions only).
    pub fn add_table(&self, name: &str) -> Result<Table<'_>> {
        self.add_table_of_type(name, TableType::TopLevel)
    }

    /// Adds a table of the given kind.
    pub fn add_table_of_type(&self, name: &str, table_type: TableType) -> Result<Table<'_>> {
        let key = {
            let state = &mut *self.state.borrow_mut();
            if !state.writable {
                return Err(Error::WrongTransactState);
            }

            let name_id = state.group.intern(&mut state.alloc, name)?;
            state
                .group
                .add_table(&mut state.alloc, name_id, table_type)?
        };

        Ok(Table::new(self, key))
    }

    /// Opens `name`, creating it as a top-level table if missing.
    pub fn get_or_add_table(&self, name: &str) -> Result<Table<'_>> {
        match self.table(name) {
            Err(Error::KeyNotFound) => self.add_table(name),
            other => other,
        }
    }

    /// Removes a table and all its rows.
    pub fn remove_table(&self, key: TableKey) -> Result<()> {
        let state = &mut *self.state.borrow_mut();
        if !state.writable {
            return Err(Error::WrongTransactState);
        }
        state.group.remove_table(&mut state.alloc, key)
    }

    /// Renames a table.
    pub fn rename_table(&self, key: TableKey, new_name: &str) -> Result<()> {
        let state = &mut *self.state.borrow_mut();
        if !state.writable {
            return Err(Error::WrongTransactState);
        }

        let name_id = state.group.intern(&mut state.alloc, new_name)?;
        state.group.rename_table(&mut state.alloc, key, name_id)
    }
}

/// A read transaction: a strictly consistent snapshot pinned in the
/// reader registry
pub struct ReadTransaction {
    txn: Transaction,
    slot: Option<ReaderSlot>,
}

impl std::ops::Deref for ReadTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.txn
    }
}

impl ReadTransaction {
    pub(crate) fn new(txn: Transaction, slot: ReaderSlot) -> Self {
        Self {
            txn,
            slot: Some(slot),
        }
    }

    /// Re-targets this transaction to the latest committed version.
    ///
    /// Cheap: the old registration is swapped for a fresh one and the
    /// snapshot state is re-read; the mapping stays valid because the
    /// file only grows.
    pub fn advance(&mut self) -> Result<()> {
        let slot = self
            .slot
            .take()
            .ok_or(Error::WrongTransactState)?;

        let (slot, publication) = self.txn.db.lockfile().advance_reader(slot)?;
        self.slot = Some(slot);

        let (alloc, group) = self.txn.db.reader_state(&publication)?;
        let mut state = self.txn.state.borrow_mut();
        state.alloc = alloc;
        state.group = group;
        state.version = publication.version;
        Ok(())
    }

    /// Walks the snapshot's reachable-ref closure, validating node
    /// headers and the free-space accounting.
    pub fn verify(&self) -> Result<()> {
        let state = self.txn.state.borrow();
        crate::verify::verify_snapshot(&state.alloc, &state.group)
    }

    /// Explicitly ends the transaction (also happens on drop).
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.txn.db.lockfile().release_reader(slot);
        }
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

/// A write transaction: exclusive across threads and processes
///
/// Nothing is persistent until [`WriteTransaction::commit`] flips the
/// selector; dropping the transaction rolls back.
pub struct WriteTransaction {
    txn: Transaction,
    finished: bool,
}

impl std::ops::Deref for WriteTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.txn
    }
}

impl WriteTransaction {
    pub(crate) fn new(txn: Transaction) -> Self {
        Self {
            txn,
            finished: false,
        }
    }

    /// Runs the commit pipeline; returns the new version.
    ///
    /// On failure the selector still points at the previous version and
    /// the transaction is rolled back.
    pub fn commit(mut self) -> Result<Version> {
        self.finished = true;

        let db = self.txn.db.clone();
        let state = &mut *self.txn.state.borrow_mut();

        let oldest_live = db.lockfile().oldest_live_version();

        let result = read_header(&state.alloc).and_then(|header| {
            GroupWriter::new(&mut state.alloc, oldest_live).commit(
                &state.group,
                header,
                state.version,
                db.durability(),
            )
        });

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                state.alloc.detach_slabs();
                db.release_writer();
                return Err(e);
            }
        };

        state.alloc.rebase(result.file_size);

        db.lockfile().publish(crate::lockfile::Publication {
            version: result.version,
            top_ref: result.top_ref,
            file_size: result.file_size,
        });
        db.signal_commit();
        db.release_writer();

        log::debug!("write transaction committed as version {}", result.version);
        Ok(result.version)
    }

    /// Abandons the transaction; all slab allocations are released and
    /// no persistent state changes.
    pub fn rollback(mut self) {
        self.finished = true;
        self.abort();
    }

    fn abort(&mut self) {
        let state = &mut *self.txn.state.borrow_mut();
        state.alloc.detach_slabs();
        self.txn.db.release_writer();
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
        }
    }
}
