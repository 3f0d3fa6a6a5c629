// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, single-file, mmap-backed object database core.
//!
//! The file holds a forest of copy-on-write B+trees ("cluster trees",
//! one per table) built from self-describing bit-packed nodes. Commits
//! never overwrite live data: a writer builds new nodes in in-memory
//! slabs, relocates them into file free space no live snapshot pins,
//! writes the new top ref into the inactive header slot, and flips a
//! one-byte selector as the linearization point. Readers are unlimited,
//! across threads and processes; the single writer is excluded through
//! a sibling lockfile.
//!
//! # Example usage
//!
//! ```
//! use tdb::{ColumnType, Database, Value};
//! #
//! # let dir = tempfile::tempdir()?;
//!
//! let db = Database::open(dir.path().join("example.tdb"))?;
//!
//! // writes happen inside the (single) write transaction
//! let txn = db.begin_write()?;
//! let table = txn.add_table("measurements")?;
//! let value_col = table.add_column("value", ColumnType::Int, false)?;
//!
//! let obj = table.create_object()?;
//! obj.set(value_col, 42)?;
//! txn.commit()?;
//!
//! // readers pin a consistent snapshot
//! let read = db.begin_read()?;
//! let table = read.table("measurements")?;
//! assert_eq!(1, table.size()?);
//! #
//! # Ok::<(), tdb::Error>(())
//! ```

#![doc(html_logo_url = "https://raw.githubusercontent.com/fjall-rs/tdb/main/logo.png")]
#![doc(html_favicon_url = "https://raw.githubusercontent.com/fjall-rs/tdb/main/logo.png")]
#![deny(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

#[doc(hidden)]
pub mod alloc;

#[doc(hidden)]
pub mod array;

#[doc(hidden)]
pub mod cluster;

mod codec;
mod db;
mod error;
mod file_header;
mod format_version;
mod group;
mod group_writer;

#[doc(hidden)]
pub mod interner;

mod keys;

#[doc(hidden)]
pub mod leaf;

#[doc(hidden)]
pub mod lockfile;

#[doc(hidden)]
pub mod mapper;

#[doc(hidden)]
pub mod node;

mod table;
mod transaction;
mod value;
mod verify;

pub use {
    codec::{PageCodec, CODEC_BLOCK_SIZE},
    db::{Config, Database},
    error::{Error, Result},
    file_header::MAGIC_BYTES,
    format_version::FormatVersion,
    group::TableType,
    group_writer::Durability,
    keys::{ColKey, CollectionKind, ColumnType, ObjKey, TableKey},
    table::{Dictionary, List, Object, SetCollection, Table},
    transaction::{ReadTransaction, Transaction, Version, WriteTransaction},
    value::{Decimal128, ObjectId, Timestamp, Uuid, Value},
};

#[doc(hidden)]
pub use alloc::Ref;
