// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur in the database core
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// The file is not a valid database (bad magic, bad selector,
    /// truncated file, or a corrupted node hit mid-traversal)
    InvalidDatabase(String),

    /// File format version outside the supported window
    UnsupportedFileFormat(u8),

    /// Allocation failure in slab space
    OutOfMemory,

    /// File extension failed because the device is full
    OutOfDisk,

    /// A non-blocking lock attempt failed
    Locked,

    /// Operation is not valid in the current transaction state
    WrongTransactState,

    /// ObjKey / TableKey / ColKey not present
    KeyNotFound,

    /// API misuse (wrong column type, out-of-range position, ...)
    LogicError(String),

    /// Primary-key duplicate, strong-link violation or unique index duplicate
    ConstraintViolation(String),

    /// Attempted reference across ownership domains
    CrossTableLinkTarget,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TdbError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.raw_os_error() {
            // ENOSPC is surfaced as its own kind so callers can
            // distinguish a full device from general I/O failure
            Some(28) => Self::OutOfDisk,
            _ => Self::Io(value),
        }
    }
}

/// Database result
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::InvalidDatabase(msg.into())
    }

    pub(crate) fn logic(msg: impl Into<String>) -> Self {
        Self::LogicError(msg.into())
    }
}
