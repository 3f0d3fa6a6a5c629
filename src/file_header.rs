// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::format_version::{
    FormatVersion, CURRENT_FORMAT_VERSION, MIN_SUPPORTED_FORMAT_VERSION,
};
use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Magic stamp at bytes 18..22 of every database file
pub const MAGIC_BYTES: [u8; 4] = *b"T-DB";

/// Size of the fixed file header preceding the first node
pub const HEADER_SIZE: usize = 24;

/// Byte offset of the selector within the file
pub const SELECTOR_OFFSET: usize = 16;

/// The 24-byte stamp at the start of every database file
///
/// ```text
/// bytes  0..8   top-ref slot A (u64 LE)
/// bytes  8..16  top-ref slot B (u64 LE)
/// byte  16      selector (0 => A, 1 => B)
/// byte  17      file format version
/// bytes 18..22  magic "T-DB"
/// bytes 22..24  zero padding
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FileHeader {
    /// Top-ref slot A
    pub top_ref_a: u64,

    /// Top-ref slot B
    pub top_ref_b: u64,

    /// Which slot is live (0 or 1)
    pub selector: u8,

    /// On-disk format version
    pub version: FormatVersion,
}

impl FileHeader {
    /// Header of a freshly initialized (empty) database.
    #[must_use]
    pub fn new_file() -> Self {
        Self {
            top_ref_a: 0,
            top_ref_b: 0,
            selector: 0,
            version: CURRENT_FORMAT_VERSION,
        }
    }

    /// Returns the live top ref.
    #[must_use]
    pub fn live_top_ref(&self) -> u64 {
        if self.selector == 0 {
            self.top_ref_a
        } else {
            self.top_ref_b
        }
    }

    /// Encodes into the fixed 24-byte layout.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.top_ref_a);
        LittleEndian::write_u64(&mut buf[8..16], self.top_ref_b);
        buf[16] = self.selector;
        buf[17] = self.version.into();
        buf[18..22].copy_from_slice(&MAGIC_BYTES);
        buf
    }

    /// Decodes and validates the stamp of an existing file.
    ///
    /// A wrong magic, a truncated file or a selector byte outside {0, 1}
    /// is [`Error::InvalidDatabase`]; an unknown format version is
    /// [`Error::UnsupportedFileFormat`]. The file is never modified.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corrupt(format!(
                "file too short for header: {} bytes",
                buf.len(),
            )));
        }

        if buf[18..22] != MAGIC_BYTES {
            return Err(Error::corrupt("magic bytes do not match"));
        }

        let selector = buf[16];
        if selector > 1 {
            return Err(Error::corrupt(format!("invalid selector byte {selector:#04x}")));
        }

        let raw_version = buf[17];
        let version = FormatVersion::try_from(raw_version)
            .map_err(|()| Error::UnsupportedFileFormat(raw_version))?;

        if version < MIN_SUPPORTED_FORMAT_VERSION {
            return Err(Error::UnsupportedFileFormat(raw_version));
        }

        Ok(Self {
            top_ref_a: LittleEndian::read_u64(&buf[0..8]),
            top_ref_b: LittleEndian::read_u64(&buf[8..16]),
            selector,
            version,
        })
    }

    /// Returns `true` if the file needs an in-place upgrade (performed
    /// inside the first write transaction).
    #[must_use]
    pub fn needs_upgrade(&self) -> bool {
        self.version < CURRENT_FORMAT_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    #[expect(clippy::unwrap_used)]
    fn header_roundtrip() {
        let header = FileHeader {
            top_ref_a: 24,
            top_ref_b: 1024,
            selector: 1,
            version: CURRENT_FORMAT_VERSION,
        };

        let buf = header.encode();
        assert_eq!(header, FileHeader::decode(&buf).unwrap());
        assert_eq!(1024, header.live_top_ref());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = FileHeader::new_file().encode();
        buf[19] = b'X';

        assert!(matches!(
            FileHeader::decode(&buf),
            Err(Error::InvalidDatabase(_))
        ));
    }

    #[test]
    fn rejects_bad_selector() {
        let mut buf = FileHeader::new_file().encode();
        buf[SELECTOR_OFFSET] = 0xFF;

        assert!(matches!(
            FileHeader::decode(&buf),
            Err(Error::InvalidDatabase(_))
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = FileHeader::new_file().encode();
        buf[17] = 99;

        assert!(matches!(
            FileHeader::decode(&buf),
            Err(Error::UnsupportedFileFormat(99))
        ));
    }

    #[test]
    fn rejects_truncation() {
        let buf = FileHeader::new_file().encode();

        assert!(matches!(
            FileHeader::decode(&buf[0..10]),
            Err(Error::InvalidDatabase(_))
        ));
    }
}
