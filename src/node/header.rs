// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Size of the fixed header every persistent node begins with
pub const NODE_HEADER_SIZE: usize = 8;

/// Maximum element count representable in the 24-bit count field
pub const MAX_ELEMENT_COUNT: usize = (1 << 24) - 1;

/// Maximum node capacity representable in the 16-bit word-count field
pub const MAX_NODE_CAPACITY: usize = ((1 << 16) - 1) * 8;

/// Constant stored in the reserved header byte
const RESERVED_BYTE: u8 = 0x41;

bitflags::bitflags! {
    /// Node flag bits
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct NodeFlags: u8 {
        /// Even, non-zero payload elements are child refs
        const HAS_REFS = 0b0001;

        /// Free bit interpreted by the owning structure
        const CONTEXT = 0b0010;

        /// The node is a B+tree inner node (ref/offset interleaving)
        const INNER_BPTREE = 0b0100;
    }
}

/// Payload encoding of a node
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Encoding {
    /// Bit-packed signed integers at one of the eight canonical widths
    WidthBits,

    /// Byte-packed fixed-size elements (`width` = bytes per element)
    WidthMultiply,

    /// Width field is meaningless (count-only nodes)
    WidthIgnore,

    /// Compressed: same values at the minimal bit width
    Packed,

    /// Compressed: sorted value dictionary + per-element indices
    Flex,

    /// Compressed: base value + bit-packed unsigned deltas
    Delta,
}

impl From<Encoding> for u8 {
    fn from(value: Encoding) -> Self {
        match value {
            Encoding::WidthBits => 0,
            Encoding::WidthMultiply => 1,
            Encoding::WidthIgnore => 2,
            Encoding::Packed => 3,
            Encoding::Flex => 4,
            Encoding::Delta => 5,
        }
    }
}

impl TryFrom<u8> for Encoding {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        Ok(match value {
            0 => Self::WidthBits,
            1 => Self::WidthMultiply,
            2 => Self::WidthIgnore,
            3 => Self::Packed,
            4 => Self::Flex,
            5 => Self::Delta,
            _ => return Err(()),
        })
    }
}

/// Maps a `WidthBits` width code (0..=7) to its bit count.
#[must_use]
pub fn bits_for_code(code: u8) -> usize {
    match code {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 4,
        4 => 8,
        5 => 16,
        6 => 32,
        _ => 64,
    }
}

/// Maps a bit count to its `WidthBits` width code.
#[must_use]
pub fn code_for_bits(bits: usize) -> u8 {
    match bits {
        0 => 0,
        1 => 1,
        2 => 2,
        4 => 3,
        8 => 4,
        16 => 5,
        32 => 6,
        _ => 7,
    }
}

/// Smallest canonical bit width that can hold `v`.
///
/// Widths 1/2/4 are zero-extended and therefore unsigned; any negative
/// value needs at least 8 bits.
#[must_use]
pub fn bits_for_value(v: i64) -> usize {
    if v == 0 {
        0
    } else if (0..2).contains(&v) {
        1
    } else if (0..4).contains(&v) {
        2
    } else if (0..16).contains(&v) {
        4
    } else if (-0x80..0x80).contains(&v) {
        8
    } else if (-0x8000..0x8000).contains(&v) {
        16
    } else if (-0x8000_0000..0x8000_0000).contains(&v) {
        32
    } else {
        64
    }
}

/// Bytes of payload needed to bit-pack `count` elements of `width_bits`,
/// rounded up to whole bytes.
#[must_use]
pub fn packed_byte_len(count: usize, width_bits: usize) -> usize {
    (count * width_bits).div_ceil(8)
}

/// The self-describing fixed header of every persistent node
///
/// Bit layout of the little-endian u64:
///
/// ```text
/// bits  0..24  element count
/// bits 24..40  capacity in 8-byte words (including the header word)
/// bits 40..44  flags (has_refs, context, inner_bptree, reserved)
/// bits 44..48  encoding
/// bits 48..56  width code
/// bits 56..64  reserved, stored constant
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeHeader {
    /// Number of payload elements
    pub count: usize,

    /// Allocated size in bytes, including this header, multiple of 8
    pub capacity: usize,

    /// Flag bits
    pub flags: NodeFlags,

    /// Payload encoding
    pub encoding: Encoding,

    /// Width code (bits code for `WidthBits`/compressed, byte count for
    /// `WidthMultiply`)
    pub width_code: u8,
}

impl NodeHeader {
    /// Encodes into the 8-byte on-disk form.
    #[must_use]
    pub fn encode(&self) -> [u8; NODE_HEADER_SIZE] {
        debug_assert!(self.count <= MAX_ELEMENT_COUNT);
        debug_assert!(self.capacity % 8 == 0);

        let mut v = self.count as u64;
        v |= ((self.capacity / 8) as u64) << 24;
        v |= u64::from(self.flags.bits()) << 40;
        v |= u64::from(u8::from(self.encoding)) << 44;
        v |= u64::from(self.width_code) << 48;
        v |= u64::from(RESERVED_BYTE) << 56;

        let mut buf = [0u8; NODE_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf, v);
        buf
    }

    /// Decodes and sanity-checks an on-disk header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < NODE_HEADER_SIZE {
            return Err(Error::corrupt("node header truncated"));
        }

        let v = LittleEndian::read_u64(buf);

        let count = (v & 0xFF_FFFF) as usize;
        let capacity = ((v >> 24) & 0xFFFF) as usize * 8;
        let flags = NodeFlags::from_bits_truncate(((v >> 40) & 0xF) as u8);
        let encoding = Encoding::try_from(((v >> 44) & 0xF) as u8)
            .map_err(|()| Error::corrupt("unknown node encoding"))?;
        let width_code = ((v >> 48) & 0xFF) as u8;

        if capacity < NODE_HEADER_SIZE {
            return Err(Error::corrupt("node capacity smaller than header"));
        }

        let header = Self {
            count,
            capacity,
            flags,
            encoding,
            width_code,
        };

        if header.encoding == Encoding::WidthBits
            && packed_byte_len(count, header.width_bits()) > capacity - NODE_HEADER_SIZE
        {
            return Err(Error::corrupt("node payload exceeds capacity"));
        }

        Ok(header)
    }

    /// Element width in bits (only meaningful for `WidthBits` and the
    /// compressed encodings).
    #[must_use]
    pub fn width_bits(&self) -> usize {
        bits_for_code(self.width_code)
    }

    /// Element width in bytes (only meaningful for `WidthMultiply`).
    #[must_use]
    pub fn width_bytes(&self) -> usize {
        self.width_code as usize
    }

    /// Returns `true` if payload elements may be child refs.
    #[must_use]
    pub fn has_refs(&self) -> bool {
        self.flags.contains(NodeFlags::HAS_REFS)
    }

    /// Returns `true` if this is a B+tree inner node.
    #[must_use]
    pub fn is_inner_bptree(&self) -> bool {
        self.flags.contains(NodeFlags::INNER_BPTREE)
    }

    /// Returns the context flag.
    #[must_use]
    pub fn context_flag(&self) -> bool {
        self.flags.contains(NodeFlags::CONTEXT)
    }
}
