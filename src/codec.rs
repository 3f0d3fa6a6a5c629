// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Result;

/// Block granularity of the page codec
pub const CODEC_BLOCK_SIZE: usize = 4096;

/// Optional transform applied to fixed 4 KiB blocks beneath the file
/// mapper (encryption at rest, integrity checking, ...)
///
/// The codec is invisible to every layer above the mapper; node reads and
/// writes always see cleartext. Implementations must be position
/// independent only in so far as the same `block_index` is always handed
/// the same file region.
pub trait PageCodec: Send + Sync {
    /// Transforms a block read from the file into cleartext, in place.
    fn decode_block(&self, block_index: u64, block: &mut [u8; CODEC_BLOCK_SIZE]) -> Result<()>;

    /// Transforms a cleartext block into its on-disk form, in place.
    fn encode_block(&self, block_index: u64, block: &mut [u8; CODEC_BLOCK_SIZE]) -> Result<()>;
}
