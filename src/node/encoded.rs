// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compressed integer payloads (Packed / Flex / Delta).
//!
//! Writers may compress an integer leaf during commit when it shrinks
//! the payload; readers decode all forms transparently. A compressed
//! node is expanded back to `WidthBits` on its first CoW mutation.

use super::bitpack::{
    get_unsigned_any_width, set_unsigned_any_width, sign_extend, signed_bits_for,
    unsigned_bits_for,
};
use super::header::Encoding;
use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Fixed prefix of a Flex payload
const FLEX_PREFIX: usize = 8;

/// Fixed prefix of a Delta payload
const DELTA_PREFIX: usize = 16;

/// Reads element `idx` from a compressed payload.
pub fn get(encoding: Encoding, width_code: u8, payload: &[u8], idx: usize) -> Result<i64> {
    match encoding {
        Encoding::Packed => {
            let width = width_code as usize;
            Ok(sign_extend(
                width,
                get_unsigned_any_width(payload, width, idx),
            ))
        }

        Encoding::Flex => {
            let (value_width, index_width, dict, indices) = flex_parts(payload)?;
            let value_idx = get_unsigned_any_width(indices, index_width, idx) as usize;
            Ok(sign_extend(
                value_width,
                get_unsigned_any_width(dict, value_width, value_idx),
            ))
        }

        Encoding::Delta => {
            let base = LittleEndian::read_i64(payload);
            let width = payload[8] as usize;
            let delta = get_unsigned_any_width(&payload[DELTA_PREFIX..], width, idx);
            Ok(base.wrapping_add(delta as i64))
        }

        _ => Err(Error::corrupt("not a compressed encoding")),
    }
}

/// Expands a compressed payload into plain values.
pub fn decode_all(
    encoding: Encoding,
    width_code: u8,
    payload: &[u8],
    count: usize,
) -> Result<Vec<i64>> {
    (0..count)
        .map(|i| get(encoding, width_code, payload, i))
        .collect()
}

fn flex_parts(payload: &[u8]) -> Result<(usize, usize, &[u8], &[u8])> {
    if payload.len() < FLEX_PREFIX {
        return Err(Error::corrupt("flex payload truncated"));
    }

    let value_count = LittleEndian::read_u32(payload) as usize;
    let value_width = payload[4] as usize;
    let index_width = payload[5] as usize;

    let dict_bytes = (value_count * value_width).div_ceil(8);
    let dict_end = FLEX_PREFIX + dict_bytes;

    if payload.len() < dict_end {
        return Err(Error::corrupt("flex dictionary truncated"));
    }

    Ok((
        value_width,
        index_width,
        &payload[FLEX_PREFIX..dict_end],
        &payload[dict_end..],
    ))
}

/// Result of a successful compression attempt
pub struct CompressedPayload {
    /// Chosen encoding
    pub encoding: Encoding,

    /// Raw bit width stored in the node's width field
    pub width_code: u8,

    /// Serialized payload bytes
    pub payload: Vec<u8>,
}

/// Tries to compress `values`; returns the smallest representation that
/// beats `plain_payload_len`, or `None`.
#[must_use]
pub fn try_compress(values: &[i64], plain_payload_len: usize) -> Option<CompressedPayload> {
    if values.is_empty() {
        return None;
    }

    let candidates = [
        packed_candidate(values),
        flex_candidate(values),
        delta_candidate(values),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter(|c| c.payload.len() < plain_payload_len)
        .min_by_key(|c| c.payload.len())
}

fn packed_candidate(values: &[i64]) -> Option<CompressedPayload> {
    let width = values.iter().copied().map(signed_bits_for).max()?;
    let mut payload = vec![0u8; (values.len() * width).div_ceil(8)];

    for (i, &v) in values.iter().enumerate() {
        let raw = if width == 64 {
            v as u64
        } else {
            (v as u64) & ((1u64 << width) - 1)
        };
        set_unsigned_any_width(&mut payload, width, i, raw);
    }

    Some(CompressedPayload {
        encoding: Encoding::Packed,
        width_code: width as u8,
        payload,
    })
}

fn flex_candidate(values: &[i64]) -> Option<CompressedPayload> {
    let mut dict: Vec<i64> = values.to_vec();
    dict.sort_unstable();
    dict.dedup();

    // a dictionary only pays off with repetition
    if dict.len() >= values.len() || dict.len() > u32::MAX as usize {
        return None;
    }

    let value_width = dict.iter().copied().map(signed_bits_for).max()?;
    let index_width = unsigned_bits_for(dict.len() as u64 - 1);

    let dict_bytes = (dict.len() * value_width).div_ceil(8);
    let index_bytes = (values.len() * index_width).div_ceil(8);
    let mut payload = vec![0u8; FLEX_PREFIX + dict_bytes + index_bytes];

    LittleEndian::write_u32(&mut payload, dict.len() as u32);
    payload[4] = value_width as u8;
    payload[5] = index_width as u8;

    {
        let dict_payload = &mut payload[FLEX_PREFIX..FLEX_PREFIX + dict_bytes];
        for (i, &v) in dict.iter().enumerate() {
            let raw = if value_width == 64 {
                v as u64
            } else {
                (v as u64) & ((1u64 << value_width) - 1)
            };
            set_unsigned_any_width(dict_payload, value_width, i, raw);
        }
    }

    {
        let index_payload = &mut payload[FLEX_PREFIX + dict_bytes..];
        for (i, &v) in values.iter().enumerate() {
            #[expect(clippy::expect_used, reason = "every value is in the dictionary")]
            let pos = dict.binary_search(&v).expect("value must be present");
            set_unsigned_any_width(index_payload, index_width, i, pos as u64);
        }
    }

    Some(CompressedPayload {
        encoding: Encoding::Flex,
        width_code: index_width as u8,
        payload,
    })
}

fn delta_candidate(values: &[i64]) -> Option<CompressedPayload> {
    let base = values.iter().copied().min()?;
    let span = values.iter().copied().max()?.checked_sub(base)?;

    let width = unsigned_bits_for(span as u64);
    let mut payload = vec![0u8; DELTA_PREFIX + (values.len() * width).div_ceil(8)];

    LittleEndian::write_i64(&mut payload, base);
    payload[8] = width as u8;

    for (i, &v) in values.iter().enumerate() {
        set_unsigned_any_width(
            &mut payload[DELTA_PREFIX..],
            width,
            i,
            (v.wrapping_sub(base)) as u64,
        );
    }

    Some(CompressedPayload {
        encoding: Encoding::Delta,
        width_code: width as u8,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[track_caller]
    #[expect(clippy::unwrap_used)]
    fn roundtrip(values: &[i64]) -> Option<Encoding> {
        let plain = values.len() * 8;
        let compressed = try_compress(values, plain)?;

        let decoded = decode_all(
            compressed.encoding,
            compressed.width_code,
            &compressed.payload,
            values.len(),
        )
        .unwrap();

        assert_eq!(values, decoded.as_slice());
        assert!(compressed.payload.len() < plain);
        Some(compressed.encoding)
    }

    #[test]
    fn small_range_compresses() {
        assert!(roundtrip(&[1, 2, 3, 4, 5, 6, 7, 8]).is_some());
    }

    #[test]
    fn repetitive_values_pick_flex() {
        let values: Vec<i64> = (0..256).map(|i| [7_000_000_000, -3, 12][i % 3]).collect();
        assert_eq!(Some(Encoding::Flex), roundtrip(&values));
    }

    #[test]
    fn clustered_values_pick_delta() {
        let values: Vec<i64> = (0..64).map(|i| 1_700_000_000_000 + i).collect();
        assert_eq!(Some(Encoding::Delta), roundtrip(&values));
    }

    #[test]
    fn negative_values_roundtrip() {
        assert!(roundtrip(&[-100, -50, -1, -100, -50, -1, -100, -50]).is_some());
    }

    #[test]
    fn incompressible_values_stay_plain() {
        // full-width random-ish values cannot shrink
        let values: Vec<i64> = (0..8)
            .map(|i| i64::MIN / 2 + i * 1_234_567_890_123)
            .collect();

        assert!(try_compress(&values, values.len() * 8).is_none());
    }

    #[test]
    fn empty_input() {
        assert!(try_compress(&[], 0).is_none());
    }
}
