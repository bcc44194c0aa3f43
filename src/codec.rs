//! Posting list compression.
//!
//! Trajectory ids are delta encoded (first value raw, wrapping 32-bit
//! differences after that) and every value is written as an LEB128 varint:
//! seven payload bits per byte, high bit set on every byte except the last.
//! Positions are written as plain varints.
//!
//! One block holds one entity's postings (id stream, then position stream).
//! Blocks are concatenated into a blob, each terminated by [`BLOCK_SENTINEL`].
//! The sentinel is a non-canonical encoding of zero; the encoder never emits
//! a continuation byte followed by a zero terminal byte, so the sentinel
//! cannot occur inside a block at any alignment.

use crate::{EntityId, Posting};
use std::collections::HashMap;
use thiserror::Error;

/// Terminator written after every block.
pub const BLOCK_SENTINEL: [u8; 4] = [0x80, 0x80, 0x80, 0x00];

/// Longest LEB128 encoding of a `u32`.
const MAX_VARINT_LEN: usize = 5;

/// Decoding failures for a single block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of block at byte {offset}")]
    UnexpectedEof { offset: usize },

    #[error("varint overflow at byte {offset}")]
    Overflow { offset: usize },

    #[error("non-canonical varint at byte {offset}")]
    NonCanonical { offset: usize },

    #[error("position {value} does not fit in 16 bits")]
    PositionOutOfRange { value: u32 },

    #[error("{remaining} bytes left after decoding {count} postings")]
    TrailingBytes { count: usize, remaining: usize },
}

// ============================================================================
// Varints
// ============================================================================

/// Append the LEB128 encoding of `value` to `buf`.
#[inline]
pub fn encode_varint(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode one LEB128 value from `buf` at `*pos`, advancing `*pos`.
#[inline]
pub fn decode_varint(buf: &[u8], pos: &mut usize) -> Result<u32, CodecError> {
    let start = *pos;
    let mut result: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = *buf
            .get(*pos)
            .ok_or(CodecError::UnexpectedEof { offset: *pos })?;
        *pos += 1;

        let payload = (byte & 0x7F) as u32;
        if i == MAX_VARINT_LEN - 1 && (payload > 0x0F || byte & 0x80 != 0) {
            return Err(CodecError::Overflow { offset: start });
        }
        result |= payload << (7 * i);
        if byte & 0x80 == 0 {
            if i > 0 && byte == 0 {
                return Err(CodecError::NonCanonical { offset: start });
            }
            return Ok(result);
        }
    }
    Err(CodecError::Overflow { offset: start })
}

// ============================================================================
// Arrays
// ============================================================================

/// Delta + varint encode trajectory ids sorted ascending.
pub fn encode_sorted_ids(ids: &[i32], buf: &mut Vec<u8>) {
    let mut prev: u32 = 0;
    for (i, &id) in ids.iter().enumerate() {
        let value = id as u32;
        let delta = if i == 0 { value } else { value.wrapping_sub(prev) };
        encode_varint(delta, buf);
        prev = value;
    }
}

/// Decode exactly `count` ids written by [`encode_sorted_ids`].
pub fn decode_sorted_ids(buf: &[u8], pos: &mut usize, count: usize) -> Result<Vec<i32>, CodecError> {
    let mut out = Vec::with_capacity(count);
    let mut prev: u32 = 0;
    for i in 0..count {
        let delta = decode_varint(buf, pos)?;
        let value = if i == 0 { delta } else { prev.wrapping_add(delta) };
        out.push(value as i32);
        prev = value;
    }
    Ok(out)
}

pub fn encode_positions(positions: &[u16], buf: &mut Vec<u8>) {
    for &p in positions {
        encode_varint(p as u32, buf);
    }
}

pub fn decode_positions(buf: &[u8], pos: &mut usize, count: usize) -> Result<Vec<u16>, CodecError> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let value = decode_varint(buf, pos)?;
        let p = u16::try_from(value).map_err(|_| CodecError::PositionOutOfRange { value })?;
        out.push(p);
    }
    Ok(out)
}

// ============================================================================
// Blocks
// ============================================================================

/// Encode one entity's postings (sorted by trajectory id) into a block,
/// without the sentinel.
pub fn encode_block(postings: &[Posting], buf: &mut Vec<u8>) {
    let ids: Vec<i32> = postings.iter().map(|p| p.trajectory_id).collect();
    let positions: Vec<u16> = postings.iter().map(|p| p.position).collect();
    encode_sorted_ids(&ids, buf);
    encode_positions(&positions, buf);
}

/// Decode a block holding exactly `count` postings.
pub fn decode_block(block: &[u8], count: usize) -> Result<Vec<Posting>, CodecError> {
    let mut pos = 0;
    let ids = decode_sorted_ids(block, &mut pos, count)?;
    let positions = decode_positions(block, &mut pos, count)?;
    if pos != block.len() {
        return Err(CodecError::TrailingBytes {
            count,
            remaining: block.len() - pos,
        });
    }
    Ok(ids
        .into_iter()
        .zip(positions)
        .map(|(trajectory_id, position)| Posting::new(trajectory_id, position))
        .collect())
}

/// Concatenate blocks, each followed by the sentinel.
pub fn encode_blob<'a, I>(lists: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [Posting]>,
{
    let mut blob = Vec::new();
    for list in lists {
        encode_block(list, &mut blob);
        blob.extend_from_slice(&BLOCK_SENTINEL);
    }
    blob
}

/// Byte range of one entity's block inside the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: usize,
    pub end: usize,
    pub count: u32,
}

/// Entity id → block range, built once when a compressed store is opened.
#[derive(Debug, Default)]
pub struct BlockIndex {
    ranges: HashMap<EntityId, BlockRange>,
}

impl BlockIndex {
    /// Scan `blob` for sentinels, pairing the i-th block with `ids[i]` and
    /// `counts[i]`. Missing blocks leave their ids unmapped.
    pub fn build(blob: &[u8], ids: &[EntityId], counts: &[u32]) -> Self {
        let mut ranges = HashMap::with_capacity(ids.len());
        let mut cursor = 0usize;
        for (i, (&id, &count)) in ids.iter().zip(counts).enumerate() {
            match find_sentinel(blob, cursor) {
                Some(end) => {
                    ranges.insert(
                        id,
                        BlockRange {
                            start: cursor,
                            end,
                            count,
                        },
                    );
                    cursor = end + BLOCK_SENTINEL.len();
                }
                None => {
                    log::warn!(
                        "[PostingCodec] Blob ends after {} of {} blocks",
                        i,
                        ids.len()
                    );
                    break;
                }
            }
        }
        if ids.len() != counts.len() {
            log::warn!(
                "[PostingCodec] {} ids but {} counts, extra entries ignored",
                ids.len(),
                counts.len()
            );
        }
        Self { ranges }
    }

    pub fn get(&self, id: EntityId) -> Option<BlockRange> {
        self.ranges.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn find_sentinel(blob: &[u8], from: usize) -> Option<usize> {
    blob.get(from..)?
        .windows(BLOCK_SENTINEL.len())
        .position(|w| w == BLOCK_SENTINEL)
        .map(|offset| from + offset)
}
