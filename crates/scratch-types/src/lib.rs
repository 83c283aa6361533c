#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_128;

/// Blocks start on multiples of this within a file; the address packing
/// counts offsets in units of it.
pub const BLOCK_ALIGNMENT: u64 = 4096;

/// On-disk block header length. The hash comes first so the payload starts
/// 16-byte aligned.
pub const HEADER_SIZE: u64 = 32;

/// Highest file id a `BlockAddress` can carry.
pub const MAX_FILE_COUNT: u32 = 1023;

/// Multiplier of the address packing: `packed = file + slot * 1024`.
pub const ADDRESS_FACTOR: u32 = MAX_FILE_COUNT + 1;

pub const MIN_FILE_SIZE: u64 = BLOCK_ALIGNMENT;

/// Largest file length addressable through the 32-bit packing:
/// `ceil(2^32 / 1024) * 4096` bytes, about 16 GiB.
pub const MAX_FILE_SIZE: u64 = ((1_u64 << 32).div_ceil(ADDRESS_FACTOR as u64)) * BLOCK_ALIGNMENT;

/// Largest payload a single block may carry.
pub const MAX_CONTENT_LENGTH: u64 = i32::MAX as u64 - HEADER_SIZE;

/// Only the low 24 bits of a realm are significant.
pub const REALM_MASK: u32 = 0x00FF_FFFF;

/// Round a byte count up to the next block boundary.
#[must_use]
pub fn align_to_block(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_ALIGNMENT) * BLOCK_ALIGNMENT
}

/// 128-bit content hash, handled as two 64-bit halves.
///
/// Equality is bitwise; the type carries no ordering. The `right` half feeds
/// the index bucket derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash128 {
    pub left: u64,
    pub right: u64,
}

impl Hash128 {
    pub const ZERO: Self = Self { left: 0, right: 0 };

    #[must_use]
    pub fn new(left: u64, right: u64) -> Self {
        Self { left, right }
    }

    /// Hash a payload with XXH3-128. `left` is the high half.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let value = xxh3_128(bytes);
        Self {
            left: (value >> 64) as u64,
            right: value as u64,
        }
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl fmt::Display for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.left, self.right)
    }
}

/// Identifier of one file in the wheel, in `[1, 1023]`.
///
/// Zero is reserved so that the all-zeros `BlockAddress` stays invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(u32);

impl FileId {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if value == 0 || value > MAX_FILE_COUNT {
            return Err(ParseError::InvalidField {
                field: "file_id",
                reason: "must be in 1..=1023",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packed (file, offset) pair: `packed = file + (offset / 4096) * 1024`.
///
/// The all-zeros value is `NONE`; valid addresses are never zero because the
/// file id is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockAddress(u32);

impl BlockAddress {
    pub const NONE: Self = Self(0);

    pub fn new(file: FileId, offset: u64) -> Result<Self, ParseError> {
        if offset % BLOCK_ALIGNMENT != 0 {
            return Err(ParseError::InvalidField {
                field: "offset",
                reason: "must be a multiple of 4096",
            });
        }
        let slot = offset / BLOCK_ALIGNMENT;
        let packed = u64::from(file.get()) + slot * u64::from(ADDRESS_FACTOR);
        let packed = u32::try_from(packed).map_err(|_| ParseError::InvalidField {
            field: "offset",
            reason: "exceeds the 32-bit address packing",
        })?;
        Ok(Self(packed))
    }

    /// Rebuild an address from its packed form, e.g. out of an index slot.
    #[must_use]
    pub fn from_packed(packed: u32) -> Self {
        Self(packed)
    }

    #[must_use]
    pub fn packed(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// File id part. Meaningless on `NONE`.
    #[must_use]
    pub fn file(self) -> u32 {
        self.0 % ADDRESS_FACTOR
    }

    /// Byte offset part. Meaningless on `NONE`.
    #[must_use]
    pub fn offset(self) -> u64 {
        u64::from(self.0 / ADDRESS_FACTOR) * BLOCK_ALIGNMENT
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "(none)")
        } else {
            write!(f, "({}, {:#x})", self.file(), self.offset())
        }
    }
}

/// 32-byte on-disk block header.
///
/// Layout (little-endian): hash.left (8), hash.right (8), realm (4),
/// rank (4, signed), content_length (4, signed), 4 bytes zero padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: Hash128,
    pub realm: u32,
    pub rank: i32,
    pub content_length: i32,
}

impl BlockHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let left = read_le_u64(data, 0)?;
        let right = read_le_u64(data, 8)?;
        let realm = read_le_u32(data, 16)?;
        let rank = read_le_i32(data, 20)?;
        let content_length = read_le_i32(data, 24)?;
        Ok(Self {
            hash: Hash128::new(left, right),
            realm,
            rank,
            content_length,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0_u8; HEADER_SIZE as usize];
        out[0..8].copy_from_slice(&self.hash.left.to_le_bytes());
        out[8..16].copy_from_slice(&self.hash.right.to_le_bytes());
        out[16..20].copy_from_slice(&self.realm.to_le_bytes());
        out[20..24].copy_from_slice(&self.rank.to_le_bytes());
        out[24..28].copy_from_slice(&self.content_length.to_le_bytes());
        out
    }

    /// Total on-disk footprint of this block including padding.
    #[must_use]
    pub fn padded_length(&self) -> u64 {
        align_to_block(HEADER_SIZE + self.content_length.max(0) as u64)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}
