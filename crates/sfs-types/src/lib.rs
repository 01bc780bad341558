#![forbid(unsafe_code)]
//! Layout constants, unit-carrying newtypes, and fixed-width packing helpers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Image geometry ──────────────────────────────────────────────────────────

/// Size of every block on the image.
pub const BLOCK_SIZE: usize = 4096;
/// Number of bitmap bits held by one block.
pub const BITS_PER_BLOCK: usize = BLOCK_SIZE * 8;
/// Block count of a default image (4 MiB).
pub const BLOCK_COUNT: u64 = 1024;

pub const INODE_BITMAP_BLOCK: BlockNumber = BlockNumber(1);
pub const BLOCK_BITMAP_BLOCK: BlockNumber = BlockNumber(2);
pub const INODE_TABLE_FIRST_BLOCK: BlockNumber = BlockNumber(3);
pub const INODE_TABLE_BLOCKS: u64 = 4;
/// Leading blocks that are never handed out as data (0 through 6).
pub const METADATA_BLOCKS: u64 = 7;
/// Data block bootstrap assigns to the root directory.
pub const ROOT_DIR_BLOCK: BlockNumber = BlockNumber(METADATA_BLOCKS);

// ── Inode records ───────────────────────────────────────────────────────────

pub const INODE_SIZE: usize = 64;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
#[allow(clippy::cast_possible_truncation)] // 4 * 64 fits u32
pub const INODE_COUNT: u32 = (INODE_TABLE_BLOCKS as usize * INODES_PER_BLOCK) as u32;
/// Direct block pointers per inode. There are no indirect pointers.
pub const INODE_PTR_COUNT: usize = 12;

/// Set in `DiskInode::flags` for directories.
pub const DIRECTORY_FLAG: u8 = 2;
pub const DEFAULT_DIR_PERMISSIONS: u16 = 0o755;

// ── Directory records ───────────────────────────────────────────────────────

pub const DIR_RECORD_SIZE: usize = 32;
/// The name field begins after the u16 inode number.
pub const DIR_NAME_OFFSET: usize = 2;
/// Longest storable name; the field also needs its terminating NUL.
pub const DIR_NAME_MAX: usize = DIR_RECORD_SIZE - DIR_NAME_OFFSET - 1;
/// Records that fit in one directory data block.
pub const DIR_RECORDS_PER_BLOCK: usize = BLOCK_SIZE / DIR_RECORD_SIZE;
/// Content size of a freshly created directory holding `.` and `..`.
#[allow(clippy::cast_possible_truncation)] // 64 fits u32
pub const EMPTY_DIR_SIZE: u32 = (2 * DIR_RECORD_SIZE) as u32;

/// Default number of in-core inode slots.
pub const DEFAULT_CACHE_SLOTS: usize = 64;

// ── Newtypes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// Byte offset into the image.
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl InodeNumber {
    pub const ROOT: Self = Self(0);

    /// Narrow to the u16 stored in directory records.
    pub fn to_dir_field(self) -> Result<u16, ParseError> {
        u16::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "inode_number",
        })
    }

    /// Position of this inode in the inode table: (table block, byte offset in block).
    #[must_use]
    pub fn table_location(self) -> (BlockNumber, usize) {
        let index = self.0 as usize;
        let block = INODE_TABLE_FIRST_BLOCK.0 + (index / INODES_PER_BLOCK) as u64;
        (BlockNumber(block), (index % INODES_PER_BLOCK) * INODE_SIZE)
    }
}

impl BlockNumber {
    /// Byte offset of the first byte of this block.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<ByteOffset> {
        self.0.checked_mul(BLOCK_SIZE as u64).map(ByteOffset)
    }
}

impl ByteOffset {
    /// Block containing this byte (truncating).
    #[must_use]
    pub fn to_block(self) -> BlockNumber {
        BlockNumber(self.0 / BLOCK_SIZE as u64)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Block pointer representation ────────────────────────────────────────────
//
// Inode block pointers are stored on disk as u32 byte offsets into the image,
// with 0 meaning "unmapped" (block 0 is reserved, so its offset never names
// data). These two functions are the only place the representations meet.

/// Encode a block number as the on-disk byte-offset pointer.
pub fn block_index_to_offset(block: BlockNumber) -> Result<u32, ParseError> {
    let offset = block
        .to_byte_offset()
        .ok_or(ParseError::IntegerConversion {
            field: "block_pointer",
        })?;
    u32::try_from(offset.0).map_err(|_| ParseError::IntegerConversion {
        field: "block_pointer",
    })
}

/// Decode an on-disk byte-offset pointer. Returns `None` for an unmapped slot.
#[must_use]
pub fn offset_to_block_index(offset: u32) -> Option<BlockNumber> {
    if offset == 0 {
        return None;
    }
    Some(ByteOffset(u64::from(offset)).to_block())
}

// ── Packing ─────────────────────────────────────────────────────────────────

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
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

fn checked_end(data_len: usize, offset: usize, len: usize) -> Result<usize, ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data_len {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data_len.saturating_sub(offset),
        });
    }
    Ok(end)
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = checked_end(data.len(), offset, len)?;
    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let end = checked_end(data.len(), offset, len)?;
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Interpret `bytes` as a NUL-terminated string; no terminator means the whole slice.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
