#![forbid(unsafe_code)]
//! Directory operations.
//!
//! Fixed-length directory entry codec, the `OpenDirectory` cursor for
//! sequential scans, name lookup, and appending entries to a directory.
//!
//! A directory's content is a packed array of 32-byte records (u16 inode
//! number, then a NUL-terminated name) spread over the inode's direct block
//! pointers. The first two records are always `.` and `..`. There is no
//! index and no deletion, so the recorded size is also the append position.

use serde::{Deserialize, Serialize};
use sfs_block::{BlockBuf, BlockDevice};
use sfs_error::{Result, SfsError};
use sfs_inode::{DiskInode, InodeCache, InodeHandle};
use sfs_types::{
    BLOCK_SIZE, BlockNumber, DIR_NAME_MAX, DIR_NAME_OFFSET, DIR_RECORD_SIZE, INODE_PTR_COUNT,
    InodeNumber, ParseError, ensure_slice, ensure_slice_mut, read_le_u16, trim_nul_padded,
    write_le_u16,
};
use std::fmt;
use tracing::trace;

const NAME_FIELD_LEN: usize = DIR_RECORD_SIZE - DIR_NAME_OFFSET;
#[allow(clippy::cast_possible_truncation)] // 32 fits u32
const RECORD_STEP: u32 = DIR_RECORD_SIZE as u32;

/// A decoded directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub inode: InodeNumber,
    pub name: String,
}

fn parse_err(err: &ParseError) -> SfsError {
    SfsError::Parse(err.to_string())
}

/// Check that `name` can be stored as a single entry name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SfsError::InvalidPath(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name.contains(['/', '\0']) {
        return Err(SfsError::InvalidPath(format!(
            "directory entry name {name:?} contains '/' or NUL"
        )));
    }
    if name.len() > DIR_NAME_MAX {
        return Err(SfsError::NameTooLong);
    }
    Ok(())
}

// ── Record codec ────────────────────────────────────────────────────────────

/// Write one record at `offset` in `block`, zero-padding the rest of it.
pub fn encode_entry(block: &mut [u8], offset: usize, ino: InodeNumber, name: &str) -> Result<()> {
    validate_name(name)?;
    let raw_ino = ino.to_dir_field().map_err(|e| parse_err(&e))?;
    let record =
        ensure_slice_mut(block, offset, DIR_RECORD_SIZE).map_err(|e| parse_err(&e))?;
    record.fill(0);
    write_le_u16(record, 0, raw_ino).map_err(|e| parse_err(&e))?;
    record[DIR_NAME_OFFSET..DIR_NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());
    Ok(())
}

/// Read the record at `offset` in `block`.
pub fn decode_entry(block: &[u8], offset: usize) -> Result<DirEntry> {
    let record = ensure_slice(block, offset, DIR_RECORD_SIZE).map_err(|e| parse_err(&e))?;
    let inode = read_le_u16(record, 0).map_err(|e| parse_err(&e))?;
    let name = ensure_slice(record, DIR_NAME_OFFSET, NAME_FIELD_LEN).map_err(|e| parse_err(&e))?;
    Ok(DirEntry {
        inode: InodeNumber(u32::from(inode)),
        name: trim_nul_padded(name),
    })
}

/// Initialize an empty directory block with `.` and `..` entries.
pub fn init_dir_block(
    block: &mut [u8],
    self_ino: InodeNumber,
    parent_ino: InodeNumber,
) -> Result<()> {
    if block.len() < 2 * DIR_RECORD_SIZE {
        return Err(SfsError::Format(
            "directory block too small for . and .. entries".to_owned(),
        ));
    }
    block.fill(0);
    encode_entry(block, 0, self_ino, ".")?;
    encode_entry(block, DIR_RECORD_SIZE, parent_ino, "..")?;
    Ok(())
}

// ── Capacity ────────────────────────────────────────────────────────────────

/// Whether another record fits within the direct block pointers.
#[must_use]
pub fn has_room(dir: &DiskInode) -> bool {
    (dir.size as usize) / BLOCK_SIZE < INODE_PTR_COUNT
}

/// Whether appending to `dir` starts a new data block.
#[must_use]
pub fn append_needs_block(dir: &DiskInode) -> bool {
    let size = dir.size as usize;
    size % BLOCK_SIZE == 0 && dir.block(size / BLOCK_SIZE).is_none()
}

fn corrupt(dir: InodeNumber, detail: String) -> SfsError {
    SfsError::Corruption {
        block: dir.table_location().0.0,
        detail,
    }
}

// ── Cursor ──────────────────────────────────────────────────────────────────

/// A directory opened for sequential reading.
///
/// Holds the directory's inode handle for its whole lifetime; dropping the
/// cursor (or calling [`close`](Self::close)) releases it.
pub struct OpenDirectory<'a> {
    dev: &'a dyn BlockDevice,
    handle: InodeHandle<'a>,
    offset: u32,
    failed: bool,
}

impl fmt::Debug for OpenDirectory<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenDirectory")
            .field("handle", &self.handle)
            .field("offset", &self.offset)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl<'a> OpenDirectory<'a> {
    /// Acquire `ino` and position the cursor at the first record.
    pub fn open(cache: &'a InodeCache, dev: &'a dyn BlockDevice, ino: InodeNumber) -> Result<Self> {
        let handle = cache.acquire(dev, ino)?;
        Ok(Self::from_handle(dev, handle))
    }

    /// Adopt a handle the caller already holds.
    #[must_use]
    pub fn from_handle(dev: &'a dyn BlockDevice, handle: InodeHandle<'a>) -> Self {
        Self {
            dev,
            handle,
            offset: 0,
            failed: false,
        }
    }

    #[must_use]
    pub fn inode(&self) -> &InodeHandle<'a> {
        &self.handle
    }

    /// Byte offset of the next record.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn seek(&mut self, offset: u32) {
        self.offset = offset;
        self.failed = false;
    }

    /// Next record, or `None` once the offset reaches the directory size.
    pub fn next_entry(&mut self) -> Result<Option<DirEntry>> {
        let dir = self.handle.get();
        if self.offset >= dir.size {
            return Ok(None);
        }

        let offset = self.offset as usize;
        let index = offset / BLOCK_SIZE;
        let Some(block) = dir.block(index) else {
            return Err(corrupt(
                dir.number,
                format!(
                    "directory size {} covers unmapped block pointer {index}",
                    dir.size
                ),
            ));
        };
        let buf = self.dev.read_block(block)?;
        let entry = decode_entry(buf.as_slice(), offset % BLOCK_SIZE)?;
        self.offset += RECORD_STEP;
        Ok(Some(entry))
    }

    /// Scan forward from the current position for `name`.
    pub fn lookup(&mut self, name: &str) -> Result<Option<DirEntry>> {
        while let Some(entry) = self.next_entry()? {
            if entry.name == name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Give back the underlying handle without releasing it.
    #[must_use]
    pub fn into_handle(self) -> InodeHandle<'a> {
        self.handle
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Iterator for OpenDirectory<'_> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let next = self.next_entry().transpose();
        if matches!(next, Some(Err(_))) {
            self.failed = true;
        }
        next
    }
}

// ── Append ──────────────────────────────────────────────────────────────────

/// Append `(ino, name)` to the directory behind `dir` and persist it.
///
/// When the record starts a new data block, `spare` must carry a block the
/// caller has already allocated; it becomes the next direct pointer. A
/// `spare` that is not needed is left untouched.
pub fn append_entry(
    dev: &dyn BlockDevice,
    dir: &InodeHandle<'_>,
    ino: InodeNumber,
    name: &str,
    spare: Option<BlockNumber>,
) -> Result<()> {
    validate_name(name)?;
    let inode = dir.get();
    if !has_room(&inode) {
        return Err(SfsError::NoSpace);
    }

    let size = inode.size as usize;
    let index = size / BLOCK_SIZE;
    let (block, mut buf) = if append_needs_block(&inode) {
        let block = spare.ok_or_else(|| {
            SfsError::Format(format!(
                "directory {} needs a fresh block for pointer {index}",
                inode.number
            ))
        })?;
        (block, BlockBuf::zeroed())
    } else {
        let block = inode.block(index).ok_or_else(|| {
            corrupt(
                inode.number,
                format!("append position {size} lies in unmapped block pointer {index}"),
            )
        })?;
        (block, dev.read_block(block)?)
    };

    encode_entry(buf.as_mut_slice(), size % BLOCK_SIZE, ino, name)?;
    dev.write_block(block, buf.as_slice())?;
    dir.update(|d| {
        d.blocks[index] = Some(block);
        d.size += RECORD_STEP;
    });
    dir.persist(dev)?;
    trace!(dir = inode.number.0, ino = ino.0, name, block = block.0, "directory entry appended");
    Ok(())
}
