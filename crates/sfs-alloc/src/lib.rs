#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! Each resource class owns exactly one bitmap block on the image. Bit *i*
//! (byte `i / 8`, bit `i % 8`, least significant first) set means resource
//! *i* is in use.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on a bitmap byte slice.
//! 2. **BitmapAllocator**: lowest-free-index allocation over one persisted
//!    bitmap block, with every mutation written back before returning.
//! 3. **`allocate_block` / `allocate_inode_slot`**: the two entry points the
//!    rest of the filesystem uses.

use sfs_block::BlockDevice;
use sfs_error::{Resource, Result, SfsError};
use sfs_types::{
    BITS_PER_BLOCK, BLOCK_BITMAP_BLOCK, BlockNumber, INODE_BITMAP_BLOCK, INODE_COUNT, InodeNumber,
};
use tracing::{trace, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    bitmap_set_bit(bitmap, idx, true);
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    bitmap_set_bit(bitmap, idx, false);
}

/// Write `value` into bit `idx`. Indices past the end of the slice are ignored.
pub fn bitmap_set_bit(bitmap: &mut [u8], idx: u32, value: bool) {
    let byte_idx = (idx / 8) as usize;
    let mask = 1_u8 << (idx % 8);
    let Some(byte) = bitmap.get_mut(byte_idx) else {
        return;
    };
    if value {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// Lowest clear bit anywhere in `bitmap`.
#[must_use]
pub fn bitmap_find_first_clear(bitmap: &[u8]) -> Option<u32> {
    let bits = u32::try_from(bitmap.len().saturating_mul(8)).unwrap_or(u32::MAX);
    bitmap_find_first_clear_within(bitmap, bits)
}

/// Lowest clear bit among the first `limit` bits of `bitmap`.
///
/// Fully allocated bytes (`0xFF`) are skipped whole before falling back to a
/// bit-by-bit scan of the first byte that has room.
#[must_use]
pub fn bitmap_find_first_clear_within(bitmap: &[u8], limit: u32) -> Option<u32> {
    let byte_limit = (limit as usize).div_ceil(8).min(bitmap.len());
    let (byte_idx, byte) = bitmap
        .iter()
        .take(byte_limit)
        .enumerate()
        .find(|(_, byte)| **byte != 0xFF)?;
    let idx = u32::try_from(byte_idx).ok()? * 8 + byte.trailing_ones();
    (idx < limit).then_some(idx)
}

// ── Persisted bitmap allocator ──────────────────────────────────────────────

/// One on-disk bitmap block governing a resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapAllocator {
    bitmap_block: BlockNumber,
    resource: Resource,
    capacity: u32,
}

impl BitmapAllocator {
    /// The data-block bitmap, capped at the device's block count.
    #[must_use]
    pub fn block_map(dev: &dyn BlockDevice) -> Self {
        let bits = u64::try_from(BITS_PER_BLOCK).unwrap_or(u64::MAX);
        let capacity = u32::try_from(dev.block_count().min(bits)).unwrap_or(u32::MAX);
        Self {
            bitmap_block: BLOCK_BITMAP_BLOCK,
            resource: Resource::Block,
            capacity,
        }
    }

    /// The inode bitmap, capped at the inode table size.
    #[must_use]
    pub fn inode_map() -> Self {
        Self {
            bitmap_block: INODE_BITMAP_BLOCK,
            resource: Resource::Inode,
            capacity: INODE_COUNT,
        }
    }

    #[must_use]
    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// Number of indices this bitmap hands out.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn load(&self, dev: &dyn BlockDevice) -> Result<Vec<u8>> {
        Ok(dev.read_block(self.bitmap_block)?.into_inner())
    }

    /// Claim the lowest free index and persist the bitmap.
    pub fn alloc(&self, dev: &dyn BlockDevice) -> Result<u32> {
        let mut bitmap = self.load(dev)?;
        let Some(idx) = bitmap_find_first_clear_within(&bitmap, self.capacity) else {
            warn!(resource = %self.resource, capacity = self.capacity, "bitmap exhausted");
            return Err(SfsError::AllocationExhausted(self.resource));
        };
        bitmap_set(&mut bitmap, idx);
        dev.write_block(self.bitmap_block, &bitmap)?;
        trace!(resource = %self.resource, idx, "allocated");
        Ok(idx)
    }

    /// Clear `idx` and persist the bitmap.
    pub fn free(&self, dev: &dyn BlockDevice, idx: u32) -> Result<()> {
        if idx >= self.capacity {
            return Err(SfsError::Format(format!(
                "{} index {idx} outside bitmap capacity {}",
                self.resource, self.capacity
            )));
        }
        let mut bitmap = self.load(dev)?;
        bitmap_clear(&mut bitmap, idx);
        dev.write_block(self.bitmap_block, &bitmap)?;
        trace!(resource = %self.resource, idx, "freed");
        Ok(())
    }

    pub fn is_allocated(&self, dev: &dyn BlockDevice, idx: u32) -> Result<bool> {
        Ok(bitmap_get(&self.load(dev)?, idx))
    }

    pub fn count_free(&self, dev: &dyn BlockDevice) -> Result<u32> {
        Ok(bitmap_count_free(&self.load(dev)?, self.capacity))
    }
}

/// Claim the lowest free data block.
pub fn allocate_block(dev: &dyn BlockDevice) -> Result<BlockNumber> {
    BitmapAllocator::block_map(dev)
        .alloc(dev)
        .map(|idx| BlockNumber(u64::from(idx)))
}

/// Claim the lowest free inode number.
pub fn allocate_inode_slot(dev: &dyn BlockDevice) -> Result<InodeNumber> {
    BitmapAllocator::inode_map().alloc(dev).map(InodeNumber)
}

// ── Tests ───────────────────────────────────────────────────────────────────
