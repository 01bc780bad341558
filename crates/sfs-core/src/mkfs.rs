//! Image formatting.

use sfs_alloc::allocate_block;
use sfs_block::{BlockBuf, BlockDevice};
use sfs_dir::init_dir_block;
use sfs_error::{Result, SfsError};
use sfs_inode::InodeCache;
use sfs_types::{
    BITS_PER_BLOCK, BLOCK_BITMAP_BLOCK, BLOCK_SIZE, BlockNumber, DEFAULT_DIR_PERMISSIONS,
    DIRECTORY_FLAG, EMPTY_DIR_SIZE, INODE_BITMAP_BLOCK, InodeNumber, METADATA_BLOCKS,
    ROOT_DIR_BLOCK,
};
use tracing::{debug, info};

/// Check that `dev` can hold a SimFS image.
pub(crate) fn check_geometry(dev: &dyn BlockDevice) -> Result<()> {
    let block_size = dev.block_size() as usize;
    if block_size != BLOCK_SIZE {
        return Err(SfsError::Format(format!(
            "block_size={block_size}, expected {BLOCK_SIZE}"
        )));
    }
    let count = dev.block_count();
    let max = BITS_PER_BLOCK as u64;
    if count <= METADATA_BLOCKS || count > max {
        return Err(SfsError::Format(format!(
            "block_count={count} outside supported range {}..={max}",
            METADATA_BLOCKS + 1
        )));
    }
    Ok(())
}

/// Lay down an empty filesystem: zeroed blocks, reserved metadata, and a
/// root directory holding only `.` and `..`.
pub(crate) fn format(dev: &dyn BlockDevice, cache: &InodeCache) -> Result<()> {
    check_geometry(dev)?;

    let zero = BlockBuf::zeroed();
    for block in 0..dev.block_count() {
        dev.write_block(BlockNumber(block), zero.as_slice())?;
    }
    cache.purge();

    for expected in 0..METADATA_BLOCKS {
        let got = allocate_block(dev)?;
        if got.0 != expected {
            return Err(SfsError::Corruption {
                block: BLOCK_BITMAP_BLOCK.0,
                detail: format!("reserving metadata block {expected} returned block {got}"),
            });
        }
    }
    debug!(reserved = METADATA_BLOCKS, "metadata blocks reserved");

    let root = cache.allocate(dev)?;
    if root.number() != InodeNumber::ROOT {
        return Err(SfsError::Corruption {
            block: INODE_BITMAP_BLOCK.0,
            detail: format!("root directory allocated as inode {}", root.number()),
        });
    }
    let block = allocate_block(dev)?;
    if block != ROOT_DIR_BLOCK {
        return Err(SfsError::Corruption {
            block: BLOCK_BITMAP_BLOCK.0,
            detail: format!("root directory allocated block {block}"),
        });
    }

    let mut buf = BlockBuf::zeroed();
    init_dir_block(buf.as_mut_slice(), InodeNumber::ROOT, InodeNumber::ROOT)?;
    dev.write_block(block, buf.as_slice())?;

    root.update(|inode| {
        inode.flags = DIRECTORY_FLAG;
        inode.size = EMPTY_DIR_SIZE;
        inode.link_count = 2;
        inode.permissions = DEFAULT_DIR_PERMISSIONS;
        inode.blocks[0] = Some(block);
    });
    root.persist(dev)?;
    root.release();
    dev.sync()?;

    info!(block_count = dev.block_count(), "filesystem formatted");
    Ok(())
}
