//! Directory creation.

use crate::path::{resolve, split_path, validate};
use sfs_alloc::{BitmapAllocator, allocate_block};
use sfs_block::{BlockBuf, BlockDevice};
use sfs_dir::{
    OpenDirectory, append_entry, append_needs_block, has_room, init_dir_block, validate_name,
};
use sfs_error::{Result, SfsError};
use sfs_inode::{InodeCache, InodeHandle};
use sfs_types::{
    BlockNumber, DEFAULT_DIR_PERMISSIONS, DIRECTORY_FLAG, EMPTY_DIR_SIZE, InodeNumber,
};
use tracing::{debug, warn};

/// Bits claimed by one directory make, freed again if it fails.
#[derive(Debug, Default)]
struct Claimed {
    inode: Option<InodeNumber>,
    blocks: Vec<BlockNumber>,
}

impl Claimed {
    fn rollback(self, dev: &dyn BlockDevice) {
        let blocks = BitmapAllocator::block_map(dev);
        for block in self.blocks.into_iter().rev() {
            let freed = u32::try_from(block.0)
                .map_err(|_| SfsError::Format(format!("block {block} outside bitmap")))
                .and_then(|idx| blocks.free(dev, idx));
            match freed {
                Ok(()) => warn!(block = block.0, "released block claimed by failed mkdir"),
                Err(err) => warn!(block = block.0, error = %err, "could not release block"),
            }
        }
        if let Some(ino) = self.inode {
            match BitmapAllocator::inode_map().free(dev, ino.0) {
                Ok(()) => warn!(ino = ino.0, "released inode claimed by failed mkdir"),
                Err(err) => warn!(ino = ino.0, error = %err, "could not release inode"),
            }
        }
    }
}

/// Create an empty directory at `path` and link it into its parent.
pub(crate) fn make_directory(
    dev: &dyn BlockDevice,
    cache: &InodeCache,
    path: &str,
) -> Result<InodeNumber> {
    if !validate(path) {
        return Err(SfsError::InvalidPath(path.to_owned()));
    }
    let (parent_path, name) = split_path(path);
    validate_name(name)?;

    let parent = resolve(cache, dev, parent_path)?;
    if !parent.is_dir() {
        return Err(SfsError::NotDirectory);
    }
    let mut scan = OpenDirectory::from_handle(dev, parent);
    if scan.lookup(name)?.is_some() {
        return Err(SfsError::Exists);
    }
    let parent = scan.into_handle();
    if !has_room(&parent.get()) {
        return Err(SfsError::NoSpace);
    }

    let mut claimed = Claimed::default();
    match link_new_directory(dev, cache, &parent, name, &mut claimed) {
        Ok(ino) => {
            debug!(path, ino = ino.0, parent = parent.number().0, "directory created");
            Ok(ino)
        }
        Err(err) => {
            claimed.rollback(dev);
            Err(err)
        }
    }
}

fn link_new_directory(
    dev: &dyn BlockDevice,
    cache: &InodeCache,
    parent: &InodeHandle<'_>,
    name: &str,
    claimed: &mut Claimed,
) -> Result<InodeNumber> {
    let child = cache.allocate(dev)?;
    let ino = child.number();
    claimed.inode = Some(ino);

    let block = allocate_block(dev)?;
    claimed.blocks.push(block);

    let spare = if append_needs_block(&parent.get()) {
        let spare = allocate_block(dev)?;
        claimed.blocks.push(spare);
        debug!(parent = parent.number().0, block = spare.0, "parent directory grows");
        Some(spare)
    } else {
        None
    };

    let mut buf = BlockBuf::zeroed();
    init_dir_block(buf.as_mut_slice(), ino, parent.number())?;
    dev.write_block(block, buf.as_slice())?;

    child.update(|inode| {
        inode.flags = DIRECTORY_FLAG;
        inode.size = EMPTY_DIR_SIZE;
        inode.link_count = 2;
        inode.permissions = DEFAULT_DIR_PERMISSIONS;
        inode.blocks[0] = Some(block);
    });
    child.persist(dev)?;

    append_entry(dev, parent, ino, name, spare)?;
    // The entry is on disk; from here the bits belong to the tree.
    *claimed = Claimed::default();

    parent.update(|inode| inode.link_count = inode.link_count.saturating_add(1));
    parent.persist(dev)?;
    Ok(ino)
}
