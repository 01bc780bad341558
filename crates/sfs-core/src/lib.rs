#![forbid(unsafe_code)]
//! SimFS filesystem engine.
//!
//! Ties the block store, allocators, inode cache, and directory codec into
//! a [`Filesystem`] that can format an image, resolve paths, create
//! directories, and list them.
//!
//! # Opening a filesystem
//!
//! ```no_run
//! use sfs_core::{FsOptions, open_image};
//!
//! let fs = open_image("/path/to/disk.img", &FsOptions::default())?;
//! for entry in fs.list_dir("/")? {
//!     println!("{} {}", entry.inode, entry.name);
//! }
//! # Ok::<(), sfs_core::SfsError>(())
//! ```

mod mkdir;
mod mkfs;
pub mod path;

use serde::{Deserialize, Serialize};
use sfs_alloc::BitmapAllocator;
use sfs_block::{BlockDevice, ByteBlockDevice, FileByteDevice};
use sfs_dir::OpenDirectory;
use sfs_error::Result;
use sfs_inode::{InodeCache, InodeHandle};
use sfs_types::{BLOCK_COUNT, BLOCK_SIZE, DEFAULT_CACHE_SLOTS, INODE_COUNT};
use std::path::Path;
use tracing::debug;

pub use sfs_dir::DirEntry;
pub use sfs_error::{Resource, SfsError};
pub use sfs_types::{BlockNumber, InodeNumber};

// ── Configuration ───────────────────────────────────────────────────────────

/// Runtime options for an opened filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsOptions {
    /// Number of in-core inode slots.
    pub cache_slots: usize,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            cache_slots: DEFAULT_CACHE_SLOTS,
        }
    }
}

/// Options for creating a new image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MkfsOptions {
    pub block_count: u64,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            block_count: BLOCK_COUNT,
        }
    }
}

/// Space accounting snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsUsage {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u32,
    pub free_inodes: u32,
    pub cache_slots: usize,
}

// ── Filesystem ──────────────────────────────────────────────────────────────

/// A SimFS instance over a block device.
#[derive(Debug)]
pub struct Filesystem<D: BlockDevice> {
    dev: D,
    inodes: InodeCache,
}

/// A filesystem backed by an image file.
pub type ImageFs = Filesystem<ByteBlockDevice<FileByteDevice>>;

impl<D: BlockDevice> Filesystem<D> {
    /// Wrap `dev`. The device geometry is checked, its contents are not.
    pub fn new(dev: D, options: &FsOptions) -> Result<Self> {
        mkfs::check_geometry(&dev)?;
        if options.cache_slots == 0 {
            return Err(SfsError::Format("cache_slots must be at least 1".to_owned()));
        }
        Ok(Self {
            dev,
            inodes: InodeCache::new(options.cache_slots),
        })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn inodes(&self) -> &InodeCache {
        &self.inodes
    }

    /// Format the device as an empty filesystem.
    pub fn mkfs(&self) -> Result<()> {
        mkfs::format(&self.dev, &self.inodes)
    }

    /// Handle on the inode `path` names.
    pub fn resolve(&self, path: &str) -> Result<InodeHandle<'_>> {
        path::resolve(&self.inodes, &self.dev, path)
    }

    /// Create an empty directory; returns its inode number.
    pub fn mkdir(&self, path: &str) -> Result<InodeNumber> {
        mkdir::make_directory(&self.dev, &self.inodes, path)
    }

    pub fn open_dir(&self, ino: InodeNumber) -> Result<OpenDirectory<'_>> {
        OpenDirectory::open(&self.inodes, &self.dev, ino)
    }

    /// Entries of the directory at `path`, in on-disk order.
    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let handle = self.resolve(path)?;
        collect_entries(OpenDirectory::from_handle(&self.dev, handle))
    }

    /// Entries of directory inode `ino`, in on-disk order.
    pub fn list_inode(&self, ino: InodeNumber) -> Result<Vec<DirEntry>> {
        collect_entries(self.open_dir(ino)?)
    }

    pub fn usage(&self) -> Result<FsUsage> {
        let blocks = BitmapAllocator::block_map(&self.dev);
        let inodes = BitmapAllocator::inode_map();
        Ok(FsUsage {
            block_size: self.dev.block_size(),
            total_blocks: self.dev.block_count(),
            free_blocks: u64::from(blocks.count_free(&self.dev)?),
            total_inodes: INODE_COUNT,
            free_inodes: inodes.count_free(&self.dev)?,
            cache_slots: self.inodes.capacity(),
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}

fn collect_entries(dir: OpenDirectory<'_>) -> Result<Vec<DirEntry>> {
    if !dir.inode().is_dir() {
        return Err(SfsError::NotDirectory);
    }
    let entries = dir.collect::<Result<Vec<_>>>()?;
    debug!(entries = entries.len(), "directory listed");
    Ok(entries)
}

// ── Image files ─────────────────────────────────────────────────────────────

/// Create (or truncate) an image file and format it.
pub fn create_image(
    path: impl AsRef<Path>,
    mkfs: &MkfsOptions,
    options: &FsOptions,
) -> Result<ImageFs> {
    let len = mkfs
        .block_count
        .checked_mul(BLOCK_SIZE as u64)
        .ok_or_else(|| SfsError::Format(format!("block_count={} too large", mkfs.block_count)))?;
    let file = FileByteDevice::create(path, len)?;
    let fs = Filesystem::new(ByteBlockDevice::new(file, block_size())?, options)?;
    fs.mkfs()?;
    Ok(fs)
}

/// Open an existing image file.
pub fn open_image(path: impl AsRef<Path>, options: &FsOptions) -> Result<ImageFs> {
    let file = FileByteDevice::open(path)?;
    Filesystem::new(ByteBlockDevice::new(file, block_size())?, options)
}

#[allow(clippy::cast_possible_truncation)] // 4096 fits u32
const fn block_size() -> u32 {
    BLOCK_SIZE as u32
}
