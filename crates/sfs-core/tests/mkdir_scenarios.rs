#![forbid(unsafe_code)]
//! End-to-end directory creation scenarios over an in-memory image.
//!
//! Scenarios tested:
//! 1. Fresh image layout: root entries, reserved blocks, first free block.
//! 2. Nested creation keeps existing `.`/`..` records intact.
//! 3. Validation failures (bad path, long name, missing parent, duplicates).
//! 4. Exhaustion or a pinned inode number releases whatever the failed call
//!    claimed.
//! 5. A parent growing past one block of entries.

use sfs_alloc::{BitmapAllocator, allocate_block, allocate_inode_slot};
use sfs_block::{BlockDevice, ByteBlockDevice, MemByteDevice};
use sfs_core::{BlockNumber, DirEntry, Filesystem, FsOptions, InodeNumber, Resource, SfsError};
use sfs_types::{BLOCK_COUNT, BLOCK_SIZE, DIR_RECORDS_PER_BLOCK, INODE_PTR_COUNT};

type MemFs = Filesystem<ByteBlockDevice<MemByteDevice>>;

fn fresh_fs() -> MemFs {
    let dev = ByteBlockDevice::in_memory(BLOCK_COUNT).expect("device");
    let fs = Filesystem::new(dev, &FsOptions::default()).expect("fs");
    fs.mkfs().expect("mkfs");
    fs
}

fn entry(ino: u32, name: &str) -> DirEntry {
    DirEntry {
        inode: InodeNumber(ino),
        name: name.to_owned(),
    }
}

fn free_counts(fs: &MemFs) -> (u64, u32) {
    let usage = fs.usage().expect("usage");
    (usage.free_blocks, usage.free_inodes)
}

// ---------------------------------------------------------------------------
// Layout after formatting
// ---------------------------------------------------------------------------

#[test]
fn fresh_root_holds_only_dot_entries() {
    let fs = fresh_fs();
    assert_eq!(
        fs.list_dir("/").unwrap(),
        vec![entry(0, "."), entry(0, "..")]
    );
    assert_eq!(fs.list_inode(InodeNumber::ROOT).unwrap().len(), 2);

    let root = fs.resolve("/").unwrap();
    let inode = root.get();
    assert!(inode.is_dir());
    assert_eq!(inode.size, 64);
    assert_eq!(inode.link_count, 2);
    assert_eq!(inode.block(0), Some(BlockNumber(7)));
}

#[test]
fn metadata_blocks_are_reserved_and_first_free_is_eight() {
    let fs = fresh_fs();
    let blocks = BitmapAllocator::block_map(fs.device());
    for block in 0..8 {
        assert!(blocks.is_allocated(fs.device(), block).unwrap(), "block {block}");
    }
    assert_eq!(allocate_block(fs.device()).unwrap(), BlockNumber(8));
}

#[test]
fn dot_resolves_to_root() {
    let fs = fresh_fs();
    assert_eq!(fs.resolve(".").unwrap().number(), InodeNumber::ROOT);
    assert_eq!(fs.resolve("/./.").unwrap().number(), InodeNumber::ROOT);
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[test]
fn first_directory_gets_inode_one() {
    let fs = fresh_fs();
    assert_eq!(fs.mkdir("/foo").unwrap(), InodeNumber(1));

    let foo = fs.list_dir("/foo").unwrap();
    assert_eq!(foo, vec![entry(1, "."), entry(0, "..")]);
    assert_eq!(
        fs.list_dir("/").unwrap(),
        vec![entry(0, "."), entry(0, ".."), entry(1, "foo")]
    );

    // Parent gained a link for the child's `..`.
    assert_eq!(fs.resolve("/").unwrap().get().link_count, 3);
    assert_eq!(fs.resolve("/foo").unwrap().get().block(0), Some(BlockNumber(8)));
}

#[test]
fn nested_directory_leaves_parent_dot_entries_intact() {
    let fs = fresh_fs();
    fs.mkdir("/foo").unwrap();
    assert_eq!(fs.mkdir("/foo/bar").unwrap(), InodeNumber(2));

    assert_eq!(
        fs.list_dir("/foo").unwrap(),
        vec![entry(1, "."), entry(0, ".."), entry(2, "bar")]
    );
    assert_eq!(
        fs.list_dir("/foo/bar").unwrap(),
        vec![entry(2, "."), entry(1, "..")]
    );
    assert_eq!(fs.resolve("/foo/bar/..").unwrap().number(), InodeNumber(1));
}

#[test]
fn siblings_get_increasing_numbers() {
    let fs = fresh_fs();
    let inos: Vec<u32> = ["/a", "/b", "/c"]
        .iter()
        .map(|p| fs.mkdir(p).unwrap().0)
        .collect();
    assert_eq!(inos, vec![1, 2, 3]);
    assert_eq!(fs.inodes().free_slot_count(), fs.inodes().capacity());
}

// ---------------------------------------------------------------------------
// Validation failures
// ---------------------------------------------------------------------------

#[test]
fn malformed_paths_are_rejected() {
    let fs = fresh_fs();
    for path in ["", "/", "relative", "/trailing/"] {
        let err = fs.mkdir(path).unwrap_err();
        assert!(matches!(err, SfsError::InvalidPath(_)), "{path:?}: {err:?}");
    }
    assert_eq!(fs.list_dir("/").unwrap().len(), 2);
}

#[test]
fn long_name_is_rejected() {
    let fs = fresh_fs();
    let path = format!("/{}", "n".repeat(30));
    assert!(matches!(fs.mkdir(&path), Err(SfsError::NameTooLong)));
    let ok = format!("/{}", "n".repeat(29));
    fs.mkdir(&ok).unwrap();
    assert_eq!(fs.list_dir("/").unwrap()[2].name.len(), 29);
}

#[test]
fn missing_parent_is_not_found() {
    let fs = fresh_fs();
    let before = free_counts(&fs);
    match fs.mkdir("/nope/child") {
        Err(SfsError::NotFound(component)) => assert_eq!(component, "nope"),
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert_eq!(free_counts(&fs), before);
}

#[test]
fn duplicate_name_is_exists() {
    let fs = fresh_fs();
    fs.mkdir("/foo").unwrap();
    let before = free_counts(&fs);
    assert!(matches!(fs.mkdir("/foo"), Err(SfsError::Exists)));
    assert!(matches!(fs.mkdir("/.."), Err(SfsError::Exists)));
    assert_eq!(free_counts(&fs), before);
    assert_eq!(fs.list_dir("/").unwrap().len(), 3);
}

#[test]
fn descending_through_non_directory_fails() {
    let fs = fresh_fs();
    // Plant a non-directory inode in the root by hand.
    let file = fs.inodes().allocate(fs.device()).unwrap();
    let file_ino = file.number();
    file.persist(fs.device()).unwrap();
    drop(file);
    let root = fs.resolve("/").unwrap();
    sfs_dir::append_entry(fs.device(), &root, file_ino, "file", None).unwrap();
    drop(root);

    assert!(matches!(fs.mkdir("/file/sub"), Err(SfsError::NotDirectory)));
    assert!(matches!(fs.list_dir("/file"), Err(SfsError::NotDirectory)));
    assert!(matches!(
        fs.resolve("/file/deeper"),
        Err(SfsError::NotDirectory)
    ));
}

#[test]
fn directory_with_every_pointer_used_is_no_space() {
    let fs = fresh_fs();
    fs.mkdir("/full").unwrap();
    let dev: &dyn BlockDevice = fs.device();
    let full = fs.resolve("/full").unwrap();
    for index in 1..INODE_PTR_COUNT {
        let block = allocate_block(dev).unwrap();
        full.update(|inode| inode.blocks[index] = Some(block));
    }
    full.update(|inode| inode.size = u32::try_from(BLOCK_SIZE * INODE_PTR_COUNT).unwrap());
    full.persist(dev).unwrap();
    drop(full);

    let before = free_counts(&fs);
    assert!(matches!(fs.mkdir("/full/x"), Err(SfsError::NoSpace)));
    assert_eq!(free_counts(&fs), before);
}

// ---------------------------------------------------------------------------
// Exhaustion and rollback
// ---------------------------------------------------------------------------

#[test]
fn block_exhaustion_releases_claimed_inode() {
    let fs = fresh_fs();
    fs.mkdir("/keep").unwrap();
    while allocate_block(fs.device()).is_ok() {}
    let (_, free_inodes) = free_counts(&fs);

    let err = fs.mkdir("/x").unwrap_err();
    assert!(err.is_exhausted(Resource::Block), "{err:?}");
    assert_eq!(free_counts(&fs), (0, free_inodes));
    assert_eq!(
        fs.list_dir("/").unwrap(),
        vec![entry(0, "."), entry(0, ".."), entry(1, "keep")]
    );
    assert_eq!(fs.list_dir("/keep").unwrap().len(), 2);
}

#[test]
fn inode_exhaustion_leaves_blocks_untouched() {
    let fs = fresh_fs();
    fs.mkdir("/keep").unwrap();
    while allocate_inode_slot(fs.device()).is_ok() {}
    let before = free_counts(&fs);

    let err = fs.mkdir("/x").unwrap_err();
    assert!(err.is_exhausted(Resource::Inode), "{err:?}");
    assert_eq!(free_counts(&fs), before);
    assert_eq!(fs.list_dir("/").unwrap().len(), 3);
}

#[test]
fn spare_block_failure_releases_inode_and_block() {
    let fs = fresh_fs();
    // Fill the root's first block exactly.
    for i in 0..DIR_RECORDS_PER_BLOCK - 2 {
        fs.mkdir(&format!("/d{i}")).unwrap();
    }
    assert_eq!(
        fs.resolve("/").unwrap().size(),
        u32::try_from(BLOCK_SIZE).unwrap()
    );
    // Leave exactly one free block: enough for the child, not the spare.
    while fs.usage().unwrap().free_blocks > 1 {
        allocate_block(fs.device()).unwrap();
    }
    let before = free_counts(&fs);

    let err = fs.mkdir("/overflow").unwrap_err();
    assert!(err.is_exhausted(Resource::Block), "{err:?}");
    assert_eq!(free_counts(&fs), before);
    assert_eq!(fs.list_dir("/").unwrap().len(), DIR_RECORDS_PER_BLOCK);
}

#[test]
fn claim_of_a_referenced_inode_is_released() {
    let fs = fresh_fs();
    let before = free_counts(&fs);
    // Inode 1 is free on disk but pinned in the cache.
    let pinned = fs.inodes().acquire(fs.device(), InodeNumber(1)).unwrap();

    let err = fs.mkdir("/foo").unwrap_err();
    assert!(matches!(err, SfsError::Corruption { .. }), "{err:?}");
    let inodes = BitmapAllocator::inode_map();
    assert!(!inodes.is_allocated(fs.device(), 1).unwrap());
    assert_eq!(free_counts(&fs), before);
    assert_eq!(fs.list_dir("/").unwrap().len(), 2);

    drop(pinned);
    assert_eq!(fs.mkdir("/foo").unwrap(), InodeNumber(1));
}

// ---------------------------------------------------------------------------
// Growth
// ---------------------------------------------------------------------------

#[test]
fn parent_grows_into_second_block() {
    let fs = fresh_fs();
    let count = DIR_RECORDS_PER_BLOCK;
    for i in 0..count {
        fs.mkdir(&format!("/dir{i:03}")).unwrap();
    }

    let root = fs.resolve("/").unwrap();
    let inode = root.get();
    assert_eq!(inode.size as usize, (count + 2) * 32);
    let second = inode.block(1).expect("second block mapped");
    assert!(second.0 > 7);
    drop(root);

    let names = fs.list_dir("/").unwrap();
    assert_eq!(names.len(), count + 2);
    assert_eq!(names[128].name, "dir126");
    assert_eq!(names.last().unwrap().name, "dir127");

    // Entries in the second block resolve like any other.
    let ino = fs.resolve("/dir127").unwrap().number();
    assert_eq!(fs.list_inode(ino).unwrap()[0], entry(ino.0, "."));
}
