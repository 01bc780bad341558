#![forbid(unsafe_code)]
//! File-backed image lifecycle: create, populate, reopen.

use sfs_core::{FsOptions, InodeNumber, MkfsOptions, SfsError, create_image, open_image};

#[test]
fn image_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("disk.img");

    {
        let fs = create_image(&path, &MkfsOptions::default(), &FsOptions::default()).unwrap();
        fs.mkdir("/home").unwrap();
        fs.mkdir("/home/user").unwrap();
        fs.sync().unwrap();
    }
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024 * 4096);

    let fs = open_image(&path, &FsOptions { cache_slots: 4 }).unwrap();
    let names: Vec<String> = fs
        .list_dir("/home")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![".", "..", "user"]);
    assert_eq!(fs.resolve("/home/user").unwrap().number(), InodeNumber(2));

    // Allocation state persisted too: the next directory takes inode 3.
    assert_eq!(fs.mkdir("/tmp").unwrap(), InodeNumber(3));
    let usage = fs.usage().unwrap();
    assert_eq!(usage.free_inodes, 256 - 4);
    assert_eq!(usage.free_blocks, 1024 - 11);
}

#[test]
fn custom_block_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small.img");
    let fs = create_image(&path, &MkfsOptions { block_count: 64 }, &FsOptions::default()).unwrap();
    assert_eq!(fs.usage().unwrap().total_blocks, 64);
    assert_eq!(fs.usage().unwrap().free_blocks, 64 - 8);
}

#[test]
fn unaligned_image_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("odd.img");
    std::fs::write(&path, vec![0_u8; 4096 * 10 + 1]).unwrap();
    let err = open_image(&path, &FsOptions::default()).unwrap_err();
    assert!(matches!(err, SfsError::Format(_)));
}

#[test]
fn missing_image_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = open_image(dir.path().join("absent.img"), &FsOptions::default()).unwrap_err();
    assert!(
        matches!(&err, SfsError::Io(io) if io.kind() == std::io::ErrorKind::NotFound),
        "{err:?}"
    );
}
