//! Path-name handling and resolution.
//!
//! Paths are absolute, `/`-separated, and carry no trailing slash. Resolution
//! walks from the root directory one component at a time, holding at most
//! one directory handle at any point.

use sfs_block::BlockDevice;
use sfs_dir::OpenDirectory;
use sfs_error::{Result, SfsError};
use sfs_inode::{InodeCache, InodeHandle};
use sfs_types::InodeNumber;
use tracing::debug;

/// Whether `path` is acceptable as the target of a directory make.
///
/// Rejects the empty string, the bare root `/`, relative paths, and paths
/// ending in `/`.
#[must_use]
pub fn validate(path: &str) -> bool {
    !path.is_empty() && path != "/" && path.starts_with('/') && !path.ends_with('/')
}

/// Everything before the last `/`.
///
/// The parent of a top-level name is `/`; a path with no `/` has parent `.`.
#[must_use]
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// Everything after the last `/`. The basename of `/` is `/`.
#[must_use]
pub fn basename(path: &str) -> &str {
    if path == "/" {
        return path;
    }
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// `(dirname, basename)` in one call.
#[must_use]
pub fn split_path(path: &str) -> (&str, &str) {
    (dirname(path), basename(path))
}

/// Resolve `path` to a handle on its inode.
///
/// `/` and `.` name the root directory. The caller owns the returned
/// handle; every intermediate directory handle is released on the way down.
pub fn resolve<'a>(
    cache: &'a InodeCache,
    dev: &'a dyn BlockDevice,
    path: &str,
) -> Result<InodeHandle<'a>> {
    if path != "." && !path.starts_with('/') {
        return Err(SfsError::InvalidPath(format!(
            "{path:?} is not absolute"
        )));
    }

    let mut current = cache.acquire(dev, InodeNumber::ROOT)?;
    for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
        if !current.is_dir() {
            return Err(SfsError::NotDirectory);
        }
        let mut dir = OpenDirectory::from_handle(dev, current);
        let entry = dir
            .lookup(component)?
            .ok_or_else(|| SfsError::NotFound(component.to_owned()))?;
        // Release the parent before pinning the child.
        dir.close();
        current = cache.acquire(dev, entry.inode)?;
    }
    debug!(path, ino = current.number().0, "path resolved");
    Ok(current)
}
