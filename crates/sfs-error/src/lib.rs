#![forbid(unsafe_code)]
//! Error types for SimFS.
//!
//! # Error Taxonomy
//!
//! SimFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Packing | `ParseError` | `sfs-types` | Out-of-bounds or unconvertible fixed-width fields |
//! | Runtime | `SfsError` | `sfs-error` (this crate) | Errors returned by every filesystem operation |
//!
//! `sfs-error` does not depend on `sfs-types`; each crate that decodes
//! on-disk bytes maps `ParseError` into `SfsError::Parse` (or
//! `SfsError::Corruption` when the block is known) at its boundary.
//!
//! ## Allocation and lookup failures
//!
//! | Failure | Variant | errno |
//! |---------|---------|-------|
//! | No clear bit in the inode or block bitmap | `AllocationExhausted` | `ENOSPC` |
//! | Inode table slot out of range, cache full, missing path component | `NotFound` | `ENOENT` |
//! | Malformed path string or entry name | `InvalidPath` | `EINVAL` |
//! | Directory has no direct pointer left for another record | `NoSpace` | `ENOSPC` |
//!
//! Reaching the end of a directory is not an error: iteration returns
//! `Ok(None)`.
//!
//! ## errno Mapping
//!
//! Every `SfsError` variant maps to exactly one POSIX errno via
//! [`SfsError::to_errno`]. The match is exhaustive, so a new variant does not
//! compile until its errno is assigned.

use std::fmt;
use thiserror::Error;

/// The two bitmap-managed resource classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Inode,
    Block,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inode => f.write_str("inode"),
            Self::Block => f.write_str("block"),
        }
    }
}

/// Unified error type for all SimFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid image geometry or an out-of-range device access.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Packing-layer error surfaced to the caller.
    ///
    /// Carries the string form of a `ParseError` from `sfs-types`.
    #[error("parse error: {0}")]
    Parse(String),

    /// On-disk metadata is inconsistent at a known block.
    ///
    /// Used when a live structure points somewhere it must not, e.g. a
    /// directory whose recorded size covers an unmapped block pointer.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// No clear bit remains in the bitmap for this resource class.
    #[error("{0} allocation exhausted")]
    AllocationExhausted(Resource),

    /// Inode could not be loaded or cached, or a path component is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed path string.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Entry name does not fit the fixed-width name field.
    #[error("name too long")]
    NameTooLong,

    /// A path component used as a directory is not one.
    #[error("not a directory")]
    NotDirectory,

    /// The parent directory already holds an entry with this name.
    #[error("file exists")]
    Exists,

    /// A directory has used every direct block pointer.
    #[error("no space left in directory")]
    NoSpace,
}

impl SfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - `AllocationExhausted` and `NoSpace` both → `ENOSPC`; the variant
    ///   keeps the distinction for callers that care.
    /// - `NotFound` → `ENOENT`, including cache exhaustion, which is how
    ///   inode acquisition reports a full cache.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidPath(_) => libc::EINVAL,
            Self::AllocationExhausted(_) | Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NotDirectory => libc::ENOTDIR,
            Self::Exists => libc::EEXIST,
        }
    }

    /// Whether this is an allocation failure for `resource`.
    #[must_use]
    pub fn is_exhausted(&self, resource: Resource) -> bool {
        matches!(self, Self::AllocationExhausted(r) if *r == resource)
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;
