#![forbid(unsafe_code)]
//! SimFS public API facade.
//!
//! Re-exports core functionality from `sfs-core` through a stable external
//! interface. This is the crate downstream consumers (the CLI included)
//! depend on.

pub use sfs_core::*;
