#![forbid(unsafe_code)]
//! Public API for the FFS allocation and truncation engine.
//!
//! Re-exports `ffs-core`: format an image with [`Ffs::format`] or
//! [`format_device`], mount it with [`Ffs::mount`] or [`Ffs::open`], then
//! create, write, truncate and remove files. [`check`] cross-validates the
//! bitmaps, summaries and inode block claims.

pub use ffs_core::*;
