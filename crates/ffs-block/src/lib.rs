#![forbid(unsafe_code)]
//! Block I/O layer for the FFS engine.
//!
//! Provides the [`ByteDevice`] trait with file and in-memory backends, and a
//! [`BufferCache`] keyed by byte offset. Buffers are variable-sized because a
//! file's tail may live in a run of fragments smaller than a full block.
//! Cached buffers are held exclusively through a [`Buf`] guard and released
//! either synchronously written, delayed-written, clean, or invalidated.
//! Clean idle buffers are retained under ARC (Adaptive Replacement Cache).

mod arc;
mod cache;
mod device;

pub use cache::{Buf, BufferCache, CacheStats};
pub use device::{ByteDevice, FileByteDevice, MemByteDevice};
