#![forbid(unsafe_code)]
//! On-disk format for the FFS engine.
//!
//! Pure codec crate: no I/O, no side effects. Decodes byte slices into typed
//! structures (superblock, cylinder group, inode, indirect block) and encodes
//! them back with explicit little-endian layouts and crc32c check hashes.
//! Geometry arithmetic that depends only on superblock fields lives here too.

pub mod cg;
pub mod dinode;
pub mod indirect;
pub mod superblock;

pub use cg::{CG_MAGIC, CgLayout, CylinderGroup};
pub use dinode::{Dinode, IFDIR, IFMT, IFREG, dinode_min_size};
pub use indirect::{AddrWidth, clear_from, decode_addrs, read_addr, write_addr};
pub use superblock::{
    CSUM_SIZE, CsSum, DEV_BSIZE, FS_MAGIC, FS_MAXCONTIG, FS_NEEDSFSCK, FragsPerBlock, MAX_NRPOS,
    MAXFRAG, NIADDR, Optim, SBLOCK_OFFSET, SBLOCK_SIZE, Superblock, decode_csum_array,
    encode_csum_array,
};
