//! On-disk inode.
//!
//! Fixed header followed by `ndaddr` direct and three indirect addresses in
//! the filesystem's address width; the slot is padded to `fs_inode_size`.

use ffs_types::{
    DiskAddr, ParseError, ensure_slice, read_le_i64, read_le_u16, read_le_u32, read_le_u64,
    write_le_i64, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

use crate::indirect::{AddrWidth, read_addr, write_addr};
use crate::superblock::NIADDR;

const DINODE_HEADER: usize = 56;

pub const IFMT: u16 = 0o170_000;
pub const IFDIR: u16 = 0o040_000;
pub const IFREG: u16 = 0o100_000;

/// Bytes needed for the header plus every block pointer.
#[must_use]
pub fn dinode_min_size(ndaddr: usize, width: AddrWidth) -> usize {
    DINODE_HEADER + (ndaddr + NIADDR) * width.bytes()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dinode {
    pub mode: u16,
    pub nlink: u16,
    pub uid: u32,
    pub gid: u32,
    pub generation: u32,
    pub size: u64,
    /// 512-byte sectors charged to the file.
    pub blocks: u64,
    pub mtime: i64,
    pub ctime: i64,
    pub flags: u32,
    pub db: Vec<DiskAddr>,
    pub ib: [DiskAddr; NIADDR],
}

impl Dinode {
    #[must_use]
    pub fn empty(ndaddr: usize) -> Self {
        Self {
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            generation: 0,
            size: 0,
            blocks: 0,
            mtime: 0,
            ctime: 0,
            flags: 0,
            db: vec![DiskAddr::HOLE; ndaddr],
            ib: [DiskAddr::HOLE; NIADDR],
        }
    }

    pub fn parse_from_bytes(
        bytes: &[u8],
        ndaddr: usize,
        width: AddrWidth,
    ) -> Result<Self, ParseError> {
        let bytes = ensure_slice(bytes, 0, dinode_min_size(ndaddr, width))?;
        let ptrs = &bytes[DINODE_HEADER..];
        let db = (0..ndaddr)
            .map(|i| read_addr(ptrs, i, width))
            .collect::<Result<Vec<_>, _>>()?;
        let mut ib = [DiskAddr::HOLE; NIADDR];
        for (level, slot) in ib.iter_mut().enumerate() {
            *slot = read_addr(ptrs, ndaddr + level, width)?;
        }
        Ok(Self {
            mode: read_le_u16(bytes, 0)?,
            nlink: read_le_u16(bytes, 2)?,
            uid: read_le_u32(bytes, 4)?,
            gid: read_le_u32(bytes, 8)?,
            generation: read_le_u32(bytes, 12)?,
            size: read_le_u64(bytes, 16)?,
            blocks: read_le_u64(bytes, 24)?,
            mtime: read_le_i64(bytes, 32)?,
            ctime: read_le_i64(bytes, 40)?,
            flags: read_le_u32(bytes, 48)?,
            db,
            ib,
        })
    }

    /// Write this inode into `out`, which must hold at least the minimum size.
    pub fn write_to_bytes(&self, out: &mut [u8], width: AddrWidth) -> Result<(), ParseError> {
        let needed = dinode_min_size(self.db.len(), width);
        ensure_slice(out, 0, needed)?;
        out[..needed].fill(0);
        write_le_u16(out, 0, self.mode)?;
        write_le_u16(out, 2, self.nlink)?;
        write_le_u32(out, 4, self.uid)?;
        write_le_u32(out, 8, self.gid)?;
        write_le_u32(out, 12, self.generation)?;
        write_le_u64(out, 16, self.size)?;
        write_le_u64(out, 24, self.blocks)?;
        write_le_i64(out, 32, self.mtime)?;
        write_le_i64(out, 40, self.ctime)?;
        write_le_u32(out, 48, self.flags)?;
        let ptrs = &mut out[DINODE_HEADER..];
        for (i, addr) in self.db.iter().chain(self.ib.iter()).enumerate() {
            write_addr(ptrs, i, width, *addr)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & IFMT == IFDIR
    }
}
