#![forbid(unsafe_code)]
//! Inode management.
//!
//! The in-core [`Inode`] owned by an open file, conversion to and from the
//! on-disk [`Dinode`], the `blksize` rule for a file's final fragment run,
//! and inode-table I/O through the buffer cache ([`load_inode`],
//! [`update_inode`]).

use ffs_block::BufferCache;
use ffs_error::{FfsError, Result};
use ffs_ondisk::{AddrWidth, Dinode, IFDIR, IFMT, NIADDR, Superblock};
use ffs_types::{DiskAddr, InodeNumber};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// In-core inode.
///
/// `blocks` is signed so accounting can be applied in any order and clamped
/// at the end; it is written back as an unsigned sector count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inode {
    pub number: InodeNumber,
    pub mode: u16,
    pub nlink: u16,
    pub uid: u32,
    pub gid: u32,
    pub generation: u32,
    pub size: u64,
    /// 512-byte sectors charged to the file.
    pub blocks: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub flags: u32,
    pub db: Vec<DiskAddr>,
    pub ib: [DiskAddr; NIADDR],
}

impl Inode {
    #[must_use]
    pub fn new(number: InodeNumber, ndaddr: usize) -> Self {
        Self::from_dinode(number, Dinode::empty(ndaddr))
    }

    #[must_use]
    pub fn from_dinode(number: InodeNumber, d: Dinode) -> Self {
        Self {
            number,
            mode: d.mode,
            nlink: d.nlink,
            uid: d.uid,
            gid: d.gid,
            generation: d.generation,
            size: d.size,
            blocks: i64::try_from(d.blocks).unwrap_or(i64::MAX),
            mtime: d.mtime,
            ctime: d.ctime,
            flags: d.flags,
            db: d.db,
            ib: d.ib,
        }
    }

    #[must_use]
    pub fn to_dinode(&self) -> Dinode {
        Dinode {
            mode: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            generation: self.generation,
            size: self.size,
            blocks: u64::try_from(self.blocks).unwrap_or(0),
            mtime: self.mtime,
            ctime: self.ctime,
            flags: self.flags,
            db: self.db.clone(),
            ib: self.ib,
        }
    }

    #[must_use]
    pub fn ndaddr(&self) -> usize {
        self.db.len()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & IFMT == IFDIR
    }

    /// Stamp modification and change times.
    pub fn touch(&mut self) {
        let now = now_secs();
        self.mtime = now;
        self.ctime = now;
    }

    /// Stamp only the change time.
    pub fn touch_ctime(&mut self) {
        self.ctime = now_secs();
    }

    /// Pointer for direct block `lbn`, hole when out of range.
    #[must_use]
    pub fn direct(&self, lbn: i64) -> DiskAddr {
        usize::try_from(lbn)
            .ok()
            .and_then(|i| self.db.get(i).copied())
            .unwrap_or(DiskAddr::HOLE)
    }
}

#[must_use]
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Bytes allocated to logical block `lbn` of a file of `size` bytes.
///
/// Indirect-mapped blocks and blocks wholly below `size` are full blocks; the
/// last direct block may be a fragment run rounded up to the fragment size.
#[must_use]
pub fn blksize(sb: &Superblock, size: u64, lbn: i64) -> u32 {
    let full = u64::try_from(lbn)
        .ok()
        .and_then(|l| l.checked_add(1))
        .and_then(|l| l.checked_mul(u64::from(sb.bsize)));
    match full {
        Some(end) if lbn < i64::from(sb.ndaddr) && size < end => {
            u32::try_from(sb.fragroundup(sb.blkoff(size))).unwrap_or(sb.bsize)
        }
        _ => sb.bsize,
    }
}

fn check_number(sb: &Superblock, ino: InodeNumber) -> Result<()> {
    let max = u64::from(sb.ncg) * u64::from(sb.ipg);
    if ino.0 >= max {
        return Err(FfsError::InvalidArgument(format!(
            "inode {ino} out of range (max {max})"
        )));
    }
    Ok(())
}

/// Read inode `ino` from its inode block.
pub fn load_inode(cache: &BufferCache, sb: &Superblock, ino: InodeNumber) -> Result<Inode> {
    check_number(sb, ino)?;
    let fsba = sb.ino_to_fsba(ino);
    let off = sb.ino_to_fsbo(ino);
    let buf = cache.read_block(sb.frag_to_byte(fsba), sb.bsize as usize)?;
    let slot = buf
        .get(off..off + sb.inode_size as usize)
        .ok_or_else(|| FfsError::Corruption {
            block: fsba.0,
            detail: format!("inode {ino} slot outside its block"),
        })?;
    let dinode = Dinode::parse_from_bytes(slot, sb.ndaddr as usize, sb.addr_width).map_err(
        |err| FfsError::Corruption {
            block: fsba.0,
            detail: format!("inode {ino}: {err}"),
        },
    )?;
    buf.release();
    Ok(Inode::from_dinode(ino, dinode))
}

/// Write the in-core inode back to its inode block.
///
/// With `wait` the block is written synchronously; otherwise it is left as a
/// delayed write.
pub fn update_inode(cache: &BufferCache, sb: &Superblock, ip: &Inode, wait: bool) -> Result<()> {
    check_number(sb, ip.number)?;
    let fsba = sb.ino_to_fsba(ip.number);
    let off = sb.ino_to_fsbo(ip.number);
    let mut buf = cache.read_block(sb.frag_to_byte(fsba), sb.bsize as usize)?;
    let end = off + sb.inode_size as usize;
    let slot = buf.get_mut(off..end).ok_or_else(|| FfsError::Corruption {
        block: fsba.0,
        detail: format!("inode {} slot outside its block", ip.number),
    })?;
    encode_into(ip, slot, sb.addr_width).map_err(|err| FfsError::Corruption {
        block: fsba.0,
        detail: format!("inode {}: {err}", ip.number),
    })?;
    trace!(
        ino = ip.number.0,
        size = ip.size,
        blocks = ip.blocks,
        wait,
        "inode_update"
    );
    if wait {
        buf.write_sync()
    } else {
        buf.write_delayed();
        Ok(())
    }
}

fn encode_into(
    ip: &Inode,
    slot: &mut [u8],
    width: AddrWidth,
) -> std::result::Result<(), ffs_types::ParseError> {
    slot.fill(0);
    ip.to_dinode().write_to_bytes(slot, width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_block::MemByteDevice;
    use ffs_ondisk::{CsSum, FragsPerBlock, IFREG, Optim};

    fn geometry() -> Superblock {
        Superblock {
            bsize: 4096,
            fsize: 1024,
            frags: FragsPerBlock::Four,
            fpg: 2048,
            ipg: 256,
            ncg: 2,
            inode_size: 128,
            size: 4096,
            dsize: 3800,
            sblkno: 64,
            cblkno: 68,
            iblkno: 72,
            dblkno: 104,
            cgsize: 644,
            cssize: 1024,
            csaddr: DiskAddr(104),
            ndaddr: 12,
            addr_width: AddrWidth::U32,
            nsect: 32,
            ntrak: 16,
            nrpos: 8,
            cpg: 8,
            rps: 60,
            rotdelay: 0,
            contigsumsize: 8,
            maxcontig: 8,
            maxbpg: 512,
            minfree: 8,
            optim: Optim::Time,
            avgfilesize: 16_384,
            avgfpdir: 64,
            cgrotor: 0,
            cstotal: CsSum::default(),
            time: 0,
            clean: true,
            flags: 0,
        }
    }

    #[test]
    fn blksize_rounds_tail_to_fragments() {
        let sb = geometry();
        assert_eq!(blksize(&sb, 500, 0), 1024);
        assert_eq!(blksize(&sb, 4096, 0), 4096);
        assert_eq!(blksize(&sb, 4096 + 1500, 1), 2048);
        assert_eq!(blksize(&sb, 40_000, 1), 4096);
        // Indirect-mapped blocks are always full.
        assert_eq!(blksize(&sb, 12 * 4096 + 10, 12), 4096);
    }

    #[test]
    fn update_then_load_preserves_fields() {
        let sb = geometry();
        let cache = BufferCache::new(Box::new(MemByteDevice::new(8192 * 1024)), 16);
        let mut ip = Inode::new(InodeNumber(37), 12);
        ip.mode = IFREG | 0o600;
        ip.size = 5000;
        ip.blocks = 16;
        ip.db[0] = DiskAddr(400);
        ip.db[1] = DiskAddr(404);
        ip.touch();
        update_inode(&cache, &sb, &ip, true).unwrap();

        let back = load_inode(&cache, &sb, InodeNumber(37)).unwrap();
        assert_eq!(back, ip);
        let neighbour = load_inode(&cache, &sb, InodeNumber(36)).unwrap();
        assert_eq!(neighbour.size, 0);
    }

    #[test]
    fn negative_blocks_are_stored_as_zero() {
        let mut ip = Inode::new(InodeNumber(3), 12);
        ip.blocks = -8;
        assert_eq!(ip.to_dinode().blocks, 0);
    }

    #[test]
    fn out_of_range_inode_is_rejected() {
        let sb = geometry();
        let cache = BufferCache::new(Box::new(MemByteDevice::new(4096)), 4);
        assert!(matches!(
            load_inode(&cache, &sb, InodeNumber(512)),
            Err(FfsError::InvalidArgument(_))
        ));
    }
}
