//! Superblock codec and the geometry arithmetic derived from it.
//!
//! Every address helper here mirrors one of the classic FFS macros
//! (`dtog`, `cgdmin`, `fragroundup`, `lblkno`, ...) but works in checked
//! `u64` arithmetic over the decoded fields instead of compile-time constants,
//! so one binary handles every geometry the superblock can describe.

use ffs_types::{
    ByteOffset, DiskAddr, InodeNumber, ParseError, ensure_slice, read_le_i32, read_le_i64,
    read_le_u32, read_le_u64, write_le_i32, write_le_i64, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

use crate::cg::CgLayout;
use crate::dinode::dinode_min_size;
use crate::indirect::AddrWidth;

pub const FS_MAGIC: u32 = 0x1954_0119;

/// Byte offset of the primary superblock. Every group keeps a backup at the
/// same group-relative offset.
pub const SBLOCK_OFFSET: u64 = 65_536;
pub const SBLOCK_SIZE: usize = 1024;

/// Sector size used for `blocks` accounting and rotational math.
pub const DEV_BSIZE: u64 = 512;

/// Indirection levels: single, double, triple.
pub const NIADDR: usize = 3;

/// Upper bound on the fragment histogram (fragments per block).
pub const MAXFRAG: usize = 8;

/// Upper bound on the cluster-summary histogram length.
pub const FS_MAXCONTIG: u32 = 16;

pub const MAX_NRPOS: u32 = 32;

/// Flag bit: a corruption was detected; the filesystem must be checked.
pub const FS_NEEDSFSCK: u32 = 0x01;

/// Bytes per entry in the on-disk per-group summary array.
pub const CSUM_SIZE: usize = 16;

const HASH_OFFSET: usize = SBLOCK_SIZE - 4;

/// Fragments per block, fixed at format time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragsPerBlock {
    One,
    Two,
    Four,
    Eight,
}

impl FragsPerBlock {
    #[must_use]
    pub fn count(self) -> u32 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
            Self::Eight => 8,
        }
    }
}

impl TryFrom<u32> for FragsPerBlock {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            _ => Err(ParseError::InvalidField {
                field: "fs_frag",
                reason: "fragments per block must be 1, 2, 4 or 8",
            }),
        }
    }
}

/// Allocation optimisation preference (`fs_optim`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Optim {
    /// Minimise allocation time; favour full blocks when growing fragments.
    #[default]
    Time,
    /// Minimise wasted space; grow fragments to the exact size.
    Space,
}

impl Optim {
    fn to_raw(self) -> u32 {
        match self {
            Self::Time => 0,
            Self::Space => 1,
        }
    }

    fn from_raw(raw: u32) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Time),
            1 => Ok(Self::Space),
            _ => Err(ParseError::InvalidField {
                field: "fs_optim",
                reason: "must be 0 (time) or 1 (space)",
            }),
        }
    }
}

/// Free-resource counters, kept per group and summed filesystem-wide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsSum {
    pub ndir: i64,
    pub nbfree: i64,
    pub nifree: i64,
    pub nffree: i64,
}

impl CsSum {
    pub fn add(&mut self, other: &Self) {
        self.ndir += other.ndir;
        self.nbfree += other.nbfree;
        self.nifree += other.nifree;
        self.nffree += other.nffree;
    }

    /// Decode the 16-byte on-disk form (four `i32`s).
    pub fn decode32(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            ndir: i64::from(read_le_i32(bytes, offset)?),
            nbfree: i64::from(read_le_i32(bytes, offset + 4)?),
            nifree: i64::from(read_le_i32(bytes, offset + 8)?),
            nffree: i64::from(read_le_i32(bytes, offset + 12)?),
        })
    }

    pub fn encode32(&self, out: &mut [u8], offset: usize) -> Result<(), ParseError> {
        let narrow = |v: i64| {
            i32::try_from(v).map_err(|_| ParseError::IntegerConversion { field: "csum" })
        };
        write_le_i32(out, offset, narrow(self.ndir)?)?;
        write_le_i32(out, offset + 4, narrow(self.nbfree)?)?;
        write_le_i32(out, offset + 8, narrow(self.nifree)?)?;
        write_le_i32(out, offset + 12, narrow(self.nffree)?)?;
        Ok(())
    }
}

/// Decode the per-group summary area (`fs_cs`).
pub fn decode_csum_array(bytes: &[u8], ncg: u32) -> Result<Vec<CsSum>, ParseError> {
    (0..ncg as usize)
        .map(|cg| CsSum::decode32(bytes, cg * CSUM_SIZE))
        .collect()
}

pub fn encode_csum_array(cs: &[CsSum], out: &mut [u8]) -> Result<(), ParseError> {
    for (cg, sum) in cs.iter().enumerate() {
        sum.encode32(out, cg * CSUM_SIZE)?;
    }
    Ok(())
}

/// Decoded superblock.
///
/// Geometry fields are immutable after format. `cstotal`, `cgrotor`,
/// `optim`, `clean`, `flags` and `time` change while mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub bsize: u32,
    pub fsize: u32,
    pub frags: FragsPerBlock,
    /// Fragments per cylinder group.
    pub fpg: u32,
    pub ipg: u32,
    pub ncg: u32,
    pub inode_size: u32,
    /// Total fragments (`ncg * fpg`).
    pub size: u64,
    /// Fragments available for data.
    pub dsize: u64,
    /// Group-relative fragment offsets of the backup superblock, the group
    /// descriptor, the inode table and the first data fragment.
    pub sblkno: u32,
    pub cblkno: u32,
    pub iblkno: u32,
    pub dblkno: u32,
    /// Bytes in one cylinder group descriptor.
    pub cgsize: u32,
    /// Bytes in the per-group summary area.
    pub cssize: u32,
    pub csaddr: DiskAddr,
    pub ndaddr: u32,
    pub addr_width: AddrWidth,
    pub nsect: u32,
    pub ntrak: u32,
    pub nrpos: u32,
    pub cpg: u32,
    pub rps: u32,
    /// Milliseconds between consecutive block transfers.
    pub rotdelay: u32,
    pub contigsumsize: u32,
    pub maxcontig: u32,
    pub maxbpg: u32,
    pub minfree: u32,
    pub optim: Optim,
    pub avgfilesize: u32,
    pub avgfpdir: u32,
    pub cgrotor: u32,
    pub cstotal: CsSum,
    pub time: i64,
    pub clean: bool,
    pub flags: u32,
}

impl Superblock {
    /// Parse the 1024-byte superblock region.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(region, 0, SBLOCK_SIZE)?;
        let magic = read_le_u32(region, 0x00)?;
        if magic != FS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(FS_MAGIC),
                actual: u64::from(magic),
            });
        }
        let stored = read_le_u32(region, HASH_OFFSET)?;
        let computed = crc32c::crc32c(&region[..HASH_OFFSET]);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch { stored, computed });
        }

        let width = match read_le_u32(region, 0x54)? {
            4 => AddrWidth::U32,
            8 => AddrWidth::U64,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "fs_addr_width",
                    reason: "must be 4 or 8",
                });
            }
        };

        let sb = Self {
            bsize: read_le_u32(region, 0x04)?,
            fsize: read_le_u32(region, 0x08)?,
            frags: FragsPerBlock::try_from(read_le_u32(region, 0x0C)?)?,
            fpg: read_le_u32(region, 0x10)?,
            ipg: read_le_u32(region, 0x14)?,
            ncg: read_le_u32(region, 0x18)?,
            inode_size: read_le_u32(region, 0x1C)?,
            size: read_le_u64(region, 0x20)?,
            dsize: read_le_u64(region, 0x28)?,
            sblkno: read_le_u32(region, 0x30)?,
            cblkno: read_le_u32(region, 0x34)?,
            iblkno: read_le_u32(region, 0x38)?,
            dblkno: read_le_u32(region, 0x3C)?,
            cgsize: read_le_u32(region, 0x40)?,
            cssize: read_le_u32(region, 0x44)?,
            csaddr: DiskAddr(read_le_u64(region, 0x48)?),
            ndaddr: read_le_u32(region, 0x50)?,
            addr_width: width,
            nsect: read_le_u32(region, 0x58)?,
            ntrak: read_le_u32(region, 0x5C)?,
            nrpos: read_le_u32(region, 0x60)?,
            cpg: read_le_u32(region, 0x64)?,
            rps: read_le_u32(region, 0x68)?,
            rotdelay: read_le_u32(region, 0x6C)?,
            contigsumsize: read_le_u32(region, 0x70)?,
            maxcontig: read_le_u32(region, 0x74)?,
            maxbpg: read_le_u32(region, 0x78)?,
            minfree: read_le_u32(region, 0x7C)?,
            optim: Optim::from_raw(read_le_u32(region, 0x80)?)?,
            avgfilesize: read_le_u32(region, 0x84)?,
            avgfpdir: read_le_u32(region, 0x88)?,
            cgrotor: read_le_u32(region, 0x8C)?,
            cstotal: CsSum {
                ndir: read_le_i64(region, 0x90)?,
                nbfree: read_le_i64(region, 0x98)?,
                nifree: read_le_i64(region, 0xA0)?,
                nffree: read_le_i64(region, 0xA8)?,
            },
            time: read_le_i64(region, 0xB0)?,
            clean: read_le_u32(region, 0xB8)? != 0,
            flags: read_le_u32(region, 0xBC)?,
        };
        sb.validate_geometry()?;
        Ok(sb)
    }

    /// Serialize into a 1024-byte region, computing the check hash.
    pub fn write_region(&self, region: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(region, 0, SBLOCK_SIZE)?;
        region[..SBLOCK_SIZE].fill(0);
        write_le_u32(region, 0x00, FS_MAGIC)?;
        write_le_u32(region, 0x04, self.bsize)?;
        write_le_u32(region, 0x08, self.fsize)?;
        write_le_u32(region, 0x0C, self.frag())?;
        write_le_u32(region, 0x10, self.fpg)?;
        write_le_u32(region, 0x14, self.ipg)?;
        write_le_u32(region, 0x18, self.ncg)?;
        write_le_u32(region, 0x1C, self.inode_size)?;
        write_le_u64(region, 0x20, self.size)?;
        write_le_u64(region, 0x28, self.dsize)?;
        write_le_u32(region, 0x30, self.sblkno)?;
        write_le_u32(region, 0x34, self.cblkno)?;
        write_le_u32(region, 0x38, self.iblkno)?;
        write_le_u32(region, 0x3C, self.dblkno)?;
        write_le_u32(region, 0x40, self.cgsize)?;
        write_le_u32(region, 0x44, self.cssize)?;
        write_le_u64(region, 0x48, self.csaddr.0)?;
        write_le_u32(region, 0x50, self.ndaddr)?;
        write_le_u32(region, 0x54, self.addr_width.bytes_u32())?;
        write_le_u32(region, 0x58, self.nsect)?;
        write_le_u32(region, 0x5C, self.ntrak)?;
        write_le_u32(region, 0x60, self.nrpos)?;
        write_le_u32(region, 0x64, self.cpg)?;
        write_le_u32(region, 0x68, self.rps)?;
        write_le_u32(region, 0x6C, self.rotdelay)?;
        write_le_u32(region, 0x70, self.contigsumsize)?;
        write_le_u32(region, 0x74, self.maxcontig)?;
        write_le_u32(region, 0x78, self.maxbpg)?;
        write_le_u32(region, 0x7C, self.minfree)?;
        write_le_u32(region, 0x80, self.optim.to_raw())?;
        write_le_u32(region, 0x84, self.avgfilesize)?;
        write_le_u32(region, 0x88, self.avgfpdir)?;
        write_le_u32(region, 0x8C, self.cgrotor)?;
        write_le_i64(region, 0x90, self.cstotal.ndir)?;
        write_le_i64(region, 0x98, self.cstotal.nbfree)?;
        write_le_i64(region, 0xA0, self.cstotal.nifree)?;
        write_le_i64(region, 0xA8, self.cstotal.nffree)?;
        write_le_i64(region, 0xB0, self.time)?;
        write_le_u32(region, 0xB8, u32::from(self.clean))?;
        write_le_u32(region, 0xBC, self.flags)?;
        let hash = crc32c::crc32c(&region[..HASH_OFFSET]);
        write_le_u32(region, HASH_OFFSET, hash)
    }

    /// Validate geometry relationships that the allocator relies on.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        let invalid = |field, reason| Err(ParseError::InvalidField { field, reason });

        // ── block / fragment sizes ──────────────────────────────────────
        if !self.bsize.is_power_of_two() || !(4096..=65_536).contains(&self.bsize) {
            return invalid("fs_bsize", "must be a power of two in 4096..=65536");
        }
        if !self.fsize.is_power_of_two() || self.fsize < 512 {
            return invalid("fs_fsize", "must be a power of two >= 512");
        }
        if self.fsize.checked_mul(self.frag()) != Some(self.bsize) {
            return invalid("fs_frag", "bsize must equal fsize * frag");
        }

        // ── group layout ────────────────────────────────────────────────
        if self.ncg == 0 {
            return invalid("fs_ncg", "cannot be zero");
        }
        if self.fpg == 0 || self.fpg % 8 != 0 || self.fpg % self.frag() != 0 {
            return invalid("fs_fpg", "must be a nonzero multiple of 8 and of frag");
        }
        if self.size != u64::from(self.fpg) * u64::from(self.ncg) {
            return invalid("fs_size", "must equal fpg * ncg");
        }
        if self.ipg == 0 || self.ipg % 8 != 0 || self.ipg % self.inopb() != 0 {
            return invalid("fs_ipg", "must be a nonzero multiple of 8 and of inodes-per-block");
        }
        let frag = self.frag();
        if [self.sblkno, self.cblkno, self.iblkno, self.dblkno]
            .iter()
            .any(|off| off % frag != 0)
        {
            return invalid("fs_dblkno", "metadata offsets must be block aligned");
        }
        if !(self.sblkno < self.cblkno && self.cblkno < self.iblkno && self.iblkno < self.dblkno)
        {
            return invalid("fs_dblkno", "metadata areas out of order");
        }
        if self.dblkno >= self.fpg {
            return invalid("fs_dblkno", "no data area left in group");
        }
        let cg_frags = u64::from(self.iblkno - self.cblkno) * u64::from(self.fsize);
        if u64::from(self.cgsize) > cg_frags {
            return invalid("fs_cgsize", "descriptor overlaps the inode table");
        }

        // ── inode / address format ──────────────────────────────────────
        if self.ndaddr == 0 || self.ndaddr > 64 {
            return invalid("fs_ndaddr", "must be in 1..=64");
        }
        if !self.inode_size.is_power_of_two()
            || self.inode_size > self.bsize
            || (self.inode_size as usize) < dinode_min_size(self.ndaddr as usize, self.addr_width)
        {
            return invalid("fs_inode_size", "must be a power of two holding every pointer");
        }

        // ── rotational / policy knobs ───────────────────────────────────
        if self.nrpos == 0 || self.nrpos > MAX_NRPOS {
            return invalid("fs_nrpos", "must be in 1..=32");
        }
        if self.nsect == 0 || self.ntrak == 0 || self.cpg == 0 {
            return invalid("fs_nsect", "sectors, tracks and cylinders must be nonzero");
        }
        if u64::from(self.fpg) * self.nspf() != u64::from(self.cpg) * self.spc() {
            return invalid("fs_cpg", "group must hold a whole number of cylinders");
        }
        if self.contigsumsize > FS_MAXCONTIG || self.contigsumsize > self.maxcontig {
            return invalid("fs_contigsumsize", "exceeds maxcontig or 16");
        }
        if self.maxcontig == 0 || self.maxbpg == 0 {
            return invalid("fs_maxcontig", "maxcontig and maxbpg must be nonzero");
        }
        if self.minfree > 99 {
            return invalid("fs_minfree", "must be below 100 percent");
        }
        if self.avgfilesize == 0 || self.avgfpdir == 0 {
            return invalid("fs_avgfpdir", "directory heuristics must be nonzero");
        }
        if self.rps == 0 {
            return invalid("fs_rps", "cannot be zero");
        }
        if (self.cgsize as usize) < CgLayout::new(self).size {
            return invalid("fs_cgsize", "too small for the group tables");
        }
        Ok(())
    }

    // ── size conversions ────────────────────────────────────────────────

    #[must_use]
    pub fn frag(&self) -> u32 {
        self.frags.count()
    }

    #[must_use]
    pub fn fragshift(&self) -> u32 {
        self.frag().trailing_zeros()
    }

    #[must_use]
    pub fn bshift(&self) -> u32 {
        self.bsize.trailing_zeros()
    }

    #[must_use]
    pub fn fshift(&self) -> u32 {
        self.fsize.trailing_zeros()
    }

    /// Sectors per fragment.
    #[must_use]
    pub fn nspf(&self) -> u64 {
        u64::from(self.fsize) / DEV_BSIZE
    }

    /// Sectors per cylinder.
    #[must_use]
    pub fn spc(&self) -> u64 {
        u64::from(self.nsect) * u64::from(self.ntrak)
    }

    #[must_use]
    pub fn blkstofrags(&self, blocks: u64) -> u64 {
        blocks << self.fragshift()
    }

    #[must_use]
    pub fn fragstoblks(&self, frags: u64) -> u64 {
        frags >> self.fragshift()
    }

    /// Whole fragments in `bytes` (truncating).
    #[must_use]
    pub fn numfrags(&self, bytes: u64) -> u64 {
        bytes >> self.fshift()
    }

    #[must_use]
    pub fn fragroundup(&self, bytes: u64) -> u64 {
        let mask = u64::from(self.fsize) - 1;
        (bytes + mask) & !mask
    }

    #[must_use]
    pub fn blkroundup(&self, bytes: u64) -> u64 {
        let mask = u64::from(self.bsize) - 1;
        (bytes + mask) & !mask
    }

    /// Byte offset within its block.
    #[must_use]
    pub fn blkoff(&self, offset: u64) -> u64 {
        offset & (u64::from(self.bsize) - 1)
    }

    /// Logical block containing byte `offset`.
    #[must_use]
    pub fn lblkno(&self, offset: u64) -> i64 {
        i64::try_from(offset >> self.bshift()).unwrap_or(i64::MAX)
    }

    /// First byte of logical block `lbn` (non-negative lbns only).
    #[must_use]
    pub fn lblktosize(&self, lbn: i64) -> u64 {
        u64::try_from(lbn).unwrap_or(0) << self.bshift()
    }

    /// Fragment index within its block.
    #[must_use]
    pub fn fragnum(&self, addr: u64) -> u32 {
        (addr % u64::from(self.frag())) as u32
    }

    /// Round a fragment address down to its block.
    #[must_use]
    pub fn blknum(&self, addr: u64) -> u64 {
        addr & !(u64::from(self.frag()) - 1)
    }

    /// Bytes to 512-byte sectors, the unit of inode `blocks`.
    #[must_use]
    pub fn btodb(bytes: u64) -> i64 {
        i64::try_from(bytes / DEV_BSIZE).unwrap_or(i64::MAX)
    }

    /// Addresses per indirect block.
    #[must_use]
    pub fn nindir(&self) -> u64 {
        u64::from(self.bsize) / self.addr_width.bytes() as u64
    }

    #[must_use]
    pub fn inopb(&self) -> u32 {
        self.bsize / self.inode_size.max(1)
    }

    /// Full blocks per cylinder group (`cg_nclusterblks`).
    #[must_use]
    pub fn blocks_per_group(&self) -> u32 {
        self.fpg >> self.fragshift()
    }

    #[must_use]
    pub fn frag_to_byte(&self, addr: DiskAddr) -> ByteOffset {
        ByteOffset(addr.0 << self.fshift())
    }

    // ── group placement ─────────────────────────────────────────────────

    #[must_use]
    pub fn cgbase(&self, cg: u32) -> u64 {
        u64::from(self.fpg) * u64::from(cg)
    }

    #[must_use]
    pub fn cgsblock(&self, cg: u32) -> DiskAddr {
        DiskAddr(self.cgbase(cg) + u64::from(self.sblkno))
    }

    /// Address of the cylinder group descriptor.
    #[must_use]
    pub fn cgtod(&self, cg: u32) -> DiskAddr {
        DiskAddr(self.cgbase(cg) + u64::from(self.cblkno))
    }

    #[must_use]
    pub fn cgimin(&self, cg: u32) -> DiskAddr {
        DiskAddr(self.cgbase(cg) + u64::from(self.iblkno))
    }

    #[must_use]
    pub fn cgdmin(&self, cg: u32) -> DiskAddr {
        DiskAddr(self.cgbase(cg) + u64::from(self.dblkno))
    }

    /// Group containing fragment `addr`.
    #[must_use]
    pub fn dtog(&self, addr: u64) -> u32 {
        (addr / u64::from(self.fpg)) as u32
    }

    /// Fragment offset of `addr` within its group.
    #[must_use]
    pub fn dtogd(&self, addr: u64) -> u32 {
        (addr % u64::from(self.fpg)) as u32
    }

    #[must_use]
    pub fn ino_to_cg(&self, ino: InodeNumber) -> u32 {
        (ino.0 / u64::from(self.ipg)) as u32
    }

    /// Fragment address of the block holding inode `ino`.
    #[must_use]
    pub fn ino_to_fsba(&self, ino: InodeNumber) -> DiskAddr {
        let cg = self.ino_to_cg(ino);
        let index = ino.0 % u64::from(self.ipg);
        DiskAddr(self.cgimin(cg).0 + self.blkstofrags(index / u64::from(self.inopb())))
    }

    /// Byte offset of inode `ino` within its inode block.
    #[must_use]
    pub fn ino_to_fsbo(&self, ino: InodeNumber) -> usize {
        ((ino.0 % u64::from(self.inopb())) * u64::from(self.inode_size)) as usize
    }

    // ── rotational layout ───────────────────────────────────────────────

    /// True when the per-cylinder rotational tables carry information.
    #[must_use]
    pub fn has_rotational_layout(&self) -> bool {
        self.nrpos > 1
    }

    /// Fragments in one cylinder.
    #[must_use]
    pub fn frags_per_cyl(&self) -> u32 {
        (self.spc() / self.nspf()) as u32
    }

    /// Cylinder holding the group-relative fragment `frag_in_group`.
    #[must_use]
    pub fn cbtocylno(&self, frag_in_group: u32) -> u32 {
        (u64::from(frag_in_group) * self.nspf() / self.spc()) as u32
    }

    /// Rotational position of the group-relative fragment `frag_in_group`.
    #[must_use]
    pub fn cbtorpos(&self, frag_in_group: u32) -> u32 {
        let nsect = u64::from(self.nsect);
        ((u64::from(frag_in_group) * self.nspf() % nsect) * u64::from(self.nrpos) / nsect) as u32
    }

    // ── capacity ────────────────────────────────────────────────────────

    /// Fragments still free after holding back `percent_reserved` of the
    /// data area. Negative when the reserve is already in use.
    #[must_use]
    pub fn freespace(&self, percent_reserved: u32) -> i64 {
        let free = (self.cstotal.nbfree << self.fragshift()) + self.cstotal.nffree;
        let reserve = i64::try_from(self.dsize * u64::from(percent_reserved) / 100)
            .unwrap_or(i64::MAX);
        free - reserve
    }

    /// Largest logical block addressable through the triple indirect.
    #[must_use]
    pub fn max_lbn(&self) -> i64 {
        let nindir = self.nindir();
        let reach = u64::from(self.ndaddr)
            .saturating_add(nindir)
            .saturating_add(nindir.saturating_mul(nindir))
            .saturating_add(nindir.saturating_mul(nindir).saturating_mul(nindir));
        i64::try_from(reach).unwrap_or(i64::MAX)
    }

    #[must_use]
    pub fn needs_check(&self) -> bool {
        self.flags & FS_NEEDSFSCK != 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 4 groups of 2048 one-KiB fragments, 4 KiB blocks, 32-bit addresses.
    pub(crate) fn sample() -> Superblock {
        Superblock {
            bsize: 4096,
            fsize: 1024,
            frags: FragsPerBlock::Four,
            fpg: 2048,
            ipg: 256,
            ncg: 4,
            inode_size: 128,
            size: 8192,
            dsize: 7000,
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
    fn sample_geometry_is_valid() {
        sample().validate_geometry().expect("valid");
    }

    #[test]
    fn region_round_trip_preserves_fields() {
        let mut sb = sample();
        sb.cstotal = CsSum {
            ndir: 1,
            nbfree: 1900,
            nifree: 1021,
            nffree: 3,
        };
        sb.optim = Optim::Space;
        let mut region = vec![0_u8; SBLOCK_SIZE];
        sb.write_region(&mut region).unwrap();
        let parsed = Superblock::parse_region(&region).unwrap();
        assert_eq!(parsed, sb);
    }

    #[test]
    fn corrupted_region_fails_check_hash() {
        let mut region = vec![0_u8; SBLOCK_SIZE];
        sample().write_region(&mut region).unwrap();
        region[0x98] ^= 0xFF;
        assert!(matches!(
            Superblock::parse_region(&region),
            Err(ParseError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let region = vec![0_u8; SBLOCK_SIZE];
        assert!(matches!(
            Superblock::parse_region(&region),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn geometry_rejects_mismatched_frag() {
        let mut sb = sample();
        sb.fsize = 2048;
        assert!(matches!(
            sb.validate_geometry(),
            Err(ParseError::InvalidField { field: "fs_frag", .. })
        ));
    }

    #[test]
    fn address_helpers() {
        let sb = sample();
        assert_eq!(sb.dtog(2047), 0);
        assert_eq!(sb.dtog(2048), 1);
        assert_eq!(sb.dtogd(2050), 2);
        assert_eq!(sb.cgdmin(2), DiskAddr(2 * 2048 + 104));
        assert_eq!(sb.fragroundup(1), 1024);
        assert_eq!(sb.fragroundup(1024), 1024);
        assert_eq!(sb.blkroundup(4097), 8192);
        assert_eq!(sb.numfrags(4096), 4);
        assert_eq!(sb.lblkno(4096 * 5 + 12), 5);
        assert_eq!(sb.blkoff(4096 * 5 + 12), 12);
        assert_eq!(sb.blknum(4103), 4100);
        assert_eq!(sb.fragnum(4103), 3);
        assert_eq!(sb.nindir(), 1024);
        assert_eq!(sb.inopb(), 32);
    }

    #[test]
    fn inode_location() {
        let sb = sample();
        let ino = InodeNumber(256 + 33);
        assert_eq!(sb.ino_to_cg(ino), 1);
        assert_eq!(sb.ino_to_fsba(ino), DiskAddr(2048 + 72 + 4));
        assert_eq!(sb.ino_to_fsbo(ino), 128);
    }

    #[test]
    fn rotational_position_wraps_per_track() {
        let sb = sample();
        // 2 sectors per fragment, 32 sectors per track: 16 fragments a track.
        assert_eq!(sb.frags_per_cyl(), 256);
        assert_eq!(sb.cbtorpos(0), 0);
        assert_eq!(sb.cbtorpos(2), 1);
        assert_eq!(sb.cbtorpos(16), 0);
        assert_eq!(sb.cbtocylno(255), 0);
        assert_eq!(sb.cbtocylno(256), 1);
    }

    #[test]
    fn freespace_subtracts_reserve() {
        let mut sb = sample();
        sb.cstotal.nbfree = 100;
        sb.cstotal.nffree = 5;
        // 405 free fragments, 8% of 7000 = 560 reserved.
        assert_eq!(sb.freespace(0), 405);
        assert_eq!(sb.freespace(8), 405 - 560);
    }

    #[test]
    fn csum_array_round_trip() {
        let cs = vec![
            CsSum {
                ndir: 1,
                nbfree: 10,
                nifree: 250,
                nffree: 3,
            },
            CsSum {
                ndir: 0,
                nbfree: 480,
                nifree: 256,
                nffree: 0,
            },
        ];
        let mut buf = vec![0_u8; 2 * CSUM_SIZE];
        encode_csum_array(&cs, &mut buf).unwrap();
        assert_eq!(decode_csum_array(&buf, 2).unwrap(), cs);
    }
}
