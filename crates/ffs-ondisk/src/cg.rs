//! Cylinder group descriptor.
//!
//! ```text
//! 0x00  magic        u32      0x30  frsum[8]      i32 x 8
//! 0x04  cgx          u32      0x50  time          i64
//! 0x08  ncyl         u32      0x58  nclusterblks  u32
//! 0x0C  niblk        u32      0x5C  check hash    u32 (crc32c, field zeroed)
//! 0x10  ndblk        u32      0x60  btot[cpg]     i32 per cylinder
//! 0x14  cs           4 x i32        b[cpg][nrpos] i16
//! 0x24  rotor        u32            inosused      ipg bits
//! 0x28  frotor       u32            blksfree      fpg bits (set = free)
//! 0x2C  irotor       u32            clustersum    i32 x (contigsumsize + 1)
//!                                   clustersfree  one bit per block
//! ```
//!
//! The descriptor is decoded into an owned [`CylinderGroup`], mutated, and
//! encoded back into the same buffer before the buffer is released.

use ffs_types::{
    ParseError, ensure_slice, read_le_i16, read_le_i32, read_le_i64, read_le_u32, write_le_i16,
    write_le_i32, write_le_i64, write_le_u32,
};

use crate::superblock::{CsSum, MAXFRAG, Superblock};

pub const CG_MAGIC: u32 = 0x0009_0255;

const HEADER_SIZE: usize = 0x60;
const HASH_OFFSET: usize = 0x5C;

/// Byte offsets of the variable-length tables for one geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgLayout {
    pub btot: usize,
    pub b: usize,
    pub inosused: usize,
    pub blksfree: usize,
    pub clustersum: usize,
    pub clustersfree: usize,
    pub size: usize,
}

impl CgLayout {
    #[must_use]
    pub fn new(sb: &Superblock) -> Self {
        let cpg = sb.cpg as usize;
        let btot = HEADER_SIZE;
        let b = btot + cpg * 4;
        let inosused = b + cpg * sb.nrpos as usize * 2;
        let blksfree = inosused + (sb.ipg as usize).div_ceil(8);
        let clustersum = blksfree + (sb.fpg as usize).div_ceil(8);
        let clustersfree = clustersum + (sb.contigsumsize as usize + 1) * 4;
        let size = clustersfree + (sb.blocks_per_group() as usize).div_ceil(8);
        Self {
            btot,
            b,
            inosused,
            blksfree,
            clustersum,
            clustersfree,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CylinderGroup {
    pub cgx: u32,
    pub ncyl: u32,
    /// Inodes in this group.
    pub niblk: u32,
    /// Fragments in this group.
    pub ndblk: u32,
    pub cs: CsSum,
    /// Last full-block allocation (group-relative fragment).
    pub rotor: u32,
    /// Last fragment allocation (group-relative fragment).
    pub frotor: u32,
    /// Last inode allocation (group-relative index).
    pub irotor: u32,
    /// `frsum[n]`: free runs of exactly `n` fragments inside partly used blocks.
    pub frsum: [i32; MAXFRAG],
    pub time: i64,
    pub nclusterblks: u32,
    /// Free blocks per cylinder.
    pub btot: Vec<i32>,
    /// Free blocks per (cylinder, rotational position), row-major.
    pub b: Vec<i16>,
    pub inosused: Vec<u8>,
    pub blksfree: Vec<u8>,
    /// `clustersum[n]`: free clusters of length `n` (the last bucket is "n or more").
    pub clustersum: Vec<i32>,
    pub clustersfree: Vec<u8>,
}

impl CylinderGroup {
    /// A descriptor with every table zeroed (everything allocated).
    #[must_use]
    pub fn empty(sb: &Superblock, cgx: u32) -> Self {
        Self {
            cgx,
            ncyl: sb.cpg,
            niblk: sb.ipg,
            ndblk: sb.fpg,
            cs: CsSum::default(),
            rotor: 0,
            frotor: 0,
            irotor: 0,
            frsum: [0; MAXFRAG],
            time: 0,
            nclusterblks: sb.blocks_per_group(),
            btot: vec![0; sb.cpg as usize],
            b: vec![0; sb.cpg as usize * sb.nrpos as usize],
            inosused: vec![0; (sb.ipg as usize).div_ceil(8)],
            blksfree: vec![0; (sb.fpg as usize).div_ceil(8)],
            clustersum: vec![0; sb.contigsumsize as usize + 1],
            clustersfree: vec![0; (sb.blocks_per_group() as usize).div_ceil(8)],
        }
    }

    /// Rotational-position row for cylinder `cylno`.
    pub fn rot_row_mut(&mut self, sb: &Superblock, cylno: u32) -> &mut [i16] {
        let nrpos = sb.nrpos as usize;
        let start = cylno as usize * nrpos;
        &mut self.b[start..start + nrpos]
    }

    #[must_use]
    pub fn rot_row(&self, sb: &Superblock, cylno: u32) -> &[i16] {
        let nrpos = sb.nrpos as usize;
        let start = cylno as usize * nrpos;
        &self.b[start..start + nrpos]
    }

    pub fn parse_from_bytes(sb: &Superblock, bytes: &[u8]) -> Result<Self, ParseError> {
        let layout = CgLayout::new(sb);
        let bytes = ensure_slice(bytes, 0, layout.size)?;
        let magic = read_le_u32(bytes, 0x00)?;
        if magic != CG_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(CG_MAGIC),
                actual: u64::from(magic),
            });
        }
        let stored = read_le_u32(bytes, HASH_OFFSET)?;
        let computed = check_hash(bytes);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch { stored, computed });
        }

        let ncyl = read_le_u32(bytes, 0x08)?;
        let niblk = read_le_u32(bytes, 0x0C)?;
        let ndblk = read_le_u32(bytes, 0x10)?;
        let nclusterblks = read_le_u32(bytes, 0x58)?;
        if ncyl != sb.cpg || niblk != sb.ipg || ndblk != sb.fpg || nclusterblks != sb.blocks_per_group()
        {
            return Err(ParseError::InvalidField {
                field: "cg_ndblk",
                reason: "group shape disagrees with superblock",
            });
        }

        let mut frsum = [0_i32; MAXFRAG];
        for (i, slot) in frsum.iter_mut().enumerate() {
            *slot = read_le_i32(bytes, 0x30 + i * 4)?;
        }
        let btot = (0..sb.cpg as usize)
            .map(|i| read_le_i32(bytes, layout.btot + i * 4))
            .collect::<Result<Vec<_>, _>>()?;
        let b = (0..sb.cpg as usize * sb.nrpos as usize)
            .map(|i| read_le_i16(bytes, layout.b + i * 2))
            .collect::<Result<Vec<_>, _>>()?;
        let clustersum = (0..=sb.contigsumsize as usize)
            .map(|i| read_le_i32(bytes, layout.clustersum + i * 4))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            cgx: read_le_u32(bytes, 0x04)?,
            ncyl,
            niblk,
            ndblk,
            cs: CsSum::decode32(bytes, 0x14)?,
            rotor: read_le_u32(bytes, 0x24)?,
            frotor: read_le_u32(bytes, 0x28)?,
            irotor: read_le_u32(bytes, 0x2C)?,
            frsum,
            time: read_le_i64(bytes, 0x50)?,
            nclusterblks,
            btot,
            b,
            inosused: bytes[layout.inosused..layout.blksfree].to_vec(),
            blksfree: bytes[layout.blksfree..layout.clustersum].to_vec(),
            clustersum,
            clustersfree: bytes[layout.clustersfree..layout.size].to_vec(),
        })
    }

    /// Encode into `out` (at least `CgLayout::size` bytes) with a fresh check hash.
    pub fn write_to_bytes(&self, sb: &Superblock, out: &mut [u8]) -> Result<(), ParseError> {
        let layout = CgLayout::new(sb);
        ensure_slice(out, 0, layout.size)?;
        out[..layout.size].fill(0);
        write_le_u32(out, 0x00, CG_MAGIC)?;
        write_le_u32(out, 0x04, self.cgx)?;
        write_le_u32(out, 0x08, self.ncyl)?;
        write_le_u32(out, 0x0C, self.niblk)?;
        write_le_u32(out, 0x10, self.ndblk)?;
        self.cs.encode32(out, 0x14)?;
        write_le_u32(out, 0x24, self.rotor)?;
        write_le_u32(out, 0x28, self.frotor)?;
        write_le_u32(out, 0x2C, self.irotor)?;
        for (i, count) in self.frsum.iter().enumerate() {
            write_le_i32(out, 0x30 + i * 4, *count)?;
        }
        write_le_i64(out, 0x50, self.time)?;
        write_le_u32(out, 0x58, self.nclusterblks)?;
        for (i, count) in self.btot.iter().enumerate() {
            write_le_i32(out, layout.btot + i * 4, *count)?;
        }
        for (i, count) in self.b.iter().enumerate() {
            write_le_i16(out, layout.b + i * 2, *count)?;
        }
        out[layout.inosused..layout.blksfree].copy_from_slice(&self.inosused);
        out[layout.blksfree..layout.clustersum].copy_from_slice(&self.blksfree);
        for (i, count) in self.clustersum.iter().enumerate() {
            write_le_i32(out, layout.clustersum + i * 4, *count)?;
        }
        out[layout.clustersfree..layout.size].copy_from_slice(&self.clustersfree);
        let hash = check_hash(&out[..layout.size]);
        write_le_u32(out, HASH_OFFSET, hash)
    }
}

fn check_hash(bytes: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&bytes[..HASH_OFFSET]);
    let crc = crc32c::crc32c_append(crc, &[0_u8; 4]);
    crc32c::crc32c_append(crc, &bytes[HASH_OFFSET + 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblock::tests::sample;

    #[test]
    fn layout_for_sample_geometry() {
        let sb = sample();
        let layout = CgLayout::new(&sb);
        assert_eq!(layout.btot, 0x60);
        assert_eq!(layout.b, 0x60 + 32);
        assert_eq!(layout.inosused, 0x60 + 32 + 128);
        assert_eq!(layout.blksfree, layout.inosused + 32);
        assert_eq!(layout.clustersum, layout.blksfree + 256);
        assert_eq!(layout.clustersfree, layout.clustersum + 36);
        assert_eq!(layout.size, layout.clustersfree + 64);
        assert!(layout.size <= sb.cgsize as usize);
    }

    #[test]
    fn encode_decode_preserves_tables() {
        let sb = sample();
        let mut cg = CylinderGroup::empty(&sb, 2);
        cg.cs.nbfree = 400;
        cg.cs.nffree = 7;
        cg.frsum[3] = 1;
        cg.frsum[4] = 1;
        cg.rotor = 520;
        cg.btot[1] = 12;
        cg.rot_row_mut(&sb, 1)[3] = 2;
        cg.blksfree[40] = 0xF0;
        cg.clustersum[8] = 3;
        cg.clustersfree[5] = 0x81;
        let mut buf = vec![0_u8; sb.cgsize as usize];
        cg.write_to_bytes(&sb, &mut buf).unwrap();
        let back = CylinderGroup::parse_from_bytes(&sb, &buf).unwrap();
        assert_eq!(back, cg);
        assert_eq!(back.rot_row(&sb, 1)[3], 2);
    }

    #[test]
    fn flipped_bitmap_bit_breaks_check_hash() {
        let sb = sample();
        let cg = CylinderGroup::empty(&sb, 0);
        let mut buf = vec![0_u8; sb.cgsize as usize];
        cg.write_to_bytes(&sb, &mut buf).unwrap();
        let layout = CgLayout::new(&sb);
        buf[layout.blksfree] ^= 1;
        assert!(matches!(
            CylinderGroup::parse_from_bytes(&sb, &buf),
            Err(ParseError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn wrong_magic_rejected() {
        let sb = sample();
        let buf = vec![0_u8; sb.cgsize as usize];
        assert!(matches!(
            CylinderGroup::parse_from_bytes(&sb, &buf),
            Err(ParseError::InvalidMagic { .. })
        ));
    }
}
