//! Laying out a fresh filesystem on a device.
//!
//! Every group has the same shape: an unused area up to the superblock copy
//! (boot blocks in group 0, free data elsewhere), the superblock copy, the
//! group descriptor, the inode table and then data. The per-group summary
//! array lives at the start of group 0's data area.

use ffs_alloc::bitmap::{bitmap_set, set_block};
use ffs_alloc::rebuild_summaries;
use ffs_block::ByteDevice;
use ffs_error::{FfsError, Result};
use ffs_inode::{Inode, now_secs};
use ffs_ondisk::{
    AddrWidth, CSUM_SIZE, CgLayout, CsSum, CylinderGroup, Dinode, FS_MAXCONTIG, FragsPerBlock,
    IFDIR, MAX_NRPOS, Optim, SBLOCK_OFFSET, SBLOCK_SIZE, Superblock, encode_csum_array,
};
use ffs_types::{DiskAddr, InodeNumber};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Tunables for [`format_device`].
///
/// Fields mirror the classic `newfs` switches. `maxbpg` defaults to one
/// indirect block's worth of pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub bsize: u32,
    pub fsize: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u32,
    pub ndaddr: u32,
    pub addr_width: AddrWidth,
    pub minfree: u32,
    pub optim: Optim,
    pub maxcontig: u32,
    pub maxbpg: Option<u32>,
    /// Milliseconds between back-to-back transfers; 0 lays blocks out
    /// contiguously.
    pub rotdelay: u32,
    pub rps: u32,
    pub nsect: u32,
    pub ntrak: u32,
    pub nrpos: u32,
    pub avgfilesize: u32,
    pub avgfpdir: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            bsize: 8192,
            fsize: 1024,
            frags_per_group: 16_384,
            inodes_per_group: 2048,
            inode_size: 128,
            ndaddr: 12,
            addr_width: AddrWidth::U32,
            minfree: 8,
            optim: Optim::Time,
            maxcontig: 8,
            maxbpg: None,
            rotdelay: 0,
            rps: 60,
            nsect: 32,
            ntrak: 16,
            nrpos: 8,
            avgfilesize: 16_384,
            avgfpdir: 64,
        }
    }
}

fn geometry_error(detail: impl Into<String>) -> FfsError {
    FfsError::InvalidGeometry(detail.into())
}

/// Derive the superblock for a device of `dev_len` bytes.
pub fn plan_superblock(opts: &FormatOptions, dev_len: u64) -> Result<Superblock> {
    if opts.fsize == 0 || !opts.fsize.is_power_of_two() || opts.bsize % opts.fsize != 0 {
        return Err(geometry_error(format!(
            "block size {} is not a multiple of fragment size {}",
            opts.bsize, opts.fsize
        )));
    }
    let frags = FragsPerBlock::try_from(opts.bsize / opts.fsize)
        .map_err(|err| geometry_error(err.to_string()))?;
    let fpg = opts.frags_per_group;
    if fpg == 0 {
        return Err(geometry_error("frags_per_group cannot be zero"));
    }
    let ncg = u32::try_from(dev_len / (u64::from(fpg) * u64::from(opts.fsize)))
        .map_err(|_| geometry_error("too many cylinder groups"))?;
    if ncg == 0 {
        return Err(geometry_error(format!(
            "device of {dev_len} bytes is smaller than one cylinder group"
        )));
    }
    if opts.nrpos == 0 || opts.nrpos > MAX_NRPOS {
        return Err(geometry_error(format!("nrpos {} out of range", opts.nrpos)));
    }

    let spc = u64::from(opts.nsect) * u64::from(opts.ntrak);
    let nspf = u64::from(opts.fsize) / 512;
    if spc == 0 || nspf == 0 || (u64::from(fpg) * nspf) % spc != 0 {
        return Err(geometry_error(format!(
            "a group of {fpg} fragments is not a whole number of {spc}-sector cylinders"
        )));
    }
    let cpg = u32::try_from(u64::from(fpg) * nspf / spc)
        .map_err(|_| geometry_error("cylinders per group overflow"))?;
    let nindir = opts.bsize / opts.addr_width.bytes_u32();
    let maxcontig = opts.maxcontig.clamp(1, FS_MAXCONTIG);

    let mut sb = Superblock {
        bsize: opts.bsize,
        fsize: opts.fsize,
        frags,
        fpg,
        ipg: opts.inodes_per_group,
        ncg,
        inode_size: opts.inode_size,
        size: u64::from(fpg) * u64::from(ncg),
        dsize: 0,
        sblkno: 0,
        cblkno: 0,
        iblkno: 0,
        dblkno: 0,
        cgsize: 0,
        cssize: 0,
        csaddr: DiskAddr::HOLE,
        ndaddr: opts.ndaddr,
        addr_width: opts.addr_width,
        nsect: opts.nsect,
        ntrak: opts.ntrak,
        nrpos: opts.nrpos,
        cpg,
        rps: opts.rps,
        rotdelay: opts.rotdelay,
        contigsumsize: maxcontig,
        maxcontig,
        maxbpg: opts.maxbpg.unwrap_or(nindir).max(1),
        minfree: opts.minfree,
        optim: opts.optim,
        avgfilesize: opts.avgfilesize,
        avgfpdir: opts.avgfpdir,
        cgrotor: 0,
        cstotal: CsSum::default(),
        time: now_secs(),
        clean: true,
        flags: 0,
    };

    // SBLOCK_OFFSET is block aligned for every supported block size.
    let sblkno = u32::try_from(SBLOCK_OFFSET / u64::from(sb.fsize))
        .map_err(|_| geometry_error("superblock offset overflow"))?;
    let frag_bytes = |sb: &Superblock, bytes: u64| {
        u32::try_from(sb.blkroundup(bytes) / u64::from(sb.fsize))
            .map_err(|_| geometry_error("metadata area overflow"))
    };
    sb.sblkno = sblkno;
    sb.cblkno = sblkno + frag_bytes(&sb, SBLOCK_SIZE as u64)?;
    let cgsize = CgLayout::new(&sb).size;
    sb.cgsize = u32::try_from(cgsize).map_err(|_| geometry_error("descriptor overflow"))?;
    sb.iblkno = sb.cblkno + frag_bytes(&sb, cgsize as u64)?;
    sb.dblkno = sb.iblkno + frag_bytes(&sb, u64::from(sb.ipg) * u64::from(sb.inode_size))?;

    let cssize = sb.fragroundup(u64::from(ncg) * CSUM_SIZE as u64);
    sb.cssize = u32::try_from(cssize).map_err(|_| geometry_error("summary area overflow"))?;
    sb.csaddr = sb.cgdmin(0);
    let cs_frags = sb.numfrags(cssize);
    if u64::from(sb.dblkno) + cs_frags >= u64::from(fpg) {
        return Err(geometry_error(format!(
            "group of {fpg} fragments has no room for data after {} metadata fragments",
            sb.dblkno
        )));
    }
    let meta = u64::from(sb.dblkno - sb.sblkno);
    sb.dsize = sb.size - u64::from(ncg) * meta - u64::from(sb.sblkno) - cs_frags;

    sb.validate_geometry()
        .map_err(|err| geometry_error(err.to_string()))?;
    Ok(sb)
}

/// Build the descriptor for group `cgx` of a fresh filesystem.
fn initial_group(sb: &Superblock, cgx: u32) -> CylinderGroup {
    let mut cg = CylinderGroup::empty(sb, cgx);
    let frag = sb.frag();
    if cgx > 0 {
        for blkno in 0..sb.sblkno / frag {
            set_block(&mut cg.blksfree, sb.frags, blkno);
        }
    }
    let mut start = sb.dblkno;
    if cgx == 0 {
        let cs_frags = u32::try_from(sb.numfrags(u64::from(sb.cssize))).unwrap_or(u32::MAX);
        start = sb.dblkno + cs_frags;
        // Free the tail of a partly used summary block fragment by fragment.
        while start % frag != 0 && start < sb.fpg {
            bitmap_set(&mut cg.blksfree, start);
            start += 1;
        }
        // 0 and 1 are reserved, 2 is the root.
        for ino in 0..=2 {
            bitmap_set(&mut cg.inosused, ino);
        }
        cg.cs.ndir = 1;
    }
    for blkno in start / frag..sb.blocks_per_group() {
        set_block(&mut cg.blksfree, sb.frags, blkno);
    }
    rebuild_summaries(sb, &mut cg);
    cg.time = sb.time;
    cg
}

/// Write a fresh filesystem to `dev` and return its superblock.
///
/// Inode tables are zeroed, every group descriptor and superblock copy is
/// written, and group 0 receives the summary array and the root directory
/// inode (inodes 0 and 1 are reserved).
pub fn format_device(dev: &dyn ByteDevice, opts: &FormatOptions) -> Result<Superblock> {
    let mut sb = plan_superblock(opts, dev.len_bytes())?;
    let fsize = u64::from(sb.fsize);
    let table_len = usize::try_from(u64::from(sb.ipg) * u64::from(sb.inode_size))
        .map_err(|_| geometry_error("inode table overflow"))?;
    let zero_table = vec![0_u8; table_len];

    let mut cs = Vec::with_capacity(sb.ncg as usize);
    let mut descriptor = vec![0_u8; sb.cgsize as usize];
    for cgx in 0..sb.ncg {
        let cg = initial_group(&sb, cgx);
        cg.write_to_bytes(&sb, &mut descriptor)
            .map_err(|err| FfsError::Format(format!("cylinder group {cgx}: {err}")))?;
        dev.write_all_at(sb.frag_to_byte(sb.cgtod(cgx)).0, &descriptor)?;
        dev.write_all_at(sb.frag_to_byte(sb.cgimin(cgx)).0, &zero_table)?;
        debug!(target: "ffs::format", event = "cg_written", cg = cgx, nbfree = cg.cs.nbfree, nffree = cg.cs.nffree);
        cs.push(cg.cs);
    }
    for sum in &cs {
        sb.cstotal.add(sum);
    }

    let mut root = Inode::new(InodeNumber::ROOT, sb.ndaddr as usize);
    root.mode = IFDIR | 0o755;
    root.nlink = 2;
    root.generation = 1;
    root.touch();
    let mut slot = vec![0_u8; sb.inode_size as usize];
    let dinode: Dinode = root.to_dinode();
    dinode
        .write_to_bytes(&mut slot, sb.addr_width)
        .map_err(|err| FfsError::Format(format!("root inode: {err}")))?;
    let root_off = sb.frag_to_byte(sb.ino_to_fsba(InodeNumber::ROOT)).0
        + sb.ino_to_fsbo(InodeNumber::ROOT) as u64;
    dev.write_all_at(root_off, &slot)?;

    let mut csbuf = vec![0_u8; sb.cssize as usize];
    encode_csum_array(&cs, &mut csbuf)
        .map_err(|err| FfsError::Format(format!("summary array: {err}")))?;
    dev.write_all_at(sb.frag_to_byte(sb.csaddr).0, &csbuf)?;

    let mut region = vec![0_u8; SBLOCK_SIZE];
    sb.write_region(&mut region)
        .map_err(|err| FfsError::Format(format!("superblock: {err}")))?;
    for cgx in 0..sb.ncg {
        dev.write_all_at(sb.cgsblock(cgx).0 * fsize, &region)?;
    }
    dev.sync()?;
    info!(
        target: "ffs::format",
        event = "format_complete",
        ncg = sb.ncg,
        bsize = sb.bsize,
        fsize = sb.fsize,
        dsize = sb.dsize,
        nbfree = sb.cstotal.nbfree,
        nffree = sb.cstotal.nffree
    );
    Ok(sb)
}
