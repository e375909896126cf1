#![forbid(unsafe_code)]
//! Logical-to-physical block mapping through the inode's direct pointers
//! and up to three levels of indirect blocks.
//!
//! Indirect blocks are addressed with negative logical block numbers so the
//! same path machinery can locate metadata and data. A single indirect block
//! covering data starting at `L` has logical number `-L`; a double indirect
//! block `-(L + 1)`; a triple indirect block `-(L + 2)`.
//!
//! ```text
//!   lbn < D                      Direct(lbn)
//!   D <= lbn < D + F             ib[0] -> entry
//!   D + F <= lbn < D + F + F^2   ib[1] -> entry -> entry
//!   ...                          ib[2] -> entry -> entry -> entry
//! ```

use ffs_block::BufferCache;
use ffs_error::{FfsError, Result};
use ffs_inode::Inode;
use ffs_ondisk::{NIADDR, Superblock, read_addr};
use ffs_types::DiskAddr;
use tracing::trace;

// ── Paths ───────────────────────────────────────────────────────────────────

/// One hop through an indirect block: the block's own logical number and
/// the entry to follow inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indir {
    pub lbn: i64,
    pub off: usize,
    /// Set by [`locate`] when the block was found on disk.
    pub exists: bool,
}

/// Where a logical block's pointer lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPath {
    /// Index into the inode's direct array.
    Direct(usize),
    /// Start at `ib[slot]`, then follow `walk` from the outermost indirect
    /// block inwards. An empty walk names the root indirect block itself.
    Indirect { slot: usize, walk: Vec<Indir> },
}

impl BlockPath {
    /// Number of indirect blocks read to reach the pointer.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            Self::Direct(_) => 0,
            Self::Indirect { walk, .. } => walk.len(),
        }
    }

    #[must_use]
    pub fn walk(&self) -> &[Indir] {
        match self {
            Self::Direct(_) => &[],
            Self::Indirect { walk, .. } => walk,
        }
    }
}

/// Logical number of the root indirect block at `slot` (0 single, 1 double,
/// 2 triple).
#[must_use]
pub fn root_lbn(ndaddr: u32, nindir: u64, slot: usize) -> i64 {
    let mut first = i64::from(ndaddr);
    let mut span = 1_i64;
    let fanout = i64::try_from(nindir).unwrap_or(i64::MAX);
    for _ in 0..slot {
        span = span.saturating_mul(fanout);
        first = first.saturating_add(span);
    }
    -(first + i64::try_from(slot).unwrap_or(0))
}

/// Compute the indirection path for `lbn`.
///
/// Non-negative numbers are data blocks. Negative numbers name indirect
/// blocks; their walk ends at the parent entry that points at them.
pub fn indirection_path(ndaddr: u32, nindir: u64, lbn: i64) -> Result<BlockPath> {
    let nd = u64::from(ndaddr);
    let magnitude = lbn.unsigned_abs();
    if magnitude < nd {
        if lbn < 0 {
            return Err(FfsError::InvalidArgument(format!(
                "logical block {lbn} names no indirect block"
            )));
        }
        return Ok(BlockPath::Direct(usize::try_from(magnitude).map_err(
            |_| FfsError::InvalidArgument(format!("logical block {lbn}")),
        )?));
    }
    if nindir < 2 {
        return Err(FfsError::InvalidGeometry(format!(
            "{nindir} addresses per indirect block"
        )));
    }

    // Find how many levels of indirection cover the block. `blockcnt` ends
    // as the number of data blocks reachable from the root at that level.
    let mut bn = magnitude - nd;
    let mut blockcnt = 1_u64;
    let mut levels = 0_usize;
    loop {
        if levels == NIADDR {
            return Err(FfsError::FileTooLarge);
        }
        blockcnt = blockcnt.checked_mul(nindir).ok_or(FfsError::FileTooLarge)?;
        levels += 1;
        if bn < blockcnt {
            break;
        }
        bn -= blockcnt;
    }
    let slot = levels - 1;

    let to_i64 = |v: u64| i64::try_from(v).map_err(|_| FfsError::FileTooLarge);
    let mut metalbn = -(to_i64(magnitude)? - to_i64(bn)? + to_i64(slot as u64)?);
    let mut walk = Vec::with_capacity(levels);
    for _ in 0..levels {
        if metalbn == lbn {
            break;
        }
        blockcnt /= nindir;
        let off = (bn / blockcnt) % nindir;
        walk.push(Indir {
            lbn: metalbn,
            off: usize::try_from(off).map_err(|_| FfsError::FileTooLarge)?,
            exists: false,
        });
        metalbn = metalbn + 1 - to_i64(off * blockcnt)?;
    }
    Ok(BlockPath::Indirect { slot, walk })
}

// ── Resolution ──────────────────────────────────────────────────────────────

/// Result of mapping one logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Fragment address, or [`DiskAddr::HOLE`].
    pub addr: DiskAddr,
    /// Physically contiguous blocks following `addr` in the same pointer array.
    pub run_forward: u32,
    /// Physically contiguous blocks preceding `addr` in the same pointer array.
    pub run_back: u32,
}

impl Mapping {
    const HOLE: Self = Self {
        addr: DiskAddr::HOLE,
        run_forward: 0,
        run_back: 0,
    };

    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.addr.is_hole()
    }
}

/// Read the address array of the indirect block at `addr`.
pub fn read_indirect(cache: &BufferCache, sb: &Superblock, addr: DiskAddr) -> Result<Vec<DiskAddr>> {
    let buf = cache.read_block(sb.frag_to_byte(addr), sb.bsize as usize)?;
    let entries = ffs_ondisk::decode_addrs(&buf, sb.addr_width).map_err(|err| {
        FfsError::Corruption {
            block: addr.0,
            detail: format!("indirect block: {err}"),
        }
    })?;
    buf.release();
    Ok(entries)
}

fn read_entry(cache: &BufferCache, sb: &Superblock, block: DiskAddr, off: usize) -> Result<DiskAddr> {
    let buf = cache.read_block(sb.frag_to_byte(block), sb.bsize as usize)?;
    let addr = read_addr(&buf, off, sb.addr_width).map_err(|err| FfsError::Corruption {
        block: block.0,
        detail: format!("indirect entry {off}: {err}"),
    })?;
    buf.release();
    Ok(addr)
}

fn is_sequential(sb: &Superblock, prev: DiskAddr, next: DiskAddr) -> bool {
    !prev.is_hole() && !next.is_hole() && next.0 == prev.0 + u64::from(sb.frag())
}

/// Contiguous run lengths around `idx` in `addrs`, each capped at `maxrun`.
fn runs(sb: &Superblock, addrs: &[DiskAddr], idx: usize, maxrun: u32) -> (u32, u32) {
    let mut forward = 0;
    let mut i = idx + 1;
    while i < addrs.len() && forward < maxrun && is_sequential(sb, addrs[i - 1], addrs[i]) {
        forward += 1;
        i += 1;
    }
    let mut back = 0;
    let mut i = idx;
    while i > 0 && back < maxrun && is_sequential(sb, addrs[i - 1], addrs[i]) {
        back += 1;
        i -= 1;
    }
    (forward, back)
}

/// Follow `path` from the inode, marking each indirect block that exists.
///
/// Returns the path with `exists` filled in and the address of the final
/// pointer's target (hole if any level is missing).
pub fn locate(
    cache: &BufferCache,
    sb: &Superblock,
    ip: &Inode,
    path: BlockPath,
) -> Result<(BlockPath, DiskAddr)> {
    match path {
        BlockPath::Direct(i) => {
            let addr = ip.db.get(i).copied().unwrap_or(DiskAddr::HOLE);
            Ok((BlockPath::Direct(i), addr))
        }
        BlockPath::Indirect { slot, mut walk } => {
            let mut daddr = ip.ib[slot];
            for step in &mut walk {
                if daddr.is_hole() {
                    break;
                }
                step.exists = true;
                daddr = read_entry(cache, sb, daddr, step.off)?;
            }
            Ok((BlockPath::Indirect { slot, walk }, daddr))
        }
    }
}

/// Map logical block `lbn` of `ip` to a fragment address.
///
/// Holes are not errors. When `want_runs` is set the forward and backward
/// contiguity of the neighbouring pointers is measured, capped at
/// `maxcontig - 1`.
pub fn bmap(
    cache: &BufferCache,
    sb: &Superblock,
    ip: &Inode,
    lbn: i64,
    want_runs: bool,
) -> Result<Mapping> {
    let maxrun = sb.maxcontig.saturating_sub(1);
    let path = indirection_path(sb.ndaddr, sb.nindir(), lbn)?;
    let mapping = match path {
        BlockPath::Direct(i) => {
            let addr = ip.db.get(i).copied().unwrap_or(DiskAddr::HOLE);
            if addr.is_hole() {
                Mapping::HOLE
            } else {
                let (run_forward, run_back) = if want_runs {
                    runs(sb, &ip.db, i, maxrun)
                } else {
                    (0, 0)
                };
                Mapping {
                    addr,
                    run_forward,
                    run_back,
                }
            }
        }
        BlockPath::Indirect { slot, walk } => {
            let mut daddr = ip.ib[slot];
            let Some((last, outer)) = walk.split_last() else {
                return Ok(Mapping {
                    addr: daddr,
                    run_forward: 0,
                    run_back: 0,
                });
            };
            for step in outer {
                if daddr.is_hole() {
                    return Ok(Mapping::HOLE);
                }
                daddr = read_entry(cache, sb, daddr, step.off)?;
            }
            if daddr.is_hole() {
                return Ok(Mapping::HOLE);
            }
            if want_runs {
                let addrs = read_indirect(cache, sb, daddr)?;
                let addr = addrs.get(last.off).copied().unwrap_or(DiskAddr::HOLE);
                if addr.is_hole() {
                    Mapping::HOLE
                } else {
                    let (run_forward, run_back) = runs(sb, &addrs, last.off, maxrun);
                    Mapping {
                        addr,
                        run_forward,
                        run_back,
                    }
                }
            } else {
                Mapping {
                    addr: read_entry(cache, sb, daddr, last.off)?,
                    run_forward: 0,
                    run_back: 0,
                }
            }
        }
    };
    trace!(
        target: "ffs::bmap",
        ino = ip.number.0,
        lbn,
        addr = mapping.addr.0,
        run_forward = mapping.run_forward,
        "bmap"
    );
    Ok(mapping)
}
