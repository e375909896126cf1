//! Moving a run of a file's blocks into one physically contiguous cluster.

use ffs_alloc::FsCtx;
use ffs_bmap::{BlockPath, indirection_path, read_indirect};
use ffs_error::{FfsError, Result};
use ffs_inode::{Inode, blksize, update_inode};
use ffs_journal::{AllocationRecord, AllocationSite};
use ffs_ondisk::{Superblock, write_addr};
use ffs_types::DiskAddr;
use tracing::{debug, trace, warn};

use crate::balloc::{IoFlags, write_meta};

/// First and last logical blocks sharing a pointer array with `lbn`.
pub(crate) fn pointer_array_bounds(sb: &Superblock, lbn: i64) -> Result<(i64, i64)> {
    let nd = i64::from(sb.ndaddr);
    if lbn < nd {
        return Ok((0, nd - 1));
    }
    let path = indirection_path(sb.ndaddr, sb.nindir(), lbn)?;
    let off = path.walk().last().map_or(0, |w| w.off);
    let off = i64::try_from(off)
        .map_err(|_| FfsError::InvalidArgument(format!("pointer slot {off} for lbn {lbn}")))?;
    let span = i64::try_from(sb.nindir()).map_err(|_| {
        FfsError::InvalidGeometry(format!("{} addresses per indirect block", sb.nindir()))
    })?;
    Ok((lbn - off, lbn - off + span - 1))
}

/// Where the pointers for a run live.
#[derive(Clone, Copy)]
enum Site {
    Inode,
    Indirect(DiskAddr),
}

fn same_array(a: &BlockPath, b: &BlockPath) -> bool {
    match (a, b) {
        (BlockPath::Direct(_), BlockPath::Direct(_)) => true,
        (
            BlockPath::Indirect { slot: sa, walk: wa },
            BlockPath::Indirect { slot: sb, walk: wb },
        ) => {
            sa == sb
                && wa.len() == wb.len()
                && wa.last().map(|w| w.lbn) == wb.last().map(|w| w.lbn)
        }
        _ => false,
    }
}

/// Try to replace logical blocks `start..=end` of `ip` with a freshly
/// allocated contiguous run.
///
/// Only full blocks mapped by a single pointer array qualify, at most
/// `maxcontig` of them. Returns `false` without changing anything when the
/// run does not qualify, is already contiguous, or no cluster is free.
/// Otherwise the data is copied, the pointers rewritten, and the old blocks
/// freed.
pub fn realloc_blocks(
    ctx: &FsCtx<'_>,
    ip: &mut Inode,
    start: i64,
    end: i64,
    flags: IoFlags,
) -> Result<bool> {
    let sb = ctx.sb;
    if start < 0 || end <= start {
        return Err(FfsError::InvalidArgument(format!(
            "block range {start}..={end} is empty"
        )));
    }
    let len = end - start + 1;
    if len > i64::from(sb.maxcontig) {
        return Ok(false);
    }
    let first = indirection_path(sb.ndaddr, sb.nindir(), start)?;
    let last = indirection_path(sb.ndaddr, sb.nindir(), end)?;
    if !same_array(&first, &last) || blksize(sb, ip.size, end) != sb.bsize {
        return Ok(false);
    }

    let (site, bap, first_idx) = match &first {
        BlockPath::Direct(i) => (Site::Inode, ip.db.clone(), *i),
        BlockPath::Indirect { walk, .. } => {
            let Some(tail) = walk.last() else {
                return Ok(false);
            };
            let parent = ffs_bmap::bmap(ctx.cache, sb, ip, tail.lbn, false)?.addr;
            if parent.is_hole() {
                return Ok(false);
            }
            (Site::Indirect(parent), read_indirect(ctx.cache, sb, parent)?, tail.off)
        }
    };
    let count = usize::try_from(len)
        .map_err(|_| FfsError::InvalidArgument(format!("block range {start}..={end}")))?;
    let Some(old) = bap.get(first_idx..first_idx + count) else {
        return Ok(false);
    };
    let old = old.to_vec();
    if old.iter().any(|a| a.is_hole()) {
        return Ok(false);
    }
    let frag = u64::from(sb.frag());
    let contiguous = old
        .iter()
        .enumerate()
        .all(|(k, a)| a.0 == old[0].0 + k as u64 * frag);
    if contiguous {
        return Ok(false);
    }

    let pref = ctx.blkpref(ip, start, first_idx, &bap);
    let blocks = u32::try_from(count)
        .map_err(|_| FfsError::InvalidArgument(format!("cluster of {count} blocks")))?;
    let Some(new_start) = ctx.alloc_cluster(ip, pref, blocks)? else {
        debug!(target: "ffs::realloc", event = "no_cluster", ino = ip.number.0, start, len);
        return Ok(false);
    };
    let new: Vec<DiskAddr> = (0..count as u64)
        .map(|k| DiskAddr(new_start.0 + k * frag))
        .collect();

    if let Err(err) = copy_blocks(ctx, &old, &new) {
        for addr in &new {
            if let Err(e) = ctx.blkfree(ip.number, *addr, sb.bsize) {
                warn!(target: "ffs::realloc", event = "undo_free_failed", addr = addr.0, error = %e);
            }
        }
        return Err(err);
    }

    match site {
        Site::Inode => {
            ip.db[first_idx..first_idx + count].copy_from_slice(&new);
            update_inode(ctx.cache, sb, ip, flags.sync)?;
        }
        Site::Indirect(parent) => {
            let mut bp = ctx
                .cache
                .read_block(sb.frag_to_byte(parent), sb.bsize as usize)?;
            for (k, addr) in new.iter().enumerate() {
                write_addr(&mut bp, first_idx + k, sb.addr_width, *addr).map_err(|err| {
                    FfsError::Corruption {
                        block: parent.0,
                        detail: format!("indirect block: {err}"),
                    }
                })?;
            }
            write_meta(bp, flags.sync)?;
        }
    }
    if let Some(deps) = ctx.deps {
        for (k, (addr, prev)) in new.iter().zip(&old).enumerate() {
            let site = match site {
                Site::Inode => AllocationSite::Inode,
                Site::Indirect(parent) => AllocationSite::Indirect {
                    parent,
                    slot: first_idx + k,
                },
            };
            deps.record_allocation(AllocationRecord {
                ino: ip.number,
                lbn: start + k as i64,
                new_addr: *addr,
                old_addr: *prev,
                new_size: sb.bsize,
                old_size: sb.bsize,
                site,
                buffer: Some(sb.frag_to_byte(*addr)),
            });
        }
    }
    for addr in &old {
        ctx.blkfree(ip.number, *addr, sb.bsize)?;
    }
    trace!(target: "ffs::realloc", event = "clustered", ino = ip.number.0, start, len, to = new_start.0);
    Ok(true)
}

fn copy_blocks(ctx: &FsCtx<'_>, from: &[DiskAddr], to: &[DiskAddr]) -> Result<()> {
    let sb = ctx.sb;
    let bsize = sb.bsize as usize;
    for (src, dst) in from.iter().zip(to) {
        let data = {
            let buf = ctx.cache.read_block(sb.frag_to_byte(*src), bsize)?;
            let data = buf.to_vec();
            buf.release();
            data
        };
        let mut out = ctx.cache.get_block(sb.frag_to_byte(*dst), bsize)?;
        out.copy_from_slice(&data);
        out.write_delayed();
    }
    Ok(())
}
