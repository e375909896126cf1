//! Backing a byte range of a file with storage.
//!
//! [`balloc`] makes sure the logical block containing a write has a
//! physical block (or, for a short last direct block, a fragment run) and
//! returns a buffer for it, building any missing indirect blocks on the way.
//! A failure part way through releases everything allocated by the call.

use ffs_alloc::{Cred, FsCtx};
use ffs_block::Buf;
use ffs_bmap::{BlockPath, Indir, indirection_path};
use ffs_error::{FfsError, Result};
use ffs_inode::{Inode, blksize, update_inode};
use ffs_journal::{AllocationRecord, AllocationSite};
use ffs_ondisk::{Superblock, decode_addrs, read_addr, write_addr};
use ffs_types::{ByteOffset, DiskAddr, ParseError};
use tracing::{debug, trace, warn};

/// Per-call I/O behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoFlags {
    /// The returned buffer must hold valid contents: existing data is read
    /// in and freshly allocated space is zeroed.
    pub clear: bool,
    /// Write modified metadata synchronously.
    pub sync: bool,
    /// Leave trimmed indirect blocks as delayed writes during truncation.
    pub async_free: bool,
}

fn corrupt(block: DiskAddr, err: &ParseError) -> FfsError {
    FfsError::Corruption {
        block: block.0,
        detail: format!("indirect block: {err}"),
    }
}

pub(crate) fn write_meta(buf: Buf<'_>, sync: bool) -> Result<()> {
    if sync {
        buf.write_sync()
    } else {
        buf.write_delayed();
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn record(
    ctx: &FsCtx<'_>,
    ip: &Inode,
    lbn: i64,
    new_addr: DiskAddr,
    old_addr: DiskAddr,
    new_size: u32,
    old_size: u32,
    site: AllocationSite,
    buffer: Option<ByteOffset>,
) {
    if let Some(deps) = ctx.deps {
        deps.record_allocation(AllocationRecord {
            ino: ip.number,
            lbn,
            new_addr,
            old_addr,
            new_size,
            old_size,
            site,
            buffer,
        });
    }
}

/// What this call has linked in so far, for unwinding.
#[derive(Debug, Default)]
struct Undo {
    /// Every run allocated, with its size in bytes, in allocation order.
    blocks: Vec<(DiskAddr, u32)>,
    /// Root indirect slot set in the inode.
    root: Option<usize>,
    /// First pointer set inside a block that existed before the call.
    link: Option<(DiskAddr, usize)>,
}

impl Undo {
    fn note_link(&mut self, parent: DiskAddr, off: usize) {
        if self.root.is_none() && self.link.is_none() {
            self.link = Some((parent, off));
        }
    }
}

/// Ensure storage exists for `len` bytes at byte `offset` of `ip` (within a
/// single block) and return a buffer over the whole allocated unit.
///
/// If the file currently ends in a short direct block and the write lies in
/// a later block, that short block is first grown to a full block. On
/// failure every block allocated by this call is freed, pointers linked by
/// it are cleared, and the inode's block count is restored.
pub fn balloc<'a>(
    ctx: &FsCtx<'a>,
    ip: &mut Inode,
    offset: u64,
    len: u32,
    cred: Cred,
    flags: IoFlags,
) -> Result<Buf<'a>> {
    let sb = ctx.sb;
    let lbn = sb.lblkno(offset);
    let size = sb.blkoff(offset) + u64::from(len);
    if len == 0 || size > u64::from(sb.bsize) {
        return Err(FfsError::InvalidArgument(format!(
            "balloc of {len} bytes at {offset} crosses a block boundary"
        )));
    }
    if lbn >= sb.max_lbn() {
        return Err(FfsError::FileTooLarge);
    }
    let nd = i64::from(sb.ndaddr);

    let lastlbn = sb.lblkno(ip.size);
    if lastlbn < nd && lastlbn < lbn {
        grow_last_fragment(ctx, ip, lastlbn, cred)?;
    }

    let mut undo = Undo::default();
    let res = if lbn < nd {
        direct(ctx, ip, lbn, size, cred, flags, &mut undo)
    } else {
        let BlockPath::Indirect { slot, walk } = indirection_path(sb.ndaddr, sb.nindir(), lbn)?
        else {
            return Err(FfsError::InvalidArgument(format!(
                "lbn {lbn} resolved to a direct slot"
            )));
        };
        indirect(ctx, ip, lbn, slot, &walk, cred, flags, &mut undo)
    };
    match res {
        Ok(buf) => Ok(buf),
        Err(err) => {
            unwind(ctx, ip, undo, &err);
            Err(err)
        }
    }
}

/// Promote a short last direct block to a full block before the file grows
/// past it.
fn grow_last_fragment(ctx: &FsCtx<'_>, ip: &mut Inode, lastlbn: i64, cred: Cred) -> Result<()> {
    let sb = ctx.sb;
    let osize = blksize(sb, ip.size, lastlbn);
    if osize == 0 || osize >= sb.bsize {
        return Ok(());
    }
    let nb = usize::try_from(lastlbn).unwrap_or(0);
    let old = ip.db[nb];
    let pref = ctx.blkpref(ip, lastlbn, nb, &ip.db);
    let (addr, buf) = ctx.realloccg(ip, lastlbn, pref, osize, sb.bsize, cred)?;
    ip.size = sb.lblktosize(lastlbn + 1);
    ip.db[nb] = addr;
    record(
        ctx,
        ip,
        lastlbn,
        addr,
        old,
        sb.bsize,
        osize,
        AllocationSite::Inode,
        Some(buf.offset()),
    );
    trace!(target: "ffs::balloc", event = "grow_last_fragment", ino = ip.number.0, lbn = lastlbn, osize, addr = addr.0);
    buf.write_sync()
}

fn direct<'a>(
    ctx: &FsCtx<'a>,
    ip: &mut Inode,
    lbn: i64,
    size: u64,
    cred: Cred,
    flags: IoFlags,
    undo: &mut Undo,
) -> Result<Buf<'a>> {
    let sb = ctx.sb;
    let i = usize::try_from(lbn).unwrap_or(0);
    let nb = ip.db[i];

    if !nb.is_hole() && ip.size >= sb.lblktosize(lbn + 1) {
        return ctx.cache.read_block(sb.frag_to_byte(nb), sb.bsize as usize);
    }

    let (addr, buf) = if nb.is_hole() {
        let nsize = if ip.size < sb.lblktosize(lbn + 1) {
            frag_size(sb, size)
        } else {
            sb.bsize
        };
        let pref = ctx.blkpref(ip, lbn, i, &ip.db);
        let addr = ctx.alloc(ip, lbn, pref, nsize, cred)?;
        undo.blocks.push((addr, nsize));
        let mut buf = ctx.cache.get_block(sb.frag_to_byte(addr), nsize as usize)?;
        if flags.clear {
            buf.clear();
        }
        record(
            ctx,
            ip,
            lbn,
            addr,
            DiskAddr::HOLE,
            nsize,
            0,
            AllocationSite::Inode,
            Some(buf.offset()),
        );
        (addr, buf)
    } else {
        let osize = blksize(sb, ip.size, lbn);
        if osize == 0 {
            return Err(FfsError::Corruption {
                block: nb.0,
                detail: format!("inode {} maps lbn {lbn} past its size {}", ip.number, ip.size),
            });
        }
        let nsize = frag_size(sb, size);
        if nsize <= osize {
            (nb, ctx.cache.read_block(sb.frag_to_byte(nb), osize as usize)?)
        } else {
            let pref = ctx.blkpref(ip, lbn, i, &ip.db);
            let (addr, buf) = ctx.realloccg(ip, lbn, pref, osize, nsize, cred)?;
            record(
                ctx,
                ip,
                lbn,
                addr,
                nb,
                nsize,
                osize,
                AllocationSite::Inode,
                Some(buf.offset()),
            );
            (addr, buf)
        }
    };
    ip.db[i] = addr;
    Ok(buf)
}

fn frag_size(sb: &Superblock, bytes: u64) -> u32 {
    u32::try_from(sb.fragroundup(bytes)).unwrap_or(sb.bsize)
}

/// Fill a freshly allocated indirect block with holes. It reaches the disk
/// before the pointer to it: synchronously, or through the dependency log
/// when one is installed.
fn init_indirect(
    ctx: &FsCtx<'_>,
    ip: &Inode,
    meta_lbn: i64,
    addr: DiskAddr,
    site: AllocationSite,
) -> Result<()> {
    let sb = ctx.sb;
    let mut buf = ctx.cache.get_block(sb.frag_to_byte(addr), sb.bsize as usize)?;
    buf.clear();
    trace!(target: "ffs::balloc", event = "new_indirect", ino = ip.number.0, lbn = meta_lbn, addr = addr.0);
    if ctx.deps.is_some() {
        record(
            ctx,
            ip,
            meta_lbn,
            addr,
            DiskAddr::HOLE,
            sb.bsize,
            0,
            site,
            Some(buf.offset()),
        );
        buf.write_delayed();
        Ok(())
    } else {
        buf.write_sync()
    }
}

#[allow(clippy::too_many_arguments)]
fn indirect<'a>(
    ctx: &FsCtx<'a>,
    ip: &mut Inode,
    lbn: i64,
    slot: usize,
    walk: &[Indir],
    cred: Cred,
    flags: IoFlags,
    undo: &mut Undo,
) -> Result<Buf<'a>> {
    let sb = ctx.sb;
    let bsize = sb.bsize as usize;
    let width = sb.addr_width;
    let mut pref = 0;

    let mut nb = ip.ib[slot];
    if nb.is_hole() {
        pref = ctx.blkpref(ip, lbn, 0, &[]);
        let root = ctx.alloc(ip, lbn, pref, sb.bsize, cred)?;
        undo.blocks.push((root, sb.bsize));
        init_indirect(ctx, ip, walk[0].lbn, root, AllocationSite::Inode)?;
        ip.ib[slot] = root;
        undo.root = Some(slot);
        nb = root;
    }

    let last = walk.len() - 1;
    let mut level = 0;
    let mut bp = loop {
        let mut bp = ctx.cache.read_block(sb.frag_to_byte(nb), bsize)?;
        if level == last {
            break bp;
        }
        let off = walk[level].off;
        let child = read_addr(&bp, off, width).map_err(|err| corrupt(nb, &err))?;
        level += 1;
        if !child.is_hole() {
            bp.release();
            nb = child;
            continue;
        }
        if pref == 0 {
            pref = ctx.blkpref(ip, lbn, 0, &[]);
        }
        let child = ctx.alloc(ip, lbn, pref, sb.bsize, cred)?;
        undo.blocks.push((child, sb.bsize));
        init_indirect(
            ctx,
            ip,
            walk[level].lbn,
            child,
            AllocationSite::Indirect { parent: nb, slot: off },
        )?;
        write_addr(&mut bp, off, width, child).map_err(|err| corrupt(nb, &err))?;
        undo.note_link(nb, off);
        write_meta(bp, flags.sync)?;
        nb = child;
    };

    let off = walk[last].off;
    let existing = read_addr(&bp, off, width).map_err(|err| corrupt(nb, &err))?;
    if !existing.is_hole() {
        bp.release();
        let offset = sb.frag_to_byte(existing);
        return if flags.clear {
            ctx.cache.read_block(offset, bsize)
        } else {
            ctx.cache.get_block(offset, bsize)
        };
    }

    if pref == 0 {
        let bap = decode_addrs(&bp, width).map_err(|err| corrupt(nb, &err))?;
        pref = ctx.blkpref(ip, lbn, off, &bap);
    }
    let data_addr = ctx.alloc(ip, lbn, pref, sb.bsize, cred)?;
    undo.blocks.push((data_addr, sb.bsize));
    let mut data = ctx.cache.get_block(sb.frag_to_byte(data_addr), bsize)?;
    if flags.clear {
        data.clear();
    }
    record(
        ctx,
        ip,
        lbn,
        data_addr,
        DiskAddr::HOLE,
        sb.bsize,
        0,
        AllocationSite::Indirect { parent: nb, slot: off },
        Some(data.offset()),
    );
    write_addr(&mut bp, off, width, data_addr).map_err(|err| corrupt(nb, &err))?;
    undo.note_link(nb, off);
    write_meta(bp, flags.sync)?;
    Ok(data)
}

/// Release everything recorded in `undo` and put the inode back the way the
/// caller handed it in. Failures here are logged; the original error wins.
fn unwind(ctx: &FsCtx<'_>, ip: &mut Inode, undo: Undo, err: &FfsError) {
    if undo.blocks.is_empty() {
        return;
    }
    let sb = ctx.sb;
    debug!(
        target: "ffs::balloc",
        event = "rollback",
        ino = ip.number.0,
        blocks = undo.blocks.len(),
        error = %err
    );
    if let Some(slot) = undo.root {
        ip.ib[slot] = DiskAddr::HOLE;
    } else if let Some((parent, off)) = undo.link {
        let cleared = ctx
            .cache
            .read_block(sb.frag_to_byte(parent), sb.bsize as usize)
            .and_then(|mut bp| {
                write_addr(&mut bp, off, sb.addr_width, DiskAddr::HOLE)
                    .map_err(|e| corrupt(parent, &e))?;
                bp.write_sync()
            });
        if let Err(e) = cleared {
            warn!(target: "ffs::balloc", event = "rollback_unlink_failed", ino = ip.number.0, parent = parent.0, error = %e);
        }
    }
    for &(addr, size) in undo.blocks.iter().rev() {
        if let Err(e) = ctx.blkfree(ip.number, addr, size) {
            warn!(target: "ffs::balloc", event = "rollback_free_failed", ino = ip.number.0, addr = addr.0, error = %e);
        }
        ip.blocks -= Superblock::btodb(u64::from(size));
    }
    if let Err(e) = update_inode(ctx.cache, sb, ip, true) {
        warn!(target: "ffs::balloc", event = "rollback_update_failed", ino = ip.number.0, error = %e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Mounted;
    use ffs_ondisk::IFREG;

    fn new_file(fs: &Mounted) -> Inode {
        let ctx = fs.ctx();
        let root = fs.root();
        let mut ip = ctx.valloc(&root, IFREG | 0o644, Cred::ROOT).unwrap();
        ip.nlink = 1;
        ip
    }

    fn fill(fs: &Mounted, ip: &mut Inode, offset: u64, len: u32) -> DiskAddr {
        let ctx = fs.ctx();
        let buf = balloc(&ctx, ip, offset, len, Cred::ROOT, IoFlags::default()).unwrap();
        let addr = DiskAddr(buf.offset().0 / u64::from(fs.sb.fsize));
        buf.write_delayed();
        ip.size = ip.size.max(offset + u64::from(len));
        addr
    }

    #[test]
    fn short_file_gets_a_fragment_then_a_full_block() {
        let fs = Mounted::new();
        let mut ip = new_file(&fs);
        let a = fill(&fs, &mut ip, 0, 1000);
        assert_eq!(ip.db[0], a);
        assert_eq!(ip.blocks, 2);

        // Writing into block 1 promotes block 0 to a full block first.
        let b = fill(&fs, &mut ip, 4096, 512);
        assert_eq!(ip.blocks, 8 + 2);
        assert_eq!(ip.db[1], b);
        assert_eq!(ip.size, 4096 + 512);
        assert!(fs.ctx().checkblk(ip.db[0], 4096).unwrap());
    }

    #[test]
    fn first_indirect_block_is_built_at_lbn_twelve() {
        let fs = Mounted::new();
        let mut ip = new_file(&fs);
        let before = fs.free_blocks();
        let data = fill(&fs, &mut ip, 12 * 4096, 4096);
        assert!(!ip.ib[0].is_hole());
        assert_eq!(ip.blocks, 16);
        assert_eq!(fs.free_blocks(), before - 2);

        let ctx = fs.ctx();
        let bp = ctx
            .cache
            .read_block(fs.sb.frag_to_byte(ip.ib[0]), 4096)
            .unwrap();
        assert_eq!(read_addr(&bp, 0, fs.sb.addr_width).unwrap(), data);
        bp.release();
    }

    #[test]
    fn existing_block_is_returned_without_allocating() {
        let fs = Mounted::new();
        let mut ip = new_file(&fs);
        let first = fill(&fs, &mut ip, 13 * 4096, 4096);
        let blocks = ip.blocks;
        let again = fill(&fs, &mut ip, 13 * 4096 + 100, 10);
        assert_eq!(first, again);
        assert_eq!(ip.blocks, blocks);
    }

    #[test]
    fn rollback_returns_a_direct_fragment_run() {
        let fs = Mounted::new();
        let mut ip = new_file(&fs);
        let ctx = fs.ctx();
        let free = fs.fs.stats().cstotal;
        let pref = ctx.blkpref(&ip, 0, 0, &ip.db);
        let addr = ctx.alloc(&mut ip, 0, pref, 2048, Cred::ROOT).unwrap();
        assert_eq!(ip.blocks, 4);

        let undo = Undo {
            blocks: vec![(addr, 2048)],
            ..Undo::default()
        };
        unwind(&ctx, &mut ip, undo, &FfsError::Io(std::io::Error::other("device gone")));
        assert_eq!(ip.blocks, 0);
        assert!(ip.db[0].is_hole());
        assert!(!ctx.checkblk(addr, 2048).unwrap());
        let now = fs.fs.stats().cstotal;
        assert_eq!(now.nbfree * 4 + now.nffree, free.nbfree * 4 + free.nffree);
    }

    #[test]
    fn rejects_ranges_crossing_a_block() {
        let fs = Mounted::new();
        let mut ip = new_file(&fs);
        let ctx = fs.ctx();
        let err = balloc(&ctx, &mut ip, 4000, 200, Cred::ROOT, IoFlags::default()).unwrap_err();
        assert!(matches!(err, FfsError::InvalidArgument(_)));
    }

    #[test]
    fn beyond_triple_reach_is_too_large() {
        let fs = Mounted::new();
        let mut ip = new_file(&fs);
        let ctx = fs.ctx();
        let offset = fs.sb.lblktosize(fs.sb.max_lbn());
        let err = balloc(&ctx, &mut ip, offset, 1, Cred::ROOT, IoFlags::default()).unwrap_err();
        assert!(matches!(err, FfsError::FileTooLarge));
    }
}
