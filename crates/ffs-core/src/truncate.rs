//! Changing a file's length.
//!
//! Shrinking is ordered for crash safety: the inode with its trimmed
//! pointers and new size reaches the disk before any block it no longer
//! references is returned to the free map. A crash in between leaks blocks
//! that a later check reclaims; it never leaves a block both free and
//! referenced.

use ffs_alloc::{Cred, FsCtx};
use ffs_bmap::root_lbn;
use ffs_error::{FfsError, Result};
use ffs_inode::{Inode, blksize, update_inode};
use ffs_ondisk::{NIADDR, Superblock, clear_from, decode_addrs};
use ffs_types::{DiskAddr, InodeNumber};
use tracing::{debug, trace, warn};

use crate::balloc::{IoFlags, balloc, write_meta};

fn keep_first(slot: &mut Option<FfsError>, err: Option<FfsError>) {
    if slot.is_none() {
        *slot = err;
    }
}

/// Set `ip`'s length to `length`.
///
/// Growing allocates (and zeroes) only the block holding the new last byte.
/// Shrinking zeroes the tail of the new last block, writes the inode, then
/// frees indirect trees from the triple level down, the direct blocks past
/// the end, and the unused fragments of the new last block. Errors met while
/// freeing do not stop the walk; the first one is returned.
pub fn truncate(
    ctx: &FsCtx<'_>,
    ip: &mut Inode,
    length: u64,
    cred: Cred,
    flags: IoFlags,
) -> Result<()> {
    let sb = ctx.sb;
    if length > sb.lblktosize(sb.max_lbn()) {
        return Err(FfsError::FileTooLarge);
    }
    let osize = ip.size;
    if length == osize {
        ip.touch();
        return update_inode(ctx.cache, sb, ip, flags.sync);
    }

    if length > osize {
        let buf = balloc(
            ctx,
            ip,
            length - 1,
            1,
            cred,
            IoFlags {
                clear: true,
                ..flags
            },
        )?;
        ip.size = length;
        write_meta(buf, flags.sync)?;
        ip.touch();
        trace!(target: "ffs::truncate", event = "extend", ino = ip.number.0, from = osize, to = length);
        return update_inode(ctx.cache, sb, ip, true);
    }

    // Zero the part of the new last block beyond the new end so a later
    // extension reads zeroes.
    let offset = sb.blkoff(length);
    if offset == 0 {
        ip.size = length;
    } else {
        let lbn = sb.lblkno(length);
        let mut buf = balloc(
            ctx,
            ip,
            length - 1,
            1,
            cred,
            IoFlags {
                clear: true,
                ..flags
            },
        )?;
        ip.size = length;
        let size = blksize(sb, length, lbn) as usize;
        let offset = offset as usize;
        if let Some(tail) = buf.get_mut(offset..size) {
            tail.fill(0);
        }
        buf.resize(size);
        write_meta(buf, flags.sync)?;
    }
    shrink(ctx, ip, osize, length, flags)
}

/// Last logical block still wanted under each indirect level, or -1 when the
/// whole level goes.
fn last_indirect_blocks(sb: &Superblock, lastblock: i64) -> [i64; NIADDR] {
    let nindir = i64::try_from(sb.nindir()).unwrap_or(i64::MAX);
    let single = lastblock - i64::from(sb.ndaddr);
    let double = single - nindir;
    let triple = double - nindir.saturating_mul(nindir);
    [single, double, triple]
}

fn shrink(
    ctx: &FsCtx<'_>,
    ip: &mut Inode,
    osize: u64,
    length: u64,
    flags: IoFlags,
) -> Result<()> {
    let sb = ctx.sb;
    let nd = i64::from(sb.ndaddr);
    let nindir = sb.nindir();
    let lastblock = sb.lblkno(length + u64::from(sb.bsize) - 1) - 1;
    let mut lastiblock = last_indirect_blocks(sb, lastblock);

    // Trim a copy of the pointers and commit it first.
    let old_db = ip.db.clone();
    let old_ib = ip.ib;
    for level in (0..NIADDR).rev() {
        if lastiblock[level] < 0 {
            ip.ib[level] = DiskAddr::HOLE;
            lastiblock[level] = -1;
        }
    }
    let keep_direct = usize::try_from(lastblock + 1).unwrap_or(0);
    for slot in ip.db.iter_mut().skip(keep_direct) {
        *slot = DiskAddr::HOLE;
    }
    ip.touch();
    if let Err(err) = update_inode(ctx.cache, sb, ip, true) {
        ip.db = old_db;
        ip.ib = old_ib;
        ip.size = osize;
        return Err(err);
    }
    let new_db = std::mem::replace(&mut ip.db, old_db);
    let new_ib = std::mem::replace(&mut ip.ib, old_ib);
    ip.size = osize;

    let mut first_err = None;
    let mut released: i64 = 0;
    let per_block = Superblock::btodb(u64::from(sb.bsize));
    let mut partial_indirect = false;
    for level in (0..NIADDR).rev() {
        let bn = ip.ib[level];
        if !bn.is_hole() {
            let lbn = root_lbn(sb.ndaddr, nindir, level);
            let (count, err) = indirtrunc(
                ctx,
                ip.number,
                lbn,
                bn,
                lastiblock[level],
                level,
                flags.async_free,
            );
            released += count;
            keep_first(&mut first_err, err);
            if lastiblock[level] < 0 {
                ip.ib[level] = DiskAddr::HOLE;
                match ctx.blkfree(ip.number, bn, sb.bsize) {
                    Ok(()) => released += per_block,
                    Err(err) => keep_first(&mut first_err, Some(err)),
                }
            }
        }
        if lastiblock[level] >= 0 {
            partial_indirect = true;
            break;
        }
    }

    if !partial_indirect {
        for i in (keep_direct..ip.db.len()).rev() {
            let bn = ip.db[i];
            if bn.is_hole() {
                continue;
            }
            ip.db[i] = DiskAddr::HOLE;
            let bsize = blksize(sb, ip.size, i64::try_from(i).unwrap_or(i64::MAX));
            match ctx.blkfree(ip.number, bn, bsize) {
                Ok(()) => released += Superblock::btodb(u64::from(bsize)),
                Err(err) => keep_first(&mut first_err, Some(err)),
            }
        }

        // The new last block may now need fewer fragments.
        if let Ok(lb) = usize::try_from(lastblock) {
            let bn = ip.db[lb];
            if !bn.is_hole() {
                let oldspace = blksize(sb, ip.size, lastblock);
                ip.size = length;
                let newspace = blksize(sb, ip.size, lastblock);
                if newspace == 0 {
                    keep_first(
                        &mut first_err,
                        Some(FfsError::Corruption {
                            block: bn.0,
                            detail: format!("inode {} last block shrank to nothing", ip.number),
                        }),
                    );
                } else if oldspace > newspace {
                    let tail = DiskAddr(bn.0 + sb.numfrags(u64::from(newspace)));
                    match ctx.blkfree(ip.number, tail, oldspace - newspace) {
                        Ok(()) => released += Superblock::btodb(u64::from(oldspace - newspace)),
                        Err(err) => keep_first(&mut first_err, Some(err)),
                    }
                }
            }
        }
    }

    if ip.db != new_db || ip.ib != new_ib {
        warn!(target: "ffs::truncate", event = "pointer_mismatch", ino = ip.number.0);
    }
    ip.db = new_db;
    ip.ib = new_ib;
    ip.size = length;
    ip.blocks = (ip.blocks - released).max(0);
    ip.touch_ctime();
    let updated = update_inode(ctx.cache, sb, ip, flags.sync);
    keep_first(&mut first_err, updated.err());
    debug!(
        target: "ffs::truncate",
        event = "shrink",
        ino = ip.number.0,
        from = osize,
        to = length,
        released,
        failed = first_err.is_some()
    );
    first_err.map_or(Ok(()), Err)
}

/// Free the entries of the indirect block `addr` (logical number `lbn`,
/// `level` levels above the data) past logical block `lastbn`, counted from
/// the first data block it maps. -1 frees every entry. Returns sectors
/// released and the first error met.
fn indirtrunc(
    ctx: &FsCtx<'_>,
    ino: InodeNumber,
    lbn: i64,
    addr: DiskAddr,
    lastbn: i64,
    level: usize,
    async_free: bool,
) -> (i64, Option<FfsError>) {
    if level >= NIADDR {
        return (
            0,
            Some(FfsError::Corruption {
                block: addr.0,
                detail: format!("inode {ino} indirect chain deeper than {NIADDR} levels"),
            }),
        );
    }
    let sb = ctx.sb;
    let nindir = i64::try_from(sb.nindir()).unwrap_or(i64::MAX);
    let factor = (0..level).fold(1_i64, |acc, _| acc.saturating_mul(nindir));
    let last = if lastbn >= 0 { lastbn / factor } else { -1 };

    let mut buf = match ctx.cache.read_block(sb.frag_to_byte(addr), sb.bsize as usize) {
        Ok(buf) => buf,
        Err(err) => return (0, Some(err)),
    };
    let entries = match decode_addrs(&buf, sb.addr_width) {
        Ok(entries) => entries,
        Err(err) => {
            buf.release();
            return (
                0,
                Some(FfsError::Corruption {
                    block: addr.0,
                    detail: format!("indirect block: {err}"),
                }),
            );
        }
    };
    let keep = usize::try_from(last + 1).unwrap_or(0).min(entries.len());

    let mut first_err = None;
    if entries[keep..].iter().any(|a| !a.is_hole()) {
        clear_from(&mut buf, keep, sb.addr_width);
        keep_first(&mut first_err, write_meta(buf, !async_free).err());
    } else {
        buf.release();
    }

    let per_block = Superblock::btodb(u64::from(sb.bsize));
    let mut released = 0;
    for i in (keep..entries.len()).rev() {
        let nb = entries[i];
        if nb.is_hole() {
            continue;
        }
        if level > 0 {
            let nlbn = lbn + 1 - i64::try_from(i).unwrap_or(0) * factor;
            let (count, err) = indirtrunc(ctx, ino, nlbn, nb, -1, level - 1, async_free);
            released += count;
            keep_first(&mut first_err, err);
        }
        match ctx.blkfree(ino, nb, sb.bsize) {
            Ok(()) => released += per_block,
            Err(err) => keep_first(&mut first_err, Some(err)),
        }
    }

    if level > 0 && last >= 0 {
        let i = usize::try_from(last).unwrap_or(0);
        if let Some(&nb) = entries.get(i).filter(|a| !a.is_hole()) {
            let nlbn = lbn + 1 - last * factor;
            let (count, err) =
                indirtrunc(ctx, ino, nlbn, nb, lastbn % factor, level - 1, async_free);
            released += count;
            keep_first(&mut first_err, err);
        }
    }
    trace!(target: "ffs::truncate", event = "indirtrunc", ino = ino.0, lbn, addr = addr.0, lastbn, level, released);
    (released, first_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Mounted;

    #[test]
    fn last_indirect_blocks_per_level() {
        let m = Mounted::new();
        // nindir 1024, 12 direct pointers.
        assert_eq!(last_indirect_blocks(&m.sb, -1), [-13, -1037, -1_049_613]);
        assert_eq!(last_indirect_blocks(&m.sb, 11), [-1, -1025, -1_049_601]);
        assert_eq!(last_indirect_blocks(&m.sb, 12), [0, -1024, -1_049_600]);
        assert_eq!(last_indirect_blocks(&m.sb, 1036), [1024, 0, -1_048_576]);
    }

    #[test]
    fn shrinking_inside_the_direct_range_frees_tail_fragments() {
        let m = Mounted::new();
        let mut ip = m.file();
        m.fs.write(&mut ip, 0, &[9_u8; 3 * 4096], Cred::ROOT).unwrap();
        let before = m.fs.stats().cstotal;

        m.fs.truncate(&mut ip, 4096 + 1500, Cred::ROOT).unwrap();
        assert_eq!(ip.size, 5596);
        assert!(ip.db[2].is_hole());
        // One full block plus two fragments.
        assert_eq!(ip.blocks, 8 + 4);
        let after = m.fs.stats().cstotal;
        assert_eq!(after.nbfree * 4 + after.nffree, before.nbfree * 4 + before.nffree + 6);

        let tail = m.fs.read(&ip, 4096, 4096).unwrap();
        assert_eq!(tail, vec![9_u8; 1500]);
    }

    #[test]
    fn shrink_zeroes_bytes_past_the_new_end() {
        let m = Mounted::new();
        let mut ip = m.file();
        m.fs.write(&mut ip, 0, &[5_u8; 4096], Cred::ROOT).unwrap();
        m.fs.truncate(&mut ip, 100, Cred::ROOT).unwrap();
        m.fs.truncate(&mut ip, 4096, Cred::ROOT).unwrap();
        let data = m.fs.read(&ip, 0, 4096).unwrap();
        assert_eq!(&data[..100], &[5_u8; 100][..]);
        assert!(data[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn pointers_reach_disk_before_blocks_are_freed() {
        let m = Mounted::new();
        let mut ip = m.file();
        m.fs.write(&mut ip, 0, &[1_u8; 20 * 4096], Cred::ROOT).unwrap();
        m.fs.truncate(&mut ip, 0, Cred::ROOT).unwrap();
        let on_disk = m.fs.load_inode(ip.number).unwrap();
        assert_eq!(on_disk.size, 0);
        assert!(on_disk.db.iter().all(|a| a.is_hole()));
        assert!(on_disk.ib.iter().all(|a| a.is_hole()));
        assert_eq!(on_disk.blocks, 0);
    }

    #[test]
    fn partial_single_indirect_keeps_its_prefix() {
        let m = Mounted::new();
        let mut ip = m.file();
        m.fs.write(&mut ip, 0, &vec![3_u8; 40 * 4096], Cred::ROOT).unwrap();
        let ib = ip.ib[0];
        m.fs.truncate(&mut ip, 20 * 4096, Cred::ROOT).unwrap();
        assert_eq!(ip.ib[0], ib);
        // 20 data blocks and the indirect block.
        assert_eq!(ip.blocks, 21 * 8);
        assert!(m.fs.bmap(&ip, 20).unwrap().is_hole());
        assert!(!m.fs.bmap(&ip, 19).unwrap().is_hole());
        assert!(m.fs.check().unwrap().is_clean());
    }
}
