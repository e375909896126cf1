//! Placement policy: where a file's next block and a new directory's inode
//! should go. Both only read the in-memory summary; nothing here touches a
//! cylinder group buffer.

use ffs_inode::Inode;
use ffs_ondisk::Superblock;
use ffs_types::{DiskAddr, InodeNumber};
use tracing::trace;

use crate::FsState;

/// Preferred fragment address for logical block `lbn`, the `indx`th entry
/// of `bap` (the inode's direct array or an indirect block). 0 means no
/// preference.
///
/// The first block of a file and the first block after each `maxbpg` run go
/// to the start of a group with at least average free blocks; later blocks
/// follow their predecessor, skipping `rotdelay` worth of fragments once
/// `maxcontig` blocks have been laid out back to back.
pub fn blkpref(
    sb: &Superblock,
    state: &mut FsState,
    ip: &Inode,
    lbn: i64,
    indx: usize,
    bap: &[DiskAddr],
) -> u64 {
    let frag = u64::from(sb.frag());
    let fpg = u64::from(sb.fpg);
    let prev = indx
        .checked_sub(1)
        .and_then(|i| bap.get(i))
        .copied()
        .unwrap_or(DiskAddr::HOLE);

    if indx % sb.maxbpg.max(1) as usize == 0 || prev.is_hole() {
        let icg = sb.ino_to_cg(ip.number);
        let direct_reach = i64::from(sb.ndaddr) + i64::try_from(sb.nindir()).unwrap_or(i64::MAX);
        if lbn < direct_reach {
            return fpg * u64::from(icg) + frag;
        }
        let ncg = sb.ncg;
        let startcg = if prev.is_hole() {
            let hop = u64::try_from(lbn).unwrap_or(0) / u64::from(sb.maxbpg.max(1));
            ((u64::from(icg) + hop) % u64::from(ncg)) as u32
        } else {
            (sb.dtog(prev.0) + 1) % ncg
        };
        let avgbfree = state.cstotal.nbfree / i64::from(ncg);
        let roomy = (startcg..ncg)
            .chain(0..=startcg)
            .find(|&cg| state.cs[cg as usize].nbfree >= avgbfree);
        return match roomy {
            Some(cg) => {
                state.cgrotor = cg;
                trace!(lbn, cg, "blkpref_new_group");
                fpg * u64::from(cg) + frag
            }
            None => 0,
        };
    }

    let nextblk = prev.0 + frag;
    let maxcontig = sb.maxcontig as usize;
    if sb.rotdelay == 0 || indx < maxcontig {
        return nextblk;
    }
    let run_start = bap.get(indx - maxcontig).copied().unwrap_or(DiskAddr::HOLE);
    if run_start.0 + sb.blkstofrags(u64::from(sb.maxcontig)) != nextblk {
        return nextblk;
    }
    nextblk + rotdelay_frags(sb)
}

/// `rotdelay` milliseconds expressed in fragments, rounded up to a block.
#[must_use]
pub fn rotdelay_frags(sb: &Superblock) -> u64 {
    let frag = u64::from(sb.frag());
    let delay = u64::from(sb.rotdelay) * u64::from(sb.rps) * u64::from(sb.nsect)
        / (sb.nspf().max(1) * 1000);
    delay.div_ceil(frag) * frag
}

/// Group in which to place a new directory whose parent is `parent`,
/// returned as the first inode number of that group.
///
/// Directories directly under the root are spread over the groups with the
/// fewest directories; deeper ones stay near their parent unless its group is
/// crowded or too many directories were just created there.
pub fn dirpref(sb: &Superblock, state: &mut FsState, parent: &Inode) -> InodeNumber {
    let ncg = sb.ncg;
    let ipg = sb.ipg;
    let first_ino = |cg: u32| InodeNumber(u64::from(ipg) * u64::from(cg));
    let ncg_i = i64::from(ncg);
    let avgifree = state.cstotal.nifree / ncg_i;
    let avgbfree = state.cstotal.nbfree / ncg_i;
    let avgndir = state.cstotal.ndir / ncg_i;

    if parent.number == InodeNumber::ROOT {
        let prefcg = state.dir_rotor % ncg;
        state.dir_rotor = state.dir_rotor.wrapping_add(1);
        let mut mincg = prefcg;
        let mut minndir = i64::from(ipg);
        for cg in (prefcg..ncg).chain(0..prefcg) {
            let cs = &state.cs[cg as usize];
            if cs.ndir < minndir && cs.nifree >= avgifree && cs.nbfree >= avgbfree {
                mincg = cg;
                minndir = cs.ndir;
            }
        }
        return first_ino(mincg);
    }

    let ipg_i = i64::from(ipg);
    let bsize = i64::from(sb.bsize);
    let maxndir = (avgndir + ipg_i / 16).min(ipg_i);
    let minifree = (avgifree - avgifree / 4).max(1);
    let minbfree = (avgbfree - avgbfree / 4).max(1);
    let cgsize = i64::from(sb.fsize) * i64::from(sb.fpg);

    let dirsize = i64::from(sb.avgfilesize) * i64::from(sb.avgfpdir);
    let maxcontigdirs = if dirsize > i64::from(i32::MAX) {
        1
    } else {
        let curdirsize = if avgndir > 0 {
            (cgsize - avgbfree * bsize) / avgndir
        } else {
            0
        };
        let dirsize = dirsize.max(curdirsize).max(1);
        let mut limit = ((avgbfree * bsize) / dirsize).min(255);
        if sb.avgfpdir > 0 {
            limit = limit.min(ipg_i / i64::from(sb.avgfpdir));
        }
        limit.max(1)
    };

    let prefcg = sb.ino_to_cg(parent.number) % ncg;
    let order = || (prefcg..ncg).chain(0..prefcg);
    let fits = order().find(|&cg| {
        let cs = &state.cs[cg as usize];
        cs.ndir < maxndir
            && cs.nifree >= minifree
            && cs.nbfree >= minbfree
            && i64::from(state.contigdirs[cg as usize]) < maxcontigdirs
    });
    if let Some(cg) = fits {
        return first_ino(cg);
    }
    let backstop = order()
        .find(|&cg| state.cs[cg as usize].nifree >= avgifree)
        .unwrap_or(prefcg);
    first_ino(backstop)
}
