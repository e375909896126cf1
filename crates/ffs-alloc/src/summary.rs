//! Recompute a group's derived tables from its bitmaps.
//!
//! Used when formatting a fresh group and by the consistency checker, which
//! compares the stored tables against these.

use ffs_ondisk::{CsSum, CylinderGroup, MAXFRAG, Superblock};

use crate::bitmap::{bitmap_count_set, bitmap_set, blkmap, is_block_free};
use crate::cluster::cluster_summary;
use crate::frag::fragacct;

/// Rebuild free counts, fragment histogram, rotational tables and cluster
/// map from `blksfree` and `inosused`. `cs.ndir` is kept as stored since the
/// bitmaps cannot tell directories apart.
pub fn rebuild_summaries(sb: &Superblock, cg: &mut CylinderGroup) {
    let frags = sb.frags;
    let frag = sb.frag();
    let keep_clusters = sb.contigsumsize > 0;

    cg.frsum = [0; MAXFRAG];
    cg.btot.iter_mut().for_each(|c| *c = 0);
    cg.b.iter_mut().for_each(|c| *c = 0);
    cg.clustersfree.iter_mut().for_each(|c| *c = 0);

    let mut nbfree = 0_i64;
    let mut nffree = 0_i64;
    for blkno in 0..sb.blocks_per_group() {
        let base = blkno * frag;
        if is_block_free(&cg.blksfree, frags, blkno) {
            nbfree += 1;
            if keep_clusters {
                bitmap_set(&mut cg.clustersfree, blkno);
            }
            let cylno = sb.cbtocylno(base);
            let rpos = sb.cbtorpos(base) as usize;
            if let Some(slot) = cg.rot_row_mut(sb, cylno).get_mut(rpos) {
                *slot += 1;
            }
            if let Some(tot) = cg.btot.get_mut(cylno as usize) {
                *tot += 1;
            }
        } else {
            let map = blkmap(&cg.blksfree, frags, base);
            nffree += i64::from(map.count_ones());
            fragacct(frags, map, &mut cg.frsum, 1);
        }
    }
    cg.clustersum = cluster_summary(&cg.clustersfree, cg.nclusterblks, sb.contigsumsize);
    cg.cs = CsSum {
        ndir: cg.cs.ndir,
        nbfree,
        nffree,
        nifree: i64::from(sb.ipg - bitmap_count_set(&cg.inosused, sb.ipg)),
    };
}
