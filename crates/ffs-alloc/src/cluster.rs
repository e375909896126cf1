//! Cluster accounting.
//!
//! `clustersfree` has one bit per full block (set = the whole block is free);
//! `clustersum[n]` counts maximal runs of `n` free blocks, with runs of
//! `contigsumsize` or more all counted in the last bucket. Every block-level
//! allocate or free flips one bit and moves credit between buckets so the
//! histogram always equals what [`cluster_summary`] would compute from
//! scratch.

use ffs_ondisk::{CylinderGroup, Superblock};

use crate::bitmap::{bitmap_clear, bitmap_get, bitmap_set};

/// Largest bucket with a nonzero count, 0 when no cluster is free.
#[must_use]
pub fn largest_cluster(clustersum: &[i32]) -> u32 {
    (1..clustersum.len())
        .rev()
        .find(|&i| clustersum[i] > 0)
        .map_or(0, |i| i as u32)
}

/// Mark block `blkno` free (`cnt == 1`) or allocated (`cnt == -1`) in the
/// cluster map and update the histogram.
///
/// Returns the group's new largest free cluster, or `None` when the
/// filesystem keeps no cluster summary.
pub fn clusteracct(sb: &Superblock, cg: &mut CylinderGroup, blkno: u32, cnt: i32) -> Option<u32> {
    debug_assert!(cnt == 1 || cnt == -1);
    let sumsize = sb.contigsumsize;
    if sumsize == 0 {
        return None;
    }
    if cnt > 0 {
        bitmap_set(&mut cg.clustersfree, blkno);
    } else {
        bitmap_clear(&mut cg.clustersfree, blkno);
    }

    let start = blkno + 1;
    let end = start.saturating_add(sumsize).min(cg.nclusterblks);
    let mut i = start;
    while i < end && bitmap_get(&cg.clustersfree, i) {
        i += 1;
    }
    let forw = i.saturating_sub(start);

    let mut back = 0;
    while back < sumsize && back < blkno && bitmap_get(&cg.clustersfree, blkno - 1 - back) {
        back += 1;
    }

    let joined = (back + forw + 1).min(sumsize);
    cg.clustersum[joined as usize] += cnt;
    if back > 0 {
        cg.clustersum[back as usize] -= cnt;
    }
    if forw > 0 {
        cg.clustersum[forw as usize] -= cnt;
    }
    Some(largest_cluster(&cg.clustersum))
}

/// Histogram of free-block runs computed directly from a cluster map.
#[must_use]
pub fn cluster_summary(clustersfree: &[u8], nblocks: u32, contigsumsize: u32) -> Vec<i32> {
    let mut sum = vec![0_i32; contigsumsize as usize + 1];
    if contigsumsize == 0 {
        return sum;
    }
    let mut run = 0_u32;
    for blk in 0..=nblocks {
        if blk < nblocks && bitmap_get(clustersfree, blk) {
            run += 1;
            continue;
        }
        if run > 0 {
            sum[run.min(contigsumsize) as usize] += 1;
        }
        run = 0;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_sb;

    #[test]
    fn joining_two_runs_moves_credit() {
        let sb = sample_sb();
        let mut cg = CylinderGroup::empty(&sb, 0);
        for blk in [0, 1, 3] {
            clusteracct(&sb, &mut cg, blk, 1);
        }
        assert_eq!(cg.clustersum[2], 1);
        assert_eq!(cg.clustersum[1], 1);

        let max = clusteracct(&sb, &mut cg, 2, 1);
        assert_eq!(max, Some(4));
        assert_eq!(cg.clustersum[4], 1);
        assert_eq!(cg.clustersum[1..4].iter().sum::<i32>(), 0);

        let max = clusteracct(&sb, &mut cg, 2, -1);
        assert_eq!(max, Some(2));
        assert_eq!(
            cg.clustersum,
            cluster_summary(&cg.clustersfree, cg.nclusterblks, sb.contigsumsize)
        );
    }

    #[test]
    fn long_runs_land_in_last_bucket() {
        let sb = sample_sb();
        let mut cg = CylinderGroup::empty(&sb, 0);
        for blk in 0..20 {
            clusteracct(&sb, &mut cg, blk, 1);
        }
        let last = sb.contigsumsize as usize;
        assert_eq!(cg.clustersum[last], 1);
        assert_eq!(
            cg.clustersum,
            cluster_summary(&cg.clustersfree, cg.nclusterblks, sb.contigsumsize)
        );
        assert_eq!(largest_cluster(&cg.clustersum), sb.contigsumsize);
    }

    #[test]
    fn no_summary_without_contigsumsize() {
        let mut sb = sample_sb();
        sb.contigsumsize = 0;
        let mut cg = CylinderGroup::empty(&sb, 0);
        assert_eq!(clusteracct(&sb, &mut cg, 0, 1), None);
    }
}
