//! Allocation confined to one decoded cylinder group.
//!
//! [`CgOps`] owns a decoded [`CylinderGroup`] for the duration of one
//! operation. Every bitmap change is paired with its histogram, rotational
//! table and counter updates before the method returns, and the change to
//! the group's free counts is accumulated in a delta the caller applies to
//! the filesystem-wide summary once the group has been written back.
//!
//! "Not found" is `Ok(None)`; `Err` always means the group contradicts
//! itself and must not be written back.

use ffs_error::{FfsError, Result};
use ffs_ondisk::{CsSum, CylinderGroup, Superblock};

use crate::bitmap::{
    bitmap_clear, bitmap_get, bitmap_set, blkmap, clear_block, is_block_allocated, is_block_free,
    set_block,
};
use crate::cluster::clusteracct;
use crate::frag::{AROUND, INSIDE, fragacct, fragtbl, run_bit};

pub struct CgOps<'a> {
    sb: &'a Superblock,
    cg: CylinderGroup,
    delta: CsSum,
    maxcluster: Option<u32>,
}

impl std::fmt::Debug for CgOps<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgOps")
            .field("cgx", &self.cg.cgx)
            .field("delta", &self.delta)
            .field("maxcluster", &self.maxcluster)
            .finish_non_exhaustive()
    }
}

impl<'a> CgOps<'a> {
    #[must_use]
    pub fn new(sb: &'a Superblock, cg: CylinderGroup) -> Self {
        Self {
            sb,
            cg,
            delta: CsSum::default(),
            maxcluster: None,
        }
    }

    #[must_use]
    pub fn group(&self) -> &CylinderGroup {
        &self.cg
    }

    /// Change in free counts caused by the operations so far.
    #[must_use]
    pub fn delta(&self) -> CsSum {
        self.delta
    }

    /// New largest free cluster, if an operation recomputed it.
    #[must_use]
    pub fn maxcluster(&self) -> Option<u32> {
        self.maxcluster
    }

    #[must_use]
    pub fn into_parts(self) -> (CylinderGroup, CsSum, Option<u32>) {
        (self.cg, self.delta, self.maxcluster)
    }

    fn corrupt(&self, detail: impl Into<String>) -> FfsError {
        FfsError::Corruption {
            block: self.sb.cgtod(self.cg.cgx).0,
            detail: detail.into(),
        }
    }

    fn base(&self) -> u64 {
        self.sb.cgbase(self.cg.cgx)
    }

    fn in_group(&self, addr: u64) -> bool {
        self.sb.dtog(addr) == self.cg.cgx
    }

    fn adjust_nbfree(&mut self, by: i64) {
        self.cg.cs.nbfree += by;
        self.delta.nbfree += by;
    }

    fn adjust_nffree(&mut self, by: i64) {
        self.cg.cs.nffree += by;
        self.delta.nffree += by;
    }

    fn adjust_rot(&mut self, frag_in_group: u32, by: i16) {
        let cylno = self.sb.cbtocylno(frag_in_group);
        let rpos = self.sb.cbtorpos(frag_in_group) as usize;
        let sb = self.sb;
        if let Some(slot) = self.cg.rot_row_mut(sb, cylno).get_mut(rpos) {
            *slot += by;
        }
        if let Some(tot) = self.cg.btot.get_mut(cylno as usize) {
            *tot += i32::from(by);
        }
    }

    fn cluster(&mut self, blkno: u32, cnt: i32) {
        if let Some(max) = clusteracct(self.sb, &mut self.cg, blkno, cnt) {
            self.maxcluster = Some(max);
        }
    }

    /// Locate a free run of exactly `allocsiz` fragments (or a free block when
    /// `allocsiz == frag`), scanning from `pref` (group-relative) or from the
    /// fragment rotor. Returns a group-relative fragment.
    pub fn mapsearch(&mut self, pref: Option<u32>, allocsiz: u32) -> Result<u32> {
        let frags = self.sb.frags;
        let frag = frags.count();
        if allocsiz == 0 || allocsiz > frag {
            return Err(FfsError::InvalidArgument(format!(
                "mapsearch for {allocsiz} fragments with frag={frag}"
            )));
        }
        let map = &self.cg.blksfree;
        let nbytes = map.len();
        let start = (pref.unwrap_or(self.cg.frotor) / 8) as usize;
        let start = start.min(nbytes.saturating_sub(1));
        let want = run_bit(frags, allocsiz);
        let hit = |i: &usize| fragtbl(frags, map[*i]) & want != 0;
        let Some(byte) = (start..nbytes).find(hit).or_else(|| (0..=start).find(hit)) else {
            return Err(self.corrupt(format!(
                "fragment map has no run of {allocsiz} despite summary counts"
            )));
        };

        let first = (byte * 8) as u32;
        self.cg.frotor = first;
        let field = AROUND[allocsiz as usize];
        let subfield = INSIDE[allocsiz as usize];
        for base in (first..first + 8).step_by(frag as usize) {
            let blk = u32::from(blkmap(&self.cg.blksfree, frags, base)) << 1;
            for pos in 0..=(frag - allocsiz) {
                if blk & (field << pos) == subfield << pos {
                    return Ok(base + pos);
                }
            }
        }
        Err(self.corrupt(format!("fragment run of {allocsiz} vanished at byte {byte}")))
    }

    /// Rotationally closest free block in the cylinder of `rel`, if the
    /// summary tables promise one.
    fn rotational_pick(&self, rel: u32) -> Result<Option<u32>> {
        let sb = self.sb;
        if !sb.has_rotational_layout() {
            return Ok(None);
        }
        let cylno = sb.cbtocylno(rel);
        if self.cg.btot.get(cylno as usize).copied().unwrap_or(0) == 0 {
            return Ok(None);
        }
        let row = self.cg.rot_row(sb, cylno);
        let pos = sb.cbtorpos(rel) as usize;
        let Some(want) = (pos..row.len())
            .chain(0..pos)
            .find(|&i| row[i] > 0)
        else {
            return Ok(None);
        };

        let frag = sb.frag();
        let fpc = sb.frags_per_cyl();
        let first = (cylno * fpc).div_ceil(frag) * frag;
        let end = ((cylno + 1) * fpc).min(sb.fpg);
        let found = (first..end).step_by(frag as usize).find(|&f| {
            sb.cbtorpos(f) as usize == want
                && sb.cbtocylno(f) == cylno
                && is_block_free(&self.cg.blksfree, sb.frags, f / frag)
        });
        match found {
            Some(f) => Ok(Some(f)),
            None => Err(self.corrupt(format!(
                "rotational summary lists a free block at cylinder {cylno} position {want}"
            ))),
        }
    }

    /// Allocate one full block, preferring `bpref` (absolute), then a
    /// rotationally close block in its cylinder, then the next free block
    /// after the block rotor.
    pub fn alloc_block(&mut self, bpref: u64) -> Result<Option<u64>> {
        let sb = self.sb;
        let frag = sb.frag();
        if self.cg.cs.nbfree <= 0 {
            return Ok(None);
        }

        let mut chosen = None;
        let mut search_from = self.cg.rotor;
        if bpref != 0 && self.in_group(bpref) {
            let rel = sb.dtogd(sb.blknum(bpref));
            if is_block_free(&self.cg.blksfree, sb.frags, rel / frag) {
                chosen = Some(rel);
            } else {
                chosen = self.rotational_pick(rel)?;
                search_from = rel;
            }
        }
        let bno = match chosen {
            Some(bno) => bno,
            None => {
                let bno = self.mapsearch(Some(search_from), frag)?;
                self.cg.rotor = bno;
                bno
            }
        };

        let blkno = bno / frag;
        clear_block(&mut self.cg.blksfree, sb.frags, blkno);
        self.cluster(blkno, -1);
        self.adjust_nbfree(-1);
        self.adjust_rot(bno, -1);
        Ok(Some(self.base() + u64::from(bno)))
    }

    /// Allocate `size` bytes (a multiple of the fragment size, at most one
    /// block). Reuses the smallest sufficient free fragment run, else cuts
    /// the request out of a fresh block and leaves the rest free.
    pub fn alloc_frag(&mut self, bpref: u64, size: u32) -> Result<Option<u64>> {
        let sb = self.sb;
        if size == sb.bsize {
            return self.alloc_block(bpref);
        }
        let frag = sb.frag();
        let frags = sb.numfrags(u64::from(size)) as u32;
        let allocsiz = (frags..frag).find(|&s| self.cg.frsum[s as usize] != 0);

        let Some(allocsiz) = allocsiz else {
            let Some(bno) = self.alloc_block(bpref)? else {
                return Ok(None);
            };
            let rel = sb.dtogd(bno);
            for i in frags..frag {
                bitmap_set(&mut self.cg.blksfree, rel + i);
            }
            let left = frag - frags;
            self.adjust_nffree(i64::from(left));
            self.cg.frsum[left as usize] += 1;
            return Ok(Some(bno));
        };

        let pref = (bpref != 0).then(|| sb.dtogd(bpref));
        let bno = self.mapsearch(pref, allocsiz)?;
        for i in 0..frags {
            bitmap_clear(&mut self.cg.blksfree, bno + i);
        }
        self.adjust_nffree(-i64::from(frags));
        self.cg.frsum[allocsiz as usize] -= 1;
        if frags != allocsiz {
            self.cg.frsum[(allocsiz - frags) as usize] += 1;
        }
        Ok(Some(self.base() + u64::from(bno)))
    }

    /// Grow the fragment run at `bprev` from `osize` to `nsize` bytes in
    /// place. Only possible when the extra fragments are free and inside the
    /// same block.
    pub fn extend_frag(&mut self, bprev: u64, osize: u32, nsize: u32) -> Result<Option<u64>> {
        let sb = self.sb;
        let frag = sb.frag();
        let ofrags = sb.numfrags(u64::from(osize)) as u32;
        let frags = sb.numfrags(u64::from(nsize)) as u32;
        if self.cg.cs.nffree < i64::from(frags - ofrags) {
            return Ok(None);
        }
        let bbase = sb.fragnum(bprev);
        if bbase > sb.fragnum(bprev + u64::from(frags) - 1) {
            return Ok(None);
        }
        let rel = sb.dtogd(bprev);
        if (ofrags..frags).any(|i| !bitmap_get(&self.cg.blksfree, rel + i)) {
            return Ok(None);
        }

        let mut i = frags;
        while i < frag - bbase && bitmap_get(&self.cg.blksfree, rel + i) {
            i += 1;
        }
        self.cg.frsum[(i - ofrags) as usize] -= 1;
        if i != frags {
            self.cg.frsum[(i - frags) as usize] += 1;
        }
        for i in ofrags..frags {
            bitmap_clear(&mut self.cg.blksfree, rel + i);
        }
        self.adjust_nffree(-i64::from(frags - ofrags));
        Ok(Some(bprev))
    }

    /// Allocate `len` physically contiguous full blocks at or after `bpref`.
    /// On a miss, records the largest cluster actually present so later
    /// searches can skip this group.
    pub fn alloc_cluster(&mut self, bpref: u64, len: u32) -> Result<Option<u64>> {
        let sb = self.sb;
        let sumsize = sb.contigsumsize;
        if sumsize == 0 || len == 0 {
            return Ok(None);
        }
        let sum = &self.cg.clustersum;
        if !(len.min(sumsize)..=sumsize).any(|i| sum[i as usize] > 0) {
            let below = len.min(sumsize + 1);
            let max = (1..below).rev().find(|&i| sum[i as usize] > 0).unwrap_or(0);
            self.maxcluster = Some(max);
            return Ok(None);
        }

        let start = if bpref == 0 || !self.in_group(bpref) {
            0
        } else {
            sb.fragstoblks(u64::from(sb.dtogd(sb.blknum(bpref)))) as u32
        };
        let mut run = 0;
        let mut got = start;
        while got < self.cg.nclusterblks {
            if bitmap_get(&self.cg.clustersfree, got) {
                run += 1;
                if run == len {
                    break;
                }
            } else {
                run = 0;
            }
            got += 1;
        }
        if got >= self.cg.nclusterblks {
            return Ok(None);
        }

        let first = got + 1 - len;
        if (first..first + len).any(|b| !is_block_free(&self.cg.blksfree, sb.frags, b)) {
            return Err(self.corrupt("cluster map disagrees with fragment map"));
        }
        let bno = self.base() + sb.blkstofrags(u64::from(first));
        for i in 0..u64::from(len) {
            let want = bno + sb.blkstofrags(i);
            if self.alloc_block(want)? != Some(want) {
                return Err(self.corrupt(format!("lost block {want} while allocating a cluster")));
            }
        }
        Ok(Some(bno))
    }

    /// Allocate an inode, preferring `ipref` (absolute, 0 for none), then
    /// scanning the inode map from the inode rotor.
    pub fn alloc_inode(&mut self, ipref: u64, is_dir: bool) -> Result<Option<u64>> {
        let ipg = self.sb.ipg;
        if self.cg.cs.nifree <= 0 {
            return Ok(None);
        }
        let preferred = (ipref != 0)
            .then(|| (ipref % u64::from(ipg)) as u32)
            .filter(|&rel| !bitmap_get(&self.cg.inosused, rel));
        let rel = match preferred {
            Some(rel) => rel,
            None => {
                let map = &self.cg.inosused;
                let nbytes = map.len();
                let first = ((self.cg.irotor % ipg) / 8) as usize;
                let found = (0..nbytes)
                    .map(|k| (first + k) % nbytes)
                    .filter(|&i| map[i] != 0xff)
                    .find_map(|i| {
                        (0..8_u32)
                            .map(|bit| i as u32 * 8 + bit)
                            .find(|&ino| ino < ipg && !bitmap_get(map, ino))
                    });
                let Some(rel) = found else {
                    return Err(self.corrupt("inode map full despite free inode count"));
                };
                self.cg.irotor = (rel + 1) % ipg;
                rel
            }
        };

        bitmap_set(&mut self.cg.inosused, rel);
        self.cg.cs.nifree -= 1;
        self.delta.nifree -= 1;
        if is_dir {
            self.cg.cs.ndir += 1;
            self.delta.ndir += 1;
        }
        Ok(Some(u64::from(self.cg.cgx) * u64::from(ipg) + u64::from(rel)))
    }

    /// Return `size` bytes at `bno` (absolute) to the free map, reassembling
    /// a full block when the last missing fragment comes back.
    pub fn free_blocks(&mut self, bno: u64, size: u32) -> Result<()> {
        let sb = self.sb;
        let frags = sb.frags;
        let frag = sb.frag();
        let rel = sb.dtogd(bno);

        if size == sb.bsize {
            let blkno = rel / frag;
            if !is_block_allocated(&self.cg.blksfree, frags, blkno) {
                return Err(self.corrupt(format!("freeing free block {bno}")));
            }
            set_block(&mut self.cg.blksfree, frags, blkno);
            self.cluster(blkno, 1);
            self.adjust_nbfree(1);
            self.adjust_rot(rel, 1);
            return Ok(());
        }

        let bbase = rel - sb.fragnum(u64::from(rel));
        let before = blkmap(&self.cg.blksfree, frags, bbase);
        fragacct(frags, before, &mut self.cg.frsum, -1);
        let n = sb.numfrags(u64::from(size)) as u32;
        for i in 0..n {
            if bitmap_get(&self.cg.blksfree, rel + i) {
                return Err(self.corrupt(format!("freeing free fragment {}", bno + u64::from(i))));
            }
            bitmap_set(&mut self.cg.blksfree, rel + i);
        }
        self.adjust_nffree(i64::from(n));
        let after = blkmap(&self.cg.blksfree, frags, bbase);
        fragacct(frags, after, &mut self.cg.frsum, 1);

        let blkno = bbase / frag;
        if is_block_free(&self.cg.blksfree, frags, blkno) {
            self.adjust_nffree(-i64::from(frag));
            self.cluster(blkno, 1);
            self.adjust_nbfree(1);
            self.adjust_rot(bbase, 1);
        }
        Ok(())
    }

    /// Return inode `ino` (absolute) to the inode map.
    pub fn free_inode(&mut self, ino: u64, is_dir: bool) -> Result<()> {
        let rel = (ino % u64::from(self.sb.ipg)) as u32;
        if !bitmap_get(&self.cg.inosused, rel) {
            return Err(self.corrupt(format!("freeing free inode {ino}")));
        }
        bitmap_clear(&mut self.cg.inosused, rel);
        if rel < self.cg.irotor {
            self.cg.irotor = rel;
        }
        self.cg.cs.nifree += 1;
        self.delta.nifree += 1;
        if is_dir {
            self.cg.cs.ndir -= 1;
            self.delta.ndir -= 1;
        }
        Ok(())
    }

    /// Whether `size` bytes at `bno` are allocated. A run that is partly
    /// free is a corruption.
    pub fn is_allocated(&self, bno: u64, size: u32) -> Result<bool> {
        let sb = self.sb;
        let rel = sb.dtogd(bno);
        if size == sb.bsize {
            return Ok(!is_block_free(&self.cg.blksfree, sb.frags, rel / sb.frag()));
        }
        let n = sb.numfrags(u64::from(size)) as u32;
        let free = (0..n)
            .filter(|i| bitmap_get(&self.cg.blksfree, rel + i))
            .count() as u32;
        if free != 0 && free != n {
            return Err(self.corrupt(format!("fragment run at {bno} is partially free")));
        }
        Ok(free == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fresh_group, sample_sb};

    #[test]
    fn full_block_prefers_requested_address() {
        let sb = sample_sb();
        let mut ops = CgOps::new(&sb, fresh_group(&sb, 1));
        let want = sb.cgbase(1) + 400;
        assert_eq!(ops.alloc_block(want).unwrap(), Some(want));
        // Taken now; the next request lands elsewhere in the same group.
        let other = ops.alloc_block(want).unwrap().unwrap();
        assert_ne!(other, want);
        assert_eq!(sb.dtog(other), 1);
        assert_eq!(ops.delta().nbfree, -2);
    }

    #[test]
    fn fragment_cut_from_block_leaves_remainder_free() {
        let sb = sample_sb();
        let mut ops = CgOps::new(&sb, fresh_group(&sb, 0));
        let nbfree = ops.group().cs.nbfree;
        let bno = ops.alloc_frag(0, 1024).unwrap().unwrap();
        assert_eq!(sb.fragnum(bno), 0);
        assert_eq!(ops.group().cs.nbfree, nbfree - 1);
        assert_eq!(ops.group().cs.nffree, 3);
        assert_eq!(ops.group().frsum[3], 1);

        // The next two-fragment request reuses the leftover run.
        let second = ops.alloc_frag(0, 2048).unwrap().unwrap();
        assert_eq!(second, bno + 1);
        assert_eq!(ops.group().frsum[3], 0);
        assert_eq!(ops.group().frsum[1], 1);
        assert_eq!(ops.group().cs.nffree, 1);
    }

    #[test]
    fn extend_in_place_only_when_neighbour_free() {
        let sb = sample_sb();
        let mut ops = CgOps::new(&sb, fresh_group(&sb, 0));
        let a = ops.alloc_frag(0, 1024).unwrap().unwrap();
        assert_eq!(ops.extend_frag(a, 1024, 2048).unwrap(), Some(a));
        assert_eq!(ops.group().frsum[2], 1);
        assert_eq!(ops.group().frsum[3], 0);

        // Fill the rest of the block, then extension must fail.
        let b = ops.alloc_frag(0, 2048).unwrap().unwrap();
        assert_eq!(b, a + 2);
        assert_eq!(ops.extend_frag(a, 2048, 3072).unwrap(), None);
        // Never across a block boundary.
        assert_eq!(ops.extend_frag(b, 2048, 4096).unwrap(), None);
    }

    #[test]
    fn free_fragment_reassembles_block() {
        let sb = sample_sb();
        let mut ops = CgOps::new(&sb, fresh_group(&sb, 2));
        let start = ops.group().clone();
        let bno = ops.alloc_frag(0, 3072).unwrap().unwrap();
        ops.free_blocks(bno, 3072).unwrap();
        let (cg, delta, _) = ops.into_parts();
        assert_eq!(cg.blksfree, start.blksfree);
        assert_eq!(cg.frsum, start.frsum);
        assert_eq!(cg.clustersum, start.clustersum);
        assert_eq!(cg.b, start.b);
        assert_eq!(delta, CsSum::default());
    }

    #[test]
    fn double_free_is_corruption() {
        let sb = sample_sb();
        let mut ops = CgOps::new(&sb, fresh_group(&sb, 0));
        let bno = ops.alloc_block(0).unwrap().unwrap();
        ops.free_blocks(bno, sb.bsize).unwrap();
        assert!(matches!(
            ops.free_blocks(bno, sb.bsize),
            Err(FfsError::Corruption { .. })
        ));
        let frag = ops.alloc_frag(0, 1024).unwrap().unwrap();
        ops.free_blocks(frag, 1024).unwrap();
        assert!(ops.free_blocks(frag, 1024).unwrap_err().is_corruption());
    }

    #[test]
    fn cluster_allocation_is_contiguous() {
        let sb = sample_sb();
        let mut ops = CgOps::new(&sb, fresh_group(&sb, 3));
        let bno = ops.alloc_cluster(0, 4).unwrap().unwrap();
        for i in 0..4 {
            assert!(ops.is_allocated(bno + i * 4, sb.bsize).unwrap());
        }
        assert_eq!(ops.delta().nbfree, -4);
    }

    #[test]
    fn cluster_miss_records_largest_run() {
        let sb = sample_sb();
        let mut cg = CylinderGroup::empty(&sb, 0);
        cg.cs.nbfree = 2;
        for blk in [40_u32, 41] {
            set_block(&mut cg.blksfree, sb.frags, blk);
            clusteracct(&sb, &mut cg, blk, 1);
        }
        let mut ops = CgOps::new(&sb, cg);
        assert_eq!(ops.alloc_cluster(0, 3).unwrap(), None);
        assert_eq!(ops.maxcluster(), Some(2));
    }

    #[test]
    fn inode_alloc_prefers_then_scans_and_frees() {
        let sb = sample_sb();
        let mut ops = CgOps::new(&sb, fresh_group(&sb, 1));
        let pref = u64::from(sb.ipg) + 10;
        assert_eq!(ops.alloc_inode(pref, false).unwrap(), Some(pref));
        assert_eq!(ops.alloc_inode(pref, true).unwrap(), Some(u64::from(sb.ipg)));
        assert_eq!(ops.delta().ndir, 1);
        ops.free_inode(pref, false).unwrap();
        assert!(ops.free_inode(pref, false).is_err());
        assert_eq!(ops.delta().nifree, -1);
    }

    #[test]
    fn partially_free_run_is_reported() {
        let sb = sample_sb();
        let mut ops = CgOps::new(&sb, fresh_group(&sb, 0));
        let bno = ops.alloc_frag(0, 2048).unwrap().unwrap();
        assert!(ops.is_allocated(bno, 2048).unwrap());
        assert!(ops.is_allocated(bno + 1, 2048).is_err());
        assert!(!ops.is_allocated(bno + 2, 2048).unwrap());
    }
}
