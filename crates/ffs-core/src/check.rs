//! Read-only consistency check.
//!
//! Rebuilds every group's derived tables from its bitmaps and compares them
//! with what is stored, then walks every allocated inode and claims the
//! fragments it references. A fragment claimed twice, claimed while marked
//! free, or allocated but unclaimed (outside metadata) is reported.

use ffs_alloc::bitmap::{bitmap_get, bitmap_set};
use ffs_alloc::{FsCtx, rebuild_summaries};
use ffs_error::{FfsError, Result};
use ffs_inode::{Inode, blksize, load_inode};
use ffs_ondisk::{CsSum, CylinderGroup, NIADDR, Superblock, decode_addrs};
use ffs_types::{DiskAddr, InodeNumber};
use serde::Serialize;
use tracing::{info, warn};

/// Findings of [`check`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub groups: u32,
    pub inodes_in_use: u64,
    /// Stored counters that disagree with the bitmaps.
    pub summary_mismatches: Vec<String>,
    /// Fragments referenced by an inode but free in the map.
    pub claimed_but_free: Vec<u64>,
    /// Fragments referenced more than once.
    pub duplicates: Vec<u64>,
    /// Allocated data fragments nobody references.
    pub leaked_frags: u64,
    /// Inode-level problems: bad pointers, wrong block counts.
    pub inode_problems: Vec<String>,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.summary_mismatches.is_empty()
            && self.claimed_but_free.is_empty()
            && self.duplicates.is_empty()
            && self.leaked_frags == 0
            && self.inode_problems.is_empty()
    }
}

struct Walker<'c, 'a> {
    ctx: &'c FsCtx<'a>,
    groups: &'c [CylinderGroup],
    claimed: Vec<u8>,
    report: CheckReport,
}

impl Walker<'_, '_> {
    /// Claim `frags` fragments at `addr` for `ino`. Returns false when the
    /// range lies outside the filesystem.
    fn claim(&mut self, ino: InodeNumber, addr: DiskAddr, frags: u64) -> bool {
        let sb = self.ctx.sb;
        if addr.0.saturating_add(frags) > sb.size {
            self.report
                .inode_problems
                .push(format!("inode {ino}: pointer {addr} beyond the filesystem"));
            return false;
        }
        for f in addr.0..addr.0 + frags {
            let cg = &self.groups[sb.dtog(f) as usize];
            if bitmap_get(&cg.blksfree, sb.dtogd(f)) {
                self.report.claimed_but_free.push(f);
            }
            let idx = u32::try_from(f).unwrap_or(u32::MAX);
            if bitmap_get(&self.claimed, idx) {
                self.report.duplicates.push(f);
            } else {
                bitmap_set(&mut self.claimed, idx);
            }
        }
        true
    }

    /// Claim an indirect block and everything below it. Returns fragments
    /// claimed.
    fn claim_indirect(&mut self, ino: InodeNumber, addr: DiskAddr, level: usize) -> Result<u64> {
        let sb = self.ctx.sb;
        let frag = u64::from(sb.frag());
        if !self.claim(ino, addr, frag) {
            return Ok(0);
        }
        let buf = self
            .ctx
            .cache
            .read_block(sb.frag_to_byte(addr), sb.bsize as usize)?;
        let entries = decode_addrs(&buf, sb.addr_width).map_err(|err| FfsError::Corruption {
            block: addr.0,
            detail: format!("indirect block: {err}"),
        })?;
        buf.release();
        let mut total = frag;
        for entry in entries.into_iter().filter(|a| !a.is_hole()) {
            total += if level == 0 {
                if self.claim(ino, entry, frag) { frag } else { 0 }
            } else {
                self.claim_indirect(ino, entry, level - 1)?
            };
        }
        Ok(total)
    }

    fn claim_inode(&mut self, ip: &Inode) -> Result<()> {
        let sb = self.ctx.sb;
        let mut frags = 0;
        for (i, addr) in ip.db.iter().enumerate() {
            if addr.is_hole() {
                continue;
            }
            let size = blksize(sb, ip.size, i64::try_from(i).unwrap_or(i64::MAX));
            if size == 0 {
                self.report.inode_problems.push(format!(
                    "inode {}: direct block {i} lies past size {}",
                    ip.number, ip.size
                ));
                continue;
            }
            let n = sb.numfrags(u64::from(size));
            if self.claim(ip.number, *addr, n) {
                frags += n;
            }
        }
        for (level, addr) in ip.ib.iter().enumerate().take(NIADDR) {
            if !addr.is_hole() {
                frags += self.claim_indirect(ip.number, *addr, level)?;
            }
        }
        let sectors = Superblock::btodb(frags * u64::from(sb.fsize));
        if sectors != ip.blocks {
            self.report.inode_problems.push(format!(
                "inode {}: block count {} but {sectors} sectors referenced",
                ip.number, ip.blocks
            ));
        }
        Ok(())
    }
}

fn compare(report: &mut CheckReport, what: &str, stored: &CsSum, derived: &CsSum) {
    if stored != derived {
        report.summary_mismatches.push(format!(
            "{what}: stored {stored:?}, derived {derived:?}"
        ));
    }
}

/// Whether group-relative fragment `f` of group `cgx` is filesystem
/// metadata rather than file data.
fn is_metadata(sb: &Superblock, cgx: u32, f: u32) -> bool {
    if (sb.sblkno..sb.dblkno).contains(&f) {
        return true;
    }
    if cgx != 0 {
        return false;
    }
    let cs_end = u64::from(sb.dblkno) + sb.numfrags(u64::from(sb.cssize));
    f < sb.sblkno || (u64::from(f) >= u64::from(sb.dblkno) && u64::from(f) < cs_end)
}

/// Check the filesystem behind `ctx`. Only I/O failures and undecodable
/// metadata abort the check; everything else is reported.
pub fn check(ctx: &FsCtx<'_>) -> Result<CheckReport> {
    let sb = ctx.sb;
    let mut report = CheckReport {
        groups: sb.ncg,
        ..CheckReport::default()
    };

    let stored_cs = ctx.state.lock().cs.clone();
    let stored_total = ctx.state.lock().cstotal;
    let mut groups = Vec::with_capacity(sb.ncg as usize);
    let mut total = CsSum::default();
    for cgx in 0..sb.ncg {
        let cg = ctx.read_group(cgx)?;
        let mut rebuilt = cg.clone();
        rebuild_summaries(sb, &mut rebuilt);
        compare(&mut report, &format!("cg {cgx} descriptor"), &cg.cs, &rebuilt.cs);
        if cg.frsum != rebuilt.frsum {
            report
                .summary_mismatches
                .push(format!("cg {cgx}: fragment histogram {:?} should be {:?}", cg.frsum, rebuilt.frsum));
        }
        if cg.clustersum != rebuilt.clustersum || cg.clustersfree != rebuilt.clustersfree {
            report
                .summary_mismatches
                .push(format!("cg {cgx}: cluster map disagrees with block map"));
        }
        if cg.btot != rebuilt.btot || cg.b != rebuilt.b {
            report
                .summary_mismatches
                .push(format!("cg {cgx}: rotational tables disagree with block map"));
        }
        if let Some(stored) = stored_cs.get(cgx as usize) {
            compare(&mut report, &format!("cg {cgx} summary"), stored, &rebuilt.cs);
        }
        total.add(&rebuilt.cs);
        groups.push(cg);
    }
    compare(&mut report, "filesystem total", &stored_total, &total);

    let size = usize::try_from(sb.size).map_err(|_| {
        FfsError::InvalidGeometry(format!("{} fragments too many to check", sb.size))
    })?;
    let mut walker = Walker {
        ctx,
        groups: &groups,
        claimed: vec![0; size.div_ceil(8)],
        report,
    };
    for cgx in 0..sb.ncg {
        for idx in 0..sb.ipg {
            if !bitmap_get(&groups[cgx as usize].inosused, idx) {
                continue;
            }
            let ino = InodeNumber(u64::from(cgx) * u64::from(sb.ipg) + u64::from(idx));
            if ino < InodeNumber::ROOT {
                continue;
            }
            let ip = load_inode(ctx.cache, sb, ino)?;
            if ip.mode == 0 {
                walker
                    .report
                    .inode_problems
                    .push(format!("inode {ino}: marked in use but unallocated"));
                continue;
            }
            walker.report.inodes_in_use += 1;
            walker.claim_inode(&ip)?;
        }
    }

    let mut report = walker.report;
    for (cgx, cg) in (0..sb.ncg).zip(&groups) {
        let base = sb.cgbase(cgx);
        for f in 0..sb.fpg {
            let idx = u32::try_from(base + u64::from(f)).unwrap_or(u32::MAX);
            if !bitmap_get(&cg.blksfree, f)
                && !is_metadata(sb, cgx, f)
                && !bitmap_get(&walker.claimed, idx)
            {
                report.leaked_frags += 1;
            }
        }
    }

    if report.is_clean() {
        info!(target: "ffs::check", event = "clean", groups = report.groups, inodes = report.inodes_in_use);
    } else {
        warn!(
            target: "ffs::check",
            event = "inconsistent",
            summaries = report.summary_mismatches.len(),
            claimed_but_free = report.claimed_but_free.len(),
            duplicates = report.duplicates.len(),
            leaked = report.leaked_frags,
            inodes = report.inode_problems.len()
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Mounted;
    use ffs_alloc::Cred;

    #[test]
    fn fresh_filesystem_is_clean() {
        let m = Mounted::new();
        let report = m.fs.check().unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.inodes_in_use, 1);
    }

    #[test]
    fn leaked_block_is_reported() {
        let m = Mounted::new();
        let mut ip = m.file();
        let ctx = m.ctx();
        ctx.alloc(&mut ip, 0, 0, 4096, Cred::ROOT).unwrap();
        let report = m.fs.check().unwrap();
        assert_eq!(report.leaked_frags, 4);
        assert!(report.claimed_but_free.is_empty());
    }

    #[test]
    fn pointer_to_free_block_is_reported() {
        let m = Mounted::new();
        let mut ip = m.file();
        m.fs.write(&mut ip, 0, &[1_u8; 4096], Cred::ROOT).unwrap();
        let addr = ip.db[0];
        m.ctx().blkfree(ip.number, addr, 4096).unwrap();
        let report = m.fs.check().unwrap();
        assert_eq!(report.claimed_but_free, (addr.0..addr.0 + 4).collect::<Vec<_>>());
        assert!(!report.is_clean());
    }

    #[test]
    fn doubly_referenced_block_is_reported() {
        let m = Mounted::new();
        let mut a = m.file();
        m.fs.write(&mut a, 0, &[1_u8; 4096], Cred::ROOT).unwrap();
        let mut b = m.file();
        b.db[0] = a.db[0];
        b.size = 4096;
        b.blocks = 8;
        m.fs.update_inode(&b, false).unwrap();
        let report = m.fs.check().unwrap();
        assert_eq!(report.duplicates.len(), 4);
    }
}
