#![forbid(unsafe_code)]
//! Block, fragment, cluster and inode allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap / fragment tables** ([`bitmap`], [`frag`]): raw bit
//!    manipulation on a group's free map, dispatched on fragments per block.
//! 2. **Cluster accounting** ([`cluster`]): the per-group histogram of free
//!    block runs.
//! 3. **[`CgOps`]**: every allocation or free confined to one decoded
//!    cylinder group. Pure; no I/O.
//! 4. **[`FsCtx`]**: reads a group descriptor through the buffer cache, runs
//!    a `CgOps` operation on it, writes it back and folds the change into the
//!    filesystem-wide summary held in [`FsState`]. Placement across groups
//!    (preferred group, quadratic rehash, brute force) and the public
//!    operations (`alloc`, `realloccg`, `valloc`, `vfree`, `blkfree`,
//!    `checkblk`) live here.
//!
//! The group descriptor buffer is the unit of mutual exclusion: while one
//! thread holds it no other thread can decode, mutate or write that group.
//! [`FsState`] sits behind a single mutex that is only held for counter
//! updates and placement decisions, never across I/O.
//!
//! A group whose descriptor contradicts itself is *fenced*: the filesystem is
//! marked as needing a check and later mutations of that group fail with
//! [`FfsError::GroupFenced`]. Placement skips fenced groups.

pub mod bitmap;
pub mod cgops;
pub mod cluster;
pub mod frag;
pub mod policy;
pub mod summary;

pub use cgops::CgOps;
pub use summary::rebuild_summaries;

use std::collections::BTreeSet;

use ffs_block::{Buf, BufferCache};
use ffs_error::{FfsError, Result};
use ffs_inode::{Inode, load_inode, now_secs, update_inode};
use ffs_journal::{DependencyHook, FreeRecord};
use ffs_ondisk::{CsSum, CylinderGroup, IFDIR, IFMT, Optim, Superblock};
use ffs_types::{DiskAddr, InodeNumber};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

/// Which per-group allocator the placement search runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    FullBlock,
    /// `size` bytes, a fragment multiple up to one block.
    Fragment { size: u32 },
    /// `blocks` physically contiguous full blocks.
    Cluster { blocks: u32 },
    Inode { dir: bool },
}

/// Caller identity; only root may dip into the `minfree` reserve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
}

impl Cred {
    pub const ROOT: Self = Self { uid: 0, gid: 0 };

    #[must_use]
    pub fn user(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Mutable filesystem-wide allocation state.
///
/// Mirrors the superblock counters and the per-group summary area while
/// mounted; written back to disk on sync.
#[derive(Debug, Clone)]
pub struct FsState {
    pub cstotal: CsSum,
    pub cs: Vec<CsSum>,
    /// Upper bound on the longest free cluster in each group.
    pub maxcluster: Vec<u32>,
    /// Directories created back to back in each group.
    pub contigdirs: Vec<u8>,
    pub cgrotor: u32,
    pub optim: Optim,
    pub fenced: BTreeSet<u32>,
    pub modified: bool,
    pub needs_check: bool,
    /// Next starting group for directories created under the root.
    pub dir_rotor: u32,
}

impl FsState {
    /// State for a freshly mounted filesystem with per-group counters `cs`.
    #[must_use]
    pub fn new(sb: &Superblock, cs: Vec<CsSum>) -> Self {
        let mut cstotal = CsSum::default();
        for sum in &cs {
            cstotal.add(sum);
        }
        let ncg = cs.len();
        Self {
            cstotal,
            cs,
            maxcluster: vec![sb.contigsumsize; ncg],
            contigdirs: vec![0; ncg],
            cgrotor: sb.cgrotor,
            optim: sb.optim,
            fenced: BTreeSet::new(),
            modified: false,
            needs_check: sb.needs_check(),
            dir_rotor: 0,
        }
    }

    /// Free fragments left after holding back `percent` of the data area.
    #[must_use]
    pub fn freespace(&self, sb: &Superblock, percent: u32) -> i64 {
        let free = (self.cstotal.nbfree << sb.fragshift()) + self.cstotal.nffree;
        let reserve = i64::try_from(sb.dsize * u64::from(percent) / 100).unwrap_or(i64::MAX);
        free - reserve
    }
}

/// Everything an allocation needs: the cache, the geometry, the shared
/// summary state and the optional dependency hook.
#[derive(Clone, Copy)]
pub struct FsCtx<'a> {
    pub cache: &'a BufferCache,
    pub sb: &'a Superblock,
    pub state: &'a Mutex<FsState>,
    pub deps: Option<&'a dyn DependencyHook>,
    /// Write group descriptors synchronously instead of delayed.
    pub sync_groups: bool,
}

impl std::fmt::Debug for FsCtx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsCtx")
            .field("ncg", &self.sb.ncg)
            .field("deps", &self.deps.is_some())
            .field("sync_groups", &self.sync_groups)
            .finish_non_exhaustive()
    }
}

impl<'a> FsCtx<'a> {
    #[must_use]
    pub fn new(cache: &'a BufferCache, sb: &'a Superblock, state: &'a Mutex<FsState>) -> Self {
        Self {
            cache,
            sb,
            state,
            deps: None,
            sync_groups: false,
        }
    }

    #[must_use]
    pub fn with_deps(mut self, deps: Option<&'a dyn DependencyHook>) -> Self {
        self.deps = deps;
        self
    }

    #[must_use]
    pub fn with_sync_groups(mut self, sync: bool) -> Self {
        self.sync_groups = sync;
        self
    }

    // ── group access ────────────────────────────────────────────────────

    fn cg_error(&self, cgx: u32, detail: String) -> FfsError {
        FfsError::Corruption {
            block: self.sb.cgtod(cgx).0,
            detail,
        }
    }

    /// Record a corruption without fencing any group.
    pub fn mark_needs_check(&self, err: &FfsError) {
        let mut st = self.state.lock();
        if !st.needs_check {
            error!(target: "ffs::alloc", event = "needs_check", error = %err, "filesystem marked for check");
        }
        st.needs_check = true;
        st.modified = true;
    }

    /// Refuse further mutation of `cgx` and mark the filesystem for check.
    pub fn fence(&self, cgx: u32, err: &FfsError) {
        let mut st = self.state.lock();
        st.needs_check = true;
        st.modified = true;
        if st.fenced.insert(cgx) {
            error!(target: "ffs::alloc", event = "cg_fenced", cg = cgx, error = %err, "cylinder group fenced");
        }
    }

    fn load_cg(&self, cgx: u32, for_update: bool) -> Result<(Buf<'a>, CylinderGroup)> {
        if cgx >= self.sb.ncg {
            return Err(FfsError::InvalidArgument(format!(
                "cylinder group {cgx} out of range (ncg {})",
                self.sb.ncg
            )));
        }
        if for_update && self.state.lock().fenced.contains(&cgx) {
            return Err(FfsError::GroupFenced { group: cgx });
        }
        let offset = self.sb.frag_to_byte(self.sb.cgtod(cgx));
        let buf = self.cache.read_block(offset, self.sb.cgsize as usize)?;
        let parsed = CylinderGroup::parse_from_bytes(self.sb, &buf)
            .map_err(|err| self.cg_error(cgx, format!("cylinder group {cgx}: {err}")))
            .and_then(|cg| {
                if cg.cgx == cgx {
                    Ok(cg)
                } else {
                    Err(self.cg_error(cgx, format!("descriptor claims to be group {}", cg.cgx)))
                }
            });
        match parsed {
            Ok(cg) => Ok((buf, cg)),
            Err(err) => {
                buf.release();
                self.fence(cgx, &err);
                Err(err)
            }
        }
    }

    /// Decode group `cgx` without holding it. Fenced groups can be read.
    pub fn read_group(&self, cgx: u32) -> Result<CylinderGroup> {
        let (buf, cg) = self.load_cg(cgx, false)?;
        buf.release();
        Ok(cg)
    }

    /// Run `f` against group `cgx` while holding its descriptor buffer.
    ///
    /// `Ok(Some(_))` means the group changed: it is written back and its
    /// delta folded into the summary. `Ok(None)` releases it untouched.
    /// A corruption error fences the group and discards the changes.
    fn with_cg<T>(
        &self,
        cgx: u32,
        f: impl FnOnce(&mut CgOps<'_>) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let (mut buf, cg) = self.load_cg(cgx, true)?;
        let mut ops = CgOps::new(self.sb, cg);
        let out = match f(&mut ops) {
            Ok(out) => out,
            Err(err) => {
                buf.release();
                if err.is_corruption() {
                    self.fence(cgx, &err);
                }
                return Err(err);
            }
        };
        let (mut cg, delta, maxcluster) = ops.into_parts();

        if out.is_none() {
            buf.release();
            if let Some(max) = maxcluster {
                self.state.lock().maxcluster[cgx as usize] = max;
            }
            return Ok(None);
        }

        cg.time = now_secs();
        if let Err(err) = cg.write_to_bytes(self.sb, &mut buf) {
            buf.release();
            let err = self.cg_error(cgx, format!("cannot encode cylinder group {cgx}: {err}"));
            self.fence(cgx, &err);
            return Err(err);
        }
        let written = if self.sync_groups {
            buf.write_sync()
        } else {
            buf.write_delayed();
            Ok(())
        };
        {
            let mut st = self.state.lock();
            st.cstotal.add(&delta);
            if let Some(cs) = st.cs.get_mut(cgx as usize) {
                cs.add(&delta);
            }
            if let Some(max) = maxcluster {
                st.maxcluster[cgx as usize] = max;
            }
            st.modified = true;
        }
        written?;
        Ok(out)
    }

    // ── placement ───────────────────────────────────────────────────────

    fn try_group(&self, cgx: u32, pref: u64, kind: AllocKind) -> Result<Option<u64>> {
        {
            let st = self.state.lock();
            if st.fenced.contains(&cgx) {
                return Ok(None);
            }
            let cs = &st.cs[cgx as usize];
            let promising = match kind {
                AllocKind::FullBlock => cs.nbfree > 0,
                AllocKind::Fragment { size } => {
                    let frags = i64::try_from(self.sb.numfrags(u64::from(size))).unwrap_or(0);
                    cs.nbfree > 0 || cs.nffree >= frags
                }
                AllocKind::Cluster { blocks } => st.maxcluster[cgx as usize] >= blocks,
                AllocKind::Inode { .. } => cs.nifree > 0,
            };
            if !promising {
                return Ok(None);
            }
        }
        let res = self.with_cg(cgx, |ops| match kind {
            AllocKind::FullBlock => ops.alloc_block(pref),
            AllocKind::Fragment { size } => ops.alloc_frag(pref, size),
            AllocKind::Cluster { blocks } => ops.alloc_cluster(pref, blocks),
            AllocKind::Inode { dir } => ops.alloc_inode(pref, dir),
        });
        match res {
            Err(FfsError::GroupFenced { .. }) => Ok(None),
            other => other,
        }
    }

    /// Find a group that can satisfy `kind`: the preferred group `icg` with
    /// preference `pref`, then groups `icg + 1, 2, 4, ...`, then every
    /// remaining group starting at `icg + 2`. Returns the fragment address
    /// (or inode number) handed out, `None` when every group is exhausted.
    pub fn hashalloc(&self, icg: u32, pref: u64, kind: AllocKind) -> Result<Option<u64>> {
        let ncg = self.sb.ncg;
        let icg = icg % ncg;
        if let Some(found) = self.try_group(icg, pref, kind)? {
            return Ok(Some(found));
        }

        let mut step = 1;
        while step < ncg {
            let cgx = (icg + step) % ncg;
            if let Some(found) = self.try_group(cgx, 0, kind)? {
                debug!(target: "ffs::alloc", event = "hashalloc_rehash", icg, cg = cgx, ?kind);
                return Ok(Some(found));
            }
            step *= 2;
        }

        let mut cgx = (icg + 2) % ncg;
        for _ in 2..ncg {
            if let Some(found) = self.try_group(cgx, 0, kind)? {
                debug!(target: "ffs::alloc", event = "hashalloc_scan", icg, cg = cgx, ?kind);
                return Ok(Some(found));
            }
            cgx = (cgx + 1) % ncg;
        }
        Ok(None)
    }

    /// Preferred address for logical block `lbn`; see [`policy::blkpref`].
    #[must_use]
    pub fn blkpref(&self, ip: &Inode, lbn: i64, indx: usize, bap: &[DiskAddr]) -> u64 {
        policy::blkpref(self.sb, &mut self.state.lock(), ip, lbn, indx, bap)
    }

    // ── blocks ──────────────────────────────────────────────────────────

    fn check_size(&self, size: u32) -> Result<()> {
        if size == 0 || size > self.sb.bsize || size % self.sb.fsize != 0 {
            return Err(FfsError::InvalidArgument(format!(
                "allocation size {size} is not a fragment multiple up to {}",
                self.sb.bsize
            )));
        }
        Ok(())
    }

    fn full(&self, ino: InodeNumber, cred: Cred) -> FfsError {
        warn!(target: "ffs::alloc", event = "fs_full", ino = ino.0, uid = cred.uid, "filesystem full");
        FfsError::NoSpace
    }

    fn reserve_exhausted(&self, cred: Cred, frags: u64) -> bool {
        if cred.is_root() {
            return false;
        }
        let free = self.state.lock().freespace(self.sb, self.sb.minfree);
        free - i64::try_from(frags).unwrap_or(i64::MAX) < 0
    }

    /// Allocate `size` bytes for logical block `lbn` of `ip` near `bpref`
    /// and charge them to the inode.
    pub fn alloc(
        &self,
        ip: &mut Inode,
        lbn: i64,
        bpref: u64,
        size: u32,
        cred: Cred,
    ) -> Result<DiskAddr> {
        let sb = self.sb;
        self.check_size(size)?;
        let no_blocks = size == sb.bsize && self.state.lock().cstotal.nbfree == 0;
        if no_blocks || self.reserve_exhausted(cred, sb.numfrags(u64::from(size))) {
            return Err(self.full(ip.number, cred));
        }
        let bpref = if bpref >= sb.size { 0 } else { bpref };
        let cgx = if bpref == 0 {
            sb.ino_to_cg(ip.number)
        } else {
            sb.dtog(bpref)
        };
        let Some(bno) = self.hashalloc(cgx, bpref, AllocKind::Fragment { size })? else {
            return Err(self.full(ip.number, cred));
        };
        ip.blocks += Superblock::btodb(u64::from(size));
        trace!(target: "ffs::alloc", event = "alloc", ino = ip.number.0, lbn, bpref, bno, size);
        Ok(DiskAddr(bno))
    }

    /// Size to request when a fragment has to move, switching the
    /// optimisation goal when fragmentation crosses its thresholds.
    fn request_size(&self, nsize: u32) -> u32 {
        let sb = self.sb;
        let dsize = i64::try_from(sb.dsize).unwrap_or(i64::MAX);
        let minfree = i64::from(sb.minfree);
        let mut st = self.state.lock();
        match st.optim {
            Optim::Space => {
                if sb.minfree > 5 && st.cstotal.nffree <= dsize * minfree / 200 {
                    st.optim = Optim::Time;
                    st.modified = true;
                    debug!(target: "ffs::alloc", event = "optim_switch", to = "time", nffree = st.cstotal.nffree);
                }
                nsize
            }
            Optim::Time => {
                if st.cstotal.nffree >= dsize * (minfree - 2) / 100 {
                    st.optim = Optim::Space;
                    st.modified = true;
                    debug!(target: "ffs::alloc", event = "optim_switch", to = "space", nffree = st.cstotal.nffree);
                }
                sb.bsize
            }
        }
    }

    /// Grow the fragment run backing direct block `lbprev` from `osize` to
    /// `nsize` bytes, in place when the following fragments are free, else
    /// by moving it. Returns the (possibly new) address and a buffer of
    /// `nsize` bytes holding the old contents followed by zeroes.
    pub fn realloccg(
        &self,
        ip: &mut Inode,
        lbprev: i64,
        bpref: u64,
        osize: u32,
        nsize: u32,
        cred: Cred,
    ) -> Result<(DiskAddr, Buf<'a>)> {
        let sb = self.sb;
        self.check_size(osize)?;
        self.check_size(nsize)?;
        if nsize <= osize {
            return Err(FfsError::InvalidArgument(format!(
                "realloccg cannot shrink {osize} to {nsize}"
            )));
        }
        if self.reserve_exhausted(cred, sb.numfrags(u64::from(nsize - osize))) {
            return Err(self.full(ip.number, cred));
        }
        let bprev = ip.direct(lbprev);
        if bprev.is_hole() {
            return Err(FfsError::InvalidArgument(format!(
                "inode {} has no block at lbn {lbprev} to grow",
                ip.number
            )));
        }

        let old = {
            let buf = self.cache.read_block(sb.frag_to_byte(bprev), osize as usize)?;
            let data = buf.to_vec();
            buf.release();
            data
        };

        let grown = self.with_cg(sb.dtog(bprev.0), |ops| {
            ops.extend_frag(bprev.0, osize, nsize)
        })?;
        let (bno, mut buf) = if let Some(bno) = grown {
            let buf = match self.cache.get_block(sb.frag_to_byte(DiskAddr(bno)), nsize as usize) {
                Ok(buf) => buf,
                Err(err) => {
                    let added = DiskAddr(bno + sb.numfrags(u64::from(osize)));
                    self.release_moved(ip.number, added, nsize - osize, &err);
                    return Err(err);
                }
            };
            trace!(target: "ffs::alloc", event = "frag_extend", ino = ip.number.0, bno, osize, nsize);
            (bno, buf)
        } else {
            let bpref = if bpref >= sb.size { 0 } else { bpref };
            let cgx = if bpref == 0 {
                sb.ino_to_cg(ip.number)
            } else {
                sb.dtog(bpref)
            };
            let request = self.request_size(nsize);
            let Some(bno) = self.hashalloc(cgx, bpref, AllocKind::Fragment { size: request })?
            else {
                return Err(self.full(ip.number, cred));
            };
            let buf = match self.cache.get_block(sb.frag_to_byte(DiskAddr(bno)), nsize as usize) {
                Ok(buf) => buf,
                Err(err) => {
                    self.release_moved(ip.number, DiskAddr(bno), request, &err);
                    return Err(err);
                }
            };
            if nsize < request {
                let tail = DiskAddr(bno + sb.numfrags(u64::from(nsize)));
                if let Err(err) = self.blkfree(ip.number, tail, request - nsize) {
                    buf.invalidate();
                    self.release_moved(ip.number, DiskAddr(bno), request, &err);
                    return Err(err);
                }
            }
            // The old run is released only once the new one is fully set up.
            if let Err(err) = self.blkfree(ip.number, bprev, osize) {
                buf.invalidate();
                self.release_moved(ip.number, DiskAddr(bno), nsize, &err);
                return Err(err);
            }
            debug!(
                target: "ffs::alloc",
                event = "frag_move",
                ino = ip.number.0,
                from = bprev.0,
                to = bno,
                osize,
                nsize,
                request
            );
            (bno, buf)
        };
        ip.blocks += Superblock::btodb(u64::from(nsize - osize));

        buf.clear();
        buf[..old.len()].copy_from_slice(&old);
        Ok((DiskAddr(bno), buf))
    }

    /// Give back a run taken for a fragment move that could not complete.
    /// The old run stays in the inode.
    fn release_moved(&self, ino: InodeNumber, bno: DiskAddr, size: u32, cause: &FfsError) {
        warn!(target: "ffs::alloc", event = "frag_move_aborted", ino = ino.0, bno = bno.0, size, error = %cause);
        if let Err(err) = self.blkfree(ino, bno, size) {
            error!(target: "ffs::alloc", event = "frag_move_leak", ino = ino.0, bno = bno.0, size, error = %err);
            self.mark_needs_check(&err);
        }
    }

    /// Allocate `blocks` contiguous full blocks near `bpref`.
    pub fn alloc_cluster(&self, ip: &Inode, bpref: u64, blocks: u32) -> Result<Option<DiskAddr>> {
        let sb = self.sb;
        let cgx = if bpref == 0 || bpref >= sb.size {
            sb.ino_to_cg(ip.number)
        } else {
            sb.dtog(bpref)
        };
        let found = self.hashalloc(cgx, bpref, AllocKind::Cluster { blocks })?;
        if let Some(bno) = found {
            trace!(target: "ffs::alloc", event = "cluster_alloc", ino = ip.number.0, bno, blocks);
        }
        Ok(found.map(DiskAddr))
    }

    fn check_free_range(&self, bno: DiskAddr, size: u32) -> Result<()> {
        let sb = self.sb;
        let frags = sb.numfrags(u64::from(size));
        if size == 0
            || size > sb.bsize
            || size % sb.fsize != 0
            || u64::from(sb.fragnum(bno.0)) + frags > u64::from(sb.frag())
        {
            return Err(FfsError::InvalidArgument(format!(
                "bad size {size} for block {bno} (bsize {}, fsize {})",
                sb.bsize, sb.fsize
            )));
        }
        Ok(())
    }

    /// Return `size` bytes at `bno`, released by inode `ino`, to the free
    /// map. Cached buffers over the range are discarded first.
    pub fn blkfree(&self, ino: InodeNumber, bno: DiskAddr, size: u32) -> Result<()> {
        let sb = self.sb;
        self.check_free_range(bno, size)?;
        if bno.0 >= sb.size {
            let err = FfsError::Corruption {
                block: bno.0,
                detail: format!("inode {ino} frees block {bno} beyond the end of the filesystem"),
            };
            self.mark_needs_check(&err);
            return Err(err);
        }
        self.cache
            .invalidate_range(sb.frag_to_byte(bno), u64::from(size));
        self.with_cg(sb.dtog(bno.0), |ops| ops.free_blocks(bno.0, size).map(Some))?;
        trace!(target: "ffs::alloc", event = "blkfree", ino = ino.0, bno = bno.0, size);
        if let Some(deps) = self.deps {
            deps.record_free(FreeRecord {
                ino,
                addr: bno,
                size,
            });
        }
        Ok(())
    }

    /// Whether `size` bytes at `bno` are in use.
    pub fn checkblk(&self, bno: DiskAddr, size: u32) -> Result<bool> {
        let sb = self.sb;
        self.check_free_range(bno, size)?;
        if bno.0 >= sb.size {
            return Err(FfsError::InvalidArgument(format!(
                "block {bno} beyond the end of the filesystem"
            )));
        }
        let cgx = sb.dtog(bno.0);
        let ops = CgOps::new(sb, self.read_group(cgx)?);
        ops.is_allocated(bno.0, size).inspect_err(|err| {
            if err.is_corruption() {
                self.fence(cgx, err);
            }
        })
    }

    // ── inodes ──────────────────────────────────────────────────────────

    fn out_of_inodes(&self, cred: Cred) -> FfsError {
        warn!(target: "ffs::alloc", event = "out_of_inodes", uid = cred.uid, "no free inodes");
        FfsError::NoInodes
    }

    /// Allocate an inode for a new file of type `mode` created in the
    /// directory `parent`. The returned inode is initialised and queued for
    /// write.
    pub fn valloc(&self, parent: &Inode, mode: u16, cred: Cred) -> Result<Inode> {
        let sb = self.sb;
        let is_dir = mode & IFMT == IFDIR;
        let (ipref, cgx) = {
            let mut st = self.state.lock();
            if st.cstotal.nifree <= 0 {
                drop(st);
                return Err(self.out_of_inodes(cred));
            }
            let mut ipref = if is_dir {
                policy::dirpref(sb, &mut st, parent).0
            } else {
                parent.number.0
            };
            if ipref >= u64::from(sb.ncg) * u64::from(sb.ipg) {
                ipref = 0;
            }
            let cgx = sb.ino_to_cg(InodeNumber(ipref));
            let run = &mut st.contigdirs[cgx as usize];
            *run = if is_dir {
                run.saturating_add(1)
            } else {
                run.saturating_sub(1)
            };
            (ipref, cgx)
        };

        let Some(ino) = self.hashalloc(cgx, ipref, AllocKind::Inode { dir: is_dir })? else {
            return Err(self.out_of_inodes(cred));
        };
        let ino = InodeNumber(ino);
        let mut ip = match load_inode(self.cache, sb, ino) {
            Ok(ip) => ip,
            Err(err) => {
                if let Err(free_err) = self.vfree(ino, is_dir) {
                    warn!(target: "ffs::alloc", event = "valloc_undo_failed", ino = ino.0, error = %free_err);
                }
                return Err(err);
            }
        };
        if ip.mode != 0 {
            let err = FfsError::Corruption {
                block: sb.ino_to_fsba(ino).0,
                detail: format!("inode {ino} handed out while in use (mode {:o})", ip.mode),
            };
            self.fence(sb.ino_to_cg(ino), &err);
            return Err(err);
        }
        if ip.blocks != 0 {
            warn!(target: "ffs::alloc", event = "free_inode_had_blocks", ino = ino.0, blocks = ip.blocks);
            ip.blocks = 0;
        }
        ip.flags = 0;
        ip.generation = ip.generation.wrapping_add(1).max(1);
        ip.mode = mode;
        ip.uid = cred.uid;
        ip.gid = cred.gid;
        ip.touch();
        update_inode(self.cache, sb, &ip, false)?;
        trace!(target: "ffs::alloc", event = "valloc", ino = ino.0, dir = is_dir, parent = parent.number.0);
        Ok(ip)
    }

    /// Return inode `ino` to its group's free map.
    pub fn vfree(&self, ino: InodeNumber, is_dir: bool) -> Result<()> {
        let sb = self.sb;
        if ino.0 >= u64::from(sb.ncg) * u64::from(sb.ipg) {
            return Err(FfsError::InvalidArgument(format!("inode {ino} out of range")));
        }
        self.with_cg(sb.ino_to_cg(ino), |ops| ops.free_inode(ino.0, is_dir).map(Some))?;
        trace!(target: "ffs::alloc", event = "vfree", ino = ino.0, dir = is_dir);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::bitmap::set_block;
    use ffs_block::{ByteDevice, MemByteDevice};
    use ffs_ondisk::{AddrWidth, FragsPerBlock};

    /// 4 groups of 2048 one-KiB fragments in 4 KiB blocks.
    pub(crate) fn sample_sb() -> Superblock {
        Superblock {
            bsize: 4096,
            fsize: 1024,
            frags: FragsPerBlock::Four,
            fpg: 2048,
            ipg: 256,
            ncg: 4,
            inode_size: 128,
            size: 8192,
            dsize: 7000,
            sblkno: 64,
            cblkno: 68,
            iblkno: 72,
            dblkno: 104,
            cgsize: 644,
            cssize: 1024,
            csaddr: DiskAddr(104),
            ndaddr: 12,
            addr_width: AddrWidth::U32,
            nsect: 32,
            ntrak: 16,
            nrpos: 8,
            cpg: 8,
            rps: 60,
            rotdelay: 0,
            contigsumsize: 8,
            maxcontig: 8,
            maxbpg: 512,
            minfree: 8,
            optim: Optim::Time,
            avgfilesize: 16_384,
            avgfpdir: 64,
            cgrotor: 0,
            cstotal: CsSum::default(),
            time: 0,
            clean: true,
            flags: 0,
        }
    }

    /// Group with every data block free and every inode unused.
    pub(crate) fn fresh_group(sb: &Superblock, cgx: u32) -> CylinderGroup {
        let mut cg = CylinderGroup::empty(sb, cgx);
        for blkno in sb.dblkno / sb.frag()..sb.blocks_per_group() {
            set_block(&mut cg.blksfree, sb.frags, blkno);
        }
        rebuild_summaries(sb, &mut cg);
        cg
    }

    /// In-memory filesystem with fresh groups written to the device.
    pub(crate) struct Fixture {
        pub(crate) dev: MemByteDevice,
        pub(crate) cache: BufferCache,
        pub(crate) sb: Superblock,
        pub(crate) state: Mutex<FsState>,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let sb = sample_sb();
            let dev = MemByteDevice::new((sb.size * u64::from(sb.fsize)) as usize);
            let mut cs = Vec::new();
            for cgx in 0..sb.ncg {
                let cg = fresh_group(&sb, cgx);
                let mut raw = vec![0_u8; sb.cgsize as usize];
                cg.write_to_bytes(&sb, &mut raw).unwrap();
                dev.write_all_at(sb.frag_to_byte(sb.cgtod(cgx)).0, &raw)
                    .unwrap();
                cs.push(cg.cs);
            }
            let state = Mutex::new(FsState::new(&sb, cs));
            let cache = BufferCache::new(Box::new(dev.clone()), 64);
            Self {
                dev,
                cache,
                sb,
                state,
            }
        }

        pub(crate) fn ctx(&self) -> FsCtx<'_> {
            FsCtx::new(&self.cache, &self.sb, &self.state)
        }
    }
}
