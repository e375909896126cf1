#![forbid(unsafe_code)]
//! A mounted FFS filesystem.
//!
//! [`Ffs`] owns the device (through the buffer cache), the geometry and the
//! shared allocation state, and exposes the file operations that drive the
//! allocator: creating and removing inodes, writing (which allocates through
//! [`balloc`]), reading, [`truncate`], block reallocation for clustering,
//! sync and unmount. [`format_device`] lays out a fresh filesystem and
//! [`check`] compares on-disk state against what the inodes claim.
//!
//! Callers serialise operations on the same inode; operations on different
//! inodes may run concurrently.

mod balloc;
mod check;
mod format;
mod realloc;
mod truncate;

pub use balloc::{IoFlags, balloc};
pub use check::{CheckReport, check};
pub use format::{FormatOptions, format_device, plan_superblock};
pub use realloc::realloc_blocks;
pub use truncate::truncate;

pub use ffs_alloc::{Cred, FsCtx, FsState};
pub use ffs_block::{ByteDevice, CacheStats, FileByteDevice, MemByteDevice};
pub use ffs_bmap::Mapping;
pub use ffs_error::{FfsError, Result};
pub use ffs_inode::Inode;
pub use ffs_journal::{DependencyLog, FlushReport};
pub use ffs_ondisk::{AddrWidth, CsSum, IFDIR, IFMT, IFREG, Optim, Superblock};
pub use ffs_types::{DiskAddr, InodeNumber};

use ffs_block::BufferCache;
use ffs_inode::{blksize, load_inode, now_secs, update_inode};
use ffs_journal::DependencyHook;
use ffs_ondisk::{
    FS_NEEDSFSCK, SBLOCK_OFFSET, SBLOCK_SIZE, decode_csum_array, encode_csum_array,
};
use ffs_types::ByteOffset;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Mount-time switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Refuse every mutation with [`FfsError::ReadOnly`].
    pub read_only: bool,
    /// Buffer cache capacity in entries.
    pub cache_blocks: usize,
    /// Leave freshly initialised indirect blocks as delayed writes. Installs
    /// the dependency log so they still reach the disk before their parents.
    pub async_writes: bool,
    /// Leave indirect blocks trimmed by truncation as delayed writes.
    pub async_free: bool,
    /// Record allocation and free dependencies and write children before
    /// parents at sync, instead of writing new metadata synchronously.
    pub soft_deps: bool,
    /// Write cylinder group descriptors synchronously.
    pub sync_groups: bool,
    /// Move freshly written runs of blocks into contiguous clusters.
    pub realloc_blocks: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            cache_blocks: 1024,
            async_writes: false,
            async_free: false,
            soft_deps: false,
            sync_groups: false,
            realloc_blocks: false,
        }
    }
}

/// Live counters for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub ncg: u32,
    pub bsize: u32,
    pub fsize: u32,
    /// Total fragments.
    pub size: u64,
    /// Fragments available for data.
    pub dsize: u64,
    pub cstotal: CsSum,
    pub free_bytes: u64,
    pub optim: Optim,
    pub needs_check: bool,
    pub fenced_groups: Vec<u32>,
}

/// A mounted filesystem.
pub struct Ffs {
    cache: BufferCache,
    sb: Superblock,
    state: Mutex<FsState>,
    deps: Option<DependencyLog>,
    opts: MountOptions,
}

impl std::fmt::Debug for Ffs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ffs")
            .field("ncg", &self.sb.ncg)
            .field("bsize", &self.sb.bsize)
            .field("fsize", &self.sb.fsize)
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl Ffs {
    // ── lifecycle ───────────────────────────────────────────────────────

    /// Format `dev` and mount the result.
    pub fn format(
        dev: Box<dyn ByteDevice>,
        format: &FormatOptions,
        opts: MountOptions,
    ) -> Result<Self> {
        format_device(dev.as_ref(), format)?;
        Self::mount(dev, opts)
    }

    /// Open and mount an image file.
    pub fn open(path: impl AsRef<Path>, mut opts: MountOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        if !dev.is_writable() && !opts.read_only {
            warn!(
                target: "ffs::mount",
                event = "read_only_fallback",
                path = %path.as_ref().display(),
                "image is not writable, mounting read-only"
            );
            opts.read_only = true;
        }
        Self::mount(Box::new(dev), opts)
    }

    /// Mount the filesystem on `dev`.
    ///
    /// A filesystem flagged as needing a check mounts read-only only. A
    /// writable mount marks the on-disk superblock not clean until
    /// [`Ffs::unmount`].
    pub fn mount(dev: Box<dyn ByteDevice>, opts: MountOptions) -> Result<Self> {
        let mut region = vec![0_u8; SBLOCK_SIZE];
        dev.read_exact_at(SBLOCK_OFFSET, &mut region)?;
        let sb = Superblock::parse_region(&region)
            .map_err(|err| FfsError::Format(format!("superblock: {err}")))?;
        let needed = sb.size * u64::from(sb.fsize);
        if dev.len_bytes() < needed {
            return Err(FfsError::Format(format!(
                "device holds {} bytes, filesystem needs {needed}",
                dev.len_bytes()
            )));
        }
        if sb.needs_check() && !opts.read_only {
            return Err(FfsError::NeedsCheck);
        }
        if !sb.clean {
            warn!(target: "ffs::mount", event = "unclean", "filesystem was not unmounted cleanly");
        }

        let mut raw = vec![0_u8; sb.cssize as usize];
        dev.read_exact_at(sb.frag_to_byte(sb.csaddr).0, &mut raw)?;
        let cs = decode_csum_array(&raw, sb.ncg)
            .map_err(|err| FfsError::Format(format!("summary array: {err}")))?;
        let state = FsState::new(&sb, cs);
        if state.cstotal != sb.cstotal {
            warn!(
                target: "ffs::mount",
                event = "summary_total_mismatch",
                stored_nbfree = sb.cstotal.nbfree,
                summed_nbfree = state.cstotal.nbfree,
                "using per-group summaries"
            );
        }

        let fs = Self {
            cache: BufferCache::new(dev, opts.cache_blocks.max(16)),
            deps: (opts.soft_deps || opts.async_writes).then(DependencyLog::new),
            state: Mutex::new(state),
            sb,
            opts,
        };
        if !fs.opts.read_only {
            fs.write_summary(false)?;
        }
        info!(
            target: "ffs::mount",
            event = "mounted",
            ncg = fs.sb.ncg,
            bsize = fs.sb.bsize,
            fsize = fs.sb.fsize,
            read_only = fs.opts.read_only,
            soft_deps = fs.opts.soft_deps
        );
        Ok(fs)
    }

    /// Write every dirty buffer, then the summary array and superblock.
    pub fn sync(&self) -> Result<()> {
        if self.opts.read_only {
            return Ok(());
        }
        match &self.deps {
            Some(log) => {
                let report = log.flush(&self.cache)?;
                debug!(target: "ffs::sync", event = "deps_flushed", ordered = report.ordered, rest = report.rest);
            }
            None => {
                let written = self.cache.flush_all()?;
                debug!(target: "ffs::sync", event = "flushed", written);
            }
        }
        self.write_summary(false)
    }

    /// Flush everything and mark the filesystem clean unless a check is
    /// pending.
    pub fn unmount(self) -> Result<()> {
        if !self.opts.read_only {
            self.sync()?;
            self.write_summary(true)?;
        }
        info!(target: "ffs::mount", event = "unmounted", ncg = self.sb.ncg);
        Ok(())
    }

    fn write_summary(&self, clean: bool) -> Result<()> {
        let (sb, cs) = {
            let st = self.state.lock();
            let mut sb = self.sb.clone();
            sb.cstotal = st.cstotal;
            sb.cgrotor = st.cgrotor;
            sb.optim = st.optim;
            if st.needs_check {
                sb.flags |= FS_NEEDSFSCK;
            }
            sb.clean = clean && !st.needs_check;
            sb.time = now_secs();
            (sb, st.cs.clone())
        };
        let mut buf = self
            .cache
            .get_block(sb.frag_to_byte(sb.csaddr), sb.cssize as usize)?;
        buf.clear();
        encode_csum_array(&cs, &mut buf)
            .map_err(|err| FfsError::Format(format!("summary array: {err}")))?;
        buf.write_sync()?;

        let mut buf = self
            .cache
            .get_block(ByteOffset(SBLOCK_OFFSET), SBLOCK_SIZE)?;
        buf.clear();
        sb.write_region(&mut buf)
            .map_err(|err| FfsError::Format(format!("superblock: {err}")))?;
        buf.write_sync()?;
        self.cache.device().sync()
    }

    // ── accessors ───────────────────────────────────────────────────────

    /// Allocation context over this mount.
    #[must_use]
    pub fn ctx(&self) -> FsCtx<'_> {
        FsCtx::new(&self.cache, &self.sb, &self.state)
            .with_deps(self.deps.as_ref().map(|log| log as &dyn DependencyHook))
            .with_sync_groups(self.opts.sync_groups)
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.opts
    }

    #[must_use]
    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    /// The dependency log when mounted with `soft_deps` or `async_writes`.
    #[must_use]
    pub fn deps(&self) -> Option<&DependencyLog> {
        self.deps.as_ref()
    }

    #[must_use]
    pub fn stats(&self) -> FsStats {
        let st = self.state.lock();
        let free_frags = (st.cstotal.nbfree << self.sb.fragshift()) + st.cstotal.nffree;
        FsStats {
            ncg: self.sb.ncg,
            bsize: self.sb.bsize,
            fsize: self.sb.fsize,
            size: self.sb.size,
            dsize: self.sb.dsize,
            cstotal: st.cstotal,
            free_bytes: u64::try_from(free_frags).unwrap_or(0) * u64::from(self.sb.fsize),
            optim: st.optim,
            needs_check: st.needs_check,
            fenced_groups: st.fenced.iter().copied().collect(),
        }
    }

    fn writable(&self) -> Result<()> {
        if self.opts.read_only {
            return Err(FfsError::ReadOnly);
        }
        Ok(())
    }

    fn io_flags(&self) -> IoFlags {
        IoFlags {
            clear: false,
            sync: false,
            async_free: self.opts.async_free,
        }
    }

    // ── inodes ──────────────────────────────────────────────────────────

    pub fn root(&self) -> Result<Inode> {
        self.load_inode(InodeNumber::ROOT)
    }

    pub fn load_inode(&self, ino: InodeNumber) -> Result<Inode> {
        load_inode(&self.cache, &self.sb, ino)
    }

    pub fn update_inode(&self, ip: &Inode, wait: bool) -> Result<()> {
        self.writable()?;
        update_inode(&self.cache, &self.sb, ip, wait)
    }

    /// Allocate and initialise an inode of type `mode` under `parent`.
    pub fn create(&self, parent: &Inode, mode: u16, cred: Cred) -> Result<Inode> {
        self.writable()?;
        if !parent.is_dir() {
            return Err(FfsError::InvalidArgument(format!(
                "inode {} is not a directory",
                parent.number
            )));
        }
        let mut ip = self.ctx().valloc(parent, mode, cred)?;
        ip.nlink = if ip.is_dir() { 2 } else { 1 };
        update_inode(&self.cache, &self.sb, &ip, false)?;
        Ok(ip)
    }

    /// Release all of `ip`'s storage and then the inode itself.
    pub fn remove(&self, mut ip: Inode, cred: Cred) -> Result<()> {
        self.writable()?;
        let was_dir = ip.is_dir();
        truncate(&self.ctx(), &mut ip, 0, cred, self.io_flags())?;
        ip.mode = 0;
        ip.nlink = 0;
        ip.touch_ctime();
        update_inode(&self.cache, &self.sb, &ip, false)?;
        self.ctx().vfree(ip.number, was_dir)
    }

    // ── data ────────────────────────────────────────────────────────────

    /// Physical mapping of logical block `lbn`, with contiguous run lengths.
    pub fn bmap(&self, ip: &Inode, lbn: i64) -> Result<Mapping> {
        ffs_bmap::bmap(&self.cache, &self.sb, ip, lbn, true)
    }

    /// Read up to `len` bytes at `offset`. Holes read as zeroes; the result
    /// stops at end of file.
    pub fn read(&self, ip: &Inode, offset: u64, len: usize) -> Result<Vec<u8>> {
        let sb = &self.sb;
        let end = offset.saturating_add(len as u64).min(ip.size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(usize::try_from(end - offset).unwrap_or(0));
        let mut pos = offset;
        while pos < end {
            let lbn = sb.lblkno(pos);
            let boff = sb.blkoff(pos);
            let n = (u64::from(sb.bsize) - boff).min(end - pos);
            let (boff, n_bytes) = (boff as usize, n as usize);
            let mapping = ffs_bmap::bmap(&self.cache, sb, ip, lbn, false)?;
            if mapping.is_hole() {
                out.resize(out.len() + n_bytes, 0);
            } else {
                let size = blksize(sb, ip.size, lbn) as usize;
                let buf = self
                    .cache
                    .read_block(sb.frag_to_byte(mapping.addr), size)?;
                let chunk = buf
                    .get(boff..boff + n_bytes)
                    .ok_or_else(|| FfsError::Corruption {
                        block: mapping.addr.0,
                        detail: format!(
                            "inode {} lbn {lbn} is shorter than its file size implies",
                            ip.number
                        ),
                    })?;
                out.extend_from_slice(chunk);
                buf.release();
            }
            pos += n;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, allocating as needed, and queue the inode
    /// for write. Returns the number of bytes written.
    pub fn write(&self, ip: &mut Inode, offset: u64, data: &[u8], cred: Cred) -> Result<usize> {
        self.writable()?;
        if data.is_empty() {
            return Ok(0);
        }
        let sb = &self.sb;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FfsError::FileTooLarge)?;
        if end > sb.lblktosize(sb.max_lbn()) {
            return Err(FfsError::FileTooLarge);
        }
        let ctx = self.ctx();
        let bsize = u64::from(sb.bsize);
        let mut done = 0_usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let boff = sb.blkoff(pos);
            let xfer = (bsize - boff).min((data.len() - done) as u64);
            let flags = IoFlags {
                clear: xfer < bsize,
                ..self.io_flags()
            };
            let len = u32::try_from(xfer).unwrap_or(sb.bsize);
            let mut buf = balloc(&ctx, ip, pos, len, cred, flags)?;
            let (start, count) = (boff as usize, xfer as usize);
            buf[start..start + count].copy_from_slice(&data[done..done + count]);
            buf.write_delayed();
            ip.size = ip.size.max(pos + xfer);
            done += count;
        }
        ip.touch();
        update_inode(&self.cache, sb, ip, false)?;
        if self.opts.realloc_blocks {
            self.cluster_range(ip, sb.lblkno(offset), sb.lblkno(end - 1))?;
        }
        Ok(done)
    }

    /// Each time a write completes the last block of a `maxcontig`-aligned
    /// window, offer that window to [`realloc_blocks`].
    fn cluster_range(&self, ip: &mut Inode, first: i64, last: i64) -> Result<()> {
        let sb = &self.sb;
        let ctx = self.ctx();
        let maxcontig = i64::from(sb.maxcontig);
        if maxcontig < 2 {
            return Ok(());
        }
        for end in (first..=last).filter(|lbn| (lbn + 1) % maxcontig == 0) {
            let (array_start, _) = realloc::pointer_array_bounds(sb, end)?;
            let start = (end + 1 - maxcontig).max(array_start);
            if end > start {
                realloc_blocks(&ctx, ip, start, end, self.io_flags())?;
            }
        }
        Ok(())
    }

    /// Change the file's length, freeing or allocating storage.
    pub fn truncate(&self, ip: &mut Inode, length: u64, cred: Cred) -> Result<()> {
        self.writable()?;
        truncate(&self.ctx(), ip, length, cred, self.io_flags())
    }

    /// Try to move logical blocks `start..=end` into one contiguous run.
    pub fn realloc_blocks(&self, ip: &mut Inode, start: i64, end: i64) -> Result<bool> {
        self.writable()?;
        realloc_blocks(&self.ctx(), ip, start, end, self.io_flags())
    }

    /// Cross-check group maps, summaries and inode block claims.
    pub fn check(&self) -> Result<CheckReport> {
        check(&self.ctx())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn mount_reads_back_formatted_geometry() {
        let m = Mounted::new();
        let stats = m.fs.stats();
        assert_eq!(stats.ncg, 4);
        assert_eq!(stats.dsize, 7967);
        assert_eq!(
            stats.cstotal.nbfree * 4 + stats.cstotal.nffree,
            i64::try_from(stats.dsize).unwrap()
        );
        let root = m.root();
        assert!(root.is_dir());
        assert_eq!(root.nlink, 2);
    }

    #[test]
    fn writable_mount_marks_superblock_dirty_until_unmount() {
        let m = Mounted::new();
        let mut region = vec![0_u8; SBLOCK_SIZE];
        m.dev.read_exact_at(SBLOCK_OFFSET, &mut region).unwrap();
        assert!(!Superblock::parse_region(&region).unwrap().clean);

        m.fs.unmount().unwrap();
        m.dev.read_exact_at(SBLOCK_OFFSET, &mut region).unwrap();
        assert!(Superblock::parse_region(&region).unwrap().clean);
    }

    #[test]
    fn needs_check_refuses_writable_mount() {
        let m = Mounted::new();
        m.ctx().mark_needs_check(&FfsError::NoSpace);
        m.fs.unmount().unwrap();

        let err = Ffs::mount(Box::new(m.dev.clone()), MountOptions::default()).unwrap_err();
        assert!(matches!(err, FfsError::NeedsCheck));
        let ro = MountOptions {
            read_only: true,
            ..MountOptions::default()
        };
        let fs = Ffs::mount(Box::new(m.dev.clone()), ro).unwrap();
        assert!(fs.stats().needs_check);
        assert!(matches!(
            fs.create(&fs.root().unwrap(), IFREG, Cred::ROOT),
            Err(FfsError::ReadOnly)
        ));
    }

    #[test]
    fn write_then_read_across_blocks_and_holes() {
        let m = Mounted::new();
        let mut ip = m.file();
        let data: Vec<u8> = (0..10_000_u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(m.fs.write(&mut ip, 0, &data, Cred::ROOT).unwrap(), 10_000);
        assert_eq!(ip.size, 10_000);
        // Two full blocks and a 2 KiB fragment run.
        assert_eq!(ip.blocks, 8 + 8 + 4);
        assert_eq!(m.fs.read(&ip, 0, 20_000).unwrap(), data);

        m.fs.write(&mut ip, 20 * 4096, b"tail", Cred::ROOT).unwrap();
        let hole = m.fs.read(&ip, 16_384, 4096).unwrap();
        assert!(hole.iter().all(|&b| b == 0));
        assert_eq!(m.fs.read(&ip, 20 * 4096, 10).unwrap(), b"tail");
    }

    #[test]
    fn state_survives_remount() {
        let m = Mounted::new();
        let mut ip = m.file();
        m.fs.write(&mut ip, 0, &[7_u8; 5000], Cred::ROOT).unwrap();
        let free = m.fs.stats().cstotal;
        let ino = ip.number;
        m.fs.unmount().unwrap();

        let fs = Ffs::mount(Box::new(m.dev.clone()), MountOptions::default()).unwrap();
        assert_eq!(fs.stats().cstotal, free);
        let ip = fs.load_inode(ino).unwrap();
        assert_eq!(ip.size, 5000);
        assert_eq!(fs.read(&ip, 0, 5000).unwrap(), vec![7_u8; 5000]);
        assert!(fs.check().unwrap().is_clean());
    }

    #[test]
    fn remove_returns_blocks_and_inode() {
        let m = Mounted::new();
        let before = m.fs.stats().cstotal;
        let mut ip = m.file();
        m.fs.write(&mut ip, 0, &[1_u8; 60_000], Cred::ROOT).unwrap();
        m.fs.remove(ip, Cred::ROOT).unwrap();
        assert_eq!(m.fs.stats().cstotal, before);
    }
}
