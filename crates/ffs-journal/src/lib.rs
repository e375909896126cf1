#![forbid(unsafe_code)]
//! Soft-dependency hook for metadata write ordering.
//!
//! When a [`DependencyHook`] is installed the allocator stops issuing
//! synchronous writes for freshly initialised indirect blocks. Instead it
//! delayed-writes them and records an [`AllocationRecord`]; the hook owner is
//! then responsible for getting the new block to disk before the parent that
//! points at it. [`DependencyLog`] is the in-memory implementation: its
//! [`DependencyLog::flush`] writes every recorded child buffer first and only
//! then the rest of the dirty cache.

use ffs_block::BufferCache;
use ffs_error::Result;
use ffs_types::{ByteOffset, DiskAddr, InodeNumber};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

/// Where the pointer to a new block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllocationSite {
    /// Direct or indirect-root pointer in the inode itself.
    Inode,
    /// Entry `slot` of the indirect block at `parent`.
    Indirect { parent: DiskAddr, slot: usize },
}

/// One block allocation that must be ordered before its parent pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    pub ino: InodeNumber,
    /// Logical block; negative for indirect blocks.
    pub lbn: i64,
    pub new_addr: DiskAddr,
    pub old_addr: DiskAddr,
    pub new_size: u32,
    pub old_size: u32,
    pub site: AllocationSite,
    /// Buffer holding the new block's initial contents, if any.
    pub buffer: Option<ByteOffset>,
}

/// A block or fragment released by a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeRecord {
    pub ino: InodeNumber,
    pub addr: DiskAddr,
    pub size: u32,
}

/// Ordering annotations invoked at allocation and free points.
pub trait DependencyHook: Send + Sync {
    fn record_allocation(&self, record: AllocationRecord);

    fn record_free(&self, record: FreeRecord);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Recorded child buffers written ahead of everything else.
    pub ordered: usize,
    /// Remaining dirty buffers written afterwards.
    pub rest: usize,
}

#[derive(Debug, Default)]
struct LogState {
    allocations: Vec<AllocationRecord>,
    frees: Vec<FreeRecord>,
}

/// In-memory dependency log.
#[derive(Debug, Default)]
pub struct DependencyLog {
    state: Mutex<LogState>,
}

impl DependencyLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pending_allocations(&self) -> Vec<AllocationRecord> {
        self.state.lock().allocations.clone()
    }

    #[must_use]
    pub fn pending_frees(&self) -> Vec<FreeRecord> {
        self.state.lock().frees.clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let st = self.state.lock();
        st.allocations.is_empty() && st.frees.is_empty()
    }

    /// Write recorded child buffers in record order, then every other dirty
    /// buffer, then sync the device. Records are retired only on success.
    pub fn flush(&self, cache: &BufferCache) -> Result<FlushReport> {
        let (allocations, frees) = {
            let mut st = self.state.lock();
            (
                std::mem::take(&mut st.allocations),
                std::mem::take(&mut st.frees),
            )
        };

        let mut report = FlushReport::default();
        for (idx, record) in allocations.iter().enumerate() {
            let Some(offset) = record.buffer else {
                continue;
            };
            match cache.flush_one(offset) {
                Ok(true) => report.ordered += 1,
                Ok(false) => {}
                Err(err) => {
                    self.requeue(allocations[idx..].to_vec(), frees);
                    return Err(err);
                }
            }
        }
        match cache.flush_all() {
            Ok(rest) => report.rest = rest,
            Err(err) => {
                self.requeue(Vec::new(), frees);
                return Err(err);
            }
        }
        debug!(
            ordered = report.ordered,
            rest = report.rest,
            frees = frees.len(),
            "dependency_flush"
        );
        Ok(report)
    }

    fn requeue(&self, mut allocations: Vec<AllocationRecord>, mut frees: Vec<FreeRecord>) {
        let mut st = self.state.lock();
        allocations.append(&mut st.allocations);
        frees.append(&mut st.frees);
        st.allocations = allocations;
        st.frees = frees;
    }
}

impl DependencyHook for DependencyLog {
    fn record_allocation(&self, record: AllocationRecord) {
        trace!(
            ino = record.ino.0,
            lbn = record.lbn,
            new = record.new_addr.0,
            old = record.old_addr.0,
            size = record.new_size,
            "dep_allocation"
        );
        self.state.lock().allocations.push(record);
    }

    fn record_free(&self, record: FreeRecord) {
        trace!(ino = record.ino.0, addr = record.addr.0, size = record.size, "dep_free");
        self.state.lock().frees.push(record);
    }
}
