//! Buffer cache keyed by device byte offset.
//!
//! A buffer is owned by exactly one [`Buf`] guard while in use; other threads
//! asking for the same offset block until the guard is released. Every guard
//! is released exactly once: explicitly through [`Buf::write_sync`],
//! [`Buf::write_delayed`], [`Buf::release`] or [`Buf::invalidate`], or
//! implicitly on drop (which behaves like `release`).
//!
//! Dirty buffers stay resident until [`BufferCache::flush_all`] (or
//! [`BufferCache::flush_one`]) writes them. Clean, idle buffers are retained
//! under ARC and evicted when the cache is over capacity.

use ffs_error::Result;
use ffs_types::ByteOffset;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use tracing::{debug, trace, warn};

use crate::arc::ArcState;
use crate::device::ByteDevice;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub device_reads: u64,
    pub device_writes: u64,
    pub delayed_writes: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

#[derive(Debug)]
struct Entry {
    data: Vec<u8>,
    len: usize,
    dirty: bool,
    busy: bool,
    /// Freed underneath a holder; dropped on release.
    stale: bool,
    /// Freed tail underneath a holder; truncated on release.
    trim_to: Option<usize>,
}

#[derive(Debug)]
struct CacheState {
    entries: BTreeMap<u64, Entry>,
    arc: ArcState,
    stats: CacheStats,
    max_len: usize,
}

impl CacheState {
    fn pinned(entries: &BTreeMap<u64, Entry>, key: u64) -> bool {
        entries.get(&key).is_some_and(|e| e.busy || e.dirty)
    }

    fn drop_evicted(&mut self, evicted: Vec<u64>) {
        for key in evicted {
            if self.entries.get(&key).is_some_and(|e| !e.busy && !e.dirty) {
                let _ = self.entries.remove(&key);
                self.stats.evictions += 1;
                trace!(offset = key, "buffer_evict");
            }
        }
    }

    fn touch(&mut self, key: u64) {
        let entries = &self.entries;
        let evicted = self.arc.access(key, &|k| Self::pinned(entries, k));
        self.drop_evicted(evicted);
    }

    fn shrink(&mut self) {
        let entries = &self.entries;
        let evicted = self.arc.shrink(&|k| Self::pinned(entries, k));
        self.drop_evicted(evicted);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// `getblk`: contents unspecified (zero on a miss).
    Get,
    /// `bread`: contents validated from the device.
    Read,
}

/// Buffer cache over one byte device.
pub struct BufferCache {
    dev: Box<dyn ByteDevice>,
    state: Mutex<CacheState>,
    idle: Condvar,
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BufferCache {
    pub fn new(dev: Box<dyn ByteDevice>, capacity: usize) -> Self {
        Self {
            dev,
            state: Mutex::new(CacheState {
                entries: BTreeMap::new(),
                arc: ArcState::new(capacity),
                stats: CacheStats::default(),
                max_len: 0,
            }),
            idle: Condvar::new(),
        }
    }

    #[must_use]
    pub fn device(&self) -> &dyn ByteDevice {
        self.dev.as_ref()
    }

    /// Get or allocate the buffer at `offset` without reading the device.
    ///
    /// A cached buffer of a different size is resized in place (grown with
    /// zeroes), keeping its dirty state.
    pub fn get_block(&self, offset: ByteOffset, size: usize) -> Result<Buf<'_>> {
        self.acquire(offset.0, size, Fill::Get)
    }

    /// Get the buffer at `offset`, reading it from the device unless cached.
    ///
    /// A cached buffer of a different size is written back if dirty and then
    /// re-read at the new size.
    pub fn read_block(&self, offset: ByteOffset, size: usize) -> Result<Buf<'_>> {
        self.acquire(offset.0, size, Fill::Read)
    }

    fn acquire(&self, offset: u64, size: usize, fill: Fill) -> Result<Buf<'_>> {
        let mut st = self.state.lock();
        loop {
            let taken = match st.entries.get_mut(&offset) {
                Some(entry) if entry.busy => None,
                Some(entry) => {
                    entry.busy = true;
                    Some(Some((std::mem::take(&mut entry.data), entry.dirty)))
                }
                None => Some(None),
            };
            let Some(taken) = taken else {
                self.idle.wait(&mut st);
                continue;
            };

            st.max_len = st.max_len.max(size);
            st.touch(offset);
            let Some((mut data, dirty)) = taken else {
                st.stats.misses += 1;
                st.entries.insert(
                    offset,
                    Entry {
                        data: Vec::new(),
                        len: size,
                        dirty: false,
                        busy: true,
                        stale: false,
                        trim_to: None,
                    },
                );
                drop(st);
                return self.fill_miss(offset, size, fill);
            };

            st.stats.hits += 1;
            if data.len() == size {
                drop(st);
                return Ok(Buf::new(self, offset, data, dirty));
            }
            if fill == Fill::Get {
                data.resize(size, 0);
                if let Some(entry) = st.entries.get_mut(&offset) {
                    entry.len = size;
                }
                drop(st);
                return Ok(Buf::new(self, offset, data, dirty));
            }
            drop(st);
            return self.reread_resized(offset, data, dirty, size);
        }
    }

    fn fill_miss(&self, offset: u64, size: usize, fill: Fill) -> Result<Buf<'_>> {
        let mut data = vec![0_u8; size];
        if fill == Fill::Read {
            if let Err(err) = self.dev.read_exact_at(offset, &mut data) {
                warn!(offset, size, error = %err, "buffer_read_failed");
                self.discard(offset);
                return Err(err);
            }
            self.state.lock().stats.device_reads += 1;
            trace!(offset, size, "buffer_read");
        }
        Ok(Buf::new(self, offset, data, false))
    }

    fn reread_resized(
        &self,
        offset: u64,
        old: Vec<u8>,
        dirty: bool,
        size: usize,
    ) -> Result<Buf<'_>> {
        if dirty {
            if let Err(err) = self.dev.write_all_at(offset, &old) {
                self.release_entry(offset, old, true);
                return Err(err);
            }
            self.state.lock().stats.device_writes += 1;
        }
        let mut data = vec![0_u8; size];
        if let Err(err) = self.dev.read_exact_at(offset, &mut data) {
            self.release_entry(offset, old, false);
            return Err(err);
        }
        {
            let mut st = self.state.lock();
            st.stats.device_reads += 1;
            if let Some(entry) = st.entries.get_mut(&offset) {
                entry.len = size;
            }
        }
        Ok(Buf::new(self, offset, data, false))
    }

    fn discard(&self, offset: u64) {
        let mut st = self.state.lock();
        let _ = st.entries.remove(&offset);
        st.arc.forget(offset);
        drop(st);
        self.idle.notify_all();
    }

    fn release_entry(&self, offset: u64, mut data: Vec<u8>, dirty: bool) {
        let mut st = self.state.lock();
        let stale = st.entries.get(&offset).is_some_and(|e| e.stale);
        if stale {
            let _ = st.entries.remove(&offset);
            st.arc.forget(offset);
        } else if let Some(entry) = st.entries.get_mut(&offset) {
            if let Some(keep) = entry.trim_to.take() {
                data.truncate(keep);
            }
            entry.len = data.len();
            entry.data = data;
            entry.dirty = dirty;
            entry.busy = false;
            if !dirty {
                st.shrink();
            }
        }
        drop(st);
        self.idle.notify_all();
    }

    /// Forget every cached byte in `[start, start + len)`.
    ///
    /// Called when fragments are freed so stale contents are never written
    /// over a later owner. Buffers straddling the start of the range are
    /// truncated to the part that stays allocated; buffers held by a guard
    /// are dropped (or truncated) when the guard is released.
    pub fn invalidate_range(&self, start: ByteOffset, len: u64) -> usize {
        let start = start.0;
        let end = start.saturating_add(len);
        let mut st = self.state.lock();
        let lo = start.saturating_sub(st.max_len as u64);
        let hits: Vec<u64> = st
            .entries
            .range(lo..end)
            .filter(|(key, entry)| **key + entry.len as u64 > start)
            .map(|(key, _)| *key)
            .collect();

        for key in &hits {
            let key = *key;
            let Some(entry) = st.entries.get_mut(&key) else {
                continue;
            };
            let keep = usize::try_from(start.saturating_sub(key)).unwrap_or(usize::MAX);
            let straddles = key < start;
            if entry.busy {
                if straddles {
                    entry.trim_to = Some(keep);
                } else {
                    entry.stale = true;
                }
            } else if straddles {
                entry.data.truncate(keep);
                entry.len = keep;
            } else {
                let _ = st.entries.remove(&key);
                st.arc.forget(key);
            }
            st.stats.invalidations += 1;
        }
        if !hits.is_empty() {
            debug!(start, len, buffers = hits.len(), "buffer_invalidate_range");
        }
        hits.len()
    }

    /// Write back the buffer at `offset` if it is dirty and idle.
    pub fn flush_one(&self, offset: ByteOffset) -> Result<bool> {
        let offset = offset.0;
        let data = {
            let mut st = self.state.lock();
            match st.entries.get_mut(&offset) {
                Some(entry) if entry.dirty && !entry.busy => {
                    entry.busy = true;
                    std::mem::take(&mut entry.data)
                }
                _ => return Ok(false),
            }
        };
        let res = self.dev.write_all_at(offset, &data);
        let ok = res.is_ok();
        if ok {
            self.state.lock().stats.device_writes += 1;
        }
        self.release_entry(offset, data, !ok);
        res.map(|()| true)
    }

    /// Write back every dirty idle buffer in offset order, then sync the device.
    pub fn flush_all(&self) -> Result<usize> {
        let dirty: Vec<u64> = self
            .state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.dirty && !e.busy)
            .map(|(k, _)| *k)
            .collect();
        let mut written = 0;
        for offset in dirty {
            if self.flush_one(ByteOffset(offset))? {
                written += 1;
            }
        }
        self.dev.sync()?;
        debug!(written, "buffer_flush_all");
        Ok(written)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    #[must_use]
    pub fn is_cached(&self, offset: ByteOffset) -> bool {
        self.state.lock().entries.contains_key(&offset.0)
    }

    #[must_use]
    pub fn is_dirty(&self, offset: ByteOffset) -> bool {
        self.state
            .lock()
            .entries
            .get(&offset.0)
            .is_some_and(|e| e.dirty)
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().entries.values().filter(|e| e.dirty).count()
    }
}

/// Exclusive handle on one cached buffer.
pub struct Buf<'c> {
    cache: &'c BufferCache,
    offset: u64,
    data: Vec<u8>,
    dirty: bool,
    released: bool,
}

impl std::fmt::Debug for Buf<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buf")
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl<'c> Buf<'c> {
    fn new(cache: &'c BufferCache, offset: u64, data: Vec<u8>, dirty: bool) -> Self {
        Self {
            cache,
            offset,
            data,
            dirty,
            released: false,
        }
    }

    #[must_use]
    pub fn offset(&self) -> ByteOffset {
        ByteOffset(self.offset)
    }

    /// Zero the whole buffer.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Grow (zero-filled) or shrink the buffer.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// Write to the device now, then release the buffer clean.
    ///
    /// On failure the buffer is released dirty so a later flush retries it.
    pub fn write_sync(mut self) -> Result<()> {
        self.released = true;
        let data = std::mem::take(&mut self.data);
        let res = self.cache.dev.write_all_at(self.offset, &data);
        match &res {
            Ok(()) => {
                self.cache.state.lock().stats.device_writes += 1;
                trace!(offset = self.offset, len = data.len(), "buffer_write_sync");
            }
            Err(err) => warn!(offset = self.offset, error = %err, "buffer_write_failed"),
        }
        self.cache.release_entry(self.offset, data, res.is_err());
        res
    }

    /// Mark dirty and release; the write happens on a later flush.
    pub fn write_delayed(mut self) {
        self.released = true;
        let data = std::mem::take(&mut self.data);
        self.cache.state.lock().stats.delayed_writes += 1;
        self.cache.release_entry(self.offset, data, true);
    }

    /// Release without changing the dirty state.
    pub fn release(self) {
        drop(self);
    }

    /// Drop the buffer from the cache, discarding any unwritten contents.
    pub fn invalidate(mut self) {
        self.released = true;
        {
            let mut st = self.cache.state.lock();
            st.stats.invalidations += 1;
        }
        self.cache.discard(self.offset);
    }
}

impl Deref for Buf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let data = std::mem::take(&mut self.data);
            self.cache.release_entry(self.offset, data, self.dirty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemByteDevice;
    use ffs_error::FfsError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn cache_over(dev: &MemByteDevice, capacity: usize) -> BufferCache {
        BufferCache::new(Box::new(dev.clone()), capacity)
    }

    #[test]
    fn read_block_reads_device_once() {
        let dev = MemByteDevice::new(64 * 1024);
        dev.write_all_at(4096, &[9_u8; 4096]).unwrap();
        let cache = cache_over(&dev, 8);

        let buf = cache.read_block(ByteOffset(4096), 4096).unwrap();
        assert!(buf.iter().all(|b| *b == 9));
        buf.release();
        let again = cache.read_block(ByteOffset(4096), 4096).unwrap();
        drop(again);

        let stats = cache.stats();
        assert_eq!(stats.device_reads, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn delayed_write_reaches_device_on_flush() {
        let dev = MemByteDevice::new(64 * 1024);
        let cache = cache_over(&dev, 8);

        let mut buf = cache.get_block(ByteOffset(8192), 1024).unwrap();
        buf.fill(0x5A);
        buf.write_delayed();
        assert!(cache.is_dirty(ByteOffset(8192)));
        assert_eq!(dev.snapshot()[8192], 0);

        assert_eq!(cache.flush_all().unwrap(), 1);
        assert_eq!(dev.snapshot()[8192], 0x5A);
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn write_sync_is_immediate() {
        let dev = MemByteDevice::new(64 * 1024);
        let cache = cache_over(&dev, 8);
        let mut buf = cache.get_block(ByteOffset(0), 512).unwrap();
        buf[0] = 1;
        buf.write_sync().unwrap();
        assert_eq!(dev.snapshot()[0], 1);
        assert!(!cache.is_dirty(ByteOffset(0)));
    }

    #[test]
    fn invalidate_discards_dirty_contents() {
        let dev = MemByteDevice::new(64 * 1024);
        let cache = cache_over(&dev, 8);
        let mut buf = cache.get_block(ByteOffset(4096), 4096).unwrap();
        buf.fill(3);
        buf.write_delayed();
        let buf = cache.get_block(ByteOffset(4096), 4096).unwrap();
        buf.invalidate();
        assert!(!cache.is_cached(ByteOffset(4096)));
        assert_eq!(cache.flush_all().unwrap(), 0);
        assert_eq!(dev.snapshot()[4096], 0);
    }

    #[test]
    fn invalidate_range_truncates_straddling_buffer() {
        let dev = MemByteDevice::new(64 * 1024);
        let cache = cache_over(&dev, 8);
        let mut block = cache.get_block(ByteOffset(4096), 4096).unwrap();
        block.fill(7);
        block.write_delayed();
        let mut frag = cache.get_block(ByteOffset(12_288), 1024).unwrap();
        frag.fill(8);
        frag.write_delayed();

        // Free the last two KiB of the block and the fragment after it.
        assert_eq!(cache.invalidate_range(ByteOffset(6144), 7168), 2);
        assert!(!cache.is_cached(ByteOffset(12_288)));
        let kept = cache.get_block(ByteOffset(4096), 2048).unwrap();
        assert!(kept.iter().all(|b| *b == 7));
        drop(kept);
        cache.flush_all().unwrap();
        let image = dev.snapshot();
        assert_eq!(image[4096 + 2047], 7);
        assert_eq!(image[4096 + 2048], 0);
    }

    #[test]
    fn invalidate_range_marks_held_buffer_stale() {
        let dev = MemByteDevice::new(64 * 1024);
        let cache = cache_over(&dev, 8);
        let mut held = cache.get_block(ByteOffset(2048), 1024).unwrap();
        held.fill(4);
        assert_eq!(cache.invalidate_range(ByteOffset(2048), 1024), 1);
        held.write_delayed();
        assert!(!cache.is_cached(ByteOffset(2048)));
    }

    #[test]
    fn read_after_resize_rereads_device() {
        let dev = MemByteDevice::new(64 * 1024);
        dev.write_all_at(4096, &[1_u8; 4096]).unwrap();
        let cache = cache_over(&dev, 8);
        let mut small = cache.read_block(ByteOffset(4096), 1024).unwrap();
        small.fill(2);
        small.write_delayed();
        let big = cache.read_block(ByteOffset(4096), 4096).unwrap();
        assert_eq!(big[0], 2);
        assert_eq!(big[1024], 1);
        assert_eq!(big.len(), 4096);
    }

    #[test]
    fn clean_buffers_are_evicted_dirty_are_kept() {
        let dev = MemByteDevice::new(64 * 1024);
        let cache = cache_over(&dev, 2);
        let mut dirty = cache.get_block(ByteOffset(0), 1024).unwrap();
        dirty.fill(1);
        dirty.write_delayed();
        for i in 1..6_u64 {
            cache.read_block(ByteOffset(i * 1024), 1024).unwrap().release();
        }
        assert!(cache.is_dirty(ByteOffset(0)));
        assert!(cache.stats().evictions >= 3);
    }

    #[test]
    fn read_error_leaves_no_entry() {
        let dev = MemByteDevice::new(4096);
        let cache = cache_over(&dev, 2);
        let err = cache.read_block(ByteOffset(4096), 1024).unwrap_err();
        assert!(matches!(err, FfsError::InvalidArgument(_)));
        assert!(!cache.is_cached(ByteOffset(4096)));
    }

    #[test]
    fn second_holder_waits_for_release() {
        let dev = MemByteDevice::new(64 * 1024);
        let cache = Arc::new(cache_over(&dev, 8));
        let released = Arc::new(AtomicBool::new(false));

        let mut first = cache.get_block(ByteOffset(0), 1024).unwrap();
        first[0] = 42;

        let waiter = {
            let cache = Arc::clone(&cache);
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                let buf = cache.get_block(ByteOffset(0), 1024).unwrap();
                assert!(released.load(Ordering::SeqCst));
                buf[0]
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        released.store(true, Ordering::SeqCst);
        first.write_delayed();
        assert_eq!(waiter.join().unwrap(), 42);
    }
}
