#![forbid(unsafe_code)]

use ffs_block::{BufferCache, MemByteDevice};
use ffs_types::ByteOffset;
use std::sync::Arc;

const BLOCK: usize = 4096;
const FRAG: usize = 1024;

fn cache_over(dev: &MemByteDevice, capacity: usize) -> BufferCache {
    BufferCache::new(Box::new(dev.clone()), capacity)
}

#[test]
fn delayed_writes_reach_the_device_only_on_flush() {
    let dev = MemByteDevice::new(16 * BLOCK);
    let cache = cache_over(&dev, 8);
    for i in 0..4_u64 {
        let mut buf = cache.get_block(ByteOffset(i * BLOCK as u64), BLOCK).unwrap();
        buf.fill(i as u8 + 1);
        buf.write_delayed();
    }
    assert_eq!(cache.dirty_count(), 4);
    assert!(dev.snapshot().iter().all(|b| *b == 0));

    assert_eq!(cache.flush_all().unwrap(), 4);
    let image = dev.snapshot();
    for i in 0..4_usize {
        assert!(image[i * BLOCK..(i + 1) * BLOCK].iter().all(|b| *b == i as u8 + 1));
    }
    assert_eq!(cache.dirty_count(), 0);
}

#[test]
fn dirty_buffers_outlive_cache_pressure() {
    let dev = MemByteDevice::new(64 * BLOCK);
    let cache = cache_over(&dev, 4);
    let mut first = cache.get_block(ByteOffset(0), BLOCK).unwrap();
    first.fill(0x5A);
    first.write_delayed();
    // Stream clean reads far past capacity.
    for i in 1..64_u64 {
        cache
            .read_block(ByteOffset(i * BLOCK as u64), BLOCK)
            .unwrap()
            .release();
    }
    assert!(cache.is_dirty(ByteOffset(0)));
    cache.flush_all().unwrap();
    assert!(dev.snapshot()[..BLOCK].iter().all(|b| *b == 0x5A));
}

#[test]
fn freed_fragments_are_never_written_back() {
    let dev = MemByteDevice::new(8 * BLOCK);
    let cache = cache_over(&dev, 8);
    let mut tail = cache.get_block(ByteOffset(BLOCK as u64), 3 * FRAG).unwrap();
    tail.fill(0xEE);
    tail.write_delayed();

    // The last fragment of the run is released to a new owner.
    cache.invalidate_range(ByteOffset((BLOCK + 2 * FRAG) as u64), FRAG as u64);
    cache.flush_all().unwrap();
    let image = dev.snapshot();
    assert!(image[BLOCK..BLOCK + 2 * FRAG].iter().all(|b| *b == 0xEE));
    assert!(image[BLOCK + 2 * FRAG..BLOCK + 3 * FRAG].iter().all(|b| *b == 0));
}

#[test]
fn holders_of_one_buffer_take_turns() {
    let dev = MemByteDevice::new(4 * BLOCK);
    let cache = Arc::new(cache_over(&dev, 4));
    std::thread::scope(|s| {
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            s.spawn(move || {
                for _ in 0..250 {
                    let mut buf = cache.read_block(ByteOffset(0), BLOCK).unwrap();
                    let n = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) + 1;
                    buf[..4].copy_from_slice(&n.to_le_bytes());
                    buf.write_delayed();
                }
            });
        }
    });
    cache.flush_all().unwrap();
    let image = dev.snapshot();
    assert_eq!(u32::from_le_bytes([image[0], image[1], image[2], image[3]]), 1000);
}
