//! Bit-level operations on cylinder-group maps.
//!
//! In the fragment map (`blksfree`) a set bit means the fragment is free.
//! A block occupies `frag` consecutive bits starting at `h * frag`; the
//! block-granular helpers below dispatch on the four legal fragment counts
//! instead of looping over bits.

use ffs_ondisk::FragsPerBlock;

/// Byte holding bit `idx` and the bit within it, or `None` past the map.
#[inline]
fn bit(map: &[u8], idx: u32) -> Option<(usize, u8)> {
    let byte = (idx / 8) as usize;
    (byte < map.len()).then(|| (byte, 1_u8 << (idx % 8)))
}

/// Whether fragment (or inode) `idx` is marked in `map`. In the free maps a
/// set bit means free. Bits past the end read as clear.
#[must_use]
pub fn bitmap_get(map: &[u8], idx: u32) -> bool {
    bit(map, idx).is_some_and(|(byte, mask)| map[byte] & mask != 0)
}

pub fn bitmap_set(map: &mut [u8], idx: u32) {
    if let Some((byte, mask)) = bit(map, idx) {
        map[byte] |= mask;
    }
}

pub fn bitmap_clear(map: &mut [u8], idx: u32) {
    if let Some((byte, mask)) = bit(map, idx) {
        map[byte] &= !mask;
    }
}

/// Count set bits among the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_set(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut set: u32 = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| byte.count_ones())
        .sum();
    if remainder > 0 && full_bytes < bitmap.len() {
        let mask = (1_u8 << remainder) - 1;
        set += (bitmap[full_bytes] & mask).count_ones();
    }
    set
}

/// Byte index and mask covering block `h`.
#[inline]
fn block_mask(frags: FragsPerBlock, h: u32) -> (usize, u8) {
    match frags {
        FragsPerBlock::Eight => (h as usize, 0xff),
        FragsPerBlock::Four => ((h >> 1) as usize, 0x0f << ((h & 0x1) << 2)),
        FragsPerBlock::Two => ((h >> 2) as usize, 0x03 << ((h & 0x3) << 1)),
        FragsPerBlock::One => ((h >> 3) as usize, 0x01 << (h & 0x7)),
    }
}

/// Every fragment of block `h` is free.
#[must_use]
pub fn is_block_free(map: &[u8], frags: FragsPerBlock, h: u32) -> bool {
    let (idx, mask) = block_mask(frags, h);
    map.get(idx).is_some_and(|b| b & mask == mask)
}

/// Every fragment of block `h` is in use.
#[must_use]
pub fn is_block_allocated(map: &[u8], frags: FragsPerBlock, h: u32) -> bool {
    let (idx, mask) = block_mask(frags, h);
    map.get(idx).is_some_and(|b| b & mask == 0)
}

/// Mark every fragment of block `h` free.
pub fn set_block(map: &mut [u8], frags: FragsPerBlock, h: u32) {
    let (idx, mask) = block_mask(frags, h);
    if let Some(b) = map.get_mut(idx) {
        *b |= mask;
    }
}

/// Mark every fragment of block `h` in use.
pub fn clear_block(map: &mut [u8], frags: FragsPerBlock, h: u32) {
    let (idx, mask) = block_mask(frags, h);
    if let Some(b) = map.get_mut(idx) {
        *b &= !mask;
    }
}

/// The `frag` free bits of the block starting at fragment `fragno`,
/// right-aligned.
#[must_use]
pub fn blkmap(map: &[u8], frags: FragsPerBlock, fragno: u32) -> u8 {
    let frag = frags.count();
    let byte = map.get((fragno / 8) as usize).copied().unwrap_or(0);
    let mask = 0xff_u8 >> (8 - frag);
    (byte >> (fragno % 8)) & mask
}
