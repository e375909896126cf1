//! Fragment tables.
//!
//! `fragtbl` maps one byte of the free map to the set of free-run lengths it
//! contains, with runs never crossing a block boundary. A run of length `n`
//! sets bit `n - 1 + frag % 8`, so the tables for 1, 2 and 4 fragments per
//! block use disjoint bits and the 8-fragment table uses all eight.
//! `AROUND`/`INSIDE` are the masks used to pin down an exact run of `n` free
//! fragments bounded by used ones.

use ffs_ondisk::{FragsPerBlock, MAXFRAG};

const fn runs_mask(byte: u8, frag: u32) -> u8 {
    let shift = frag % 8;
    let mut mask = 0_u8;
    let mut blk = 0;
    while blk < 8 / frag {
        let mut run = 0_u32;
        let mut bit = 0;
        while bit < frag {
            if (byte >> (blk * frag + bit)) & 1 == 1 {
                run += 1;
            } else {
                if run > 0 {
                    mask |= 1 << (run - 1 + shift);
                }
                run = 0;
            }
            bit += 1;
        }
        if run > 0 {
            mask |= 1 << (run - 1 + shift);
        }
        blk += 1;
    }
    mask
}

const fn build(frag: u32) -> [u8; 256] {
    let mut table = [0_u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = runs_mask(i as u8, frag);
        i += 1;
    }
    table
}

static FRAGTBL: [[u8; 256]; 4] = [build(1), build(2), build(4), build(8)];

/// `AROUND[n]`: `n` fragment bits plus one bounding bit on each side.
pub const AROUND: [u32; MAXFRAG + 1] = [
    0x3, 0x7, 0xf, 0x1f, 0x3f, 0x7f, 0xff, 0x1ff, 0x3ff,
];

/// `INSIDE[n]`: `n` free bits between two used ones.
pub const INSIDE: [u32; MAXFRAG + 1] = [
    0x0, 0x2, 0x6, 0xe, 0x1e, 0x3e, 0x7e, 0xfe, 0x1fe,
];

#[inline]
fn table(frags: FragsPerBlock) -> &'static [u8; 256] {
    match frags {
        FragsPerBlock::One => &FRAGTBL[0],
        FragsPerBlock::Two => &FRAGTBL[1],
        FragsPerBlock::Four => &FRAGTBL[2],
        FragsPerBlock::Eight => &FRAGTBL[3],
    }
}

/// Free-run lengths present in one map byte.
#[must_use]
pub fn fragtbl(frags: FragsPerBlock, byte: u8) -> u8 {
    table(frags)[usize::from(byte)]
}

/// Bit standing for a free run of `len` fragments in [`fragtbl`] output.
#[must_use]
pub fn run_bit(frags: FragsPerBlock, len: u32) -> u8 {
    debug_assert!(len >= 1 && len <= frags.count());
    1 << (len - 1 + frags.count() % 8)
}

/// Add `cnt` to `frsum[n]` for every maximal free run of `n < frag`
/// fragments in the right-aligned block map `fragmap`.
pub fn fragacct(frags: FragsPerBlock, fragmap: u8, frsum: &mut [i32; MAXFRAG], cnt: i32) {
    let frag = frags.count();
    let mut run = 0_u32;
    for bit in 0..=frag {
        if bit < frag && (fragmap >> bit) & 1 == 1 {
            run += 1;
            continue;
        }
        if run > 0 && run < frag {
            frsum[run as usize] += cnt;
        }
        run = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_fragment_table_spot_checks() {
        let f = FragsPerBlock::Eight;
        assert_eq!(fragtbl(f, 0x00), 0);
        assert_eq!(fragtbl(f, 0xff), 0x80);
        // 0b0110_0111: runs of 3 and 2.
        assert_eq!(fragtbl(f, 0x67), 0b0000_0110);
        assert_eq!(fragtbl(f, 0x01), 0x01);
    }

    #[test]
    fn smaller_tables_do_not_cross_block_boundaries() {
        // Two 4-fragment blocks, 0b0001_1000: one free fragment in each.
        assert_eq!(fragtbl(FragsPerBlock::Four, 0x18), run_bit(FragsPerBlock::Four, 1));
        // Whole free block in the high nibble.
        assert_eq!(fragtbl(FragsPerBlock::Four, 0xf0), run_bit(FragsPerBlock::Four, 4));
        assert_eq!(fragtbl(FragsPerBlock::Two, 0b0000_0110), run_bit(FragsPerBlock::Two, 1));
        assert_eq!(fragtbl(FragsPerBlock::One, 0x80), run_bit(FragsPerBlock::One, 1));
    }

    #[test]
    fn around_inside_pick_exact_runs() {
        // Run of exactly two free fragments at position 1 of a 4-fragment block.
        let blk = 0b0110_u32 << 1;
        assert_eq!(blk & (AROUND[2] << 1), INSIDE[2] << 1);
        assert_ne!(blk & AROUND[2], INSIDE[2]);
    }

    #[test]
    fn fragacct_counts_partial_runs_only() {
        let mut frsum = [0_i32; MAXFRAG];
        fragacct(FragsPerBlock::Eight, 0b1011_0111, &mut frsum, 1);
        assert_eq!(frsum[3], 1);
        assert_eq!(frsum[2], 1);
        assert_eq!(frsum[1], 1);
        fragacct(FragsPerBlock::Eight, 0xff, &mut frsum, 1);
        assert_eq!(frsum.iter().sum::<i32>(), 3);
        fragacct(FragsPerBlock::Eight, 0b1011_0111, &mut frsum, -1);
        assert!(frsum.iter().all(|c| *c == 0));
    }
}
