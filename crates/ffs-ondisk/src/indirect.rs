//! Indirect blocks: flat little-endian arrays of fragment addresses.

use ffs_types::{
    DiskAddr, ParseError, read_le_u32, read_le_u64, u64_to_u32, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

/// On-disk width of one block address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrWidth {
    U32,
    U64,
}

impl AddrWidth {
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }

    #[must_use]
    pub fn bytes_u32(self) -> u32 {
        match self {
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

/// Read entry `index` of an address array.
pub fn read_addr(block: &[u8], index: usize, width: AddrWidth) -> Result<DiskAddr, ParseError> {
    let offset = index
        .checked_mul(width.bytes())
        .ok_or(ParseError::IntegerConversion { field: "addr_index" })?;
    match width {
        AddrWidth::U32 => read_le_u32(block, offset).map(|v| DiskAddr(u64::from(v))),
        AddrWidth::U64 => read_le_u64(block, offset).map(DiskAddr),
    }
}

/// Store `addr` at entry `index`. 32-bit arrays reject addresses above `u32::MAX`.
pub fn write_addr(
    block: &mut [u8],
    index: usize,
    width: AddrWidth,
    addr: DiskAddr,
) -> Result<(), ParseError> {
    let offset = index
        .checked_mul(width.bytes())
        .ok_or(ParseError::IntegerConversion { field: "addr_index" })?;
    match width {
        AddrWidth::U32 => write_le_u32(block, offset, u64_to_u32(addr.0, "block_addr")?),
        AddrWidth::U64 => write_le_u64(block, offset, addr.0),
    }
}

/// Decode every entry of an indirect block.
pub fn decode_addrs(block: &[u8], width: AddrWidth) -> Result<Vec<DiskAddr>, ParseError> {
    (0..block.len() / width.bytes())
        .map(|i| read_addr(block, i, width))
        .collect()
}

/// Zero entries `from..` of an indirect block.
pub fn clear_from(block: &mut [u8], from: usize, width: AddrWidth) {
    let start = from.saturating_mul(width.bytes()).min(block.len());
    block[start..].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_32_bit() {
        let mut block = vec![0_u8; 4096];
        write_addr(&mut block, 0, AddrWidth::U32, DiskAddr(0x1234_5678)).unwrap();
        write_addr(&mut block, 1023, AddrWidth::U32, DiskAddr(9)).unwrap();
        assert_eq!(&block[..4], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(read_addr(&block, 1023, AddrWidth::U32).unwrap(), DiskAddr(9));
        assert!(read_addr(&block, 1024, AddrWidth::U32).is_err());
    }

    #[test]
    fn thirty_two_bit_rejects_wide_address() {
        let mut block = vec![0_u8; 4096];
        assert!(matches!(
            write_addr(&mut block, 0, AddrWidth::U32, DiskAddr(1 << 40)),
            Err(ParseError::IntegerConversion { .. })
        ));
        write_addr(&mut block, 0, AddrWidth::U64, DiskAddr(1 << 40)).unwrap();
        assert_eq!(read_addr(&block, 0, AddrWidth::U64).unwrap(), DiskAddr(1 << 40));
    }

    #[test]
    fn clear_from_zeroes_tail_only() {
        let mut block = vec![0xAA_u8; 64];
        clear_from(&mut block, 3, AddrWidth::U64);
        assert!(block[..24].iter().all(|b| *b == 0xAA));
        assert!(block[24..].iter().all(|b| *b == 0));
        let addrs = decode_addrs(&block, AddrWidth::U64).unwrap();
        assert_eq!(addrs.len(), 8);
        assert!(addrs[3..].iter().all(|a| a.is_hole()));
    }
}
