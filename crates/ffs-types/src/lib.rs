#![forbid(unsafe_code)]
//! Shared newtypes and byte helpers for the FFS engine.
//!
//! Every address that crosses a crate boundary carries its unit in the type:
//! a [`DiskAddr`] counts fragments from the start of the device, a
//! [`ByteOffset`] counts bytes, and logical block numbers stay plain `i64`
//! because negative values name indirect blocks themselves.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Physical fragment address on the device.
///
/// `DiskAddr(0)` doubles as the "hole" sentinel in block maps: fragment zero
/// lives in the boot area and is never handed out by the allocator.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DiskAddr(pub u64);

impl DiskAddr {
    pub const HOLE: Self = Self(0);

    #[must_use]
    pub fn is_hole(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn checked_add(self, frags: u64) -> Option<Self> {
        self.0.checked_add(frags).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    /// Root directory inode. Inodes 0 and 1 are reserved.
    pub const ROOT: Self = Self(2);
}

/// Byte offset on a byte device (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for DiskAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

fn range_end(data_len: usize, offset: usize, len: usize) -> Result<usize, ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data_len {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data_len.saturating_sub(offset),
        });
    }
    Ok(end)
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = range_end(data.len(), offset, len)?;
    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let end = range_end(data.len(), offset, len)?;
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i16(data: &[u8], offset: usize) -> Result<i16, ParseError> {
    read_le_u16(data, offset).map(|v| i16::from_le_bytes(v.to_le_bytes()))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    read_le_u32(data, offset).map(|v| i32::from_le_bytes(v.to_le_bytes()))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| i64::from_le_bytes(v.to_le_bytes()))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i16(data: &mut [u8], offset: usize, value: i16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i32(data: &mut [u8], offset: usize, value: i32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i64(data: &mut [u8], offset: usize, value: i64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34, 0x12, 0x78, 0x56, 0xBC, 0x9A, 0xF0, 0xDE];
        assert_eq!(read_le_u16(&bytes, 0).unwrap(), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).unwrap(), 0x5678_1234);
        assert_eq!(read_le_u64(&bytes, 0).unwrap(), 0xDEF0_9ABC_5678_1234);
        assert!(read_le_u32(&bytes, 6).is_err());
    }

    #[test]
    fn test_write_helpers_are_little_endian() {
        let mut buf = [0_u8; 16];
        write_le_u32(&mut buf, 0, 0x0102_0304).unwrap();
        assert_eq!(&buf[..4], &[4, 3, 2, 1]);
        write_le_i32(&mut buf, 4, -2).unwrap();
        assert_eq!(read_le_i32(&buf, 4).unwrap(), -2);
        write_le_i64(&mut buf, 8, i64::MIN).unwrap();
        assert_eq!(read_le_i64(&buf, 8).unwrap(), i64::MIN);
        write_le_i16(&mut buf, 0, -300).unwrap();
        assert_eq!(read_le_i16(&buf, 0).unwrap(), -300);
    }

    #[test]
    fn test_write_out_of_bounds_is_error() {
        let mut buf = [0_u8; 4];
        assert!(matches!(
            write_le_u64(&mut buf, 0, 1),
            Err(ParseError::InsufficientData { needed: 8, .. })
        ));
        assert!(matches!(
            write_le_u16(&mut buf, usize::MAX, 1),
            Err(ParseError::InvalidField { field: "offset", .. })
        ));
    }

    #[test]
    fn test_disk_addr_hole() {
        assert!(DiskAddr::HOLE.is_hole());
        assert!(!DiskAddr(8).is_hole());
        assert_eq!(DiskAddr(8).checked_add(8), Some(DiskAddr(16)));
        assert_eq!(DiskAddr(u64::MAX).checked_add(1), None);
    }

    #[test]
    fn test_integer_conversions() {
        assert_eq!(u64_to_u32(7, "x").unwrap(), 7);
        assert_eq!(
            u64_to_u32(u64::from(u32::MAX) + 1, "x"),
            Err(ParseError::IntegerConversion { field: "x" })
        );
    }

    #[test]
    fn display_newtypes() {
        assert_eq!(DiskAddr(42).to_string(), "42");
        assert_eq!(InodeNumber::ROOT.to_string(), "2");
        assert_eq!(ByteOffset(65536).to_string(), "65536");
    }
}
