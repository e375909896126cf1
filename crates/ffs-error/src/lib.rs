#![forbid(unsafe_code)]
//! Error types for the FFS allocation and truncation engine.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ffs-types` | On-disk format violations detected during byte decoding |
//! | Runtime | `FfsError` | `ffs-error` (this crate) | Errors returned by every engine entry point |
//!
//! `ffs-error` does not depend on `ffs-types`. Parse failures are converted at
//! the crate that reads the bytes: mount-time validation produces
//! `FfsError::Format`, live metadata reads produce
//! `FfsError::Corruption { block, .. }` with the fragment address.
//!
//! ## Classes
//!
//! | Class | Variants | Caller action |
//! |-------|----------|---------------|
//! | Exhaustion | `NoSpace`, `NoInodes` | Surface "filesystem full"; partial work is already rolled back |
//! | I/O | `Io` | Propagated unchanged; the engine never retries |
//! | Corruption | `Corruption`, `GroupFenced`, `NeedsCheck` | The filesystem is flagged for checking; the group is refused |
//! | Contract | `InvalidArgument`, `FileTooLarge` | Caller bug or request outside the geometry |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`FfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption`, `GroupFenced`, `NeedsCheck` | `EIO` |
//! | `Format`, `Parse`, `InvalidGeometry`, `InvalidArgument` | `EINVAL` |
//! | `NoSpace`, `NoInodes` | `ENOSPC` |
//! | `FileTooLarge` | `EFBIG` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known fragment address.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format (bad magic, unknown layout).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Geometry is out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Caller violated a precondition (misaligned size, bad offset).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free block or fragment after the full placement search.
    #[error("no space left on device")]
    NoSpace,

    /// No free inode after the full placement search.
    #[error("no free inodes left on device")]
    NoInodes,

    /// Logical block lies beyond triple-indirect reach.
    #[error("file too large")]
    FileTooLarge,

    /// Filesystem is mounted read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The cylinder group was found corrupt earlier; mutations are refused.
    #[error("cylinder group {group} is fenced pending a filesystem check")]
    GroupFenced { group: u32 },

    /// Filesystem carries the needs-check flag and cannot be mounted writable.
    #[error("filesystem needs a consistency check")]
    NeedsCheck,
}

impl FfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// `NoSpace` and `NoInodes` share `ENOSPC`; callers that need to tell
    /// them apart match on the variant.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::GroupFenced { .. } | Self::NeedsCheck => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace | Self::NoInodes => libc::ENOSPC,
            Self::FileTooLarge => libc::EFBIG,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// True for the stable "filesystem full" conditions.
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::NoSpace | Self::NoInodes)
    }

    /// True when the error means on-disk state can no longer be trusted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. } | Self::GroupFenced { .. } | Self::NeedsCheck
        )
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;
