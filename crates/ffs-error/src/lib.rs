#![forbid(unsafe_code)]
//! Error types for the FFS soft-updates workspace.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ffs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `FfsError` | `ffs-error` (this crate) | Errors surfaced by the buffer cache, the dependency engine and the harness |
//!
//! ## Fatal errors
//!
//! `FfsError::Invariant` is the fatal class. It is produced when the
//! dependency graph is found in a state it can never legally reach (an item
//! linked twice, a dependency of an unexpected kind on a buffer, a lost
//! inodedep). Once the engine returns it, the engine refuses every further
//! mutation: the ordering guarantees can no longer be trusted.
//!
//! ## errno Mapping
//!
//! Every `FfsError` variant maps to exactly one POSIX errno via
//! [`FfsError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Invariant` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Exists` | `EEXIST` |
//! | `Busy` | `EBUSY` |
//!
//! ## Design Constraints
//!
//! - `ffs-error` MUST NOT depend on `ffs-types` (no cyclic deps).
//! - All string payloads are owned (`String`).

use thiserror::Error;

/// Unified error type for all workspace operations.
#[derive(Debug, Error)]
pub enum FfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The dependency graph violated one of its structural invariants.
    ///
    /// This is fatal: the caller must stop issuing metadata writes.
    #[error("soft dependency invariant violated: {0}")]
    Invariant(String),

    /// Invalid on-disk format or out-of-range request.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the caller.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No free blocks or inodes available.
    #[error("no space left on device")]
    NoSpace,

    /// File, directory, or other named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// rmdir on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// Filename exceeds the 255-byte name length limit.
    #[error("name too long")]
    NameTooLong,

    /// Target already exists.
    #[error("file exists")]
    Exists,

    /// The filesystem stayed busy after repeated flush attempts.
    #[error("device or resource busy")]
    Busy,
}

impl FfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// - `Invariant` → `EIO`: the caller sees a failed I/O; the engine itself
    ///   is wedged and logs the violation.
    /// - `Busy` → `EBUSY`: flushing could not reach a quiescent state.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Invariant(_) => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::Busy => libc::EBUSY,
        }
    }

    /// True for the fatal class of errors.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FfsError, libc::c_int)> = vec![
            (FfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                FfsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (FfsError::Invariant("double insert".into()), libc::EIO),
            (FfsError::Format("test".into()), libc::EINVAL),
            (FfsError::Parse("test".into()), libc::EINVAL),
            (FfsError::InvalidGeometry("frag=3".into()), libc::EINVAL),
            (FfsError::NoSpace, libc::ENOSPC),
            (FfsError::NotFound("test".into()), libc::ENOENT),
            (FfsError::NotDirectory, libc::ENOTDIR),
            (FfsError::IsDirectory, libc::EISDIR),
            (FfsError::NotEmpty, libc::ENOTEMPTY),
            (FfsError::NameTooLong, libc::ENAMETOOLONG),
            (FfsError::Exists, libc::EEXIST),
            (FfsError::Busy, libc::EBUSY),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let ffs = FfsError::Io(raw);
        assert_eq!(ffs.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = FfsError::Corruption {
            block: 42,
            detail: "bad cg magic".into(),
        };
        assert_eq!(err.to_string(), "corrupt metadata at block 42: bad cg magic");

        let inv = FfsError::Invariant("worklist_insert: already on list".into());
        assert_eq!(
            inv.to_string(),
            "soft dependency invariant violated: worklist_insert: already on list"
        );

        assert_eq!(FfsError::Busy.to_string(), "device or resource busy");
    }

    #[test]
    fn only_invariant_is_fatal() {
        assert!(FfsError::Invariant("x".into()).is_fatal());
        assert!(!FfsError::NoSpace.is_fatal());
        assert!(!FfsError::Io(std::io::Error::other("disk")).is_fatal());
    }
}
