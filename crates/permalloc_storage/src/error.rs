//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A path that had to be fresh already exists.
    #[error("path already exists: {}", path.display())]
    AlreadyExists {
        /// The offending path.
        path: PathBuf,
    },

    /// A required file or directory is missing.
    #[error("path not found: {}", path.display())]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// On-disk structure does not match what was expected.
    #[error("invalid segment format: {0}")]
    Format(String),

    /// Mapping a chunk file into the reserved region failed.
    #[error("mapping failed: {message}")]
    Mapping {
        /// Description of the failure.
        message: String,
    },

    /// The segment cannot grow any further.
    #[error("segment full: requested {requested} bytes, maximum segment size is {max}")]
    SegmentFull {
        /// Bytes the caller wanted to add.
        requested: u64,
        /// The configured maximum segment size.
        max: u64,
    },

    /// Attempted to access beyond the mapped end of the segment.
    #[error("access beyond end of segment: offset {offset}, len {len}, size {size}")]
    OutOfRange {
        /// The requested offset.
        offset: u64,
        /// The requested length.
        len: u64,
        /// The current mapped size.
        size: u64,
    },

    /// The segment was opened read-only.
    #[error("segment is read-only")]
    ReadOnly,

    /// The segment has been unmapped.
    #[error("segment is closed")]
    Closed,

    /// One or more files of a parallel copy failed.
    #[error("copy failed for {failed} of {total} files")]
    CopyFailed {
        /// Number of files that could not be copied.
        failed: usize,
        /// Number of files attempted.
        total: usize,
    },
}

impl StorageError {
    /// Creates a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    /// Creates a mapping error.
    pub fn mapping(message: impl Into<String>) -> Self {
        Self::Mapping {
            message: message.into(),
        }
    }
}
