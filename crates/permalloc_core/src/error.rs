//! Error types for permalloc core.

use permalloc_storage::StorageError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors that can occur in manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Segment storage error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// On-disk structure is malformed or from an incompatible version.
    #[error("invalid datastore format: {message}")]
    Format {
        /// Description of the format issue.
        message: String,
    },

    /// The datastore was not closed properly, or is open elsewhere.
    #[error("datastore is inconsistent (not closed properly or already open): {}", path.display())]
    Inconsistent {
        /// The datastore path.
        path: PathBuf,
    },

    /// Attempted to create a datastore over an existing path.
    #[error("datastore already exists: {}", path.display())]
    AlreadyExists {
        /// The existing path.
        path: PathBuf,
    },

    /// An object with this key is already registered.
    #[error("duplicate key: {key}")]
    DuplicateKey {
        /// The conflicting key.
        key: String,
    },

    /// A datastore or object does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked for.
        what: String,
    },

    /// Invalid argument (zero size, bad alignment, ...).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// The segment cannot grow to satisfy the request.
    #[error("out of memory: cannot allocate {requested} bytes")]
    OutOfMemory {
        /// Requested size in bytes.
        requested: u64,
    },

    /// Deallocation of an offset that is not a live allocation.
    #[error("invalid free at offset {offset}: {reason}")]
    InvalidFree {
        /// The offset passed to deallocate.
        offset: u64,
        /// Why it was rejected.
        reason: String,
    },

    /// Mutating operation on a read-only datastore.
    #[error("datastore is open read-only")]
    ReadOnly,

    /// The manager has been closed.
    #[error("datastore is closed")]
    Closed,
}

impl From<StorageError> for ManagerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => Self::Io(e),
            StorageError::Format(message) => Self::Format { message },
            StorageError::SegmentFull { requested, .. } => Self::OutOfMemory { requested },
            StorageError::AlreadyExists { path } => Self::AlreadyExists { path },
            StorageError::NotFound { path } => Self::NotFound {
                what: path.display().to_string(),
            },
            StorageError::ReadOnly => Self::ReadOnly,
            StorageError::Closed => Self::Closed,
            other => Self::Storage(other),
        }
    }
}

impl ManagerError {
    /// Creates a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid free error.
    pub fn invalid_free(offset: u64, reason: impl Into<String>) -> Self {
        Self::InvalidFree {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a duplicate key error.
    pub fn duplicate_key(key: impl Into<String>) -> Self {
        Self::DuplicateKey { key: key.into() }
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates an inconsistent datastore error.
    pub fn inconsistent(path: impl Into<PathBuf>) -> Self {
        Self::Inconsistent { path: path.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_full_maps_to_out_of_memory() {
        let err: ManagerError = StorageError::SegmentFull {
            requested: 10,
            max: 5,
        }
        .into();
        assert!(matches!(err, ManagerError::OutOfMemory { requested: 10 }));
    }

    #[test]
    fn storage_format_maps_to_format() {
        let err: ManagerError = StorageError::format("bad chunk").into();
        assert!(matches!(err, ManagerError::Format { .. }));
        assert!(err.to_string().contains("bad chunk"));
    }

    #[test]
    fn missing_path_maps_to_not_found() {
        let err: ManagerError = StorageError::NotFound {
            path: PathBuf::from("/gone/chunk_0003"),
        }
        .into();
        assert!(matches!(err, ManagerError::NotFound { ref what } if what.contains("chunk_0003")));
    }

    #[test]
    fn other_storage_errors_are_wrapped() {
        let err: ManagerError = StorageError::mapping("nope").into();
        assert!(matches!(err, ManagerError::Storage(_)));
    }
}
