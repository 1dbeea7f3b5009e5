//! Datastore configuration.

use crate::error::{ManagerError, ManagerResult};

/// Smallest supported chunk size (64 KiB).
pub const MIN_CHUNK_SIZE: usize = 64 * 1024;

/// Default chunk size (2 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Default maximum segment size (256 GiB).
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 256 * 1024 * 1024 * 1024;

/// Configuration for creating or opening a datastore.
///
/// `chunk_size` and `max_segment_size` only apply when creating; an existing
/// datastore keeps the geometry it was created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Size of each chunk file. Power of two, at least [`MIN_CHUNK_SIZE`].
    pub chunk_size: usize,

    /// Upper bound on the segment size. This much address space is reserved.
    pub max_segment_size: usize,

    /// Allocate disk blocks for new chunk files instead of leaving them sparse.
    pub zero_fill_new_chunks: bool,

    /// Release disk space behind freed large objects.
    pub free_file_space: bool,

    /// Try reflink clones for snapshots before falling back to sparse copies.
    pub snapshot_clone: bool,

    /// Worker cap for parallel file copies (0 = available parallelism).
    pub copy_threads: usize,

    /// Allow read-only opens of datastores that were not closed properly.
    ///
    /// The view is the last flushed directory over the current chunk files.
    /// Small objects destroyed after that flush are hidden. A destroyed large
    /// object, or a small block that was freed and handed out again, cannot
    /// be recognized and reads back whatever the crashed writer left there.
    pub relaxed_read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            zero_fill_new_chunks: false,
            free_file_space: true,
            snapshot_clone: true,
            copy_threads: 0,
            relaxed_read_only: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the chunk size.
    #[must_use]
    pub const fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Sets the maximum segment size.
    #[must_use]
    pub const fn max_segment_size(mut self, size: usize) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Sets whether new chunk files are zero-filled.
    #[must_use]
    pub const fn zero_fill_new_chunks(mut self, value: bool) -> Self {
        self.zero_fill_new_chunks = value;
        self
    }

    /// Sets whether freed large objects release their disk space.
    #[must_use]
    pub const fn free_file_space(mut self, value: bool) -> Self {
        self.free_file_space = value;
        self
    }

    /// Sets whether snapshots try reflink clones first.
    #[must_use]
    pub const fn snapshot_clone(mut self, value: bool) -> Self {
        self.snapshot_clone = value;
        self
    }

    /// Sets the worker cap for parallel copies.
    #[must_use]
    pub const fn copy_threads(mut self, threads: usize) -> Self {
        self.copy_threads = threads;
        self
    }

    /// Sets whether read-only opens skip the consistency check.
    #[must_use]
    pub const fn relaxed_read_only(mut self, value: bool) -> Self {
        self.relaxed_read_only = value;
        self
    }

    /// Checks the segment geometry.
    pub fn validate(&self) -> ManagerResult<()> {
        if !self.chunk_size.is_power_of_two() || self.chunk_size < MIN_CHUNK_SIZE {
            return Err(ManagerError::invalid_argument(format!(
                "chunk size {} must be a power of two of at least {MIN_CHUNK_SIZE}",
                self.chunk_size
            )));
        }
        if self.max_segment_size < self.chunk_size || self.max_segment_size % self.chunk_size != 0 {
            return Err(ManagerError::invalid_argument(format!(
                "maximum segment size {} must be a non-zero multiple of the chunk size",
                self.max_segment_size
            )));
        }
        if self.max_segment_size / self.chunk_size > u32::MAX as usize {
            return Err(ManagerError::invalid_argument(
                "maximum segment size spans too many chunks",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 2 * 1024 * 1024);
        assert!(config.free_file_space);
        assert!(!config.relaxed_read_only);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .chunk_size(1 << 16)
            .max_segment_size(1 << 24)
            .relaxed_read_only(true)
            .copy_threads(2);

        assert_eq!(config.chunk_size, 1 << 16);
        assert_eq!(config.max_segment_size, 1 << 24);
        assert!(config.relaxed_read_only);
        assert_eq!(config.copy_threads, 2);
    }

    #[test]
    fn invalid_geometry() {
        assert!(Config::new().chunk_size(3 << 16).validate().is_err());
        assert!(Config::new().chunk_size(4096).validate().is_err());
        assert!(Config::new()
            .chunk_size(1 << 16)
            .max_segment_size((1 << 16) + 1)
            .validate()
            .is_err());
    }
}
