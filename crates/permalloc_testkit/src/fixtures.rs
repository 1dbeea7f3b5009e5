//! Test fixtures and datastore helpers.
//!
//! Provides temporary datastores with small chunks so tests exercise
//! segment growth and large objects without touching much disk.

use permalloc_core::{Config, Manager};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Chunk size used by test datastores.
pub const TEST_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum segment size used by test datastores.
pub const TEST_MAX_SEGMENT_SIZE: usize = 256 * 1024 * 1024;

/// A small-chunk configuration for tests.
pub fn test_config() -> Config {
    Config::new()
        .chunk_size(TEST_CHUNK_SIZE)
        .max_segment_size(TEST_MAX_SEGMENT_SIZE)
}

/// A test datastore with automatic cleanup.
pub struct TestDatastore {
    /// The manager instance.
    pub manager: Manager,
    path: PathBuf,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: TempDir,
}

impl TestDatastore {
    /// Creates a datastore with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a datastore with the given configuration.
    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("datastore");
        let manager = Manager::create_with_config(&path, config).expect("Failed to create datastore");
        Self {
            manager,
            path,
            temp_dir,
        }
    }

    /// Returns the datastore path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a fresh path inside the temporary directory, for snapshots
    /// and copies.
    pub fn sibling(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Closes the datastore and opens it again for writing.
    pub fn reopen(&mut self) {
        self.manager.close().expect("Failed to close datastore");
        self.manager = Manager::open(&self.path).expect("Failed to reopen datastore");
    }

    /// Closes the datastore and opens it again read-only.
    pub fn reopen_read_only(&mut self) {
        self.manager.close().expect("Failed to close datastore");
        self.manager =
            Manager::open_read_only(&self.path).expect("Failed to reopen datastore read-only");
    }
}

impl Default for TestDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestDatastore {
    type Target = Manager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

/// Runs a test with a temporary datastore.
///
/// # Example
///
/// ```rust,ignore
/// use permalloc_testkit::with_temp_datastore;
///
/// #[test]
/// fn my_test() {
///     with_temp_datastore(|manager| {
///         manager.construct("x", 1u32).unwrap();
///     });
/// }
/// ```
pub fn with_temp_datastore<F, R>(f: F) -> R
where
    F: FnOnce(&Manager) -> R,
{
    let datastore = TestDatastore::new();
    f(&datastore.manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_keeps_objects() {
        let mut ds = TestDatastore::new();
        ds.construct("x", 9u32).unwrap();
        ds.reopen();
        assert!(ds.find::<u32>("x").unwrap().is_some());

        ds.reopen_read_only();
        assert!(ds.is_read_only());
    }

    #[test]
    fn temp_datastore_closure() {
        let uuid = with_temp_datastore(|manager| manager.uuid());
        assert!(!uuid.is_nil());
    }
}
