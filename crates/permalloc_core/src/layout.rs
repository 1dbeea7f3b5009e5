//! Datastore directory layout.
//!
//! ```text
//! <datastore>/
//! ├─ chunk_0000 ...     # segment chunk files
//! ├─ heap               # allocator metadata (chunk table, free lists)
//! ├─ directory          # named / unique / anonymous object tables
//! ├─ description        # optional free text
//! ├─ properly_closed    # consistency marker
//! ├─ uuid               # datastore identity
//! └─ version            # on-disk format version
//! ```
//!
//! The consistency marker is advisory. Its presence means the last writer
//! closed cleanly and no writer currently holds the datastore. It is not an
//! OS lock, and on networked filesystems with metadata caching two
//! processes may both observe it before either removes it.

use crate::error::{ManagerError, ManagerResult};
use crate::FORMAT_VERSION;
use permalloc_storage::file;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const HEAP_FILE: &str = "heap";
const DIRECTORY_FILE: &str = "directory";
const DESCRIPTION_FILE: &str = "description";
const MARKER_FILE: &str = "properly_closed";
const UUID_FILE: &str = "uuid";
const VERSION_FILE: &str = "version";

const MARKER_CONTENT: &[u8] = b"permalloc datastore closed properly\n";

/// Paths of the files that make up one datastore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreLayout {
    root: PathBuf,
}

impl DatastoreLayout {
    /// Creates the layout for the datastore rooted at `root`.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Returns the datastore directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path to the heap metadata file.
    #[must_use]
    pub fn heap_path(&self) -> PathBuf {
        self.root.join(HEAP_FILE)
    }

    /// Returns the path to the object directory file.
    #[must_use]
    pub fn directory_path(&self) -> PathBuf {
        self.root.join(DIRECTORY_FILE)
    }

    /// Returns the path to the description file.
    #[must_use]
    pub fn description_path(&self) -> PathBuf {
        self.root.join(DESCRIPTION_FILE)
    }

    /// Returns the path to the consistency marker.
    #[must_use]
    pub fn marker_path(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    /// Returns the path to the uuid file.
    #[must_use]
    pub fn uuid_path(&self) -> PathBuf {
        self.root.join(UUID_FILE)
    }

    /// Returns the path to the version file.
    #[must_use]
    pub fn version_path(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    /// Returns true if the consistency marker is present.
    #[must_use]
    pub fn is_marked_consistent(&self) -> bool {
        file::file_exists(&self.marker_path())
    }

    /// Writes the consistency marker.
    pub fn mark_consistent(&self) -> ManagerResult<()> {
        file::write_file_atomic(&self.marker_path(), MARKER_CONTENT)?;
        Ok(())
    }

    /// Removes the consistency marker, if present.
    pub fn clear_consistent(&self) -> ManagerResult<()> {
        file::remove_path(&self.marker_path())?;
        Ok(())
    }

    /// Writes a freshly generated identity.
    pub fn write_uuid(&self, uuid: Uuid) -> ManagerResult<()> {
        file::write_file_atomic(&self.uuid_path(), uuid.hyphenated().to_string().as_bytes())?;
        Ok(())
    }

    /// Reads the datastore identity.
    pub fn read_uuid(&self) -> ManagerResult<Uuid> {
        let raw = file::read_file(&self.uuid_path())?;
        let text = String::from_utf8_lossy(&raw);
        Uuid::parse_str(text.trim())
            .map_err(|e| ManagerError::format(format!("invalid uuid file: {e}")))
    }

    /// Writes the current format version.
    pub fn write_version(&self) -> ManagerResult<()> {
        file::write_file_atomic(&self.version_path(), format!("{FORMAT_VERSION}\n").as_bytes())?;
        Ok(())
    }

    /// Reads the format version recorded in the datastore.
    pub fn read_version(&self) -> ManagerResult<u32> {
        let raw = file::read_file(&self.version_path())?;
        String::from_utf8_lossy(&raw)
            .trim()
            .parse()
            .map_err(|e| ManagerError::format(format!("invalid version file: {e}")))
    }

    /// Fails unless the recorded version matches [`FORMAT_VERSION`].
    pub fn check_version(&self) -> ManagerResult<()> {
        let version = self.read_version()?;
        if version != FORMAT_VERSION {
            return Err(ManagerError::format(format!(
                "unsupported format version {version}, expected {FORMAT_VERSION}"
            )));
        }
        Ok(())
    }

    /// Replaces the datastore description.
    pub fn write_description(&self, text: &str) -> ManagerResult<()> {
        file::write_file_atomic(&self.description_path(), text.as_bytes())?;
        Ok(())
    }

    /// Reads the datastore description, if one was set.
    pub fn read_description(&self) -> ManagerResult<Option<String>> {
        let path = self.description_path();
        if !file::file_exists(&path) {
            return Ok(None);
        }
        let raw = file::read_file(&path)?;
        String::from_utf8(raw)
            .map(Some)
            .map_err(|_| ManagerError::format("description is not valid UTF-8"))
    }
}
