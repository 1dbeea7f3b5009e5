//! Object attribute access without opening the datastore.
//!
//! An [`ObjectAttributeAccessor`] loads one table of the directory file and
//! never maps the heap, so it works on closed datastores. Writable accessors
//! rewrite the directory file on every change and require the datastore to
//! be closed properly; a manager holding the datastore open would overwrite
//! the changes when it closes.

use crate::directory::{Directory, DirectoryEntry};
use crate::error::{ManagerError, ManagerResult};
use crate::layout::DatastoreLayout;
use crate::types::ObjectKind;
use permalloc_storage::file;
use tracing::debug;

/// Read or annotate the objects of one kind in a closed datastore.
#[derive(Debug)]
pub struct ObjectAttributeAccessor {
    layout: DatastoreLayout,
    kind: ObjectKind,
    directory: Directory,
    writable: bool,
}

impl ObjectAttributeAccessor {
    /// Loads the `kind` table of the datastore at `layout`.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::NotFound`] if the datastore does not exist
    /// - [`ManagerError::Inconsistent`] if `writable` and the datastore was
    ///   not closed properly
    /// - [`ManagerError::Format`] if the directory file is corrupt
    pub fn open(layout: DatastoreLayout, kind: ObjectKind, writable: bool) -> ManagerResult<Self> {
        if !file::directory_exists(layout.root()) {
            return Err(ManagerError::not_found(layout.root().display().to_string()));
        }
        if writable && !layout.is_marked_consistent() {
            return Err(ManagerError::inconsistent(layout.root()));
        }
        let directory = Directory::deserialize(&layout.directory_path())?;
        Ok(Self {
            layout,
            kind,
            directory,
            writable,
        })
    }

    /// Returns the kind of objects this accessor covers.
    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Returns the number of objects.
    #[must_use]
    pub fn num_objects(&self) -> usize {
        self.directory.table(self.kind).len()
    }

    /// Returns 1 if an object named `name` exists, else 0.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        usize::from(self.find(name).is_some())
    }

    /// Looks up an object by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&DirectoryEntry> {
        self.directory.table(self.kind).find(name)
    }

    /// Looks up an object by offset.
    #[must_use]
    pub fn find_by_offset(&self, offset: u64) -> Option<&DirectoryEntry> {
        self.directory.table(self.kind).find_by_offset(offset)
    }

    /// Iterates the objects in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.directory.table(self.kind).iter()
    }

    /// Sets the description of the object named `name` and persists it.
    ///
    /// Returns false if no such object exists.
    pub fn set_description(&mut self, name: &str, description: &str) -> ManagerResult<bool> {
        self.ensure_writable()?;
        if !self
            .directory
            .table_mut(self.kind)
            .set_description(name, description)
        {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Sets the description of the object at `offset` and persists it.
    pub fn set_description_by_offset(&mut self, offset: u64, description: &str) -> ManagerResult<bool> {
        self.ensure_writable()?;
        if !self
            .directory
            .table_mut(self.kind)
            .set_description_by_offset(offset, description)
        {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    fn ensure_writable(&self) -> ManagerResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(ManagerError::ReadOnly)
        }
    }

    fn persist(&self) -> ManagerResult<()> {
        self.directory.serialize(&self.layout.directory_path())?;
        debug!(path = %self.layout.root().display(), kind = %self.kind, "updated object attributes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn datastore(consistent: bool) -> (tempfile::TempDir, DatastoreLayout) {
        let tmp = tempdir().unwrap();
        let layout = DatastoreLayout::new(tmp.path());
        let mut dir = Directory::new();
        dir.insert(ObjectKind::Named, "a", 16, 4).unwrap();
        dir.insert(ObjectKind::Named, "b", 32, 4).unwrap();
        dir.insert(ObjectKind::Anonymous, "", 64, 8).unwrap();
        dir.serialize(&layout.directory_path()).unwrap();
        if consistent {
            layout.mark_consistent().unwrap();
        }
        (tmp, layout)
    }

    #[test]
    fn read_only_access() {
        let (_tmp, layout) = datastore(false);
        let mut accessor =
            ObjectAttributeAccessor::open(layout, ObjectKind::Named, false).unwrap();

        assert_eq!(accessor.num_objects(), 2);
        assert_eq!(accessor.count("a"), 1);
        assert_eq!(accessor.count("zzz"), 0);
        assert_eq!(accessor.find("b").map(|e| e.offset), Some(32));
        assert!(matches!(
            accessor.set_description("a", "x"),
            Err(ManagerError::ReadOnly)
        ));
    }

    #[test]
    fn descriptions_persist() {
        let (_tmp, layout) = datastore(true);
        let mut accessor =
            ObjectAttributeAccessor::open(layout.clone(), ObjectKind::Named, true).unwrap();
        assert!(accessor.set_description("a", "the first").unwrap());
        assert!(!accessor.set_description("missing", "x").unwrap());

        let mut anonymous =
            ObjectAttributeAccessor::open(layout.clone(), ObjectKind::Anonymous, true).unwrap();
        assert!(anonymous.set_description_by_offset(64, "scratch").unwrap());

        let reloaded = Directory::deserialize(&layout.directory_path()).unwrap();
        assert_eq!(
            reloaded.table(ObjectKind::Named).find("a").unwrap().description,
            "the first"
        );
        assert_eq!(reloaded.find_by_offset(64).unwrap().description, "scratch");
    }

    #[test]
    fn writable_access_requires_clean_close() {
        let (_tmp, layout) = datastore(false);
        assert!(matches!(
            ObjectAttributeAccessor::open(layout, ObjectKind::Named, true),
            Err(ManagerError::Inconsistent { .. })
        ));
    }

    #[test]
    fn missing_datastore() {
        let tmp = tempdir().unwrap();
        let layout = DatastoreLayout::new(&tmp.path().join("nope"));
        assert!(matches!(
            ObjectAttributeAccessor::open(layout, ObjectKind::Unique, false),
            Err(ManagerError::NotFound { .. })
        ));
    }
}
