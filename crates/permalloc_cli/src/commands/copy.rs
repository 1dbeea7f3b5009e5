//! Snapshot and copy commands.

use permalloc_core::{Config, Manager, ManagerKernel};
use std::path::Path;

/// Writes a point-in-time copy of `source` with a fresh identity.
///
/// The source is opened read-only, so it must be closed properly.
pub fn snapshot(source: &Path, destination: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let manager = Manager::open_read_only(source)?;
    manager.snapshot(destination)?;
    manager.close()?;

    println!("✓ Snapshot created");
    println!("  Path: {}", destination.display());
    println!("  UUID: {}", Manager::get_uuid(destination)?);
    Ok(())
}

/// Copies a closed datastore file by file, keeping its identity.
pub fn copy(source: &Path, destination: &Path, threads: usize) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::new().copy_threads(threads);
    ManagerKernel::copy(source, destination, &config)?;

    println!("✓ Datastore copied");
    println!("  Path: {}", destination.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn datastore(path: &Path) {
        let manager = Manager::create_with_config(
            path,
            Config::new().chunk_size(1 << 16).max_segment_size(1 << 24),
        )
        .unwrap();
        manager.construct("v", 5u32).unwrap();
        manager.close().unwrap();
    }

    #[test]
    fn snapshot_gets_new_identity() {
        let tmp = tempdir().unwrap();
        let source = tmp.path().join("ds");
        let destination = tmp.path().join("snap");
        datastore(&source);

        snapshot(&source, &destination).unwrap();
        assert_ne!(
            Manager::get_uuid(&source).unwrap(),
            Manager::get_uuid(&destination).unwrap()
        );
        let snap = Manager::open_read_only(&destination).unwrap();
        assert!(snap.find::<u32>("v").unwrap().is_some());
    }

    #[test]
    fn copy_keeps_identity() {
        let tmp = tempdir().unwrap();
        let source = tmp.path().join("ds");
        let destination = tmp.path().join("copy");
        datastore(&source);

        copy(&source, &destination, 2).unwrap();
        assert_eq!(
            Manager::get_uuid(&source).unwrap(),
            Manager::get_uuid(&destination).unwrap()
        );
        assert!(copy(&source, &destination, 2).is_err());
    }
}
