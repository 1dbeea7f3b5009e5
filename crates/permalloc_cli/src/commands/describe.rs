//! Describe command implementation.

use crate::KindArg;
use permalloc_core::{Manager, ManagerKernel, ObjectKind};
use std::path::Path;
use tracing::info;

/// Sets the datastore description, or the description of `object`.
///
/// Object descriptions are written straight into the directory file, so the
/// datastore must be closed properly.
pub fn run(
    path: &Path,
    text: &str,
    object: Option<&str>,
    kind: KindArg,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(name) = object else {
        Manager::set_description_at(path, text)?;
        info!(path = %path.display(), "updated datastore description");
        println!("✓ Description set");
        return Ok(());
    };

    let kind = match kind {
        KindArg::Named => ObjectKind::Named,
        KindArg::Unique => ObjectKind::Unique,
        KindArg::Anonymous | KindArg::All => {
            return Err("objects can be described by name only in the named or unique table".into());
        }
    };

    let mut accessor = ManagerKernel::access_object_attribute_mut(path, kind)?;
    if !accessor.set_description(name, text)? {
        return Err(format!("no {kind} object named '{name}'").into());
    }
    println!("✓ Description of '{name}' set");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use permalloc_core::Config;
    use tempfile::tempdir;

    #[test]
    fn describes_datastore_and_object() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ds");
        let manager = Manager::create_with_config(
            &path,
            Config::new().chunk_size(1 << 16).max_segment_size(1 << 24),
        )
        .unwrap();
        manager.construct("table", [0u32; 8]).unwrap();
        manager.close().unwrap();

        run(&path, "nightly build", None, KindArg::Named).unwrap();
        run(&path, "lookup table", Some("table"), KindArg::Named).unwrap();
        assert!(run(&path, "x", Some("missing"), KindArg::Named).is_err());
        assert!(run(&path, "x", Some("table"), KindArg::All).is_err());

        assert_eq!(
            Manager::get_description_at(&path).unwrap().as_deref(),
            Some("nightly build")
        );
        let named = Manager::access_named_object_attribute(&path).unwrap();
        assert_eq!(named.find("table").unwrap().description, "lookup table");
    }
}
