//! Ls command implementation.

use crate::KindArg;
use permalloc_core::{Manager, ObjectAttributeAccessor, ObjectKind};
use serde::Serialize;
use std::path::Path;

/// One listed object.
#[derive(Debug, Serialize)]
pub struct ObjectListing {
    /// Table the object lives in.
    pub kind: &'static str,
    /// Key; empty for anonymous objects.
    pub name: String,
    /// Segment offset.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
    /// Description, if any.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Collects the objects of the selected tables, reading only the directory file.
pub fn list(path: &Path, kind: KindArg) -> Result<Vec<ObjectListing>, Box<dyn std::error::Error>> {
    let mut listings = Vec::new();
    for &kind in kind.kinds() {
        let accessor = accessor(path, kind)?;
        listings.extend(accessor.iter().map(|entry| ObjectListing {
            kind: entry.kind.as_str(),
            name: entry.name.clone(),
            offset: entry.offset,
            length: entry.length,
            description: entry.description.clone(),
        }));
    }
    Ok(listings)
}

fn accessor(path: &Path, kind: ObjectKind) -> Result<ObjectAttributeAccessor, Box<dyn std::error::Error>> {
    let accessor = match kind {
        ObjectKind::Named => Manager::access_named_object_attribute(path)?,
        ObjectKind::Unique => Manager::access_unique_object_attribute(path)?,
        ObjectKind::Anonymous => Manager::access_anonymous_object_attribute(path)?,
    };
    Ok(accessor)
}

/// Runs the ls command.
pub fn run(path: &Path, kind: KindArg, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listings = list(path, kind)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&listings)?);
        }
        _ => {
            if listings.is_empty() {
                println!("(no objects)");
            }
            for item in &listings {
                let name = if item.name.is_empty() { "-" } else { item.name.as_str() };
                print!(
                    "{:<10} {:<32} +0x{:012x} {:>12}",
                    item.kind, name, item.offset, item.length
                );
                if item.description.is_empty() {
                    println!();
                } else {
                    println!("  # {}", item.description);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use permalloc_core::Config;
    use tempfile::tempdir;

    #[test]
    fn lists_all_tables_in_order() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ds");
        let manager = Manager::create_with_config(
            &path,
            Config::new().chunk_size(1 << 16).max_segment_size(1 << 24),
        )
        .unwrap();
        manager.construct("first", 1u32).unwrap();
        manager.construct("second", [0u8; 40]).unwrap();
        manager.construct_unique(2u64).unwrap();
        manager.construct_anonymous(3u16).unwrap();
        manager.close().unwrap();

        let all = list(&path, KindArg::All).unwrap();
        let kinds: Vec<_> = all.iter().map(|l| l.kind).collect();
        assert_eq!(kinds, ["named", "named", "unique", "anonymous"]);
        assert_eq!(all[1].name, "second");
        assert_eq!(all[1].length, 40);

        let named = list(&path, KindArg::Named).unwrap();
        assert_eq!(named.len(), 2);
    }
}
