//! Info command implementation.

use permalloc_core::{Manager, ObjectKind};
use permalloc_storage::{file, CHUNK_FILE_PREFIX};
use serde::Serialize;
use std::path::Path;

/// Datastore metadata, gathered without mapping the heap.
#[derive(Debug, Serialize)]
pub struct InfoResult {
    /// Datastore path.
    pub path: String,
    /// Datastore identity.
    pub uuid: String,
    /// On-disk format version.
    pub version: u32,
    /// Whether the datastore was closed properly.
    pub consistent: bool,
    /// Free-text description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Number of chunk files.
    pub chunk_files: usize,
    /// Apparent size of all chunk files in bytes.
    pub chunk_bytes: u64,
    /// Registered named objects.
    pub named_objects: usize,
    /// Registered unique objects.
    pub unique_objects: usize,
    /// Registered anonymous objects.
    pub anonymous_objects: usize,
}

/// Gathers the metadata of the datastore at `path`.
pub fn gather(path: &Path) -> Result<InfoResult, Box<dyn std::error::Error>> {
    if !file::directory_exists(path) {
        return Err(format!("No datastore found at {}", path.display()).into());
    }

    let mut chunk_files = 0;
    let mut chunk_bytes = 0;
    for name in file::regular_file_names(path)? {
        if name.starts_with(CHUNK_FILE_PREFIX) {
            chunk_files += 1;
            chunk_bytes += std::fs::metadata(path.join(&name))?.len();
        }
    }

    let count = |kind: ObjectKind| -> Result<usize, Box<dyn std::error::Error>> {
        let accessor = match kind {
            ObjectKind::Named => Manager::access_named_object_attribute(path)?,
            ObjectKind::Unique => Manager::access_unique_object_attribute(path)?,
            ObjectKind::Anonymous => Manager::access_anonymous_object_attribute(path)?,
        };
        Ok(accessor.num_objects())
    };

    Ok(InfoResult {
        path: path.display().to_string(),
        uuid: Manager::get_uuid(path)?.to_string(),
        version: Manager::get_version(path)?,
        consistent: Manager::consistent(path),
        description: Manager::get_description_at(path)?,
        chunk_files,
        chunk_bytes,
        named_objects: count(ObjectKind::Named)?,
        unique_objects: count(ObjectKind::Unique)?,
        anonymous_objects: count(ObjectKind::Anonymous)?,
    })
}

/// Runs the info command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = gather(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => print_text_output(&result),
    }

    Ok(())
}

fn print_text_output(result: &InfoResult) {
    println!("Datastore: {}", result.path);
    println!("  UUID:        {}", result.uuid);
    println!("  Version:     {}", result.version);
    println!(
        "  Consistent:  {}",
        if result.consistent {
            "yes"
        } else {
            "no (open elsewhere or not closed properly)"
        }
    );
    if let Some(description) = &result.description {
        println!("  Description: {description}");
    }
    println!(
        "  Chunks:      {} files, {} bytes",
        result.chunk_files, result.chunk_bytes
    );
    println!(
        "  Objects:     {} named, {} unique, {} anonymous",
        result.named_objects, result.unique_objects, result.anonymous_objects
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use permalloc_core::Config;
    use tempfile::tempdir;

    #[test]
    fn gathers_closed_datastore() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ds");
        let manager = Manager::create_with_config(
            &path,
            Config::new().chunk_size(1 << 16).max_segment_size(1 << 24),
        )
        .unwrap();
        manager.construct("a", 1u64).unwrap();
        manager.set_description("demo").unwrap();
        let uuid = manager.uuid();
        manager.close().unwrap();

        let info = gather(&path).unwrap();
        assert_eq!(info.uuid, uuid.to_string());
        assert!(info.consistent);
        assert_eq!(info.description.as_deref(), Some("demo"));
        assert_eq!(info.named_objects, 1);
        assert_eq!(info.chunk_files, 1);
        assert_eq!(info.chunk_bytes, 1 << 16);
    }

    #[test]
    fn missing_datastore() {
        let tmp = tempdir().unwrap();
        assert!(gather(&tmp.path().join("nope")).is_err());
    }
}
