//! Remove command implementation.

use permalloc_core::Manager;
use std::path::Path;
use tracing::warn;

/// Deletes the datastore at `path`. Refuses unless `confirmed`.
pub fn run(path: &Path, confirmed: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !confirmed {
        return Err(format!("refusing to remove {} without --yes", path.display()).into());
    }
    if !Manager::consistent(path) {
        warn!(path = %path.display(), "removing a datastore that was not closed properly");
    }
    if !Manager::remove(path)? {
        return Err(format!("No datastore found at {}", path.display()).into());
    }
    println!("✓ Removed {}", path.display());
    Ok(())
}
