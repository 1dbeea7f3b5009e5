//! Check command implementation.

use permalloc_core::{HeapReport, Manager};
use serde::Serialize;
use std::path::Path;

/// Heap walk summary.
#[derive(Debug, Serialize)]
pub struct CheckResult {
    /// Datastore path.
    pub path: String,
    /// Mapped segment size in bytes.
    pub segment_bytes: u64,
    /// Chunks in the segment.
    pub chunks: u64,
    /// Chunks owned by nothing.
    pub unused_chunks: u64,
    /// Chunks owned by small bins.
    pub small_chunks: u64,
    /// Live small blocks.
    pub small_blocks: u64,
    /// Live large objects.
    pub large_objects: u64,
    /// Bytes handed out.
    pub allocated_bytes: u64,
    /// Blocks on free lists.
    pub free_blocks: u64,
    /// Bytes on free lists.
    pub free_bytes: u64,
    /// Small-chunk bytes not yet carved.
    pub uncarved_bytes: u64,
}

impl CheckResult {
    fn new(path: &Path, report: &HeapReport) -> Self {
        Self {
            path: path.display().to_string(),
            segment_bytes: report.segment_bytes,
            chunks: report.chunk_count,
            unused_chunks: report.unused_chunks,
            small_chunks: report.small_chunks,
            small_blocks: report.small_allocated_blocks,
            large_objects: report.large_objects,
            allocated_bytes: report.allocated_bytes(),
            free_blocks: report.free_blocks,
            free_bytes: report.free_bytes,
            uncarved_bytes: report.uncarved_bytes,
        }
    }
}

/// Opens the datastore read-only and walks the heap.
pub fn check(path: &Path) -> Result<CheckResult, Box<dyn std::error::Error>> {
    let manager = Manager::open_read_only(path)?;
    let report = manager.check_heap()?;
    manager.close()?;
    Ok(CheckResult::new(path, &report))
}

/// Runs the check command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = check(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("Checking heap at {}", result.path);
            println!();
            println!("  Segment:     {} bytes in {} chunks", result.segment_bytes, result.chunks);
            println!(
                "  Chunks:      {} small, {} unused",
                result.small_chunks, result.unused_chunks
            );
            println!(
                "  Live:        {} small blocks, {} large objects, {} bytes",
                result.small_blocks, result.large_objects, result.allocated_bytes
            );
            println!(
                "  Free:        {} blocks, {} bytes (+{} uncarved)",
                result.free_blocks, result.free_bytes, result.uncarved_bytes
            );
            println!();
            println!("✓ Heap verification passed");
        }
    }

    Ok(())
}
