//! # permalloc core
//!
//! A persistent-memory allocator. A datastore is a directory of chunk files
//! mapped into one contiguous virtual range; objects allocated in it survive
//! process restarts and can be found again by name.
//!
//! This crate provides:
//! - Offset pointers that stay valid when the segment maps at a new address
//! - A size-class table and per-bin free lists for small objects
//! - Chunk-granular first-fit allocation for large objects
//! - A persisted directory of named, unique and anonymous objects
//! - Crash detection through a consistency marker
//! - Point-in-time snapshots
//!
//! Start with [`Manager`].

#![warn(missing_docs)]

mod accessor;
mod bin;
mod chunk_table;
mod codec;
mod config;
mod directory;
mod error;
mod free_block;
mod heap;
mod kernel;
mod layout;
mod manager;
mod offset_ptr;
mod stats;
mod types;

pub use accessor::ObjectAttributeAccessor;
pub use bin::{BinIndex, BinTable, BIN_TABLE_VERSION, MIN_BIN_SIZE};
pub use config::{Config, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_SEGMENT_SIZE, MIN_CHUNK_SIZE};
pub use directory::{Directory, DirectoryEntry, ObjectTable};
pub use error::{ManagerError, ManagerResult};
pub use heap::HeapReport;
pub use kernel::ManagerKernel;
pub use layout::DatastoreLayout;
pub use manager::{Manager, Persistable, PersistentAllocator, PersistentPtr};
pub use offset_ptr::OffsetPtr;
pub use stats::{AllocatorStats, StatsSnapshot};
pub use types::{ObjectKind, Offset, OpenMode};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// On-disk format version, written to `<datastore>/version` and to the heap
/// and directory file headers.
pub const FORMAT_VERSION: u32 = 1;
