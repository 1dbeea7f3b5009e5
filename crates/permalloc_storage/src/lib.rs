//! # permalloc Storage
//!
//! Chunked, memory-mapped segment storage for permalloc.
//!
//! This crate provides the lowest layer of a datastore: a directory of
//! fixed-size chunk files mapped back to back into one reserved address
//! range. It does not interpret the bytes it maps.
//!
//! ## Design Principles
//!
//! - A segment offset maps to an address by adding the segment base
//! - Growing the segment never moves existing mappings
//! - No knowledge of allocator metadata or the object directory
//! - Must be `Send + Sync` for concurrent access
//!
//! The [`file`] module holds the filesystem helpers shared by the upper
//! layers: atomic writes, directory syncs, hole punching and the
//! clone/sparse copies used for snapshots.
//!
//! ## Example
//!
//! ```rust,no_run
//! use permalloc_storage::{SegmentOptions, SegmentStorage};
//!
//! let options = SegmentOptions {
//!     chunk_size: 1 << 21,
//!     max_size: 1 << 30,
//!     zero_fill: false,
//!     read_only: false,
//! };
//! let segment = SegmentStorage::create("/tmp/segment".as_ref(), options, 1 << 21).unwrap();
//! let addr = segment.translate(128).unwrap();
//! assert_eq!(segment.address_to_offset(addr.as_ptr()), Some(128));
//! ```

#![warn(missing_docs)]

mod error;
pub mod file;
mod region;
mod segment;

pub use error::{StorageError, StorageResult};
pub use file::CopyMode;
pub use segment::{chunk_file_name, SegmentOptions, SegmentStorage, CHUNK_FILE_PREFIX};
