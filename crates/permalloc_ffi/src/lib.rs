//! # permalloc FFI
//!
//! C ABI for the permalloc persistent-memory allocator.
//!
//! Functions follow the C allocator conventions: they return a pointer,
//! `true` or `0` on success, and null, `false` or `-1` on failure, with the
//! cause in `errno`:
//!
//! | errno | cause |
//! |---|---|
//! | `ENOMEM` | the segment cannot grow |
//! | `ENOENT` | no such datastore or object |
//! | `EEXIST` | the datastore or object name already exists |
//! | `ENOTRECOVERABLE` | the datastore was not closed properly |
//!
//! A human-readable message is available from [`permalloc_get_last_error`].
//!
//! Handles are not tied to a thread, but closing one while other threads
//! use it is undefined behavior.

#![warn(missing_docs)]

mod error;
mod manager;
mod types;

pub use error::{errno_of, permalloc_clear_error, permalloc_errno, permalloc_get_last_error};
pub use manager::*;
pub use types::PermallocHandle;
