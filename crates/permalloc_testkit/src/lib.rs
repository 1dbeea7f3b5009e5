//! # permalloc testkit
//!
//! Test utilities for permalloc.
//!
//! This crate provides:
//! - Temporary datastore fixtures
//! - Crash simulation and recovery checks
//! - Concurrent stress runners
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use permalloc_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_datastore() {
//!     with_temp_datastore(|manager| {
//!         manager.construct("answer", 42u64).unwrap();
//!     });
//! }
//! ```

#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
