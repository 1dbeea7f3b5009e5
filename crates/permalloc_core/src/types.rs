//! Core type definitions for permalloc.

use std::fmt;

/// A segment-relative byte address.
///
/// Offsets stay valid when the segment is mapped at a different base
/// address, so they are what gets persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(pub u64);

impl Offset {
    /// Creates a new offset.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Returns the raw offset value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}

/// The key space an object is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Keyed by an explicit name.
    Named,
    /// Keyed by its type; at most one instance per type.
    Unique,
    /// No key; reachable by offset or iteration only.
    Anonymous,
}

impl ObjectKind {
    /// All kinds, in on-disk table order.
    pub const ALL: [ObjectKind; 3] = [Self::Named, Self::Unique, Self::Anonymous];

    /// Returns the lowercase kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Named => "named",
            Self::Unique => "unique",
            Self::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a datastore is held open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Freshly created, writable.
    Create,
    /// Existing datastore, writable.
    ReadWrite,
    /// Existing datastore, mapped without write permission.
    ReadOnly,
}

impl OpenMode {
    /// Returns true if the datastore may be modified.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_display() {
        assert_eq!(Offset::new(255).to_string(), "+0xff");
        assert_eq!(Offset::new(7).as_u64(), 7);
    }

    #[test]
    fn kind_names() {
        let names: Vec<_> = ObjectKind::ALL.iter().map(|k| k.to_string()).collect();
        assert_eq!(names, ["named", "unique", "anonymous"]);
    }

    #[test]
    fn open_mode_writability() {
        assert!(OpenMode::Create.is_writable());
        assert!(OpenMode::ReadWrite.is_writable());
        assert!(!OpenMode::ReadOnly.is_writable());
    }
}
