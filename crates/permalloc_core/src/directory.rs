//! Attributed object directory.
//!
//! Three tables (named, unique and anonymous) map keys to
//! `(offset, length, description)`. Each table preserves insertion order,
//! and that order survives serialization.
//!
//! The directory is persisted to its own file, independent of the heap, so
//! tools can inspect and annotate a closed datastore without mapping it.
//!
//! ```text
//! magic "PADR" | version u32
//! 3 x table:   count u64
//!              count x record:
//!                key_len u32 | key | offset u64 | length u64 | desc_len u32 | desc
//! sha256 of everything above
//! ```

use crate::codec::{Decoder, Encoder};
use crate::error::{ManagerError, ManagerResult};
use crate::types::ObjectKind;
use crate::FORMAT_VERSION;
use permalloc_storage::file;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const DIRECTORY_MAGIC: [u8; 4] = *b"PADR";

/// Smallest encoded record: empty key and description.
const MIN_RECORD_LEN: usize = 4 + 8 + 8 + 4;

/// One registered object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// The table the entry lives in.
    pub kind: ObjectKind,
    /// The key; empty for anonymous objects.
    pub name: String,
    /// Segment offset of the object.
    pub offset: u64,
    /// Length of the object in bytes.
    pub length: u64,
    /// Free-text description.
    pub description: String,
}

/// One key space, in insertion order.
#[derive(Debug, Clone)]
pub struct ObjectTable {
    kind: ObjectKind,
    entries: BTreeMap<u64, DirectoryEntry>,
    by_name: HashMap<String, u64>,
    by_offset: HashMap<u64, u64>,
    next_seq: u64,
}

impl ObjectTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
            by_name: HashMap::new(),
            by_offset: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Returns the table's kind.
    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers an object.
    ///
    /// Anonymous objects are keyed by offset and `name` is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::DuplicateKey`] if the key (or, for anonymous
    /// objects, the offset) is already present.
    pub fn insert(&mut self, name: &str, offset: u64, length: u64) -> ManagerResult<()> {
        let name = if self.kind == ObjectKind::Anonymous {
            ""
        } else {
            name
        };
        if self.kind != ObjectKind::Anonymous && self.by_name.contains_key(name) {
            return Err(ManagerError::duplicate_key(name));
        }
        if self.by_offset.contains_key(&offset) {
            return Err(ManagerError::duplicate_key(format!("offset {offset}")));
        }
        self.push(DirectoryEntry {
            kind: self.kind,
            name: name.to_string(),
            offset,
            length,
            description: String::new(),
        });
        Ok(())
    }

    fn push(&mut self, entry: DirectoryEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.kind != ObjectKind::Anonymous {
            self.by_name.insert(entry.name.clone(), seq);
        }
        self.by_offset.insert(entry.offset, seq);
        self.entries.insert(seq, entry);
    }

    /// Looks up an entry by key.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&DirectoryEntry> {
        self.by_name.get(name).and_then(|seq| self.entries.get(seq))
    }

    /// Looks up an entry by offset.
    #[must_use]
    pub fn find_by_offset(&self, offset: u64) -> Option<&DirectoryEntry> {
        self.by_offset.get(&offset).and_then(|seq| self.entries.get(seq))
    }

    /// Removes an entry by key.
    pub fn erase(&mut self, name: &str) -> Option<DirectoryEntry> {
        let seq = *self.by_name.get(name)?;
        self.remove_seq(seq)
    }

    /// Removes an entry by offset.
    pub fn erase_by_offset(&mut self, offset: u64) -> Option<DirectoryEntry> {
        let seq = *self.by_offset.get(&offset)?;
        self.remove_seq(seq)
    }

    fn remove_seq(&mut self, seq: u64) -> Option<DirectoryEntry> {
        let entry = self.entries.remove(&seq)?;
        if self.kind != ObjectKind::Anonymous {
            self.by_name.remove(&entry.name);
        }
        self.by_offset.remove(&entry.offset);
        Some(entry)
    }

    /// Replaces the description of an entry. Returns false if absent.
    pub fn set_description(&mut self, name: &str, description: &str) -> bool {
        let Some(&seq) = self.by_name.get(name) else {
            return false;
        };
        self.describe_seq(seq, description)
    }

    /// Replaces the description of the entry at `offset`.
    pub fn set_description_by_offset(&mut self, offset: u64, description: &str) -> bool {
        let Some(&seq) = self.by_offset.get(&offset) else {
            return false;
        };
        self.describe_seq(seq, description)
    }

    fn describe_seq(&mut self, seq: u64, description: &str) -> bool {
        match self.entries.get_mut(&seq) {
            Some(entry) => {
                entry.description = description.to_string();
                true
            }
            None => false,
        }
    }

    /// Iterates the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.values()
    }

    fn encode(&self, enc: &mut Encoder) -> ManagerResult<()> {
        enc.u64(self.entries.len() as u64);
        for entry in self.entries.values() {
            enc.string(&entry.name)?;
            enc.u64(entry.offset);
            enc.u64(entry.length);
            enc.string(&entry.description)?;
        }
        Ok(())
    }

    fn decode(kind: ObjectKind, dec: &mut Decoder<'_>) -> ManagerResult<Self> {
        let mut table = Self::new(kind);
        let count = dec.count(MIN_RECORD_LEN)?;
        for _ in 0..count {
            let name = dec.string()?;
            let offset = dec.u64()?;
            let length = dec.u64()?;
            let description = dec.string()?;

            table.insert(&name, offset, length).map_err(|_| {
                ManagerError::format(format!("duplicate {kind} entry {name:?} in directory"))
            })?;
            if !description.is_empty() {
                table.set_description_by_offset(offset, &description);
            }
        }
        Ok(table)
    }
}

/// The three object tables of a datastore.
#[derive(Debug, Clone)]
pub struct Directory {
    named: ObjectTable,
    unique: ObjectTable,
    anonymous: ObjectTable,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            named: ObjectTable::new(ObjectKind::Named),
            unique: ObjectTable::new(ObjectKind::Unique),
            anonymous: ObjectTable::new(ObjectKind::Anonymous),
        }
    }

    /// Returns the table for `kind`.
    #[must_use]
    pub fn table(&self, kind: ObjectKind) -> &ObjectTable {
        match kind {
            ObjectKind::Named => &self.named,
            ObjectKind::Unique => &self.unique,
            ObjectKind::Anonymous => &self.anonymous,
        }
    }

    /// Returns the table for `kind`, mutably.
    pub fn table_mut(&mut self, kind: ObjectKind) -> &mut ObjectTable {
        match kind {
            ObjectKind::Named => &mut self.named,
            ObjectKind::Unique => &mut self.unique,
            ObjectKind::Anonymous => &mut self.anonymous,
        }
    }

    /// Registers an object, rejecting offsets already registered in any table.
    pub fn insert(&mut self, kind: ObjectKind, name: &str, offset: u64, length: u64) -> ManagerResult<()> {
        if let Some(existing) = self.find_by_offset(offset) {
            return Err(ManagerError::duplicate_key(format!(
                "offset {offset} (already registered as {} object {:?})",
                existing.kind, existing.name
            )));
        }
        self.table_mut(kind).insert(name, offset, length)
    }

    /// Looks up an object by offset across all tables.
    #[must_use]
    pub fn find_by_offset(&self, offset: u64) -> Option<&DirectoryEntry> {
        ObjectKind::ALL
            .iter()
            .find_map(|&kind| self.table(kind).find_by_offset(offset))
    }

    /// Removes an object by offset from whichever table holds it.
    pub fn erase_by_offset(&mut self, offset: u64) -> Option<DirectoryEntry> {
        let kind = self.find_by_offset(offset)?.kind;
        self.table_mut(kind).erase_by_offset(offset)
    }

    /// Returns the total number of registered objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.named.len() + self.unique.len() + self.anonymous.len()
    }

    /// Returns true if no objects are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encodes all three tables.
    ///
    /// Fails with [`ManagerError::InvalidArgument`] if a key or description
    /// does not fit its length prefix.
    pub fn encode(&self) -> ManagerResult<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.bytes(&DIRECTORY_MAGIC);
        enc.u32(FORMAT_VERSION);
        for kind in ObjectKind::ALL {
            self.table(kind).encode(&mut enc)?;
        }
        Ok(enc.seal())
    }

    /// Decodes a directory. Nothing is returned unless the whole input is
    /// valid.
    pub fn decode(data: &[u8]) -> ManagerResult<Self> {
        let mut dec = Decoder::unseal(data, "directory")?;
        dec.magic(&DIRECTORY_MAGIC)?;
        let version = dec.u32()?;
        if version != FORMAT_VERSION {
            return Err(ManagerError::format(format!(
                "unsupported directory version {version}"
            )));
        }

        let named = ObjectTable::decode(ObjectKind::Named, &mut dec)?;
        let unique = ObjectTable::decode(ObjectKind::Unique, &mut dec)?;
        let anonymous = ObjectTable::decode(ObjectKind::Anonymous, &mut dec)?;
        dec.finish()?;

        let directory = Self {
            named,
            unique,
            anonymous,
        };
        let mut offsets = std::collections::HashSet::new();
        for kind in ObjectKind::ALL {
            for entry in directory.table(kind).iter() {
                if !offsets.insert(entry.offset) {
                    return Err(ManagerError::format(format!(
                        "offset {} registered twice in directory",
                        entry.offset
                    )));
                }
            }
        }
        Ok(directory)
    }

    /// Writes the directory to `path` atomically.
    pub fn serialize(&self, path: &Path) -> ManagerResult<()> {
        file::write_file_atomic(path, &self.encode()?)?;
        Ok(())
    }

    /// Reads a directory from `path`.
    pub fn deserialize(path: &Path) -> ManagerResult<Self> {
        Self::decode(&file::read_file(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Directory {
        let mut dir = Directory::new();
        dir.insert(ObjectKind::Named, "zeta", 4096, 8).unwrap();
        dir.insert(ObjectKind::Named, "alpha", 16, 4).unwrap();
        dir.insert(ObjectKind::Unique, "my::Type", 64, 32).unwrap();
        dir.insert(ObjectKind::Anonymous, "", 128, 16).unwrap();
        dir.table_mut(ObjectKind::Named)
            .set_description("alpha", "first letter");
        dir
    }

    #[test]
    fn duplicate_keys_rejected() {
        let mut dir = sample();
        assert!(matches!(
            dir.insert(ObjectKind::Named, "alpha", 999, 1),
            Err(ManagerError::DuplicateKey { .. })
        ));
        assert!(matches!(
            dir.insert(ObjectKind::Anonymous, "", 128, 1),
            Err(ManagerError::DuplicateKey { .. })
        ));
        assert!(matches!(
            dir.insert(ObjectKind::Unique, "other", 16, 1),
            Err(ManagerError::DuplicateKey { .. })
        ));
        dir.insert(ObjectKind::Unique, "alpha", 999, 1).unwrap();
    }

    #[test]
    fn insertion_order_preserved() {
        let dir = sample();
        let names: Vec<_> = dir
            .table(ObjectKind::Named)
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(names, ["zeta", "alpha"]);
    }

    #[test]
    fn find_and_erase() {
        let mut dir = sample();
        let named = dir.table_mut(ObjectKind::Named);
        assert_eq!(named.find("alpha").map(|e| e.offset), Some(16));
        assert_eq!(named.erase("alpha").map(|e| e.length), Some(4));
        assert!(named.find("alpha").is_none());
        assert!(named.erase("alpha").is_none());

        assert_eq!(dir.find_by_offset(128).map(|e| e.kind), Some(ObjectKind::Anonymous));
        assert!(dir.erase_by_offset(128).is_some());
        assert!(dir.find_by_offset(128).is_none());
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn descriptions() {
        let mut dir = sample();
        assert_eq!(
            dir.table(ObjectKind::Named).find("alpha").unwrap().description,
            "first letter"
        );
        assert!(!dir.table_mut(ObjectKind::Named).set_description("nope", "x"));
        assert!(dir
            .table_mut(ObjectKind::Anonymous)
            .set_description_by_offset(128, "orphan"));
        assert_eq!(dir.find_by_offset(128).unwrap().description, "orphan");
    }

    #[test]
    fn serialize_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("directory");
        let mut dir = sample();
        dir.table_mut(ObjectKind::Named).erase("zeta");
        dir.insert(ObjectKind::Named, "omega", 8192, 2).unwrap();
        dir.serialize(&path).unwrap();

        let loaded = Directory::deserialize(&path).unwrap();
        for kind in ObjectKind::ALL {
            let a: Vec<_> = dir.table(kind).iter().cloned().collect();
            let b: Vec<_> = loaded.table(kind).iter().cloned().collect();
            assert_eq!(a, b, "{kind} table differs");
        }
        let names: Vec<_> = loaded
            .table(ObjectKind::Named)
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names, ["alpha", "omega"]);
    }

    #[test]
    fn truncated_file_rejected() {
        let data = sample().encode().unwrap();
        for len in [0, 4, data.len() / 2, data.len() - 1] {
            assert!(matches!(
                Directory::decode(&data[..len]),
                Err(ManagerError::Format { .. })
            ));
        }
    }

    #[test]
    fn missing_file_is_error() {
        let tmp = tempdir().unwrap();
        assert!(Directory::deserialize(&tmp.path().join("directory")).is_err());
    }
}
