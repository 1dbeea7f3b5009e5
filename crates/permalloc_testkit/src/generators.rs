//! Property-based test generators using proptest.
//!
//! Provides strategies for allocation sizes, object names and operation
//! sequences.

use permalloc_core::BinTable;
use proptest::prelude::*;

/// Strategy for allocation sizes that land in small bins of `table`.
pub fn small_size_strategy(table: &BinTable) -> impl Strategy<Value = usize> {
    1..=table.max_small_size()
}

/// Strategy for allocation sizes spanning one to `max_chunks` chunks.
pub fn large_size_strategy(table: &BinTable, max_chunks: usize) -> impl Strategy<Value = usize> {
    (table.max_small_size() + 1)..=(table.chunk_size() * max_chunks.max(1))
}

/// Strategy for allocation sizes, mostly small with occasional large ones.
pub fn allocation_size_strategy(table: &BinTable) -> impl Strategy<Value = usize> {
    prop_oneof![
        8 => small_size_strategy(table),
        1 => large_size_strategy(table, 3),
    ]
}

/// Strategy for valid object names.
pub fn object_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_./-]{0,31}").expect("Invalid regex")
}

/// Strategy for object payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..2048)
}

/// One step of a random allocation workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocOp {
    /// Allocate this many bytes.
    Allocate(usize),
    /// Free the live allocation at this index (modulo the live count).
    Free(usize),
}

/// Strategy for allocation workloads of up to `max_len` steps.
pub fn alloc_ops_strategy(table: &BinTable, max_len: usize) -> impl Strategy<Value = Vec<AllocOp>> {
    let op = prop_oneof![
        3 => allocation_size_strategy(table).prop_map(AllocOp::Allocate),
        2 => any::<usize>().prop_map(AllocOp::Free),
    ];
    prop::collection::vec(op, 1..max_len.max(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{TEST_CHUNK_SIZE, TEST_MAX_SEGMENT_SIZE};

    fn table() -> BinTable {
        BinTable::new(TEST_CHUNK_SIZE, TEST_MAX_SEGMENT_SIZE)
    }

    proptest! {
        #[test]
        fn small_sizes_fit_small_bins(size in small_size_strategy(&table())) {
            let table = table();
            let bin = table.bin_of(size).unwrap();
            prop_assert!(table.is_small(bin));
        }

        #[test]
        fn large_sizes_use_whole_chunks(size in large_size_strategy(&table(), 4)) {
            let table = table();
            let bin = table.bin_of(size).unwrap();
            prop_assert!(!table.is_small(bin));
            prop_assert!(table.chunks_of(bin) <= 4);
        }

        #[test]
        fn names_are_non_empty(name in object_name_strategy()) {
            prop_assert!(!name.is_empty());
        }
    }
}
