//! Concurrent allocation across bins.

use permalloc_core::{Config, Manager, ManagerError};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn config() -> Config {
    Config::new().chunk_size(1 << 16).max_segment_size(1 << 28)
}

#[test]
fn disjoint_bins_do_not_corrupt_each_other() {
    let tmp = tempdir().unwrap();
    let manager = Manager::create_with_config(&tmp.path().join("ds"), config()).unwrap();
    let sizes = [16usize, 48, 112, 256, 1024, 4096];
    let barrier = Arc::new(Barrier::new(sizes.len()));

    let handles: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(t, &size)| {
            let allocator = manager.allocator();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut live = Vec::new();
                for round in 0..2000usize {
                    let ptr = allocator.allocate(size, 16).unwrap();
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), t as u8, size) };
                    live.push(ptr);
                    if round % 3 == 2 {
                        let victim = live.swap_remove(round % live.len());
                        let bytes = unsafe { std::slice::from_raw_parts(victim.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == t as u8));
                        allocator.deallocate(victim).unwrap();
                    }
                }
                live.into_iter()
                    .map(|p| allocator.to_offset(p.as_ptr()).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut offsets = HashSet::new();
    let mut live_count = 0u64;
    for handle in handles {
        for offset in handle.join().unwrap() {
            assert!(offsets.insert(offset), "offset handed out twice");
            live_count += 1;
        }
    }

    let report = manager.check_heap().unwrap();
    assert_eq!(report.small_allocated_blocks, live_count);
    let stats = manager.stats();
    assert_eq!(stats.allocations - stats.deallocations, live_count);
}

#[test]
fn same_bin_contention() {
    let tmp = tempdir().unwrap();
    let manager = Manager::create_with_config(&tmp.path().join("ds"), config()).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let allocator = manager.allocator();
            thread::spawn(move || {
                for _ in 0..1000 {
                    let a = allocator.allocate(64, 16).unwrap();
                    let b = allocator.allocate(64, 16).unwrap();
                    assert_ne!(a, b);
                    allocator.deallocate(a).unwrap();
                    allocator.deallocate(b).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let report = manager.check_heap().unwrap();
    assert_eq!(report.small_allocated_blocks, 0);
}

#[test]
fn concurrent_named_construction() {
    let tmp = tempdir().unwrap();
    let manager = Arc::new(Manager::create_with_config(&tmp.path().join("ds"), config()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let mut wins = 0;
                for i in 0..100u32 {
                    // Every thread races for the same names.
                    match manager.construct(&format!("shared{i}"), t as u32) {
                        Ok(_) => wins += 1,
                        Err(ManagerError::DuplicateKey { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                wins
            })
        })
        .collect();
    let wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(wins, 100);
    let report = manager.check_heap().unwrap();
    assert_eq!(report.small_allocated_blocks, 100);
}

#[test]
fn large_objects_from_many_threads() {
    let tmp = tempdir().unwrap();
    let manager = Manager::create_with_config(&tmp.path().join("ds"), config()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let allocator = manager.allocator();
            thread::spawn(move || {
                for round in 0..20usize {
                    let size = (1 << 16) * (1 + (t + round) % 3);
                    let ptr = allocator.allocate(size, 16).unwrap();
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x5A, size) };
                    allocator.deallocate(ptr).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let report = manager.check_heap().unwrap();
    assert_eq!(report.large_objects, 0);
    assert_eq!(report.unused_chunks, report.chunk_count - report.small_chunks);
}
