//! Stress runners for permalloc.
//!
//! These drive one datastore from several threads and verify the heap
//! afterwards.

use permalloc_core::{Manager, ManagerResult, Offset, MIN_BIN_SIZE};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Smallest request size; thread `t` requests `base_size * (t + 1)`.
    pub base_size: usize,
    /// Free every allocation whose index is a multiple of this (0 keeps all).
    pub free_every: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 2_000,
            threads: 4,
            base_size: MIN_BIN_SIZE,
            free_every: 3,
        }
    }
}

/// Allocates from several threads, each with its own request size, and
/// frees a fraction as it goes.
///
/// Fails if two live allocations share an offset or if the heap walk
/// finds an inconsistency afterwards.
pub fn run_allocation_stress(
    manager: &Manager,
    config: &StressConfig,
) -> ManagerResult<StressTestResult> {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    let per_thread: Vec<Vec<Offset>> = thread::scope(|s| {
        let handles: Vec<_> = (0..config.threads)
            .map(|t| {
                let allocator = manager.allocator();
                let successful = &successful;
                let failed = &failed;
                let size = config.base_size * (t + 1);
                s.spawn(move || {
                    let mut live = Vec::new();
                    for i in 0..config.operations {
                        match allocator.allocate(size, MIN_BIN_SIZE) {
                            Ok(ptr) => {
                                successful.fetch_add(1, Ordering::Relaxed);
                                if config.free_every > 0 && i % config.free_every == 0 {
                                    if allocator.deallocate(ptr).is_err() {
                                        failed.fetch_add(1, Ordering::Relaxed);
                                    }
                                } else if let Some(offset) = allocator.to_offset(ptr.as_ptr()) {
                                    live.push(offset);
                                }
                            }
                            Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    live
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_default())
            .collect()
    });

    let duration = start.elapsed();
    let mut seen = HashSet::new();
    let mut duplicates = 0usize;
    for offset in per_thread.iter().flatten() {
        if !seen.insert(*offset) {
            duplicates += 1;
        }
    }
    let report = manager.check_heap()?;
    debug!(
        live = seen.len(),
        duplicates,
        allocated_bytes = report.allocated_bytes(),
        "allocation stress finished"
    );

    Ok(StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed) + duplicates,
        duration,
    ))
}

/// Constructs, looks up and destroys named objects from several threads.
///
/// Each thread owns a disjoint name range, so every operation is expected
/// to succeed.
pub fn run_named_churn(manager: &Manager, config: &StressConfig) -> ManagerResult<StressTestResult> {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    thread::scope(|s| {
        for t in 0..config.threads {
            let successful = &successful;
            let failed = &failed;
            s.spawn(move || {
                for i in 0..config.operations {
                    let name = format!("churn-{t}-{i}");
                    let value = (t * config.operations + i) as u64;
                    let ok = manager.construct(&name, value).is_ok()
                        && matches!(
                            manager.find::<u64>(&name),
                            // SAFETY: only this thread touches `name`.
                            Ok(Some(ptr)) if unsafe { ptr.read() } == value
                        )
                        && (config.free_every == 0
                            || i % config.free_every != 0
                            || matches!(manager.destroy::<u64>(&name), Ok(true)));
                    if ok {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    let duration = start.elapsed();
    manager.check_heap()?;
    Ok(StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        duration,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestDatastore;
    use permalloc_core::ObjectKind;

    #[test]
    fn allocation_stress_small() {
        let ds = TestDatastore::new();
        let config = StressConfig {
            operations: 500,
            ..Default::default()
        };
        let result = run_allocation_stress(&ds, &config).unwrap();
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 2_000);
        assert_eq!(result.total_ops, 2_000);
    }

    #[test]
    fn named_churn_small() {
        let ds = TestDatastore::new();
        let config = StressConfig {
            operations: 100,
            threads: 3,
            free_every: 2,
            ..Default::default()
        };
        let result = run_named_churn(&ds, &config).unwrap();
        assert_eq!(result.failed_ops, 0);
        // Even indices are destroyed, odd ones stay.
        assert_eq!(ds.num_objects(ObjectKind::Named).unwrap(), 3 * 50);
    }
}
