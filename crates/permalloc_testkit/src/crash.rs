//! Crash simulation for permalloc datastores.
//!
//! A crash is simulated by unmapping the datastore without persisting
//! metadata or writing the consistency marker, which is what an abrupt
//! process exit leaves behind.
//!
//! ## Test Strategy
//!
//! 1. **Crash after close** - Committed objects are written and closed.
//! 2. **Crash before flush** - Further objects are written, then the
//!    process "dies"; they must not appear on recovery.
//! 3. **Crash after flush** - As above with an explicit flush first; the
//!    flushed objects must appear on recovery.
//!
//! In every case a writable reopen must be refused.

use crate::fixtures::test_config;
use permalloc_core::{Config, Manager, ManagerError};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Abandons `manager` as if the process had died.
pub fn simulate_crash(manager: Manager) {
    manager.kernel().abort();
    drop(manager);
}

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Crash after writing objects, before any flush.
    BeforeFlush,
    /// Crash after writing objects and flushing.
    AfterFlush,
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Objects expected after recovery.
    pub expected_objects: usize,
    /// Objects found after recovery.
    pub actual_objects: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, objects: usize) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_objects: objects,
            actual_objects: objects,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: usize, actual: usize, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_objects: expected,
            actual_objects: actual,
            error: Some(error.to_string()),
        }
    }
}

/// Runs crash scenarios against datastores under one directory.
pub struct CrashRecoveryHarness {
    root: PathBuf,
    config: Config,
}

impl CrashRecoveryHarness {
    /// Creates a harness that places datastores under `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            config: test_config(),
        }
    }

    /// Writes `committed` objects and closes, reopens and writes `pending`
    /// more, then crashes at `point` and checks what survives.
    pub fn run(&self, point: CrashPoint, committed: u64, pending: u64) -> CrashRecoveryResult {
        let description = format!("{point:?} with {committed} committed, {pending} pending");
        let path = self.root.join(format!("{point:?}-{committed}-{pending}"));
        match self.scenario(&path, point, committed, pending) {
            Ok(result) => result,
            Err(e) => CrashRecoveryResult::fail(&description, 0, 0, &e.to_string()),
        }
    }

    fn scenario(
        &self,
        path: &Path,
        point: CrashPoint,
        committed: u64,
        pending: u64,
    ) -> Result<CrashRecoveryResult, ManagerError> {
        let description = format!("{point:?} with {committed} committed, {pending} pending");

        let manager = Manager::create_with_config(path, self.config.clone())?;
        for i in 0..committed {
            manager.construct(&format!("committed{i}"), i)?;
        }
        manager.close()?;

        let manager = Manager::open_with_config(path, self.config.clone())?;
        for i in 0..pending {
            manager.construct(&format!("pending{i}"), i)?;
        }
        if point == CrashPoint::AfterFlush {
            manager.flush()?;
        }
        simulate_crash(manager);
        debug!(path = %path.display(), ?point, "simulated crash");

        if !matches!(
            Manager::open_with_config(path, self.config.clone()),
            Err(ManagerError::Inconsistent { .. })
        ) {
            return Ok(CrashRecoveryResult::fail(
                &description,
                0,
                0,
                "writable reopen after crash was not refused",
            ));
        }

        let relaxed = self.config.clone().relaxed_read_only(true);
        let manager = Manager::open_read_only_with_config(path, relaxed)?;
        let expect_pending = point == CrashPoint::AfterFlush;
        let expected = committed + if expect_pending { pending } else { 0 };

        let mut found = 0u64;
        for i in 0..committed {
            if let Some(ptr) = manager.find::<u64>(&format!("committed{i}"))? {
                // SAFETY: the datastore is open and nothing else writes it.
                if unsafe { ptr.read() } != i {
                    return Ok(CrashRecoveryResult::fail(
                        &description,
                        expected as usize,
                        found as usize,
                        &format!("committed{i} has the wrong value"),
                    ));
                }
                found += 1;
            }
        }
        for i in 0..pending {
            let present = manager.find::<u64>(&format!("pending{i}"))?.is_some();
            if present != expect_pending {
                return Ok(CrashRecoveryResult::fail(
                    &description,
                    expected as usize,
                    found as usize,
                    &format!("pending{i} present = {present}"),
                ));
            }
            found += u64::from(present);
        }
        // Without a flush the free lists on disk predate the crash, so the
        // heap walk only holds for flushed state.
        if expect_pending {
            manager.check_heap()?;
        }

        if found == expected {
            Ok(CrashRecoveryResult::pass(&description, found as usize))
        } else {
            Ok(CrashRecoveryResult::fail(
                &description,
                expected as usize,
                found as usize,
                "object count mismatch",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn crash_before_flush_loses_pending() {
        let tmp = tempdir().unwrap();
        let result = CrashRecoveryHarness::new(tmp.path()).run(CrashPoint::BeforeFlush, 20, 10);
        assert!(result.passed, "{result:?}");
        assert_eq!(result.actual_objects, 20);
    }

    #[test]
    fn crash_after_flush_keeps_pending() {
        let tmp = tempdir().unwrap();
        let result = CrashRecoveryHarness::new(tmp.path()).run(CrashPoint::AfterFlush, 20, 10);
        assert!(result.passed, "{result:?}");
        assert_eq!(result.actual_objects, 30);
    }
}
