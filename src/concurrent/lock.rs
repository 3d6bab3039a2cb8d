// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Advisory cross-process file locking, taken once at database open.
//!
//! This guards against two processes opening the same file for writing; it
//! says nothing about in-process concurrency, which is handled by the
//! method lock and the slotted record locks in [`super::slots`].

use crate::error::{ReedError, ReedResult};
use fs2::FileExt;
use std::fs::File;

/// Whether the advisory lock is held exclusively (writer) or shared (reader).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// RAII guard for the database file's advisory lock. Unlocked on drop.
pub struct AdvisoryLock {
    mode: LockMode,
}

impl AdvisoryLock {
    /// Attempts to acquire `mode` on `file` without blocking.
    ///
    /// ## Error Conditions
    /// - `NoPermission`: another process already holds a conflicting lock.
    pub fn try_acquire(file: &File, mode: LockMode) -> ReedResult<Self> {
        let result = match mode {
            LockMode::Shared => file.try_lock_shared(),
            LockMode::Exclusive => file.try_lock_exclusive(),
        };
        result.map_err(|e| ReedError::NoPermission {
            operation: "lock database file".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { mode })
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Releases the lock (also runs automatically via `Drop`).
    pub fn release(self, file: &File) -> ReedResult<()> {
        file.unlock()
            .map_err(|e| ReedError::io("unlock database file", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open(path: &std::path::Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn exclusive_lock_blocks_second_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kc");
        let a = open(&path);
        let b = open(&path);

        let _lock_a = AdvisoryLock::try_acquire(&a, LockMode::Exclusive).unwrap();
        let result = AdvisoryLock::try_acquire(&b, LockMode::Exclusive);
        assert!(result.is_err());
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kc");
        let a = open(&path);
        let b = open(&path);

        let _lock_a = AdvisoryLock::try_acquire(&a, LockMode::Shared).unwrap();
        let _lock_b = AdvisoryLock::try_acquire(&b, LockMode::Shared).unwrap();
    }
}
