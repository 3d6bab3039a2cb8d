// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Transaction guard atop [`HashStore`]'s begin/end protocol.
//!
//! `HashStore` owns the WAL plumbing itself (guarded writes, pre-image
//! capture, free-block-pool snapshot/restore); this module is the ergonomic
//! front door most callers should use instead of calling
//! `begin_transaction`/`end_transaction` directly, since it resolves to an
//! abort on any early return (`?` or a panic unwind) rather than silently
//! leaving a transaction open.

use crate::error::ReedResult;
use crate::hashstore::HashStore;

/// RAII transaction handle. Dropping without calling [`Transaction::commit`]
/// aborts (rolls back to the pre-transaction state).
pub struct Transaction<'a> {
    store: &'a mut HashStore,
    resolved: bool,
}

impl<'a> Transaction<'a> {
    /// Begins a transaction against `store`. Only one may be active at a time.
    pub fn begin(store: &'a mut HashStore, hard_sync: bool) -> ReedResult<Self> {
        store.begin_transaction(hard_sync)?;
        Ok(Self { store, resolved: false })
    }

    pub fn store(&mut self) -> &mut HashStore {
        self.store
    }

    /// Commits the transaction, making its writes durable.
    pub fn commit(mut self) -> ReedResult<()> {
        self.store.end_transaction(true)?;
        self.resolved = true;
        Ok(())
    }

    /// Explicitly rolls back the transaction.
    pub fn abort(mut self) -> ReedResult<()> {
        self.store.end_transaction(false)?;
        self.resolved = true;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            let _ = self.store.end_transaction(false);
        }
    }
}

/// Runs `body` inside a begin/commit-or-abort transaction: commits if `body`
/// returns `Ok`, aborts otherwise. Used for the auto-transaction mode, where
/// every single-key mutation is wrapped independently of any explicit
/// transaction the caller may also be managing.
pub fn with_transaction<T>(
    store: &mut HashStore,
    hard_sync: bool,
    body: impl FnOnce(&mut HashStore) -> ReedResult<T>,
) -> ReedResult<T> {
    let mut txn = Transaction::begin(store, hard_sync)?;
    match body(txn.store()) {
        Ok(value) => {
            txn.commit()?;
            Ok(value)
        }
        Err(e) => {
            txn.abort()?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenOptions;
    use tempfile::TempDir;

    #[test]
    fn drop_without_commit_aborts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t1.kc");
        let mut store = HashStore::open(&path, OpenOptions::new().bucket_count(17)).unwrap();
        store.set(b"k", b"v0").unwrap();
        {
            let mut txn = Transaction::begin(&mut store, false).unwrap();
            txn.store().set(b"k", b"v1").unwrap();
            // txn dropped here without commit
        }
        assert_eq!(store.get(b"k").unwrap(), Some(b"v0".to_vec()));
    }

    #[test]
    fn commit_keeps_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t2.kc");
        let mut store = HashStore::open(&path, OpenOptions::new().bucket_count(17)).unwrap();
        {
            let txn = Transaction::begin(&mut store, false).unwrap();
            let mut txn = txn;
            txn.store().set(b"k", b"v1").unwrap();
            txn.commit().unwrap();
        }
        assert_eq!(store.get(b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn with_transaction_aborts_on_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t3.kc");
        let mut store = HashStore::open(&path, OpenOptions::new().bucket_count(17)).unwrap();
        let result: ReedResult<()> = with_transaction(&mut store, false, |s| {
            s.set(b"k", b"v1")?;
            Err(crate::error::ReedError::invalid("deliberate failure"))
        });
        assert!(result.is_err());
        assert_eq!(store.get(b"k").unwrap(), None);
    }
}
