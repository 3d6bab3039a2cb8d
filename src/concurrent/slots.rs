// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Slotted record locks: a fixed array of reader-writer locks indexed by
//! `bucket mod SLOT_COUNT`, so that unrelated buckets never contend on the
//! same lock.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Number of independent rwlock slots hashed into by bucket index.
pub const SLOT_COUNT: usize = 1024;

/// A fixed bank of rwlocks, one per slot. `accept` on a given bucket takes
/// `slot(bucket)` in reader or writer mode depending on the visit intent;
/// `accept_bulk` takes every needed slot in ascending index order before any
/// visitor runs, which is what makes overlapping bulk operations deadlock-free.
pub struct SlotLocks {
    slots: Vec<RwLock<()>>,
}

impl Default for SlotLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotLocks {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(SLOT_COUNT);
        slots.resize_with(SLOT_COUNT, || RwLock::new(()));
        Self { slots }
    }

    pub fn slot_for(bucket: u64) -> usize {
        (bucket % SLOT_COUNT as u64) as usize
    }

    pub fn read(&self, bucket: u64) -> RwLockReadGuard<'_, ()> {
        self.slots[Self::slot_for(bucket)].read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self, bucket: u64) -> RwLockWriteGuard<'_, ()> {
        self.slots[Self::slot_for(bucket)].write().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquires write locks for every distinct slot touched by `buckets`, in
    /// ascending slot order, so overlapping bulk calls never deadlock.
    pub fn write_many(&self, buckets: &[u64]) -> Vec<RwLockWriteGuard<'_, ()>> {
        let mut slot_ids: Vec<usize> = buckets.iter().map(|&b| Self::slot_for(b)).collect();
        slot_ids.sort_unstable();
        slot_ids.dedup();
        slot_ids
            .into_iter()
            .map(|id| self.slots[id].write().unwrap_or_else(|e| e.into_inner()))
            .collect()
    }

    /// Read-mode counterpart to [`SlotLocks::write_many`], used by bulk
    /// reads so concurrent writers can't interleave a torn view.
    pub fn read_many(&self, buckets: &[u64]) -> Vec<RwLockReadGuard<'_, ()>> {
        let mut slot_ids: Vec<usize> = buckets.iter().map(|&b| Self::slot_for(b)).collect();
        slot_ids.sort_unstable();
        slot_ids.dedup();
        slot_ids
            .into_iter()
            .map(|id| self.slots[id].read().unwrap_or_else(|e| e.into_inner()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bucket_maps_to_same_slot() {
        assert_eq!(SlotLocks::slot_for(5), SlotLocks::slot_for(5 + SLOT_COUNT as u64));
    }

    #[test]
    fn write_many_dedupes_and_sorts() {
        let locks = SlotLocks::new();
        let guards = locks.write_many(&[5, 5 + SLOT_COUNT as u64, 3]);
        // Two of the three buckets collide into one slot, so we expect two guards.
        assert_eq!(guards.len(), 2);
    }
}
