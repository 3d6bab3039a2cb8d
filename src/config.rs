// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Open-time configuration for a database: alignment, bucket count,
//! chain strategy, compression, mmap window, sync mode, and B+-tree tuning.
//!
//! Follows the teacher crate's validated-constructor idiom (`Order::new()`)
//! rather than a config-file parser — the engine has no use for one, so
//! `toml`/`serde` were dropped from the dependency table (see DESIGN.md).

use crate::error::{ReedError, ReedResult};
use crate::fileio::DEFAULT_MMAP_SIZE;

/// In-bucket chain strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// A binary search tree ordered by pivot, falling back to lexical key order.
    Tree,
    /// A simple list in insertion order; omits the right-child pointer.
    Linear,
}

/// When `synchronize`/commit should call `fsync` vs the cheaper `fdatasync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Soft,
    Hard,
}

/// Validated open-time configuration, built incrementally and finalised by [`OpenOptions::build`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub writable: bool,
    pub create: bool,
    pub alignment_power: u32,
    pub free_pool_power: u32,
    pub bucket_count: u64,
    pub chain_mode: ChainMode,
    pub compress: bool,
    pub mmap_size: u64,
    pub sync_mode: SyncMode,
    pub repair_on_open: bool,
    pub auto_transaction: bool,
    pub no_lock: bool,
    /// Target leaf/inner node byte size for the B+-tree layer.
    pub page_size: u64,
    /// Node-cache byte budget.
    pub cache_capacity: u64,
    /// Steps run per automatic defragmentation pass.
    pub defrag_unit: u64,
    pub defrag_max_steps: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            writable: true,
            create: true,
            alignment_power: 3,
            free_pool_power: 10,
            bucket_count: 1_000_003,
            chain_mode: ChainMode::Tree,
            compress: false,
            mmap_size: DEFAULT_MMAP_SIZE,
            sync_mode: SyncMode::Soft,
            repair_on_open: true,
            auto_transaction: false,
            no_lock: false,
            page_size: 8192,
            cache_capacity: 64 * 1024 * 1024,
            defrag_unit: 8,
            defrag_max_steps: 512,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alignment_power(mut self, apow: u32) -> Self {
        self.alignment_power = apow;
        self
    }

    pub fn free_pool_power(mut self, fpow: u32) -> Self {
        self.free_pool_power = fpow;
        self
    }

    pub fn bucket_count(mut self, bnum: u64) -> Self {
        self.bucket_count = bnum;
        self
    }

    pub fn chain_mode(mut self, mode: ChainMode) -> Self {
        self.chain_mode = mode;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self.create = false;
        self
    }

    pub fn page_size(mut self, psiz: u64) -> Self {
        self.page_size = psiz;
        self
    }

    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// When set, wraps every single-key `set`/`remove` in its own
    /// begin/commit transaction, independent of any explicit transaction
    /// the caller manages separately.
    pub fn auto_transaction(mut self, enabled: bool) -> Self {
        self.auto_transaction = enabled;
        self
    }

    /// Validates the accumulated options, rejecting out-of-range powers.
    pub fn build(self) -> ReedResult<Self> {
        if self.alignment_power == 0 || self.alignment_power > 16 {
            return Err(ReedError::invalid(format!(
                "alignment power {} out of range [1, 16]",
                self.alignment_power
            )));
        }
        if self.free_pool_power > 20 {
            return Err(ReedError::invalid(format!(
                "free pool power {} out of range [0, 20]",
                self.free_pool_power
            )));
        }
        if self.bucket_count == 0 {
            return Err(ReedError::invalid("bucket count must be non-zero"));
        }
        if self.page_size < 256 {
            return Err(ReedError::invalid("page size must be at least 256 bytes"));
        }
        Ok(self)
    }

    pub fn alignment(&self) -> u64 {
        1u64 << self.alignment_power
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_build_successfully() {
        assert!(OpenOptions::new().build().is_ok());
    }

    #[test]
    fn rejects_zero_alignment_power() {
        let result = OpenOptions::new().alignment_power(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_bucket_count() {
        let result = OpenOptions::new().bucket_count(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn alignment_reflects_power() {
        let opts = OpenOptions::new().alignment_power(4).build().unwrap();
        assert_eq!(opts.alignment(), 16);
    }
}
