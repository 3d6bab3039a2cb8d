// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! kivi — embedded, single-process, single-file key-value storage engine.
//!
//! A file-backed hash-bucketed record store with an mmap prefix window and a
//! free-block pool, an ordered B+-tree index layered on top of it, and
//! undo-log write-ahead logging for crash-safe transactions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kivi::config::OpenOptions;
//! use kivi::hashstore::HashStore;
//!
//! let mut store = HashStore::open("data.kch", OpenOptions::new())?;
//! store.set(b"page.title", b"hello world")?;
//! assert_eq!(store.get(b"page.title")?, Some(b"hello world".to_vec()));
//! store.close()?;
//! # Ok::<(), kivi::error::ReedError>(())
//! ```
//!
//! Ordered access goes through [`btree::BPlusTree`] instead, which stores
//! its leaf/inner nodes as ordinary records inside the same kind of file:
//!
//! ```rust,no_run
//! use kivi::btree::BPlusTree;
//! use kivi::comparator::LexicalComparator;
//! use kivi::config::OpenOptions;
//!
//! let mut index = BPlusTree::open("data.kct", OpenOptions::new(), Box::new(LexicalComparator))?;
//! index.set(b"page.b", b"2")?;
//! index.set(b"page.a", b"1")?;
//! assert_eq!(index.get(b"page.a")?, Some(b"1".to_vec()));
//! # Ok::<(), kivi::error::ReedError>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐
//! │  BPlusTree  │   │  HashStore   │  ← unordered point API
//! │ (ordered)   │──▶│ (bucket      │
//! │ node cache  │   │  chains +    │
//! └─────────────┘   │  free pool)  │
//!                    └──────┬───────┘
//!                           │ guarded writes
//!                     ┌─────▼─────┐
//!                     │    WAL    │  ← undo log, replayed on abort/crash
//!                     └───────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`hashstore`]: file header, bucket array, record/free-block codec, the
//!   hash-bucketed engine itself.
//! - [`btree`]: leaf/inner node types and the ordered index built on top of
//!   `hashstore`.
//! - [`nodecache`]: the B+-tree's two-tier hot/warm node cache.
//! - [`txn`]: transaction guard (`Transaction`, `with_transaction`) atop the
//!   WAL-backed begin/commit/abort protocol `hashstore` implements directly.
//! - [`wal`]: the undo-log write-ahead log file format.
//! - [`fileio`]: mmap-prefix-window + positional-I/O file abstraction.
//! - [`freeblock`]: in-memory pool of reusable free extents.
//! - [`concurrent`]: advisory cross-process file lock and the in-process
//!   slotted record-lock bank.
//! - [`comparator`]: pluggable key orderings for the B+-tree.
//! - [`compressor`]: the seam for optional node/seed compression.
//! - [`config`]: validated open-time configuration (`OpenOptions`).
//! - [`varint`], [`murmur`]: the low-level wire primitives everything else
//!   is built from.
//! - [`error`]: the crate-wide `ReedError`/`ReedResult` types.

pub mod btree;
pub mod comparator;
pub mod compressor;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod fileio;
pub mod freeblock;
pub mod hashstore;
pub mod murmur;
pub mod nodecache;
pub mod txn;
pub mod varint;
pub mod wal;

pub use btree::BPlusTree;
pub use config::{ChainMode, OpenOptions, SyncMode};
pub use error::{ReedError, ReedResult};
pub use hashstore::{HashStore, VisitDecision, Visitor};
pub use txn::Transaction;
