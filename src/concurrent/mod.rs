// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Concurrency primitives: the advisory cross-process file lock taken at
//! open, and the in-process lock hierarchy (method lock, slotted record
//! locks, per-node locks) described in the concurrency model.

pub mod lock;
pub mod slots;

pub use lock::{AdvisoryLock, LockMode};
pub use slots::SlotLocks;
