// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the storage engine.
//!
//! Every public operation returns [`ReedResult<T>`]. `ReedError` carries a
//! kind plus contextual fields so the message never needs to be rebuilt from
//! a separate thread-local accessor the way the original engine this crate
//! is modelled on did it.

use std::fmt;

/// The outcome of any fallible engine operation.
pub type ReedResult<T> = Result<T, ReedError>;

/// Error kinds, one-to-one with the engine's `{Success, NoImpl, Invalid,
/// NoRepos, NoPerm, Broken, DupRec, NoRec, Logic, System, Misc}` taxonomy.
///
/// `Broken` and `System` variants mark the owning store fatal: the next
/// `open()` will trigger a reorganisation pass rather than a normal load.
#[derive(Debug)]
pub enum ReedError {
    /// The requested feature is not implemented by this build.
    NotImplemented { feature: String },
    /// Arguments failed validation before any I/O was attempted.
    Invalid { reason: String },
    /// The database file or WAL could not be found where expected.
    NoRepository { path: String },
    /// The operating system denied an operation (permissions, locking).
    NoPermission { operation: String, reason: String },
    /// The on-disk structure is corrupt beyond repair by reorganisation.
    Broken { reason: String },
    /// An insert collided with an existing key under a visitor that forbids overwrite.
    DuplicateRecord { key: String },
    /// The requested key has no live record.
    NoRecord { key: String },
    /// A checker/visitor callback aborted the operation deliberately.
    Logic { reason: String },
    /// The underlying filesystem call failed.
    IoError { operation: String, reason: String },
    /// Catch-all for conditions that do not fit another variant.
    Misc { reason: String },
}

impl ReedError {
    /// Whether this error should flip the owning store's `FFATAL` bit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReedError::Broken { .. } | ReedError::IoError { .. })
    }

    pub fn io(operation: impl Into<String>, err: impl fmt::Display) -> Self {
        ReedError::IoError {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        ReedError::Invalid {
            reason: reason.into(),
        }
    }

    pub fn broken(reason: impl Into<String>) -> Self {
        ReedError::Broken {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ReedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReedError::NotImplemented { feature } => {
                write!(f, "not implemented: {feature}")
            }
            ReedError::Invalid { reason } => write!(f, "invalid argument: {reason}"),
            ReedError::NoRepository { path } => write!(f, "no repository: {path}"),
            ReedError::NoPermission { operation, reason } => {
                write!(f, "no permission for {operation}: {reason}")
            }
            ReedError::Broken { reason } => write!(f, "broken database: {reason}"),
            ReedError::DuplicateRecord { key } => write!(f, "duplicate record: {key}"),
            ReedError::NoRecord { key } => write!(f, "no record: {key}"),
            ReedError::Logic { reason } => write!(f, "logic error: {reason}"),
            ReedError::IoError { operation, reason } => {
                write!(f, "I/O error during {operation}: {reason}")
            }
            ReedError::Misc { reason } => write!(f, "error: {reason}"),
        }
    }
}

impl std::error::Error for ReedError {}

impl From<std::io::Error> for ReedError {
    fn from(err: std::io::Error) -> Self {
        ReedError::IoError {
            operation: "io".to_string(),
            reason: err.to_string(),
        }
    }
}
