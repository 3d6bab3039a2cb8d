// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Undo-style write-ahead log.
//!
//! The WAL records pre-images of file regions about to be overwritten by an
//! in-progress transaction. Abort (or crash recovery) replays the messages
//! from end to start, writing each pre-image back over the current bytes,
//! which restores the file to its state at `begin_transaction`.
//!
//! File layout — see the on-disk format notes:
//! ```text
//! 0..3    "KW\n"
//! 4..12   original-size (u64 BE)
//! then repeated: { 0xEE, off: u64 BE, size: u64 BE, pre-image bytes }
//! ```

use crate::error::{ReedError, ReedResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const WAL_MAGIC: &[u8; 3] = b"KW\n";
const MSG_MAGIC: u8 = 0xEE;

/// One undo message: the pre-image of `[offset, offset + data.len())`.
#[derive(Debug, Clone)]
pub struct WalMessage {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Handle to the `<dbpath>.wal` side file.
pub struct Wal {
    path: PathBuf,
    file: Option<File>,
    original_size: u64,
}

impl Wal {
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut p = db_path.as_os_str().to_owned();
        p.push(".wal");
        PathBuf::from(p)
    }

    /// Opens the WAL path without requiring it to exist yet; used at
    /// database open to check for a crash-recovery candidate.
    pub fn open_existing(db_path: &Path) -> ReedResult<Option<Self>> {
        let path = Self::path_for(db_path);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| ReedError::io("open wal", e))?;
        let mut header = [0u8; 12];
        if file.read_exact(&mut header).is_err() {
            return Ok(None);
        }
        if &header[0..3] != WAL_MAGIC {
            return Ok(None);
        }
        let original_size = u64::from_be_bytes(header[4..12].try_into().unwrap());
        Ok(Some(Self {
            path,
            file: Some(file),
            original_size,
        }))
    }

    /// Begins a new transaction: creates/truncates the WAL and writes its header.
    pub fn begin(db_path: &Path, original_size: u64, hard_sync: bool) -> ReedResult<Self> {
        let path = Self::path_for(db_path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| ReedError::io("create wal", e))?;
        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(WAL_MAGIC);
        header.push(0); // pad to 4 bytes before the size field
        header.extend_from_slice(&original_size.to_be_bytes());
        file.write_all(&header).map_err(|e| ReedError::io("write wal header", e))?;
        if hard_sync {
            file.sync_all().map_err(|e| ReedError::io("fsync wal", e))?;
        }
        Ok(Self {
            path,
            file: Some(file),
            original_size,
        })
    }

    pub fn original_size(&self) -> u64 {
        self.original_size
    }

    /// Appends an undo message for the region `[offset, offset + data.len())`.
    pub fn append(&mut self, offset: u64, data: &[u8], hard_sync: bool) -> ReedResult<()> {
        let file = self.file.as_mut().ok_or_else(|| ReedError::broken("wal not open"))?;
        let mut msg = Vec::with_capacity(17 + data.len());
        msg.push(MSG_MAGIC);
        msg.extend_from_slice(&offset.to_be_bytes());
        msg.extend_from_slice(&(data.len() as u64).to_be_bytes());
        msg.extend_from_slice(data);
        file.write_all(&msg).map_err(|e| ReedError::io("append wal message", e))?;
        if hard_sync {
            file.sync_all().map_err(|e| ReedError::io("fsync wal", e))?;
        }
        Ok(())
    }

    /// Reads every message in file order (oldest first).
    pub fn read_messages(&self) -> ReedResult<Vec<WalMessage>> {
        let mut file = File::open(&self.path).map_err(|e| ReedError::io("reopen wal", e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| ReedError::io("read wal", e))?;
        if bytes.len() < 12 || &bytes[0..3] != WAL_MAGIC {
            return Ok(Vec::new());
        }
        let mut messages = Vec::new();
        let mut pos = 12;
        while pos < bytes.len() {
            if bytes[pos] != MSG_MAGIC {
                break; // zero-terminated or truncated tail
            }
            pos += 1;
            if pos + 16 > bytes.len() {
                break;
            }
            let offset = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let size = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap()) as usize;
            pos += 8;
            if pos + size > bytes.len() {
                return Err(ReedError::broken("wal message truncated"));
            }
            let data = bytes[pos..pos + size].to_vec();
            pos += size;
            messages.push(WalMessage { offset, data });
        }
        Ok(messages)
    }

    /// Applies every message in reverse order, writing its pre-image back
    /// to `target`. Used by both `abort` and crash recovery.
    pub fn replay_reverse<F>(&self, mut target: F) -> ReedResult<()>
    where
        F: FnMut(u64, &[u8]) -> ReedResult<()>,
    {
        let messages = self.read_messages()?;
        for msg in messages.into_iter().rev() {
            target(msg.offset, &msg.data)?;
        }
        Ok(())
    }

    /// Truncates the WAL to zero length, marking the transaction committed.
    pub fn truncate(&mut self) -> ReedResult<()> {
        if let Some(file) = &self.file {
            file.set_len(0).map_err(|e| ReedError::io("truncate wal", e))?;
        }
        Ok(())
    }

    /// Removes the WAL file entirely (used after a successful recovery replay).
    pub fn remove(self) -> ReedResult<()> {
        drop(self.file);
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| ReedError::io("remove wal", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn begin_append_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("db.kc");
        let mut wal = Wal::begin(&db_path, 1000, false).unwrap();
        wal.append(10, b"abc", false).unwrap();
        wal.append(50, b"defgh", false).unwrap();

        let messages = wal.read_messages().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].offset, 10);
        assert_eq!(messages[0].data, b"abc");
        assert_eq!(messages[1].offset, 50);
        assert_eq!(messages[1].data, b"defgh");
    }

    #[test]
    fn replay_reverse_restores_pre_images() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("db.kc");
        let mut wal = Wal::begin(&db_path, 100, false).unwrap();
        wal.append(0, b"AAAA", false).unwrap();
        wal.append(4, b"BBBB", false).unwrap();

        let mut restored: Vec<(u64, Vec<u8>)> = Vec::new();
        wal.replay_reverse(|off, data| {
            restored.push((off, data.to_vec()));
            Ok(())
        })
        .unwrap();

        assert_eq!(restored, vec![(4, b"BBBB".to_vec()), (0, b"AAAA".to_vec())]);
    }

    #[test]
    fn truncate_empties_wal() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("db.kc");
        let mut wal = Wal::begin(&db_path, 100, false).unwrap();
        wal.append(0, b"x", false).unwrap();
        wal.truncate().unwrap();
        assert_eq!(wal.read_messages().unwrap().len(), 0);
    }

    #[test]
    fn open_existing_detects_crash_candidate() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("db.kc");
        {
            let mut wal = Wal::begin(&db_path, 100, false).unwrap();
            wal.append(0, b"x", false).unwrap();
        }
        let found = Wal::open_existing(&db_path).unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().original_size(), 100);
    }

    #[test]
    fn no_wal_file_returns_none() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("db.kc");
        assert!(Wal::open_existing(&db_path).unwrap().is_none());
    }
}
