// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! File abstraction: a single open file backed by a memory-mapped prefix
//! window plus positional I/O for bytes beyond the window.
//!
//! Bytes within `[0, msiz)` are read/written via the mmap; bytes at or
//! beyond `msiz` fall through to `pread`/`pwrite`-equivalent positional
//! calls. The append path always goes through the file directly (never the
//! mmap) and is serialised by `alock` so concurrent appenders never race on
//! the logical end of the file.

use crate::concurrent::lock::{AdvisoryLock, LockMode};
use crate::error::{ReedError, ReedResult};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default size of the memory-mapped prefix window (64 MiB).
pub const DEFAULT_MMAP_SIZE: u64 = 64 * 1024 * 1024;

/// Open-mode flags, mirroring the external file-abstraction contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub writer: bool,
    pub create: bool,
    pub truncate: bool,
    pub no_lock: bool,
    pub try_lock: bool,
}

/// A single-file storage backend: mmap prefix window + positional I/O tail.
pub struct FileIo {
    path: PathBuf,
    file: File,
    mmap: Option<MmapMut>,
    mmap_size: u64,
    writer: bool,
    lock: Option<AdvisoryLock>,
    /// Serialises append-at-end-of-file operations (`alock`).
    append_lock: Mutex<()>,
    recovered: bool,
}

impl FileIo {
    /// Opens (or creates) the file at `path` under `flags`, mapping the
    /// first `mmap_size` bytes.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags, mmap_size: u64) -> ReedResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut opts = OpenOptions::new();
        opts.read(true).write(flags.writer).create(flags.create);
        if flags.truncate {
            opts.truncate(true);
        }
        let file = opts
            .open(&path)
            .map_err(|e| ReedError::io(format!("open {}", path.display()), e))?;

        let lock = if flags.no_lock {
            None
        } else {
            let mode = if flags.writer {
                LockMode::Exclusive
            } else {
                LockMode::Shared
            };
            Some(AdvisoryLock::try_acquire(&file, mode)?)
        };

        let len = file
            .metadata()
            .map_err(|e| ReedError::io("stat", e))?
            .len();
        let map_len = mmap_size.min(len.max(1));
        let mmap = if flags.writer {
            if len == 0 {
                None
            } else {
                Some(unsafe {
                    MmapOptions::new()
                        .len(map_len as usize)
                        .map_mut(&file)
                        .map_err(|e| ReedError::io("mmap", e))?
                })
            }
        } else {
            None
        };

        Ok(Self {
            path,
            file,
            mmap,
            mmap_size,
            writer: flags.writer,
            lock,
            append_lock: Mutex::new(()),
            recovered: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mark_recovered(&mut self) {
        self.recovered = true;
    }

    pub fn recovered(&self) -> bool {
        self.recovered
    }

    pub fn size(&self) -> ReedResult<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| ReedError::io("stat", e))?
            .len())
    }

    /// Remaps the mmap window after the file has grown or been truncated.
    pub fn refresh(&mut self) -> ReedResult<()> {
        let len = self.size()?;
        if !self.writer || len == 0 {
            self.mmap = None;
            return Ok(());
        }
        let map_len = self.mmap_size.min(len) as usize;
        self.mmap = Some(unsafe {
            MmapOptions::new()
                .len(map_len)
                .map_mut(&self.file)
                .map_err(|e| ReedError::io("remap", e))?
        });
        Ok(())
    }

    fn within_map(&self, off: u64, size: usize) -> bool {
        match &self.mmap {
            Some(m) => off + size as u64 <= m.len() as u64,
            None => false,
        }
    }

    /// Reads `size` bytes starting at `off`.
    pub fn read(&self, off: u64, size: usize) -> ReedResult<Vec<u8>> {
        if self.within_map(off, size) {
            let m = self.mmap.as_ref().unwrap();
            Ok(m[off as usize..off as usize + size].to_vec())
        } else {
            let mut buf = vec![0u8; size];
            let mut file = self.file.try_clone().map_err(|e| ReedError::io("clone fd", e))?;
            file.seek(SeekFrom::Start(off))
                .map_err(|e| ReedError::io("seek", e))?;
            file.read_exact(&mut buf)
                .map_err(|e| ReedError::io("pread", e))?;
            Ok(buf)
        }
    }

    /// Writes `data` at `off`, extending the mmap's backing file if needed
    /// but never growing the logical file size implicitly — callers manage
    /// that via `truncate`/`append`.
    pub fn write(&mut self, off: u64, data: &[u8]) -> ReedResult<()> {
        if self.within_map(off, data.len()) {
            let m = self.mmap.as_mut().unwrap();
            m[off as usize..off as usize + data.len()].copy_from_slice(data);
            Ok(())
        } else {
            let mut file = self.file.try_clone().map_err(|e| ReedError::io("clone fd", e))?;
            file.seek(SeekFrom::Start(off))
                .map_err(|e| ReedError::io("seek", e))?;
            file.write_all(data).map_err(|e| ReedError::io("pwrite", e))?;
            Ok(())
        }
    }

    /// Appends `data` at the current logical end of file, returning the
    /// offset it was written at. Serialised by the append lock so
    /// concurrent appenders never compute the same offset.
    pub fn append(&mut self, data: &[u8]) -> ReedResult<u64> {
        let _guard = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());
        let off = self.size()?;
        self.file
            .seek(SeekFrom::End(0))
            .map_err(|e| ReedError::io("seek end", e))?;
        self.file
            .write_all(data)
            .map_err(|e| ReedError::io("append", e))?;
        Ok(off)
    }

    pub fn truncate(&mut self, size: u64) -> ReedResult<()> {
        self.file
            .set_len(size)
            .map_err(|e| ReedError::io("truncate", e))?;
        self.refresh()
    }

    pub fn synchronize(&self, hard: bool) -> ReedResult<()> {
        if let Some(m) = &self.mmap {
            m.flush().map_err(|e| ReedError::io("msync", e))?;
        }
        if hard {
            self.file.sync_all().map_err(|e| ReedError::io("fsync", e))?;
        } else {
            self.file.sync_data().map_err(|e| ReedError::io("fdatasync", e))?;
        }
        Ok(())
    }

    pub fn close(self) -> ReedResult<()> {
        if let Some(lock) = self.lock {
            lock.release(&self.file)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn flags() -> OpenFlags {
        OpenFlags {
            writer: true,
            create: true,
            truncate: false,
            no_lock: false,
            try_lock: false,
        }
    }

    #[test]
    fn write_read_round_trip_within_map() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.kc");
        let mut io = FileIo::open(&path, flags(), DEFAULT_MMAP_SIZE).unwrap();
        io.truncate(4096).unwrap();
        io.write(100, b"hello").unwrap();
        assert_eq!(io.read(100, 5).unwrap(), b"hello");
    }

    #[test]
    fn append_extends_file_and_returns_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.kc");
        let mut io = FileIo::open(&path, flags(), DEFAULT_MMAP_SIZE).unwrap();
        let off1 = io.append(b"abc").unwrap();
        let off2 = io.append(b"defg").unwrap();
        assert_eq!(off1, 0);
        assert_eq!(off2, 3);
        assert_eq!(io.size().unwrap(), 7);
    }

    #[test]
    fn write_beyond_map_falls_through_to_positional_io() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.kc");
        let mut io = FileIo::open(&path, flags(), 16).unwrap();
        io.truncate(4096).unwrap();
        io.write(1000, b"tail-bytes").unwrap();
        assert_eq!(io.read(1000, 10).unwrap(), b"tail-bytes");
    }

    #[test]
    fn second_exclusive_open_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.kc");
        let _first = FileIo::open(&path, flags(), DEFAULT_MMAP_SIZE).unwrap();
        let second = FileIo::open(&path, flags(), DEFAULT_MMAP_SIZE);
        assert!(second.is_err());
    }
}
