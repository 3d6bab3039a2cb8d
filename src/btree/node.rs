// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Leaf and inner node payloads, serialised as ordinary hash-store records
//! under synthetic keys (`"L" + hex(id)` / `"I" + hex(id - HEIR_BASE)`).
//!
//! A node's on-disk value is a varint-framed list; the in-memory struct
//! keeps it decoded and sorted so the tree layer can binary-search it.

use crate::error::{ReedError, ReedResult};
use crate::varint::{read_varnum, write_varnum};

/// First inner-node ID; keeps leaf and inner ID spaces disjoint without a
/// tag byte, so a bare `u64` suffices as the universal node identifier.
pub const HEIR_BASE: u64 = 1u64 << 48;

pub fn is_inner_id(id: u64) -> bool {
    id >= HEIR_BASE
}

pub fn leaf_key(id: u64) -> Vec<u8> {
    let mut k = b"L".to_vec();
    k.extend_from_slice(format!("{id:016x}").as_bytes());
    k
}

pub fn inner_key(id: u64) -> Vec<u8> {
    let mut k = b"I".to_vec();
    k.extend_from_slice(format!("{:016x}", id - HEIR_BASE).as_bytes());
    k
}

/// A single key/value entry inside a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct LeafNode {
    pub id: u64,
    pub prev: u64,
    pub next: u64,
    pub entries: Vec<LeafEntry>,
    pub hot: bool,
    pub dirty: bool,
}

impl LeafNode {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            prev: 0,
            next: 0,
            entries: Vec::new(),
            hot: false,
            dirty: true,
        }
    }

    /// Byte size of the serialised form, used against `psiz` for split decisions.
    pub fn byte_size(&self) -> usize {
        let mut n = crate::varint::size_varnum(self.prev) + crate::varint::size_varnum(self.next);
        for e in &self.entries {
            n += crate::varint::size_varnum(e.key.len() as u64)
                + crate::varint::size_varnum(e.value.len() as u64)
                + e.key.len()
                + e.value.len();
        }
        n
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_size());
        write_varnum(&mut buf, self.prev);
        write_varnum(&mut buf, self.next);
        for e in &self.entries {
            write_varnum(&mut buf, e.key.len() as u64);
            write_varnum(&mut buf, e.value.len() as u64);
            buf.extend_from_slice(&e.key);
            buf.extend_from_slice(&e.value);
        }
        buf
    }

    pub fn decode(id: u64, buf: &[u8]) -> ReedResult<Self> {
        let mut pos = 0;
        let (prev, n) = read_varnum(buf).ok_or_else(|| ReedError::broken("leaf: bad prev varint"))?;
        pos += n;
        let (next, n) = read_varnum(&buf[pos..]).ok_or_else(|| ReedError::broken("leaf: bad next varint"))?;
        pos += n;
        let mut entries = Vec::new();
        while pos < buf.len() {
            let (ksiz, n) = read_varnum(&buf[pos..]).ok_or_else(|| ReedError::broken("leaf: bad ksiz"))?;
            pos += n;
            let (vsiz, n) = read_varnum(&buf[pos..]).ok_or_else(|| ReedError::broken("leaf: bad vsiz"))?;
            pos += n;
            let ksiz = ksiz as usize;
            let vsiz = vsiz as usize;
            let key = buf[pos..pos + ksiz].to_vec();
            pos += ksiz;
            let value = buf[pos..pos + vsiz].to_vec();
            pos += vsiz;
            entries.push(LeafEntry { key, value });
        }
        Ok(Self {
            id,
            prev,
            next,
            entries,
            hot: false,
            dirty: false,
        })
    }
}

/// A separator link inside an inner node: every key under `child` is
/// `>= key` (and `< ` the next link's key, or unbounded for the last link).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerLink {
    pub child: u64,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InnerNode {
    pub id: u64,
    /// The leftmost child, preceding every link.
    pub heir: u64,
    pub links: Vec<InnerLink>,
    pub dirty: bool,
}

impl InnerNode {
    pub fn new(id: u64, heir: u64) -> Self {
        Self {
            id,
            heir,
            links: Vec::new(),
            dirty: true,
        }
    }

    pub fn byte_size(&self) -> usize {
        let mut n = crate::varint::size_varnum(self.heir);
        for l in &self.links {
            n += crate::varint::size_varnum(l.child) + crate::varint::size_varnum(l.key.len() as u64) + l.key.len();
        }
        n
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_size());
        write_varnum(&mut buf, self.heir);
        for l in &self.links {
            write_varnum(&mut buf, l.child);
            write_varnum(&mut buf, l.key.len() as u64);
            buf.extend_from_slice(&l.key);
        }
        buf
    }

    pub fn decode(id: u64, buf: &[u8]) -> ReedResult<Self> {
        let (heir, mut pos) = read_varnum(buf).ok_or_else(|| ReedError::broken("inner: bad heir varint"))?;
        let mut links = Vec::new();
        while pos < buf.len() {
            let (child, n) = read_varnum(&buf[pos..]).ok_or_else(|| ReedError::broken("inner: bad child"))?;
            pos += n;
            let (ksiz, n) = read_varnum(&buf[pos..]).ok_or_else(|| ReedError::broken("inner: bad ksiz"))?;
            pos += n;
            let ksiz = ksiz as usize;
            let key = buf[pos..pos + ksiz].to_vec();
            pos += ksiz;
            links.push(InnerLink { child, key });
        }
        Ok(Self {
            id,
            heir,
            links,
            dirty: false,
        })
    }

    /// Finds the child to descend into for `key` under `cmp`: `upper_bound`
    /// on the links, descending via `heir` if the first link already
    /// compares greater than `key`.
    pub fn child_for(&self, key: &[u8], cmp: &dyn crate::comparator::Comparator) -> u64 {
        let mut chosen = self.heir;
        for link in &self.links {
            if cmp.compare(&link.key, key) == std::cmp::Ordering::Greater {
                break;
            }
            chosen = link.child;
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trip() {
        let mut leaf = LeafNode::new(1);
        leaf.prev = 4;
        leaf.next = 9;
        leaf.entries.push(LeafEntry { key: b"a".to_vec(), value: b"1".to_vec() });
        leaf.entries.push(LeafEntry { key: b"b".to_vec(), value: b"22".to_vec() });
        let encoded = leaf.encode();
        let decoded = LeafNode::decode(1, &encoded).unwrap();
        assert_eq!(decoded.prev, 4);
        assert_eq!(decoded.next, 9);
        assert_eq!(decoded.entries, leaf.entries);
    }

    #[test]
    fn inner_round_trip() {
        let mut inner = InnerNode::new(HEIR_BASE + 1, 10);
        inner.links.push(InnerLink { child: 20, key: b"m".to_vec() });
        inner.links.push(InnerLink { child: 30, key: b"z".to_vec() });
        let encoded = inner.encode();
        let decoded = InnerNode::decode(HEIR_BASE + 1, &encoded).unwrap();
        assert_eq!(decoded.heir, 10);
        assert_eq!(decoded.links, inner.links);
    }

    #[test]
    fn leaf_key_and_inner_key_are_disjoint_namespaces() {
        assert!(leaf_key(1).starts_with(b"L"));
        assert!(inner_key(HEIR_BASE + 1).starts_with(b"I"));
    }

    #[test]
    fn is_inner_id_distinguishes_spaces() {
        assert!(!is_inner_id(42));
        assert!(is_inner_id(HEIR_BASE + 1));
    }
}
