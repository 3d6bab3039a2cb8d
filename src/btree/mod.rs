// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Ordered B+-tree index layered atop a [`HashStore`](crate::hashstore::HashStore).
//!
//! Every node — leaf or inner — is itself stored as a record in the
//! underlying hash store, under a synthetic key (see [`node`]). The tree's
//! own bookkeeping (root id, first/last leaf, id counters, comparator tag)
//! lives in a metadata record under key `"@"`.
//!
//! ## Architecture
//!
//! ```text
//! BPlusTree
//!   ├── HashStore         (unordered backing store; every node is a record)
//!   ├── NodeCache         (hot/warm LRU, 16 slots by node-id mod 16)
//!   └── Comparator        (lexical | decimal | …, persisted by tag)
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use kivi::btree::BPlusTree;
//! use kivi::config::OpenOptions;
//! use kivi::comparator::LexicalComparator;
//!
//! let mut tree = BPlusTree::open("index.kct", OpenOptions::new(), Box::new(LexicalComparator))?;
//! tree.set(b"page.title", b"hello")?;
//! assert_eq!(tree.get(b"page.title")?, Some(b"hello".to_vec()));
//! # Ok::<(), kivi::error::ReedError>(())
//! ```

pub mod cursor;
pub mod node;

use crate::comparator::{self, Comparator, TAG_CUSTOM};
use crate::config::OpenOptions;
use crate::error::{ReedError, ReedResult};
use crate::hashstore::{HashStore, VisitDecision, Visitor};
use crate::nodecache::{CachedNode, NodeCache};
use node::{inner_key, is_inner_id, leaf_key, InnerLink, InnerNode, LeafEntry, LeafNode, HEIR_BASE};
use std::cmp::Ordering;
use std::path::Path;

/// Inner nodes split once their link count exceeds this.
const INLINKMIN: usize = 8;
const META_KEY: &[u8] = b"@";
const META_SENTINEL: &[u8; 8] = b"\n Boofy!";

struct Metadata {
    comparator_tag: u8,
    psiz: u64,
    root: u64,
    first_leaf: u64,
    last_leaf: u64,
    lcnt: u64,
    icnt: u64,
    count: u64,
    bnum: u64,
}

impl Metadata {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 * 8 + 8);
        buf.push(self.comparator_tag);
        buf.resize(8, 0);
        buf.extend_from_slice(&self.psiz.to_be_bytes());
        buf.extend_from_slice(&self.root.to_be_bytes());
        buf.extend_from_slice(&self.first_leaf.to_be_bytes());
        buf.extend_from_slice(&self.last_leaf.to_be_bytes());
        buf.extend_from_slice(&self.lcnt.to_be_bytes());
        buf.extend_from_slice(&self.icnt.to_be_bytes());
        buf.extend_from_slice(&self.count.to_be_bytes());
        buf.extend_from_slice(&self.bnum.to_be_bytes());
        buf.extend_from_slice(META_SENTINEL);
        buf
    }

    fn decode(buf: &[u8]) -> ReedResult<Self> {
        if buf.len() < 8 + 64 + 8 || &buf[buf.len() - 8..] != META_SENTINEL {
            return Err(ReedError::broken("btree metadata record malformed"));
        }
        let comparator_tag = buf[0];
        let mut off = 8;
        let mut next_u64 = || {
            let v = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
            off += 8;
            v
        };
        Ok(Self {
            comparator_tag,
            psiz: next_u64(),
            root: next_u64(),
            first_leaf: next_u64(),
            last_leaf: next_u64(),
            lcnt: next_u64(),
            icnt: next_u64(),
            count: next_u64(),
            bnum: next_u64(),
        })
    }
}

/// Ordered index built of leaf/inner nodes stored as records in a `HashStore`.
pub struct BPlusTree {
    store: HashStore,
    cache: NodeCache,
    comparator: Box<dyn Comparator>,
    psiz: u64,
    root: u64,
    first_leaf: u64,
    last_leaf: u64,
    lcnt: u64,
    icnt: u64,
    count: u64,
}

impl BPlusTree {
    pub fn open(path: impl AsRef<Path>, opts: OpenOptions, comparator: Box<dyn Comparator>) -> ReedResult<Self> {
        let psiz = opts.page_size;
        let cache_capacity = opts.cache_capacity as usize;
        let bnum = opts.bucket_count;
        let mut store = HashStore::open(path, opts)?;

        let (comparator, root, first_leaf, last_leaf, lcnt, icnt, count) = match store.get(META_KEY)? {
            Some(raw) => {
                let meta = Metadata::decode(&raw)?;
                let comparator = if meta.comparator_tag == TAG_CUSTOM {
                    comparator
                } else {
                    comparator::from_tag(meta.comparator_tag)
                        .ok_or_else(|| ReedError::broken("unknown persisted comparator tag"))?
                };
                (comparator, meta.root, meta.first_leaf, meta.last_leaf, meta.lcnt, meta.icnt, meta.count)
            }
            None => (comparator, 0, 0, 0, 1, HEIR_BASE + 1, 0),
        };

        let mut tree = Self {
            store,
            cache: NodeCache::new(cache_capacity),
            comparator,
            psiz,
            root,
            first_leaf,
            last_leaf,
            lcnt,
            icnt,
            count,
        };
        tree.save_meta(bnum)?;
        Ok(tree)
    }

    pub fn close(mut self) -> ReedResult<()> {
        self.flush_cache()?;
        self.store.close()
    }

    /// Writes back any dirty cached node, used at `close` so nothing cached
    /// but never re-persisted is lost. Write-through means this is normally
    /// a no-op; it exists to cover the seam documented in [`NodeCache`].
    fn flush_cache(&mut self) -> ReedResult<()> {
        let cache = &mut self.cache;
        let store = &mut self.store;
        let mut err = None;
        cache.flush_all(|node| {
            if err.is_some() {
                return;
            }
            let result = match node {
                CachedNode::Leaf(l) => store.set(&leaf_key(l.id), &l.encode()),
                CachedNode::Inner(i) => store.set(&inner_key(i.id), &i.encode()),
            };
            if let Err(e) = result {
                err = Some(e);
            }
        });
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Enforces the cache's `pccap` byte budget, writing back any dirty
    /// evicted node first. Write-through means nodes reach here clean, so
    /// eviction here is almost always a pure size-trim with no I/O.
    fn evict_cache_if_needed(&mut self) -> ReedResult<()> {
        let cache = &mut self.cache;
        let store = &mut self.store;
        let mut err = None;
        cache.evict_over_budget(|node| {
            if err.is_some() {
                return;
            }
            let result = match node {
                CachedNode::Leaf(l) => store.set(&leaf_key(l.id), &l.encode()),
                CachedNode::Inner(i) => store.set(&inner_key(i.id), &i.encode()),
            };
            if let Err(e) = result {
                err = Some(e);
            }
        });
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    fn save_meta(&mut self, bnum: u64) -> ReedResult<()> {
        let meta = Metadata {
            comparator_tag: self.comparator.tag(),
            psiz: self.psiz,
            root: self.root,
            first_leaf: self.first_leaf,
            last_leaf: self.last_leaf,
            lcnt: self.lcnt,
            icnt: self.icnt,
            count: self.count,
            bnum,
        };
        self.store.set(META_KEY, &meta.encode())
    }

    fn touch_meta(&mut self) -> ReedResult<()> {
        // `bnum` only matters at creation; subsequent saves just reuse the
        // last-stored value via a no-op re-read would be wasteful, so we
        // accept 0 here — it is informational only, never consulted at load.
        self.save_meta(0)
    }

    // --- node I/O (cache-through) -----------------------------------------

    fn load_leaf(&mut self, id: u64) -> ReedResult<LeafNode> {
        if let Some(CachedNode::Leaf(l)) = self.cache.get(id) {
            return Ok(l);
        }
        let raw = self
            .store
            .get(&leaf_key(id))?
            .ok_or_else(|| ReedError::broken(format!("missing leaf node {id}")))?;
        let leaf = LeafNode::decode(id, &raw)?;
        self.cache.insert_warm(CachedNode::Leaf(leaf.clone()));
        self.evict_cache_if_needed()?;
        Ok(leaf)
    }

    fn load_inner(&mut self, id: u64) -> ReedResult<InnerNode> {
        if let Some(CachedNode::Inner(i)) = self.cache.get(id) {
            return Ok(i);
        }
        let raw = self
            .store
            .get(&inner_key(id))?
            .ok_or_else(|| ReedError::broken(format!("missing inner node {id}")))?;
        let inner = InnerNode::decode(id, &raw)?;
        self.cache.insert_warm(CachedNode::Inner(inner.clone()));
        self.evict_cache_if_needed()?;
        Ok(inner)
    }

    /// Write-through: persists immediately and refreshes the cache entry.
    /// (The cache's dirty/evict-writeback path in [`NodeCache`] exists for
    /// the general case but is never exercised here since nothing is left
    /// dirty after this call.)
    fn persist_leaf(&mut self, leaf: &LeafNode) -> ReedResult<()> {
        let mut leaf = leaf.clone();
        self.store.set(&leaf_key(leaf.id), &leaf.encode())?;
        leaf.dirty = false;
        self.cache.update(CachedNode::Leaf(leaf));
        Ok(())
    }

    fn persist_inner(&mut self, inner: &InnerNode) -> ReedResult<()> {
        let mut inner = inner.clone();
        self.store.set(&inner_key(inner.id), &inner.encode())?;
        inner.dirty = false;
        self.cache.update(CachedNode::Inner(inner));
        Ok(())
    }

    fn delete_leaf_record(&mut self, id: u64) -> ReedResult<()> {
        let _ = self.store.remove(&leaf_key(id));
        self.cache.invalidate(id);
        Ok(())
    }

    fn delete_inner_record(&mut self, id: u64) -> ReedResult<()> {
        let _ = self.store.remove(&inner_key(id));
        self.cache.invalidate(id);
        Ok(())
    }

    // --- search --------------------------------------------------------

    /// Descends from the root to the leaf that would hold `key`, creating
    /// the first leaf if the tree is empty. Returns the leaf id and the
    /// path of inner-node ids visited (root-to-parent order).
    fn find_leaf(&mut self, key: &[u8]) -> ReedResult<(u64, Vec<u64>)> {
        if self.root == 0 {
            let id = self.lcnt;
            self.lcnt += 1;
            let leaf = LeafNode::new(id);
            self.persist_leaf(&leaf)?;
            self.root = id;
            self.first_leaf = id;
            self.last_leaf = id;
            return Ok((id, Vec::new()));
        }
        let mut cur = self.root;
        let mut path = Vec::new();
        while is_inner_id(cur) {
            path.push(cur);
            let inner = self.load_inner(cur)?;
            cur = inner.child_for(key, self.comparator.as_ref());
        }
        Ok((cur, path))
    }

    fn position_in(&self, leaf: &LeafNode, key: &[u8]) -> (usize, bool) {
        let pos = leaf
            .entries
            .partition_point(|e| self.comparator.compare(&e.key, key) == Ordering::Less);
        let found = pos < leaf.entries.len() && self.comparator.compare(&leaf.entries[pos].key, key) == Ordering::Equal;
        (pos, found)
    }

    // --- point operations --------------------------------------------------

    pub fn get(&mut self, key: &[u8]) -> ReedResult<Option<Vec<u8>>> {
        struct Getter {
            found: Option<Vec<u8>>,
        }
        impl Visitor for Getter {
            fn visit_full(&mut self, _key: &[u8], value: &[u8]) -> VisitDecision {
                self.found = Some(value.to_vec());
                VisitDecision::Nop
            }
        }
        let mut getter = Getter { found: None };
        self.accept(key, &mut getter, false)?;
        Ok(getter.found)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> ReedResult<()> {
        struct Setter {
            value: Vec<u8>,
        }
        impl Visitor for Setter {
            fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> VisitDecision {
                VisitDecision::Replace(std::mem::take(&mut self.value))
            }
            fn visit_empty(&mut self, _key: &[u8]) -> VisitDecision {
                VisitDecision::Replace(std::mem::take(&mut self.value))
            }
        }
        let mut setter = Setter { value: value.to_vec() };
        self.accept(key, &mut setter, true)
    }

    pub fn remove(&mut self, key: &[u8]) -> ReedResult<()> {
        struct Remover {
            existed: bool,
        }
        impl Visitor for Remover {
            fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> VisitDecision {
                self.existed = true;
                VisitDecision::Remove
            }
        }
        let mut remover = Remover { existed: false };
        self.accept(key, &mut remover, true)?;
        if remover.existed {
            Ok(())
        } else {
            Err(ReedError::NoRecord { key: String::from_utf8_lossy(key).to_string() })
        }
    }

    /// Applies `visitor` to `key`'s current state, splitting or collapsing
    /// the host leaf as needed.
    pub fn accept<V: Visitor>(&mut self, key: &[u8], visitor: &mut V, writable: bool) -> ReedResult<()> {
        let (leaf_id, path) = self.find_leaf(key)?;
        let mut leaf = self.load_leaf(leaf_id)?;
        let (pos, found) = self.position_in(&leaf, key);

        if found {
            let decision = visitor.visit_full(key, &leaf.entries[pos].value);
            if !writable {
                return Ok(());
            }
            match decision {
                VisitDecision::Nop => {}
                VisitDecision::Remove => {
                    leaf.entries.remove(pos);
                    self.count = self.count.saturating_sub(1);
                    let is_only_leaf = self.first_leaf == leaf.id && self.last_leaf == leaf.id;
                    if leaf.entries.is_empty() && !is_only_leaf {
                        self.collapse_leaf(leaf, path)?;
                    } else {
                        leaf.dirty = true;
                        self.persist_leaf(&leaf)?;
                    }
                    self.touch_meta()?;
                }
                VisitDecision::Replace(value) => {
                    leaf.entries[pos].value = value;
                    leaf.dirty = true;
                    self.persist_leaf(&leaf)?;
                    self.touch_meta()?;
                }
            }
        } else {
            if !writable {
                return Ok(());
            }
            if let VisitDecision::Replace(value) = visitor.visit_empty(key) {
                leaf.entries.insert(pos, LeafEntry { key: key.to_vec(), value });
                self.count += 1;
                leaf.dirty = true;
                self.persist_leaf(&leaf)?;
                if leaf.byte_size() as u64 > self.psiz && leaf.entries.len() > 1 {
                    self.split_leaf(leaf, path)?;
                }
                self.touch_meta()?;
            }
        }
        Ok(())
    }

    pub fn accept_bulk<V: Visitor>(&mut self, keys: &[Vec<u8>], visitor: &mut V, writable: bool) -> ReedResult<()> {
        for key in keys {
            self.accept(key, visitor, writable)?;
        }
        Ok(())
    }

    // --- split / merge --------------------------------------------------

    fn split_leaf(&mut self, mut leaf: LeafNode, path: Vec<u64>) -> ReedResult<()> {
        let mid = leaf.entries.len() / 2;
        let upper = leaf.entries.split_off(mid);
        let new_id = self.lcnt;
        self.lcnt += 1;
        let mut new_leaf = LeafNode::new(new_id);
        new_leaf.entries = upper;
        new_leaf.prev = leaf.id;
        new_leaf.next = leaf.next;

        if leaf.next != 0 {
            let mut succ = self.load_leaf(leaf.next)?;
            succ.prev = new_id;
            succ.dirty = true;
            self.persist_leaf(&succ)?;
        } else {
            self.last_leaf = new_id;
        }
        leaf.next = new_id;
        leaf.dirty = true;
        self.persist_leaf(&leaf)?;
        self.persist_leaf(&new_leaf)?;

        let sep_key = new_leaf.entries[0].key.clone();
        self.insert_into_parent(path, leaf.id, new_id, sep_key)
    }

    fn insert_into_parent(&mut self, path: Vec<u64>, left_child: u64, new_child: u64, sep_key: Vec<u8>) -> ReedResult<()> {
        if path.is_empty() {
            let new_root_id = self.icnt;
            self.icnt += 1;
            let mut root = InnerNode::new(new_root_id, left_child);
            root.links.push(InnerLink { child: new_child, key: sep_key });
            self.persist_inner(&root)?;
            self.root = new_root_id;
            return Ok(());
        }
        let parent_id = *path.last().unwrap();
        let mut parent = self.load_inner(parent_id)?;
        let pos = parent
            .links
            .partition_point(|l| self.comparator.compare(&l.key, &sep_key) != Ordering::Greater);
        parent.links.insert(pos, InnerLink { child: new_child, key: sep_key });
        parent.dirty = true;
        self.persist_inner(&parent)?;

        if parent.byte_size() as u64 > self.psiz && parent.links.len() > INLINKMIN {
            self.split_inner(parent, path[..path.len() - 1].to_vec())?;
        }
        Ok(())
    }

    fn split_inner(&mut self, mut parent: InnerNode, parent_path: Vec<u64>) -> ReedResult<()> {
        let mid = parent.links.len() / 2;
        let promote = parent.links[mid].key.clone();
        let new_heir = parent.links[mid].child;
        let upper = parent.links.split_off(mid + 1);
        parent.links.truncate(mid);
        parent.dirty = true;

        let new_id = self.icnt;
        self.icnt += 1;
        let mut new_inner = InnerNode::new(new_id, new_heir);
        new_inner.links = upper;

        self.persist_inner(&parent)?;
        self.persist_inner(&new_inner)?;
        self.insert_into_parent(parent_path, parent.id, new_id, promote)
    }

    fn collapse_leaf(&mut self, leaf: LeafNode, path: Vec<u64>) -> ReedResult<()> {
        if leaf.prev != 0 {
            let mut p = self.load_leaf(leaf.prev)?;
            p.next = leaf.next;
            p.dirty = true;
            self.persist_leaf(&p)?;
        } else {
            self.first_leaf = leaf.next;
        }
        if leaf.next != 0 {
            let mut n = self.load_leaf(leaf.next)?;
            n.prev = leaf.prev;
            n.dirty = true;
            self.persist_leaf(&n)?;
        } else {
            self.last_leaf = leaf.prev;
        }
        self.delete_leaf_record(leaf.id)?;
        self.remove_link_from_parent(leaf.id, path)
    }

    fn remove_link_from_parent(&mut self, child_id: u64, path: Vec<u64>) -> ReedResult<()> {
        let Some(&parent_id) = path.last() else {
            self.root = 0;
            return Ok(());
        };
        let mut parent = self.load_inner(parent_id)?;
        if parent.heir == child_id {
            if parent.links.is_empty() {
                self.delete_inner_record(parent.id)?;
                return self.remove_link_from_parent(parent.id, path[..path.len() - 1].to_vec());
            }
            let first = parent.links.remove(0);
            parent.heir = first.child;
        } else if let Some(pos) = parent.links.iter().position(|l| l.child == child_id) {
            parent.links.remove(pos);
        }
        parent.dirty = true;

        if parent.id == self.root && parent.links.is_empty() {
            self.root = parent.heir;
            self.delete_inner_record(parent.id)?;
            return Ok(());
        }
        self.persist_inner(&parent)
    }

    // --- ordered traversal ------------------------------------------------

    /// Visits every live entry in key order, front leaf to back leaf.
    pub fn iterate<V: Visitor>(&mut self, visitor: &mut V, writable: bool) -> ReedResult<()> {
        let mut cur = self.first_leaf;
        while cur != 0 {
            let mut leaf = self.load_leaf(cur)?;
            let mut i = 0;
            let mut changed = false;
            while i < leaf.entries.len() {
                let decision = visitor.visit_full(&leaf.entries[i].key, &leaf.entries[i].value);
                if writable {
                    match decision {
                        VisitDecision::Nop => i += 1,
                        VisitDecision::Remove => {
                            leaf.entries.remove(i);
                            self.count = self.count.saturating_sub(1);
                            changed = true;
                        }
                        VisitDecision::Replace(value) => {
                            leaf.entries[i].value = value;
                            changed = true;
                            i += 1;
                        }
                    }
                } else {
                    i += 1;
                }
            }
            let next = leaf.next;
            if writable && changed {
                leaf.dirty = true;
                self.persist_leaf(&leaf)?;
            }
            cur = next;
        }
        if writable {
            self.touch_meta()?;
        }
        Ok(())
    }

    /// Ordered traversal is inherently sequential (bound by the leaf chain),
    /// so this walks the same path `iterate` does; `thnum` is accepted for
    /// interface parity with the hash layer's byte-range scan, which is
    /// where real cross-thread fan-out applies.
    pub fn scan_parallel<F>(&mut self, _thnum: usize, visit: F) -> ReedResult<()>
    where
        F: Fn(&[u8], &[u8]),
    {
        struct Adapter<F>(F);
        impl<F: Fn(&[u8], &[u8])> Visitor for Adapter<F> {
            fn visit_full(&mut self, key: &[u8], value: &[u8]) -> VisitDecision {
                (self.0)(key, value);
                VisitDecision::Nop
            }
        }
        let mut adapter = Adapter(visit);
        self.iterate(&mut adapter, false)
    }
}
