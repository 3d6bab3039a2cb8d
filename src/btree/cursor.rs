// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Forward/backward cursor over a [`BPlusTree`]'s ordered key space.
//!
//! Holds only `{current-key-copy, last-visited-leaf-id}` rather than a raw
//! pointer into a cached node, so a cache eviction or concurrent split never
//! leaves it dangling: if the remembered leaf no longer hosts the expected
//! key, `step`/`step_back` fall back to a fresh `jump`/`jump_back`.

use super::BPlusTree;
use crate::error::ReedResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

pub struct Cursor {
    current_key: Option<Vec<u8>>,
    last_leaf: u64,
    direction: Direction,
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}

impl Cursor {
    pub fn new() -> Self {
        Self { current_key: None, last_leaf: 0, direction: Direction::Forward }
    }

    pub fn current_key(&self) -> Option<&[u8]> {
        self.current_key.as_deref()
    }

    /// Positions on the first key `>= key`.
    pub fn jump(&mut self, tree: &mut BPlusTree, key: &[u8]) -> ReedResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.direction = Direction::Forward;
        let (leaf_id, _) = tree.find_leaf(key)?;
        let leaf = tree.load_leaf(leaf_id)?;
        let (pos, _) = tree.position_in(&leaf, key);
        if pos < leaf.entries.len() {
            self.last_leaf = leaf_id;
            let e = &leaf.entries[pos];
            self.current_key = Some(e.key.clone());
            return Ok(Some((e.key.clone(), e.value.clone())));
        }
        self.settle_forward_from_empty_tail(tree, leaf.next)
    }

    /// Positions on the last key `<= key`.
    pub fn jump_back(&mut self, tree: &mut BPlusTree, key: &[u8]) -> ReedResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.direction = Direction::Backward;
        let (leaf_id, _) = tree.find_leaf(key)?;
        let leaf = tree.load_leaf(leaf_id)?;
        let (pos, found) = tree.position_in(&leaf, key);
        let idx = if found { Some(pos) } else if pos > 0 { Some(pos - 1) } else { None };
        if let Some(idx) = idx {
            self.last_leaf = leaf_id;
            let e = &leaf.entries[idx];
            self.current_key = Some(e.key.clone());
            return Ok(Some((e.key.clone(), e.value.clone())));
        }
        self.settle_backward_from_empty_head(tree, leaf.prev)
    }

    fn settle_forward_from_empty_tail(&mut self, tree: &mut BPlusTree, mut next: u64) -> ReedResult<Option<(Vec<u8>, Vec<u8>)>> {
        while next != 0 {
            let leaf = tree.load_leaf(next)?;
            if let Some(e) = leaf.entries.first() {
                self.last_leaf = next;
                self.current_key = Some(e.key.clone());
                return Ok(Some((e.key.clone(), e.value.clone())));
            }
            next = leaf.next;
        }
        self.current_key = None;
        Ok(None)
    }

    fn settle_backward_from_empty_head(&mut self, tree: &mut BPlusTree, mut prev: u64) -> ReedResult<Option<(Vec<u8>, Vec<u8>)>> {
        while prev != 0 {
            let leaf = tree.load_leaf(prev)?;
            if let Some(e) = leaf.entries.last() {
                self.last_leaf = prev;
                self.current_key = Some(e.key.clone());
                return Ok(Some((e.key.clone(), e.value.clone())));
            }
            prev = leaf.prev;
        }
        self.current_key = None;
        Ok(None)
    }

    /// Advances to the next key in order.
    pub fn step(&mut self, tree: &mut BPlusTree) -> ReedResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.direction = Direction::Forward;
        let key = match self.current_key.clone() {
            Some(k) => k,
            None => return Ok(None),
        };
        let leaf = tree.load_leaf(self.last_leaf)?;
        let pos = match leaf.entries.iter().position(|e| e.key == key) {
            Some(p) => p,
            None => return self.jump(tree, &key), // stale leaf: re-search
        };
        if pos + 1 < leaf.entries.len() {
            let e = &leaf.entries[pos + 1];
            self.current_key = Some(e.key.clone());
            return Ok(Some((e.key.clone(), e.value.clone())));
        }
        self.settle_forward_from_empty_tail(tree, leaf.next)
    }

    /// Moves to the previous key in order.
    pub fn step_back(&mut self, tree: &mut BPlusTree) -> ReedResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.direction = Direction::Backward;
        let key = match self.current_key.clone() {
            Some(k) => k,
            None => return Ok(None),
        };
        let leaf = tree.load_leaf(self.last_leaf)?;
        let pos = match leaf.entries.iter().position(|e| e.key == key) {
            Some(p) => p,
            None => return self.jump_back(tree, &key),
        };
        if pos > 0 {
            let e = &leaf.entries[pos - 1];
            self.current_key = Some(e.key.clone());
            return Ok(Some((e.key.clone(), e.value.clone())));
        }
        self.settle_backward_from_empty_head(tree, leaf.prev)
    }

    pub fn direction(&self) -> &'static str {
        match self.direction {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::LexicalComparator;
    use crate::config::OpenOptions;
    use tempfile::TempDir;

    fn tree_with(keys: &[&str]) -> (TempDir, BPlusTree) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cur.kct");
        let mut tree = BPlusTree::open(&path, OpenOptions::new().bucket_count(31).page_size(256), Box::new(LexicalComparator)).unwrap();
        for k in keys {
            tree.set(k.as_bytes(), b"v").unwrap();
        }
        (dir, tree)
    }

    #[test]
    fn jump_then_step_walks_in_order() {
        let (_dir, mut tree) = tree_with(&["b", "d", "a", "c"]);
        let mut cursor = Cursor::new();
        let first = cursor.jump(&mut tree, b"").unwrap().unwrap();
        assert_eq!(first.0, b"a");
        let second = cursor.step(&mut tree).unwrap().unwrap();
        assert_eq!(second.0, b"b");
        let third = cursor.step(&mut tree).unwrap().unwrap();
        assert_eq!(third.0, b"c");
    }

    #[test]
    fn step_past_end_returns_none() {
        let (_dir, mut tree) = tree_with(&["a"]);
        let mut cursor = Cursor::new();
        cursor.jump(&mut tree, b"a").unwrap();
        assert!(cursor.step(&mut tree).unwrap().is_none());
    }

    #[test]
    fn jump_back_finds_floor_key() {
        let (_dir, mut tree) = tree_with(&["a", "c", "e"]);
        let mut cursor = Cursor::new();
        let found = cursor.jump_back(&mut tree, b"d").unwrap().unwrap();
        assert_eq!(found.0, b"c");
    }

    #[test]
    fn step_back_from_last_walks_down() {
        let (_dir, mut tree) = tree_with(&["a", "b", "c"]);
        let mut cursor = Cursor::new();
        cursor.jump_back(&mut tree, b"z").unwrap();
        let prev = cursor.step_back(&mut tree).unwrap().unwrap();
        assert_eq!(prev.0, b"b");
    }
}
