// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use tracing::trace;

use super::lib::{ApplyOutcome, Comparator, Direction, SeekBound};
use crate::storage_engine::block_manager::DictionaryFile;
use crate::storage_engine::buffer_manager::{NodeRef, NodeStore};
use crate::storage_engine::file_format::{Node, NodeBody, NodeId, max_payload};
use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult};

/// Fixed per-entry overhead counted against the entry size limit
const ENTRY_OVERHEAD: usize = 12;

/// Root-to-leaf path of pinned internal nodes and the child index taken in each
type Path<'a> = Vec<(NodeRef<'a>, usize)>;

/// Summary of a structural walk over a tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub nodes: u64,
    pub leaves: u64,
    pub entries: u64,
    /// Levels from root to leaves, counting both
    pub depth: u32,
    /// Newest LSN stamp seen on any node
    pub max_lsn: u64,
}

/// B+ tree of one dictionary, stored as nodes in the shared node store.
///
/// Nodes split by encoded size rather than by a fixed order, since keys and values are arbitrary
/// byte strings. A leaf that becomes empty is unlinked from its parent and a root with a single
/// child collapses into it.
pub struct BPlusTree {
    dictionary: DictionaryId,
    store: Arc<NodeStore>,
    comparator: Comparator,
    /// Structural latch: shared for reads, exclusive for changes
    latch: RwLock<()>,
    /// Encoded size above which a node splits
    split_threshold: usize,
    /// Largest accepted entry including overhead
    max_entry: usize,
}

/// Shared access to a tree
pub struct TreeReader<'a> {
    tree: &'a BPlusTree,
    _latch: RwLockReadGuard<'a, ()>,
}

/// Exclusive access to a tree
pub struct TreeWriter<'a> {
    tree: &'a BPlusTree,
    _latch: RwLockWriteGuard<'a, ()>,
}

impl TreeReader<'_> {
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.tree.lookup(key)
    }

    pub fn seek(&self, bound: SeekBound<'_>, direction: Direction) -> StorageResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.tree.seek(bound, direction)
    }
}

impl TreeWriter<'_> {
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.tree.lookup(key)
    }

    pub fn seek(&self, bound: SeekBound<'_>, direction: Direction) -> StorageResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.tree.seek(bound, direction)
    }

    /// Inserts or replaces `key`. A non-zero `lsn` stamps the leaf and makes the change idempotent.
    pub fn insert(&mut self, key: &[u8], value: &[u8], lsn: u64) -> StorageResult<ApplyOutcome> {
        self.tree.check_entry(key, value)?;
        self.tree.insert(key, value, lsn)
    }

    /// Removes `key`; an absent key yields `Applied { previous: None }`.
    pub fn remove(&mut self, key: &[u8], lsn: u64) -> StorageResult<ApplyOutcome> {
        self.tree.remove(key, lsn)
    }
}

impl BPlusTree {
    pub fn new(dictionary: DictionaryId, store: Arc<NodeStore>, comparator: Comparator) -> Self {
        let payload = max_payload(store.node_size());
        Self { dictionary, store, comparator, latch: RwLock::new(()), split_threshold: payload / 4 * 3, max_entry: payload / 4 }
    }

    pub fn dictionary_id(&self) -> DictionaryId {
        self.dictionary
    }

    pub fn comparator(&self) -> &Comparator {
        &self.comparator
    }

    pub fn read(&self) -> TreeReader<'_> {
        TreeReader { tree: self, _latch: self.latch.read() }
    }

    pub fn write(&self) -> TreeWriter<'_> {
        TreeWriter { tree: self, _latch: self.latch.write() }
    }

    /// Rejects entries too large to share a node with others.
    pub fn check_entry(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let size = ENTRY_OVERHEAD + key.len() + value.len();
        if size > self.max_entry {
            return Err(StorageError::Usage(format!("entry of {} bytes exceeds the limit of {} bytes for dictionary {}", size, self.max_entry, self.dictionary)));
        }
        Ok(())
    }

    fn file(&self) -> StorageResult<Arc<DictionaryFile>> {
        self.store.file(self.dictionary)
    }

    fn corrupt(&self, id: NodeId, what: &str) -> StorageError {
        StorageError::Corruption(format!("node {} of dictionary {}: {}", id, self.dictionary, what))
    }

    fn child_index(&self, pivots: &[Vec<u8>], key: &[u8]) -> usize {
        pivots.partition_point(|pivot| (self.comparator)(pivot, key) != Ordering::Greater)
    }

    fn search(&self, entries: &[(Vec<u8>, Vec<u8>)], key: &[u8]) -> Result<usize, usize> {
        entries.binary_search_by(|(k, _)| (self.comparator)(k, key))
    }

    /// Descends to the leaf responsible for `key`, pinning every node on the way.
    fn descend(&self, key: &[u8]) -> StorageResult<(Path<'_>, NodeRef<'_>)> {
        let mut path = Vec::new();
        let mut current = self.store.fetch(self.dictionary, self.file()?.root())?;
        loop {
            let next = {
                let node = current.read();
                match &node.body {
                    NodeBody::Leaf { .. } => None,
                    NodeBody::Internal { pivots, children } => {
                        let index = self.child_index(pivots, key);
                        let child = children.get(index).copied().ok_or_else(|| self.corrupt(current.id(), "missing child"))?;
                        Some((index, child))
                    }
                }
            };
            let Some((index, child)) = next else {
                return Ok((path, current));
            };
            let child = self.store.fetch(self.dictionary, child)?;
            path.push((current, index));
            current = child;
        }
    }

    fn lookup(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let (_, leaf) = self.descend(key)?;
        let node = leaf.read();
        let NodeBody::Leaf { entries } = &node.body else {
            return Err(self.corrupt(leaf.id(), "expected a leaf"));
        };
        Ok(self.search(entries, key).ok().map(|i| entries[i].1.clone()))
    }

    fn seek(&self, bound: SeekBound<'_>, direction: Direction) -> StorageResult<Option<(Vec<u8>, Vec<u8>)>> {
        let root = self.file()?.root();
        self.seek_in(root, &bound, direction)
    }

    fn seek_in(&self, id: NodeId, bound: &SeekBound<'_>, direction: Direction) -> StorageResult<Option<(Vec<u8>, Vec<u8>)>> {
        let node_ref = self.store.fetch(self.dictionary, id)?;
        let (start, children) = {
            let node = node_ref.read();
            match &node.body {
                NodeBody::Leaf { entries } => {
                    // admitted keys form a suffix going forward and a prefix going backward
                    let found = match direction {
                        Direction::Forward => entries.get(entries.partition_point(|(k, _)| !bound.admits(&self.comparator, k, direction))),
                        Direction::Backward => entries
                            .partition_point(|(k, _)| bound.admits(&self.comparator, k, direction))
                            .checked_sub(1)
                            .and_then(|i| entries.get(i)),
                    };
                    return Ok(found.cloned());
                }
                NodeBody::Internal { pivots, children } => {
                    let start = match bound {
                        SeekBound::Start => match direction {
                            Direction::Forward => 0,
                            Direction::Backward => children.len().saturating_sub(1),
                        },
                        SeekBound::Inclusive(key) | SeekBound::Exclusive(key) => self.child_index(pivots, key),
                    };
                    (start, children.clone())
                }
            }
        };
        drop(node_ref);
        if children.is_empty() {
            return Err(self.corrupt(id, "internal node without children"));
        }

        let order: Box<dyn Iterator<Item = usize>> = match direction {
            Direction::Forward => Box::new(start..children.len()),
            Direction::Backward => Box::new((0..=start.min(children.len().saturating_sub(1))).rev()),
        };
        for index in order {
            if let Some(found) = self.seek_in(children[index], bound, direction)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Inserts into the responsible leaf and splits overfull nodes up to the root.
    ///
    /// Steps:
    /// 1. Descend to the leaf, pinning the path
    /// 2. Skip when the leaf stamp already covers `lsn`
    /// 3. Insert or replace the entry and stamp the leaf
    /// 4. Split the leaf by encoded size and push separators upwards
    fn insert(&self, key: &[u8], value: &[u8], lsn: u64) -> StorageResult<ApplyOutcome> {
        let (path, leaf) = self.descend(key)?;
        if lsn != 0 && leaf.read().lsn >= lsn {
            return Ok(ApplyOutcome::Skipped);
        }
        let (previous, split) = {
            let mut node = self.store.modify(&leaf);
            let NodeBody::Leaf { entries } = &mut node.body else {
                return Err(self.corrupt(leaf.id(), "expected a leaf"));
            };
            let previous = match entries.binary_search_by(|(k, _)| (self.comparator)(k, key)) {
                Ok(i) => Some(std::mem::replace(&mut entries[i].1, value.to_vec())),
                Err(i) => {
                    entries.insert(i, (key.to_vec(), value.to_vec()));
                    None
                }
            };
            node.stamp(lsn);
            let split = if node.estimated_size() > self.split_threshold { split_leaf(&mut node) } else { None };
            (previous, split)
        };
        if let Some((separator, right)) = split {
            self.propagate_split(path, leaf.id(), separator, right, lsn)?;
        }
        Ok(ApplyOutcome::Applied { previous })
    }

    fn propagate_split(&self, mut path: Path<'_>, mut left: NodeId, mut separator: Vec<u8>, mut right: Node, lsn: u64) -> StorageResult<()> {
        loop {
            let right_id = self.store.create(self.dictionary, right)?.id();
            let Some((parent, index)) = path.pop() else {
                let root = self.store.create(self.dictionary, Node::internal(vec![separator], vec![left, right_id], lsn))?;
                self.file()?.set_root(root.id());
                trace!(dictionary = %self.dictionary, root = %root.id(), "tree grew a level");
                return Ok(());
            };
            let mut node = self.store.modify(&parent);
            let NodeBody::Internal { pivots, children } = &mut node.body else {
                return Err(self.corrupt(parent.id(), "expected an internal node"));
            };
            pivots.insert(index, separator);
            children.insert(index + 1, right_id);
            node.stamp(lsn);
            if node.estimated_size() <= self.split_threshold {
                return Ok(());
            }
            let Some((promoted, sibling)) = split_internal(&mut node) else {
                return Ok(());
            };
            drop(node);
            left = parent.id();
            separator = promoted;
            right = sibling;
        }
    }

    fn remove(&self, key: &[u8], lsn: u64) -> StorageResult<ApplyOutcome> {
        let (path, leaf) = self.descend(key)?;
        {
            let node = leaf.read();
            if lsn != 0 && node.lsn >= lsn {
                return Ok(ApplyOutcome::Skipped);
            }
            let NodeBody::Leaf { entries } = &node.body else {
                return Err(self.corrupt(leaf.id(), "expected a leaf"));
            };
            if self.search(entries, key).is_err() {
                return Ok(ApplyOutcome::Applied { previous: None });
            }
        }
        let (previous, now_empty) = {
            let mut node = self.store.modify(&leaf);
            let NodeBody::Leaf { entries } = &mut node.body else {
                return Err(self.corrupt(leaf.id(), "expected a leaf"));
            };
            let Ok(index) = entries.binary_search_by(|(k, _)| (self.comparator)(k, key)) else {
                return Ok(ApplyOutcome::Applied { previous: None });
            };
            let (_, previous) = entries.remove(index);
            let now_empty = entries.is_empty();
            node.stamp(lsn);
            (previous, now_empty)
        };
        if now_empty && !path.is_empty() {
            self.unlink(path, leaf, lsn)?;
        }
        Ok(ApplyOutcome::Applied { previous: Some(previous) })
    }

    /// Frees an empty node and removes it from its ancestors, collapsing the root when it is left
    /// with a single child.
    fn unlink<'s>(&'s self, mut path: Path<'s>, node: NodeRef<'s>, lsn: u64) -> StorageResult<()> {
        let mut victim = node;
        while let Some((parent, index)) = path.pop() {
            self.store.free(victim)?;
            let remaining = {
                let mut guard = self.store.modify(&parent);
                let NodeBody::Internal { pivots, children } = &mut guard.body else {
                    return Err(self.corrupt(parent.id(), "expected an internal node"));
                };
                children.remove(index);
                if !pivots.is_empty() {
                    pivots.remove(index.saturating_sub(1));
                }
                children.len()
            };
            if remaining > 0 {
                if path.is_empty() && remaining == 1 {
                    self.collapse_root(parent)?;
                }
                return Ok(());
            }
            victim = parent;
        }
        // every ancestor emptied, so the root itself became childless
        let mut root = self.store.modify(&victim);
        let stamp = root.lsn.max(lsn);
        *root = Node::leaf(Vec::new(), stamp);
        Ok(())
    }

    fn collapse_root<'s>(&'s self, root: NodeRef<'s>) -> StorageResult<()> {
        let file = self.file()?;
        let mut root = root;
        loop {
            let only_child = match &root.read().body {
                NodeBody::Internal { children, .. } if children.len() == 1 => children[0],
                _ => return Ok(()),
            };
            file.set_root(only_child);
            self.store.free(root)?;
            root = self.store.fetch(self.dictionary, only_child)?;
            trace!(dictionary = %self.dictionary, root = %only_child, "tree lost a level");
        }
    }

    /// Walks every node and checks ordering, pivot bounds, fan-out and uniform leaf depth.
    pub fn verify(&self) -> StorageResult<VerifyReport> {
        let _latch = self.latch.read();
        let mut report = VerifyReport::default();
        let mut leaf_depth = None;
        let root = self.file()?.root();
        self.verify_node(root, None, None, 1, true, &mut leaf_depth, &mut report)?;
        report.depth = leaf_depth.unwrap_or(1);
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_node(&self, id: NodeId, lower: Option<&[u8]>, upper: Option<&[u8]>, depth: u32, is_root: bool, leaf_depth: &mut Option<u32>, report: &mut VerifyReport) -> StorageResult<()> {
        let node = self.store.fetch(self.dictionary, id)?.read().clone();
        report.nodes += 1;
        report.max_lsn = report.max_lsn.max(node.lsn);
        let in_bounds = |key: &[u8]| {
            lower.is_none_or(|l| (self.comparator)(key, l) != Ordering::Less) && upper.is_none_or(|u| (self.comparator)(key, u) == Ordering::Less)
        };
        let ascending = |keys: &mut dyn Iterator<Item = &Vec<u8>>| {
            let keys: Vec<_> = keys.collect();
            keys.windows(2).all(|w| (self.comparator)(w[0], w[1]) == Ordering::Less)
        };
        match &node.body {
            NodeBody::Leaf { entries } => {
                report.leaves += 1;
                report.entries += entries.len() as u64;
                if entries.is_empty() && !is_root {
                    return Err(self.corrupt(id, "empty non-root leaf"));
                }
                if !ascending(&mut entries.iter().map(|(k, _)| k)) {
                    return Err(self.corrupt(id, "keys out of order"));
                }
                if !entries.iter().all(|(k, _)| in_bounds(k)) {
                    return Err(self.corrupt(id, "key outside the range of its parent"));
                }
                match *leaf_depth {
                    Some(expected) if expected != depth => return Err(self.corrupt(id, "leaves at different depths")),
                    _ => *leaf_depth = Some(depth),
                }
            }
            NodeBody::Internal { pivots, children } => {
                if children.is_empty() || pivots.len() + 1 != children.len() {
                    return Err(self.corrupt(id, "pivot and child counts disagree"));
                }
                if !ascending(&mut pivots.iter()) || !pivots.iter().all(|p| in_bounds(p)) {
                    return Err(self.corrupt(id, "pivots out of order"));
                }
                for (index, child) in children.iter().enumerate() {
                    let low = if index == 0 { lower } else { Some(pivots[index - 1].as_slice()) };
                    let high = if index == pivots.len() { upper } else { Some(pivots[index].as_slice()) };
                    self.verify_node(*child, low, high, depth + 1, false, leaf_depth, report)?;
                }
            }
        }
        Ok(())
    }
}

/// Splits a leaf near the middle of its encoded size, returning the separator and the right half.
fn split_leaf(node: &mut Node) -> Option<(Vec<u8>, Node)> {
    let NodeBody::Leaf { entries } = &mut node.body else {
        return None;
    };
    if entries.len() < 2 {
        return None;
    }
    let total: usize = entries.iter().map(|(k, v)| k.len() + v.len() + ENTRY_OVERHEAD).sum();
    let mut acc = 0;
    let mut mid = entries.len() / 2;
    for (i, (k, v)) in entries.iter().enumerate() {
        acc += k.len() + v.len() + ENTRY_OVERHEAD;
        if acc * 2 >= total {
            mid = i + 1;
            break;
        }
    }
    let mid = mid.clamp(1, entries.len() - 1);
    let right = entries.split_off(mid);
    let separator = right[0].0.clone();
    Some((separator, Node::leaf(right, node.lsn)))
}

/// Splits an internal node, returning the promoted pivot and the right half.
fn split_internal(node: &mut Node) -> Option<(Vec<u8>, Node)> {
    let NodeBody::Internal { pivots, children } = &mut node.body else {
        return None;
    };
    if pivots.len() < 3 {
        return None;
    }
    let mid = pivots.len() / 2;
    let right_pivots = pivots.split_off(mid + 1);
    let promoted = pivots.pop()?;
    let right_children = children.split_off(mid + 1);
    Some((promoted, Node::internal(right_pivots, right_children, node.lsn)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indices::lib::bytewise;
    use ftdb_common::LayoutVersion;
    use tempfile::{TempDir, tempdir};

    fn setup(capacity: usize) -> (TempDir, BPlusTree) {
        let dir = tempdir().unwrap();
        let file = DictionaryFile::create(&dir.path().join("t.ftd"), DictionaryId(1), 4096, LayoutVersion::V6, 0, 3).unwrap();
        let store = Arc::new(NodeStore::new(capacity, 4096, LayoutVersion::V6));
        store.register(Arc::new(file));
        (dir, BPlusTree::new(DictionaryId(1), store, bytewise()))
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{i:06}").into_bytes()
    }

    fn scan(tree: &BPlusTree, direction: Direction) -> Vec<Vec<u8>> {
        let reader = tree.read();
        let mut keys = Vec::new();
        let mut last: Option<Vec<u8>> = None;
        loop {
            let bound = match &last {
                None => SeekBound::Start,
                Some(k) => SeekBound::Exclusive(k),
            };
            let Some((k, _)) = reader.seek(bound, direction).unwrap() else { break };
            keys.push(k.clone());
            last = Some(k);
        }
        keys
    }

    #[test]
    fn test_insert_get_and_split() {
        let (_dir, tree) = setup(64);
        {
            let mut writer = tree.write();
            for i in (0..2000).rev() {
                writer.insert(&key(i), b"value-value-value", 0).unwrap();
            }
        }
        let report = tree.verify().unwrap();
        assert_eq!(report.entries, 2000);
        assert!(report.depth >= 2);
        let reader = tree.read();
        assert_eq!(reader.get(&key(1234)).unwrap(), Some(b"value-value-value".to_vec()));
        assert_eq!(reader.get(b"missing").unwrap(), None);
    }

    #[test]
    fn test_replace_returns_previous() {
        let (_dir, tree) = setup(16);
        let mut writer = tree.write();
        assert_eq!(writer.insert(b"a", b"1", 0).unwrap(), ApplyOutcome::Applied { previous: None });
        assert_eq!(writer.insert(b"a", b"2", 0).unwrap(), ApplyOutcome::Applied { previous: Some(b"1".to_vec()) });
        assert_eq!(writer.remove(b"a", 0).unwrap(), ApplyOutcome::Applied { previous: Some(b"2".to_vec()) });
        assert_eq!(writer.remove(b"a", 0).unwrap(), ApplyOutcome::Applied { previous: None });
    }

    #[test]
    fn test_scan_both_directions() {
        let (_dir, tree) = setup(64);
        {
            let mut writer = tree.write();
            for i in 0..500 {
                writer.insert(&key(i * 2), &[7u8; 40], 0).unwrap();
            }
        }
        let forward = scan(&tree, Direction::Forward);
        assert_eq!(forward, (0..500).map(|i| key(i * 2)).collect::<Vec<_>>());
        let mut backward = scan(&tree, Direction::Backward);
        backward.reverse();
        assert_eq!(backward, forward);

        let reader = tree.read();
        assert_eq!(reader.seek(SeekBound::Inclusive(&key(3)), Direction::Forward).unwrap().map(|e| e.0), Some(key(4)));
        assert_eq!(reader.seek(SeekBound::Inclusive(&key(3)), Direction::Backward).unwrap().map(|e| e.0), Some(key(2)));
        assert_eq!(reader.seek(SeekBound::Exclusive(&key(998)), Direction::Forward).unwrap(), None);
    }

    #[test]
    fn test_remove_everything_collapses_tree() {
        let (_dir, tree) = setup(64);
        let mut writer = tree.write();
        for i in 0..1500 {
            writer.insert(&key(i), &[1u8; 30], 0).unwrap();
        }
        for i in 0..1500 {
            assert!(writer.remove(&key(i), 0).unwrap().previous().is_some());
        }
        drop(writer);
        let report = tree.verify().unwrap();
        assert_eq!(report.entries, 0);
        assert_eq!(report.nodes, 1);
        assert!(scan(&tree, Direction::Forward).is_empty());
    }

    #[test]
    fn test_lsn_stamp_skips_replayed_changes() {
        let (_dir, tree) = setup(16);
        let mut writer = tree.write();
        writer.insert(b"k", b"v1", 10).unwrap();
        assert_eq!(writer.insert(b"k", b"old", 9).unwrap(), ApplyOutcome::Skipped);
        assert_eq!(writer.remove(b"k", 10).unwrap(), ApplyOutcome::Skipped);
        assert_eq!(writer.get(b"k").unwrap(), Some(b"v1".to_vec()));
        writer.insert(b"k", b"v2", 11).unwrap();
        assert_eq!(writer.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let (_dir, tree) = setup(16);
        let err = tree.write().insert(b"k", &vec![0u8; 2000], 0).unwrap_err();
        assert!(matches!(err, StorageError::Usage(_)));
    }

    #[test]
    fn test_custom_comparator_orders_scan() {
        let dir = tempdir().unwrap();
        let file = DictionaryFile::create(&dir.path().join("r.ftd"), DictionaryId(2), 4096, LayoutVersion::V6, 0, 3).unwrap();
        let store = Arc::new(NodeStore::new(64, 4096, LayoutVersion::V6));
        store.register(Arc::new(file));
        let tree = BPlusTree::new(DictionaryId(2), store, Arc::new(|a: &[u8], b: &[u8]| b.cmp(a)));
        {
            let mut writer = tree.write();
            for i in 0..300 {
                writer.insert(&key(i), &[0u8; 20], 0).unwrap();
            }
        }
        let keys = scan(&tree, Direction::Forward);
        assert_eq!(keys.first(), Some(&key(299)));
        assert_eq!(keys.last(), Some(&key(0)));
        tree.verify().unwrap();
    }

    #[test]
    fn test_small_cache_survives_deep_tree() {
        let (_dir, tree) = setup(16);
        {
            let mut writer = tree.write();
            for i in 0..3000 {
                writer.insert(&key(i), &[3u8; 50], 0).unwrap();
            }
        }
        assert_eq!(tree.verify().unwrap().entries, 3000);
        assert_eq!(tree.read().get(&key(2999)).unwrap(), Some(vec![3u8; 50]));
    }
}
