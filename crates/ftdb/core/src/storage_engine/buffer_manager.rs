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

// Buffer management module
// This module caches decoded nodes of every open dictionary, upgrades stale nodes as they are fetched, evicts least recently used nodes under memory pressure and cooperates with the checkpoint coordinator so a checkpoint captures each node exactly as it was when the checkpoint began.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ftdb_common::LayoutVersion;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use tracing::{debug, trace};

use crate::storage_engine::block_manager::DictionaryFile;
use crate::storage_engine::file_format::{FileHeader, Node, NodeId, encode_block};
use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult};
use crate::storage_engine::upgrade::FormatUpgrader;

/// Cache key of a node
pub type NodeKey = (DictionaryId, NodeId);

/// Buffer pool statistics
#[derive(Debug, Default)]
pub struct BufferStats {
    /// Nodes read from disk
    pub reads: AtomicU64,
    /// Node images written to disk
    pub writes: AtomicU64,
    /// Fetches served from the cache
    pub hits: AtomicU64,
    /// Fetches that went to disk
    pub misses: AtomicU64,
    /// Nodes dropped from the cache
    pub evictions: AtomicU64,
}

impl BufferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_reads(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_writes(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evictions(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 { 0.0 } else { hits as f64 / total as f64 }
    }
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub reads: u64,
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Nodes upgraded by this process
    pub upgrades: u64,
    /// Nodes currently cached
    pub resident: usize,
    /// Cached nodes not yet written
    pub dirty: usize,
    pub hit_ratio: f64,
}

/// Represents a cached node
#[derive(Debug)]
struct Buffer {
    /// Decoded node behind its latch
    node: Arc<RwLock<Node>>,
    /// Whether the node differs from its stored image
    is_dirty: bool,
    /// Bumped by every modification
    generation: u64,
    /// Live `NodeRef`s and in-flight writes
    pin_count: usize,
    /// Logical clock of the last access
    last_accessed: u64,
}

#[derive(Debug, Default)]
struct BufferPool {
    buffers: HashMap<NodeKey, Buffer>,
    clock: u64,
    /// Nodes that were dirty when the running checkpoint began and are not yet written
    pending: HashSet<NodeKey>,
    /// Checkpoint images of pending nodes taken before they were modified or freed
    snapshots: HashMap<NodeKey, Node>,
}

/// Pinned handle to a cached node; the pin is released on drop
pub struct NodeRef<'a> {
    store: &'a NodeStore,
    key: NodeKey,
    node: Arc<RwLock<Node>>,
}

impl NodeRef<'_> {
    pub fn id(&self) -> NodeId {
        self.key.1
    }

    /// Shared latch on the node contents.
    pub fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.node.read()
    }
}

impl Drop for NodeRef<'_> {
    fn drop(&mut self) {
        let mut pool = self.store.pool.lock();
        if let Some(buffer) = pool.buffers.get_mut(&self.key) {
            buffer.pin_count = buffer.pin_count.saturating_sub(1);
        }
    }
}

/// NodeStore caches nodes of all open dictionaries and routes every fetch through the format upgrader.
pub struct NodeStore {
    /// Cached nodes and checkpoint bookkeeping
    pool: Mutex<BufferPool>,
    /// Files of registered dictionaries
    files: RwLock<HashMap<DictionaryId, Arc<DictionaryFile>>>,
    /// Converts stale nodes on fetch
    upgrader: FormatUpgrader,
    /// Soft limit on cached nodes
    capacity: usize,
    /// Block size of every file
    node_size: usize,
    /// Upgraded nodes stay in memory and are never written back
    read_only: bool,
    stats: BufferStats,
}

impl NodeStore {
    pub fn new(capacity: usize, node_size: usize, target: LayoutVersion) -> Self {
        Self {
            pool: Mutex::new(BufferPool::default()),
            files: RwLock::new(HashMap::new()),
            upgrader: FormatUpgrader::new(target),
            capacity: capacity.max(1),
            node_size,
            read_only: false,
            stats: BufferStats::new(),
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn target_layout(&self) -> LayoutVersion {
        self.upgrader.target()
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    pub fn register(&self, file: Arc<DictionaryFile>) {
        self.files.write().insert(file.dictionary_id(), file);
    }

    pub fn file(&self, dictionary: DictionaryId) -> StorageResult<Arc<DictionaryFile>> {
        self.files.read().get(&dictionary).cloned().ok_or_else(|| StorageError::NotFound(format!("dictionary {} is not open", dictionary)))
    }

    pub fn registered(&self) -> Vec<DictionaryId> {
        let mut ids: Vec<_> = self.files.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Returns a pinned node, reading and upgrading it on a miss.
    ///
    /// Steps:
    /// 1. Serve the node from the cache when present
    /// 2. Otherwise read the block and admit it through the upgrader
    /// 3. A node upgraded on admission starts dirty so its next write uses the target layout,
    ///    unless the store is read-only
    /// 4. Evict least recently used nodes beyond capacity
    pub fn fetch(&self, dictionary: DictionaryId, id: NodeId) -> StorageResult<NodeRef<'_>> {
        let key = (dictionary, id);
        let mut pool = self.pool.lock();
        pool.clock += 1;
        let now = pool.clock;
        if let Some(buffer) = pool.buffers.get_mut(&key) {
            buffer.pin_count += 1;
            buffer.last_accessed = now;
            self.stats.inc_hits();
            return Ok(NodeRef { store: self, key, node: buffer.node.clone() });
        }

        self.stats.inc_misses();
        let file = self.file(dictionary)?;
        let stored = file.read_node(id)?;
        self.stats.inc_reads();
        let (node, upgraded) = self.upgrader.admit(dictionary, id, stored)?;
        let node = Arc::new(RwLock::new(node));
        pool.buffers.insert(key, Buffer { node: node.clone(), is_dirty: upgraded && !self.read_only, generation: 0, pin_count: 1, last_accessed: now });
        self.evict_locked(&mut pool)?;
        Ok(NodeRef { store: self, key, node })
    }

    /// Caches a brand new node under a freshly allocated id.
    pub fn create(&self, dictionary: DictionaryId, node: Node) -> StorageResult<NodeRef<'_>> {
        let id = self.file(dictionary)?.allocate_node_id();
        let key = (dictionary, id);
        let node = Arc::new(RwLock::new(node));
        let mut pool = self.pool.lock();
        pool.clock += 1;
        let now = pool.clock;
        pool.buffers.insert(key, Buffer { node: node.clone(), is_dirty: true, generation: 1, pin_count: 1, last_accessed: now });
        self.evict_locked(&mut pool)?;
        Ok(NodeRef { store: self, key, node })
    }

    /// Exclusive latch on a node for modification; marks it dirty.
    ///
    /// A node still owed to the running checkpoint is copied first so the checkpoint writes the
    /// image it had when the checkpoint began.
    pub fn modify<'r>(&self, node: &'r NodeRef<'_>) -> RwLockWriteGuard<'r, Node> {
        {
            let mut pool = self.pool.lock();
            if pool.pending.remove(&node.key) {
                let image = node.node.read_recursive().clone();
                pool.snapshots.insert(node.key, image);
            }
            if let Some(buffer) = pool.buffers.get_mut(&node.key) {
                buffer.is_dirty = true;
                buffer.generation += 1;
            }
        }
        node.node.write()
    }

    /// Drops a node the tree no longer references.
    pub fn free(&self, node: NodeRef<'_>) -> StorageResult<()> {
        let file = self.file(node.key.0)?;
        {
            let mut pool = self.pool.lock();
            if pool.pending.remove(&node.key) {
                let image = node.node.read_recursive().clone();
                pool.snapshots.insert(node.key, image);
            }
            pool.buffers.remove(&node.key);
        }
        file.release_node(node.key.1);
        Ok(())
    }

    fn evict_locked(&self, pool: &mut BufferPool) -> StorageResult<()> {
        while pool.buffers.len() > self.capacity {
            let victim = pool
                .buffers
                .iter()
                .filter(|(key, b)| b.pin_count == 0 && !pool.pending.contains(*key))
                .min_by_key(|(_, b)| b.last_accessed)
                .map(|(key, _)| *key);
            let Some(key) = victim else {
                trace!(resident = pool.buffers.len(), capacity = self.capacity, "cache over capacity with every node pinned");
                return Ok(());
            };
            if let Some(buffer) = pool.buffers.get(&key) {
                if buffer.is_dirty {
                    let file = self.file(key.0)?;
                    let block = encode_block(key.1, &buffer.node.read_recursive(), self.target_layout(), self.node_size)?;
                    file.write_node(key.1, &block, self.target_layout())?;
                    self.stats.inc_writes();
                }
            }
            pool.buffers.remove(&key);
            self.stats.inc_evictions();
        }
        Ok(())
    }

    /// Marks every dirty node as owed to a checkpoint at `lsn` and snapshots each file's table.
    ///
    /// The caller must exclude concurrent node modification for the duration of this call.
    pub fn begin_checkpoint(&self, lsn: u64) {
        let mut pool = self.pool.lock();
        let dirty: HashSet<NodeKey> = pool.buffers.iter().filter(|(_, b)| b.is_dirty).map(|(key, _)| *key).collect();
        pool.pending = dirty;
        pool.snapshots.clear();
        for file in self.files.read().values() {
            file.begin_checkpoint(lsn);
        }
        debug!(pending = pool.pending.len(), "checkpoint marked dirty nodes");
    }

    /// Writes every node owed to the running checkpoint, concurrently with foreground work.
    pub fn flush_checkpoint(&self) -> StorageResult<usize> {
        let mut written = 0;
        loop {
            let mut pool = self.pool.lock();
            if let Some(key) = pool.snapshots.keys().next().copied() {
                if let Some(image) = pool.snapshots.remove(&key) {
                    drop(pool);
                    self.write_checkpoint_image(key, &image, false)?;
                    written += 1;
                }
                continue;
            }
            let Some(key) = pool.pending.iter().next().copied() else {
                break;
            };
            pool.pending.remove(&key);
            let Some(buffer) = pool.buffers.get_mut(&key) else {
                continue;
            };
            buffer.pin_count += 1;
            let generation = buffer.generation;
            let node = buffer.node.clone();
            let guard = node.read_recursive();
            drop(pool);

            let result = self.write_checkpoint_image(key, &guard, true);
            {
                let mut pool = self.pool.lock();
                if let Some(buffer) = pool.buffers.get_mut(&key) {
                    buffer.pin_count = buffer.pin_count.saturating_sub(1);
                    if result.is_ok() && buffer.generation == generation {
                        buffer.is_dirty = false;
                    }
                }
            }
            drop(guard);
            result?;
            written += 1;
        }
        Ok(written)
    }

    fn write_checkpoint_image(&self, key: NodeKey, node: &Node, live: bool) -> StorageResult<()> {
        let file = self.file(key.0)?;
        let block = encode_block(key.1, node, self.target_layout(), self.node_size)?;
        file.write_checkpoint_node(key.1, &block, self.target_layout(), live)?;
        self.stats.inc_writes();
        Ok(())
    }

    /// Persists table and header of every file in the running checkpoint.
    pub fn finish_checkpoint(&self) -> StorageResult<Vec<FileHeader>> {
        let files: Vec<_> = self.files.read().values().cloned().collect();
        let mut headers = Vec::with_capacity(files.len());
        let mut failure = None;
        for file in files {
            if failure.is_some() {
                file.abort_checkpoint();
                continue;
            }
            match file.finish_checkpoint(self.target_layout()) {
                Ok(header) => headers.push(header),
                Err(e) => failure = Some(e),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(headers),
        }
    }

    /// Abandons the running checkpoint; nodes it did not write stay dirty.
    pub fn abort_checkpoint(&self) {
        let mut pool = self.pool.lock();
        let owed: Vec<NodeKey> = pool.pending.drain().collect();
        for key in owed {
            if let Some(buffer) = pool.buffers.get_mut(&key) {
                buffer.is_dirty = true;
            }
        }
        pool.snapshots.clear();
        for file in self.files.read().values() {
            file.abort_checkpoint();
        }
    }

    pub fn upgraded_count(&self) -> u64 {
        self.upgrader.upgraded_count()
    }

    pub fn statistics(&self) -> CacheStatistics {
        let pool = self.pool.lock();
        CacheStatistics {
            reads: self.stats.reads.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            upgrades: self.upgrader.upgraded_count(),
            resident: pool.buffers.len(),
            dirty: pool.buffers.values().filter(|b| b.is_dirty).count(),
            hit_ratio: self.stats.get_hit_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_engine::file_format::NodeBody;
    use std::path::Path;
    use tempfile::tempdir;

    fn entries(keys: &[&str]) -> Vec<(Vec<u8>, Vec<u8>)> {
        keys.iter().map(|k| (k.as_bytes().to_vec(), b"v".to_vec())).collect()
    }

    fn open_store(path: &Path, created: LayoutVersion, target: LayoutVersion, capacity: usize) -> StorageResult<NodeStore> {
        let file = DictionaryFile::create(path, DictionaryId(1), 4096, created, 0, 3)?;
        let store = NodeStore::new(capacity, 4096, target);
        store.register(Arc::new(file));
        Ok(store)
    }

    fn checkpoint(store: &NodeStore, lsn: u64) -> StorageResult<()> {
        store.begin_checkpoint(lsn);
        store.flush_checkpoint()?;
        store.finish_checkpoint()?;
        Ok(())
    }

    #[test]
    fn test_fetch_upgrades_legacy_nodes() -> StorageResult<()> {
        let dir = tempdir()?;
        let store = open_store(&dir.path().join("d.ftd"), LayoutVersion::V4, LayoutVersion::V6, 16)?;
        {
            let root = store.fetch(DictionaryId(1), NodeId(1))?;
            assert!(root.read().is_leaf());
        }
        let stats = store.statistics();
        assert_eq!(stats.upgrades, 1);
        assert_eq!(stats.dirty, 1);

        checkpoint(&store, 10)?;
        let file = store.file(DictionaryId(1))?;
        assert_eq!(file.stored_layout(NodeId(1)), Some(LayoutVersion::V6));
        assert!(file.header().upgrade.is_complete());
        assert_eq!(store.statistics().dirty, 0);
        Ok(())
    }

    #[test]
    fn test_current_nodes_are_not_rewritten() -> StorageResult<()> {
        let dir = tempdir()?;
        let store = open_store(&dir.path().join("d.ftd"), LayoutVersion::V6, LayoutVersion::V6, 16)?;
        drop(store.fetch(DictionaryId(1), NodeId(1))?);
        assert_eq!(store.statistics().upgrades, 0);
        assert_eq!(store.statistics().dirty, 0);
        Ok(())
    }

    #[test]
    fn test_eviction_writes_dirty_nodes_and_skips_pinned() -> StorageResult<()> {
        let dir = tempdir()?;
        let store = open_store(&dir.path().join("d.ftd"), LayoutVersion::V6, LayoutVersion::V6, 2)?;
        let pinned = store.fetch(DictionaryId(1), NodeId(1))?;
        let mut ids = Vec::new();
        for i in 0..4 {
            let node = store.create(DictionaryId(1), Node::leaf(entries(&[&format!("k{i}")]), 0))?;
            ids.push(node.id());
        }
        let stats = store.statistics();
        assert!(stats.resident <= 2);
        assert!(stats.evictions >= 2);
        assert!(stats.writes >= 2);
        // the pinned root survived
        assert!(pinned.read().is_leaf());
        // evicted nodes come back from disk
        let first = store.fetch(DictionaryId(1), ids[0])?;
        assert_eq!(first.read().body, NodeBody::Leaf { entries: entries(&["k0"]) });
        Ok(())
    }

    #[test]
    fn test_checkpoint_writes_image_from_checkpoint_begin() -> StorageResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("d.ftd");
        let store = open_store(&path, LayoutVersion::V6, LayoutVersion::V6, 16)?;
        {
            let root = store.fetch(DictionaryId(1), NodeId(1))?;
            *store.modify(&root) = Node::leaf(entries(&["before"]), 5);
        }
        store.begin_checkpoint(5);
        {
            let root = store.fetch(DictionaryId(1), NodeId(1))?;
            *store.modify(&root) = Node::leaf(entries(&["after"]), 6);
        }
        store.flush_checkpoint()?;
        store.finish_checkpoint()?;
        // the live node is still dirty and reads the new contents
        {
            let root = store.fetch(DictionaryId(1), NodeId(1))?;
            assert_eq!(root.read().body, NodeBody::Leaf { entries: entries(&["after"]) });
        }
        assert_eq!(store.statistics().dirty, 1);
        drop(store);

        let file = DictionaryFile::open(&path, 3)?;
        assert_eq!(file.read_node(NodeId(1))?.into_node().body, NodeBody::Leaf { entries: entries(&["before"]) });
        Ok(())
    }

    #[test]
    fn test_read_only_store_keeps_upgrades_in_memory() -> StorageResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("d.ftd");
        let file = DictionaryFile::create(&path, DictionaryId(1), 4096, LayoutVersion::V4, 0, 3)?;
        let store = NodeStore::new(1, 4096, LayoutVersion::V6).with_read_only(true);
        store.register(Arc::new(file));
        {
            let root = store.fetch(DictionaryId(1), NodeId(1))?;
            assert!(root.read().is_leaf());
        }
        assert_eq!(store.statistics().upgrades, 1);
        assert_eq!(store.statistics().dirty, 0);
        // evicting the upgraded root writes nothing
        store.create(DictionaryId(1), Node::empty_leaf())?;
        assert_eq!(store.statistics().evictions, 1);
        assert_eq!(store.statistics().writes, 0);
        assert_eq!(store.file(DictionaryId(1))?.stored_layout(NodeId(1)), Some(LayoutVersion::V4));
        Ok(())
    }
}
