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

// Block management module
// This module maps node ids to the blocks holding them and owns the dictionary file handle. Nodes are never overwritten in place: every write goes to a block that no durable or in-progress checkpoint references, so the file always holds the complete tree of its last checkpoint.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use ftdb_common::LayoutVersion;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage_engine::file_format::{FileHeader, HEADER_REGION_SIZE, HEADER_SLOT_SIZE, Node, NodeId, TableLocation, VersionedNode, decode_block, encode_block, peek_layout};
use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult, calculate_checksum, decode, encode, retry_io};
use crate::storage_engine::upgrade::UpgradeProgress;

const CURRENT: u8 = 1;
const DURABLE: u8 = 2;
const PENDING: u8 = 4;
const DURABLE_TABLE: u8 = 8;
const PENDING_TABLE: u8 = 16;

/// Location of a node on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block number
    pub block: u64,
    /// Layout the node was written in
    pub layout: LayoutVersion,
}

/// Translation tables and block reference tracking for one file
#[derive(Debug, Default)]
pub struct BlockTable {
    /// Where each live node currently is
    current: HashMap<NodeId, BlockRef>,
    /// Table of the last completed checkpoint
    durable: HashMap<NodeId, BlockRef>,
    /// Table being assembled by a running checkpoint
    pending: Option<HashMap<NodeId, BlockRef>>,
    /// Reference bits per block
    refs: HashMap<u64, u8>,
    /// Blocks with no references, reused lowest first
    free: BTreeSet<u64>,
    /// First block never handed out
    next_block: u64,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the table from a checkpoint; every block not referenced by it is free.
    pub fn from_durable(entries: Vec<(NodeId, BlockRef)>, table_blocks: Range<u64>, next_block: u64) -> StorageResult<Self> {
        let mut table = Self { next_block, ..Self::default() };
        for (id, location) in entries {
            if location.block >= next_block {
                return Err(StorageError::Corruption(format!("node {} points past the end of the file (block {})", id, location.block)));
            }
            if table.durable.insert(id, location).is_some() {
                return Err(StorageError::Corruption(format!("node {} listed twice in translation table", id)));
            }
            table.current.insert(id, location);
            table.set(location.block, CURRENT | DURABLE);
        }
        for block in table_blocks {
            table.set(block, DURABLE_TABLE);
        }
        table.free = (0..next_block).filter(|b| !table.refs.contains_key(b)).collect();
        Ok(table)
    }

    fn set(&mut self, block: u64, bits: u8) {
        *self.refs.entry(block).or_insert(0) |= bits;
        self.free.remove(&block);
    }

    fn clear(&mut self, block: u64, bits: u8) {
        if let Some(flags) = self.refs.get_mut(&block) {
            *flags &= !bits;
            if *flags == 0 {
                self.refs.remove(&block);
                self.free.insert(block);
            }
        }
    }

    pub fn lookup(&self, id: NodeId) -> Option<BlockRef> {
        self.current.get(&id).copied()
    }

    /// Hands out an unreferenced block.
    pub fn allocate(&mut self) -> u64 {
        if let Some(block) = self.free.pop_first() {
            return block;
        }
        let block = self.next_block;
        self.next_block += 1;
        block
    }

    /// Points the live table at a freshly written block.
    pub fn assign(&mut self, id: NodeId, location: BlockRef) {
        self.set(location.block, CURRENT);
        if let Some(old) = self.current.insert(id, location) {
            if old.block != location.block {
                self.clear(old.block, CURRENT);
            }
        }
    }

    /// Drops a node from the live table.
    pub fn release(&mut self, id: NodeId) {
        if let Some(old) = self.current.remove(&id) {
            self.clear(old.block, CURRENT);
        }
    }

    /// Starts a checkpoint table from the live table.
    pub fn begin_checkpoint(&mut self) {
        let snapshot = self.current.clone();
        let blocks: Vec<u64> = snapshot.values().map(|r| r.block).collect();
        for block in blocks {
            self.set(block, PENDING);
        }
        self.pending = Some(snapshot);
    }

    /// Records where a checkpointed node image was written.
    ///
    /// With `update_current` the live table moves as well, provided the node is still live.
    pub fn assign_pending(&mut self, id: NodeId, location: BlockRef, update_current: bool) -> StorageResult<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(StorageError::Usage("no checkpoint in progress".to_string()));
        };
        let old = pending.insert(id, location);
        self.set(location.block, PENDING);
        if let Some(old) = old {
            if old.block != location.block {
                self.clear(old.block, PENDING);
            }
        }
        if update_current && self.current.contains_key(&id) {
            self.assign(id, location);
        }
        Ok(())
    }

    /// Reserves `count` contiguous blocks for the checkpoint's translation table.
    pub fn allocate_table(&mut self, count: u64) -> u64 {
        let first = self.next_block;
        self.next_block += count;
        for block in first..first + count {
            self.set(block, PENDING_TABLE);
        }
        first
    }

    /// Entries of the in-progress checkpoint table, ordered by node id.
    pub fn pending_entries(&self) -> Vec<(NodeId, BlockRef)> {
        let mut entries: Vec<_> = self.pending.iter().flat_map(|p| p.iter().map(|(id, r)| (*id, *r))).collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Makes the in-progress table the durable one, freeing blocks only the old checkpoint used.
    pub fn finish_checkpoint(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.durable = pending;
        let blocks: Vec<u64> = self.refs.keys().copied().collect();
        for block in blocks {
            let flags = self.refs[&block];
            let mut next = flags & CURRENT;
            if flags & PENDING != 0 {
                next |= DURABLE;
            }
            if flags & PENDING_TABLE != 0 {
                next |= DURABLE_TABLE;
            }
            self.refs.insert(block, next);
            if next == 0 {
                self.refs.remove(&block);
                self.free.insert(block);
            }
        }
    }

    /// Discards a failed checkpoint; the previous durable table stays authoritative.
    pub fn abort_checkpoint(&mut self) {
        if self.pending.take().is_none() {
            return;
        }
        let blocks: Vec<u64> = self.refs.keys().copied().collect();
        for block in blocks {
            self.clear(block, PENDING | PENDING_TABLE);
        }
    }

    /// Live nodes stored in a layout older than `target`.
    pub fn legacy_count(&self, target: LayoutVersion) -> u64 {
        self.current.values().filter(|r| r.layout < target).count() as u64
    }

    pub fn node_count(&self) -> usize {
        self.current.len()
    }

    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    fn live_ids(&self) -> Vec<NodeId> {
        self.current.keys().copied().collect()
    }

    fn correct_layout(&mut self, id: NodeId, layout: LayoutVersion) {
        for table in [&mut self.current, &mut self.durable] {
            if let Some(location) = table.get_mut(&id) {
                location.layout = layout;
            }
        }
    }
}

/// Root and allocation state captured when a checkpoint begins
#[derive(Debug, Clone, Copy)]
struct PendingCheckpoint {
    lsn: u64,
    root: NodeId,
    next_node_id: u64,
}

struct FileState {
    /// Open dictionary file
    file: File,
    /// Header of the last completed checkpoint
    header: FileHeader,
    /// Slot holding `header`
    active_slot: usize,
    /// Live root node
    root: NodeId,
    /// Next node id to hand out
    next_node_id: u64,
    /// Block bookkeeping
    blocks: BlockTable,
    /// Running checkpoint, if any
    checkpoint: Option<PendingCheckpoint>,
}

/// On-disk node file of one dictionary
pub struct DictionaryFile {
    /// Path of the file
    path: PathBuf,
    /// Owning dictionary
    dictionary: DictionaryId,
    /// Block size in bytes
    node_size: usize,
    /// Attempts for transient I/O failures
    io_retries: u32,
    state: Mutex<FileState>,
}

impl DictionaryFile {
    fn block_offset(&self, block: u64) -> u64 {
        HEADER_REGION_SIZE + block * self.node_size as u64
    }

    /// Creates a new file holding an empty root leaf, checkpointed at `lsn`.
    ///
    /// Steps:
    /// 1. Create the file exclusively
    /// 2. Write the empty root leaf in `layout`
    /// 3. Persist the table and the first header slot
    pub fn create(path: &Path, dictionary: DictionaryId, node_size: usize, layout: LayoutVersion, lsn: u64, io_retries: u32) -> StorageResult<Self> {
        let file = match OpenOptions::new().read(true).write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(StorageError::AlreadyExists(path.display().to_string())),
            Err(e) => return Err(e.into()),
        };
        file.set_len(HEADER_REGION_SIZE)?;
        let root = NodeId(1);
        let header = FileHeader {
            checkpoint_count: 0,
            checkpoint_lsn: lsn,
            dictionary_id: dictionary,
            node_size: node_size as u32,
            root,
            next_node_id: 2,
            next_block: 0,
            table: TableLocation::default(),
            created_layout: layout,
            upgrade: UpgradeProgress::complete(layout),
        };
        let dict_file = Self {
            path: path.to_path_buf(),
            dictionary,
            node_size,
            io_retries,
            state: Mutex::new(FileState { file, header, active_slot: 1, root, next_node_id: 2, blocks: BlockTable::new(), checkpoint: None }),
        };
        let block = encode_block(root, &Node::empty_leaf(), layout, node_size)?;
        dict_file.write_node(root, &block, layout)?;
        dict_file.begin_checkpoint(lsn);
        dict_file.finish_checkpoint(layout)?;
        info!(dictionary = %dictionary, path = %path.display(), layout = %layout, "created dictionary file");
        Ok(dict_file)
    }

    /// Opens an existing file at its newest valid checkpoint.
    pub fn open(path: &Path, io_retries: u32) -> StorageResult<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StorageError::NotFound(path.display().to_string())),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() < HEADER_REGION_SIZE {
            return Err(StorageError::Corruption(format!("{} is shorter than its header region", path.display())));
        }
        let mut slots = Vec::with_capacity(2);
        for slot in 0..2 {
            let mut buffer = vec![0u8; HEADER_SLOT_SIZE];
            retry_io(io_retries, || file.read_exact_at(&mut buffer, (slot * HEADER_SLOT_SIZE) as u64))?;
            if let Some(header) = FileHeader::deserialize(&buffer)? {
                slots.push((slot, header));
            }
        }
        let Some((active_slot, header)) = slots.into_iter().max_by_key(|(_, h)| h.checkpoint_count) else {
            return Err(StorageError::Corruption(format!("{} has no valid header", path.display())));
        };

        let node_size = header.node_size as usize;
        let offset = HEADER_REGION_SIZE + header.table.first_block * node_size as u64;
        let mut table_bytes = vec![0u8; header.table.len as usize];
        retry_io(io_retries, || file.read_exact_at(&mut table_bytes, offset))?;
        if calculate_checksum(&table_bytes) != header.table.checksum {
            return Err(StorageError::Corruption(format!("translation table checksum mismatch in {}", path.display())));
        }
        let entries: Vec<(NodeId, BlockRef)> = decode(&table_bytes)?;
        let table_blocks = header.table.first_block..header.table.first_block + (header.table.len as usize).div_ceil(node_size).max(1) as u64;
        let blocks = BlockTable::from_durable(entries, table_blocks, header.next_block)?;
        if blocks.lookup(header.root).is_none() {
            return Err(StorageError::Corruption(format!("root {} of {} is not in its translation table", header.root, path.display())));
        }
        debug!(path = %path.display(), checkpoint = header.checkpoint_count, nodes = blocks.node_count(), "opened dictionary file");

        Ok(Self {
            path: path.to_path_buf(),
            dictionary: header.dictionary_id,
            node_size,
            io_retries,
            state: Mutex::new(FileState { file, root: header.root, next_node_id: header.next_node_id, header, active_slot, blocks, checkpoint: None }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dictionary_id(&self) -> DictionaryId {
        self.dictionary
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Header of the last completed checkpoint.
    pub fn header(&self) -> FileHeader {
        self.state.lock().header.clone()
    }

    pub fn root(&self) -> NodeId {
        self.state.lock().root
    }

    pub fn set_root(&self, root: NodeId) {
        self.state.lock().root = root;
    }

    pub fn allocate_node_id(&self) -> NodeId {
        let mut state = self.state.lock();
        let id = NodeId(state.next_node_id);
        state.next_node_id += 1;
        id
    }

    /// Layout a node is stored in, if it has been written.
    pub fn stored_layout(&self, id: NodeId) -> Option<LayoutVersion> {
        self.state.lock().blocks.lookup(id).map(|r| r.layout)
    }

    /// Reads and verifies the stored image of a node.
    pub fn read_node(&self, id: NodeId) -> StorageResult<VersionedNode> {
        let state = self.state.lock();
        let location = state.blocks.lookup(id).ok_or_else(|| StorageError::Corruption(format!("node {} of dictionary {} is not in the translation table", id, self.dictionary)))?;
        let mut block = vec![0u8; self.node_size];
        let offset = self.block_offset(location.block);
        retry_io(self.io_retries, || state.file.read_exact_at(&mut block, offset))?;
        decode_block(&block, id)
    }

    /// Writes a node image to a fresh block and makes it the live copy.
    pub fn write_node(&self, id: NodeId, block: &[u8], layout: LayoutVersion) -> StorageResult<()> {
        let mut state = self.state.lock();
        let target = state.blocks.allocate();
        let offset = self.block_offset(target);
        retry_io(self.io_retries, || state.file.write_all_at(block, offset))?;
        state.blocks.assign(id, BlockRef { block: target, layout });
        Ok(())
    }

    /// Forgets a node that the tree no longer references.
    pub fn release_node(&self, id: NodeId) {
        self.state.lock().blocks.release(id);
    }

    /// Captures root, id allocation and translation table for a checkpoint at `lsn`.
    pub fn begin_checkpoint(&self, lsn: u64) {
        let mut state = self.state.lock();
        state.blocks.begin_checkpoint();
        state.checkpoint = Some(PendingCheckpoint { lsn, root: state.root, next_node_id: state.next_node_id });
    }

    /// Writes the checkpoint image of a node. Live nodes also move their current location.
    pub fn write_checkpoint_node(&self, id: NodeId, block: &[u8], layout: LayoutVersion, live: bool) -> StorageResult<()> {
        let mut state = self.state.lock();
        let target = state.blocks.allocate();
        let offset = self.block_offset(target);
        if let Err(e) = retry_io(self.io_retries, || state.file.write_all_at(block, offset)) {
            state.blocks.free.insert(target);
            return Err(e);
        }
        state.blocks.assign_pending(id, BlockRef { block: target, layout }, live)
    }

    /// Persists the checkpoint table and header.
    ///
    /// Steps:
    /// 1. Encode the in-progress translation table into freshly reserved blocks
    /// 2. Sync the node and table blocks
    /// 3. Write the header into the inactive slot and sync again
    /// 4. Release blocks referenced only by the previous checkpoint
    pub fn finish_checkpoint(&self, target: LayoutVersion) -> StorageResult<FileHeader> {
        let mut state = self.state.lock();
        let Some(pending) = state.checkpoint.take() else {
            return Err(StorageError::Usage(format!("no checkpoint in progress for dictionary {}", self.dictionary)));
        };
        match self.persist_checkpoint(&mut state, pending, target) {
            Ok(header) => {
                state.blocks.finish_checkpoint();
                state.active_slot = 1 - state.active_slot;
                state.header = header.clone();
                Ok(header)
            }
            Err(e) => {
                warn!(dictionary = %self.dictionary, error = %e, "checkpoint of dictionary file failed");
                state.blocks.abort_checkpoint();
                Err(e)
            }
        }
    }

    fn persist_checkpoint(&self, state: &mut FileState, pending: PendingCheckpoint, target: LayoutVersion) -> StorageResult<FileHeader> {
        let entries = state.blocks.pending_entries();
        let legacy_remaining = entries.iter().filter(|(_, r)| r.layout < target).count() as u64;
        let table_bytes = encode(&entries)?;
        let block_count = table_bytes.len().div_ceil(self.node_size).max(1) as u64;
        let first_block = state.blocks.allocate_table(block_count);
        let offset = self.block_offset(first_block);
        retry_io(self.io_retries, || state.file.write_all_at(&table_bytes, offset))?;
        let file_len = self.block_offset(state.blocks.next_block());
        if state.file.metadata()?.len() < file_len {
            state.file.set_len(file_len)?;
        }
        retry_io(self.io_retries, || state.file.sync_data())?;

        let header = FileHeader {
            checkpoint_count: state.header.checkpoint_count + 1,
            checkpoint_lsn: pending.lsn,
            dictionary_id: self.dictionary,
            node_size: self.node_size as u32,
            root: pending.root,
            next_node_id: pending.next_node_id,
            next_block: state.blocks.next_block(),
            table: TableLocation { first_block, len: table_bytes.len() as u64, checksum: calculate_checksum(&table_bytes) },
            created_layout: state.header.created_layout,
            upgrade: UpgradeProgress { target, legacy_remaining },
        };
        if !state.header.upgrade.advances_to(&header.upgrade) {
            warn!(dictionary = %self.dictionary, before = state.header.upgrade.legacy_remaining, after = legacy_remaining, "upgrade marker moved backwards");
        }
        let slot = 1 - state.active_slot;
        let bytes = header.serialize();
        retry_io(self.io_retries, || state.file.write_all_at(&bytes, (slot * HEADER_SLOT_SIZE) as u64))?;
        retry_io(self.io_retries, || state.file.sync_data())?;
        Ok(header)
    }

    /// Abandons a running checkpoint without touching the durable state.
    pub fn abort_checkpoint(&self) {
        let mut state = self.state.lock();
        state.checkpoint = None;
        state.blocks.abort_checkpoint();
    }

    /// Upgrade progress of the live tree.
    pub fn live_progress(&self, target: LayoutVersion) -> UpgradeProgress {
        UpgradeProgress { target, legacy_remaining: self.state.lock().blocks.legacy_count(target) }
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().blocks.node_count()
    }

    /// Re-derives the stored layout of every live node from its block header.
    ///
    /// Used when the persisted marker was computed for a different target.
    pub fn rescan_layouts(&self) -> StorageResult<u64> {
        let mut state = self.state.lock();
        let mut corrected = 0;
        for id in state.blocks.live_ids() {
            let Some(location) = state.blocks.lookup(id) else { continue };
            let mut block = vec![0u8; self.node_size];
            let offset = self.block_offset(location.block);
            retry_io(self.io_retries, || state.file.read_exact_at(&mut block, offset))?;
            let layout = peek_layout(&block)?;
            if layout != location.layout {
                state.blocks.correct_layout(id, layout);
                corrected += 1;
            }
        }
        Ok(corrected)
    }

    pub fn sync(&self) -> StorageResult<()> {
        let state = self.state.lock();
        retry_io(self.io_retries, || state.file.sync_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn leaf(keys: &[&str]) -> Node {
        Node::leaf(keys.iter().map(|k| (k.as_bytes().to_vec(), b"v".to_vec())).collect(), 0)
    }

    #[test]
    fn test_block_table_reuses_unreferenced_blocks() {
        let mut table = BlockTable::new();
        let a = table.allocate();
        table.assign(NodeId(1), BlockRef { block: a, layout: LayoutVersion::V6 });
        let b = table.allocate();
        table.assign(NodeId(1), BlockRef { block: b, layout: LayoutVersion::V6 });
        assert_eq!(table.allocate(), a);
    }

    #[test]
    fn test_block_table_protects_checkpointed_blocks() {
        let mut table = BlockTable::new();
        let a = table.allocate();
        table.assign(NodeId(1), BlockRef { block: a, layout: LayoutVersion::V4 });
        table.begin_checkpoint();
        let b = table.allocate();
        table.assign(NodeId(1), BlockRef { block: b, layout: LayoutVersion::V6 });
        // `a` is still part of the running checkpoint
        assert_ne!(table.allocate(), a);
        table.finish_checkpoint();
        // after the checkpoint `a` is referenced by the durable table only
        assert_eq!(table.legacy_count(LayoutVersion::V6), 0);
        table.begin_checkpoint();
        table.finish_checkpoint();
        assert_eq!(table.allocate(), a);
    }

    #[test]
    fn test_create_and_reopen() -> StorageResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("d.ftd");
        let file = DictionaryFile::create(&path, DictionaryId(7), 4096, LayoutVersion::V6, 0, 3)?;
        assert_eq!(file.root(), NodeId(1));
        drop(file);

        let file = DictionaryFile::open(&path, 3)?;
        assert_eq!(file.dictionary_id(), DictionaryId(7));
        assert_eq!(file.read_node(NodeId(1))?.into_node(), Node::empty_leaf());
        assert!(matches!(DictionaryFile::create(&path, DictionaryId(7), 4096, LayoutVersion::V6, 0, 3), Err(StorageError::AlreadyExists(_))));
        Ok(())
    }

    #[test]
    fn test_uncheckpointed_writes_are_not_durable() -> StorageResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("d.ftd");
        let file = DictionaryFile::create(&path, DictionaryId(1), 4096, LayoutVersion::V6, 0, 3)?;
        let block = encode_block(NodeId(1), &leaf(&["a"]), LayoutVersion::V6, 4096)?;
        file.write_node(NodeId(1), &block, LayoutVersion::V6)?;
        assert_eq!(file.read_node(NodeId(1))?.into_node(), leaf(&["a"]));
        drop(file);

        let file = DictionaryFile::open(&path, 3)?;
        assert_eq!(file.read_node(NodeId(1))?.into_node(), Node::empty_leaf());
        Ok(())
    }

    #[test]
    fn test_checkpoint_persists_pending_images_and_progress() -> StorageResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("d.ftd");
        let file = DictionaryFile::create(&path, DictionaryId(1), 4096, LayoutVersion::V4, 0, 3)?;
        assert_eq!(file.live_progress(LayoutVersion::V6).legacy_remaining, 1);

        file.begin_checkpoint(500);
        let block = encode_block(NodeId(1), &leaf(&["x", "y"]), LayoutVersion::V6, 4096)?;
        file.write_checkpoint_node(NodeId(1), &block, LayoutVersion::V6, true)?;
        let header = file.finish_checkpoint(LayoutVersion::V6)?;
        assert_eq!(header.checkpoint_lsn, 500);
        assert!(header.upgrade.is_complete());
        drop(file);

        let file = DictionaryFile::open(&path, 3)?;
        let stored = file.read_node(NodeId(1))?;
        assert_eq!(stored.layout(), LayoutVersion::V6);
        assert_eq!(stored.into_node(), leaf(&["x", "y"]));
        assert_eq!(file.header().created_layout, LayoutVersion::V4);
        Ok(())
    }

    #[test]
    fn test_torn_header_falls_back_to_previous_checkpoint() -> StorageResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("d.ftd");
        let file = DictionaryFile::create(&path, DictionaryId(1), 4096, LayoutVersion::V6, 0, 3)?;
        file.begin_checkpoint(10);
        let block = encode_block(NodeId(1), &leaf(&["k"]), LayoutVersion::V6, 4096)?;
        file.write_checkpoint_node(NodeId(1), &block, LayoutVersion::V6, true)?;
        file.finish_checkpoint(LayoutVersion::V6)?;
        drop(file);

        // second checkpoint went to slot 1; tear it
        let raw = OpenOptions::new().write(true).open(&path)?;
        raw.write_all_at(&[0xAB; 16], HEADER_SLOT_SIZE as u64 + 40)?;
        drop(raw);

        let file = DictionaryFile::open(&path, 3)?;
        assert_eq!(file.header().checkpoint_lsn, 0);
        assert_eq!(file.read_node(NodeId(1))?.into_node(), Node::empty_leaf());
        Ok(())
    }

    #[test]
    fn test_rescan_corrects_layouts() -> StorageResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("d.ftd");
        let file = DictionaryFile::create(&path, DictionaryId(1), 4096, LayoutVersion::V5, 0, 3)?;
        file.state.lock().blocks.correct_layout(NodeId(1), LayoutVersion::V6);
        assert_eq!(file.rescan_layouts()?, 1);
        assert_eq!(file.stored_layout(NodeId(1)), Some(LayoutVersion::V5));
        Ok(())
    }
}
