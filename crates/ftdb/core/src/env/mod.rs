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

// Environment module
// The explicit handle that owns the node cache, log, lock table, transaction manager and every dictionary of one storage directory.

pub mod catalog;
pub mod cursor;
pub mod dictionary;
pub mod secondary;
pub mod transaction;

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ftdb_common::{DurabilityMode, EnvConfig};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::indices::b_plus_tree::BPlusTree;
use crate::indices::lib::{BYTEWISE, Comparator, ComparatorRegistry};
use crate::indices::secondary_key;
use crate::recovery::checkpoint::log_duration;
use crate::recovery::checkpoint::CHECKPOINT_FILE;
use crate::recovery::{CheckpointCoordinator, CheckpointRecord, DictionaryCheckpoint, RecoveryReport, RecoveryTarget, recover};
use crate::storage_engine::block_manager::DictionaryFile;
use crate::storage_engine::buffer_manager::{CacheStatistics, NodeStore};
use crate::storage_engine::isolation::{LockManager, LockMode, LockResource, LockStatistics};
use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult};
use crate::storage_engine::mvcc::VersionStore;
use crate::storage_engine::transaction::{TransactionContext, TransactionManager, TransactionState, TransactionStatistics, UndoRecord};
use crate::storage_engine::wal::{LogEntry, LogSequenceNumber, WalConfig, WriteAheadLog};

pub use catalog::{Catalog, CatalogEntry, Descriptor, DictionaryRole};
pub use cursor::{Cursor, CursorEntry, CursorOptions};
pub use dictionary::Dictionary;
pub use secondary::{SecondaryEntry, SecondaryGenerator, generator};
pub use transaction::Transaction;

/// Lock file guarding a directory against a second environment
pub const LOCK_FILE: &str = "__ftdb.lock";

/// Free-space state of the volume holding the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpaceStatus {
    Ok,
    /// Free space fell below the configured redzone
    Redzone,
}

/// Environment statistics
#[derive(Debug, Clone, Serialize)]
pub struct EnvStats {
    pub cache: CacheStatistics,
    /// Nodes converted to the current layout by this process
    pub nodes_upgraded: u64,
    pub locks: LockStatistics,
    pub transactions: TransactionStatistics,
    /// Checkpoints completed by this process
    pub checkpoints: u64,
    pub current_lsn: LogSequenceNumber,
    pub dictionaries: usize,
    pub space: SpaceStatus,
    /// Outcome of the recovery run at open
    pub recovery: RecoveryReport,
}

/// How `Environment::open_dictionary` finds or creates a dictionary
#[derive(Debug, Clone)]
pub struct DictionaryOptions {
    /// Registered comparator ordering the keys; for a secondary it orders the secondary keys.
    /// Existing dictionaries default to their catalogued comparator, new ones to bytewise.
    pub comparator: Option<String>,
    /// Descriptor stored when the dictionary is created
    pub descriptor: Option<Descriptor>,
    /// Create the dictionary when it does not exist
    pub create: bool,
    /// Fail with `AlreadyExists` when it does exist
    pub exclusive: bool,
    /// Makes a new dictionary secondary index `index` of the given primary
    pub secondary_of: Option<(DictionaryId, u32)>,
}

impl Default for DictionaryOptions {
    fn default() -> Self {
        Self { comparator: None, descriptor: None, create: true, exclusive: false, secondary_of: None }
    }
}

impl DictionaryOptions {
    /// Opens an existing dictionary only.
    pub fn existing() -> Self {
        Self { create: false, ..Self::default() }
    }

    pub fn with_comparator(mut self, name: impl Into<String>) -> Self {
        self.comparator = Some(name.into());
        self
    }

    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn secondary_of(mut self, primary: &Dictionary, index: u32) -> Self {
        self.secondary_of = Some((primary.id(), index));
        self
    }

    fn role(&self) -> DictionaryRole {
        match self.secondary_of {
            Some((primary, index)) => DictionaryRole::Secondary { index, primary },
            None => DictionaryRole::Primary,
        }
    }
}

/// A secondary dictionary kept in step with a primary
#[derive(Clone)]
pub(crate) struct Association {
    pub(crate) secondary: Arc<DictionaryState>,
    pub(crate) index: u32,
    pub(crate) generator: SecondaryGenerator,
}

/// Everything the environment keeps per open dictionary
pub(crate) struct DictionaryState {
    pub(crate) id: DictionaryId,
    pub(crate) entry: RwLock<CatalogEntry>,
    pub(crate) file: Arc<DictionaryFile>,
    pub(crate) tree: BPlusTree,
    pub(crate) versions: VersionStore,
    /// Secondaries registered with `associate` in this process
    pub(crate) secondaries: RwLock<Vec<Association>>,
}

impl DictionaryState {
    pub(crate) fn role(&self) -> DictionaryRole {
        self.entry.read().role
    }

    pub(crate) fn name(&self) -> String {
        self.entry.read().name.clone()
    }
}

/// Bookkeeping of the checkpoint in progress; holding the mutex excludes other checkpoints
#[derive(Debug, Default)]
struct CheckpointProgress {
    next_id: u64,
}

/// State shared by the environment and all of its handles
pub(crate) struct EnvShared {
    pub(crate) config: EnvConfig,
    registry: ComparatorRegistry,
    pub(crate) store: Arc<NodeStore>,
    pub(crate) wal: WriteAheadLog,
    pub(crate) locks: LockManager,
    pub(crate) transactions: TransactionManager,
    dictionaries: RwLock<HashMap<DictionaryId, Arc<DictionaryState>>>,
    catalog: Mutex<Catalog>,
    /// Shared while a change is logged and applied, exclusive while a checkpoint begins
    gate: RwLock<()>,
    checkpointing: Mutex<CheckpointProgress>,
    checkpoints: AtomicU64,
    /// Horizon of the last version collection
    collected_to: AtomicU64,
    space: Mutex<SpaceStatus>,
    recovery: RecoveryReport,
    closed: AtomicBool,
    lock_file: Mutex<Option<File>>,
}

impl EnvShared {
    pub(crate) fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Usage(format!("environment {} is closed", self.config.env_dir.display())));
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> StorageResult<()> {
        if self.config.read_only {
            return Err(StorageError::Usage(format!("environment {} is open read-only", self.config.env_dir.display())));
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn dictionary(&self, id: DictionaryId) -> StorageResult<Arc<DictionaryState>> {
        self.dictionaries.read().get(&id).cloned().ok_or_else(|| StorageError::NotFound(format!("dictionary {}", id)))
    }

    pub(crate) fn store_catalog_entry(&self, entry: CatalogEntry) -> StorageResult<()> {
        let mut catalog = self.catalog.lock();
        let mut updated = catalog.clone();
        updated.update(entry)?;
        updated.store(&self.config.env_dir)?;
        *catalog = updated;
        Ok(())
    }

    /// Acquires a lock for the transaction. A deadlock victim is rolled back before the error is returned.
    pub(crate) fn acquire(&self, context: &mut TransactionContext, resource: LockResource, mode: LockMode) -> StorageResult<()> {
        match self.locks.acquire(context.id(), resource, mode) {
            Err(e @ StorageError::Deadlock { .. }) => {
                context.set_abort_reason("chosen as deadlock victim");
                if let Err(rollback) = self.rollback(context) {
                    error!(txn = context.id(), error = %rollback, "rollback of deadlock victim failed");
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Takes the exclusive lock on `key` for a write and refuses the write when another
    /// transaction committed a change to the key after this transaction's snapshot.
    ///
    /// The conflicting transaction is rolled back, so the first committed updater wins.
    pub(crate) fn lock_for_write(&self, context: &mut TransactionContext, state: &DictionaryState, key: &[u8]) -> StorageResult<()> {
        self.acquire(context, LockResource::key(state.id, key), LockMode::Exclusive)?;
        if let Some(seq) = state.versions.committed_after(key, &context.view()) {
            debug!(txn = context.id(), snapshot = context.snapshot(), committed = seq, "write conflicts with a newer commit");
            return Err(StorageError::WriteConflict { txn_id: context.id(), resource: LockResource::key(state.id, key).to_string() });
        }
        Ok(())
    }

    /// Name of a catalogued secondary of `primary` that has no association in this process.
    pub(crate) fn unassociated_secondary(&self, primary: &DictionaryState) -> Option<String> {
        let associated: Vec<DictionaryId> = primary.secondaries.read().iter().map(|a| a.secondary.id).collect();
        let dictionaries = self.dictionaries.read();
        let mut missing: Vec<&Arc<DictionaryState>> = dictionaries
            .values()
            .filter(|d| matches!(d.role(), DictionaryRole::Secondary { primary: owner, .. } if owner == primary.id))
            .filter(|d| !associated.contains(&d.id))
            .collect();
        missing.sort_by_key(|d| d.id);
        missing.first().map(|d| d.name())
    }

    /// Drops versions every active snapshot sees, once the oldest snapshot has moved on.
    fn collect_versions(&self) -> usize {
        let horizon = self.transactions.horizon();
        if self.collected_to.fetch_max(horizon, Ordering::AcqRel) >= horizon {
            return 0;
        }
        let dictionaries: Vec<Arc<DictionaryState>> = self.dictionaries.read().values().cloned().collect();
        let collected: usize = dictionaries.iter().map(|d| d.versions.collect(horizon)).sum();
        if collected > 0 {
            trace!(horizon, collected, "collected versions");
        }
        collected
    }

    /// Logs and applies one change; `None` removes the key. Returns the replaced value.
    ///
    /// Steps:
    /// 1. Read the current value under the tree's write latch
    /// 2. Log the transaction's begin record with its first change
    /// 3. Log the change, remember the before-image for readers and for undo
    /// 4. Apply the change stamped with its LSN
    pub(crate) fn apply_write(&self, context: &mut TransactionContext, state: &DictionaryState, key: &[u8], value: Option<&[u8]>) -> StorageResult<Option<Vec<u8>>> {
        if let Some(value) = value {
            state.tree.check_entry(key, value)?;
        }
        let _gate = self.gate.read();
        let mut writer = state.tree.write();
        let before = writer.get(key)?;
        let entry = match (value, &before) {
            (Some(value), _) => LogEntry::put(context.id(), state.id, key, value, before.as_deref())?,
            (None, Some(before)) => LogEntry::delete(context.id(), state.id, key, before)?,
            (None, None) => return Ok(None),
        };
        if !context.has_writes() {
            let first = self.wal.append(LogEntry::begin_transaction(context.id()))?;
            self.transactions.note_first_lsn(context, first);
        }
        let lsn = self.wal.append(entry)?;
        state.versions.record(key, context.id(), before.clone());
        context.record_write(UndoRecord { dictionary: state.id, key: key.to_vec(), before: before.clone(), lsn });
        match value {
            Some(value) => writer.insert(key, value, lsn.to_u64())?,
            None => writer.remove(key, lsn.to_u64())?,
        };
        Ok(before)
    }

    /// Makes the transaction's changes durable and visible, then releases its locks.
    pub(crate) fn commit(&self, context: &mut TransactionContext) -> StorageResult<()> {
        let durability = self.config.durability;
        self.transactions.commit(context, |txn, seq| {
            if !txn.has_writes() {
                return Ok(());
            }
            let lsn = self.wal.append(LogEntry::commit_transaction(txn.id()))?;
            if durability == DurabilityMode::Sync {
                self.wal.flush_to(lsn)?;
            }
            for (dictionary, keys) in txn.written() {
                if let Ok(state) = self.dictionary(*dictionary) {
                    state.versions.mark_committed(txn.id(), keys, seq);
                }
            }
            Ok(())
        })?;
        self.locks.release_all(context.id());
        self.collect_versions();
        debug!(txn = context.id(), writes = context.write_count(), "transaction committed");
        Ok(())
    }

    /// Undoes every change of the transaction newest first, logging a compensation record for
    /// each, then logs the abort and releases the locks.
    pub(crate) fn rollback(&self, context: &mut TransactionContext) -> StorageResult<()> {
        context.set_state(TransactionState::Aborting);
        let result = self.undo_changes(context);
        for (dictionary, keys) in context.written() {
            if let Ok(state) = self.dictionary(*dictionary) {
                state.versions.discard(context.id(), keys);
            }
        }
        let result = result.and_then(|_| {
            if context.has_writes() {
                self.wal.append(LogEntry::abort_transaction(context.id()))?;
            }
            Ok(())
        });
        self.locks.release_all(context.id());
        self.transactions.finish_abort(context);
        self.collect_versions();
        debug!(txn = context.id(), reason = context.abort_reason().unwrap_or("requested"), "transaction aborted");
        result
    }

    fn undo_changes(&self, context: &mut TransactionContext) -> StorageResult<()> {
        for record in context.take_undo() {
            let state = self.dictionary(record.dictionary)?;
            let _gate = self.gate.read();
            let mut writer = state.tree.write();
            let clr = self.wal.append(LogEntry::compensation(context.id(), record.dictionary, &record.key, record.before.as_deref(), record.lsn)?)?;
            match &record.before {
                Some(value) => writer.insert(&record.key, value, clr.to_u64())?,
                None => writer.remove(&record.key, clr.to_u64())?,
            };
        }
        Ok(())
    }

    /// Runs one fuzzy checkpoint.
    ///
    /// Steps:
    /// 1. With changes paused, log CheckpointBegin and mark every dirty node as owed
    /// 2. Make the log durable up to the begin record
    /// 3. Write owed nodes while transactions continue, then each file's table and header
    /// 4. Log CheckpointEnd, store the checkpoint record and drop log segments nothing needs
    /// 5. Collect versions every snapshot sees and check free space
    fn checkpoint(&self, clean_shutdown: bool) -> StorageResult<CheckpointRecord> {
        let mut progress = self.checkpointing.lock();
        let started = Instant::now();
        let begin = {
            let _gate = self.gate.write();
            let begin = self.wal.append(LogEntry::checkpoint_begin())?;
            self.store.begin_checkpoint(begin.to_u64());
            begin
        };
        info!(begin = %begin, "checkpoint started");

        let flushed = self.wal.flush_to(begin).and_then(|_| self.store.flush_checkpoint());
        let written = match flushed {
            Ok(written) => written,
            Err(e) => {
                self.store.abort_checkpoint();
                return Err(e);
            }
        };
        let headers = self.store.finish_checkpoint()?;
        log_duration("flush", started);

        let end = self.wal.append(LogEntry::checkpoint_end(begin)?)?;
        self.wal.flush_to(end)?;

        progress.next_id += 1;
        let mut record = CheckpointRecord::new(progress.next_id, begin.to_u64(), end.to_u64(), self.transactions.last_id());
        record.clean_shutdown = clean_shutdown;
        {
            let dictionaries = self.dictionaries.read();
            for header in headers {
                let name = dictionaries.get(&header.dictionary_id).map(|d| d.name()).unwrap_or_default();
                record.dictionaries.push(DictionaryCheckpoint { id: header.dictionary_id, name, checkpoint_lsn: header.checkpoint_lsn, upgrade: header.upgrade });
            }
        }
        record.dictionaries.sort_by_key(|d| d.id);
        record.store(&self.config.env_dir)?;

        self.wal.rotate()?;
        let keep = self.transactions.oldest_first_lsn().map_or(begin, |first| first.min(begin));
        self.wal.purge_before(keep)?;

        let collected = self.collect_versions();
        self.check_space();
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        info!(
            id = record.id,
            begin = %begin,
            end = %end,
            nodes = written,
            versions_collected = collected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checkpoint finished"
        );
        Ok(record)
    }

    fn check_space(&self) {
        if self.config.redzone == 0 {
            return;
        }
        let status = match free_space_percent(&self.config.env_dir) {
            Ok(Some(free)) if free < f64::from(self.config.redzone) => {
                warn!(free_percent = free, redzone = self.config.redzone, "free space below redzone");
                SpaceStatus::Redzone
            }
            Ok(_) => SpaceStatus::Ok,
            Err(e) => {
                warn!(error = %e, "cannot determine free space");
                return;
            }
        };
        *self.space.lock() = status;
    }

    /// Drops the directory lock so another environment may open the directory.
    fn release_directory(&self) {
        self.lock_file.lock().take();
    }
}

/// Percent of the volume still available to unprivileged writers.
fn free_space_percent(path: &Path) -> StorageResult<Option<f64>> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| StorageError::Usage(format!("path {} contains a NUL byte", path.display())))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    if stat.f_blocks == 0 {
        return Ok(None);
    }
    Ok(Some(stat.f_bavail as f64 * 100.0 / stat.f_blocks as f64))
}

/// Takes the exclusive directory lock.
fn lock_directory(directory: &Path) -> StorageResult<File> {
    let file = OpenOptions::new().create(true).read(true).write(true).truncate(false).open(directory.join(LOCK_FILE))?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Err(StorageError::Usage(format!("environment {} is already open", directory.display())));
        }
        return Err(err.into());
    }
    Ok(file)
}

/// Comparator of a catalogued dictionary; secondaries order by secondary key, then primary key.
fn resolve_comparator(registry: &ComparatorRegistry, catalog: &Catalog, entry: &CatalogEntry) -> StorageResult<Comparator> {
    let lookup = |name: &str| registry.get(name).ok_or_else(|| StorageError::Usage(format!("comparator {name} is not registered")));
    let inner = lookup(&entry.comparator)?;
    match entry.role {
        DictionaryRole::Primary => Ok(inner),
        DictionaryRole::Secondary { primary, .. } => {
            let primary_entry = catalog
                .get(primary)
                .ok_or_else(|| StorageError::Inconsistent(format!("secondary {} refers to missing primary {}", entry.name, primary)))?;
            Ok(secondary_key::comparator(inner, lookup(&primary_entry.comparator)?))
        }
    }
}

fn open_dictionary_file(config: &EnvConfig, registry: &ComparatorRegistry, catalog: &Catalog, store: &Arc<NodeStore>, entry: &CatalogEntry) -> StorageResult<DictionaryState> {
    let path = entry.path(&config.env_dir);
    if !path.exists() {
        return Err(StorageError::Inconsistent(format!("file {} of dictionary {} is missing", path.display(), entry.name)));
    }
    let file = DictionaryFile::open(&path, config.io_retry_limit)?;
    if file.dictionary_id() != entry.id {
        return Err(StorageError::Inconsistent(format!("file {} belongs to dictionary {}, not {}", path.display(), file.dictionary_id(), entry.id)));
    }
    if file.node_size() != config.node_size {
        return Err(StorageError::Usage(format!("dictionary {} uses {} byte nodes but the environment is configured for {}", entry.name, file.node_size(), config.node_size)));
    }
    let header = file.header();
    if header.upgrade.target != config.node_layout {
        let corrected = file.rescan_layouts()?;
        debug!(dictionary = %entry.name, corrected, "re-derived upgrade progress for a new target layout");
    }
    if let Some(hint) = config.upgrade_source_version
        && header.created_layout != hint
        && header.created_layout != config.node_layout
    {
        warn!(dictionary = %entry.name, created = %header.created_layout, hint = %hint, "dictionary was created with a layout other than the upgrade source");
    }
    let comparator = resolve_comparator(registry, catalog, entry)?;
    let file = Arc::new(file);
    store.register(Arc::clone(&file));
    Ok(DictionaryState {
        id: entry.id,
        entry: RwLock::new(entry.clone()),
        file,
        tree: BPlusTree::new(entry.id, Arc::clone(store), comparator.clone()),
        versions: VersionStore::new(entry.id, comparator),
        secondaries: RwLock::new(Vec::new()),
    })
}

/// Refuses a read-only open while the log still holds work for recovery.
fn ensure_quiescent(record: Option<&CheckpointRecord>, wal: &WriteAheadLog) -> StorageResult<()> {
    let Some(record) = record.filter(|r| r.clean_shutdown) else {
        return Err(StorageError::Usage("environment was not closed cleanly; open it writable to recover".into()));
    };
    let end = LogSequenceNumber::from_u64(record.end_lsn);
    let mut later = 0u64;
    let scan = wal.read_records(|entry| {
        if entry.lsn() > end {
            later += 1;
        }
        Ok(())
    })?;
    if later > 0 || scan.torn_bytes > 0 {
        return Err(StorageError::Usage(format!("log holds {later} records after the last checkpoint; open it writable to recover")));
    }
    Ok(())
}

/// Checks that the files and the log still describe the recorded checkpoint.
fn validate_against_record(record: &CheckpointRecord, dictionaries: &HashMap<DictionaryId, Arc<DictionaryState>>, wal: &WriteAheadLog) -> StorageResult<()> {
    for recorded in &record.dictionaries {
        if let Some(state) = dictionaries.get(&recorded.id) {
            let header_lsn = state.file.header().checkpoint_lsn;
            if header_lsn < recorded.checkpoint_lsn {
                return Err(StorageError::Inconsistent(format!(
                    "dictionary {} was checkpointed at {} but its file only reaches {}",
                    recorded.name,
                    LogSequenceNumber::from_u64(recorded.checkpoint_lsn),
                    LogSequenceNumber::from_u64(header_lsn)
                )));
            }
        }
    }
    let begin = LogSequenceNumber::from_u64(record.begin_lsn);
    let first = wal.first_lsn()?;
    if first > begin {
        return Err(StorageError::Inconsistent(format!("log starts at {first} after the last checkpoint at {begin}")));
    }
    if wal.current_lsn() < LogSequenceNumber::from_u64(record.end_lsn) {
        return Err(StorageError::Inconsistent(format!("log ends before the last checkpoint at {}", LogSequenceNumber::from_u64(record.end_lsn))));
    }
    Ok(())
}

/// Environment owning one storage directory.
///
/// Open runs recovery; close writes a final checkpoint so the next open has nothing to redo.
/// Dropping an environment that was not closed closes it on a best-effort basis.
pub struct Environment {
    shared: Arc<EnvShared>,
    coordinator: Mutex<Option<CheckpointCoordinator>>,
}

impl Environment {
    /// Opens or creates the environment with only the bytewise comparator registered.
    pub fn open(config: EnvConfig) -> StorageResult<Self> {
        Self::open_with(config, ComparatorRegistry::new())
    }

    /// Whether `directory` holds an environment that was opened before.
    pub fn exists(directory: &Path) -> bool {
        directory.join(catalog::CATALOG_FILE).is_file() || directory.join(CHECKPOINT_FILE).is_file()
    }

    /// Opens or creates the environment in `config.env_dir`. A read-only open requires an
    /// existing, cleanly closed environment.
    ///
    /// Steps:
    /// 1. Validate the configuration and lock the directory
    /// 2. Load the catalog, adopt the node size of existing files and open every dictionary file
    /// 3. Open the log and check it against the last checkpoint record
    /// 4. Recover, and checkpoint when recovery changed anything
    /// 5. Start the checkpoint coordinator
    pub fn open_with(mut config: EnvConfig, registry: ComparatorRegistry) -> StorageResult<Self> {
        let started = Instant::now();
        config.validate()?;
        let directory = config.env_dir.clone();
        if config.read_only {
            if !Self::exists(&directory) {
                return Err(StorageError::NotFound(format!("no environment in {}", directory.display())));
            }
        } else {
            fs::create_dir_all(&directory)?;
        }
        let lock_file = lock_directory(&directory)?;

        let catalog = Catalog::load(&directory)?;
        if catalog.len() > config.max_dictionaries {
            return Err(StorageError::Usage(format!("catalog holds {} dictionaries, more than the configured {}", catalog.len(), config.max_dictionaries)));
        }
        if let Some(first) = catalog.dictionaries.first() {
            let stored = DictionaryFile::open(&first.path(&directory), config.io_retry_limit)?.node_size();
            if stored != config.node_size {
                info!(configured = config.node_size, stored, "using the node size of the existing dictionary files");
                config.node_size = stored;
            }
        }
        let record = CheckpointRecord::load(&directory)?;
        let store = Arc::new(NodeStore::new(config.cache_capacity(), config.node_size, config.node_layout).with_read_only(config.read_only));

        let mut dictionaries = HashMap::new();
        for entry in &catalog.dictionaries {
            let state = open_dictionary_file(&config, &registry, &catalog, &store, entry)?;
            dictionaries.insert(entry.id, Arc::new(state));
        }

        let wal = WriteAheadLog::open(WalConfig { directory: directory.clone(), max_file_size: config.log_segment_size, io_retries: config.io_retry_limit })?;
        if let Some(record) = &record {
            validate_against_record(record, &dictionaries, &wal)?;
            if !record.clean_shutdown {
                info!(checkpoint = record.id, "environment was not closed cleanly");
            }
        }

        let report = if config.read_only {
            ensure_quiescent(record.as_ref(), &wal)?;
            RecoveryReport::default()
        } else {
            let targets: HashMap<DictionaryId, RecoveryTarget<'_>> = dictionaries
                .iter()
                .map(|(id, state)| (*id, RecoveryTarget { tree: &state.tree, checkpoint_lsn: state.file.header().checkpoint_lsn }))
                .collect();
            recover(&wal, &targets).map_err(|e| match e {
                StorageError::Corruption(_) | StorageError::Inconsistent(_) => e,
                other => StorageError::Inconsistent(format!("recovery failed: {other}")),
            })?
        };

        let last_txn = report.max_transaction_id.max(record.as_ref().map_or(0, |r| r.last_txn_id));
        let shared = Arc::new(EnvShared {
            registry,
            store,
            wal,
            locks: LockManager::new(config.lock_timeout_ms),
            transactions: TransactionManager::new(last_txn + 1),
            dictionaries: RwLock::new(dictionaries),
            catalog: Mutex::new(catalog),
            gate: RwLock::new(()),
            checkpointing: Mutex::new(CheckpointProgress { next_id: record.as_ref().map_or(0, |r| r.id) }),
            checkpoints: AtomicU64::new(0),
            collected_to: AtomicU64::new(0),
            space: Mutex::new(SpaceStatus::Ok),
            recovery: report,
            closed: AtomicBool::new(false),
            lock_file: Mutex::new(Some(lock_file)),
            config,
        });
        if report.did_work() {
            shared.checkpoint(false)?;
        }
        shared.check_space();

        let coordinator = if shared.config.checkpoint_period > 0 && !shared.config.read_only {
            let weak = Arc::downgrade(&shared);
            Some(CheckpointCoordinator::start(Duration::from_secs(shared.config.checkpoint_period), move || {
                let Some(shared) = weak.upgrade() else { return false };
                if shared.is_closed() {
                    return false;
                }
                if let Err(e) = shared.checkpoint(false) {
                    error!(error = %e, "periodic checkpoint failed");
                }
                true
            })?)
        } else {
            None
        };

        info!(
            directory = %shared.config.env_dir.display(),
            dictionaries = shared.dictionaries.read().len(),
            read_only = shared.config.read_only,
            next_txn = last_txn + 1,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "environment opened"
        );
        Ok(Self { shared, coordinator: Mutex::new(coordinator) })
    }

    pub fn config(&self) -> &EnvConfig {
        &self.shared.config
    }

    /// Starts a transaction that sees every commit made so far.
    pub fn begin(&self) -> StorageResult<Transaction> {
        self.shared.ensure_open()?;
        let context = self.shared.transactions.begin();
        debug!(txn = context.id(), snapshot = context.snapshot(), "transaction started");
        Ok(Transaction::new(Arc::clone(&self.shared), context))
    }

    /// Opens the dictionary called `name`, creating it when allowed by `options`.
    pub fn open_dictionary(&self, name: &str, options: DictionaryOptions) -> StorageResult<Dictionary> {
        self.shared.ensure_open()?;
        if name.is_empty() {
            return Err(StorageError::Usage("dictionary name must not be empty".into()));
        }
        // creation registers a file, which a running checkpoint must not see half-way
        let _checkpoint = self.shared.checkpointing.lock();
        let mut catalog = self.shared.catalog.lock();

        if let Some(entry) = catalog.find(name) {
            if options.exclusive {
                return Err(StorageError::AlreadyExists(format!("dictionary {name}")));
            }
            if let Some(comparator) = &options.comparator
                && *comparator != entry.comparator
            {
                return Err(StorageError::Usage(format!("dictionary {name} uses comparator {}, not {comparator}", entry.comparator)));
            }
            if options.secondary_of.is_some() && entry.role != options.role() {
                return Err(StorageError::Usage(format!("dictionary {name} has role {:?}", entry.role)));
            }
            let state = self.shared.dictionary(entry.id)?;
            return Ok(Dictionary::new(Arc::clone(&self.shared), state));
        }
        if !options.create || self.shared.config.read_only {
            return Err(StorageError::NotFound(format!("dictionary {name}")));
        }
        if catalog.len() >= self.shared.config.max_dictionaries {
            return Err(StorageError::Usage(format!("environment already holds the maximum of {} dictionaries", self.shared.config.max_dictionaries)));
        }
        let comparator_name = options.comparator.clone().unwrap_or_else(|| BYTEWISE.to_string());
        if !self.shared.registry.contains(&comparator_name) {
            return Err(StorageError::Usage(format!("comparator {comparator_name} is not registered")));
        }
        if let Some((primary, _)) = options.secondary_of {
            let primary_entry = catalog.get(primary).ok_or_else(|| StorageError::NotFound(format!("primary dictionary {primary}")))?;
            if primary_entry.role.is_secondary() {
                return Err(StorageError::Usage(format!("dictionary {} is itself a secondary", primary_entry.name)));
            }
        }

        let mut updated = catalog.clone();
        let (id, file_name) = updated.allocate(name);
        let entry = CatalogEntry {
            id,
            name: name.to_string(),
            file: file_name,
            role: options.role(),
            comparator: comparator_name,
            descriptor: options.descriptor.clone().unwrap_or_default(),
        };
        let path = entry.path(&self.shared.config.env_dir);
        if path.exists() {
            warn!(path = %path.display(), "removing orphaned dictionary file");
            fs::remove_file(&path)?;
        }
        let lsn = self.shared.wal.current_lsn().to_u64();
        let file = DictionaryFile::create(&path, id, self.shared.config.node_size, self.shared.config.node_layout, lsn, self.shared.config.io_retry_limit)?;
        updated.insert(entry.clone())?;
        updated.store(&self.shared.config.env_dir)?;

        let comparator = resolve_comparator(&self.shared.registry, &updated, &entry)?;
        *catalog = updated;
        let file = Arc::new(file);
        self.shared.store.register(Arc::clone(&file));
        let state = Arc::new(DictionaryState {
            id,
            entry: RwLock::new(entry),
            file,
            tree: BPlusTree::new(id, Arc::clone(&self.shared.store), comparator.clone()),
            versions: VersionStore::new(id, comparator),
            secondaries: RwLock::new(Vec::new()),
        });
        self.shared.dictionaries.write().insert(id, Arc::clone(&state));
        info!(dictionary = name, id = %id, "created dictionary");
        Ok(Dictionary::new(Arc::clone(&self.shared), state))
    }

    /// Names of every catalogued dictionary, in creation order.
    pub fn dictionary_names(&self) -> Vec<String> {
        self.shared.catalog.lock().dictionaries.iter().map(|d| d.name.clone()).collect()
    }

    /// Keeps `secondary` in step with `primary`: every later put or delete on `primary` writes
    /// the entries `generator` derives into `secondary` within the same transaction.
    ///
    /// Associations last for the life of this environment; existing rows are not indexed.
    pub fn associate(&self, primary: &Dictionary, secondary: &Dictionary, generator: SecondaryGenerator) -> StorageResult<()> {
        self.shared.ensure_open()?;
        if primary.id() == secondary.id() {
            return Err(StorageError::Usage(format!("dictionary {} cannot index itself", primary.name())));
        }
        if primary.role().is_secondary() {
            return Err(StorageError::Usage(format!("dictionary {} is a secondary and cannot have secondaries", primary.name())));
        }
        let index = match secondary.role() {
            DictionaryRole::Secondary { index, primary: owner } if owner == primary.id() => index,
            role => {
                return Err(StorageError::Usage(format!("dictionary {} has role {:?} and is not a secondary of {}", secondary.name(), role, primary.name())));
            }
        };
        let association = Association { secondary: Arc::clone(secondary.state()), index, generator };
        let mut secondaries = primary.state().secondaries.write();
        secondaries.retain(|a| a.secondary.id != secondary.id());
        secondaries.push(association);
        secondaries.sort_by_key(|a| a.index);
        debug!(primary = %primary.name(), secondary = %secondary.name(), index, "associated secondary dictionary");
        Ok(())
    }

    /// Runs a checkpoint now.
    pub fn checkpoint(&self) -> StorageResult<CheckpointRecord> {
        self.shared.ensure_open()?;
        self.shared.ensure_writable()?;
        self.shared.checkpoint(false)
    }

    pub fn stats(&self) -> EnvStats {
        EnvStats {
            cache: self.shared.store.statistics(),
            nodes_upgraded: self.shared.store.upgraded_count(),
            locks: self.shared.locks.statistics(),
            transactions: self.shared.transactions.statistics(),
            checkpoints: self.shared.checkpoints.load(Ordering::Relaxed),
            current_lsn: self.shared.wal.current_lsn(),
            dictionaries: self.shared.dictionaries.read().len(),
            space: *self.shared.space.lock(),
            recovery: self.shared.recovery,
        }
    }

    pub fn space_status(&self) -> SpaceStatus {
        *self.shared.space.lock()
    }

    /// Closes the environment with a final checkpoint. Fails while transactions are active,
    /// in which case the environment is shut down as if dropped.
    pub fn close(self) -> StorageResult<()> {
        let active = self.shared.transactions.active_count();
        if active > 0 {
            return Err(StorageError::Usage(format!("cannot close environment with {active} active transactions")));
        }
        self.shutdown()
    }

    /// Abandons the environment like a killed process: nothing is flushed or checkpointed and
    /// the directory lock is released. Outstanding handles stop working.
    pub fn simulate_crash(self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(mut coordinator) = self.coordinator.lock().take() {
            coordinator.stop();
        }
        self.shared.release_directory();
        warn!(directory = %self.shared.config.env_dir.display(), "environment abandoned without shutdown");
    }

    fn shutdown(&self) -> StorageResult<()> {
        if self.shared.is_closed() {
            return Ok(());
        }
        if let Some(mut coordinator) = self.coordinator.lock().take() {
            coordinator.stop();
        }
        let clean = self.shared.transactions.active_count() == 0;
        let result = if self.shared.config.read_only { Ok(()) } else { self.shared.checkpoint(clean).map(|_| ()) };
        self.shared.closed.store(true, Ordering::Release);
        self.shared.release_directory();
        match &result {
            Ok(()) => info!(directory = %self.shared.config.env_dir.display(), "environment closed"),
            Err(e) => error!(directory = %self.shared.config.env_dir.display(), error = %e, "final checkpoint failed"),
        }
        result
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            let _ = self.shutdown();
        }
    }
}
