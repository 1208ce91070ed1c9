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

// Transaction management module
// This module tracks transaction lifecycles: identifiers, snapshots, the commit sequence that orders visibility, and the undo information each transaction accumulates. Applying writes and rolling them back is done by the environment, which owns the dictionaries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult, TransactionId};
use crate::storage_engine::mvcc::{ReadView, Timestamp};
use crate::storage_engine::wal::LogSequenceNumber;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionState {
    /// Transaction is active and can perform operations
    Active,
    /// Commit record is being written
    Committing,
    /// Transaction is committed
    Committed,
    /// Changes are being rolled back
    Aborting,
    /// Transaction is rolled back
    Aborted,
}

/// Enough information to reverse one logged change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub dictionary: DictionaryId,
    pub key: Vec<u8>,
    /// Value to restore; `None` removes the key
    pub before: Option<Vec<u8>>,
    /// Record being reversed
    pub lsn: LogSequenceNumber,
}

/// Per-transaction state owned by the transaction handle
#[derive(Debug)]
pub struct TransactionContext {
    id: TransactionId,
    snapshot: Timestamp,
    state: TransactionState,
    /// LSN of the transaction's begin record, written lazily with its first change
    first_lsn: Option<LogSequenceNumber>,
    /// Logged changes, oldest first
    undo: Vec<UndoRecord>,
    /// Keys written per dictionary, for version bookkeeping
    written: BTreeMap<DictionaryId, Vec<Vec<u8>>>,
    /// Why the transaction was aborted by the engine
    abort_reason: Option<String>,
    start_time: Instant,
}

impl TransactionContext {
    fn new(id: TransactionId, snapshot: Timestamp) -> Self {
        Self {
            id,
            snapshot,
            state: TransactionState::Active,
            first_lsn: None,
            undo: Vec::new(),
            written: BTreeMap::new(),
            abort_reason: None,
            start_time: Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn snapshot(&self) -> Timestamp {
        self.snapshot
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Fails unless the transaction can still issue operations.
    pub fn ensure_active(&self) -> StorageResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Aborted | TransactionState::Aborting => Err(StorageError::TransactionAborted(format!(
                "transaction {} was aborted{}",
                self.id,
                self.abort_reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
            ))),
            TransactionState::Committing | TransactionState::Committed => Err(StorageError::Usage(format!("transaction {} has already committed", self.id))),
        }
    }

    pub fn view(&self) -> ReadView {
        ReadView { txn_id: self.id, snapshot: self.snapshot }
    }

    pub fn first_lsn(&self) -> Option<LogSequenceNumber> {
        self.first_lsn
    }

    pub fn set_first_lsn(&mut self, lsn: LogSequenceNumber) {
        self.first_lsn.get_or_insert(lsn);
    }

    pub fn has_writes(&self) -> bool {
        self.first_lsn.is_some()
    }

    /// Remembers a logged change so it can be undone.
    pub fn record_write(&mut self, record: UndoRecord) {
        self.written.entry(record.dictionary).or_default().push(record.key.clone());
        self.undo.push(record);
    }

    /// Hands out the undo records, newest first.
    pub fn take_undo(&mut self) -> Vec<UndoRecord> {
        let mut undo = std::mem::take(&mut self.undo);
        undo.reverse();
        undo
    }

    pub fn written(&self) -> &BTreeMap<DictionaryId, Vec<Vec<u8>>> {
        &self.written
    }

    pub fn write_count(&self) -> usize {
        self.undo.len()
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub fn set_abort_reason(&mut self, reason: impl Into<String>) {
        self.abort_reason.get_or_insert(reason.into());
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveTransaction {
    snapshot: Timestamp,
    first_lsn: Option<LogSequenceNumber>,
}

/// Transaction statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStatistics {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub active: usize,
    /// Commit sequence of the newest commit
    pub commit_sequence: Timestamp,
}

/// TransactionManager hands out transaction ids and snapshots and orders commits.
pub struct TransactionManager {
    next_id: AtomicU64,
    /// Commit sequence; held while a commit is made visible so snapshots never see half of one
    commit_seq: Mutex<Timestamp>,
    active: Mutex<BTreeMap<TransactionId, ActiveTransaction>>,
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TransactionManager {
    /// Creates a manager whose first transaction gets `next_id`.
    pub fn new(next_id: TransactionId) -> Self {
        Self {
            next_id: AtomicU64::new(next_id.max(1)),
            commit_seq: Mutex::new(0),
            active: Mutex::new(BTreeMap::new()),
            started: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    /// Starts a transaction that sees every commit made so far.
    pub fn begin(&self) -> TransactionContext {
        let seq = self.commit_seq.lock();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.active.lock().insert(id, ActiveTransaction { snapshot: *seq, first_lsn: None });
        self.started.fetch_add(1, Ordering::Relaxed);
        TransactionContext::new(id, *seq)
    }

    /// Registers the first log record of a transaction, which pins the log from there on.
    pub fn note_first_lsn(&self, context: &mut TransactionContext, lsn: LogSequenceNumber) {
        context.set_first_lsn(lsn);
        if let Some(active) = self.active.lock().get_mut(&context.id) {
            active.first_lsn.get_or_insert(lsn);
        }
    }

    /// Commits `context`: `publish` receives the transaction and its new commit sequence and must
    /// make the transaction durable and visible; the sequence only advances when it succeeds.
    pub fn commit<F>(&self, context: &mut TransactionContext, publish: F) -> StorageResult<Timestamp>
    where
        F: FnOnce(&TransactionContext, Timestamp) -> StorageResult<()>,
    {
        context.ensure_active()?;
        context.state = TransactionState::Committing;
        let mut seq = self.commit_seq.lock();
        let next = *seq + 1;
        if let Err(e) = publish(&*context, next) {
            context.state = TransactionState::Active;
            return Err(e);
        }
        *seq = next;
        drop(seq);
        context.state = TransactionState::Committed;
        self.active.lock().remove(&context.id);
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(next)
    }

    /// Forgets a rolled back transaction.
    pub fn finish_abort(&self, context: &mut TransactionContext) {
        context.state = TransactionState::Aborted;
        if self.active.lock().remove(&context.id).is_some() {
            self.aborted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Oldest snapshot still in use; versions committed at or below it are visible to everyone.
    pub fn horizon(&self) -> Timestamp {
        let seq = *self.commit_seq.lock();
        self.active.lock().values().map(|a| a.snapshot).min().unwrap_or(seq).min(seq)
    }

    /// First log record any active transaction may still need for rollback.
    pub fn oldest_first_lsn(&self) -> Option<LogSequenceNumber> {
        self.active.lock().values().filter_map(|a| a.first_lsn).min()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Highest id handed out so far.
    pub fn last_id(&self) -> TransactionId {
        self.next_id.load(Ordering::SeqCst).saturating_sub(1)
    }

    pub fn statistics(&self) -> TransactionStatistics {
        TransactionStatistics {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            active: self.active_count(),
            commit_sequence: *self.commit_seq.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsn(offset: u64) -> LogSequenceNumber {
        LogSequenceNumber { file_id: 0, offset }
    }

    #[test]
    fn test_snapshots_follow_commits() {
        let manager = TransactionManager::new(10);
        let mut first = manager.begin();
        let second = manager.begin();
        assert_eq!(first.id(), 10);
        assert_eq!(second.id(), 11);
        assert_eq!(first.snapshot(), 0);

        let seq = manager.commit(&mut first, |_, _| Ok(())).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(first.state(), TransactionState::Committed);
        assert_eq!(manager.begin().snapshot(), 1);
        // the still-active second transaction holds the horizon back
        assert_eq!(manager.horizon(), 0);
        assert_eq!(manager.last_id(), 12);
    }

    #[test]
    fn test_failed_publish_keeps_transaction_active() {
        let manager = TransactionManager::new(1);
        let mut txn = manager.begin();
        let err = manager.commit(&mut txn, |_, _| Err(StorageError::Usage("disk full".into()))).unwrap_err();
        assert!(matches!(err, StorageError::Usage(_)));
        assert!(txn.is_active());
        assert_eq!(manager.statistics().commit_sequence, 0);
    }

    #[test]
    fn test_abort_state_and_reason() {
        let manager = TransactionManager::new(1);
        let mut txn = manager.begin();
        txn.set_abort_reason("chosen as deadlock victim");
        manager.finish_abort(&mut txn);
        let err = txn.ensure_active().unwrap_err();
        assert!(matches!(err, StorageError::TransactionAborted(ref msg) if msg.contains("deadlock")));
        assert_eq!(manager.statistics().aborted, 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_undo_is_newest_first_and_pins_log() {
        let manager = TransactionManager::new(1);
        let mut txn = manager.begin();
        manager.note_first_lsn(&mut txn, lsn(200));
        for (i, key) in [b"a", b"b"].iter().enumerate() {
            txn.record_write(UndoRecord { dictionary: DictionaryId(1), key: key.to_vec(), before: None, lsn: lsn(300 + i as u64) });
        }
        assert_eq!(manager.oldest_first_lsn(), Some(lsn(200)));
        assert_eq!(txn.written()[&DictionaryId(1)].len(), 2);
        let undo = txn.take_undo();
        assert_eq!(undo[0].key, b"b".to_vec());
        assert_eq!(txn.write_count(), 0);
    }
}
