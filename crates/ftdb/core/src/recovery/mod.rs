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

// Recovery module
// Brings dictionary files back to the state described by the log after an unclean shutdown: every logged change is repeated, then changes of transactions that never finished are undone.

pub mod checkpoint;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::indices::b_plus_tree::BPlusTree;
use crate::indices::lib::ApplyOutcome;
use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult, TransactionId};
use crate::storage_engine::wal::{LogEntry, LogOperation, LogSequenceNumber, RecordType, WriteAheadLog};

pub use checkpoint::{CHECKPOINT_FILE, CheckpointCoordinator, CheckpointRecord, DictionaryCheckpoint};

/// A dictionary taking part in recovery
pub struct RecoveryTarget<'a> {
    pub tree: &'a BPlusTree,
    /// Changes at or after this packed LSN may be missing from the file
    pub checkpoint_lsn: u64,
}

/// Summary of one recovery run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Valid records scanned
    pub records: u64,
    /// Changes applied to the trees
    pub redone: u64,
    /// Changes already present in the trees
    pub skipped: u64,
    /// Changes rolled back for unfinished transactions
    pub undone: u64,
    /// Transactions without a Commit or Abort record
    pub losers: u64,
    /// Bytes cut from the log tail
    pub torn_bytes: u64,
    /// Position after the last valid record
    pub end: LogSequenceNumber,
    /// Highest transaction id seen in the log
    pub max_transaction_id: TransactionId,
}

impl RecoveryReport {
    /// Whether recovery changed anything that a checkpoint should make durable.
    pub fn did_work(&self) -> bool {
        self.redone > 0 || self.undone > 0 || self.losers > 0 || self.torn_bytes > 0
    }
}

/// A change of an unfinished transaction that may need undoing
#[derive(Debug, Clone)]
struct PendingChange {
    lsn: LogSequenceNumber,
    dictionary: DictionaryId,
    key: Vec<u8>,
    before: Option<Vec<u8>>,
}

/// What the analysis pass learned from the log
#[derive(Debug, Default)]
struct Analysis {
    /// Changes of transactions that have not finished yet, by transaction
    unfinished: BTreeMap<TransactionId, Vec<PendingChange>>,
    /// Packed LSNs already compensated before the crash
    compensated: HashSet<u64>,
    max_transaction_id: TransactionId,
}

impl Analysis {
    fn observe(&mut self, entry: &LogEntry, targets: &HashMap<DictionaryId, RecoveryTarget<'_>>) -> StorageResult<()> {
        let txn = entry.transaction_id();
        self.max_transaction_id = self.max_transaction_id.max(txn);
        match entry.record_type() {
            RecordType::Begin => {
                self.unfinished.entry(txn).or_default();
            }
            RecordType::Commit | RecordType::Abort => {
                self.unfinished.remove(&txn);
            }
            RecordType::Put | RecordType::Delete | RecordType::Compensation => {
                if !targets.contains_key(&entry.dictionary_id()) {
                    return Err(StorageError::Inconsistent(format!("log record {} refers to unknown dictionary {}", entry.lsn(), entry.dictionary_id())));
                }
                let change = match entry.operation()? {
                    Some(LogOperation::Put { key, before, .. }) => PendingChange { lsn: entry.lsn(), dictionary: entry.dictionary_id(), key, before },
                    Some(LogOperation::Delete { key, before }) => PendingChange { lsn: entry.lsn(), dictionary: entry.dictionary_id(), key, before: Some(before) },
                    Some(LogOperation::Compensation { compensates, .. }) => {
                        self.compensated.insert(compensates);
                        return Ok(());
                    }
                    _ => return Err(StorageError::Corruption(format!("log record {} has a payload that does not match its type", entry.lsn()))),
                };
                self.unfinished.entry(txn).or_default().push(change);
            }
            RecordType::CheckpointBegin | RecordType::CheckpointEnd => {}
        }
        Ok(())
    }
}

/// Replays a data record against its tree unless the file already holds it.
fn redo(entry: &LogEntry, targets: &HashMap<DictionaryId, RecoveryTarget<'_>>, report: &mut RecoveryReport) -> StorageResult<()> {
    let Some(target) = targets.get(&entry.dictionary_id()) else {
        return Ok(());
    };
    let lsn = entry.lsn().to_u64();
    if lsn < target.checkpoint_lsn {
        report.skipped += 1;
        return Ok(());
    }
    let mut writer = target.tree.write();
    let outcome = match entry.operation()? {
        Some(LogOperation::Put { key, value, .. }) => writer.insert(&key, &value, lsn)?,
        Some(LogOperation::Delete { key, .. }) => writer.remove(&key, lsn)?,
        Some(LogOperation::Compensation { key, value: Some(value), .. }) => writer.insert(&key, &value, lsn)?,
        Some(LogOperation::Compensation { key, value: None, .. }) => writer.remove(&key, lsn)?,
        _ => return Ok(()),
    };
    match outcome {
        ApplyOutcome::Skipped => report.skipped += 1,
        ApplyOutcome::Applied { .. } => report.redone += 1,
    }
    Ok(())
}

/// Runs crash recovery over the retained log.
///
/// Steps:
/// 1. Analysis: find transactions that never finished and changes already compensated
/// 2. Cut a torn tail off the log
/// 3. Redo: repeat every change newer than its dictionary's checkpoint
/// 4. Undo: roll back unfinished transactions newest change first, logging a compensation
///    record for each change and an Abort record for each transaction
pub fn recover(wal: &WriteAheadLog, targets: &HashMap<DictionaryId, RecoveryTarget<'_>>) -> StorageResult<RecoveryReport> {
    let started = Instant::now();
    let mut analysis = Analysis::default();
    let scan = wal.read_records(|entry| analysis.observe(&entry, targets))?;
    let mut report = RecoveryReport { records: scan.records, torn_bytes: scan.torn_bytes, end: scan.end, max_transaction_id: analysis.max_transaction_id, ..Default::default() };
    info!(records = scan.records, unfinished = analysis.unfinished.len(), end = %scan.end, "recovery analysis finished");

    if scan.torn_bytes > 0 {
        warn!(bytes = scan.torn_bytes, end = %scan.end, "discarding torn log tail");
    }
    wal.truncate_at(scan.end)?;

    wal.read_records(|entry| redo(&entry, targets, &mut report))?;
    info!(redone = report.redone, skipped = report.skipped, "recovery redo finished");

    let mut changes: Vec<(TransactionId, PendingChange)> = Vec::new();
    for (txn, pending) in &analysis.unfinished {
        changes.extend(pending.iter().filter(|c| !analysis.compensated.contains(&c.lsn.to_u64())).map(|c| (*txn, c.clone())));
    }
    changes.sort_by(|a, b| b.1.lsn.cmp(&a.1.lsn));

    for (txn, change) in &changes {
        let target = targets
            .get(&change.dictionary)
            .ok_or_else(|| StorageError::Inconsistent(format!("no dictionary {} to undo into", change.dictionary)))?;
        let mut writer = target.tree.write();
        let clr = wal.append(LogEntry::compensation(*txn, change.dictionary, &change.key, change.before.as_deref(), change.lsn)?)?;
        match &change.before {
            Some(value) => writer.insert(&change.key, value, clr.to_u64())?,
            None => writer.remove(&change.key, clr.to_u64())?,
        };
        debug!(txn, dictionary = %change.dictionary, undone = %change.lsn, "undid change");
        report.undone += 1;
    }
    for txn in analysis.unfinished.keys() {
        wal.append(LogEntry::abort_transaction(*txn))?;
        report.losers += 1;
    }
    if report.losers > 0 {
        wal.flush_to(wal.current_lsn())?;
    }

    info!(
        records = report.records,
        redone = report.redone,
        undone = report.undone,
        losers = report.losers,
        torn_bytes = report.torn_bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "recovery finished"
    );
    Ok(report)
}
