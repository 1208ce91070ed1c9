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

// Write-ahead logging module
// This module provides durability and crash recovery by logging every logical change before it may reach durable node state. Records carry enough payload to redo and undo the change, are checksummed, and live in rotating segment files.

use std::convert::TryInto;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage_engine::lib::{DictionaryId, Flushable, StorageError, StorageResult, TransactionId, decode, encode, retry_io};

/// Magic number to identify log segments (FTLG)
const WAL_MAGIC: [u8; 4] = *b"FTLG";
/// Current log format version
const WAL_VERSION: u32 = 1;
/// Size of the segment header in bytes
pub const WAL_HEADER_SIZE: u64 = 128;
/// Size of a record header in bytes
const RECORD_HEADER_SIZE: usize = 37;
/// Segment file name prefix
const SEGMENT_PREFIX: &str = "log.";

/// Types of log records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Begin transaction
    Begin = 0,
    /// Commit transaction
    Commit = 1,
    /// Abort transaction (all undo already logged)
    Abort = 2,
    /// Insert or replace a key
    Put = 3,
    /// Remove a key
    Delete = 4,
    /// Redo-only record written while undoing
    Compensation = 5,
    /// Fuzzy checkpoint started
    CheckpointBegin = 6,
    /// Fuzzy checkpoint completed
    CheckpointEnd = 7,
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RecordType::Begin),
            1 => Ok(RecordType::Commit),
            2 => Ok(RecordType::Abort),
            3 => Ok(RecordType::Put),
            4 => Ok(RecordType::Delete),
            5 => Ok(RecordType::Compensation),
            6 => Ok(RecordType::CheckpointBegin),
            7 => Ok(RecordType::CheckpointEnd),
            other => Err(other),
        }
    }
}

/// Log Sequence Number uniquely identifies a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogSequenceNumber {
    /// Segment holding the record
    pub file_id: u32,
    /// Offset within the segment
    pub offset: u64,
}

impl LogSequenceNumber {
    const OFFSET_BITS: u32 = 40;

    /// Packs the LSN into one ordered integer, as stamped on nodes.
    pub fn to_u64(self) -> u64 {
        ((self.file_id as u64) << Self::OFFSET_BITS) | (self.offset & ((1 << Self::OFFSET_BITS) - 1))
    }

    pub fn from_u64(packed: u64) -> Self {
        Self { file_id: (packed >> Self::OFFSET_BITS) as u32, offset: packed & ((1 << Self::OFFSET_BITS) - 1) }
    }
}

impl fmt::Display for LogSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.offset)
    }
}

/// Header for a log record
#[derive(Debug, Clone)]
struct RecordHeader {
    /// Type of record
    record_type: RecordType,
    /// Log sequence number
    lsn: LogSequenceNumber,
    /// Transaction ID (0 for checkpoint records)
    transaction_id: TransactionId,
    /// Dictionary the operation applies to (0 when not applicable)
    dictionary_id: DictionaryId,
    /// Checksum of header and payload with this field zeroed
    checksum: u32,
    /// Length of the record payload
    data_length: u32,
}

impl RecordHeader {
    fn new(record_type: RecordType, transaction_id: TransactionId, dictionary_id: DictionaryId) -> Self {
        Self {
            record_type,
            lsn: LogSequenceNumber::default(),
            transaction_id,
            dictionary_id,
            checksum: 0,
            data_length: 0,
        }
    }

    /// Serialize the header to bytes
    fn serialize(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buffer = [0u8; RECORD_HEADER_SIZE];
        buffer[0] = self.record_type as u8;
        buffer[1..5].copy_from_slice(&self.lsn.file_id.to_le_bytes());
        buffer[5..13].copy_from_slice(&self.lsn.offset.to_le_bytes());
        buffer[13..21].copy_from_slice(&self.transaction_id.to_le_bytes());
        buffer[21..29].copy_from_slice(&self.dictionary_id.0.to_le_bytes());
        buffer[29..33].copy_from_slice(&self.checksum.to_le_bytes());
        buffer[33..37].copy_from_slice(&self.data_length.to_le_bytes());
        buffer
    }

    /// Deserialize the header; `None` when the type byte is unknown.
    fn deserialize(buffer: &[u8]) -> StorageResult<Option<Self>> {
        if buffer.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        let Ok(record_type) = RecordType::try_from(buffer[0]) else {
            return Ok(None);
        };
        let lsn = LogSequenceNumber {
            file_id: u32::from_le_bytes(buffer[1..5].try_into().map_err(|_| StorageError::Corruption("Invalid lsn bytes".to_string()))?),
            offset: u64::from_le_bytes(buffer[5..13].try_into().map_err(|_| StorageError::Corruption("Invalid lsn bytes".to_string()))?),
        };
        let transaction_id = u64::from_le_bytes(buffer[13..21].try_into().map_err(|_| StorageError::Corruption("Invalid transaction_id bytes".to_string()))?);
        let dictionary_id = DictionaryId(u64::from_le_bytes(buffer[21..29].try_into().map_err(|_| StorageError::Corruption("Invalid dictionary_id bytes".to_string()))?));
        let checksum = u32::from_le_bytes(buffer[29..33].try_into().map_err(|_| StorageError::Corruption("Invalid checksum bytes".to_string()))?);
        let data_length = u32::from_le_bytes(buffer[33..37].try_into().map_err(|_| StorageError::Corruption("Invalid data_length bytes".to_string()))?);
        Ok(Some(Self { record_type, lsn, transaction_id, dictionary_id, checksum, data_length }))
    }
}

/// Logical payload of data-carrying records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOperation {
    /// `key` now maps to `value`; `before` is the replaced value
    Put { key: Vec<u8>, value: Vec<u8>, before: Option<Vec<u8>> },
    /// `key` was removed; `before` is the removed value
    Delete { key: Vec<u8>, before: Vec<u8> },
    /// Undo of the record at `compensates`: `key` now maps to `value` (absent when `None`)
    Compensation { key: Vec<u8>, value: Option<Vec<u8>>, compensates: u64 },
    /// Completion of the checkpoint that began at `begin`
    CheckpointEnd { begin: u64 },
}

/// LogEntry represents a single record in the log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Header of the record
    header: RecordHeader,
    /// Encoded `LogOperation`, empty for control records
    data: Vec<u8>,
}

impl LogEntry {
    fn control(record_type: RecordType, transaction_id: TransactionId) -> Self {
        Self { header: RecordHeader::new(record_type, transaction_id, DictionaryId(0)), data: Vec::new() }
    }

    fn with_operation(record_type: RecordType, transaction_id: TransactionId, dictionary_id: DictionaryId, operation: &LogOperation) -> StorageResult<Self> {
        let data = encode(operation)?;
        let mut header = RecordHeader::new(record_type, transaction_id, dictionary_id);
        header.data_length = data.len() as u32;
        Ok(Self { header, data })
    }

    /// Create a new begin transaction record
    pub fn begin_transaction(transaction_id: TransactionId) -> Self {
        Self::control(RecordType::Begin, transaction_id)
    }

    /// Create a new commit transaction record
    pub fn commit_transaction(transaction_id: TransactionId) -> Self {
        Self::control(RecordType::Commit, transaction_id)
    }

    /// Create a new abort transaction record
    pub fn abort_transaction(transaction_id: TransactionId) -> Self {
        Self::control(RecordType::Abort, transaction_id)
    }

    pub fn put(transaction_id: TransactionId, dictionary_id: DictionaryId, key: &[u8], value: &[u8], before: Option<&[u8]>) -> StorageResult<Self> {
        let operation = LogOperation::Put { key: key.to_vec(), value: value.to_vec(), before: before.map(<[u8]>::to_vec) };
        Self::with_operation(RecordType::Put, transaction_id, dictionary_id, &operation)
    }

    pub fn delete(transaction_id: TransactionId, dictionary_id: DictionaryId, key: &[u8], before: &[u8]) -> StorageResult<Self> {
        let operation = LogOperation::Delete { key: key.to_vec(), before: before.to_vec() };
        Self::with_operation(RecordType::Delete, transaction_id, dictionary_id, &operation)
    }

    pub fn compensation(transaction_id: TransactionId, dictionary_id: DictionaryId, key: &[u8], value: Option<&[u8]>, compensates: LogSequenceNumber) -> StorageResult<Self> {
        let operation = LogOperation::Compensation { key: key.to_vec(), value: value.map(<[u8]>::to_vec), compensates: compensates.to_u64() };
        Self::with_operation(RecordType::Compensation, transaction_id, dictionary_id, &operation)
    }

    pub fn checkpoint_begin() -> Self {
        Self::control(RecordType::CheckpointBegin, 0)
    }

    pub fn checkpoint_end(begin: LogSequenceNumber) -> StorageResult<Self> {
        Self::with_operation(RecordType::CheckpointEnd, 0, DictionaryId(0), &LogOperation::CheckpointEnd { begin: begin.to_u64() })
    }

    /// Get the record type
    pub fn record_type(&self) -> RecordType {
        self.header.record_type
    }

    /// Get the LSN
    pub fn lsn(&self) -> LogSequenceNumber {
        self.header.lsn
    }

    /// Get the transaction ID
    pub fn transaction_id(&self) -> TransactionId {
        self.header.transaction_id
    }

    /// Get the dictionary ID
    pub fn dictionary_id(&self) -> DictionaryId {
        self.header.dictionary_id
    }

    /// Decodes the payload of data-carrying records.
    pub fn operation(&self) -> StorageResult<Option<LogOperation>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        decode(&self.data).map(Some)
    }

    /// Get the serialized size
    pub fn serialized_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.data.len()
    }

    /// Calculate the checksum of the log entry (header + data), by zeroing the header.checksum field
    pub fn calculate_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        let mut header_bytes = self.header.serialize();
        header_bytes[29..33].fill(0);
        hasher.update(&header_bytes);
        hasher.update(&self.data);
        hasher.finalize()
    }

    /// Validate the checksum of the log entry
    pub fn is_valid(&self) -> bool {
        self.header.checksum == self.calculate_checksum()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        bytes.extend_from_slice(&self.header.serialize());
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

fn segment_header(file_id: u32) -> [u8; WAL_HEADER_SIZE as usize] {
    let mut buffer = [0u8; WAL_HEADER_SIZE as usize];
    buffer[0..4].copy_from_slice(&WAL_MAGIC);
    buffer[4..8].copy_from_slice(&WAL_VERSION.to_le_bytes());
    buffer[8..12].copy_from_slice(&file_id.to_le_bytes());
    let checksum = crate::storage_engine::lib::calculate_checksum(&buffer[..12]);
    buffer[12..16].copy_from_slice(&checksum.to_le_bytes());
    buffer
}

fn check_segment_header(buffer: &[u8], file_id: u32, path: &Path) -> StorageResult<()> {
    if buffer.len() < WAL_HEADER_SIZE as usize || buffer[0..4] != WAL_MAGIC {
        return Err(StorageError::Corruption(format!("{} is not a log segment", path.display())));
    }
    let version = u32::from_le_bytes(buffer[4..8].try_into().map_err(|_| StorageError::Corruption("Invalid version bytes".to_string()))?);
    if version != WAL_VERSION {
        return Err(StorageError::Corruption(format!("Unsupported log version {} in {}", version, path.display())));
    }
    let stored_id = u32::from_le_bytes(buffer[8..12].try_into().map_err(|_| StorageError::Corruption("Invalid segment id bytes".to_string()))?);
    let checksum = u32::from_le_bytes(buffer[12..16].try_into().map_err(|_| StorageError::Corruption("Invalid checksum bytes".to_string()))?);
    if stored_id != file_id || checksum != crate::storage_engine::lib::calculate_checksum(&buffer[..12]) {
        return Err(StorageError::Corruption(format!("segment header of {} does not match its name", path.display())));
    }
    Ok(())
}

/// Configuration for the log
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the segments
    pub directory: PathBuf,
    /// Rotation threshold for each segment in bytes
    pub max_file_size: u64,
    /// Attempts for transient I/O failures
    pub io_retries: u32,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./wal"),
            max_file_size: 64 * 1024 * 1024, // 64 MB
            io_retries: 3,
        }
    }
}

/// Result of scanning the retained log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Position just past the last valid record
    pub end: LogSequenceNumber,
    /// Records delivered to the callback
    pub records: u64,
    /// Bytes after `end` that did not form a valid record
    pub torn_bytes: u64,
}

struct WalState {
    /// Segment receiving appends
    file: File,
    /// Id of that segment
    file_id: u32,
    /// Bytes in that segment
    size: u64,
}

/// WriteAheadLog manages the log segments, appends records, rotates segments and replays them for recovery.
pub struct WriteAheadLog {
    /// Log configuration
    config: WalConfig,
    /// Append state
    state: Mutex<WalState>,
    /// Everything before this position is on stable storage
    synced: Mutex<LogSequenceNumber>,
}

fn segment_path(directory: &Path, file_id: u32) -> PathBuf {
    directory.join(format!("{SEGMENT_PREFIX}{file_id:06}"))
}

/// Ids of the segments in `directory`, ascending.
pub fn list_segments(directory: &Path) -> StorageResult<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(|n| n.strip_prefix(SEGMENT_PREFIX)).and_then(|s| s.parse::<u32>().ok()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

impl WriteAheadLog {
    /// Opens the log in `config.directory`, creating the first segment when none exists.
    ///
    /// Appends continue at the end of the newest segment; recovery truncates a torn tail
    /// with [`WriteAheadLog::truncate_at`] before the first append.
    pub fn open(config: WalConfig) -> StorageResult<Self> {
        fs::create_dir_all(&config.directory)?;
        let segments = list_segments(&config.directory)?;
        let (file, file_id, size) = match segments.last() {
            Some(&file_id) => {
                let file = OpenOptions::new().read(true).append(true).open(segment_path(&config.directory, file_id))?;
                let size = file.metadata()?.len();
                (file, file_id, size)
            }
            None => {
                let file = Self::create_segment(&config.directory, 0)?;
                (file, 0, WAL_HEADER_SIZE)
            }
        };
        let end = LogSequenceNumber { file_id, offset: size };
        info!(directory = %config.directory.display(), segments = segments.len().max(1), end = %end, "opened write-ahead log");
        Ok(Self { config, state: Mutex::new(WalState { file, file_id, size }), synced: Mutex::new(end) })
    }

    fn create_segment(directory: &Path, file_id: u32) -> StorageResult<File> {
        let path = segment_path(directory, file_id);
        let mut file = OpenOptions::new().read(true).append(true).create_new(true).open(&path)?;
        file.write_all(&segment_header(file_id))?;
        file.sync_all()?;
        if let Ok(dir) = File::open(directory) {
            let _ = dir.sync_all();
        }
        debug!(segment = file_id, "created log segment");
        Ok(file)
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Position the next record will be written at.
    pub fn current_lsn(&self) -> LogSequenceNumber {
        let state = self.state.lock();
        LogSequenceNumber { file_id: state.file_id, offset: state.size }
    }

    /// Appends a record and returns its LSN.
    ///
    /// Steps:
    /// 1. Rotate to a new segment when the record would overflow the current one
    /// 2. Stamp the LSN and checksum
    /// 3. Write the record to the segment
    pub fn append(&self, mut entry: LogEntry) -> StorageResult<LogSequenceNumber> {
        let mut state = self.state.lock();
        let len = entry.serialized_size() as u64;
        if state.size + len > self.config.max_file_size && state.size > WAL_HEADER_SIZE {
            self.rotate_locked(&mut state)?;
        }
        let lsn = LogSequenceNumber { file_id: state.file_id, offset: state.size };
        entry.header.lsn = lsn;
        entry.header.checksum = entry.calculate_checksum();
        let bytes = entry.to_bytes();
        retry_io(self.config.io_retries, || (&state.file).write_all(&bytes))?;
        state.size += len;
        Ok(lsn)
    }

    fn rotate_locked(&self, state: &mut WalState) -> StorageResult<()> {
        retry_io(self.config.io_retries, || state.file.sync_data())?;
        let sealed = LogSequenceNumber { file_id: state.file_id, offset: state.size };
        let next_id = state.file_id + 1;
        state.file = Self::create_segment(&self.config.directory, next_id)?;
        state.file_id = next_id;
        state.size = WAL_HEADER_SIZE;
        let mut synced = self.synced.lock();
        if *synced < sealed {
            *synced = sealed;
        }
        Ok(())
    }

    /// Starts a new segment so older ones can be purged once a checkpoint covers them.
    pub fn rotate(&self) -> StorageResult<LogSequenceNumber> {
        let mut state = self.state.lock();
        if state.size > WAL_HEADER_SIZE {
            self.rotate_locked(&mut state)?;
        }
        Ok(LogSequenceNumber { file_id: state.file_id, offset: state.size })
    }

    /// Makes every record before `lsn` durable. Concurrent callers share one fsync.
    pub fn flush_to(&self, lsn: LogSequenceNumber) -> StorageResult<()> {
        if *self.synced.lock() > lsn {
            return Ok(());
        }
        self.sync_current()
    }

    fn sync_current(&self) -> StorageResult<()> {
        let (file, end) = {
            let state = self.state.lock();
            (state.file.try_clone()?, LogSequenceNumber { file_id: state.file_id, offset: state.size })
        };
        retry_io(self.config.io_retries, || file.sync_data())?;
        let mut synced = self.synced.lock();
        if *synced < end {
            *synced = end;
        }
        Ok(())
    }

    /// Deletes segments that hold only records before `lsn`.
    pub fn purge_before(&self, lsn: LogSequenceNumber) -> StorageResult<usize> {
        let current = self.state.lock().file_id;
        let mut removed = 0;
        for id in list_segments(&self.config.directory)? {
            if id < lsn.file_id && id < current {
                fs::remove_file(segment_path(&self.config.directory, id))?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, before = %lsn, "purged log segments");
        }
        Ok(removed)
    }

    /// Position of the oldest retained record.
    pub fn first_lsn(&self) -> StorageResult<LogSequenceNumber> {
        let first = list_segments(&self.config.directory)?.first().copied().unwrap_or(0);
        Ok(LogSequenceNumber { file_id: first, offset: WAL_HEADER_SIZE })
    }

    /// Drops everything from `end` on. Only valid before the first append after open.
    pub fn truncate_at(&self, end: LogSequenceNumber) -> StorageResult<()> {
        let mut state = self.state.lock();
        for id in list_segments(&self.config.directory)? {
            if id > end.file_id {
                fs::remove_file(segment_path(&self.config.directory, id))?;
            }
        }
        let path = segment_path(&self.config.directory, end.file_id);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() > end.offset {
            warn!(segment = end.file_id, offset = end.offset, "truncating torn log tail");
            file.set_len(end.offset)?;
            file.sync_all()?;
        }
        state.file = OpenOptions::new().read(true).append(true).open(&path)?;
        state.file_id = end.file_id;
        state.size = end.offset;
        *self.synced.lock() = end;
        Ok(())
    }

    /// Reads every valid record of the retained log in LSN order.
    ///
    /// Steps:
    /// 1. List the segments and verify each segment header
    /// 2. Parse records until one is short, of unknown type, misplaced or fails its checksum
    /// 3. A bad record in the newest segment is a torn tail; anywhere else the log is inconsistent
    pub fn read_records<F>(&self, mut callback: F) -> StorageResult<ReadOutcome>
    where
        F: FnMut(LogEntry) -> StorageResult<()>,
    {
        let segments = list_segments(&self.config.directory)?;
        let mut outcome = ReadOutcome { end: LogSequenceNumber { file_id: 0, offset: WAL_HEADER_SIZE }, records: 0, torn_bytes: 0 };
        for (index, &file_id) in segments.iter().enumerate() {
            let path = segment_path(&self.config.directory, file_id);
            let mut buffer = Vec::new();
            File::open(&path)?.read_to_end(&mut buffer)?;
            check_segment_header(&buffer, file_id, &path)?;

            let mut offset = WAL_HEADER_SIZE as usize;
            while offset < buffer.len() {
                let Some(entry) = Self::parse_record(&buffer, offset, file_id)? else {
                    break;
                };
                offset += entry.serialized_size();
                outcome.records += 1;
                callback(entry)?;
            }
            outcome.end = LogSequenceNumber { file_id, offset: offset as u64 };
            if offset < buffer.len() {
                let torn = (buffer.len() - offset) as u64;
                if index + 1 != segments.len() {
                    return Err(StorageError::Inconsistent(format!("log segment {} is damaged at offset {} but newer segments exist", file_id, offset)));
                }
                outcome.torn_bytes = torn;
            }
        }
        Ok(outcome)
    }

    fn parse_record(buffer: &[u8], offset: usize, file_id: u32) -> StorageResult<Option<LogEntry>> {
        let Some(header) = RecordHeader::deserialize(&buffer[offset..])? else {
            return Ok(None);
        };
        let data_start = offset + RECORD_HEADER_SIZE;
        let data_end = data_start + header.data_length as usize;
        if data_end > buffer.len() || header.lsn != (LogSequenceNumber { file_id, offset: offset as u64 }) {
            return Ok(None);
        }
        let entry = LogEntry { header, data: buffer[data_start..data_end].to_vec() };
        if !entry.is_valid() {
            return Ok(None);
        }
        Ok(Some(entry))
    }
}

impl Flushable for WriteAheadLog {
    fn flush(&self) -> StorageResult<()> {
        self.sync_current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;
    use tempfile::tempdir;

    fn config(dir: &Path, max_file_size: u64) -> WalConfig {
        WalConfig { directory: dir.to_path_buf(), max_file_size, io_retries: 3 }
    }

    fn collect(wal: &WriteAheadLog) -> (Vec<LogEntry>, ReadOutcome) {
        let mut entries = Vec::new();
        let outcome = wal
            .read_records(|entry| {
                entries.push(entry);
                Ok(())
            })
            .unwrap();
        (entries, outcome)
    }

    #[test]
    fn test_log_entry() {
        let entry = LogEntry::put(42, DictionaryId(3), b"k", b"v", None).unwrap();
        assert_eq!(entry.record_type(), RecordType::Put);
        assert_eq!(entry.transaction_id(), 42);
        assert_eq!(entry.dictionary_id(), DictionaryId(3));
        assert_eq!(entry.operation().unwrap(), Some(LogOperation::Put { key: b"k".to_vec(), value: b"v".to_vec(), before: None }));
        assert_eq!(LogEntry::commit_transaction(42).operation().unwrap(), None);
    }

    #[test]
    fn test_lsn_packing_preserves_order() {
        let a = LogSequenceNumber { file_id: 1, offset: 900 };
        let b = LogSequenceNumber { file_id: 2, offset: 128 };
        assert!(a.to_u64() < b.to_u64());
        assert_eq!(LogSequenceNumber::from_u64(b.to_u64()), b);
    }

    #[test]
    fn test_wal_append_and_read_records() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(config(dir.path(), 1024 * 1024)).unwrap();
        let first = wal.append(LogEntry::begin_transaction(1)).unwrap();
        let put = wal.append(LogEntry::put(1, DictionaryId(1), b"a", b"1", None).unwrap()).unwrap();
        let commit = wal.append(LogEntry::commit_transaction(1)).unwrap();
        wal.flush_to(commit).unwrap();
        assert!(first < put && put < commit);

        let (entries, outcome) = collect(&wal);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].lsn(), put);
        assert_eq!(outcome.torn_bytes, 0);
        assert_eq!(outcome.end, wal.current_lsn());
    }

    #[test]
    fn test_wal_rotation() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(config(dir.path(), 256)).unwrap();
        for i in 0..20 {
            wal.append(LogEntry::begin_transaction(i)).unwrap();
        }
        assert!(list_segments(dir.path()).unwrap().len() > 1);
        let (entries, _) = collect(&wal);
        let ids: Vec<_> = entries.iter().map(|e| e.transaction_id()).collect();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_wal_purge_old_files() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(config(dir.path(), 1024 * 1024)).unwrap();
        for i in 0..3 {
            wal.append(LogEntry::begin_transaction(i)).unwrap();
            wal.rotate().unwrap();
        }
        let keep = wal.append(LogEntry::begin_transaction(9)).unwrap();
        assert_eq!(wal.purge_before(keep).unwrap(), 3);
        let (entries, _) = collect(&wal);
        assert_eq!(entries.len(), 1);
        assert_eq!(wal.first_lsn().unwrap().file_id, keep.file_id);
    }

    #[test]
    fn test_torn_tail_is_reported_and_truncated() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(config(dir.path(), 1024 * 1024)).unwrap();
        wal.append(LogEntry::begin_transaction(1)).unwrap();
        let last = wal.append(LogEntry::put(1, DictionaryId(1), b"key", b"value", None).unwrap()).unwrap();
        wal.flush().unwrap();
        drop(wal);

        // chop the last record in half
        let path = segment_path(dir.path(), 0);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(last.offset + 10).unwrap();
        drop(file);

        let wal = WriteAheadLog::open(config(dir.path(), 1024 * 1024)).unwrap();
        let (entries, outcome) = collect(&wal);
        assert_eq!(entries.len(), 1);
        assert_eq!(outcome.end, last);
        assert_eq!(outcome.torn_bytes, 10);
        wal.truncate_at(outcome.end).unwrap();
        let next = wal.append(LogEntry::commit_transaction(1)).unwrap();
        assert_eq!(next, last);
        assert_eq!(collect(&wal).0.len(), 2);
    }

    #[test]
    fn test_checksum_mismatch_ends_the_log() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(config(dir.path(), 1024 * 1024)).unwrap();
        wal.append(LogEntry::begin_transaction(1)).unwrap();
        let bad = wal.append(LogEntry::put(1, DictionaryId(1), b"key", b"value", None).unwrap()).unwrap();
        wal.append(LogEntry::commit_transaction(1)).unwrap();
        wal.flush().unwrap();

        let file = OpenOptions::new().write(true).open(segment_path(dir.path(), 0)).unwrap();
        file.write_all_at(&[0xFF], bad.offset + RECORD_HEADER_SIZE as u64 + 2).unwrap();

        let (entries, outcome) = collect(&wal);
        assert_eq!(entries.len(), 1);
        assert_eq!(outcome.end, bad);
        assert!(outcome.torn_bytes > 0);
    }

    #[test]
    fn test_damage_before_newest_segment_is_inconsistent() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(config(dir.path(), 1024 * 1024)).unwrap();
        let bad = wal.append(LogEntry::begin_transaction(1)).unwrap();
        wal.append(LogEntry::commit_transaction(1)).unwrap();
        wal.rotate().unwrap();
        wal.append(LogEntry::begin_transaction(2)).unwrap();
        wal.flush().unwrap();

        let file = OpenOptions::new().write(true).open(segment_path(dir.path(), 0)).unwrap();
        file.write_all_at(&[0xEE], bad.offset + 14).unwrap();
        assert!(matches!(wal.read_records(|_| Ok(())), Err(StorageError::Inconsistent(_))));
    }

    #[test]
    fn test_unknown_segment_version_is_corruption() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(config(dir.path(), 1024 * 1024)).unwrap();
        wal.append(LogEntry::begin_transaction(1)).unwrap();
        let file = OpenOptions::new().write(true).open(segment_path(dir.path(), 0)).unwrap();
        file.write_all_at(&9u32.to_le_bytes(), 4).unwrap();
        assert!(matches!(wal.read_records(|_| Ok(())), Err(StorageError::Corruption(_))));
    }
}
