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

// Common types and utilities for the storage engine

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ftdb_common::ConfigError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Represents a unique identifier for a dictionary within an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DictionaryId(pub u64);

impl fmt::Display for DictionaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier; larger ids belong to younger transactions
pub type TransactionId = u64;

/// The error classes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad arguments or a call that is invalid in the current state
    Usage,
    /// Key or dictionary absent
    NotFound,
    /// Lock conflict or deadlock-induced forced abort
    Conflict,
    /// Transaction already aborted
    Aborted,
    /// Unreadable or unknown node or log format
    FormatCorruption,
    /// Underlying storage failure
    Io,
    /// Recovery could not reach a consistent state
    EnvironmentInconsistent,
}

impl ErrorKind {
    /// Conflict and NotFound leave engine state intact and can be retried or treated as empty.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::Conflict | ErrorKind::NotFound)
    }
}

/// Error types specific to the storage engine
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid usage: {0}")]
    Usage(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transaction {txn_id} chosen as deadlock victim")]
    Deadlock { txn_id: TransactionId },

    #[error("Transaction {txn_id} timed out waiting for a lock on {resource}")]
    LockTimeout { txn_id: TransactionId, resource: String },

    #[error("Transaction {txn_id} cannot overwrite {resource}, which changed after its snapshot")]
    WriteConflict { txn_id: TransactionId, resource: String },

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Corrupted storage: {0}")]
    Corruption(String),

    #[error("Environment inconsistent: {0}")]
    Inconsistent(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl StorageError {
    /// Maps the error onto the caller-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Io(_) => ErrorKind::Io,
            StorageError::Usage(_) | StorageError::AlreadyExists(_) | StorageError::Config(_) => ErrorKind::Usage,
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::Deadlock { .. } | StorageError::LockTimeout { .. } | StorageError::WriteConflict { .. } => ErrorKind::Conflict,
            StorageError::TransactionAborted(_) => ErrorKind::Aborted,
            StorageError::Corruption(_) => ErrorKind::FormatCorruption,
            StorageError::Inconsistent(_) => ErrorKind::EnvironmentInconsistent,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Wall-clock timestamp in nanoseconds
pub fn generate_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or_default()
}

/// Calculate CRC32 checksum for data integrity
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn is_transient(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Runs an I/O operation, retrying transient failures up to `attempts` times in total.
pub fn retry_io<T>(attempts: u32, mut op: impl FnMut() -> io::Result<T>) -> StorageResult<T> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt < attempts => {
                warn!(attempt, error = %e, "transient I/O failure, retrying");
                thread::sleep(Duration::from_millis(1 << attempt.min(6)));
                attempt += 1;
            }
            Err(e) => return Err(StorageError::Io(e)),
        }
    }
}

/// Serializes a value with the engine's bincode configuration.
pub fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| StorageError::Corruption(format!("encode failed: {e}")))
}

/// Deserializes a value written by [`encode`]; trailing bytes are rejected.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard()).map_err(|e| StorageError::Corruption(format!("decode failed: {e}")))?;
    if read != bytes.len() {
        return Err(StorageError::Corruption(format!("{} trailing bytes after decoded value", bytes.len() - read)));
    }
    Ok(value)
}

/// Replaces `path` with `bytes` so readers see either the old or the new contents.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent()
        && let Ok(dir) = fs::File::open(dir)
    {
        dir.sync_all()?;
    }
    Ok(())
}

/// Trait for components that need periodic flushing to disk
pub trait Flushable {
    /// Flush any in-memory data to disk
    fn flush(&self) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_error_kinds() {
        assert_eq!(StorageError::Deadlock { txn_id: 3 }.kind(), ErrorKind::Conflict);
        assert_eq!(StorageError::WriteConflict { txn_id: 4, resource: "key 00 in 1".into() }.kind(), ErrorKind::Conflict);
        assert_eq!(StorageError::Corruption("x".into()).kind(), ErrorKind::FormatCorruption);
        assert_eq!(StorageError::AlreadyExists("d".into()).kind(), ErrorKind::Usage);
        assert!(!ErrorKind::EnvironmentInconsistent.is_recoverable());
        assert!(ErrorKind::Conflict.is_recoverable());
    }

    #[test]
    fn test_retry_io_retries_transient_errors() {
        let calls = Cell::new(0);
        let result = retry_io(3, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err(io::Error::new(io::ErrorKind::Interrupted, "eintr")) } else { Ok(7) }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_io_is_bounded() {
        let calls = Cell::new(0);
        let result: StorageResult<()> = retry_io(2, || {
            calls.set(calls.get() + 1);
            Err(io::Error::new(io::ErrorKind::TimedOut, "slow disk"))
        });
        assert!(matches!(result, Err(StorageError::Io(_))));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_write_file_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        write_file_atomic(&path, b"first").unwrap();
        write_file_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_retry_io_does_not_retry_fatal_errors() {
        let calls = Cell::new(0);
        let result: StorageResult<()> = retry_io(5, || {
            calls.set(calls.get() + 1);
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = encode(&(1u32, vec![1u8, 2])).unwrap();
        assert_eq!(decode::<(u32, Vec<u8>)>(&bytes).unwrap(), (1, vec![1, 2]));
        bytes.push(0);
        assert!(matches!(decode::<(u32, Vec<u8>)>(&bytes), Err(StorageError::Corruption(_))));
    }
}
