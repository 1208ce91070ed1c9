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

// Storage Engine Module
// Node files, node cache, log, locks, versions and transaction bookkeeping

pub mod block_manager;
pub mod buffer_manager;
pub mod deadlock_detector;
pub mod file_format;
pub mod isolation;
pub mod lib;
pub mod mvcc;
pub mod transaction;
pub mod upgrade;
pub mod wal;

// Public exports
pub use block_manager::{BlockRef, BlockTable, DictionaryFile};
pub use buffer_manager::{BufferStats, CacheStatistics, NodeRef, NodeStore};
pub use deadlock_detector::{DeadlockCycle, WaitForEdge, WaitForGraph};
pub use file_format::{FileHeader, Node, NodeBody, NodeId, NodeKind, VersionedNode};
pub use isolation::{LockManager, LockMode, LockResource, LockStatistics};
pub use lib::{DictionaryId, ErrorKind, Flushable, StorageError, StorageResult, TransactionId, calculate_checksum, generate_timestamp};
pub use mvcc::{ReadView, Timestamp, VersionStore};
pub use transaction::{TransactionContext, TransactionManager, TransactionState, TransactionStatistics, UndoRecord};
pub use upgrade::{FormatUpgrader, UpgradeProgress};
pub use wal::{LogEntry, LogOperation, LogSequenceNumber, RecordType, WalConfig, WriteAheadLog};
