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

//! FTDB Core Library
//!
//! A transactional, multi-index, ordered key-value engine. Dictionaries are B+ trees stored in
//! per-dictionary node files, changed under snapshot-isolated transactions that are logged to a
//! write-ahead log, checkpointed in the background and recovered after a crash. Nodes written
//! by older releases are upgraded to the current layout as they are touched.

pub mod env;
pub mod indices;
pub mod recovery;
pub mod storage_engine;

// Re-export the embedding API
pub use env::{
    CatalogEntry, Cursor, CursorEntry, CursorOptions, Descriptor, Dictionary, DictionaryOptions, DictionaryRole, EnvStats, Environment, SecondaryEntry, SecondaryGenerator, SpaceStatus, Transaction,
    generator,
};
pub use ftdb_common::{ConfigError, DurabilityMode, EnvConfig, LayoutVersion};
pub use indices::{BYTEWISE, Comparator, ComparatorRegistry, VerifyReport, bytewise};
pub use recovery::{CheckpointRecord, RecoveryReport};
pub use storage_engine::{DictionaryId, ErrorKind, StorageError, StorageResult, TransactionId, TransactionState, UpgradeProgress};
