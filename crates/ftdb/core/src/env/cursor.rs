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

use super::dictionary::Dictionary;
use super::transaction::Transaction;
use crate::indices::lib::{Direction, SeekBound};
use crate::storage_engine::lib::StorageResult;

/// One key/value pair produced by a cursor step. The buffers belong to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Cursor creation options
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorOptions {
    /// Take a shared lock over the whole dictionary so no other transaction can insert or
    /// delete entries until this transaction ends
    pub range_lock: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    /// Not positioned; `next` starts at the first entry and `prev` at the last
    Unpositioned,
    At(Vec<u8>),
    /// Stepped past the last entry
    AfterEnd,
    /// Stepped before the first entry
    BeforeStart,
}

/// Ordered, re-seekable traversal of a dictionary as seen by one transaction.
///
/// Each step re-seeks from the last returned key, so entries changed by the transaction
/// between steps are reflected and no tree state is held across steps.
pub struct Cursor<'t> {
    dictionary: &'t Dictionary,
    txn: &'t Transaction,
    position: Position,
    current: Option<CursorEntry>,
}

impl<'t> Cursor<'t> {
    pub(crate) fn new(dictionary: &'t Dictionary, txn: &'t Transaction) -> Self {
        Self { dictionary, txn, position: Position::Unpositioned, current: None }
    }

    pub fn first(&mut self) -> StorageResult<Option<CursorEntry>> {
        self.step(SeekBound::Start, Direction::Forward)
    }

    pub fn last(&mut self) -> StorageResult<Option<CursorEntry>> {
        self.step(SeekBound::Start, Direction::Backward)
    }

    /// Next entry in ascending order; `None` at the end.
    pub fn next(&mut self) -> StorageResult<Option<CursorEntry>> {
        match std::mem::replace(&mut self.position, Position::Unpositioned) {
            Position::Unpositioned | Position::BeforeStart => self.first(),
            Position::At(key) => self.step(SeekBound::Exclusive(&key), Direction::Forward),
            Position::AfterEnd => {
                self.position = Position::AfterEnd;
                Ok(None)
            }
        }
    }

    /// Previous entry in descending order; `None` before the start.
    pub fn prev(&mut self) -> StorageResult<Option<CursorEntry>> {
        match std::mem::replace(&mut self.position, Position::Unpositioned) {
            Position::Unpositioned | Position::AfterEnd => self.last(),
            Position::At(key) => self.step(SeekBound::Exclusive(&key), Direction::Backward),
            Position::BeforeStart => {
                self.position = Position::BeforeStart;
                Ok(None)
            }
        }
    }

    /// Positions at the first entry whose key is not less than `key`.
    pub fn seek(&mut self, key: &[u8]) -> StorageResult<Option<CursorEntry>> {
        self.step(SeekBound::Inclusive(key), Direction::Forward)
    }

    /// Positions at the last entry whose key is not greater than `key`.
    pub fn seek_back(&mut self, key: &[u8]) -> StorageResult<Option<CursorEntry>> {
        self.step(SeekBound::Inclusive(key), Direction::Backward)
    }

    /// Entry at the current position.
    pub fn current(&self) -> Option<&CursorEntry> {
        self.current.as_ref()
    }

    /// Forgets the position so the sequence can be walked again.
    pub fn reset(&mut self) {
        self.position = Position::Unpositioned;
        self.current = None;
    }

    pub fn close(self) {}

    fn step(&mut self, bound: SeekBound<'_>, direction: Direction) -> StorageResult<Option<CursorEntry>> {
        let dictionary = self.dictionary;
        let found = self.txn.run(dictionary.shared(), |context| dictionary.seek_visible(context, bound, direction))?;
        self.position = match (&found, direction) {
            (Some(entry), _) => Position::At(entry.key.clone()),
            (None, Direction::Forward) => Position::AfterEnd,
            (None, Direction::Backward) => Position::BeforeStart,
        };
        self.current = found.clone();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use crate::env::{CursorOptions, DictionaryOptions, Environment};
    use crate::storage_engine::lib::StorageError;
    use ftdb_common::EnvConfig;
    use tempfile::tempdir;

    fn collect(cursor: &mut super::Cursor<'_>) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        while let Some(entry) = cursor.next().unwrap() {
            keys.push(entry.key);
        }
        keys
    }

    #[test]
    fn test_cursor_walks_both_ways() {
        let dir = tempdir().unwrap();
        let env = Environment::open(EnvConfig::new(dir.path()).with_node_size(4096).with_checkpoint_period(0)).unwrap();
        let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
        let txn = env.begin().unwrap();
        for key in [b"b", b"d", b"a", b"c"] {
            main.put(&txn, key, b"v").unwrap();
        }
        let mut cursor = main.cursor(&txn).unwrap();
        assert_eq!(collect(&mut cursor), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(cursor.next().unwrap(), None);
        assert_eq!(cursor.prev().unwrap().unwrap().key, b"d".to_vec());
        assert_eq!(cursor.prev().unwrap().unwrap().key, b"c".to_vec());
        assert_eq!(cursor.seek(b"bb").unwrap().unwrap().key, b"c".to_vec());
        assert_eq!(cursor.seek_back(b"bb").unwrap().unwrap().key, b"b".to_vec());
        assert_eq!(cursor.current().unwrap().key, b"b".to_vec());
        cursor.reset();
        assert_eq!(cursor.prev().unwrap().unwrap().key, b"d".to_vec());
        cursor.close();
        txn.commit().unwrap();
    }

    #[test]
    fn test_cursor_sees_snapshot_including_later_deletes() {
        let dir = tempdir().unwrap();
        let env = Environment::open(EnvConfig::new(dir.path()).with_node_size(4096).with_checkpoint_period(0)).unwrap();
        let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
        let setup = env.begin().unwrap();
        for key in [b"1", b"2", b"3"] {
            main.put(&setup, key, b"v").unwrap();
        }
        setup.commit().unwrap();

        let reader = env.begin().unwrap();
        let writer = env.begin().unwrap();
        main.delete(&writer, b"2").unwrap();
        main.put(&writer, b"4", b"v").unwrap();
        writer.commit().unwrap();

        let mut cursor = main.cursor(&reader).unwrap();
        assert_eq!(collect(&mut cursor), vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn test_range_lock_blocks_other_writers() {
        let dir = tempdir().unwrap();
        let config = EnvConfig::new(dir.path()).with_node_size(4096).with_checkpoint_period(0).with_lock_timeout_ms(50);
        let env = Environment::open(config).unwrap();
        let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
        let scanner = env.begin().unwrap();
        let cursor = main.cursor_with(&scanner, CursorOptions { range_lock: true }).unwrap();

        let writer = env.begin().unwrap();
        let err = main.put(&writer, b"phantom", b"v").unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
        cursor.close();
        scanner.commit().unwrap();
        main.put(&writer, b"phantom", b"v").unwrap();
        writer.commit().unwrap();
    }
}
