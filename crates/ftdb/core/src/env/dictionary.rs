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

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::catalog::{Descriptor, DictionaryRole};
use super::cursor::{Cursor, CursorEntry, CursorOptions};
use super::transaction::Transaction;
use super::{Association, DictionaryState, EnvShared};
use crate::indices::b_plus_tree::VerifyReport;
use crate::indices::lib::{Direction, SeekBound};
use crate::indices::secondary_key;
use crate::storage_engine::isolation::{LockMode, LockResource};
use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult};
use crate::storage_engine::transaction::TransactionContext;
use crate::storage_engine::upgrade::UpgradeProgress;

/// A secondary entry to remove or write alongside a primary change
struct DerivedChange {
    secondary: Arc<DictionaryState>,
    stored_key: Vec<u8>,
    /// `None` removes the entry
    value: Option<Vec<u8>>,
}

/// Handle to an ordered dictionary of an open environment
#[derive(Clone)]
pub struct Dictionary {
    shared: Arc<EnvShared>,
    state: Arc<DictionaryState>,
}

impl Dictionary {
    pub(crate) fn new(shared: Arc<EnvShared>, state: Arc<DictionaryState>) -> Self {
        Self { shared, state }
    }

    pub(crate) fn state(&self) -> &Arc<DictionaryState> {
        &self.state
    }

    pub(crate) fn shared(&self) -> &Arc<EnvShared> {
        &self.shared
    }

    pub fn id(&self) -> DictionaryId {
        self.state.id
    }

    pub fn name(&self) -> String {
        self.state.name()
    }

    pub fn role(&self) -> DictionaryRole {
        self.state.role()
    }

    /// Value of `key` as seen by `txn`; a missing key is `NotFound`.
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> StorageResult<Vec<u8>> {
        self.find(txn, key)?.ok_or_else(|| StorageError::NotFound(format!("key {} in dictionary {}", hex::encode(key), self.name())))
    }

    /// Value of `key` as seen by `txn`, if any.
    pub fn find(&self, txn: &Transaction, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        txn.run(&self.shared, |context| self.read_visible(context, key))
    }

    fn read_visible(&self, context: &TransactionContext, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let reader = self.state.tree.read();
        let current = reader.get(key)?;
        Ok(self.state.versions.resolve(key, current, &context.view()))
    }

    /// Inserts or replaces `key`, keeping associated secondaries in step.
    pub fn put(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.ensure_writable()?;
        self.state.tree.check_entry(key, value)?;
        txn.run(&self.shared, |context| {
            self.shared.lock_for_write(context, &self.state, key)?;
            let associations = self.state.secondaries.read().clone();
            if associations.is_empty() {
                self.shared.apply_write(context, &self.state, key, Some(value))?;
                return Ok(());
            }
            let old = self.state.tree.read().get(key)?;
            let changes = self.derive(&associations, key, old.as_deref(), Some(value))?;
            self.lock_derived(context, &changes)?;
            self.shared.apply_write(context, &self.state, key, Some(value))?;
            self.apply_derived(context, changes)
        })
    }

    /// Removes `key` and its secondary entries; a key `txn` cannot see is `NotFound`.
    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> StorageResult<()> {
        self.ensure_writable()?;
        txn.run(&self.shared, |context| {
            self.shared.lock_for_write(context, &self.state, key)?;
            let Some(old) = self.read_visible(context, key)? else {
                return Err(StorageError::NotFound(format!("key {} in dictionary {}", hex::encode(key), self.name())));
            };
            let associations = self.state.secondaries.read().clone();
            let changes = self.derive(&associations, key, Some(&old), None)?;
            self.lock_derived(context, &changes)?;
            self.shared.apply_write(context, &self.state, key, None)?;
            self.apply_derived(context, changes)
        })
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        self.shared.ensure_writable()?;
        if let DictionaryRole::Secondary { primary, .. } = self.role() {
            return Err(StorageError::Usage(format!("dictionary {} is maintained through its primary {}", self.name(), primary)));
        }
        if let Some(secondary) = self.shared.unassociated_secondary(&self.state) {
            return Err(StorageError::Usage(format!("secondary {secondary} of dictionary {} must be associated before writing", self.name())));
        }
        Ok(())
    }

    /// Secondary changes turning the entries of `old` into those of `new`.
    fn derive(&self, associations: &[Association], key: &[u8], old: Option<&[u8]>, new: Option<&[u8]>) -> StorageResult<Vec<DerivedChange>> {
        let mut removals = Vec::new();
        let mut writes = Vec::new();
        for association in associations {
            let generate = |value: &[u8]| (association.generator)(association.index, key, value);
            let old_key = old.and_then(generate).map(|entry| secondary_key::encode(&entry.key, key));
            let new_entry = new.and_then(generate).map(|entry| (secondary_key::encode(&entry.key, key), entry.value));
            if let Some((stored, value)) = &new_entry {
                association.secondary.tree.check_entry(stored, value)?;
            }
            if let Some(old_key) = old_key
                && new_entry.as_ref().is_none_or(|(stored, _)| *stored != old_key)
            {
                removals.push(DerivedChange { secondary: Arc::clone(&association.secondary), stored_key: old_key, value: None });
            }
            if let Some((stored_key, value)) = new_entry {
                writes.push(DerivedChange { secondary: Arc::clone(&association.secondary), stored_key, value: Some(value) });
            }
        }
        removals.extend(writes);
        Ok(removals)
    }

    fn lock_derived(&self, context: &mut TransactionContext, changes: &[DerivedChange]) -> StorageResult<()> {
        for change in changes {
            self.shared.lock_for_write(context, &change.secondary, &change.stored_key)?;
        }
        Ok(())
    }

    fn apply_derived(&self, context: &mut TransactionContext, changes: Vec<DerivedChange>) -> StorageResult<()> {
        for change in changes {
            trace!(secondary = %change.secondary.id, remove = change.value.is_none(), "applying derived change");
            self.shared.apply_write(context, &change.secondary, &change.stored_key, change.value.as_deref())?;
        }
        Ok(())
    }

    /// Opens a cursor positioned before the first entry.
    pub fn cursor<'t>(&'t self, txn: &'t Transaction) -> StorageResult<Cursor<'t>> {
        self.cursor_with(txn, CursorOptions::default())
    }

    pub fn cursor_with<'t>(&'t self, txn: &'t Transaction, options: CursorOptions) -> StorageResult<Cursor<'t>> {
        if options.range_lock {
            txn.run(&self.shared, |context| self.shared.acquire(context, LockResource::range(self.state.id), LockMode::Shared))?;
        }
        Ok(Cursor::new(self, txn))
    }

    /// First entry visible to `context` past `bound` in `direction`.
    ///
    /// Merges the tree with keys that only exist in older versions, so entries deleted after the
    /// snapshot are still found.
    pub(crate) fn seek_visible(&self, context: &TransactionContext, bound: SeekBound<'_>, direction: Direction) -> StorageResult<Option<CursorEntry>> {
        let view = context.view();
        let comparator = self.state.tree.comparator();
        let reader = self.state.tree.read();
        let mut passed: Option<Vec<u8>> = None;
        loop {
            let bound = match &passed {
                None => bound,
                Some(key) => SeekBound::Exclusive(key),
            };
            let stored = reader.seek(bound, direction)?;
            let ghost = self.state.versions.next_key(bound, direction);
            let (key, current) = match (stored, ghost) {
                (None, None) => return Ok(None),
                (Some((key, value)), None) => (key, Some(value)),
                (None, Some(ghost)) => (ghost, None),
                (Some((key, value)), Some(ghost)) => {
                    let order = comparator(&ghost, &key);
                    let ghost_first = match direction {
                        Direction::Forward => order.is_lt(),
                        Direction::Backward => order.is_gt(),
                    };
                    if ghost_first { (ghost, None) } else { (key, Some(value)) }
                }
            };
            if let Some(value) = self.state.versions.resolve(&key, current, &view) {
                return Ok(Some(CursorEntry { key, value }));
            }
            passed = Some(key);
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        self.state.entry.read().descriptor.clone()
    }

    /// Replaces the descriptor and persists it in the catalog.
    pub fn set_descriptor(&self, descriptor: Descriptor) -> StorageResult<()> {
        self.shared.ensure_open()?;
        self.shared.ensure_writable()?;
        let mut entry = self.state.entry.write();
        let mut updated = entry.clone();
        updated.descriptor = descriptor;
        self.shared.store_catalog_entry(updated.clone())?;
        *entry = updated;
        Ok(())
    }

    /// Upgrade progress of the live tree.
    pub fn upgrade_progress(&self) -> UpgradeProgress {
        self.state.file.live_progress(self.shared.store.target_layout())
    }

    /// Walks every node, checking order and structure. Visiting a node also upgrades it.
    pub fn verify(&self) -> StorageResult<VerifyReport> {
        self.shared.ensure_open()?;
        self.state.tree.verify()
    }

    /// Releases the handle. The dictionary stays open in the environment.
    pub fn close(self) {}
}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dictionary").field("id", &self.state.id).field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{DictionaryOptions, Environment, SecondaryEntry, generator};
    use crate::storage_engine::lib::ErrorKind;
    use crate::storage_engine::transaction::TransactionState;
    use ftdb_common::EnvConfig;
    use tempfile::{TempDir, tempdir};

    fn open() -> (TempDir, Environment) {
        let dir = tempdir().unwrap();
        let config = EnvConfig::new(dir.path()).with_node_size(4096).with_cache_size(256 * 4096).with_checkpoint_period(0);
        let env = Environment::open(config).unwrap();
        (dir, env)
    }

    #[test]
    fn test_put_get_delete() {
        let (_dir, env) = open();
        let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
        let txn = env.begin().unwrap();
        main.put(&txn, b"a", b"1").unwrap();
        main.put(&txn, b"a", b"2").unwrap();
        assert_eq!(main.get(&txn, b"a").unwrap(), b"2".to_vec());
        main.delete(&txn, b"a").unwrap();
        assert!(matches!(main.get(&txn, b"a"), Err(StorageError::NotFound(_))));
        // a missing key leaves the transaction usable
        assert!(matches!(main.delete(&txn, b"a"), Err(StorageError::NotFound(_))));
        main.put(&txn, b"b", b"1").unwrap();
        txn.commit().unwrap();

        let txn = env.begin().unwrap();
        assert_eq!(main.find(&txn, b"b").unwrap(), Some(b"1".to_vec()));
        assert_eq!(main.find(&txn, b"a").unwrap(), None);
        txn.commit().unwrap();
    }

    #[test]
    fn test_abort_restores_previous_values() {
        let (_dir, env) = open();
        let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
        let txn = env.begin().unwrap();
        main.put(&txn, b"keep", b"old").unwrap();
        txn.commit().unwrap();

        let txn = env.begin().unwrap();
        main.put(&txn, b"keep", b"new").unwrap();
        main.put(&txn, b"extra", b"x").unwrap();
        txn.abort().unwrap();

        let txn = env.begin().unwrap();
        assert_eq!(main.get(&txn, b"keep").unwrap(), b"old".to_vec());
        assert_eq!(main.find(&txn, b"extra").unwrap(), None);
    }

    #[test]
    fn test_snapshot_hides_later_commits() {
        let (_dir, env) = open();
        let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
        let setup = env.begin().unwrap();
        main.put(&setup, b"k", b"v1").unwrap();
        setup.commit().unwrap();

        let reader = env.begin().unwrap();
        let writer = env.begin().unwrap();
        main.put(&writer, b"k", b"v2").unwrap();
        main.put(&writer, b"new", b"n").unwrap();
        assert_eq!(main.get(&reader, b"k").unwrap(), b"v1".to_vec());
        writer.commit().unwrap();
        assert_eq!(main.get(&reader, b"k").unwrap(), b"v1".to_vec());
        assert_eq!(main.find(&reader, b"new").unwrap(), None);

        let later = env.begin().unwrap();
        assert_eq!(main.get(&later, b"k").unwrap(), b"v2".to_vec());
    }

    #[test]
    fn test_delete_of_key_changed_after_snapshot_conflicts() {
        let (_dir, env) = open();
        let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
        let setup = env.begin().unwrap();
        main.put(&setup, b"old", b"v1").unwrap();
        setup.commit().unwrap();

        let stale = env.begin().unwrap();
        let blind = env.begin().unwrap();
        let other = env.begin().unwrap();
        main.delete(&other, b"old").unwrap();
        main.put(&other, b"new", b"n").unwrap();
        other.commit().unwrap();

        // the stale snapshot still sees "old" and not "new"
        assert_eq!(main.get(&stale, b"old").unwrap(), b"v1".to_vec());
        assert_eq!(main.find(&stale, b"new").unwrap(), None);
        let err = main.delete(&stale, b"old").unwrap_err();
        assert!(matches!(err, StorageError::WriteConflict { .. }));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(stale.state(), TransactionState::Aborted);

        // a key committed after the snapshot is never erased blindly
        assert!(matches!(main.delete(&blind, b"new"), Err(StorageError::WriteConflict { .. })));
        assert_eq!(blind.state(), TransactionState::Aborted);

        let later = env.begin().unwrap();
        assert_eq!(main.find(&later, b"old").unwrap(), None);
        assert_eq!(main.get(&later, b"new").unwrap(), b"n".to_vec());
        later.commit().unwrap();
    }

    #[test]
    fn test_first_committed_update_wins() {
        let (_dir, env) = open();
        let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
        let setup = env.begin().unwrap();
        main.put(&setup, b"k", b"v1").unwrap();
        setup.commit().unwrap();

        let slow = env.begin().unwrap();
        let fast = env.begin().unwrap();
        main.put(&fast, b"k", b"fast").unwrap();
        fast.commit().unwrap();
        assert!(matches!(main.put(&slow, b"k", b"slow"), Err(StorageError::WriteConflict { .. })));
        assert!(matches!(slow.commit(), Err(StorageError::TransactionAborted(_))));

        // a transaction that began after the commit may overwrite it
        let next = env.begin().unwrap();
        main.put(&next, b"k", b"next").unwrap();
        main.delete(&next, b"k").unwrap();
        main.put(&next, b"k", b"again").unwrap();
        next.commit().unwrap();
        let check = env.begin().unwrap();
        assert_eq!(main.get(&check, b"k").unwrap(), b"again".to_vec());
    }

    #[test]
    fn test_versions_collected_when_no_snapshot_needs_them() {
        let (_dir, env) = open();
        let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
        for round in 0..50u32 {
            let txn = env.begin().unwrap();
            main.put(&txn, &round.to_be_bytes(), b"first").unwrap();
            main.put(&txn, &round.to_be_bytes(), b"second").unwrap();
            txn.commit().unwrap();
            assert!(main.state().versions.is_empty(), "round {round} left versions behind");
        }

        let reader = env.begin().unwrap();
        let writer = env.begin().unwrap();
        main.put(&writer, b"k", b"v").unwrap();
        writer.commit().unwrap();
        assert_eq!(main.state().versions.len(), 1);
        assert_eq!(main.find(&reader, b"k").unwrap(), None);
        reader.commit().unwrap();
        assert!(main.state().versions.is_empty());

        let aborted = env.begin().unwrap();
        main.put(&aborted, b"k", b"gone").unwrap();
        aborted.abort().unwrap();
        assert!(main.state().versions.is_empty());
    }

    #[test]
    fn test_secondary_maintained_with_primary() {
        let (_dir, env) = open();
        let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
        let by_value = env.open_dictionary("by_value", DictionaryOptions::default().secondary_of(&main, 0)).unwrap();
        env.associate(&main, &by_value, generator(|_, _, value| Some(SecondaryEntry::new(value, b"".to_vec())))).unwrap();

        let txn = env.begin().unwrap();
        main.put(&txn, b"p1", b"red").unwrap();
        main.put(&txn, b"p2", b"red").unwrap();
        main.put(&txn, b"p1", b"blue").unwrap();
        assert!(by_value.find(&txn, &secondary_key::encode(b"red", b"p2")).unwrap().is_some());
        assert!(by_value.find(&txn, &secondary_key::encode(b"red", b"p1")).unwrap().is_none());
        assert!(by_value.find(&txn, &secondary_key::encode(b"blue", b"p1")).unwrap().is_some());
        assert!(matches!(by_value.put(&txn, b"x", b"y"), Err(StorageError::Usage(_))));
        main.delete(&txn, b"p2").unwrap();
        assert!(by_value.find(&txn, &secondary_key::encode(b"red", b"p2")).unwrap().is_none());
        txn.commit().unwrap();
    }

    #[test]
    fn test_descriptor_persists() {
        let dir = tempdir().unwrap();
        let config = EnvConfig::new(dir.path()).with_node_size(4096).with_checkpoint_period(0);
        {
            let env = Environment::open(config.clone()).unwrap();
            let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
            assert_eq!(main.descriptor(), Descriptor::default());
            main.set_descriptor(Descriptor::new(1, b"foo".to_vec())).unwrap();
            let tagged = env.open_dictionary("tagged", DictionaryOptions::default().with_descriptor(Descriptor::new(3, b"t".to_vec()))).unwrap();
            assert_eq!(tagged.descriptor(), Descriptor::new(3, b"t".to_vec()));
            drop((main, tagged));
            env.close().unwrap();
        }
        let env = Environment::open(config).unwrap();
        let main = env.open_dictionary("main", DictionaryOptions::existing()).unwrap();
        assert_eq!(main.descriptor(), Descriptor::new(1, b"foo".to_vec()));
    }

    #[test]
    fn test_oversized_entry_is_usage_error() {
        let (_dir, env) = open();
        let main = env.open_dictionary("main", DictionaryOptions::default()).unwrap();
        let txn = env.begin().unwrap();
        assert!(matches!(main.put(&txn, b"k", &vec![0u8; 4096]), Err(StorageError::Usage(_))));
        assert_eq!(txn.state(), TransactionState::Active);
    }
}
