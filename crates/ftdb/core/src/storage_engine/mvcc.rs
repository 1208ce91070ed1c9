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

//! Multi-Version Concurrency Control (MVCC) Implementation
//!
//! The tree of a dictionary always holds the newest value of every key, committed or
//! not. Each write first records the value it replaces in the dictionary's version
//! store, so a reader can walk a key's chain from newest to oldest and undo every
//! change it must not see. Chains are dropped once every active snapshot sees them.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use parking_lot::Mutex;

use crate::indices::lib::{Comparator, Direction, SeekBound};
use crate::storage_engine::lib::{DictionaryId, TransactionId};

/// Commit sequence number; a snapshot sees every commit at or below it
pub type Timestamp = u64;

/// What a reading transaction may see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadView {
    /// The reader, whose own writes are always visible
    pub txn_id: TransactionId,
    /// Highest commit sequence visible to the reader
    pub snapshot: Timestamp,
}

impl ReadView {
    fn sees(&self, version: &VersionInfo) -> bool {
        version.created_by == self.txn_id || version.committed_at.is_some_and(|seq| seq <= self.snapshot)
    }
}

/// One change to a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Transaction that made the change
    pub created_by: TransactionId,
    /// Commit sequence of that transaction once committed
    pub committed_at: Option<Timestamp>,
    /// Value the change replaced; `None` when the key was absent
    pub before: Option<Vec<u8>>,
}

/// Changes to a single key, oldest first
#[derive(Debug, Default, Clone)]
pub struct VersionChain {
    versions: Vec<VersionInfo>,
}

impl VersionChain {
    /// Value of the key as seen by `view`, given the newest value `current`.
    fn resolve(&self, current: Option<Vec<u8>>, view: &ReadView) -> Option<Vec<u8>> {
        let mut value = current;
        for version in self.versions.iter().rev() {
            if view.sees(version) {
                break;
            }
            value = version.before.clone();
        }
        value
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Key ordered by its dictionary's comparator
#[derive(Clone)]
struct CmpKey {
    key: Vec<u8>,
    comparator: Comparator,
}

impl PartialEq for CmpKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CmpKey {}

impl PartialOrd for CmpKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CmpKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.comparator)(&self.key, &other.key)
    }
}

impl fmt::Debug for CmpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.key))
    }
}

/// Version chains of one dictionary
pub struct VersionStore {
    dictionary: DictionaryId,
    comparator: Comparator,
    chains: Mutex<BTreeMap<CmpKey, VersionChain>>,
}

impl VersionStore {
    pub fn new(dictionary: DictionaryId, comparator: Comparator) -> Self {
        Self { dictionary, comparator, chains: Mutex::new(BTreeMap::new()) }
    }

    pub fn dictionary_id(&self) -> DictionaryId {
        self.dictionary
    }

    fn wrap(&self, key: &[u8]) -> CmpKey {
        CmpKey { key: key.to_vec(), comparator: self.comparator.clone() }
    }

    /// Records that `writer` is about to replace `before` under `key`.
    ///
    /// Must be called under the tree's exclusive latch, before the tree changes.
    pub fn record(&self, key: &[u8], writer: TransactionId, before: Option<Vec<u8>>) {
        let mut chains = self.chains.lock();
        chains.entry(self.wrap(key)).or_default().versions.push(VersionInfo { created_by: writer, committed_at: None, before });
    }

    /// Value of `key` visible to `view`, given the tree's value `current`.
    pub fn resolve(&self, key: &[u8], current: Option<Vec<u8>>, view: &ReadView) -> Option<Vec<u8>> {
        let chains = self.chains.lock();
        match chains.get(&self.wrap(key)) {
            Some(chain) => chain.resolve(current, view),
            None => current,
        }
    }

    /// Newest commit on `key` by another transaction that `view` cannot see.
    ///
    /// A writer holding the key's exclusive lock must not overwrite such a change.
    pub fn committed_after(&self, key: &[u8], view: &ReadView) -> Option<Timestamp> {
        let chains = self.chains.lock();
        let chain = chains.get(&self.wrap(key))?;
        chain.versions.iter().filter(|v| v.created_by != view.txn_id).filter_map(|v| v.committed_at).filter(|seq| *seq > view.snapshot).max()
    }

    /// Stamps every change of `writer` on `keys` with its commit sequence.
    pub fn mark_committed(&self, writer: TransactionId, keys: &[Vec<u8>], seq: Timestamp) {
        let mut chains = self.chains.lock();
        for key in keys {
            if let Some(chain) = chains.get_mut(&self.wrap(key)) {
                for version in chain.versions.iter_mut().filter(|v| v.created_by == writer) {
                    version.committed_at = Some(seq);
                }
            }
        }
    }

    /// Drops the changes of an aborted `writer` once the tree has been restored.
    pub fn discard(&self, writer: TransactionId, keys: &[Vec<u8>]) {
        let mut chains = self.chains.lock();
        for key in keys {
            let wrapped = self.wrap(key);
            if let Some(chain) = chains.get_mut(&wrapped) {
                chain.versions.retain(|v| v.created_by != writer);
                if chain.is_empty() {
                    chains.remove(&wrapped);
                }
            }
        }
    }

    /// Removes every change visible to all snapshots at or above `horizon`, returning how many went.
    ///
    /// A reader stops at the newest version it sees, so that version and everything older is
    /// dead once the oldest active snapshot sees it.
    pub fn collect(&self, horizon: Timestamp) -> usize {
        let mut chains = self.chains.lock();
        let mut removed = 0;
        chains.retain(|_, chain| {
            if let Some(newest_visible) = chain.versions.iter().rposition(|v| v.committed_at.is_some_and(|seq| seq <= horizon)) {
                chain.versions.drain(..=newest_visible);
                removed += newest_visible + 1;
            }
            !chain.is_empty()
        });
        removed
    }

    /// Next key with a chain, strictly past `bound` in `direction`.
    pub fn next_key(&self, bound: SeekBound<'_>, direction: Direction) -> Option<Vec<u8>> {
        let chains = self.chains.lock();
        let edge = match bound {
            SeekBound::Start => Bound::Unbounded,
            SeekBound::Inclusive(key) => Bound::Included(self.wrap(key)),
            SeekBound::Exclusive(key) => Bound::Excluded(self.wrap(key)),
        };
        let found = match direction {
            Direction::Forward => chains.range((edge, Bound::Unbounded)).next(),
            Direction::Backward => chains.range((Bound::Unbounded, edge)).next_back(),
        };
        found.map(|(key, _)| key.key.clone())
    }

    /// Keys with live chains
    pub fn len(&self) -> usize {
        self.chains.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
