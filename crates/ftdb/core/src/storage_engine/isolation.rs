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

//! Lock Manager
//!
//! This module implements two-phase locking over dictionary keys and whole-dictionary
//! ranges. Shared locks are mutually compatible, exclusive locks conflict with every
//! other mode, and a range lock conflicts with key locks of the same dictionary the
//! same way. Blocked requests wait on a condition variable; each wait updates the
//! wait-for graph and runs cycle detection, aborting the youngest transaction of a cycle.
//! Locks are released only all at once, when a transaction ends.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, warn};

use crate::storage_engine::deadlock_detector::WaitForGraph;
use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult, TransactionId};

/// Lock mode for concurrency control
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Shared lock for reading
    Shared,
    /// Exclusive lock for writing
    Exclusive,
}

impl LockMode {
    pub fn is_compatible(self, other: LockMode) -> bool {
        self == LockMode::Shared && other == LockMode::Shared
    }
}

/// Something a transaction can lock
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockResource {
    /// One key of a dictionary
    Key { dictionary: DictionaryId, key: Vec<u8> },
    /// Every key of a dictionary, present or future
    Range { dictionary: DictionaryId },
}

impl LockResource {
    pub fn key(dictionary: DictionaryId, key: &[u8]) -> Self {
        LockResource::Key { dictionary, key: key.to_vec() }
    }

    pub fn range(dictionary: DictionaryId) -> Self {
        LockResource::Range { dictionary }
    }

    pub fn dictionary(&self) -> DictionaryId {
        match self {
            LockResource::Key { dictionary, .. } | LockResource::Range { dictionary } => *dictionary,
        }
    }

    fn overlaps(&self, other: &LockResource) -> bool {
        match (self, other) {
            (LockResource::Key { .. }, LockResource::Key { .. }) => self == other,
            _ => self.dictionary() == other.dictionary(),
        }
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockResource::Key { dictionary, key } => write!(f, "key {} of dictionary {}", hex::encode(key), dictionary),
            LockResource::Range { dictionary } => write!(f, "range of dictionary {}", dictionary),
        }
    }
}

/// Lock statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStatistics {
    pub granted: u64,
    pub waits: u64,
    pub deadlocks: u64,
    pub timeouts: u64,
    /// Resources currently locked
    pub locked_resources: usize,
    /// Transactions currently blocked
    pub waiting_transactions: usize,
}

#[derive(Debug, Default)]
struct LockCounters {
    granted: AtomicU64,
    waits: AtomicU64,
    deadlocks: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Default)]
struct LockTable {
    /// Holders and their mode per locked resource
    granted: HashMap<LockResource, HashMap<TransactionId, LockMode>>,
    /// Resources held by each transaction
    transaction_locks: HashMap<TransactionId, HashSet<LockResource>>,
    /// Waits of blocked transactions
    graph: WaitForGraph,
    /// Blocked transactions chosen as deadlock victims that have not noticed yet
    victims: HashSet<TransactionId>,
}

impl LockTable {
    /// Transactions whose locks prevent `txn_id` from taking `resource` in `mode`.
    fn blockers(&self, txn_id: TransactionId, resource: &LockResource, mode: LockMode) -> Vec<TransactionId> {
        let mut blockers: Vec<TransactionId> = Vec::new();
        let candidates: Box<dyn Iterator<Item = (&LockResource, &HashMap<TransactionId, LockMode>)> + '_> = match resource {
            // a key request only meets the same key and its dictionary's range lock
            LockResource::Key { dictionary, .. } => {
                let range = LockResource::range(*dictionary);
                let exact = self.granted.get_key_value(resource);
                let ranged = self.granted.get_key_value(&range).map(|(_, holders)| (resource, holders));
                Box::new(exact.into_iter().chain(ranged))
            }
            LockResource::Range { .. } => Box::new(self.granted.iter().filter(|(held, _)| held.overlaps(resource))),
        };
        for (_, holders) in candidates {
            for (&holder, &held) in holders {
                if holder != txn_id && !held.is_compatible(mode) && !blockers.contains(&holder) {
                    blockers.push(holder);
                }
            }
        }
        blockers.sort_unstable();
        blockers
    }

    fn grant(&mut self, txn_id: TransactionId, resource: &LockResource, mode: LockMode) {
        let holders = self.granted.entry(resource.clone()).or_default();
        let held = holders.entry(txn_id).or_insert(mode);
        *held = (*held).max(mode);
        self.transaction_locks.entry(txn_id).or_default().insert(resource.clone());
    }
}

/// Lock manager for concurrency control
pub struct LockManager {
    table: Mutex<LockTable>,
    /// Signalled whenever locks are released or a victim is chosen
    released: Condvar,
    /// Upper bound on a single wait; `None` waits until granted or deadlocked
    timeout: Option<Duration>,
    counters: LockCounters,
}

impl LockManager {
    /// Create a new lock manager; a zero `timeout_ms` waits without bound.
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            counters: LockCounters::default(),
        }
    }

    /// Acquires `resource` in `mode` for `txn_id`, blocking while other transactions hold conflicting locks.
    ///
    /// Steps:
    /// 1. Grant immediately when nothing conflicts (re-requests and upgrades included)
    /// 2. Otherwise record wait-for edges and look for a cycle through the requester
    /// 3. A cycle aborts its youngest member: the requester itself fails with `Deadlock`,
    ///    a blocked victim is woken and fails the same way
    /// 4. Wait for a release and retry, failing with `LockTimeout` past the configured bound
    pub fn acquire(&self, txn_id: TransactionId, resource: LockResource, mode: LockMode) -> StorageResult<()> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut table = self.table.lock();
        let mut waited = false;
        loop {
            if table.victims.remove(&txn_id) {
                table.graph.remove_waiter(txn_id);
                return Err(StorageError::Deadlock { txn_id });
            }

            let blockers = table.blockers(txn_id, &resource, mode);
            if blockers.is_empty() {
                table.graph.remove_waiter(txn_id);
                table.grant(txn_id, &resource, mode);
                self.counters.granted.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            table.graph.set_waits(txn_id, &blockers, &resource);
            if let Some(cycle) = table.graph.find_cycle_from(txn_id) {
                let victim = cycle.youngest_transaction();
                self.counters.deadlocks.fetch_add(1, Ordering::Relaxed);
                warn!(victim, cycle = ?cycle.transactions, resources = ?cycle.resources, resource = %resource, "deadlock detected");
                if victim == txn_id {
                    table.graph.remove_waiter(txn_id);
                    return Err(StorageError::Deadlock { txn_id });
                }
                table.victims.insert(victim);
                // victims stop waiting, so their edges must not close the cycle again
                table.graph.remove_waiter(victim);
                self.released.notify_all();
            }

            if !waited {
                waited = true;
                self.counters.waits.fetch_add(1, Ordering::Relaxed);
                debug!(txn_id, resource = %resource, blockers = ?blockers, "waiting for lock");
            }
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut table, deadline).timed_out() && !table.victims.contains(&txn_id) {
                        if table.blockers(txn_id, &resource, mode).is_empty() {
                            continue;
                        }
                        table.graph.remove_waiter(txn_id);
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(StorageError::LockTimeout { txn_id, resource: resource.to_string() });
                    }
                }
                None => self.released.wait(&mut table),
            }
        }
    }

    /// Releases every lock of `txn_id` at once and wakes blocked requests.
    pub fn release_all(&self, txn_id: TransactionId) -> usize {
        let mut table = self.table.lock();
        let resources = table.transaction_locks.remove(&txn_id).unwrap_or_default();
        for resource in &resources {
            if let Some(holders) = table.granted.get_mut(resource) {
                holders.remove(&txn_id);
                if holders.is_empty() {
                    table.granted.remove(resource);
                }
            }
        }
        table.graph.remove_transaction(txn_id);
        table.victims.remove(&txn_id);
        drop(table);
        self.released.notify_all();
        resources.len()
    }

    pub fn statistics(&self) -> LockStatistics {
        let table = self.table.lock();
        LockStatistics {
            granted: self.counters.granted.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            deadlocks: self.counters.deadlocks.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            locked_resources: table.granted.len(),
            waiting_transactions: table.graph.waiter_count(),
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn key(k: &str) -> LockResource {
        LockResource::key(DictionaryId(1), k.as_bytes())
    }

    #[test]
    fn test_lock_compatibility() {
        let locks = LockManager::new(50);
        locks.acquire(1, key("a"), LockMode::Shared).unwrap();
        locks.acquire(2, key("a"), LockMode::Shared).unwrap();
        let err = locks.acquire(3, key("a"), LockMode::Exclusive).unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { txn_id: 3, .. }));
        locks.acquire(3, key("b"), LockMode::Exclusive).unwrap();
        assert_eq!(locks.statistics().timeouts, 1);
    }

    #[test]
    fn test_lock_upgrade() {
        let locks = LockManager::new(50);
        locks.acquire(1, key("a"), LockMode::Shared).unwrap();
        locks.acquire(1, key("a"), LockMode::Exclusive).unwrap();
        assert!(locks.acquire(2, key("a"), LockMode::Shared).is_err());
        // a later shared request does not downgrade
        locks.acquire(1, key("a"), LockMode::Shared).unwrap();
        assert!(locks.acquire(2, key("a"), LockMode::Shared).is_err());
        assert_eq!(locks.release_all(1), 1);
        locks.acquire(2, key("a"), LockMode::Shared).unwrap();
    }

    #[test]
    fn test_range_lock_blocks_key_writes() {
        let locks = LockManager::new(50);
        locks.acquire(1, LockResource::range(DictionaryId(1)), LockMode::Shared).unwrap();
        locks.acquire(2, key("a"), LockMode::Shared).unwrap();
        assert!(locks.acquire(2, key("b"), LockMode::Exclusive).is_err());
        // other dictionaries are unaffected
        locks.acquire(2, LockResource::key(DictionaryId(2), b"b"), LockMode::Exclusive).unwrap();
        assert!(locks.acquire(1, LockResource::range(DictionaryId(2)), LockMode::Shared).is_err());
    }

    #[test]
    fn test_release_wakes_waiter() {
        let locks = Arc::new(LockManager::new(0));
        locks.acquire(1, key("a"), LockMode::Exclusive).unwrap();
        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || locks.acquire(2, key("a"), LockMode::Exclusive))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(locks.release_all(1), 1);
        waiter.join().unwrap().unwrap();
        assert_eq!(locks.statistics().locked_resources, 1);
        assert_eq!(locks.release_all(2), 1);
    }

    #[test]
    fn test_deadlock_aborts_youngest() {
        let locks = Arc::new(LockManager::new(0));
        locks.acquire(1, key("x"), LockMode::Exclusive).unwrap();
        locks.acquire(2, key("y"), LockMode::Exclusive).unwrap();
        let older = {
            let locks = locks.clone();
            thread::spawn(move || locks.acquire(1, key("y"), LockMode::Exclusive))
        };
        thread::sleep(Duration::from_millis(50));
        let err = locks.acquire(2, key("x"), LockMode::Exclusive).unwrap_err();
        assert!(matches!(err, StorageError::Deadlock { txn_id: 2 }));
        locks.release_all(2);
        older.join().unwrap().unwrap();
        assert_eq!(locks.statistics().deadlocks, 1);
    }

    #[test]
    fn test_blocked_victim_is_woken() {
        let locks = Arc::new(LockManager::new(0));
        locks.acquire(1, key("x"), LockMode::Exclusive).unwrap();
        locks.acquire(2, key("y"), LockMode::Exclusive).unwrap();
        // the younger transaction blocks first, so the older one closes the cycle
        let younger = {
            let locks = locks.clone();
            thread::spawn(move || {
                let result = locks.acquire(2, key("x"), LockMode::Exclusive);
                locks.release_all(2);
                result
            })
        };
        thread::sleep(Duration::from_millis(50));
        locks.acquire(1, key("y"), LockMode::Exclusive).unwrap();
        assert!(matches!(younger.join().unwrap(), Err(StorageError::Deadlock { txn_id: 2 })));
    }
}
