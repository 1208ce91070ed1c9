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

use parking_lot::Mutex;
use tracing::warn;

use super::EnvShared;
use crate::storage_engine::lib::{StorageError, StorageResult, TransactionId};
use crate::storage_engine::transaction::{TransactionContext, TransactionState};

/// A transaction over the dictionaries of one environment.
///
/// Reads see the snapshot taken at `Environment::begin` plus the transaction's own writes.
/// Dropping a transaction that is still active aborts it.
pub struct Transaction {
    shared: Arc<EnvShared>,
    id: TransactionId,
    context: Mutex<TransactionContext>,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<EnvShared>, context: TransactionContext) -> Self {
        Self { shared, id: context.id(), context: Mutex::new(context) }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.context.lock().state()
    }

    /// Commits; the changes are durable on return when the environment syncs every commit.
    pub fn commit(self) -> StorageResult<()> {
        self.shared.ensure_open()?;
        let mut context = self.context.lock();
        context.ensure_active()?;
        self.shared.commit(&mut context)
    }

    /// Rolls back every change. Aborting a deadlock victim, which the engine already rolled back, succeeds.
    pub fn abort(self) -> StorageResult<()> {
        self.shared.ensure_open()?;
        let mut context = self.context.lock();
        match context.state() {
            TransactionState::Active => {
                context.set_abort_reason("aborted by caller");
                self.shared.rollback(&mut context)
            }
            TransactionState::Aborted => Ok(()),
            state => Err(StorageError::Usage(format!("transaction {} cannot abort in state {:?}", self.id, state))),
        }
    }

    /// Runs `op` on behalf of this transaction.
    ///
    /// Errors that leave the transaction's changes in doubt roll it back; usage errors, missing
    /// keys and lock timeouts leave it active.
    pub(crate) fn run<T>(&self, shared: &Arc<EnvShared>, op: impl FnOnce(&mut TransactionContext) -> StorageResult<T>) -> StorageResult<T> {
        if !Arc::ptr_eq(&self.shared, shared) {
            return Err(StorageError::Usage(format!("transaction {} belongs to another environment", self.id)));
        }
        shared.ensure_open()?;
        let mut context = self.context.lock();
        context.ensure_active()?;
        let result = op(&mut context);
        if let Err(e) = &result
            && context.is_active()
            && !matches!(e, StorageError::Usage(_) | StorageError::AlreadyExists(_) | StorageError::NotFound(_) | StorageError::LockTimeout { .. } | StorageError::Config(_))
        {
            context.set_abort_reason(e.to_string());
            if let Err(rollback) = shared.rollback(&mut context) {
                warn!(txn = self.id, error = %rollback, "rollback after failed operation failed");
            }
        }
        result
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).field("state", &self.state()).finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.shared.is_closed() {
            return;
        }
        let context = self.context.get_mut();
        if context.is_active() {
            context.set_abort_reason("dropped while active");
            if let Err(e) = self.shared.rollback(context) {
                warn!(txn = self.id, error = %e, "rollback of dropped transaction failed");
            }
        }
    }
}
