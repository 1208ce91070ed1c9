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

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult, TransactionId, generate_timestamp, write_file_atomic};
use crate::storage_engine::upgrade::UpgradeProgress;

/// File holding the latest completed checkpoint record
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Per-dictionary state captured by a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryCheckpoint {
    pub id: DictionaryId,
    pub name: String,
    /// Packed LSN written to the dictionary's header
    pub checkpoint_lsn: u64,
    /// Upgrade progress marker as of the checkpoint
    pub upgrade: UpgradeProgress,
}

/// Metadata describing the latest completed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: u64,
    pub timestamp: u64,
    /// Packed LSN of the CheckpointBegin record
    pub begin_lsn: u64,
    /// Packed LSN of the CheckpointEnd record
    pub end_lsn: u64,
    /// Highest transaction id handed out when the checkpoint ended
    pub last_txn_id: TransactionId,
    /// Set by the checkpoint taken when an environment closes
    pub clean_shutdown: bool,
    pub dictionaries: Vec<DictionaryCheckpoint>,
}

impl CheckpointRecord {
    pub fn new(id: u64, begin_lsn: u64, end_lsn: u64, last_txn_id: TransactionId) -> Self {
        Self { id, timestamp: generate_timestamp(), begin_lsn, end_lsn, last_txn_id, clean_shutdown: false, dictionaries: Vec::new() }
    }

    pub fn path(directory: &Path) -> PathBuf {
        directory.join(CHECKPOINT_FILE)
    }

    /// Loads the record from `directory`; an environment that never checkpointed has none.
    pub fn load(directory: &Path) -> StorageResult<Option<Self>> {
        let bytes = match fs::read(Self::path(directory)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corruption(format!("unreadable checkpoint record: {e}")))
    }

    /// Replaces the stored record atomically.
    pub fn store(&self, directory: &Path) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| StorageError::Corruption(format!("cannot encode checkpoint record: {e}")))?;
        write_file_atomic(&Self::path(directory), &bytes)
    }

    pub fn dictionary(&self, id: DictionaryId) -> Option<&DictionaryCheckpoint> {
        self.dictionaries.iter().find(|d| d.id == id)
    }
}

struct CoordinatorSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread running fuzzy checkpoints on a fixed period.
///
/// The job returns `false` once the environment it checkpoints is gone, which ends the thread.
pub struct CheckpointCoordinator {
    signal: Arc<CoordinatorSignal>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointCoordinator {
    pub fn start<F>(period: Duration, mut job: F) -> StorageResult<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let signal = Arc::new(CoordinatorSignal { stopped: Mutex::new(false), wake: Condvar::new() });
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new().name("ftdb-checkpoint".into()).spawn(move || {
            debug!(period_secs = period.as_secs(), "checkpoint coordinator started");
            loop {
                let deadline = Instant::now() + period;
                let mut stopped = thread_signal.stopped.lock();
                while !*stopped && Instant::now() < deadline {
                    thread_signal.wake.wait_until(&mut stopped, deadline);
                }
                if *stopped {
                    break;
                }
                drop(stopped);
                if !job() {
                    break;
                }
            }
            debug!("checkpoint coordinator stopped");
        })?;
        Ok(Self { signal, handle: Some(handle) })
    }

    /// Stops the thread and waits for a running checkpoint to finish.
    pub fn stop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("checkpoint coordinator panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CheckpointCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Logs how long a checkpoint phase took.
pub(crate) fn log_duration(phase: &str, started: Instant) {
    info!(phase, elapsed_ms = started.elapsed().as_millis() as u64, "checkpoint phase finished");
}
