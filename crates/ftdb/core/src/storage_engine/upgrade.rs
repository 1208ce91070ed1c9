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

//! Format upgrader.
//!
//! Nodes are upgraded lazily: whenever the node store fetches a block whose layout is
//! older than the environment's target layout, the node is decoded with the historical
//! codec, handed out in the canonical representation and marked dirty so its next
//! write lands in the target layout. Nothing ever rewrites a dictionary in bulk.
//!
//! Progress is tracked per dictionary as the number of nodes still stored in an older
//! layout. The count is computed from the translation table that a checkpoint makes
//! durable, so it only decreases and never runs ahead of what is on disk.

use std::sync::atomic::{AtomicU64, Ordering};

use ftdb_common::LayoutVersion;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage_engine::file_format::{Node, NodeId, VersionedNode};
use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult};

/// Upgrade progress marker persisted with every dictionary checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeProgress {
    /// Layout nodes are being upgraded to
    pub target: LayoutVersion,
    /// Nodes still stored in an older layout
    pub legacy_remaining: u64,
}

impl UpgradeProgress {
    pub fn complete(target: LayoutVersion) -> Self {
        Self { target, legacy_remaining: 0 }
    }

    pub fn is_complete(&self) -> bool {
        self.legacy_remaining == 0
    }

    /// Whether `next` is a legal successor of this marker for the same target.
    pub fn advances_to(&self, next: &UpgradeProgress) -> bool {
        self.target != next.target || next.legacy_remaining <= self.legacy_remaining
    }
}

/// Converts stored nodes to the target layout and counts the conversions
#[derive(Debug)]
pub struct FormatUpgrader {
    /// Layout every node is converted to
    target: LayoutVersion,
    /// Nodes upgraded by this process
    upgraded: AtomicU64,
}

impl FormatUpgrader {
    pub fn new(target: LayoutVersion) -> Self {
        Self { target, upgraded: AtomicU64::new(0) }
    }

    pub fn target(&self) -> LayoutVersion {
        self.target
    }

    /// Whether a node stored in `layout` must be rewritten.
    pub fn is_stale(&self, layout: LayoutVersion) -> bool {
        layout < self.target
    }

    /// Turns a stored node into its canonical form.
    ///
    /// Returns the node and whether it was upgraded, in which case the caller must mark it dirty.
    /// A node newer than the target cannot be written back by this environment and is rejected.
    pub fn admit(&self, dictionary: DictionaryId, id: NodeId, stored: VersionedNode) -> StorageResult<(Node, bool)> {
        let layout = stored.layout();
        if layout > self.target {
            return Err(StorageError::Corruption(format!(
                "node {} of dictionary {} uses layout {} newer than the configured layout {}",
                id, dictionary, layout, self.target
            )));
        }
        let upgraded = self.is_stale(layout);
        if upgraded {
            self.upgraded.fetch_add(1, Ordering::Relaxed);
            debug!(dictionary = %dictionary, node = %id, from = %layout, to = %self.target, "upgrading node");
        }
        Ok((stored.into_node(), upgraded))
    }

    /// Nodes upgraded since this upgrader was created.
    pub fn upgraded_count(&self) -> u64 {
        self.upgraded.load(Ordering::Relaxed)
    }
}
