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

use std::sync::Arc;

/// One entry a primary row contributes to a secondary dictionary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryEntry {
    /// Secondary key; the stored key also carries the primary key
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl SecondaryEntry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Derives the entry a primary row contributes to secondary index number `index`.
///
/// Called with the index number, primary key and primary value; `None` means the row has no
/// entry in that index. Must be deterministic: the entry of an old row is derived again when
/// the row is replaced or deleted.
pub type SecondaryGenerator = Arc<dyn Fn(u32, &[u8], &[u8]) -> Option<SecondaryEntry> + Send + Sync>;

/// Wraps a closure as a generator.
pub fn generator<F>(f: F) -> SecondaryGenerator
where
    F: Fn(u32, &[u8], &[u8]) -> Option<SecondaryEntry> + Send + Sync + 'static,
{
    Arc::new(f)
}
