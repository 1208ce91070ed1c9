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

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Total order over stored keys of one dictionary
pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Name of the comparator every registry carries
pub const BYTEWISE: &str = "bytewise";

/// Lexicographic byte order
pub fn bytewise() -> Comparator {
    Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
}

/// Named comparators available to dictionaries.
///
/// Comparators are code, not data, so the catalog stores only the name and the registry passed to
/// the environment resolves it on every open.
#[derive(Clone)]
pub struct ComparatorRegistry {
    comparators: HashMap<String, Comparator>,
}

impl ComparatorRegistry {
    pub fn new() -> Self {
        let mut comparators = HashMap::new();
        comparators.insert(BYTEWISE.to_string(), bytewise());
        Self { comparators }
    }

    /// Registers `comparator` under `name`, replacing an earlier registration.
    pub fn register<F>(&mut self, name: impl Into<String>, comparator: F)
    where
        F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
    {
        self.comparators.insert(name.into(), Arc::new(comparator));
    }

    pub fn get(&self, name: &str) -> Option<Comparator> {
        self.comparators.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.comparators.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.comparators.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ComparatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ComparatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComparatorRegistry").field("names", &self.names()).finish()
    }
}

/// Scan direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Where a positioned read starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekBound<'a> {
    /// First entry in the scan direction
    Start,
    /// First entry at or past the key
    Inclusive(&'a [u8]),
    /// First entry strictly past the key
    Exclusive(&'a [u8]),
}

impl SeekBound<'_> {
    /// Whether `key` satisfies the bound when scanning in `direction`.
    pub fn admits(&self, comparator: &Comparator, key: &[u8], direction: Direction) -> bool {
        let (bound, inclusive) = match self {
            SeekBound::Start => return true,
            SeekBound::Inclusive(bound) => (*bound, true),
            SeekBound::Exclusive(bound) => (*bound, false),
        };
        match (comparator(key, bound), direction) {
            (Ordering::Equal, _) => inclusive,
            (Ordering::Greater, Direction::Forward) | (Ordering::Less, Direction::Backward) => true,
            _ => false,
        }
    }
}

/// Result of applying a change to a tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change was applied; `previous` is the replaced or removed value
    Applied { previous: Option<Vec<u8>> },
    /// The target leaf already reflects a change at this or a later log position
    Skipped,
}

impl ApplyOutcome {
    pub fn previous(&self) -> Option<&[u8]> {
        match self {
            ApplyOutcome::Applied { previous } => previous.as_deref(),
            ApplyOutcome::Skipped => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_always_has_bytewise() {
        let registry = ComparatorRegistry::new();
        let cmp = registry.get(BYTEWISE).unwrap();
        assert_eq!(cmp(b"a", b"b"), Ordering::Less);
        assert!(registry.get("reverse").is_none());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ComparatorRegistry::new();
        registry.register("reverse", |a: &[u8], b: &[u8]| b.cmp(a));
        assert_eq!(registry.names(), vec!["bytewise".to_string(), "reverse".to_string()]);
        let cmp = registry.get("reverse").unwrap();
        assert_eq!(cmp(b"a", b"b"), Ordering::Greater);
    }

    #[test]
    fn test_seek_bound_admits() {
        let cmp = bytewise();
        assert!(SeekBound::Inclusive(b"b").admits(&cmp, b"b", Direction::Forward));
        assert!(!SeekBound::Exclusive(b"b").admits(&cmp, b"b", Direction::Forward));
        assert!(SeekBound::Exclusive(b"b").admits(&cmp, b"c", Direction::Forward));
        assert!(SeekBound::Exclusive(b"b").admits(&cmp, b"a", Direction::Backward));
        assert!(!SeekBound::Inclusive(b"b").admits(&cmp, b"c", Direction::Backward));
        assert!(SeekBound::Start.admits(&cmp, b"z", Direction::Backward));
    }
}
