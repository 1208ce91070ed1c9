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

// Stored keys of secondary dictionaries
// A secondary entry is stored under `u32 LE length(secondary key) || secondary key || primary key` so equal secondary keys of different rows stay distinct and individually deletable.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::indices::lib::Comparator;
use crate::storage_engine::lib::{StorageError, StorageResult};

const LENGTH_PREFIX: usize = 4;

/// Builds the stored key of a secondary entry.
pub fn encode(secondary_key: &[u8], primary_key: &[u8]) -> Vec<u8> {
    let mut stored = Vec::with_capacity(LENGTH_PREFIX + secondary_key.len() + primary_key.len());
    stored.extend_from_slice(&(secondary_key.len() as u32).to_le_bytes());
    stored.extend_from_slice(secondary_key);
    stored.extend_from_slice(primary_key);
    stored
}

/// Splits a stored key into secondary key and primary key.
pub fn decode(stored: &[u8]) -> StorageResult<(&[u8], &[u8])> {
    split(stored).ok_or_else(|| StorageError::Corruption(format!("malformed secondary key of {} bytes", stored.len())))
}

fn split(stored: &[u8]) -> Option<(&[u8], &[u8])> {
    let prefix: [u8; LENGTH_PREFIX] = stored.get(..LENGTH_PREFIX)?.try_into().ok()?;
    let len = u32::from_le_bytes(prefix) as usize;
    let rest = &stored[LENGTH_PREFIX..];
    if len > rest.len() {
        return None;
    }
    Some(rest.split_at(len))
}

/// Orders stored secondary keys by `secondary` on the secondary key, then by `primary` on the primary key.
///
/// Malformed keys sort bytewise after every well-formed key.
pub fn comparator(secondary: Comparator, primary: Comparator) -> Comparator {
    Arc::new(move |a: &[u8], b: &[u8]| match (split(a), split(b)) {
        (Some((sa, pa)), Some((sb, pb))) => secondary(sa, sb).then_with(|| primary(pa, pb)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indices::lib::bytewise;

    #[test]
    fn test_encode_decode() {
        let stored = encode(b"blue", b"row-7");
        assert_eq!(&stored[..4], &4u32.to_le_bytes());
        assert_eq!(decode(&stored).unwrap(), (&b"blue"[..], &b"row-7"[..]));
        assert!(decode(&[1, 0]).is_err());
        assert!(decode(&[9, 0, 0, 0, b'a']).is_err());
    }

    #[test]
    fn test_orders_by_secondary_then_primary() {
        let cmp = comparator(bytewise(), bytewise());
        // a longer secondary key must not be split at the shorter one's length
        assert_eq!(cmp(&encode(b"ab", b"z"), &encode(b"abc", b"a")), Ordering::Less);
        assert_eq!(cmp(&encode(b"k", b"1"), &encode(b"k", b"2")), Ordering::Less);
        assert_eq!(cmp(&encode(b"k", b"2"), &encode(b"k", b"2")), Ordering::Equal);
    }

    #[test]
    fn test_uses_inner_comparators() {
        let reverse: Comparator = Arc::new(|a: &[u8], b: &[u8]| b.cmp(a));
        let cmp = comparator(reverse, bytewise());
        assert_eq!(cmp(&encode(b"a", b"1"), &encode(b"b", b"1")), Ordering::Greater);
        assert_eq!(cmp(&encode(b"a", b"1"), &encode(b"a", b"2")), Ordering::Less);
    }
}
