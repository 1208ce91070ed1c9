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
//! Shared helpers for the integration tests: deterministic rows and the matching secondary
//! generator, so any test can recompute what every dictionary must hold.

#![allow(dead_code)]

use std::path::Path;

use ftdb_core::env::{DictionaryOptions, SecondaryEntry, SecondaryGenerator, generator};
use ftdb_core::indices::secondary_key;
use ftdb_core::{Dictionary, EnvConfig, Environment, StorageResult};

pub const NODE_SIZE: usize = 4096;

/// Configuration used by the integration tests: small nodes, no background checkpoints.
pub fn config(dir: &Path) -> EnvConfig {
    EnvConfig::new(dir).with_node_size(NODE_SIZE).with_checkpoint_period(0).with_redzone(0)
}

/// Primary key of row `k`; big-endian so bytewise order matches numeric order.
pub fn key(k: u32) -> Vec<u8> {
    k.to_be_bytes().to_vec()
}

/// Value of row `k` as seen by index `i`; index 0 is the primary value.
pub fn value(k: u32, i: u32) -> Vec<u8> {
    let mixed = k.wrapping_mul(2_654_435_761).rotate_left(i * 7) ^ i;
    mixed.to_be_bytes().to_vec()
}

/// Secondary key row `k` contributes to index `i`.
pub fn secondary_key_of(k: u32, i: u32) -> Vec<u8> {
    let mut sk = value(k, i);
    sk.extend_from_slice(&i.to_be_bytes());
    sk
}

/// Stored key of row `k` inside secondary `i`.
pub fn stored_secondary_key(k: u32, i: u32) -> Vec<u8> {
    secondary_key::encode(&secondary_key_of(k, i), &key(k))
}

pub fn decode_key(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(raw)
}

/// Generator deriving index `i` entries from the primary key alone.
pub fn row_generator() -> SecondaryGenerator {
    generator(|index, primary_key, _value| {
        if primary_key.len() != 4 {
            return None;
        }
        let k = decode_key(primary_key);
        Some(SecondaryEntry::new(secondary_key_of(k, index), value(k, index)))
    })
}

/// Opens the primary `primary` and `secondaries` secondaries named `primary.1`, `primary.2`...
/// and associates them.
pub fn open_indexed(env: &Environment, secondaries: u32) -> StorageResult<(Dictionary, Vec<Dictionary>)> {
    let primary = env.open_dictionary("primary", DictionaryOptions::default())?;
    let mut indexes = Vec::new();
    for i in 1..=secondaries {
        let secondary = env.open_dictionary(&format!("primary.{i}"), DictionaryOptions::default().secondary_of(&primary, i))?;
        env.associate(&primary, &secondary, row_generator())?;
        indexes.push(secondary);
    }
    Ok((primary, indexes))
}

/// Inserts rows `first..first + count` in transactions of `per_txn` rows.
pub fn insert_rows(env: &Environment, primary: &Dictionary, first: u32, count: u32, per_txn: u32) -> StorageResult<()> {
    let mut next = first;
    let end = first + count;
    while next < end {
        let txn = env.begin()?;
        let batch_end = (next + per_txn).min(end);
        for k in next..batch_end {
            primary.put(&txn, &key(k), &value(k, 0))?;
        }
        txn.commit()?;
        next = batch_end;
    }
    Ok(())
}

/// Walks the primary and every secondary, checking that exactly `rows` are present in each.
pub fn check_rows(env: &Environment, primary: &Dictionary, secondaries: &[Dictionary], rows: &[u32]) -> StorageResult<usize> {
    let txn = env.begin()?;
    let mut total = 0;

    let mut cursor = primary.cursor(&txn)?;
    let mut expected = rows.iter();
    let mut entry = cursor.first()?;
    while let Some(found) = entry {
        let k = *expected.next().expect("primary holds more rows than expected");
        assert_eq!(found.key, key(k));
        assert_eq!(found.value, value(k, 0));
        total += 1;
        entry = cursor.next()?;
    }
    assert!(expected.next().is_none(), "primary is missing rows");
    drop(cursor);

    for (offset, secondary) in secondaries.iter().enumerate() {
        let i = offset as u32 + 1;
        let mut wanted: Vec<(Vec<u8>, Vec<u8>)> = rows.iter().map(|&k| (stored_secondary_key(k, i), value(k, i))).collect();
        wanted.sort();
        let mut cursor = secondary.cursor(&txn)?;
        let mut seen = Vec::with_capacity(wanted.len());
        let mut entry = cursor.first()?;
        while let Some(found) = entry {
            seen.push((found.key, found.value));
            entry = cursor.next()?;
        }
        assert_eq!(seen.len(), wanted.len(), "secondary {i} entry count");
        assert!(seen == wanted, "secondary {i} contents differ");
        total += seen.len();
    }
    txn.commit()?;
    Ok(total)
}
