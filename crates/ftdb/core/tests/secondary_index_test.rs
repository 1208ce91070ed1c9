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
//! Secondary dictionaries maintained from their primary inside the writing transaction.

mod common;

use common::config;
use ftdb_core::indices::secondary_key;
use ftdb_core::{Dictionary, DictionaryOptions, Environment, ErrorKind, SecondaryEntry, Transaction, generator};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Indexes rows by value; rows whose value starts with `-` are left out of the index.
fn by_value(env: &Environment, primary: &Dictionary) -> ftdb_core::StorageResult<Dictionary> {
    let secondary = env.open_dictionary("by_value", DictionaryOptions::default().secondary_of(primary, 1))?;
    let derive = generator(|_, key, value| if value.starts_with(b"-") { None } else { Some(SecondaryEntry::new(value, key)) });
    env.associate(primary, &secondary, derive)?;
    Ok(secondary)
}

fn entries(dictionary: &Dictionary, txn: &Transaction) -> ftdb_core::StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut cursor = dictionary.cursor(txn)?;
    let mut pairs = Vec::new();
    let mut entry = cursor.first()?;
    while let Some(found) = entry {
        let (sk, pk) = secondary_key::decode(&found.key)?;
        pairs.push((sk.to_vec(), pk.to_vec()));
        entry = cursor.next()?;
    }
    Ok(pairs)
}

fn pairs(raw: &[(&str, &str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
    raw.iter().map(|(sk, pk)| (sk.as_bytes().to_vec(), pk.as_bytes().to_vec())).collect()
}

#[test]
fn test_secondary_follows_puts_replacements_and_deletes() -> TestResult {
    let dir = tempfile::tempdir()?;
    let env = Environment::open(config(dir.path()))?;
    let people = env.open_dictionary("people", DictionaryOptions::default())?;
    let index = by_value(&env, &people)?;

    // Step 1: inserts derive one entry each, ordered by value then primary key
    let txn = env.begin()?;
    people.put(&txn, b"ada", b"london")?;
    people.put(&txn, b"alan", b"london")?;
    people.put(&txn, b"grace", b"arlington")?;
    people.put(&txn, b"nobody", b"-hidden")?;
    assert_eq!(entries(&index, &txn)?, pairs(&[("arlington", "grace"), ("london", "ada"), ("london", "alan")]));
    txn.commit()?;

    // Step 2: a replacement moves the entry, a delete removes it
    let txn = env.begin()?;
    people.put(&txn, b"alan", b"manchester")?;
    people.delete(&txn, b"grace")?;
    people.put(&txn, b"nobody", b"paris")?;
    txn.commit()?;

    let txn = env.begin()?;
    assert_eq!(entries(&index, &txn)?, pairs(&[("london", "ada"), ("manchester", "alan"), ("paris", "nobody")]));
    let stored = secondary_key::encode(b"manchester", b"alan");
    assert_eq!(index.get(&txn, &stored)?, b"alan".to_vec());
    txn.commit()?;
    drop((people, index));
    env.close()?;
    Ok(())
}

#[test]
fn test_aborted_transaction_restores_secondary() -> TestResult {
    let dir = tempfile::tempdir()?;
    let env = Environment::open(config(dir.path()))?;
    let people = env.open_dictionary("people", DictionaryOptions::default())?;
    let index = by_value(&env, &people)?;

    let txn = env.begin()?;
    people.put(&txn, b"ada", b"london")?;
    txn.commit()?;

    let txn = env.begin()?;
    people.put(&txn, b"ada", b"paris")?;
    people.put(&txn, b"linus", b"helsinki")?;
    assert_eq!(entries(&index, &txn)?, pairs(&[("helsinki", "linus"), ("paris", "ada")]));
    txn.abort()?;

    let txn = env.begin()?;
    assert_eq!(entries(&index, &txn)?, pairs(&[("london", "ada")]));
    assert_eq!(people.find(&txn, b"linus")?, None);
    txn.commit()?;
    drop((people, index));
    env.close()?;
    Ok(())
}

#[test]
fn test_secondary_rejects_direct_writes() -> TestResult {
    let dir = tempfile::tempdir()?;
    let env = Environment::open(config(dir.path()))?;
    let people = env.open_dictionary("people", DictionaryOptions::default())?;
    let index = by_value(&env, &people)?;

    let txn = env.begin()?;
    let err = index.put(&txn, b"x", b"y").err().expect("direct put must fail");
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert!(index.delete(&txn, b"x").is_err());
    // the refused write did not abort the transaction
    people.put(&txn, b"ada", b"london")?;
    txn.commit()?;
    drop((people, index));
    env.close()?;
    Ok(())
}

#[test]
fn test_secondary_survives_reopen_once_reassociated() -> TestResult {
    let dir = tempfile::tempdir()?;
    {
        let env = Environment::open(config(dir.path()))?;
        let people = env.open_dictionary("people", DictionaryOptions::default())?;
        let index = by_value(&env, &people)?;
        let txn = env.begin()?;
        people.put(&txn, b"ada", b"london")?;
        txn.commit()?;
        drop((people, index));
        env.close()?;
    }

    let env = Environment::open(config(dir.path()))?;
    let people = env.open_dictionary("people", DictionaryOptions::existing())?;
    let index = by_value(&env, &people)?;
    assert!(index.role().is_secondary());

    let txn = env.begin()?;
    people.put(&txn, b"ada", b"oxford")?;
    assert_eq!(entries(&index, &txn)?, pairs(&[("oxford", "ada")]));
    txn.commit()?;
    drop((people, index));
    env.close()?;
    Ok(())
}

#[test]
fn test_primary_refuses_writes_until_secondaries_are_reassociated() -> TestResult {
    let dir = tempfile::tempdir()?;
    {
        let env = Environment::open(config(dir.path()))?;
        let people = env.open_dictionary("people", DictionaryOptions::default())?;
        let index = by_value(&env, &people)?;
        let txn = env.begin()?;
        people.put(&txn, b"ada", b"london")?;
        txn.commit()?;
        drop((people, index));
        env.close()?;
    }

    let env = Environment::open(config(dir.path()))?;
    let people = env.open_dictionary("people", DictionaryOptions::existing())?;
    let txn = env.begin()?;
    // Step 1: with the secondary catalogued but not associated, writes are refused
    let err = people.put(&txn, b"ada", b"oxford").err().expect("unassociated put must fail");
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert!(err.to_string().contains("by_value"));
    assert_eq!(people.delete(&txn, b"ada").err().map(|e| e.kind()), Some(ErrorKind::Usage));
    // reads still work and the transaction stays usable
    assert_eq!(people.get(&txn, b"ada")?, b"london".to_vec());

    // Step 2: once associated, the same transaction writes and the secondary follows
    let index = by_value(&env, &people)?;
    assert_eq!(entries(&index, &txn)?, pairs(&[("london", "ada")]));
    people.put(&txn, b"ada", b"oxford")?;
    assert_eq!(entries(&index, &txn)?, pairs(&[("oxford", "ada")]));
    txn.commit()?;
    drop((people, index));
    env.close()?;
    Ok(())
}
