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

// Dictionary catalog
// Names, files, roles, comparators and descriptors of every dictionary in an environment, persisted as JSON next to the dictionary files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult, write_file_atomic};

/// File holding the catalog
pub const CATALOG_FILE: &str = "catalog.json";

/// Suffix of dictionary node files
pub const DICTIONARY_SUFFIX: &str = "ftd";

/// Whether a dictionary holds rows or entries derived from another dictionary's rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DictionaryRole {
    Primary,
    /// Index number `index` over `primary`; the index number is handed to the generator
    Secondary { index: u32, primary: DictionaryId },
}

impl DictionaryRole {
    pub fn is_secondary(&self) -> bool {
        matches!(self, DictionaryRole::Secondary { .. })
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// Opaque, versioned metadata attached to a dictionary by its owner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub version: u32,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl Descriptor {
    pub fn new(version: u32, data: impl Into<Vec<u8>>) -> Self {
        Self { version, data: data.into() }
    }
}

/// One catalogued dictionary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: DictionaryId,
    pub name: String,
    /// Node file name relative to the environment directory
    pub file: String,
    pub role: DictionaryRole,
    /// Name of the comparator in the environment's registry
    pub comparator: String,
    pub descriptor: Descriptor,
}

impl CatalogEntry {
    pub fn path(&self, directory: &Path) -> PathBuf {
        directory.join(&self.file)
    }
}

/// Persistent list of dictionaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub next_id: u64,
    pub dictionaries: Vec<CatalogEntry>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self { next_id: 1, dictionaries: Vec::new() }
    }
}

impl Catalog {
    /// Loads the catalog of `directory`; a fresh environment has an empty one.
    pub fn load(directory: &Path) -> StorageResult<Self> {
        let bytes = match fs::read(directory.join(CATALOG_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Corruption(format!("unreadable catalog: {e}")))
    }

    pub fn store(&self, directory: &Path) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| StorageError::Corruption(format!("cannot encode catalog: {e}")))?;
        write_file_atomic(&directory.join(CATALOG_FILE), &bytes)
    }

    pub fn find(&self, name: &str) -> Option<&CatalogEntry> {
        self.dictionaries.iter().find(|d| d.name == name)
    }

    pub fn get(&self, id: DictionaryId) -> Option<&CatalogEntry> {
        self.dictionaries.iter().find(|d| d.id == id)
    }

    /// Reserves an id and the file name for a new dictionary called `name`.
    pub fn allocate(&mut self, name: &str) -> (DictionaryId, String) {
        let id = DictionaryId(self.next_id);
        self.next_id += 1;
        let stem: String = name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect();
        (id, format!("{}-{}.{}", stem, id.0, DICTIONARY_SUFFIX))
    }

    pub fn insert(&mut self, entry: CatalogEntry) -> StorageResult<()> {
        if self.find(&entry.name).is_some() {
            return Err(StorageError::AlreadyExists(format!("dictionary {}", entry.name)));
        }
        self.dictionaries.push(entry);
        Ok(())
    }

    /// Replaces the entry with the same id.
    pub fn update(&mut self, entry: CatalogEntry) -> StorageResult<()> {
        let slot = self
            .dictionaries
            .iter_mut()
            .find(|d| d.id == entry.id)
            .ok_or_else(|| StorageError::NotFound(format!("dictionary {}", entry.id)))?;
        *slot = entry;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.dictionaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dictionaries.is_empty()
    }
}
