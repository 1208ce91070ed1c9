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

// Environment configuration
// Options recognised when an environment is opened. The structure is plain data so a host can load it from any serde format.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::version::LayoutVersion;

/// Smallest node block accepted by the engine
pub const MIN_NODE_SIZE: usize = 4 * 1024;
/// Largest node block accepted by the engine
pub const MAX_NODE_SIZE: usize = 16 * 1024 * 1024;
/// The cache always holds at least this many nodes
pub const MIN_CACHED_NODES: usize = 16;

/// How commit records reach stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DurabilityMode {
    /// The log is fsynced before every commit returns
    #[default]
    Sync,
    /// Commits are written to the OS immediately and fsynced at checkpoint or close
    Lazy,
}

/// Configuration errors detected before an environment is opened
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("node size {0} must be a power of two between {min} and {max}", min = MIN_NODE_SIZE, max = MAX_NODE_SIZE)]
    NodeSize(usize),

    #[error("redzone must be a percentage, got {0}")]
    Redzone(u8),

    #[error("max_dictionaries must be at least 1")]
    NoDictionaries,

    #[error("log segment size {0} is too small")]
    LogSegmentSize(u64),

    #[error("upgrade source {hint} is newer than the target layout {target}")]
    UpgradeSource { hint: LayoutVersion, target: LayoutVersion },

    #[error("environment directory must not be empty")]
    EmptyDirectory,
}

/// Environment configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Storage directory holding the log, catalog and dictionary files
    pub env_dir: PathBuf,
    /// Bytes of resident node memory
    pub cache_size: usize,
    /// Size of one on-disk node block in bytes; an existing environment keeps the size of its files
    pub node_size: usize,
    /// Seconds between fuzzy checkpoints; 0 disables the background coordinator
    pub checkpoint_period: u64,
    /// Percent of free volume space below which a warning is raised; 0 disables the check
    pub redzone: u8,
    /// Commit durability policy
    pub durability: DurabilityMode,
    /// Upper bound on dictionaries in the catalog
    pub max_dictionaries: usize,
    /// Lock wait limit in milliseconds; 0 waits until granted or chosen as a deadlock victim
    pub lock_timeout_ms: u64,
    /// Log segment rotation threshold in bytes
    pub log_segment_size: u64,
    /// Attempts for transient I/O failures before they are surfaced
    pub io_retry_limit: u32,
    /// Layout this environment writes nodes in and upgrades older nodes to
    pub node_layout: LayoutVersion,
    /// Layout existing files are expected to come from
    pub upgrade_source_version: Option<LayoutVersion>,
    /// Open an existing environment without writing to it
    pub read_only: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            env_dir: PathBuf::from("./ftdb-env"),
            cache_size: 64 * 1024 * 1024, // 64 MB
            node_size: 64 * 1024,
            checkpoint_period: 60,
            redzone: 5,
            durability: DurabilityMode::Sync,
            max_dictionaries: 1024,
            lock_timeout_ms: 0,
            log_segment_size: 64 * 1024 * 1024,
            io_retry_limit: 3,
            node_layout: LayoutVersion::CURRENT,
            upgrade_source_version: None,
            read_only: false,
        }
    }
}

impl EnvConfig {
    pub fn new(env_dir: impl Into<PathBuf>) -> Self {
        Self { env_dir: env_dir.into(), ..Self::default() }
    }

    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn with_node_size(mut self, bytes: usize) -> Self {
        self.node_size = bytes;
        self
    }

    pub fn with_checkpoint_period(mut self, seconds: u64) -> Self {
        self.checkpoint_period = seconds;
        self
    }

    pub fn with_redzone(mut self, percent: u8) -> Self {
        self.redzone = percent;
        self
    }

    pub fn with_durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_node_layout(mut self, layout: LayoutVersion) -> Self {
        self.node_layout = layout;
        self
    }

    pub fn with_upgrade_source(mut self, source: LayoutVersion) -> Self {
        self.upgrade_source_version = Some(source);
        self
    }

    pub fn with_lock_timeout_ms(mut self, millis: u64) -> Self {
        self.lock_timeout_ms = millis;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Number of nodes the cache may hold.
    pub fn cache_capacity(&self) -> usize {
        (self.cache_size / self.node_size.max(1)).max(MIN_CACHED_NODES)
    }

    /// Checks option ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.env_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDirectory);
        }
        if !self.node_size.is_power_of_two() || self.node_size < MIN_NODE_SIZE || self.node_size > MAX_NODE_SIZE {
            return Err(ConfigError::NodeSize(self.node_size));
        }
        if self.redzone > 100 {
            return Err(ConfigError::Redzone(self.redzone));
        }
        if self.max_dictionaries == 0 {
            return Err(ConfigError::NoDictionaries);
        }
        if self.log_segment_size < 64 * 1024 {
            return Err(ConfigError::LogSegmentSize(self.log_segment_size));
        }
        if let Some(source) = self.upgrade_source_version {
            if source > self.node_layout {
                return Err(ConfigError::UpgradeSource { hint: source, target: self.node_layout });
            }
        }
        if self.cache_size / self.node_size < MIN_CACHED_NODES {
            warn!(cache_size = self.cache_size, node_size = self.node_size, "cache holds fewer than {} nodes, using the minimum", MIN_CACHED_NODES);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EnvConfig::new("/tmp/env");
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_capacity(), 1024);
        assert_eq!(config.with_durability(DurabilityMode::Lazy).durability, DurabilityMode::Lazy);
    }

    #[test]
    fn test_rejects_bad_node_size() {
        let config = EnvConfig::new("/tmp/env").with_node_size(5000);
        assert!(matches!(config.validate(), Err(ConfigError::NodeSize(5000))));
    }

    #[test]
    fn test_rejects_upgrade_source_newer_than_target() {
        let config = EnvConfig::new("/tmp/env").with_node_layout(LayoutVersion::V5).with_upgrade_source(LayoutVersion::V6);
        assert!(matches!(config.validate(), Err(ConfigError::UpgradeSource { .. })));
    }

    #[test]
    fn test_small_cache_uses_minimum() {
        let config = EnvConfig::new("/tmp/env").with_cache_size(512 * 1024).with_node_size(64 * 1024);
        assert_eq!(config.cache_capacity(), MIN_CACHED_NODES);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: EnvConfig = serde_json::from_str(r#"{"env_dir":"/data","checkpoint_period":5,"durability":"Lazy"}"#).unwrap();
        assert_eq!(config.checkpoint_period, 5);
        assert_eq!(config.durability, DurabilityMode::Lazy);
        assert_eq!(config.node_size, 64 * 1024);
        assert!(!config.read_only);
    }
}
