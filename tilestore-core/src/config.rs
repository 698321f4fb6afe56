// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Configuration for the trace store
//!
//! Every field has a default, so a TOML file only needs to name what it
//! overrides:
//!
//! ```toml
//! tile_size = 50
//! shards = 8
//! cache_ops = false
//! ```

use crate::error::{Result, TileStoreError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default commits per tile
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Default shard count for trace and digest-map rows
pub const DEFAULT_SHARDS: u32 = 32;

/// Extra digest ids reserved per counter round-trip
pub const DEFAULT_RESERVED_IDS: u64 = 256;

/// Rows per bulk write. A batch should stay near 2MB and each row is ~200
/// bytes, so 2MB / 200B = 10000.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceStoreConfig {
    /// Commits per tile. Must never change for an existing table.
    pub tile_size: u32,
    pub shards: u32,
    /// Cache OrderedParamSets between calls
    pub cache_ops: bool,
    pub ops_cache_capacity: u64,
    pub reserved_ids: u64,
    pub max_batch_size: usize,
    pub write_timeout_ms: u64,
    pub max_conflict_retries: u32,
    pub conflict_backoff_ms: u64,
}

impl Default for TraceStoreConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            shards: DEFAULT_SHARDS,
            cache_ops: true,
            ops_cache_capacity: 1024,
            reserved_ids: DEFAULT_RESERVED_IDS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            write_timeout_ms: 10_000,
            max_conflict_retries: 32,
            conflict_backoff_ms: 5,
        }
    }
}

impl TraceStoreConfig {
    /// Small tiles and few shards, for tests and local replay
    pub fn for_testing(tile_size: u32) -> Self {
        Self {
            tile_size,
            shards: 4,
            reserved_ids: 4,
            conflict_backoff_ms: 1,
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| TileStoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|e| {
            TileStoreError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(TileStoreError::InvalidConfig("tile_size must be >= 1".into()));
        }
        if self.shards == 0 || self.shards > 9999 {
            return Err(TileStoreError::InvalidConfig(
                "shards must be in [1, 9999]".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(TileStoreError::InvalidConfig(
                "max_batch_size must be >= 1".into(),
            ));
        }
        if self.max_conflict_retries == 0 {
            return Err(TileStoreError::InvalidConfig(
                "max_conflict_retries must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_millis(self.conflict_backoff_ms)
    }
}
