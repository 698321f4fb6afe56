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

//! Per-tile Ordered Param Set management
//!
//! Each tile has one OPS row holding the serialized schema and its content
//! hash. Writers grow the schema with a compare-and-swap on the hash column,
//! so concurrent writers adding different params to the same tile never lose
//! each other's updates:
//!
//! ```text
//! read (cache or store) -> delta empty? done
//!                       -> copy + update -> CAS on H
//!                            matched: write cache, done
//!                            lost:    drop cache entry, retry
//! ```
//!
//! A tile without an OPS row is created with a create-if-absent write guarded
//! on the hash column.

use crate::retry::{Attempt, ConflictRetry};
use crate::rows::{ops_row_name, OPS_FAMILY, OPS_HASH_COLUMN, OPS_SCHEMA_COLUMN};
use crate::stats::StoreStatsAtomic;
use crate::store::{Mutation, Predicate, ReadFilter, Row, WideColumnStore};
use crate::tasks::with_timeout;
use crate::tiling::TileKey;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tilestore_core::{hash_encoded, OrderedParamSet, ParamSet, Result, TileStoreError};
use tracing::{debug, warn};

/// Old OPS versions are kept this long after being superseded (ms)
const OPS_VERSION_GRACE_MS: i64 = 1_000;

/// An OPS together with the hash it was stored under
#[derive(Debug, Clone)]
pub struct OpsCacheEntry {
    pub ops: Arc<OrderedParamSet>,
    pub hash: String,
}

impl OpsCacheEntry {
    /// Entry for a tile that has no OPS row yet
    pub fn empty() -> Result<Self> {
        Self::from_ops(OrderedParamSet::new()).map(|(entry, _)| entry)
    }

    /// Entry plus the encoded bytes the hash was computed over
    pub fn from_ops(ops: OrderedParamSet) -> Result<(Self, Vec<u8>)> {
        let encoded = ops.encode()?;
        let hash = hash_encoded(&encoded);
        Ok((
            Self {
                ops: Arc::new(ops),
                hash,
            },
            encoded,
        ))
    }

    /// Decode a stored OPS row and check its hash
    pub fn from_row(row: &Row) -> Result<Self> {
        let schema = row.latest(OPS_FAMILY, OPS_SCHEMA_COLUMN).ok_or_else(|| {
            TileStoreError::Corruption(format!("OPS row {} has no schema", row.key))
        })?;
        let stored_hash = row.latest(OPS_FAMILY, OPS_HASH_COLUMN).ok_or_else(|| {
            TileStoreError::Corruption(format!("OPS row {} has no hash", row.key))
        })?;
        let hash = hash_encoded(&schema.value);
        if hash.as_bytes() != stored_hash.value.as_slice() {
            return Err(TileStoreError::Corruption(format!(
                "OPS row {} hash mismatch",
                row.key
            )));
        }
        Ok(Self {
            ops: Arc::new(OrderedParamSet::decode(&schema.value)?),
            hash,
        })
    }
}

/// Bounded process-local OPS cache. Never a source of truth.
pub struct OpsCache {
    cache: Cache<TileKey, OpsCacheEntry>,
}

impl OpsCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    pub fn get(&self, tile: TileKey) -> Option<OpsCacheEntry> {
        self.cache.get(&tile)
    }

    pub fn insert(&self, tile: TileKey, entry: OpsCacheEntry) {
        self.cache.insert(tile, entry);
    }

    pub fn invalidate(&self, tile: TileKey) {
        self.cache.invalidate(&tile);
    }
}

pub struct OpsManager {
    store: Arc<dyn WideColumnStore>,
    cache: Option<Arc<OpsCache>>,
    write_timeout: Duration,
    retry: ConflictRetry,
    stats: Arc<StoreStatsAtomic>,
}

impl OpsManager {
    pub fn new(
        store: Arc<dyn WideColumnStore>,
        cache: Option<Arc<OpsCache>>,
        write_timeout: Duration,
        retry: ConflictRetry,
        stats: Arc<StoreStatsAtomic>,
    ) -> Self {
        Self {
            store,
            cache,
            write_timeout,
            retry,
            stats,
        }
    }

    /// OPS of a tile and whether it exists in the store. A tile without a
    /// row gets an empty OPS.
    pub async fn get(&self, tile: TileKey) -> Result<(OpsCacheEntry, bool)> {
        if let Some(entry) = self.cache.as_ref().and_then(|c| c.get(tile)) {
            return Ok((entry, true));
        }
        let row = self
            .store
            .read_row(&ops_row_name(tile), ReadFilter::LatestOnly)
            .await?;
        match row {
            None => Ok((OpsCacheEntry::empty()?, false)),
            Some(row) => {
                let entry = OpsCacheEntry::from_row(&row)?;
                if let Some(cache) = &self.cache {
                    cache.insert(tile, entry.clone());
                }
                Ok((entry, true))
            }
        }
    }

    /// Like [`OpsManager::get`], but drops any cached entry and reads the
    /// store.
    pub async fn refresh(&self, tile: TileKey) -> Result<(OpsCacheEntry, bool)> {
        if let Some(cache) = &self.cache {
            cache.invalidate(tile);
        }
        self.get(tile).await
    }

    /// Grow the tile's OPS to cover `params` and return the stored result
    pub async fn update(&self, tile: TileKey, params: &ParamSet) -> Result<Arc<OrderedParamSet>> {
        self.retry
            .run("ops update", |_| self.update_attempt(tile, params))
            .await
    }

    async fn update_attempt(
        &self,
        tile: TileKey,
        params: &ParamSet,
    ) -> Result<Attempt<Arc<OrderedParamSet>>> {
        let (entry, exists) = self.get(tile).await?;
        if entry.ops.delta(params).is_empty() {
            return Ok(Attempt::Committed(entry.ops));
        }

        let mut ops = (*entry.ops).clone();
        ops.update(params);
        let (next, encoded) = OpsCacheEntry::from_ops(ops)?;

        let now = chrono::Utc::now().timestamp_millis();
        let mut write = Mutation::new();
        write
            .set(OPS_FAMILY, OPS_HASH_COLUMN, now, next.hash.as_bytes().to_vec())
            .set(OPS_FAMILY, OPS_SCHEMA_COLUMN, now, encoded);

        let row = ops_row_name(tile);
        let committed = if exists {
            let before = now - OPS_VERSION_GRACE_MS;
            write
                .delete_timestamp_range(OPS_FAMILY, OPS_HASH_COLUMN, 0, before)
                .delete_timestamp_range(OPS_FAMILY, OPS_SCHEMA_COLUMN, 0, before);
            let predicate = Predicate::LatestValueEquals {
                family: OPS_FAMILY.to_string(),
                column: OPS_HASH_COLUMN.to_string(),
                value: entry.hash.as_bytes().to_vec(),
            };
            with_timeout(
                "ops update",
                self.write_timeout,
                self.store.apply_conditional(&row, predicate, Some(write), None),
            )
            .await?
        } else {
            let predicate = Predicate::ColumnExists {
                family: OPS_FAMILY.to_string(),
                column: OPS_HASH_COLUMN.to_string(),
            };
            let someone_else_created = with_timeout(
                "ops create",
                self.write_timeout,
                self.store.apply_conditional(&row, predicate, None, Some(write)),
            )
            .await?;
            !someone_else_created
        };

        if !committed {
            warn!(tile = %tile, existed = exists, "OPS changed underneath us, clearing cache");
            StoreStatsAtomic::incr(&self.stats.ops_conflicts);
            if let Some(cache) = &self.cache {
                cache.invalidate(tile);
            }
            return Ok(Attempt::Conflict);
        }

        StoreStatsAtomic::incr(&self.stats.ops_updates);
        debug!(tile = %tile, keys = next.ops.key_order().len(), "OPS updated");
        if let Some(cache) = &self.cache {
            cache.insert(tile, next.clone());
        }
        Ok(Attempt::Committed(next.ops))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use tilestore_core::{Params, TraceStoreConfig};

    fn manager(store: Arc<InMemoryStore>, cache: bool) -> OpsManager {
        let config = TraceStoreConfig::for_testing(10);
        OpsManager::new(
            store,
            cache.then(|| Arc::new(OpsCache::new(16))),
            config.write_timeout(),
            ConflictRetry::from_config(&config),
            Arc::new(StoreStatsAtomic::new()),
        )
    }

    fn param_set(pairs: &[(&str, &str)]) -> ParamSet {
        let params: Params = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut ps = ParamSet::new();
        ps.add_params(&params);
        ps
    }

    #[tokio::test]
    async fn test_missing_tile_is_empty() {
        let m = manager(Arc::new(InMemoryStore::new()), true);
        let (entry, exists) = m.get(TileKey(u32::MAX)).await.unwrap();
        assert!(!exists);
        assert!(entry.ops.is_empty());
    }

    #[tokio::test]
    async fn test_create_then_grow() {
        let store = Arc::new(InMemoryStore::new());
        let m = manager(store.clone(), false);
        let tile = TileKey(u32::MAX);

        let ops = m.update(tile, &param_set(&[("os", "linux")])).await.unwrap();
        assert_eq!(ops.code_of("os", "linux"), Some((0, 0)));

        let ops = m
            .update(tile, &param_set(&[("os", "android"), ("test", "foo")]))
            .await
            .unwrap();
        assert_eq!(ops.code_of("os", "linux"), Some((0, 0)));
        assert_eq!(ops.code_of("os", "android"), Some((0, 1)));
        assert_eq!(ops.code_of("test", "foo"), Some((1, 0)));

        let (stored, exists) = m.get(tile).await.unwrap();
        assert!(exists);
        assert_eq!(*stored.ops, *ops);
        assert_eq!(m.stats.snapshot().ops_updates, 2);
    }

    #[tokio::test]
    async fn test_no_write_when_covered() {
        let store = Arc::new(InMemoryStore::new());
        let m = manager(store.clone(), true);
        let tile = TileKey(u32::MAX - 1);
        m.update(tile, &param_set(&[("os", "linux"), ("test", "a")])).await.unwrap();
        m.update(tile, &param_set(&[("os", "linux")])).await.unwrap();
        assert_eq!(m.stats.snapshot().ops_updates, 1);
    }

    #[tokio::test]
    async fn test_stale_cache_recovers() {
        let store = Arc::new(InMemoryStore::new());
        let a = manager(store.clone(), true);
        let b = manager(store.clone(), true);
        let tile = TileKey(u32::MAX);

        a.update(tile, &param_set(&[("os", "linux")])).await.unwrap();
        b.update(tile, &param_set(&[("gpu", "nv")])).await.unwrap();
        // a's cache still holds the one-key OPS
        let ops = a.update(tile, &param_set(&[("test", "t1")])).await.unwrap();
        assert!(ops.code_of("os", "linux").is_some());
        assert!(ops.code_of("gpu", "nv").is_some());
        assert!(ops.code_of("test", "t1").is_some());
        assert_eq!(a.stats.snapshot().ops_conflicts, 1);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cache() {
        let store = Arc::new(InMemoryStore::new());
        let a = manager(store.clone(), true);
        let b = manager(store.clone(), true);
        let tile = TileKey(u32::MAX);

        a.update(tile, &param_set(&[("os", "linux")])).await.unwrap();
        b.update(tile, &param_set(&[("os", "mac")])).await.unwrap();

        let (cached, _) = a.get(tile).await.unwrap();
        assert!(cached.ops.code_of("os", "mac").is_none());

        let (fresh, exists) = a.refresh(tile).await.unwrap();
        assert!(exists);
        assert!(fresh.ops.code_of("os", "mac").is_some());
        // the fresh entry replaces the stale one
        let (cached, _) = a.get(tile).await.unwrap();
        assert_eq!(cached.hash, fresh.hash);
    }

    #[tokio::test]
    async fn test_corrupt_hash_is_detected() {
        let store = Arc::new(InMemoryStore::new());
        let mut m = Mutation::new();
        let (entry, encoded) = OpsCacheEntry::from_ops(OrderedParamSet::new()).unwrap();
        assert!(!entry.hash.is_empty());
        m.set(OPS_FAMILY, OPS_HASH_COLUMN, 1, b"bogus".to_vec())
            .set(OPS_FAMILY, OPS_SCHEMA_COLUMN, 1, encoded);
        store
            .apply_bulk(vec![(ops_row_name(TileKey(u32::MAX)), m)])
            .await
            .unwrap();

        let mgr = manager(store, false);
        let err = mgr.get(TileKey(u32::MAX)).await.unwrap_err();
        assert!(err.is_corruption());
    }
}
