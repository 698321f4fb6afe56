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

//! Sharded trace store
//!
//! Ties the windowing, row naming, digest map and OPS managers together
//! behind the [`TraceStore`] trait. The write path lives in `write.rs`, the
//! read path in `read.rs`.

use crate::commits::CommitHistory;
use crate::digest_map::{DigestMapManager, IdPool};
use crate::ops::{OpsCache, OpsManager};
use crate::retry::ConflictRetry;
use crate::stats::{StoreStats, StoreStatsAtomic};
use crate::store::WideColumnStore;
use crate::tiling::TileWindow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tilestore_core::{Commit, Entry, Result, Tile, TraceStoreConfig};
use tokio::time::Instant;
use tracing::info;

#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Record `entries` for one commit. Idempotent per (trace, commit, ts).
    async fn put(&self, commit_hash: &str, entries: &[Entry], ts: DateTime<Utc>) -> Result<()>;

    /// The last `n_commits` commits of history. Returns the tile and its
    /// commits.
    async fn get_tile(&self, n_commits: usize, deadline: Instant) -> Result<(Tile, Vec<Commit>)>;

    /// The last `n_commits` commits that have any data. Returns the tile
    /// and every commit from the oldest dense commit to head.
    async fn get_dense_tile(
        &self,
        n_commits: usize,
        deadline: Instant,
    ) -> Result<(Tile, Vec<Commit>)>;
}

pub struct ShardedTraceStore {
    pub(crate) config: TraceStoreConfig,
    pub(crate) window: TileWindow,
    pub(crate) store: Arc<dyn WideColumnStore>,
    pub(crate) history: Arc<dyn CommitHistory>,
    pub(crate) digests: DigestMapManager,
    pub(crate) ops: Arc<OpsManager>,
    pub(crate) stats: Arc<StoreStatsAtomic>,
}

impl ShardedTraceStore {
    /// Store with fresh process-local caches
    pub fn new(
        config: TraceStoreConfig,
        store: Arc<dyn WideColumnStore>,
        history: Arc<dyn CommitHistory>,
    ) -> Result<Self> {
        let ops_cache = config
            .cache_ops
            .then(|| Arc::new(OpsCache::new(config.ops_cache_capacity)));
        Self::with_caches(config, store, history, Arc::new(IdPool::new()), ops_cache)
    }

    /// Store sharing the given id pool and OPS cache
    pub fn with_caches(
        config: TraceStoreConfig,
        store: Arc<dyn WideColumnStore>,
        history: Arc<dyn CommitHistory>,
        id_pool: Arc<IdPool>,
        ops_cache: Option<Arc<OpsCache>>,
    ) -> Result<Self> {
        config.validate()?;
        let window = TileWindow::new(config.tile_size)?;
        let stats = Arc::new(StoreStatsAtomic::new());
        let retry = ConflictRetry::from_config(&config);

        let digests = DigestMapManager::new(
            store.clone(),
            id_pool,
            config.shards,
            config.reserved_ids,
            config.write_timeout(),
            retry.clone(),
            stats.clone(),
        );
        let ops = Arc::new(OpsManager::new(
            store.clone(),
            ops_cache,
            config.write_timeout(),
            retry,
            stats.clone(),
        ));

        info!(
            tile_size = config.tile_size,
            shards = config.shards,
            cache_ops = config.cache_ops,
            "trace store opened"
        );
        Ok(Self {
            window,
            config,
            store,
            history,
            digests,
            ops,
            stats,
        })
    }

    pub fn config(&self) -> &TraceStoreConfig {
        &self.config
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.snapshot()
    }
}

#[async_trait]
impl TraceStore for ShardedTraceStore {
    async fn put(&self, commit_hash: &str, entries: &[Entry], ts: DateTime<Utc>) -> Result<()> {
        self.put_entries(commit_hash, entries, ts).await
    }

    async fn get_tile(&self, n_commits: usize, deadline: Instant) -> Result<(Tile, Vec<Commit>)> {
        self.read_tile(n_commits, deadline).await
    }

    async fn get_dense_tile(
        &self,
        n_commits: usize,
        deadline: Instant,
    ) -> Result<(Tile, Vec<Commit>)> {
        self.read_dense_tile(n_commits, deadline).await
    }
}
