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

//! Global digest map
//!
//! Digests are registered once and referred to by a small integer id in
//! every trace cell. The map is stored in digest-map rows bucketed by the
//! first characters of the digest and spread over all shards; it is read
//! back with one prefix scan per shard.
//!
//! Ids come from a single store counter. Each counter round-trip reserves a
//! few extra ids which are kept in a process-local [`IdPool`]; ids lost to a
//! registration race go back into the pool.

use crate::retry::{Attempt, ConflictRetry};
use crate::rows::{
    digest_row_and_column, extract_subkey, shard_prefix, DIGEST_MAP_FAMILY, ID_COUNTER_COLUMN,
    ID_COUNTER_FAMILY, ID_COUNTER_ROW, TYPE_DIGEST_MAP,
};
use crate::stats::StoreStatsAtomic;
use crate::store::{Mutation, Predicate, ReadFilter, WideColumnStore};
use crate::tasks::{fan_out, with_timeout};
use crate::tiling::TileKey;
use futures::TryStreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tilestore_core::{Digest, DigestId, DigestMap, DigestSet, Result, TileStoreError};
use tracing::{debug, warn};

/// Process-local pool of reserved but unassigned digest ids
#[derive(Debug, Default)]
pub struct IdPool {
    ids: Mutex<Vec<DigestId>>,
}

impl IdPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take up to `n` ids
    pub fn take(&self, n: usize) -> Vec<DigestId> {
        let mut ids = self.ids.lock();
        let n = n.min(ids.len());
        ids.drain(..n).collect()
    }

    pub fn put_back(&self, unused: impl IntoIterator<Item = DigestId>) {
        self.ids.lock().extend(unused);
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct DigestMapManager {
    store: Arc<dyn WideColumnStore>,
    pool: Arc<IdPool>,
    shards: u32,
    reserved_ids: u64,
    write_timeout: Duration,
    retry: ConflictRetry,
    stats: Arc<StoreStatsAtomic>,
}

impl DigestMapManager {
    pub fn new(
        store: Arc<dyn WideColumnStore>,
        pool: Arc<IdPool>,
        shards: u32,
        reserved_ids: u64,
        write_timeout: Duration,
        retry: ConflictRetry,
        stats: Arc<StoreStatsAtomic>,
    ) -> Self {
        Self {
            store,
            pool,
            shards,
            reserved_ids,
            write_timeout,
            retry,
            stats,
        }
    }

    /// Read the whole map, one concurrent prefix scan per shard
    pub async fn load(&self) -> Result<DigestMap> {
        let scans = (0..self.shards).map(|shard| {
            let prefix = shard_prefix(shard, TYPE_DIGEST_MAP, TileKey::DIGEST_MAP);
            let mut rows = self.store.read_rows(&prefix, ReadFilter::LatestOnly);
            async move {
                let mut found: HashMap<Digest, DigestId> = HashMap::new();
                while let Some(row) = rows.try_next().await? {
                    let digest_prefix = extract_subkey(&row.key)?;
                    for cell in row.family(DIGEST_MAP_FAMILY) {
                        let id = std::str::from_utf8(&cell.value)
                            .ok()
                            .and_then(|s| s.parse::<u64>().ok())
                            .ok_or_else(|| {
                                TileStoreError::Corruption(format!(
                                    "digest map cell {}:{} is not an integer",
                                    row.key, cell.column
                                ))
                            })?;
                        found.insert(format!("{}{}", digest_prefix, cell.column), DigestId(id));
                    }
                }
                Ok::<_, TileStoreError>(found)
            }
        });
        let shard_maps = fan_out(scans.collect::<Vec<_>>()).await?;

        let total = shard_maps.iter().map(HashMap::len).sum();
        let mut map = DigestMap::with_capacity(total);
        for found in &shard_maps {
            map.add(found)?;
        }
        self.stats
            .digest_map_size
            .store(map.len() as u64, Ordering::Relaxed);
        Ok(map)
    }

    /// `n` ids unique across all processes: pool first, then the counter.
    pub async fn get_ids(&self, n: usize) -> Result<Vec<DigestId>> {
        let mut ids = self.pool.take(n);
        while ids.len() < n {
            let missing = (n - ids.len()) as u64;
            let to_request = missing + self.reserved_ids;
            StoreStatsAtomic::incr(&self.stats.id_counter_requests);
            let max = with_timeout(
                "increment id counter",
                self.write_timeout,
                self.store.increment_counter(
                    ID_COUNTER_ROW,
                    ID_COUNTER_FAMILY,
                    ID_COUNTER_COLUMN,
                    to_request,
                ),
            )
            .await?;

            // Id 0 is the missing digest.
            let first = max.saturating_sub(to_request).max(1);
            let mut surplus = Vec::new();
            for id in first..max {
                if ids.len() < n {
                    ids.push(DigestId(id));
                } else {
                    surplus.push(DigestId(id));
                }
            }
            self.pool.put_back(surplus);
        }
        Ok(ids)
    }

    pub fn return_ids(&self, unused: Vec<DigestId>) {
        self.pool.put_back(unused);
    }

    /// The current map, after registering every digest in `digests` that
    /// has no id yet.
    pub async fn ensure(&self, digests: &DigestSet) -> Result<DigestMap> {
        self.retry
            .run("digest registration", |_| self.register_attempt(digests))
            .await
    }

    async fn register_attempt(&self, digests: &DigestSet) -> Result<Attempt<DigestMap>> {
        let mut map = self.load().await?;
        let delta = map.delta(digests);
        if delta.is_empty() {
            return Ok(Attempt::Committed(map));
        }

        let targets = delta
            .into_iter()
            .map(|d| digest_row_and_column(self.shards, &d).map(|(row, col)| (d, row, col)))
            .collect::<Result<Vec<_>>>()?;

        let ids = self.get_ids(targets.len()).await?;
        let now = chrono::Utc::now().timestamp_millis();
        let mut assigned = HashMap::with_capacity(targets.len());
        let mut unused = Vec::new();

        let mut pending = targets.into_iter().zip(ids);
        while let Some(((digest, row, column), id)) = pending.next() {
            let mut add = Mutation::new();
            add.set(DIGEST_MAP_FAMILY, &column, now, id.0.to_string());
            let predicate = Predicate::ColumnExists {
                family: DIGEST_MAP_FAMILY.to_string(),
                column,
            };
            let already_had_id = with_timeout(
                "register digest",
                self.write_timeout,
                self.store.apply_conditional(&row, predicate, None, Some(add)),
            )
            .await;
            match already_had_id {
                Ok(true) => unused.push(id),
                Ok(false) => {
                    assigned.insert(digest, id);
                }
                Err(e) => {
                    // Registered ids stay registered; the rest go back.
                    unused.push(id);
                    unused.extend(pending.map(|(_, id)| id));
                    self.return_ids(unused);
                    return Err(e);
                }
            }
        }

        StoreStatsAtomic::add(&self.stats.digests_registered, assigned.len() as u64);
        if unused.is_empty() {
            map.add(&assigned)?;
            debug!(registered = assigned.len(), "registered new digests");
            return Ok(Attempt::Committed(map));
        }

        // Someone else registered some of these first; start over from a
        // fresh map.
        warn!(
            collisions = unused.len(),
            registered = assigned.len(),
            "digest registration collided with another writer"
        );
        StoreStatsAtomic::add(&self.stats.digest_collisions, unused.len() as u64);
        self.return_ids(unused);
        Ok(Attempt::Conflict)
    }
}
